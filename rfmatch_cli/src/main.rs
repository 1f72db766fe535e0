use std::path::PathBuf;
use std::sync::OnceLock;

use clap::{ArgAction, Parser, Subcommand};
use eyre::WrapErr;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod line_reader;
mod runtime;

use runtime::run_controller;

static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

fn humanize(err: &eyre::Report) -> String {
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("invalid configuration") {
        return format!(
            "What happened: The configuration file is invalid ({msg}).\n\
             Likely causes: A missing section or an out-of-range value in the TOML.\n\
             How to fix: Edit the config file and rerun. See etc/rfmatch.toml for a sample."
        );
    }
    if lower.contains("read config") {
        return format!(
            "What happened: The configuration file could not be read.\n\
             Likely causes: Wrong --config path or missing file.\n\
             How to fix: Pass --config with the correct path. Original: {msg}"
        );
    }
    if lower.contains("i2c") || lower.contains("nak") {
        return format!(
            "What happened: The motion companion did not answer on I2C.\n\
             Likely causes: Wrong bus number or board address, or the companion is unpowered.\n\
             How to fix: Check [bus] in the config and the companion's power. Original: {msg}"
        );
    }
    if lower.contains("calibration csv") {
        return format!(
            "What happened: The fit-coefficients CSV was rejected.\n\
             Likely causes: Wrong headers (expected motor,a0,a1,a2,a3) or a missing motor row.\n\
             How to fix: Re-export the file from the calibration rig. Original: {msg}"
        );
    }

    let mut cause = String::new();
    if let Some(src) = err.chain().nth(1) {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\n\
         How to fix: Re-run with --log-level=debug or set RUST_LOG for detail. Original: {msg}"
    )
}

/// Build a file sink writer with optional rotation, keeping the
/// non-blocking guard alive for the process lifetime.
fn file_layer(
    file: Option<&str>,
    rotation: Option<&str>,
) -> Option<tracing_appender::non_blocking::NonBlocking> {
    let path = file?;
    let p = std::path::Path::new(path);
    if let Some(parent) = p.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let appender = match rotation.unwrap_or("never").to_ascii_lowercase().as_str() {
        "daily" => tracing_appender::rolling::daily(".", path),
        "hourly" => tracing_appender::rolling::hourly(".", path),
        _ => tracing_appender::rolling::never(".", path),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    Some(writer)
}

fn init_tracing(json: bool, level: &str, file: Option<&str>, rotation: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    // Frames go to stdout; logs stay on stderr so the host parser never
    // sees them interleaved.
    if json {
        let console = fmt::layer()
            .json()
            .with_target(false)
            .with_writer(std::io::stderr);
        if let Some(writer) = file_layer(file, rotation) {
            let file_l = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            registry.with(console).with(file_l).init();
        } else {
            registry.with(console).init();
        }
    } else {
        let console = fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr);
        if let Some(writer) = file_layer(file, rotation) {
            let file_l = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            registry.with(console).with(file_l).init();
        } else {
            registry.with(console).init();
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "rfmatch", version, about = "RF matching network controller")]
struct Cli {
    /// Path to the controller config TOML
    #[arg(long, value_name = "FILE", default_value = "etc/rfmatch.toml")]
    config: PathBuf,

    /// Optional fit-coefficients CSV to apply and persist at boot
    #[arg(long, value_name = "FILE")]
    fit_coeffs: Option<PathBuf>,

    /// Log as JSON lines instead of compact text
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,

    /// Log level: trace,debug,info,warn,error
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller loop (shell + streams + auto-match)
    Run {
        /// Home both motors against their saved index positions first
        #[arg(long, action = ArgAction::SetTrue)]
        home: bool,
    },
    /// Probe sensors, motors and the motion bus, then exit
    SelfCheck,
}

fn main() -> eyre::Result<()> {
    if let Err(e) = real_main() {
        eprintln!("{}", humanize(&e));
        std::process::exit(2);
    }
    Ok(())
}

fn real_main() -> eyre::Result<()> {
    let cli = Cli::parse();

    let cfg_text = std::fs::read_to_string(&cli.config)
        .wrap_err_with(|| format!("read config {:?}", cli.config))?;
    let cfg = rfmatch_config::load_toml(&cfg_text)
        .wrap_err_with(|| format!("parse config {:?}", cli.config))?;
    cfg.validate().wrap_err("invalid configuration")?;

    init_tracing(
        cli.json,
        &cli.log_level,
        cfg.logging.file.as_deref(),
        cfg.logging.rotation.as_deref(),
    );

    let fit_coeffs = match &cli.fit_coeffs {
        Some(p) => Some(rfmatch_config::load_fit_coeffs_csv(p).wrap_err("calibration csv")?),
        None => None,
    };

    match cli.cmd {
        Commands::SelfCheck => runtime::self_check(&cfg),
        Commands::Run { home } => run_controller(&cfg, home || cfg.pacing.home_on_boot, fit_coeffs),
    }
}

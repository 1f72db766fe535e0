//! Controller runtime: hardware construction, the cooperative main loop
//! and the self-check probe.
//!
//! Loop order per iteration: poll the mode pin, dispatch at most one
//! completed command line, tick streams and the auto-match loop, sleep
//! one period. Protocol frames go to stdout with CRLF termination; logs
//! go to stderr.

use crate::line_reader::LineReader;
use eyre::eyre;
use rfmatch_config::Config;
use rfmatch_core::board::MotionBoard;
use rfmatch_core::motor::MotorController;
use rfmatch_core::sensor::RfSensor;
use rfmatch_core::shell::{Shell, ShellOutcome};
use rfmatch_traits::{Clock, FrameSink, MotionBus, MotorFabric, SensorFabric};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Frame sink on stdout; every line is CRLF-terminated on the wire.
pub struct StdoutSink {
    out: std::io::Stdout,
}

impl StdoutSink {
    fn new() -> Self {
        Self {
            out: std::io::stdout(),
        }
    }
}

impl FrameSink for StdoutSink {
    fn send_line(&mut self, line: &str) {
        let _ = write!(self.out, "{line}\r\n");
        let _ = self.out.flush();
    }
}

fn drive<S, B, F>(
    mut shell: Shell<S, B, F, StdoutSink>,
    clock: Arc<dyn Clock + Send + Sync>,
    mode_pin: Box<dyn Fn() -> bool>,
    on_leave: Box<dyn Fn()>,
    home: bool,
    fit_coeffs: Option<[[f32; 4]; 2]>,
    period: Duration,
) -> eyre::Result<()>
where
    S: SensorFabric,
    B: MotionBus,
    F: MotorFabric,
{
    shell.load_persisted_state();

    if let Some(coeffs) = fit_coeffs {
        shell.board.info.motor_fit_coeffs = coeffs;
        match shell.board.save_fit_coeffs() {
            Ok(()) => tracing::info!("fit coefficients imported and persisted"),
            Err(e) => tracing::warn!(error = %e, "fit coefficients imported but not persisted"),
        }
    }

    if home {
        for motor in 0..2 {
            if !shell.board.init_by_index(motor) {
                tracing::warn!(motor, "boot homing failed; absolute positions are unreferenced");
            }
        }
    }

    let reader = LineReader::spawn(std::io::stdin());
    let banner = |shell: &mut Shell<S, B, F, StdoutSink>| {
        shell.sink.send_line("Debug Mode - Command Console");
        shell.sink.send_line("Type 'dh' for available commands");
    };

    let mut interactive = mode_pin();
    if interactive {
        banner(&mut shell);
    }

    loop {
        let pin = mode_pin();
        if pin != interactive {
            if pin {
                banner(&mut shell);
            } else {
                tracing::info!("mode pin low: leaving interactive mode");
                shell.leave_interactive();
            }
            interactive = pin;
        }

        if interactive {
            if let Some(line) = reader.poll()
                && shell.handle_line(&line) == ShellOutcome::LeaveShell
            {
                on_leave();
            }
            shell.tick();
        }

        clock.sleep(period);
    }
}

#[cfg(not(feature = "hardware"))]
mod backend {
    use super::*;
    use rfmatch_hardware::{SimMotionBus, SimMotor, SimSensor};
    use rfmatch_traits::ManualClock;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    /// Wall-clock pacing over the simulated timeline: sleeps really
    /// sleep, and the sim motors see exactly that much elapsed time.
    #[derive(Clone)]
    struct PacedSimClock {
        inner: ManualClock,
    }

    impl Clock for PacedSimClock {
        fn now(&self) -> Instant {
            self.inner.now()
        }
        fn sleep(&self, d: Duration) {
            if d.is_zero() {
                return;
            }
            std::thread::sleep(d);
            self.inner.advance(d);
        }
    }

    pub fn run(cfg: &Config, home: bool, fit_coeffs: Option<[[f32; 4]; 2]>) -> eyre::Result<()> {
        tracing::info!("sim backend: no hardware feature enabled");
        let manual = ManualClock::new();
        let clock: Arc<dyn Clock + Send + Sync> = Arc::new(PacedSimClock {
            inner: manual.clone(),
        });

        let input = SimSensor::new();
        input.set_load(50.0, 0.0);
        let output = SimSensor::new();
        output.set_load(50.0, 0.0);

        let board = MotionBoard::new(
            SimMotionBus::new(),
            MotorController::new(SimMotor::new(manual.clone(), 32_000), 0, clock.clone()),
            MotorController::new(SimMotor::new(manual.clone(), 32_000), 1, clock.clone()),
            clock.clone(),
        );
        let shell = Shell::new(
            RfSensor::new(input),
            RfSensor::new(output),
            board,
            StdoutSink::new(),
            clock.clone(),
        );

        // Sim mode pin: high until `da` drops it.
        let pin = Arc::new(AtomicBool::new(true));
        let pin_read = pin.clone();
        drive(
            shell,
            clock,
            Box::new(move || pin_read.load(Ordering::Relaxed)),
            Box::new(move || pin.store(false, Ordering::Relaxed)),
            home,
            fit_coeffs,
            Duration::from_millis(cfg.pacing.loop_period_ms),
        )
    }

    pub fn self_check(_cfg: &Config) -> eyre::Result<()> {
        let manual = ManualClock::new();
        let clock: Arc<dyn Clock + Send + Sync> = Arc::new(manual.clone());
        let sensor_fabric = SimSensor::new();
        sensor_fabric.set_load(50.0, 0.0);
        let mut sensor = RfSensor::new(sensor_fabric);
        let sample = sensor.sample(Some(16));
        if !sample.r.is_finite() {
            return Err(eyre!("sim sensor sample not finite"));
        }
        let mut motor = MotorController::new(SimMotor::new(manual, 32_000), 0, clock);
        let _ = motor.position();
        println!("OK");
        Ok(())
    }
}

#[cfg(feature = "hardware")]
mod backend {
    use super::*;
    use eyre::WrapErr;
    use rfmatch_hardware::{I2cMotionBus, MmioModePin, MmioMotor, MmioSensor};
    use rfmatch_traits::MonotonicClock;

    fn sensor_fabric(a: &rfmatch_config::SensorAddresses) -> MmioSensor {
        unsafe {
            MmioSensor::new(
                a.v_re as usize,
                a.v_im as usize,
                a.i_re as usize,
                a.i_im as usize,
                a.gate as usize,
                a.mode as usize,
                a.relay as usize,
                a.spi as usize,
            )
        }
    }

    fn motor_fabric(a: &rfmatch_config::MotorAddresses) -> eyre::Result<MmioMotor> {
        unsafe { MmioMotor::new(a.out as usize, a.r#in as usize, a.ext as usize) }
            .map_err(|e| eyre!("motor fabric init: {e}"))
    }

    pub fn run(cfg: &Config, home: bool, fit_coeffs: Option<[[f32; 4]; 2]>) -> eyre::Result<()> {
        let clock: Arc<dyn Clock + Send + Sync> = Arc::new(MonotonicClock::new());

        let mut input = RfSensor::new(sensor_fabric(&cfg.addresses.input_sensor));
        let mut output = RfSensor::new(sensor_fabric(&cfg.addresses.output_sensor));
        input.init_frontend().map_err(|e| eyre!("input frontend: {e}"))?;
        output
            .init_frontend()
            .map_err(|e| eyre!("output frontend: {e}"))?;

        let bus = I2cMotionBus::try_new(cfg.bus.i2c_bus, cfg.bus.board_address)
            .wrap_err("open motion bus")?;
        let board = MotionBoard::new(
            bus,
            MotorController::new(motor_fabric(&cfg.addresses.motor0)?, 0, clock.clone()),
            MotorController::new(motor_fabric(&cfg.addresses.motor1)?, 1, clock.clone()),
            clock.clone(),
        );
        let shell = Shell::new(input, output, board, StdoutSink::new(), clock.clone());

        let pin = unsafe { MmioModePin::new(cfg.addresses.mode_pin as usize) };
        drive(
            shell,
            clock,
            Box::new(move || pin.is_interactive()),
            // The fabric loops the request back into the mode input.
            Box::new(|| ()),
            home,
            fit_coeffs,
            Duration::from_millis(cfg.pacing.loop_period_ms),
        )
    }

    pub fn self_check(cfg: &Config) -> eyre::Result<()> {
        let mut bus = I2cMotionBus::try_new(cfg.bus.i2c_bus, cfg.bus.board_address)
            .wrap_err("open motion bus")?;
        for spi in [1u8, 2] {
            bus.read_status(spi)
                .map_err(|e| eyre!("driver {spi} status: {e}"))?;
        }
        let mut input = RfSensor::new(sensor_fabric(&cfg.addresses.input_sensor));
        let sample = input.sample(Some(16));
        if !sample.r.is_finite() {
            return Err(eyre!("input sensor sample not finite"));
        }
        println!("OK");
        Ok(())
    }
}

pub fn run_controller(
    cfg: &Config,
    home: bool,
    fit_coeffs: Option<[[f32; 4]; 2]>,
) -> eyre::Result<()> {
    backend::run(cfg, home, fit_coeffs)
}

pub fn self_check(cfg: &Config) -> eyre::Result<()> {
    backend::self_check(cfg)
}

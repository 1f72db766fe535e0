//! Typed configuration for the controller binary.
//!
//! The TOML file carries what FRAM cannot: register base addresses, the
//! serial line, loop pacing and logging. Runtime state (calibration,
//! limits, thresholds) lives in FRAM and is not configured here.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("calibration csv: {0}")]
    Csv(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Register bases of one RF sensor's fabric slice.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SensorAddresses {
    pub v_re: u64,
    pub v_im: u64,
    pub i_re: u64,
    pub i_im: u64,
    pub gate: u64,
    pub mode: u64,
    pub relay: u64,
    pub spi: u64,
}

/// Register bases of one motor's fabric slice.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MotorAddresses {
    pub out: u64,
    pub r#in: u64,
    pub ext: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Addresses {
    pub input_sensor: SensorAddresses,
    pub output_sensor: SensorAddresses,
    pub motor0: MotorAddresses,
    pub motor1: MotorAddresses,
    /// Mode-select GPIO block (bit 0 of channel 1).
    pub mode_pin: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Bus {
    /// I2C bus number of the motion companion.
    pub i2c_bus: u8,
    /// Companion board address.
    pub board_address: u16,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Pacing {
    /// Cooperative loop period in milliseconds.
    pub loop_period_ms: u64,
    /// Home both motors against their saved index positions at boot.
    pub home_on_boot: bool,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            loop_period_ms: 10,
            home_on_boot: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    /// Path to a log file (JSON lines when --json).
    pub file: Option<String>,
    pub level: Option<String>,
    /// "never" | "daily" | "hourly"
    pub rotation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub addresses: Addresses,
    pub bus: Bus,
    #[serde(default)]
    pub pacing: Pacing,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=1000).contains(&self.pacing.loop_period_ms) {
            return Err(ConfigError::Invalid("loop_period_ms must be 1..=1000"));
        }
        if self.bus.board_address == 0 || self.bus.board_address > 0x7F {
            return Err(ConfigError::Invalid(
                "board_address must be a 7-bit I2C address",
            ));
        }
        let sensors = [&self.addresses.input_sensor, &self.addresses.output_sensor];
        for s in sensors {
            let bases = [s.v_re, s.v_im, s.i_re, s.i_im, s.gate, s.mode, s.relay, s.spi];
            if bases.iter().any(|b| *b == 0) {
                return Err(ConfigError::Invalid("sensor base address is zero"));
            }
            if bases.iter().any(|b| b % 4 != 0) {
                return Err(ConfigError::Invalid("sensor base address is unaligned"));
            }
        }
        for m in [&self.addresses.motor0, &self.addresses.motor1] {
            let bases = [m.out, m.r#in, m.ext];
            if bases.iter().any(|b| *b == 0) {
                return Err(ConfigError::Invalid("motor base address is zero"));
            }
            if bases.iter().any(|b| b % 4 != 0) {
                return Err(ConfigError::Invalid("motor base address is unaligned"));
            }
        }
        if self.addresses.mode_pin == 0 || self.addresses.mode_pin % 4 != 0 {
            return Err(ConfigError::Invalid("mode_pin base address invalid"));
        }
        Ok(())
    }
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Capacitor fit coefficients imported from a calibration-rig CSV.
///
/// Strict header `motor,a0,a1,a2,a3`, one row per motor index (0 and 1).
/// Coefficients are the normalised cubic in pF.
pub fn load_fit_coeffs_csv(path: &std::path::Path) -> Result<[[f32; 4]; 2], ConfigError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| ConfigError::Csv(e.to_string()))?;

    let headers = rdr
        .headers()
        .map_err(|e| ConfigError::Csv(e.to_string()))?
        .clone();
    let expected = ["motor", "a0", "a1", "a2", "a3"];
    if headers.iter().collect::<Vec<_>>() != expected {
        return Err(ConfigError::Csv(
            "calibration csv must have headers motor,a0,a1,a2,a3".into(),
        ));
    }

    let mut out = [[0.0f32; 4]; 2];
    let mut seen = [false; 2];
    for rec in rdr.deserialize::<(usize, f32, f32, f32, f32)>() {
        let (motor, a0, a1, a2, a3) = rec.map_err(|e| ConfigError::Csv(e.to_string()))?;
        if motor >= 2 {
            return Err(ConfigError::Csv(format!("motor index {motor} out of range")));
        }
        if ![a0, a1, a2, a3].iter().all(|a| a.is_finite()) {
            return Err(ConfigError::Csv(format!(
                "motor {motor}: coefficients must be finite"
            )));
        }
        out[motor] = [a0, a1, a2, a3];
        seen[motor] = true;
    }
    if !seen.iter().all(|s| *s) {
        return Err(ConfigError::Csv("rows for both motors are required".into()));
    }
    Ok(out)
}

//! rfmatch_hardware: backends behind the `rfmatch_traits` seams.
//!
//! Features:
//! - `hardware`: memory-mapped register fabrics and the rppal-backed I2C
//!   motion bus, for the real controller.
//! - (default) no `hardware` feature: simulation types that satisfy the
//!   traits, used by tests and by the CLI's sim mode. CI on x86 builds
//!   without GPIO or I2C libraries.

pub mod error;
pub mod sim;

#[cfg(feature = "hardware")]
mod i2c;
#[cfg(feature = "hardware")]
mod mmio;

pub use sim::{SimMotionBus, SimMotor, SimSensor};

#[cfg(feature = "hardware")]
pub use i2c::I2cMotionBus;
#[cfg(feature = "hardware")]
pub use mmio::{MmioModePin, MmioMotor, MmioSensor};

#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Core matching engine (hardware-agnostic).
//!
//! Everything that touches registers or buses goes through the seams in
//! `rfmatch_traits`; this crate owns the semantics:
//!
//! - **Acquisition**: windowed averaging over held FFT bins (`sensor`)
//! - **Solver**: closed-form two-solution 50 Ω match (`matching`)
//! - **Motion**: absolute-position stepper control, homing, cap⇄step
//!   mapping (`motor`), driver bring-up and FRAM records (`board`,
//!   `store`)
//! - **Control**: the auto-match state machine (`ams`) and the periodic
//!   report streams (`stream`)
//! - **Surface**: the line-oriented command shell (`shell`) and the
//!   serial frame grammar (`protocol`)
//!
//! All timing comes from one `Clock`; all host output goes through one
//! `FrameSink`, so the integration tests assert on the exact frames the
//! UI would receive.

pub mod ams;
pub mod board;
pub mod error;
pub mod matching;
pub mod motor;
pub mod protocol;
pub mod sensor;
pub mod shell;
pub mod store;
pub mod stream;

pub use ams::{Ams, AmsMode};
pub use board::{DriverSettings, MotionBoard};
pub use matching::{ImpedancePoints, MatchingAlgorithm, MatchingGoals, vswr};
pub use motor::{IndexSearch, MotorController, MotorLimits, RewindOutcome};
pub use sensor::{ImpedanceSample, RfSensor, SensorCalibration};
pub use shell::Shell;
pub use store::MatcherInfo;
pub use stream::StreamEngine;

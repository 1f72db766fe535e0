#![no_main]

use libfuzzer_sys::fuzz_target;
use rfmatch_core::board::MotionBoard;
use rfmatch_core::motor::MotorController;
use rfmatch_core::sensor::RfSensor;
use rfmatch_core::shell::Shell;
use rfmatch_hardware::{SimMotionBus, SimMotor, SimSensor};
use rfmatch_traits::{Clock, ManualClock};
use std::sync::Arc;

// Any byte sequence fed as a command line must be handled without a
// panic; malformed input answers with usage or an ACK, never a crash.
fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };

    let clock = ManualClock::new();
    let clock_arc: Arc<dyn Clock + Send + Sync> = Arc::new(clock.clone());
    let mut shell = Shell::new(
        RfSensor::new(SimSensor::new()),
        RfSensor::new(SimSensor::new()),
        MotionBoard::new(
            SimMotionBus::new(),
            MotorController::new(SimMotor::new(clock.clone(), 32_000), 0, clock_arc.clone()),
            MotorController::new(SimMotor::new(clock.clone(), 32_000), 1, clock_arc.clone()),
            clock_arc.clone(),
        ),
        Vec::new(),
        clock_arc,
    );

    let _ = shell.handle_line(line);
    shell.tick();
});

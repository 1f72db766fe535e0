//! Absolute-position stepper control.
//!
//! Each controller owns one motor's register fabric. Position reads apply
//! `pos_offset` on top of the raw register so absolute positions survive
//! fabric reboots; normal moves clamp to the soft operating window;
//! homing drives toward the physical stop with a fixed override RPM and
//! declares a stall when per-poll displacement collapses.

use crate::error::MatchError;
use rfmatch_traits::{Clock, MotorFabric};
use std::sync::Arc;
use std::time::Duration;

/// Homing target well past the physical travel in the negative direction.
pub const REWIND_TARGET: i32 = -100_000;
/// Fixed override RPM used by homing and the boot index search.
pub const REWIND_RPM: u32 = 30;

const REWIND_POLL_MS: u64 = 10;
const REWIND_TIMEOUT_MS: u64 = 25_000;
/// Below this many steps per poll the motor is considered stalling.
/// Normal homing movement is ~33 steps per 10 ms poll.
const REWIND_THRESHOLD: i32 = 15;
const REWIND_STALL_COUNT: u32 = 2;
/// Written as the new target after a stall to unload the driver.
const REWIND_STOP_OFFSET: i32 = 1000;

const ORIGIN_EDGE_DELAY_US: u64 = 200;
const INDEX_POLL_INTERVAL_US: u64 = 1000;
/// Polls with no position change before the index search gives up.
const INDEX_STUCK_POLLS: u32 = 2000;
const MICROSTEPS_PER_REV: i64 = 6400;

/// Travel limits in steps. `min..=max` is the hardware travel,
/// `lower..=upper` the soft operating window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorLimits {
    pub min: i32,
    pub max: i32,
    pub lower: i32,
    pub upper: i32,
}

impl Default for MotorLimits {
    fn default() -> Self {
        Self {
            min: 0,
            max: 64_000,
            lower: 4_000,
            upper: 60_000,
        }
    }
}

impl MotorLimits {
    /// `min <= lower <= upper <= max`.
    pub fn validate(&self) -> Result<(), MatchError> {
        if self.min <= self.lower && self.lower <= self.upper && self.upper <= self.max {
            Ok(())
        } else {
            Err(MatchError::Invariant("motor limits out of order"))
        }
    }
}

/// Result of a homing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewindOutcome {
    pub completed: bool,
    pub final_pos: i32,
    /// Absolute distance travelled, always non-negative.
    pub movement: i32,
}

/// Result of an encoder index search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexSearch {
    pub found: bool,
    pub index_pos: i32,
    pub motor_pos_at_index: i32,
    pub final_pos: i32,
}

/// One stepper's controller: soft limits, capacitance mapping, homing.
pub struct MotorController<F: MotorFabric> {
    fabric: F,
    clock: Arc<dyn Clock + Send + Sync>,
    /// Motor number as used in frames and the FRAM schema.
    pub index: usize,
    /// Set once during boot homing; raw register + offset = absolute.
    pub pos_offset: i32,
    pub limits: MotorLimits,
    /// Capacitance at `limits.min` / `limits.max`, in pF x 100.
    pub min_cap: i32,
    pub max_cap: i32,
    /// Normalised cubic `[a0, a1, a2, a3]`; all zero means uncalibrated.
    pub fit_coeffs: [f32; 4],
    override_rpm: u32,
}

impl<F: MotorFabric> MotorController<F> {
    pub fn new(fabric: F, index: usize, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            fabric,
            clock,
            index,
            pos_offset: 0,
            limits: MotorLimits::default(),
            min_cap: 0,
            max_cap: 100_000,
            fit_coeffs: [0.0; 4],
            override_rpm: 0,
        }
    }

    /// Absolute position: raw register plus the boot-time offset.
    pub fn position(&mut self) -> i32 {
        self.fabric.read_position_raw() as i32 + self.pos_offset
    }

    pub fn rpm(&mut self) -> u32 {
        self.fabric.read_rpm()
    }

    pub fn index_position(&mut self) -> i32 {
        self.fabric.read_index_position()
    }

    pub fn stall_flag(&mut self) -> bool {
        self.fabric.stall_flag()
    }

    pub fn override_rpm(&self) -> u32 {
        self.override_rpm
    }

    pub fn set_override_rpm(&mut self, rpm: u32) {
        self.fabric.set_override_rpm(rpm);
        self.override_rpm = rpm;
    }

    /// Travel as a percentage of `[min, max]`, clamped to 0..=100.
    pub fn position_percent(&mut self) -> i32 {
        if self.limits.max <= self.limits.min {
            return 0;
        }
        let pos = i64::from(self.position());
        let span = i64::from(self.limits.max) - i64::from(self.limits.min);
        let pct = (pos - i64::from(self.limits.min)) * 100 / span;
        pct.clamp(0, 100) as i32
    }

    /// Command a move, clamped to the soft operating window. Returns the
    /// position actually commanded.
    pub fn run_to(&mut self, target: i32) -> i32 {
        let clamped = target.clamp(self.limits.lower, self.limits.upper);
        if clamped != target {
            tracing::warn!(
                motor = self.index,
                target,
                clamped,
                lower = self.limits.lower,
                upper = self.limits.upper,
                "target clamped to operating window"
            );
        }
        self.fabric.write_target(clamped);
        clamped
    }

    /// Command a move with no clamping. Homing and calibration only.
    pub fn run_to_force(&mut self, target: i32) {
        tracing::debug!(motor = self.index, target, "force move");
        self.fabric.write_target(target);
    }

    /// Origin handshake: 30-bit position payload in bits 31..2, rising
    /// edge on bit 0 sets the origin immediately.
    pub fn set_origin(&mut self, position: i32) {
        // Park the target first so the re-origined motor does not move.
        self.fabric.write_target(position);
        self.origin_sequence(position, 0x1);
    }

    /// Arm the fabric to snap the origin to `position` when the next
    /// encoder index pulse passes (rising edge on bit 1). The target is
    /// deliberately left alone: writing it here would start a move.
    pub fn set_origin_on_index(&mut self, position: i32) {
        self.origin_sequence(position, 0x2);
    }

    fn origin_sequence(&mut self, position: i32, trigger_bit: u32) {
        let base = (position as u32) << 2;
        let delay = Duration::from_micros(ORIGIN_EDGE_DELAY_US);
        self.fabric.write_origin_word(base);
        self.clock.sleep(delay);
        self.fabric.write_origin_word(base | trigger_bit);
        self.clock.sleep(delay);
        self.fabric.write_origin_word(base);
        self.clock.sleep(delay);
    }

    /// Drive toward the negative physical stop until the motor stalls.
    ///
    /// Polls every 10 ms; two consecutive polls moving less than the
    /// threshold declare the stall, after which the target is rewritten
    /// just ahead of the current position to stop the motor. Bounded by a
    /// 25 s budget.
    pub fn rewind(&mut self) -> RewindOutcome {
        let start = self.position();
        tracing::info!(
            motor = self.index,
            start,
            target = REWIND_TARGET,
            threshold = REWIND_THRESHOLD,
            "rewind start"
        );

        self.set_override_rpm(REWIND_RPM);
        self.clock.sleep(Duration::from_millis(10));
        self.run_to_force(REWIND_TARGET);
        self.clock.sleep(Duration::from_millis(50));

        let mut prev = self.position();
        let mut stall_count = 0u32;
        let mut elapsed_ms = 0u64;
        let mut completed = false;

        while elapsed_ms < REWIND_TIMEOUT_MS {
            self.clock.sleep(Duration::from_millis(REWIND_POLL_MS));
            elapsed_ms += REWIND_POLL_MS;

            let current = self.position();
            // Positive while moving in the rewind direction.
            let diff = prev - current;

            if diff < REWIND_THRESHOLD {
                stall_count += 1;
                if stall_count >= REWIND_STALL_COUNT {
                    self.fabric.write_target(current + REWIND_STOP_OFFSET);
                    tracing::info!(motor = self.index, position = current, "rewind stall");
                    completed = true;
                    break;
                }
            } else {
                stall_count = 0;
            }
            prev = current;
        }

        self.clock.sleep(Duration::from_millis(100));
        self.set_override_rpm(0);
        self.clock.sleep(Duration::from_millis(10));

        let final_pos = self.position();
        let movement = (i64::from(start) - i64::from(final_pos)).unsigned_abs() as i32;
        if !completed {
            tracing::warn!(motor = self.index, final_pos, "rewind timed out");
        }
        RewindOutcome {
            completed,
            final_pos,
            movement,
        }
    }

    /// Move toward `target` at a fixed RPM while watching for the first
    /// encoder index capture. Ends when the target is reached, the RPM
    /// reading collapses to zero twice in a row, the stuck detector fires
    /// or the distance-scaled time budget runs out.
    pub fn find_index(&mut self, target: i32, rpm: u32) -> IndexSearch {
        let mut result = IndexSearch::default();
        let start = self.position();
        let forward = target > start;

        self.set_override_rpm(rpm);
        self.run_to_force(target);

        let distance = i64::from(target) - i64::from(start);
        let steps_per_sec = (i64::from(rpm) * MICROSTEPS_PER_REV) / 60;
        let timeout_us = if steps_per_sec > 0 {
            ((distance.abs() * 1000 / steps_per_sec) * 2 + 5000) * 1000
        } else {
            30_000_000
        };

        let mut prev_index = self.fabric.read_index_position();
        let mut last_moving = start;
        let mut stuck = 0u32;
        let mut elapsed_us: i64 = 0;

        while elapsed_us < timeout_us {
            self.clock
                .sleep(Duration::from_micros(INDEX_POLL_INTERVAL_US));
            elapsed_us += INDEX_POLL_INTERVAL_US as i64;

            let current = self.position();
            let index = self.fabric.read_index_position();

            if !result.found && index != 0 && index != prev_index {
                result.found = true;
                result.index_pos = index;
                result.motor_pos_at_index = current;
                tracing::info!(
                    motor = self.index,
                    index_pos = index,
                    motor_pos = current,
                    "encoder index captured"
                );
            }
            prev_index = index;

            let reached = if forward {
                current >= target
            } else {
                current <= target
            };
            if reached {
                self.clock.sleep(Duration::from_millis(100));
                break;
            }

            // Motion ended early: confirm with a second zero-RPM reading.
            if self.fabric.read_rpm() == 0 {
                self.clock.sleep(Duration::from_millis(50));
                if self.fabric.read_rpm() == 0 {
                    break;
                }
            }

            if current == last_moving {
                stuck += 1;
                if stuck >= INDEX_STUCK_POLLS {
                    tracing::warn!(motor = self.index, position = current, "index search stuck");
                    break;
                }
            } else {
                last_moving = current;
                stuck = 0;
            }
        }

        self.set_override_rpm(0);
        result.final_pos = self.position();
        result
    }

    /// True when any fit coefficient is non-zero.
    pub fn is_fit_calibrated(&self) -> bool {
        self.fit_coeffs.iter().any(|c| *c != 0.0)
    }

    /// Capacitance at the current position, pF x 100.
    pub fn capacitance(&mut self) -> i32 {
        let pos = self.position();
        self.cap_at(pos)
    }

    /// Capacitance at `pos` in pF x 100: the normalised cubic when
    /// calibrated, linear interpolation between the cap endpoints
    /// otherwise.
    pub fn cap_at(&self, pos: i32) -> i32 {
        let span = self.limits.max as f32 - self.limits.min as f32;
        if self.is_fit_calibrated() && span > 0.0 {
            let xn = (pos as f32 - self.limits.min as f32) / span;
            let [a0, a1, a2, a3] = self.fit_coeffs;
            let cap_pf = a3 * xn * xn * xn + a2 * xn * xn + a1 * xn + a0;
            return (cap_pf * 100.0) as i32;
        }

        if self.limits.max <= self.limits.min {
            return self.min_cap;
        }
        let cap_range = i64::from(self.max_cap) - i64::from(self.min_cap);
        let pos_range = i64::from(self.limits.max) - i64::from(self.limits.min);
        let off = (i64::from(pos) - i64::from(self.limits.min)).clamp(0, pos_range);
        self.min_cap + ((cap_range * off) / pos_range) as i32
    }

    /// Inverse mapping: step position for a target capacitance in
    /// pF x 100. Newton-Raphson on the normalised cubic when calibrated
    /// (at most 20 iterations, 0.1 pF tolerance, re-clamped to the
    /// normalised operating window each step); linear fallback otherwise.
    pub fn step_of_cap(&self, target_cap: i32) -> i32 {
        let target_pf = target_cap as f32 / 100.0;
        let span = self.limits.max as f32 - self.limits.min as f32;

        if self.is_fit_calibrated() && span > 0.0 {
            let [a0, a1, a2, a3] = self.fit_coeffs;
            let xn_lower = (self.limits.lower as f32 - self.limits.min as f32) / span;
            let xn_upper = (self.limits.upper as f32 - self.limits.min as f32) / span;

            let mut xn = (xn_lower + xn_upper) / 2.0;
            for _ in 0..20 {
                let f = a3 * xn * xn * xn + a2 * xn * xn + a1 * xn + a0 - target_pf;
                let fp = 3.0 * a3 * xn * xn + 2.0 * a2 * xn + a1;
                if f.abs() < 0.1 {
                    break;
                }
                if fp.abs() < 1e-10 {
                    break;
                }
                xn = (xn - f / fp).clamp(xn_lower, xn_upper);
            }
            return (xn * span + self.limits.min as f32 + 0.5) as i32;
        }

        if self.max_cap <= self.min_cap {
            return self.limits.min;
        }
        let pos_range = i64::from(self.limits.max) - i64::from(self.limits.min);
        let cap_range = i64::from(self.max_cap) - i64::from(self.min_cap);
        let off = (i64::from(target_cap) - i64::from(self.min_cap)).clamp(0, cap_range);
        self.limits.min + ((pos_range * off) / cap_range) as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfmatch_traits::MonotonicClock;

    #[derive(Default)]
    struct StubFabric {
        raw_pos: u32,
        targets: Vec<i32>,
        origin_words: Vec<u32>,
    }

    impl MotorFabric for StubFabric {
        fn write_target(&mut self, target: i32) {
            self.targets.push(target);
        }
        fn write_origin_word(&mut self, word: u32) {
            self.origin_words.push(word);
        }
        fn read_position_raw(&mut self) -> u32 {
            self.raw_pos
        }
        fn read_rpm(&mut self) -> u32 {
            0
        }
        fn read_index_position(&mut self) -> i32 {
            0
        }
        fn stall_flag(&mut self) -> bool {
            false
        }
        fn set_override_rpm(&mut self, _rpm: u32) {}
    }

    fn motor() -> MotorController<StubFabric> {
        MotorController::new(StubFabric::default(), 0, Arc::new(MonotonicClock::new()))
    }

    #[test]
    fn run_to_clamps_to_operating_window() {
        let mut m = motor();
        assert_eq!(m.run_to(100), m.limits.lower);
        assert_eq!(m.run_to(70_000), m.limits.upper);
        assert_eq!(m.run_to(32_000), 32_000);
        assert_eq!(m.fabric.targets, vec![4_000, 60_000, 32_000]);
    }

    #[test]
    fn run_to_force_bypasses_limits() {
        let mut m = motor();
        m.run_to_force(-100_000);
        assert_eq!(m.fabric.targets, vec![-100_000]);
    }

    #[test]
    fn origin_sequence_produces_rising_edge() {
        let mut m = motor();
        m.set_origin(3);
        // Target parked first, then base -> base|1 -> base.
        assert_eq!(m.fabric.targets, vec![3]);
        assert_eq!(m.fabric.origin_words, vec![12, 13, 12]);

        m.fabric.origin_words.clear();
        m.set_origin_on_index(3);
        assert_eq!(m.fabric.origin_words, vec![12, 14, 12]);
        // No extra target write when arming on-index.
        assert_eq!(m.fabric.targets, vec![3]);
    }

    #[test]
    fn position_applies_offset() {
        let mut m = motor();
        m.fabric.raw_pos = 1000;
        m.pos_offset = 500;
        assert_eq!(m.position(), 1500);
    }

    #[test]
    fn linear_cap_mapping_hits_endpoints() {
        let m = motor();
        assert_eq!(m.cap_at(m.limits.min), m.min_cap);
        assert_eq!(m.cap_at(m.limits.max), m.max_cap);
        assert_eq!(m.cap_at(32_000), 50_000);
        // Inverse agrees.
        assert_eq!(m.step_of_cap(50_000), 32_000);
    }

    #[test]
    fn linear_cap_mapping_clamps_outside_travel() {
        let m = motor();
        assert_eq!(m.cap_at(m.limits.min - 1000), m.min_cap);
        assert_eq!(m.cap_at(m.limits.max + 1000), m.max_cap);
    }

    #[test]
    fn cubic_cap_round_trip() {
        let mut m = motor();
        // C(xn) = 100*xn pF over [0, 64000] steps, caps 0..10000 (pF x 100).
        m.fit_coeffs = [0.0, 100.0, 0.0, 0.0];
        m.min_cap = 0;
        m.max_cap = 10_000;

        let cap = m.cap_at(16_000);
        assert!((cap - 2_500).abs() <= 1, "cap_at(16000) = {cap}");

        let step = m.step_of_cap(2_500);
        assert!((step - 16_000).abs() <= 1, "step_of_cap(2500) = {step}");
    }

    #[test]
    fn newton_raphson_terminates_across_band() {
        let mut m = motor();
        m.fit_coeffs = [5.0, 40.0, -12.0, 80.0];
        m.min_cap = 500;
        m.max_cap = 11_300;
        for cap in (m.min_cap..=m.max_cap).step_by(500) {
            let step = m.step_of_cap(cap);
            assert!(
                (m.limits.min..=m.limits.max).contains(&step),
                "step {step} outside travel for cap {cap}"
            );
        }
    }

    #[test]
    fn cubic_inverse_round_trip_within_tolerance() {
        let mut m = motor();
        m.fit_coeffs = [2.0, 120.0, 30.0, -8.0];
        for s in (m.limits.lower..=m.limits.upper).step_by(4000) {
            let cap = m.cap_at(s);
            let back = m.step_of_cap(cap);
            let err = (m.cap_at(back) - cap).abs();
            // NR tolerance is 0.1 pF = 10 centi-pF.
            assert!(err <= 10, "cap error {err} at step {s}");
        }
    }

    #[test]
    fn percent_is_clamped() {
        let mut m = motor();
        m.fabric.raw_pos = 0;
        m.pos_offset = -5000;
        assert_eq!(m.position_percent(), 0);
        m.pos_offset = 200_000;
        assert_eq!(m.position_percent(), 100);
        m.pos_offset = 32_000;
        assert_eq!(m.position_percent(), 50);
    }

    #[test]
    fn limits_validation() {
        assert!(MotorLimits::default().validate().is_ok());
        let bad = MotorLimits {
            min: 0,
            max: 100,
            lower: 60,
            upper: 40,
        };
        assert!(bad.validate().is_err());
    }
}

//! Auto-match state machine.
//!
//! Runs on the shared loop clock: every tick it either watches VSWR
//! (Monitoring) or samples, solves and commands both motors (Matching).
//! Transitions are hysteretic: drop to Monitoring at `vswr_stop`, pick
//! matching back up at `vswr_restart`. A non-zero timeout bounds the
//! whole session.

use crate::board::MotionBoard;
use crate::matching::{MatchingAlgorithm, vswr};
use crate::protocol::{self, fixed6};
use crate::sensor::RfSensor;
use rfmatch_traits::{FrameSink, MotionBus, MotorFabric, SensorFabric};

/// Above this VSWR the reflected-impedance estimate of ZC is noise; the
/// solver is fed the output sensor instead.
const OUTPUT_SENSOR_VSWR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmsMode {
    Monitoring,
    Matching,
}

/// The state machine. All times are milliseconds on the shell clock.
#[derive(Debug)]
pub struct Ams {
    pub enabled: bool,
    pub mode: AmsMode,
    pub interval_ms: u64,
    /// 0 = run until stopped.
    pub timeout_ms: u64,
    pub log_interval: u32,
    pub verbose: bool,
    log_counter: u32,
    start_ms: u64,
    last_tick_ms: u64,
}

impl Default for Ams {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: AmsMode::Monitoring,
            interval_ms: 10,
            timeout_ms: 0,
            log_interval: 1,
            verbose: true,
            log_counter: 0,
            start_ms: 0,
            last_tick_ms: 0,
        }
    }
}

impl Ams {
    /// Enable the loop in Matching mode.
    pub fn start(&mut self, now_ms: u64, interval_ms: u64, timeout_ms: u64, log_interval: u32) {
        self.enabled = true;
        self.mode = AmsMode::Matching;
        self.interval_ms = interval_ms;
        self.timeout_ms = timeout_ms;
        self.log_interval = log_interval.max(1);
        self.log_counter = 0;
        self.start_ms = now_ms;
        self.last_tick_ms = now_ms;
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        self.mode = AmsMode::Monitoring;
    }

    /// One pass of the monitor/match loop. No-op unless enabled and the
    /// interval has elapsed.
    pub fn tick<SI, SO, B, F, K>(
        &mut self,
        now_ms: u64,
        input: &mut RfSensor<SI>,
        output: &mut RfSensor<SO>,
        board: &mut MotionBoard<B, F>,
        algo: &MatchingAlgorithm,
        sink: &mut K,
    ) where
        SI: SensorFabric,
        SO: SensorFabric,
        B: MotionBus,
        F: MotorFabric,
        K: FrameSink,
    {
        if !self.enabled {
            return;
        }

        let elapsed = now_ms.saturating_sub(self.start_ms);
        if self.timeout_ms > 0 && elapsed >= self.timeout_ms {
            self.stop();
            if self.verbose {
                sink.send_line(&format!("AMS,TIMEOUT,{elapsed},EN"));
            }
            protocol::send_ack(sink, "ams", "TIMEOUT");
            return;
        }

        if now_ms.saturating_sub(self.last_tick_ms) < self.interval_ms {
            return;
        }
        self.last_tick_ms = now_ms;

        self.log_counter += 1;
        let should_log = self.verbose && self.log_counter >= self.log_interval;
        if should_log {
            self.log_counter = 0;
        }

        let in_sample = input.sample(None);
        let out_sample = output.sample(None);
        let (rm, xm) = (f64::from(in_sample.r), f64::from(in_sample.x));
        let (rpm, xpm) = (f64::from(out_sample.r), f64::from(out_sample.x));

        if should_log {
            protocol::send_impedance(
                sink,
                true,
                in_sample.r,
                in_sample.x,
                in_sample.v_mag,
                in_sample.i_mag,
                in_sample.phase_deg,
            );
            protocol::send_impedance(
                sink,
                false,
                out_sample.r,
                out_sample.x,
                out_sample.v_mag,
                out_sample.i_mag,
                out_sample.phase_deg,
            );
        }

        let swr = vswr(rm, xm);

        match self.mode {
            AmsMode::Matching => {
                if swr <= f64::from(board.info.vswr.stop) {
                    self.mode = AmsMode::Monitoring;
                    if self.verbose {
                        sink.send_line(&format!("AMS,MATCHED,{},EN", fixed6(swr as f32)));
                    }
                    return;
                }

                let vvc0_pf = f64::from(board.motors[0].capacitance()) / 100.0;
                let vvc1_pf = f64::from(board.motors[1].capacitance()) / 100.0;
                let output_rx = (swr > OUTPUT_SENSOR_VSWR).then_some((rpm, xpm));
                let goals = algo.matching_goals(
                    rm,
                    xm,
                    vvc0_pf,
                    vvc1_pf,
                    output_rx,
                    &board.motors[0],
                    &board.motors[1],
                );

                let selected = goals.solutions.iter().enumerate().find(|(_, sol)| {
                    if !sol.valid {
                        return false;
                    }
                    let cap0 = (sol.vvc0_pf * 100.0) as i32;
                    let cap1 = (sol.vvc1_pf * 100.0) as i32;
                    let (l0, l1) = (board.motors[0].limits, board.motors[1].limits);
                    cap0 >= board.motors[0].min_cap
                        && cap0 <= board.motors[0].max_cap
                        && cap1 >= board.motors[1].min_cap
                        && cap1 <= board.motors[1].max_cap
                        && (l0.lower..=l0.upper).contains(&sol.step0)
                        && (l1.lower..=l1.upper).contains(&sol.step1)
                });

                if let Some((idx, sol)) = selected {
                    let (step0, step1) = (sol.step0, sol.step1);
                    board.motors[0].run_to(step0);
                    board.motors[1].run_to(step1);
                    if should_log {
                        sink.send_line(&format!(
                            "AMS,RUN,{idx},{},{step0},{step1},EN",
                            fixed6(swr as f32)
                        ));
                    }
                } else {
                    tracing::debug!(vswr = swr, "no valid matching goal this tick");
                }
            }
            AmsMode::Monitoring => {
                if swr >= f64::from(board.info.vswr.restart) {
                    self.mode = AmsMode::Matching;
                    if self.verbose {
                        sink.send_line(&format!("AMS,RESTART,{},EN", fixed6(swr as f32)));
                    }
                }
            }
        }
    }
}

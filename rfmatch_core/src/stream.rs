//! Periodic report streams.
//!
//! Five independent channels: impedance and V/I per sensor, plus one
//! combined motor-position stream. Each carries its own enable, rate and
//! last-emission timestamp; no channel ever waits on another.

use crate::board::MotionBoard;
use crate::protocol;
use crate::sensor::RfSensor;
use crate::store::StreamRates;
use rfmatch_traits::{FrameSink, MotionBus, MotorFabric, SensorFabric};

#[derive(Debug, Clone, Copy)]
pub struct StreamChannel {
    pub enabled: bool,
    pub rate_ms: u64,
    last_ms: u64,
}

impl StreamChannel {
    fn new(rate_ms: u64) -> Self {
        Self {
            enabled: false,
            rate_ms,
            last_ms: 0,
        }
    }

    fn due(&mut self, now_ms: u64) -> bool {
        if !self.enabled || now_ms.saturating_sub(self.last_ms) < self.rate_ms {
            return false;
        }
        self.last_ms = now_ms;
        true
    }
}

#[derive(Debug)]
pub struct StreamEngine {
    pub imp_input: StreamChannel,
    pub imp_output: StreamChannel,
    pub vi_input: StreamChannel,
    pub vi_output: StreamChannel,
    pub motor_pos: StreamChannel,
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::from_rates(StreamRates::default())
    }
}

impl StreamEngine {
    pub fn from_rates(rates: StreamRates) -> Self {
        Self {
            imp_input: StreamChannel::new(rates.imp_ms as u64),
            imp_output: StreamChannel::new(rates.imp_ms as u64),
            vi_input: StreamChannel::new(rates.vi_ms as u64),
            vi_output: StreamChannel::new(rates.vi_ms as u64),
            motor_pos: StreamChannel::new(rates.pos_ms as u64),
        }
    }

    /// Re-apply persisted rates without touching the enable flags.
    pub fn apply_rates(&mut self, rates: StreamRates) {
        self.imp_input.rate_ms = rates.imp_ms as u64;
        self.imp_output.rate_ms = rates.imp_ms as u64;
        self.vi_input.rate_ms = rates.vi_ms as u64;
        self.vi_output.rate_ms = rates.vi_ms as u64;
        self.motor_pos.rate_ms = rates.pos_ms as u64;
    }

    /// Streams stop when the device leaves the interactive shell.
    pub fn disable_all(&mut self) {
        self.imp_input.enabled = false;
        self.imp_output.enabled = false;
        self.vi_input.enabled = false;
        self.vi_output.enabled = false;
        self.motor_pos.enabled = false;
    }

    /// Emit every due channel.
    pub fn tick<SI, SO, B, F, K>(
        &mut self,
        now_ms: u64,
        input: &mut RfSensor<SI>,
        output: &mut RfSensor<SO>,
        board: &mut MotionBoard<B, F>,
        sink: &mut K,
    ) where
        SI: SensorFabric,
        SO: SensorFabric,
        B: MotionBus,
        F: MotorFabric,
        K: FrameSink,
    {
        if self.imp_input.due(now_ms) {
            let s = input.sample(None);
            protocol::send_impedance(sink, true, s.r, s.x, s.v_mag, s.i_mag, s.phase_deg);
        }
        if self.imp_output.due(now_ms) {
            let s = output.sample(None);
            protocol::send_impedance(sink, false, s.r, s.x, s.v_mag, s.i_mag, s.phase_deg);
        }
        if self.vi_input.due(now_ms) {
            let s = input.sample(None);
            protocol::send_vi_mag(sink, true, s.v_mag, s.i_mag);
        }
        if self.vi_output.due(now_ms) {
            let s = output.sample(None);
            protocol::send_vi_mag(sink, false, s.v_mag, s.i_mag);
        }
        if self.motor_pos.due(now_ms) {
            let pos0 = board.motors[0].position();
            let pct0 = board.motors[0].position_percent();
            let cap0 = board.motors[0].capacitance();
            let pos1 = board.motors[1].position();
            let pct1 = board.motors[1].position_percent();
            let cap1 = board.motors[1].capacitance();
            protocol::send_motor_position_both(sink, pos0, pct0, cap0, pos1, pct1, cap1);
        }
    }
}

//! Simulation backends.
//!
//! All three types are cloneable handles over shared state, so a test can
//! keep a handle while the controller owns the fabric, changing the RF
//! load or inspecting motion mid-run. The motor integrates its position
//! against a `ManualClock`, which makes polling loops (rewind, index
//! search) deterministic: every `sleep` advances simulated time, and the
//! motor moves exactly as far as that time allows.

use rfmatch_traits::{
    Clock, HoldStatus, HwResult, ManualClock, MotionBus, MotorFabric, SensorFabric,
};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const FFT_LEN: usize = 1024;
const MICROSTEPS_PER_REV: f64 = 6400.0;

// ---- sensor ---------------------------------------------------------------

struct SensorState {
    v_bins: Vec<(f32, f32)>,
    i_bins: Vec<(f32, f32)>,
    write_index: u32,
    held: bool,
    ack_hold: bool,
    spectrum_mode: bool,
    relay_value: u16,
}

/// Simulated RF sensor fabric with a programmable load.
#[derive(Clone)]
pub struct SimSensor {
    state: Arc<Mutex<SensorState>>,
}

impl Default for SimSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSensor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SensorState {
                v_bins: vec![(0.0, 0.0); FFT_LEN],
                i_bins: vec![(1.0, 0.0); FFT_LEN],
                write_index: 512,
                held: false,
                ack_hold: true,
                spectrum_mode: false,
                relay_value: 0,
            })),
        }
    }

    /// Present a load of `r + jx` ohms: every voltage bin carries the
    /// complex impedance against a unit current bin, so any window size
    /// measures exactly (r, x).
    pub fn set_load(&self, r: f32, x: f32) {
        let mut s = self.state.lock().unwrap();
        s.v_bins.fill((r, x));
        s.i_bins.fill((1.0, 0.0));
    }

    /// Fill the bins directly.
    pub fn set_bins(&self, v: Vec<(f32, f32)>, i: Vec<(f32, f32)>) {
        let mut s = self.state.lock().unwrap();
        s.v_bins = v;
        s.i_bins = i;
    }

    /// Make the hold handshake never acknowledge.
    pub fn refuse_hold(&self, refuse: bool) {
        self.state.lock().unwrap().ack_hold = !refuse;
    }

    pub fn relay_value(&self) -> u16 {
        self.state.lock().unwrap().relay_value
    }
}

impl SensorFabric for SimSensor {
    fn set_hold(&mut self, hold: bool) {
        let mut s = self.state.lock().unwrap();
        s.held = hold && s.ack_hold;
    }

    fn hold_status(&mut self) -> HoldStatus {
        let s = self.state.lock().unwrap();
        HoldStatus {
            held: s.held,
            write_index: s.write_index,
        }
    }

    fn read_voltage_bin(&mut self, index: usize) -> (f32, f32) {
        self.state.lock().unwrap().v_bins[index % FFT_LEN]
    }

    fn read_current_bin(&mut self, index: usize) -> (f32, f32) {
        self.state.lock().unwrap().i_bins[index % FFT_LEN]
    }

    fn set_spectrum_mode(&mut self, full_fft: bool) {
        self.state.lock().unwrap().spectrum_mode = full_fft;
    }

    fn pulse_relay(&mut self, command_mask: u16) {
        self.state.lock().unwrap().relay_value = command_mask;
    }

    fn init_frontend(&mut self) -> HwResult<()> {
        Ok(())
    }
}

// ---- motor ----------------------------------------------------------------

struct MotorState {
    position: f64,
    target: i32,
    override_rpm: u32,
    default_rpm: u32,
    /// Hard mechanical stops; motion pins here regardless of target.
    travel_min: i32,
    travel_max: i32,
    /// Encoder index pulses at `index_phase + k * 6400`.
    index_phase: i32,
    index_capture: i32,
    origin_words: Vec<u32>,
    last_update: Instant,
}

/// Simulated stepper fabric driven by a shared `ManualClock`.
#[derive(Clone)]
pub struct SimMotor {
    state: Arc<Mutex<MotorState>>,
    clock: ManualClock,
}

impl SimMotor {
    pub fn new(clock: ManualClock, start_pos: i32) -> Self {
        let now = clock.now();
        Self {
            state: Arc::new(Mutex::new(MotorState {
                position: f64::from(start_pos),
                target: start_pos,
                override_rpm: 0,
                default_rpm: 120,
                travel_min: 0,
                travel_max: 64_000,
                index_phase: 500,
                index_capture: 0,
                origin_words: Vec::new(),
                last_update: now,
            })),
            clock,
        }
    }

    pub fn set_travel(&self, min: i32, max: i32) {
        let mut s = self.state.lock().unwrap();
        s.travel_min = min;
        s.travel_max = max;
    }

    pub fn set_index_phase(&self, phase: i32) {
        self.state.lock().unwrap().index_phase = phase;
    }

    pub fn last_target(&self) -> i32 {
        self.state.lock().unwrap().target
    }

    pub fn origin_words(&self) -> Vec<u32> {
        self.state.lock().unwrap().origin_words.clone()
    }

    /// Advance the kinematic model to the clock's current instant.
    fn integrate(&self, s: &mut MotorState) {
        let now = self.clock.now();
        let dt = now.saturating_duration_since(s.last_update).as_secs_f64();
        s.last_update = now;
        if dt <= 0.0 {
            return;
        }

        let rpm = if s.override_rpm > 0 {
            s.override_rpm
        } else {
            s.default_rpm
        };
        let rate = f64::from(rpm) * MICROSTEPS_PER_REV / 60.0;
        let target = f64::from(s.target);
        let before = s.position;
        let remaining = target - before;
        if remaining == 0.0 {
            return;
        }
        let step = (rate * dt).min(remaining.abs());
        let mut after = before + step.copysign(remaining);
        after = after.clamp(f64::from(s.travel_min), f64::from(s.travel_max));

        // Index pulses captured while crossing phase + k * rev.
        let phase = f64::from(s.index_phase);
        let (lo, hi) = if after >= before {
            (before, after)
        } else {
            (after, before)
        };
        let k_lo = ((lo - phase) / MICROSTEPS_PER_REV).ceil() as i64;
        let k_hi = ((hi - phase) / MICROSTEPS_PER_REV).floor() as i64;
        if k_hi >= k_lo {
            s.index_capture = (phase + (k_hi as f64) * MICROSTEPS_PER_REV) as i32;
        }

        s.position = after;
    }
}

impl MotorFabric for SimMotor {
    fn write_target(&mut self, target: i32) {
        let mut s = self.state.lock().unwrap();
        self.integrate(&mut s);
        s.target = target;
    }

    fn write_origin_word(&mut self, word: u32) {
        self.state.lock().unwrap().origin_words.push(word);
    }

    fn read_position_raw(&mut self) -> u32 {
        let mut s = self.state.lock().unwrap();
        self.integrate(&mut s);
        s.position as i32 as u32
    }

    fn read_rpm(&mut self) -> u32 {
        let mut s = self.state.lock().unwrap();
        self.integrate(&mut s);
        let target = f64::from(s.target);
        let pinned_low = s.position <= f64::from(s.travel_min) && target < s.position;
        let pinned_high = s.position >= f64::from(s.travel_max) && target > s.position;
        if s.position == target || pinned_low || pinned_high {
            0
        } else if s.override_rpm > 0 {
            s.override_rpm
        } else {
            s.default_rpm
        }
    }

    fn read_index_position(&mut self) -> i32 {
        let mut s = self.state.lock().unwrap();
        self.integrate(&mut s);
        s.index_capture
    }

    fn stall_flag(&mut self) -> bool {
        let mut s = self.state.lock().unwrap();
        self.integrate(&mut s);
        let target = f64::from(s.target);
        (s.position <= f64::from(s.travel_min) && target < s.position)
            || (s.position >= f64::from(s.travel_max) && target > s.position)
    }

    fn set_override_rpm(&mut self, rpm: u32) {
        let mut s = self.state.lock().unwrap();
        self.integrate(&mut s);
        s.override_rpm = rpm;
    }
}

// ---- motion bus -----------------------------------------------------------

struct BusState {
    fram: Vec<u8>,
    regs: [[u16; 8]; 2],
    sleeping: [bool; 2],
    fail_fram: bool,
}

/// Simulated companion board: driver registers plus 2 KiB of FRAM.
#[derive(Clone)]
pub struct SimMotionBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for SimMotionBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMotionBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                fram: vec![0; 2048],
                regs: [[0; 8]; 2],
                sleeping: [false; 2],
                fail_fram: false,
            })),
        }
    }

    /// Make every FRAM transfer fail, exercising the defaults path.
    pub fn fail_fram(&self, fail: bool) {
        self.state.lock().unwrap().fail_fram = fail;
    }

    pub fn reg(&self, spi: u8, reg: u8) -> u16 {
        self.state.lock().unwrap().regs[spi as usize - 1][reg as usize]
    }

    pub fn fram_snapshot(&self) -> Vec<u8> {
        self.state.lock().unwrap().fram.clone()
    }
}

impl MotionBus for SimMotionBus {
    fn write_reg(&mut self, spi: u8, reg: u8, value: u16) -> HwResult<()> {
        self.state.lock().unwrap().regs[spi as usize - 1][reg as usize] = value;
        Ok(())
    }

    fn read_reg(&mut self, spi: u8, reg: u8) -> HwResult<u16> {
        Ok(self.state.lock().unwrap().regs[spi as usize - 1][reg as usize])
    }

    fn read_status(&mut self, spi: u8) -> HwResult<[u16; 8]> {
        Ok(self.state.lock().unwrap().regs[spi as usize - 1])
    }

    fn reset_driver(&mut self, spi: u8) -> HwResult<()> {
        self.state.lock().unwrap().regs[spi as usize - 1] = [0; 8];
        Ok(())
    }

    fn set_sleep(&mut self, spi: u8, level: bool) -> HwResult<()> {
        self.state.lock().unwrap().sleeping[spi as usize - 1] = !level;
        Ok(())
    }

    fn set_hw_reset(&mut self, _spi: u8, _level: bool) -> HwResult<()> {
        Ok(())
    }

    fn fram_read(&mut self, addr: u16, buf: &mut [u8]) -> HwResult<()> {
        let s = self.state.lock().unwrap();
        if s.fail_fram {
            return Err(Box::new(crate::error::HwError::Nak));
        }
        let a = addr as usize;
        let end = a + buf.len();
        if end > s.fram.len() {
            return Err(Box::new(crate::error::HwError::Address(addr)));
        }
        buf.copy_from_slice(&s.fram[a..end]);
        Ok(())
    }

    fn fram_write(&mut self, addr: u16, data: &[u8]) -> HwResult<()> {
        let mut s = self.state.lock().unwrap();
        if s.fail_fram {
            return Err(Box::new(crate::error::HwError::Nak));
        }
        let a = addr as usize;
        let end = a + data.len();
        if end > s.fram.len() {
            return Err(Box::new(crate::error::HwError::Address(addr)));
        }
        s.fram[a..end].copy_from_slice(data);
        Ok(())
    }
}

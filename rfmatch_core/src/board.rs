//! Motion board: two stepper controllers, their DRV8711 drivers behind
//! the I²C companion, and the FRAM record set.
//!
//! Record loads apply the values to the live controllers and emit the
//! corresponding protocol frame so the host UI reflects the restored
//! state. A failed read substitutes the documented defaults and keeps
//! going; only the bus transport itself surfaces errors.

use crate::motor::{MotorController, MotorLimits, REWIND_RPM};
use crate::protocol;
use crate::sensor::RfSensor;
use crate::store::{self, AmsSettings, MatcherInfo, StreamRates};
use rfmatch_traits::{Clock, FrameSink, HwResult, MotionBus, MotorFabric, SensorFabric};
use std::sync::Arc;
use std::time::Duration;

// DRV8711 register order on the companion board.
pub const REG_CTRL: u8 = 0;
pub const REG_TORQUE: u8 = 1;
pub const REG_OFF: u8 = 2;
pub const REG_BLANK: u8 = 3;
pub const REG_DECAY: u8 = 4;
pub const REG_STALL: u8 = 5;
pub const REG_DRIVE: u8 = 6;

/// Positive-direction target of the boot index search; the first index
/// sits within the first revolution or two past the rewind stop.
const INDEX_SEARCH_TARGET: i32 = 15_000;

const DRIVER_SETTLE: Duration = Duration::from_millis(100);

/// DRV8711 register set per motor. The defaults are the board's tuned
/// values: 1/32 microstep, mixed decay, internal-back-EMF stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub standby: u16,
    pub disable: u16,
    pub ctrl: u16,
    pub torque: u16,
    pub off: u16,
    pub blank: u16,
    pub decay: u16,
    pub stall: u16,
    pub drive: u16,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            standby: 553,
            disable: 552,
            ctrl: 552,
            torque: 336,
            off: 15,
            blank: 336,
            decay: 508,
            stall: 1200,
            drive: 5,
        }
    }
}

/// The board aggregate: bus, both motors, persisted records.
pub struct MotionBoard<B: MotionBus, F: MotorFabric> {
    bus: B,
    pub motors: [MotorController<F>; 2],
    pub info: MatcherInfo,
    pub driver_settings: [DriverSettings; 2],
    clock: Arc<dyn Clock + Send + Sync>,
}

impl<B: MotionBus, F: MotorFabric> MotionBoard<B, F> {
    pub fn new(
        bus: B,
        m0: MotorController<F>,
        m1: MotorController<F>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            bus,
            motors: [m0, m1],
            info: MatcherInfo::default(),
            driver_settings: [DriverSettings::default(); 2],
            clock,
        }
    }

    fn spi(motor: usize) -> u8 {
        motor as u8 + 1
    }

    // ---- driver management -------------------------------------------------

    /// Program the driver register sequence for one motor, with settling
    /// time between writes.
    pub fn init_motor(&mut self, motor: usize) -> HwResult<()> {
        let spi = Self::spi(motor);
        let ds = self.driver_settings[motor];
        let sequence = [
            (REG_CTRL, ds.standby),
            (REG_CTRL, ds.disable),
            (REG_TORQUE, ds.torque),
            (REG_OFF, ds.off),
            (REG_BLANK, ds.blank),
            (REG_DECAY, ds.decay),
            (REG_STALL, ds.stall),
            (REG_DRIVE, ds.drive),
        ];
        for (reg, value) in sequence {
            self.bus.write_reg(spi, reg, value)?;
            self.clock.sleep(DRIVER_SETTLE);
        }
        Ok(())
    }

    /// Pulse the hardware reset line and re-program the driver.
    pub fn hw_reset(&mut self, motor: usize) -> HwResult<()> {
        let spi = Self::spi(motor);
        self.bus.set_hw_reset(spi, true)?;
        self.clock.sleep(DRIVER_SETTLE);
        self.bus.set_hw_reset(spi, false)?;
        self.init_motor(motor)
    }

    pub fn set_sleep(&mut self, motor: usize, level: bool) -> HwResult<()> {
        self.bus.set_sleep(Self::spi(motor), level)
    }

    pub fn set_ctrl_reg(&mut self, motor: usize, value: u16) -> HwResult<()> {
        let r = self.bus.write_reg(Self::spi(motor), REG_CTRL, value);
        self.clock.sleep(DRIVER_SETTLE);
        r
    }

    pub fn set_torque(&mut self, motor: usize, value: u16) -> HwResult<()> {
        self.bus.write_reg(Self::spi(motor), REG_TORQUE, value)
    }

    pub fn driver_status(&mut self, motor: usize) -> HwResult<[u16; 8]> {
        self.bus.read_status(Self::spi(motor))
    }

    pub fn set_driver_settings(&mut self, motor: usize, settings: DriverSettings) {
        self.driver_settings[motor] = settings;
    }

    // ---- raw FRAM access (backup/restore/poke) ----------------------------

    pub fn fram_read(&mut self, addr: u16, buf: &mut [u8]) -> HwResult<()> {
        store::read_record(&mut self.bus, addr, buf)
    }

    pub fn fram_write(&mut self, addr: u16, data: &[u8]) -> HwResult<()> {
        store::write_record(&mut self.bus, self.clock.as_ref(), addr, data)
    }

    // ---- record saves ------------------------------------------------------

    pub fn save_product_info(&mut self) -> HwResult<()> {
        let model = store::encode_str(&self.info.model, store::MODEL_LEN);
        let date = store::encode_str(&self.info.date, store::DATE_LEN);
        let serial = store::encode_str(&self.info.serial, store::SERIAL_LEN);
        self.fram_write(store::ADDR_MODEL, &model)?;
        self.fram_write(store::ADDR_DATE, &date)?;
        self.fram_write(store::ADDR_SERIAL, &serial)
    }

    pub fn save_calibration(&mut self) -> HwResult<()> {
        let input = store::encode_f32s(&self.info.input_cal);
        let output = store::encode_f32s(&self.info.output_cal);
        self.fram_write(store::ADDR_INPUT_CAL, &input)?;
        self.fram_write(store::ADDR_OUTPUT_CAL, &output)
    }

    pub fn save_first_index_pos(&mut self, motor: usize, pos: i32) -> HwResult<()> {
        self.info.first_index_pos[motor] = pos;
        let addr = store::ADDR_INDEX_POS + (motor as u16) * 4;
        let bytes = store::encode_i32s(&[pos]);
        self.fram_write(addr, &bytes)
    }

    pub fn save_all_first_index_pos(&mut self) -> HwResult<()> {
        let bytes = store::encode_i32s(&self.info.first_index_pos);
        self.fram_write(store::ADDR_INDEX_POS, &bytes)
    }

    pub fn save_motor_limits(&mut self) -> HwResult<()> {
        let flat: Vec<i32> = self.info.motor_limits.iter().flatten().copied().collect();
        let bytes = store::encode_i32s(&flat);
        self.fram_write(store::ADDR_MOTOR_LIMITS, &bytes)
    }

    pub fn save_motor_caps(&mut self) -> HwResult<()> {
        for m in 0..2 {
            self.motors[m].min_cap = self.info.motor_caps[m][0];
            self.motors[m].max_cap = self.info.motor_caps[m][1];
        }
        let flat: Vec<i32> = self.info.motor_caps.iter().flatten().copied().collect();
        let bytes = store::encode_i32s(&flat);
        self.fram_write(store::ADDR_MOTOR_CAPS, &bytes)
    }

    pub fn save_fit_coeffs(&mut self) -> HwResult<()> {
        for m in 0..2 {
            self.motors[m].fit_coeffs = self.info.motor_fit_coeffs[m];
        }
        let flat: Vec<f32> = self
            .info
            .motor_fit_coeffs
            .iter()
            .flatten()
            .copied()
            .collect();
        let bytes = store::encode_f32s(&flat);
        self.fram_write(store::ADDR_MOTOR_FIT_COEFFS, &bytes)
    }

    pub fn save_stream_rates(&mut self) -> HwResult<()> {
        let r = self.info.stream_rates;
        let bytes = store::encode_i32s(&[r.imp_ms, r.vi_ms, r.pos_ms]);
        self.fram_write(store::ADDR_STREAM_SETTINGS, &bytes)
    }

    pub fn save_vswr(&mut self) -> HwResult<()> {
        let v = self.info.vswr;
        let bytes = store::encode_f32s(&[v.start, v.stop, v.restart]);
        self.fram_write(store::ADDR_VSWR_SETTINGS, &bytes)
    }

    pub fn save_ams(&mut self) -> HwResult<()> {
        let a = self.info.ams;
        let bytes = store::encode_i32s(&[a.interval_ms, a.timeout_ms, a.log_interval]);
        self.fram_write(store::ADDR_AMS_SETTINGS, &bytes)
    }

    // ---- record loads ------------------------------------------------------

    /// Load every record, apply it, and report each restored value to the
    /// host. Read failures fall back to defaults; the boot continues.
    pub fn load_all<SI: SensorFabric, SO: SensorFabric>(
        &mut self,
        input: &mut RfSensor<SI>,
        output: &mut RfSensor<SO>,
        sink: &mut impl FrameSink,
    ) {
        self.load_product_info(sink);
        self.load_calibration(input, output, sink);
        self.load_first_index_pos();
        // Caps and fit coefficients load before limits so the MGL frames
        // report capacitance from the restored mapping.
        self.load_motor_caps();
        self.load_fit_coeffs(sink);
        self.load_motor_limits(sink);
        sink.send_line(&format!("RGA,i,{},EN", input.avg_count()));
        sink.send_line(&format!("RGA,o,{},EN", output.avg_count()));
        self.load_stream_rates(sink);
        self.load_vswr(sink);
        self.load_ams(sink);
    }

    pub fn load_product_info(&mut self, sink: &mut impl FrameSink) {
        let mut model = [0u8; store::MODEL_LEN];
        let mut date = [0u8; store::DATE_LEN];
        let mut serial = [0u8; store::SERIAL_LEN];
        let ok = self.fram_read(store::ADDR_MODEL, &mut model).is_ok()
            && self.fram_read(store::ADDR_DATE, &mut date).is_ok()
            && self.fram_read(store::ADDR_SERIAL, &mut serial).is_ok();
        if ok {
            self.info.model = store::decode_str(&model);
            self.info.date = store::decode_str(&date);
            self.info.serial = store::decode_str(&serial);
        } else {
            tracing::warn!("product info read failed; keeping defaults");
        }
        sink.send_line(&format!(
            "DGI,{},{},{},EN",
            self.info.model, self.info.date, self.info.serial
        ));
    }

    pub fn load_calibration<SI: SensorFabric, SO: SensorFabric>(
        &mut self,
        input: &mut RfSensor<SI>,
        output: &mut RfSensor<SO>,
        sink: &mut impl FrameSink,
    ) {
        let mut raw = [0u8; 12];
        if self.fram_read(store::ADDR_INPUT_CAL, &mut raw).is_ok() {
            let mut vals = [0.0f32; 3];
            store::decode_f32s(&raw, &mut vals);
            if vals.iter().all(|v| v.is_finite()) {
                self.info.input_cal = vals;
            }
        } else {
            tracing::warn!("input calibration read failed; using defaults");
            self.info.input_cal = [1.0, 1.0, 0.0];
        }
        if self.fram_read(store::ADDR_OUTPUT_CAL, &mut raw).is_ok() {
            let mut vals = [0.0f32; 3];
            store::decode_f32s(&raw, &mut vals);
            if vals.iter().all(|v| v.is_finite()) {
                self.info.output_cal = vals;
            }
        } else {
            tracing::warn!("output calibration read failed; using defaults");
            self.info.output_cal = [1.0, 1.0, 0.0];
        }

        input.set_v_gain(self.info.input_cal[0]);
        input.set_i_gain(self.info.input_cal[1]);
        input.set_phase_offset_deg(self.info.input_cal[2]);
        output.set_v_gain(self.info.output_cal[0]);
        output.set_i_gain(self.info.output_cal[1]);
        output.set_phase_offset_deg(self.info.output_cal[2]);

        for (tag, cal) in [("i", self.info.input_cal), ("o", self.info.output_cal)] {
            sink.send_line(&format!(
                "RGC,{tag},{},{},{},EN",
                protocol::fixed6(cal[0]),
                protocol::fixed6(cal[1]),
                protocol::fixed6(cal[2])
            ));
        }
    }

    pub fn load_first_index_pos(&mut self) {
        let mut raw = [0u8; 128];
        if self.fram_read(store::ADDR_INDEX_POS, &mut raw).is_ok() {
            store::decode_i32s(&raw, &mut self.info.first_index_pos);
        } else {
            tracing::warn!("first index positions read failed; using zeros");
        }
        tracing::info!(
            m0 = self.info.first_index_pos[0],
            m1 = self.info.first_index_pos[1],
            "first index positions loaded"
        );
    }

    pub fn load_motor_limits(&mut self, sink: &mut impl FrameSink) {
        let mut raw = [0u8; 32];
        if self.fram_read(store::ADDR_MOTOR_LIMITS, &mut raw).is_ok() {
            let mut flat = [0i32; 8];
            store::decode_i32s(&raw, &mut flat);
            for m in 0..2 {
                let limits = MotorLimits {
                    min: flat[m * 4],
                    max: flat[m * 4 + 1],
                    lower: flat[m * 4 + 2],
                    upper: flat[m * 4 + 3],
                };
                if limits.validate().is_ok() {
                    self.info.motor_limits[m] = [limits.min, limits.max, limits.lower, limits.upper];
                } else {
                    tracing::warn!(motor = m, "loaded motor limits out of order; using defaults");
                    self.info.motor_limits[m] = [0, 64_000, 4_000, 60_000];
                }
            }
        } else {
            tracing::warn!("motor limits read failed; using defaults");
            self.info.motor_limits = [[0, 64_000, 4_000, 60_000]; 2];
        }

        for m in 0..2 {
            let l = self.info.motor_limits[m];
            self.motors[m].limits = MotorLimits {
                min: l[0],
                max: l[1],
                lower: l[2],
                upper: l[3],
            };
        }
        for m in 0..2 {
            let line = self.mgl_frame(m);
            sink.send_line(&line);
        }
    }

    /// `MGL,idx,min,max,lower,upper,minCap,maxCap,pos,pct,cap,EN`
    pub fn mgl_frame(&mut self, m: usize) -> String {
        let l = self.motors[m].limits;
        let (min_cap, max_cap) = (self.motors[m].min_cap, self.motors[m].max_cap);
        let pos = self.motors[m].position();
        let pct = self.motors[m].position_percent();
        let cap = self.motors[m].capacitance();
        format!(
            "MGL,{m},{},{},{},{},{min_cap},{max_cap},{pos},{pct},{cap},EN",
            l.min, l.max, l.lower, l.upper
        )
    }

    pub fn load_motor_caps(&mut self) {
        let mut raw = [0u8; 16];
        if self.fram_read(store::ADDR_MOTOR_CAPS, &mut raw).is_ok() {
            let mut flat = [0i32; 4];
            store::decode_i32s(&raw, &mut flat);
            for m in 0..2 {
                if flat[m * 2] < flat[m * 2 + 1] {
                    self.info.motor_caps[m] = [flat[m * 2], flat[m * 2 + 1]];
                } else {
                    tracing::warn!(motor = m, "loaded cap band inverted; using defaults");
                    self.info.motor_caps[m] = [0, 100_000];
                }
            }
        } else {
            tracing::warn!("motor caps read failed; using defaults");
            self.info.motor_caps = [[0, 100_000]; 2];
        }
        for m in 0..2 {
            self.motors[m].min_cap = self.info.motor_caps[m][0];
            self.motors[m].max_cap = self.info.motor_caps[m][1];
        }
    }

    pub fn load_fit_coeffs(&mut self, sink: &mut impl FrameSink) {
        let mut raw = [0u8; 32];
        if self.fram_read(store::ADDR_MOTOR_FIT_COEFFS, &mut raw).is_ok() {
            let mut flat = [0.0f32; 8];
            store::decode_f32s(&raw, &mut flat);
            for m in 0..2 {
                let coeffs = [flat[m * 4], flat[m * 4 + 1], flat[m * 4 + 2], flat[m * 4 + 3]];
                if coeffs.iter().all(|c| c.is_finite()) {
                    self.info.motor_fit_coeffs[m] = coeffs;
                } else {
                    tracing::warn!(motor = m, "loaded fit coefficients not finite; clearing");
                    self.info.motor_fit_coeffs[m] = [0.0; 4];
                }
            }
        } else {
            tracing::warn!("fit coefficients read failed; clearing");
            self.info.motor_fit_coeffs = [[0.0; 4]; 2];
        }
        for m in 0..2 {
            self.motors[m].fit_coeffs = self.info.motor_fit_coeffs[m];
            let c = self.info.motor_fit_coeffs[m];
            sink.send_line(&format!(
                "MFC,{m},{},{},{},{},EN",
                protocol::fixed6(c[0]),
                protocol::fixed6(c[1]),
                protocol::fixed6(c[2]),
                protocol::fixed6(c[3])
            ));
        }
    }

    pub fn load_stream_rates(&mut self, sink: &mut impl FrameSink) {
        let mut raw = [0u8; 12];
        if self.fram_read(store::ADDR_STREAM_SETTINGS, &mut raw).is_ok() {
            let mut flat = [0i32; 3];
            store::decode_i32s(&raw, &mut flat);
            self.info.stream_rates = StreamRates {
                imp_ms: store::validate_stream_rate(flat[0]),
                vi_ms: store::validate_stream_rate(flat[1]),
                pos_ms: store::validate_stream_rate(flat[2]),
            };
        } else {
            tracing::warn!("stream rates read failed; using defaults");
            self.info.stream_rates = StreamRates::default();
        }
        let r = self.info.stream_rates;
        sink.send_line(&format!("SST,{},{},EN", r.imp_ms, r.vi_ms));
        sink.send_line(&format!("MST,{},EN", r.pos_ms));
    }

    pub fn load_vswr(&mut self, sink: &mut impl FrameSink) {
        let mut raw = [0u8; 12];
        if self.fram_read(store::ADDR_VSWR_SETTINGS, &mut raw).is_ok() {
            let mut flat = [0.0f32; 3];
            store::decode_f32s(&raw, &mut flat);
            self.info.vswr = store::validate_vswr(flat);
        } else {
            tracing::warn!("vswr thresholds read failed; using defaults");
            self.info.vswr = Default::default();
        }
        let v = self.info.vswr;
        sink.send_line(&format!(
            "VSW,{},{},{},EN",
            protocol::fixed6(v.start),
            protocol::fixed6(v.stop),
            protocol::fixed6(v.restart)
        ));
    }

    pub fn load_ams(&mut self, sink: &mut impl FrameSink) {
        let mut raw = [0u8; 12];
        if self.fram_read(store::ADDR_AMS_SETTINGS, &mut raw).is_ok() {
            let mut flat = [0i32; 3];
            store::decode_i32s(&raw, &mut flat);
            self.info.ams = store::validate_ams(flat);
        } else {
            tracing::warn!("ams settings read failed; using defaults");
            self.info.ams = AmsSettings::default();
        }
        let a = self.info.ams;
        sink.send_line(&format!(
            "AST,{},{},{},EN",
            a.interval_ms, a.timeout_ms, a.log_interval
        ));
    }

    // ---- boot homing -------------------------------------------------------

    /// Index-referenced boot sequence for one motor: rewind to the
    /// physical stop, arm origin-on-index with the saved position, then
    /// move slowly forward so the fabric snaps the origin as the first
    /// index passes.
    pub fn init_by_index(&mut self, motor: usize) -> bool {
        let saved = self.info.first_index_pos[motor];
        tracing::info!(motor, saved, "index-referenced init start");

        let rewound = self.motors[motor].rewind();
        if !rewound.completed {
            tracing::warn!(motor, final_pos = rewound.final_pos, "rewind did not stall");
        }

        self.motors[motor].set_origin_on_index(saved);
        self.clock.sleep(Duration::from_millis(10));

        let search = self.motors[motor].find_index(INDEX_SEARCH_TARGET, REWIND_RPM);
        if !search.found {
            tracing::error!(motor, "encoder index not found during init");
            return false;
        }
        self.clock.sleep(Duration::from_millis(10));
        tracing::info!(
            motor,
            index_pos = search.index_pos,
            final_pos = search.final_pos,
            "index-referenced init complete"
        );
        true
    }
}

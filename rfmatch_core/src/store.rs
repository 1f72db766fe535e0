//! FRAM record schema.
//!
//! The store is a byte-addressable non-volatile array behind the motion
//! bus; the offset table below IS the schema. Records are fixed-size,
//! little-endian, written in chunks of at most 32 bytes with a short
//! inter-chunk delay. Loads validate each numeric field against its own
//! range and substitute the documented default when a field is out of
//! range or the read fails.

use rfmatch_traits::{Clock, HwResult, MotionBus};
use std::time::Duration;

pub const ADDR_MODEL: u16 = 0x0000;
pub const ADDR_DATE: u16 = 0x0020;
pub const ADDR_SERIAL: u16 = 0x0030;
pub const ADDR_INPUT_CAL: u16 = 0x0050;
pub const ADDR_OUTPUT_CAL: u16 = 0x005C;
pub const ADDR_INDEX_POS: u16 = 0x0068;
pub const ADDR_MOTOR_LIMITS: u16 = 0x00E8;
pub const ADDR_STREAM_SETTINGS: u16 = 0x0108;
pub const ADDR_MOTOR_CAPS: u16 = 0x011C;
pub const ADDR_MOTOR_FIT_COEFFS: u16 = 0x012C;
pub const ADDR_VSWR_SETTINGS: u16 = 0x014C;
pub const ADDR_AMS_SETTINGS: u16 = 0x0158;
/// First unused byte.
pub const FRAM_USED_BYTES: u16 = 0x0164;

pub const MODEL_LEN: usize = 32;
pub const DATE_LEN: usize = 16;
pub const SERIAL_LEN: usize = 32;

/// Largest transfer the FRAM transport accepts in one write.
pub const WRITE_CHUNK: usize = 32;
const INTER_CHUNK_DELAY: Duration = Duration::from_millis(5);

// Stream rates, milliseconds.
pub const STREAM_RATE_MIN: i32 = 10;
pub const STREAM_RATE_MAX: i32 = 5000;
pub const STREAM_RATE_DEFAULT: i32 = 100;

// VSWR thresholds.
pub const VSWR_START_RANGE: (f32, f32) = (1.0, 10.0);
pub const VSWR_STOP_RANGE: (f32, f32) = (1.0, 5.0);
pub const VSWR_RESTART_RANGE: (f32, f32) = (1.0, 10.0);
pub const VSWR_START_DEFAULT: f32 = 1.04;
pub const VSWR_STOP_DEFAULT: f32 = 1.02;
pub const VSWR_RESTART_DEFAULT: f32 = 1.04;

// AMS settings.
pub const AMS_INTERVAL_RANGE: (i32, i32) = (1, 1000);
pub const AMS_TIMEOUT_MAX: i32 = 60_000;
pub const AMS_LOG_INTERVAL_RANGE: (i32, i32) = (1, 1000);
pub const AMS_INTERVAL_DEFAULT: i32 = 10;
pub const AMS_TIMEOUT_DEFAULT: i32 = 0;
pub const AMS_LOG_INTERVAL_DEFAULT: i32 = 10;

/// VSWR hysteresis thresholds for the auto-match loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VswrThresholds {
    pub start: f32,
    pub stop: f32,
    pub restart: f32,
}

impl Default for VswrThresholds {
    fn default() -> Self {
        Self {
            start: VSWR_START_DEFAULT,
            stop: VSWR_STOP_DEFAULT,
            restart: VSWR_RESTART_DEFAULT,
        }
    }
}

/// Stream emission rates, milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRates {
    pub imp_ms: i32,
    pub vi_ms: i32,
    pub pos_ms: i32,
}

impl Default for StreamRates {
    fn default() -> Self {
        Self {
            imp_ms: STREAM_RATE_DEFAULT,
            vi_ms: STREAM_RATE_DEFAULT,
            pos_ms: STREAM_RATE_DEFAULT,
        }
    }
}

/// Auto-match loop pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsSettings {
    pub interval_ms: i32,
    /// 0 disables the timeout.
    pub timeout_ms: i32,
    pub log_interval: i32,
}

impl Default for AmsSettings {
    fn default() -> Self {
        Self {
            interval_ms: AMS_INTERVAL_DEFAULT,
            timeout_ms: AMS_TIMEOUT_DEFAULT,
            log_interval: AMS_LOG_INTERVAL_DEFAULT,
        }
    }
}

/// Everything the controller persists, mirrored in RAM.
#[derive(Debug, Clone, PartialEq)]
pub struct MatcherInfo {
    pub model: String,
    pub date: String,
    pub serial: String,
    /// v_gain, i_gain, phase offset in degrees, per sensor.
    pub input_cal: [f32; 3],
    pub output_cal: [f32; 3],
    /// First encoder index position per motor slot.
    pub first_index_pos: [i32; 32],
    /// Per motor: min, max, lower, upper.
    pub motor_limits: [[i32; 4]; 2],
    pub stream_rates: StreamRates,
    /// Per motor: min_cap, max_cap in pF x 100.
    pub motor_caps: [[i32; 2]; 2],
    /// Per motor: normalised cubic a0..a3.
    pub motor_fit_coeffs: [[f32; 4]; 2],
    pub vswr: VswrThresholds,
    pub ams: AmsSettings,
}

impl Default for MatcherInfo {
    fn default() -> Self {
        Self {
            model: String::new(),
            date: String::new(),
            serial: String::new(),
            input_cal: [1.0, 1.0, 0.0],
            output_cal: [1.0, 1.0, 0.0],
            first_index_pos: [0; 32],
            motor_limits: [[0, 64_000, 4_000, 60_000]; 2],
            stream_rates: StreamRates::default(),
            motor_caps: [[0, 100_000]; 2],
            motor_fit_coeffs: [[0.0; 4]; 2],
            vswr: VswrThresholds::default(),
            ams: AmsSettings::default(),
        }
    }
}

/// Clamp a loaded stream rate to its range, default when outside.
pub fn validate_stream_rate(value: i32) -> i32 {
    if (STREAM_RATE_MIN..=STREAM_RATE_MAX).contains(&value) {
        value
    } else {
        STREAM_RATE_DEFAULT
    }
}

/// Each threshold is checked against its own range.
pub fn validate_vswr(raw: [f32; 3]) -> VswrThresholds {
    let pick = |v: f32, (lo, hi): (f32, f32), default| {
        if v.is_finite() && v >= lo && v <= hi { v } else { default }
    };
    VswrThresholds {
        start: pick(raw[0], VSWR_START_RANGE, VSWR_START_DEFAULT),
        stop: pick(raw[1], VSWR_STOP_RANGE, VSWR_STOP_DEFAULT),
        restart: pick(raw[2], VSWR_RESTART_RANGE, VSWR_RESTART_DEFAULT),
    }
}

/// Each field is checked against its own range.
pub fn validate_ams(raw: [i32; 3]) -> AmsSettings {
    let interval_ms = if (AMS_INTERVAL_RANGE.0..=AMS_INTERVAL_RANGE.1).contains(&raw[0]) {
        raw[0]
    } else {
        AMS_INTERVAL_DEFAULT
    };
    let timeout_ms = if (0..=AMS_TIMEOUT_MAX).contains(&raw[1]) {
        raw[1]
    } else {
        AMS_TIMEOUT_DEFAULT
    };
    let log_interval = if (AMS_LOG_INTERVAL_RANGE.0..=AMS_LOG_INTERVAL_RANGE.1).contains(&raw[2]) {
        raw[2]
    } else {
        AMS_LOG_INTERVAL_DEFAULT
    };
    AmsSettings {
        interval_ms,
        timeout_ms,
        log_interval,
    }
}

/// Write a record, splitting above the 32-byte chunk boundary with a
/// short delay between chunks.
pub fn write_record<B: MotionBus>(
    bus: &mut B,
    clock: &dyn Clock,
    addr: u16,
    bytes: &[u8],
) -> HwResult<()> {
    let mut cursor = addr;
    let mut chunks = bytes.chunks(WRITE_CHUNK).peekable();
    while let Some(chunk) = chunks.next() {
        bus.fram_write(cursor, chunk)?;
        cursor = cursor.wrapping_add(chunk.len() as u16);
        if chunks.peek().is_some() {
            clock.sleep(INTER_CHUNK_DELAY);
        }
    }
    Ok(())
}

pub fn read_record<B: MotionBus>(bus: &mut B, addr: u16, buf: &mut [u8]) -> HwResult<()> {
    bus.fram_read(addr, buf)
}

/// Fixed-width, NUL-padded string bytes.
pub fn encode_str(s: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let bytes = s.as_bytes();
    let take = bytes.len().min(len - 1);
    out[..take].copy_from_slice(&bytes[..take]);
    out
}

/// Decode a NUL-padded string field; non-UTF-8 content decodes lossily.
pub fn decode_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn encode_f32s(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_f32s(bytes: &[u8], out: &mut [f32]) {
    for (i, slot) in out.iter_mut().enumerate() {
        let mut b = [0u8; 4];
        b.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
        *slot = f32::from_le_bytes(b);
    }
}

pub fn encode_i32s(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_i32s(bytes: &[u8], out: &mut [i32]) {
    for (i, slot) in out.iter_mut().enumerate() {
        let mut b = [0u8; 4];
        b.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
        *slot = i32::from_le_bytes(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfmatch_traits::{HwResult, ManualClock};
    use std::collections::VecDeque;

    /// In-memory FRAM with a write log to observe chunking.
    struct MemBus {
        mem: Vec<u8>,
        write_sizes: VecDeque<usize>,
    }

    impl MemBus {
        fn new() -> Self {
            Self {
                mem: vec![0; 0x200],
                write_sizes: VecDeque::new(),
            }
        }
    }

    impl MotionBus for MemBus {
        fn write_reg(&mut self, _spi: u8, _reg: u8, _value: u16) -> HwResult<()> {
            Ok(())
        }
        fn read_reg(&mut self, _spi: u8, _reg: u8) -> HwResult<u16> {
            Ok(0)
        }
        fn read_status(&mut self, _spi: u8) -> HwResult<[u16; 8]> {
            Ok([0; 8])
        }
        fn reset_driver(&mut self, _spi: u8) -> HwResult<()> {
            Ok(())
        }
        fn set_sleep(&mut self, _spi: u8, _level: bool) -> HwResult<()> {
            Ok(())
        }
        fn set_hw_reset(&mut self, _spi: u8, _level: bool) -> HwResult<()> {
            Ok(())
        }
        fn fram_read(&mut self, addr: u16, buf: &mut [u8]) -> HwResult<()> {
            let a = addr as usize;
            buf.copy_from_slice(&self.mem[a..a + buf.len()]);
            Ok(())
        }
        fn fram_write(&mut self, addr: u16, data: &[u8]) -> HwResult<()> {
            let a = addr as usize;
            self.mem[a..a + data.len()].copy_from_slice(data);
            self.write_sizes.push_back(data.len());
            Ok(())
        }
    }

    #[test]
    fn record_round_trips_byte_for_byte() {
        let mut bus = MemBus::new();
        let clock = ManualClock::new();
        let payload: Vec<u8> = (0u8..=127).collect();
        write_record(&mut bus, &clock, ADDR_INDEX_POS, &payload).unwrap();

        let mut back = vec![0u8; payload.len()];
        read_record(&mut bus, ADDR_INDEX_POS, &mut back).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn writes_split_at_the_chunk_boundary() {
        let mut bus = MemBus::new();
        let clock = ManualClock::new();
        write_record(&mut bus, &clock, 0, &[0xAA; 70]).unwrap();
        assert_eq!(Vec::from(bus.write_sizes.clone()), vec![32, 32, 6]);
        // Two inter-chunk delays of 5 ms each.
        assert_eq!(clock.elapsed_ms(), 10);

        bus.write_sizes.clear();
        write_record(&mut bus, &clock, 0x40, &[0x55; 32]).unwrap();
        assert_eq!(Vec::from(bus.write_sizes.clone()), vec![32]);
    }

    #[test]
    fn string_codec_pads_and_truncates() {
        let bytes = encode_str("MAT-50R", MODEL_LEN);
        assert_eq!(bytes.len(), MODEL_LEN);
        assert_eq!(decode_str(&bytes), "MAT-50R");

        let long = "x".repeat(64);
        let bytes = encode_str(&long, MODEL_LEN);
        assert_eq!(decode_str(&bytes).len(), MODEL_LEN - 1);
    }

    #[test]
    fn numeric_codecs_round_trip() {
        let floats = [1.5f32, -0.25, 3.25e6, 0.0];
        let mut back = [0.0f32; 4];
        decode_f32s(&encode_f32s(&floats), &mut back);
        assert_eq!(back, floats);

        let ints = [i32::MIN, -1, 0, 64_000];
        let mut back = [0i32; 4];
        decode_i32s(&encode_i32s(&ints), &mut back);
        assert_eq!(back, ints);
    }

    #[test]
    fn vswr_fields_validate_independently() {
        // Middle field out of range: only it falls back to its default.
        let v = validate_vswr([2.0, 7.0, 3.0]);
        assert_eq!(v.start, 2.0);
        assert_eq!(v.stop, VSWR_STOP_DEFAULT);
        assert_eq!(v.restart, 3.0);

        let v = validate_vswr([f32::NAN, 1.01, 99.0]);
        assert_eq!(v.start, VSWR_START_DEFAULT);
        assert_eq!(v.stop, 1.01);
        assert_eq!(v.restart, VSWR_RESTART_DEFAULT);
    }

    #[test]
    fn ams_fields_validate_independently() {
        let a = validate_ams([500, -3, 2000]);
        assert_eq!(a.interval_ms, 500);
        assert_eq!(a.timeout_ms, AMS_TIMEOUT_DEFAULT);
        assert_eq!(a.log_interval, AMS_LOG_INTERVAL_DEFAULT);
    }

    #[test]
    fn stream_rate_bounds() {
        assert_eq!(validate_stream_rate(10), 10);
        assert_eq!(validate_stream_rate(5000), 5000);
        assert_eq!(validate_stream_rate(9), STREAM_RATE_DEFAULT);
        assert_eq!(validate_stream_rate(5001), STREAM_RATE_DEFAULT);
    }

    #[test]
    fn schema_offsets_do_not_overlap() {
        let spans = [
            (ADDR_MODEL, MODEL_LEN),
            (ADDR_DATE, DATE_LEN),
            (ADDR_SERIAL, SERIAL_LEN),
            (ADDR_INPUT_CAL, 12),
            (ADDR_OUTPUT_CAL, 12),
            (ADDR_INDEX_POS, 128),
            (ADDR_MOTOR_LIMITS, 32),
            (ADDR_STREAM_SETTINGS, 12),
            (ADDR_MOTOR_CAPS, 16),
            (ADDR_MOTOR_FIT_COEFFS, 32),
            (ADDR_VSWR_SETTINGS, 12),
            (ADDR_AMS_SETTINGS, 12),
        ];
        for w in spans.windows(2) {
            let (addr, len) = w[0];
            let (next, _) = w[1];
            assert!(
                addr as usize + len <= next as usize,
                "record at {addr:#06x} overlaps {next:#06x}"
            );
        }
        let (last, len) = spans[spans.len() - 1];
        assert_eq!(last as usize + len, FRAM_USED_BYTES as usize);
    }
}

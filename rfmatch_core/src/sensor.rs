//! RF sensor acquisition.
//!
//! Each sensor owns four FFT-bin arrays written continuously by the DSP
//! fabric. A coherent reading freezes the writers (hold), averages the
//! last `k` bins backwards from the fabric's write index, applies the
//! multiplicative calibration and derives R, X, |V|, |I| and phase from
//! the auto- and cross-spectra.

use rfmatch_traits::{HwResult, SensorFabric};

/// Bins per channel in the memory-mapped buffers.
pub const FFT_LEN: usize = 1024;

/// Bounded number of status polls while waiting for hold acknowledge.
const HOLD_POLL_BUDGET: u32 = 100;

/// Magnitudes below this are treated as the small positive floor.
const MAG_FLOOR: f64 = 1e-12;

/// Relay pulser command bits (one-hot SET/RESET pairs).
pub const RELAY_COM_SET: u16 = 1 << 0;
pub const RELAY_COM_RESET: u16 = 1 << 1;
pub const RELAY_AC1_SET: u16 = 1 << 2;
pub const RELAY_AC1_RESET: u16 = 1 << 3;
pub const RELAY_G1_SET: u16 = 1 << 4;
pub const RELAY_G1_RESET: u16 = 1 << 5;
pub const RELAY_AC2_SET: u16 = 1 << 6;
pub const RELAY_AC2_RESET: u16 = 1 << 7;
pub const RELAY_G2_SET: u16 = 1 << 8;
pub const RELAY_G2_RESET: u16 = 1 << 9;

/// AC coupling, low gain (±1 V). Power-on default.
pub const RELAY_AC_ON_LOW_GAIN: u16 =
    RELAY_AC1_SET | RELAY_AC2_SET | RELAY_G1_RESET | RELAY_G2_RESET;
/// DC coupling, low gain.
pub const RELAY_AC_OFF_LOW_GAIN: u16 =
    RELAY_AC1_RESET | RELAY_AC2_RESET | RELAY_G1_RESET | RELAY_G2_RESET;

const DEFAULT_AVG_COUNT: usize = 512;

/// Per-sensor calibration. Gains are multiplicative; the phase offset is
/// stored in radians and subtracted from the raw cross-spectrum phase.
#[derive(Debug, Clone, Copy)]
pub struct SensorCalibration {
    pub v_gain: f32,
    pub i_gain: f32,
    pub phase_offset_rad: f32,
}

impl Default for SensorCalibration {
    fn default() -> Self {
        Self {
            v_gain: 1.0,
            i_gain: 1.0,
            phase_offset_rad: 0.0,
        }
    }
}

/// One impedance reading. Produced atomically, never mutated after return.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImpedanceSample {
    pub r: f32,
    pub x: f32,
    pub z_mag: f32,
    pub v_mag: f32,
    pub i_mag: f32,
    pub phase_deg: f32,
}

/// Which channel a spectrum dump reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpectrumChannel {
    Voltage,
    Current,
}

/// One RF sensor: fabric access plus calibration and averaging state.
pub struct RfSensor<F: SensorFabric> {
    fabric: F,
    cal: SensorCalibration,
    avg_count: usize,
    fft_len: usize,
}

impl<F: SensorFabric> RfSensor<F> {
    pub fn new(fabric: F) -> Self {
        Self {
            fabric,
            cal: SensorCalibration::default(),
            avg_count: DEFAULT_AVG_COUNT,
            fft_len: FFT_LEN,
        }
    }

    /// Bring up the ADC frontend.
    pub fn init_frontend(&mut self) -> HwResult<()> {
        self.fabric.init_frontend()
    }

    pub fn avg_count(&self) -> usize {
        self.avg_count
    }

    /// Stored window size, clamped to `[1, fft_len]`.
    pub fn set_avg_count(&mut self, count: usize) {
        self.avg_count = count.clamp(1, self.fft_len);
    }

    pub fn calibration(&self) -> SensorCalibration {
        self.cal
    }

    pub fn set_v_gain(&mut self, gain: f32) {
        self.cal.v_gain = gain;
    }

    pub fn set_i_gain(&mut self, gain: f32) {
        self.cal.i_gain = gain;
    }

    pub fn set_phase_offset_rad(&mut self, radians: f32) {
        self.cal.phase_offset_rad = radians;
    }

    pub fn set_phase_offset_deg(&mut self, degrees: f32) {
        self.cal.phase_offset_rad = degrees.to_radians();
    }

    pub fn phase_offset_deg(&self) -> f32 {
        self.cal.phase_offset_rad.to_degrees()
    }

    /// Select AC or DC input coupling (low-gain range either way).
    pub fn set_coupling_ac(&mut self, ac: bool) {
        let mask = if ac {
            RELAY_AC_ON_LOW_GAIN
        } else {
            RELAY_AC_OFF_LOW_GAIN
        };
        self.fabric.pulse_relay(mask);
    }

    /// Restore gains, phase, averaging and relays to power-on values.
    pub fn reset_settings(&mut self) {
        self.avg_count = DEFAULT_AVG_COUNT;
        self.cal = SensorCalibration::default();
        self.fabric.set_hold(false);
        self.fabric.set_spectrum_mode(false);
        self.fabric.pulse_relay(RELAY_AC_ON_LOW_GAIN);
    }

    /// Poll the status word until both the voltage- and current-side hold
    /// flags acknowledge, within the poll budget. Returns the two write
    /// indexes on success.
    fn wait_for_hold(&mut self) -> Option<(u32, u32)> {
        let mut budget = HOLD_POLL_BUDGET;
        while budget > 0 {
            let sv = self.fabric.hold_status();
            let si = self.fabric.hold_status();
            if sv.held && si.held {
                return Some((sv.write_index, si.write_index));
            }
            budget -= 1;
        }
        None
    }

    /// Windowed impedance measurement.
    ///
    /// Averages `avg_count` bins (or the stored count when `None`) ending
    /// at the fabric's write index, under hold. A hold timeout yields a
    /// zeroed sample; the hold is always released.
    pub fn sample(&mut self, avg_count: Option<usize>) -> ImpedanceSample {
        let k = avg_count.unwrap_or(self.avg_count).clamp(1, self.fft_len);
        let n = self.fft_len;

        self.fabric.set_hold(true);
        let Some((index_v, index_i)) = self.wait_for_hold() else {
            self.fabric.set_hold(false);
            tracing::warn!("hold acknowledge timed out; returning zero sample");
            return ImpedanceSample::default();
        };

        let start_v = (index_v as usize + n - k) % n;
        let start_i = (index_i as usize + n - k) % n;

        // Raw accumulation in f64: FFT magnitudes squared overflow f32
        // quickly at large window sizes.
        let mut sum_vv = 0.0f64;
        let mut sum_ii = 0.0f64;
        let mut sum_cross_re = 0.0f64;
        let mut sum_cross_im = 0.0f64;

        for j in 0..k {
            let (v_re, v_im) = self.fabric.read_voltage_bin((start_v + j) % n);
            let (i_re, i_im) = self.fabric.read_current_bin((start_i + j) % n);
            let (v_re, v_im) = (f64::from(v_re), f64::from(v_im));
            let (i_re, i_im) = (f64::from(i_re), f64::from(i_im));

            sum_vv += v_re * v_re + v_im * v_im;
            sum_ii += i_re * i_re + i_im * i_im;
            // Cross-spectrum V * conj(I)
            sum_cross_re += v_re * i_re + v_im * i_im;
            sum_cross_im += v_im * i_re - v_re * i_im;
        }

        self.fabric.set_hold(false);

        let inv_count = 1.0 / k as f64;
        let fft_norm = 1.0 / n as f64;
        let g_v = f64::from(self.cal.v_gain);
        let g_i = f64::from(self.cal.i_gain);

        let avg_vv = sum_vv * inv_count;
        let avg_ii = sum_ii * inv_count;

        // |Z| from the ratio of auto-spectra; the 1/N factors cancel.
        let denom = (avg_ii * g_i * g_i).max(MAG_FLOOR);
        let z_mag = ((avg_vv * g_v * g_v) / denom).sqrt();

        let cross_re = sum_cross_re * inv_count * g_v * g_i;
        let cross_im = sum_cross_im * inv_count * g_v * g_i;
        let phase_rad = cross_im.atan2(cross_re) - f64::from(self.cal.phase_offset_rad);
        let phase_deg = phase_rad.to_degrees();

        // R and X from the rounded-for-output phase, so the pair printed
        // on the wire is self-consistent.
        let phase_back = (phase_deg as f32).to_radians();
        let z_mag_f = z_mag as f32;

        // The 1/N factor converts FFT-bin magnitude to time-domain
        // amplitude.
        let v_mag = (avg_vv.sqrt() * fft_norm * g_v) as f32;
        let i_mag = (avg_ii.sqrt() * fft_norm * g_i) as f32;

        ImpedanceSample {
            r: z_mag_f * phase_back.cos(),
            x: z_mag_f * phase_back.sin(),
            z_mag: z_mag_f,
            v_mag,
            i_mag,
            phase_deg: phase_deg as f32,
        }
    }

    /// Full-spectrum magnitude dump: all `fft_len` bins of one channel,
    /// `|X[k]|/N`, read in full-FFT mode under hold. Non-finite or
    /// overflowing magnitudes are squashed to zero. The filtered mode is
    /// restored before returning.
    pub fn spectrum(&mut self, channel: SpectrumChannel) -> Vec<f32> {
        let n = self.fft_len;
        let scale = 1.0f32 / n as f32;
        let mut out = vec![0.0f32; n];

        self.fabric.set_spectrum_mode(true);
        self.fabric.set_hold(true);
        if self.wait_for_hold().is_none() {
            tracing::warn!("hold acknowledge timed out; reading spectrum anyway");
        }

        for (idx, slot) in out.iter_mut().enumerate() {
            let (re, im) = match channel {
                SpectrumChannel::Voltage => self.fabric.read_voltage_bin(idx),
                SpectrumChannel::Current => self.fabric.read_current_bin(idx),
            };
            let mag = (re * re + im * im).sqrt() * scale;
            *slot = if mag.is_finite() && mag < 1e38 { mag } else { 0.0 };
        }

        self.fabric.set_hold(false);
        self.fabric.set_spectrum_mode(false);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfmatch_traits::{HoldStatus, HwResult};

    /// Fabric stub with programmable bins and a hold handshake that can
    /// be told to never acknowledge.
    struct StubFabric {
        v: Vec<(f32, f32)>,
        i: Vec<(f32, f32)>,
        write_index: u32,
        held: bool,
        ack_hold: bool,
    }

    impl StubFabric {
        fn constant(v: (f32, f32), i: (f32, f32)) -> Self {
            Self {
                v: vec![v; FFT_LEN],
                i: vec![i; FFT_LEN],
                write_index: 0,
                held: false,
                ack_hold: true,
            }
        }

        fn ramps() -> Self {
            let v = (0..FFT_LEN)
                .map(|k| (k as f32, 0.5 * k as f32))
                .collect::<Vec<_>>();
            let i = (0..FFT_LEN)
                .map(|k| (1.0 + k as f32 * 0.25, 0.0))
                .collect::<Vec<_>>();
            Self {
                v,
                i,
                write_index: 123,
                held: false,
                ack_hold: true,
            }
        }
    }

    impl SensorFabric for StubFabric {
        fn set_hold(&mut self, hold: bool) {
            self.held = hold && self.ack_hold;
        }
        fn hold_status(&mut self) -> HoldStatus {
            HoldStatus {
                held: self.held,
                write_index: self.write_index,
            }
        }
        fn read_voltage_bin(&mut self, index: usize) -> (f32, f32) {
            self.v[index]
        }
        fn read_current_bin(&mut self, index: usize) -> (f32, f32) {
            self.i[index]
        }
        fn set_spectrum_mode(&mut self, _full_fft: bool) {}
        fn pulse_relay(&mut self, _command_mask: u16) {}
        fn init_frontend(&mut self) -> HwResult<()> {
            Ok(())
        }
    }

    #[test]
    fn constant_bins_give_expected_ratio() {
        let mut sensor = RfSensor::new(StubFabric::constant((2.0, 0.0), (1.0, 0.0)));
        let s = sensor.sample(Some(64));
        assert!((s.z_mag - 2.0).abs() < 1e-5);
        assert!((s.r - 2.0).abs() < 1e-5);
        assert!(s.x.abs() < 1e-5);
        assert!(s.phase_deg.abs() < 1e-5);
        let expected_v = 2.0 / FFT_LEN as f32;
        assert!((s.v_mag - expected_v).abs() < 1e-9);
    }

    #[test]
    fn sample_is_deterministic_on_ramps() {
        let mut a = RfSensor::new(StubFabric::ramps());
        let mut b = RfSensor::new(StubFabric::ramps());
        let sa = a.sample(Some(FFT_LEN));
        let sb = b.sample(Some(FFT_LEN));
        assert_eq!(sa, sb);
        assert_eq!(sa, a.sample(Some(FFT_LEN)));
    }

    #[test]
    fn boundary_window_sizes_stay_finite() {
        for count in [0usize, 1, FFT_LEN, FFT_LEN + 1] {
            let mut sensor = RfSensor::new(StubFabric::ramps());
            let s = sensor.sample(Some(count));
            for v in [s.r, s.x, s.z_mag, s.v_mag, s.i_mag, s.phase_deg] {
                assert!(v.is_finite(), "non-finite output for count {count}");
            }
        }
    }

    #[test]
    fn hold_timeout_yields_zero_sample_and_releases() {
        let mut fabric = StubFabric::constant((1.0, 0.0), (1.0, 0.0));
        fabric.ack_hold = false;
        let mut sensor = RfSensor::new(fabric);
        let s = sensor.sample(Some(16));
        assert_eq!(s, ImpedanceSample::default());
    }

    #[test]
    fn zero_current_hits_magnitude_floor_without_nan() {
        let mut sensor = RfSensor::new(StubFabric::constant((1.0, 0.0), (0.0, 0.0)));
        let s = sensor.sample(Some(8));
        assert!(s.z_mag.is_finite());
        assert!(s.z_mag > 0.0);
    }

    #[test]
    fn phase_offset_is_subtracted() {
        // V leads I by 90 deg: V = (0, 1), I = (1, 0).
        let mut sensor = RfSensor::new(StubFabric::constant((0.0, 1.0), (1.0, 0.0)));
        let raw = sensor.sample(Some(4));
        assert!((raw.phase_deg - 90.0).abs() < 1e-4);

        sensor.set_phase_offset_deg(90.0);
        let adjusted = sensor.sample(Some(4));
        assert!(adjusted.phase_deg.abs() < 1e-4);
    }

    #[test]
    fn gains_scale_magnitudes() {
        let mut sensor = RfSensor::new(StubFabric::constant((1.0, 0.0), (1.0, 0.0)));
        sensor.set_v_gain(2.0);
        sensor.set_i_gain(4.0);
        let s = sensor.sample(Some(4));
        // |Z| = (|V|·gv) / (|I|·gi) = 2/4
        assert!((s.z_mag - 0.5).abs() < 1e-5);
    }

    #[test]
    fn avg_count_setter_clamps() {
        let mut sensor = RfSensor::new(StubFabric::ramps());
        sensor.set_avg_count(0);
        assert_eq!(sensor.avg_count(), 1);
        sensor.set_avg_count(usize::MAX);
        assert_eq!(sensor.avg_count(), FFT_LEN);
    }

    #[test]
    fn spectrum_is_normalised_and_finite() {
        let mut sensor = RfSensor::new(StubFabric::constant((3.0, 4.0), (1.0, 0.0)));
        let mags = sensor.spectrum(SpectrumChannel::Voltage);
        assert_eq!(mags.len(), FFT_LEN);
        let expected = 5.0 / FFT_LEN as f32;
        assert!((mags[0] - expected).abs() < 1e-6);
        assert!(mags.iter().all(|m| m.is_finite()));
    }

    #[test]
    fn reset_restores_defaults() {
        let mut sensor = RfSensor::new(StubFabric::ramps());
        sensor.set_avg_count(7);
        sensor.set_v_gain(3.0);
        sensor.reset_settings();
        assert_eq!(sensor.avg_count(), DEFAULT_AVG_COUNT);
        assert!((sensor.calibration().v_gain - 1.0).abs() < f32::EPSILON);
    }
}

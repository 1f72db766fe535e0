//! Memory-mapped register fabrics.
//!
//! Each accessor is a word-aligned volatile read or write against base
//! addresses owned by the DSP fabric; the core never owns the memory.
//! Register layout per GPIO block: data channel 1 at +0x0, tri channel 1
//! at +0x4, data channel 2 at +0x8, tri channel 2 at +0xC.

use anyhow::Result;
use rfmatch_traits::{HoldStatus, HwResult, MotorFabric, SensorFabric};
use std::time::Duration;

const CH1_DATA: usize = 0;
const CH1_TRI: usize = 1;
const CH2_DATA: usize = 2;
const CH2_TRI: usize = 3;

const FFT_LEN: usize = 1024;

#[inline]
unsafe fn reg_read(base: usize, word: usize) -> u32 {
    unsafe { core::ptr::read_volatile((base as *const u32).add(word)) }
}

#[inline]
unsafe fn reg_write(base: usize, word: usize, value: u32) {
    unsafe { core::ptr::write_volatile((base as *mut u32).add(word), value) }
}

#[inline]
unsafe fn bin_read(base: usize, index: usize) -> f32 {
    unsafe { core::ptr::read_volatile((base as *const f32).add(index)) }
}

/// One sensor's slice of the fabric: four bin arrays plus the gate,
/// spectrum-mode and relay GPIO blocks.
pub struct MmioSensor {
    v_re: usize,
    v_im: usize,
    i_re: usize,
    i_im: usize,
    gate: usize,
    mode: usize,
    relay: usize,
    spi: usize,
}

impl MmioSensor {
    /// # Safety
    ///
    /// Every base must map a live, word-aligned register block of the
    /// documented layout for the lifetime of the returned value.
    pub unsafe fn new(
        v_re: usize,
        v_im: usize,
        i_re: usize,
        i_im: usize,
        gate: usize,
        mode: usize,
        relay: usize,
        spi: usize,
    ) -> Self {
        Self {
            v_re,
            v_im,
            i_re,
            i_im,
            gate,
            mode,
            relay,
            spi,
        }
    }

    /// Configure GPIO directions for the gate, relay and SPI blocks.
    pub fn init_gpio(&mut self) {
        unsafe {
            // SPI: channel 1 command output, channel 2 transfer-done input.
            reg_write(self.spi, CH1_TRI, 0x0000_0000);
            reg_write(self.spi, CH2_TRI, 0xFFFF_FFFF);
            // Relay: strobe + data outputs, idle low.
            reg_write(self.relay, CH1_TRI, 0x0000_0000);
            reg_write(self.relay, CH2_TRI, 0x0000_0000);
            reg_write(self.relay, CH1_DATA, 0x0000_0000);
            reg_write(self.relay, CH2_DATA, 0x0000_0000);
            // Gate: hold output, status input.
            reg_write(self.gate, CH1_TRI, 0x0000_0000);
            reg_write(self.gate, CH2_TRI, 0xFFFF_FFFF);
        }
    }

    fn spi_command(&mut self, value: u32) {
        unsafe {
            reg_write(self.spi, CH1_DATA, value);
        }
        // Transfer-done poll, bounded; timing jitter is absorbed by the
        // settle sleep that follows.
        for _ in 0..1000 {
            if unsafe { reg_read(self.spi, CH2_DATA) } != 0 {
                break;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl SensorFabric for MmioSensor {
    fn set_hold(&mut self, hold: bool) {
        unsafe { reg_write(self.gate, CH1_DATA, u32::from(hold)) }
    }

    fn hold_status(&mut self) -> HoldStatus {
        let status = unsafe { reg_read(self.gate, CH2_DATA) };
        HoldStatus {
            held: status & 0x8000_0000 != 0,
            write_index: status & 0x7FFF_FFFF,
        }
    }

    fn read_voltage_bin(&mut self, index: usize) -> (f32, f32) {
        let index = index % FFT_LEN;
        unsafe { (bin_read(self.v_re, index), bin_read(self.v_im, index)) }
    }

    fn read_current_bin(&mut self, index: usize) -> (f32, f32) {
        let index = index % FFT_LEN;
        unsafe { (bin_read(self.i_re, index), bin_read(self.i_im, index)) }
    }

    fn set_spectrum_mode(&mut self, full_fft: bool) {
        unsafe {
            reg_write(self.mode, CH1_TRI, 0x0000_0000);
            let current = reg_read(self.mode, CH1_DATA);
            let next = if full_fft { current | 1 } else { current & !1 };
            reg_write(self.mode, CH1_DATA, next);
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    fn pulse_relay(&mut self, command_mask: u16) {
        unsafe {
            reg_write(self.relay, CH2_DATA, u32::from(command_mask));
            reg_write(self.relay, CH1_DATA, 1);
        }
        std::thread::sleep(Duration::from_micros(10));
        unsafe { reg_write(self.relay, CH1_DATA, 0) }
    }

    fn init_frontend(&mut self) -> HwResult<()> {
        self.init_gpio();
        // Interleave enable, two's complement, CMOS output; then the
        // per-channel offset registers.
        const COMMON: [u32; 4] = [0x8000_0503, 0x0000_0000, 0x8000_1421, 0x0000_0000];
        std::thread::sleep(Duration::from_millis(100));
        for value in COMMON {
            self.spi_command(value);
        }
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }
}

/// Mode-select input: bit 0 of channel 1 picks the interactive shell.
pub struct MmioModePin {
    base: usize,
}

impl MmioModePin {
    /// # Safety
    ///
    /// `base` must map a live GPIO block of the documented layout for the
    /// lifetime of the returned value.
    pub unsafe fn new(base: usize) -> Self {
        unsafe { reg_write(base, CH1_TRI, 0xFFFF_FFFF) }
        Self { base }
    }

    pub fn is_interactive(&self) -> bool {
        unsafe { reg_read(self.base, CH1_DATA) } & 1 != 0
    }
}

/// One stepper's register fabric: target/origin outputs, position/rpm
/// inputs and the extended index/override block.
pub struct MmioMotor {
    out_base: usize,
    in_base: usize,
    ext_base: usize,
}

impl MmioMotor {
    /// # Safety
    ///
    /// The three bases must map live register blocks of the documented
    /// layout for the lifetime of the returned value.
    pub unsafe fn new(out_base: usize, in_base: usize, ext_base: usize) -> Result<Self> {
        let mut fabric = Self {
            out_base,
            in_base,
            ext_base,
        };
        fabric.init_gpio();
        Ok(fabric)
    }

    fn init_gpio(&mut self) {
        unsafe {
            // Target + origin outputs.
            reg_write(self.out_base, CH1_TRI, 0x0000_0000);
            reg_write(self.out_base, CH2_TRI, 0x0000_0000);
            // Position + rpm inputs.
            reg_write(self.in_base, CH1_TRI, 0xFFFF_FFFF);
            reg_write(self.in_base, CH2_TRI, 0xFFFF_FFFF);
            // Index/stall input, override-rpm output.
            reg_write(self.ext_base, CH1_TRI, 0xFFFF_FFFF);
            reg_write(self.ext_base, CH2_TRI, 0x0000_0000);
            reg_write(self.ext_base, CH2_DATA, 0);
        }
    }
}

impl MotorFabric for MmioMotor {
    fn write_target(&mut self, target: i32) {
        unsafe { reg_write(self.out_base, CH1_DATA, target as u32) }
    }

    fn write_origin_word(&mut self, word: u32) {
        unsafe { reg_write(self.out_base, CH2_DATA, word) }
    }

    fn read_position_raw(&mut self) -> u32 {
        unsafe { reg_read(self.in_base, CH1_DATA) }
    }

    fn read_rpm(&mut self) -> u32 {
        unsafe { reg_read(self.in_base, CH2_DATA) }
    }

    fn read_index_position(&mut self) -> i32 {
        (unsafe { reg_read(self.ext_base, CH1_DATA) } & 0x7FFF_FFFF) as i32
    }

    fn stall_flag(&mut self) -> bool {
        unsafe { reg_read(self.ext_base, CH1_DATA) } & 0x8000_0000 != 0
    }

    fn set_override_rpm(&mut self, rpm: u32) {
        unsafe { reg_write(self.ext_base, CH2_DATA, rpm) }
    }
}

//! I2C motion bus over rppal.
//!
//! Wire protocol of the companion board: one command byte, then command
//! arguments. FRAM reads answer with a one-byte header before the
//! payload; every FRAM command needs a short processing delay between
//! the send and the readback.

use crate::error::HwError;
use anyhow::{Context, Result};
use rfmatch_traits::{HwResult, MotionBus};
use rppal::i2c::I2c;
use std::time::Duration;

const CMD_READ_REG: u8 = 0x01;
const CMD_WRITE_REG: u8 = 0x02;
const CMD_GET_STATUS: u8 = 0x04;
const CMD_RESET: u8 = 0x05;
const CMD_SET_SLEEP: u8 = 0x06;
const CMD_SET_HW_RESET: u8 = 0x07;
const CMD_FRAM_READ: u8 = 0x08;
const CMD_FRAM_WRITE: u8 = 0x09;

/// Command processing time on the companion before a readback.
const POST_SEND_DELAY: Duration = Duration::from_millis(5);

/// Largest FRAM payload per transfer; the store layer chunks above this.
const FRAM_MAX_TRANSFER: usize = 32;

pub struct I2cMotionBus {
    i2c: I2c,
}

impl I2cMotionBus {
    /// Open the bus and address the companion board.
    pub fn try_new(bus: u8, address: u16) -> Result<Self> {
        let mut i2c = I2c::with_bus(bus).context("open I2C bus")?;
        i2c.set_slave_address(address)
            .context("set companion address")?;
        Ok(Self { i2c })
    }

    fn send(&mut self, bytes: &[u8]) -> HwResult<()> {
        self.i2c
            .write(bytes)
            .map_err(|e| Box::new(HwError::I2c(e.to_string())) as Box<dyn std::error::Error + Send + Sync>)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> HwResult<()> {
        self.i2c
            .read(buf)
            .map_err(|e| Box::new(HwError::I2c(e.to_string())) as Box<dyn std::error::Error + Send + Sync>)?;
        Ok(())
    }

    fn expect_ok(&mut self) -> HwResult<()> {
        let mut status = [0u8; 1];
        self.recv(&mut status)?;
        if status[0] == 0 {
            Ok(())
        } else {
            Err(Box::new(HwError::Nak))
        }
    }
}

impl MotionBus for I2cMotionBus {
    fn write_reg(&mut self, spi: u8, reg: u8, value: u16) -> HwResult<()> {
        let [lo, hi] = value.to_le_bytes();
        self.send(&[CMD_WRITE_REG, spi, reg, lo, hi])?;
        self.expect_ok()
    }

    fn read_reg(&mut self, spi: u8, reg: u8) -> HwResult<u16> {
        self.send(&[CMD_READ_REG, spi, reg])?;
        let mut raw = [0u8; 2];
        self.recv(&mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    fn read_status(&mut self, spi: u8) -> HwResult<[u16; 8]> {
        self.send(&[CMD_GET_STATUS, spi])?;
        let mut raw = [0u8; 16];
        self.recv(&mut raw)?;
        let mut regs = [0u16; 8];
        for (i, r) in regs.iter_mut().enumerate() {
            *r = u16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
        }
        Ok(regs)
    }

    fn reset_driver(&mut self, spi: u8) -> HwResult<()> {
        self.send(&[CMD_RESET, spi])?;
        self.expect_ok()
    }

    fn set_sleep(&mut self, spi: u8, level: bool) -> HwResult<()> {
        self.send(&[CMD_SET_SLEEP, spi, u8::from(level)])?;
        self.expect_ok()
    }

    fn set_hw_reset(&mut self, spi: u8, level: bool) -> HwResult<()> {
        self.send(&[CMD_SET_HW_RESET, spi, u8::from(level)])?;
        self.expect_ok()
    }

    fn fram_read(&mut self, addr: u16, buf: &mut [u8]) -> HwResult<()> {
        // Transfers are bounded by the companion's buffer; split long
        // reads the same way the store splits writes.
        let mut cursor = addr;
        for chunk in buf.chunks_mut(FRAM_MAX_TRANSFER) {
            let [hi, lo] = cursor.to_be_bytes();
            self.send(&[CMD_FRAM_READ, hi, lo, chunk.len() as u8])?;
            std::thread::sleep(POST_SEND_DELAY);

            // The payload follows a one-byte header.
            let mut raw = vec![0u8; chunk.len() + 1];
            self.recv(&mut raw)?;
            chunk.copy_from_slice(&raw[1..]);
            cursor = cursor.wrapping_add(chunk.len() as u16);
        }
        Ok(())
    }

    fn fram_write(&mut self, addr: u16, data: &[u8]) -> HwResult<()> {
        if data.len() > FRAM_MAX_TRANSFER {
            return Err(Box::new(HwError::Address(addr)));
        }
        let [hi, lo] = addr.to_be_bytes();
        let mut frame = Vec::with_capacity(4 + data.len());
        frame.extend_from_slice(&[CMD_FRAM_WRITE, hi, lo, data.len() as u8]);
        frame.extend_from_slice(data);
        self.send(&frame)?;
        std::thread::sleep(POST_SEND_DELAY);
        self.expect_ok()
    }
}

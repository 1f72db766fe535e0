//! Line-oriented command shell.
//!
//! A line is at most 16 whitespace-separated tokens of at most 63 bytes,
//! case-folded to lower case. The first token is the opcode; families are
//! `d*` (device + FRAM), `r*` (RF sensor), `m*` (motor) and `a*`
//! (auto-match). Every command answers with a result frame or an
//! `ACK,<op>,<status>` line; missing arguments produce a usage line.

use crate::ams::Ams;
use crate::board::{DriverSettings, MotionBoard};
use crate::matching::{MatchingAlgorithm, vswr};
use crate::motor::MotorLimits;
use crate::protocol::{self, fixed6};
use crate::sensor::{RfSensor, SpectrumChannel};
use crate::store;
use crate::stream::StreamEngine;
use rfmatch_traits::{Clock, FrameSink, MotionBus, MotorFabric, SensorFabric};
use std::sync::Arc;
use std::time::Instant;

const MAX_TOKENS: usize = 16;
const MAX_TOKEN_BYTES: usize = 63;
const FRAM_BACKUP_DEFAULT: usize = 0x150;
const FRAM_BACKUP_MAX: usize = 2048;
const FRAM_BACKUP_MIN: usize = 16;
const FRAM_RESTORE_MAX: usize = 512;

/// What the main loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellOutcome {
    Continue,
    /// `da`: hand control back to the legacy auto-match mode.
    LeaveShell,
}

/// The interactive controller aggregate: both sensors, the motion board,
/// the solver, the auto-match loop and the report streams, all writing
/// frames into one sink.
pub struct Shell<S, B, F, K>
where
    S: SensorFabric,
    B: MotionBus,
    F: MotorFabric,
    K: FrameSink,
{
    pub input: RfSensor<S>,
    pub output: RfSensor<S>,
    pub board: MotionBoard<B, F>,
    pub algo: MatchingAlgorithm,
    pub ams: Ams,
    pub streams: StreamEngine,
    pub sink: K,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
}

impl<S, B, F, K> Shell<S, B, F, K>
where
    S: SensorFabric,
    B: MotionBus,
    F: MotorFabric,
    K: FrameSink,
{
    pub fn new(
        input: RfSensor<S>,
        output: RfSensor<S>,
        board: MotionBoard<B, F>,
        sink: K,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        let epoch = clock.now();
        Self {
            input,
            output,
            board,
            algo: MatchingAlgorithm::new(),
            ams: Ams::default(),
            streams: StreamEngine::default(),
            sink,
            clock,
            epoch,
        }
    }

    /// Milliseconds on the shared shell clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.ms_since(self.epoch)
    }

    /// Restore all FRAM records and take over their stream rates.
    pub fn load_persisted_state(&mut self) {
        self.board
            .load_all(&mut self.input, &mut self.output, &mut self.sink);
        self.streams.apply_rates(self.board.info.stream_rates);
    }

    /// One cooperative iteration: streams first, then the auto-match
    /// loop. Commands are dispatched separately by the caller.
    pub fn tick(&mut self) {
        let now = self.now_ms();
        self.streams.tick(
            now,
            &mut self.input,
            &mut self.output,
            &mut self.board,
            &mut self.sink,
        );
        self.ams.tick(
            now,
            &mut self.input,
            &mut self.output,
            &mut self.board,
            &self.algo,
            &mut self.sink,
        );
    }

    /// Leaving the interactive mode stops every stream and resets the
    /// auto-match loop.
    pub fn leave_interactive(&mut self) {
        self.streams.disable_all();
        self.ams.stop();
    }

    /// Parse and dispatch one received line.
    pub fn handle_line(&mut self, line: &str) -> ShellOutcome {
        let tokens = tokenize(line);
        if tokens.is_empty() {
            return ShellOutcome::Continue;
        }
        self.sink.send_line(&format!("> {}", tokens.join(" ")));

        let op = tokens[0].as_str();
        match op {
            "dh" | "da" | "dsi" | "dgi" | "dfb" | "dfr" | "dfw" => self.handle_device(&tokens),
            "ri" | "rrs" | "rf" | "rrv" | "rz" | "rk" | "rr" | "rsc" | "rgc" | "rsa" | "rga" => {
                self.handle_rf(&tokens);
                ShellOutcome::Continue
            }
            "mi" | "mr" | "mf" | "mo" | "mgp" | "mrp" | "mss" | "msg" | "msc" | "mst" | "mgs"
            | "msl" | "mgl" | "mfc" | "msd" | "mgi" | "mor" | "mfi" | "moi" | "mrw" | "mis"
            | "msw" | "mhr" => {
                self.handle_motor(&tokens);
                ShellOutcome::Continue
            }
            "amc" | "amg" | "amr" | "ams" | "asv" | "agv" | "ass" | "ags" => {
                self.handle_automatch(&tokens);
                ShellOutcome::Continue
            }
            other => {
                self.sink.send_line(&format!("Unknown command: {other}"));
                protocol::send_ack(&mut self.sink, other, "UNKNOWN");
                ShellOutcome::Continue
            }
        }
    }

    fn ack(&mut self, op: &str, status: &str) {
        protocol::send_ack(&mut self.sink, op, status);
    }

    fn usage(&mut self, text: &str) {
        self.sink.send_line(&format!("Usage: {text}"));
    }

    fn sensor_mut(&mut self, is_input: bool) -> &mut RfSensor<S> {
        if is_input { &mut self.input } else { &mut self.output }
    }

    // ---- device commands ---------------------------------------------------

    fn handle_device(&mut self, argv: &[String]) -> ShellOutcome {
        match argv[0].as_str() {
            "dh" => {
                self.print_help();
                ShellOutcome::Continue
            }
            "da" => {
                self.sink.send_line("Switching to auto matching mode");
                self.leave_interactive();
                self.ack("da", "OK");
                ShellOutcome::LeaveShell
            }
            "dsi" => {
                self.cmd_dsi(argv);
                ShellOutcome::Continue
            }
            "dgi" => {
                let info = &self.board.info;
                let line = format!("DGI,{},{},{},EN", info.model, info.date, info.serial);
                self.sink.send_line(&line);
                ShellOutcome::Continue
            }
            "dfb" => {
                self.cmd_dfb(argv);
                ShellOutcome::Continue
            }
            "dfr" => {
                self.cmd_dfr(argv);
                ShellOutcome::Continue
            }
            "dfw" => {
                self.cmd_dfw(argv);
                ShellOutcome::Continue
            }
            _ => ShellOutcome::Continue,
        }
    }

    fn cmd_dsi(&mut self, argv: &[String]) {
        let Some(arg) = argv.get(1) else {
            self.usage("dsi model,date,serial");
            return;
        };
        let parts: Vec<&str> = arg.splitn(3, ',').collect();
        if parts.len() != 3 {
            self.ack("dsi", "PARSE");
            return;
        }
        self.board.info.model = parts[0].to_owned();
        self.board.info.date = parts[1].to_owned();
        self.board.info.serial = parts[2].to_owned();
        match self.board.save_product_info() {
            Ok(()) => self.ack("dsi", "OK"),
            Err(e) => {
                tracing::error!(error = %e, "product info save failed");
                self.ack("dsi", "SAVE_FAIL");
            }
        }
    }

    fn cmd_dfb(&mut self, argv: &[String]) {
        let len = argv
            .get(1)
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(FRAM_BACKUP_DEFAULT)
            .clamp(FRAM_BACKUP_MIN, FRAM_BACKUP_MAX);

        let mut hex = String::with_capacity(len * 2);
        let mut buf = [0u8; store::WRITE_CHUNK];
        let mut addr = 0usize;
        while addr < len {
            let take = (len - addr).min(store::WRITE_CHUNK);
            if self
                .board
                .fram_read(addr as u16, &mut buf[..take])
                .is_err()
            {
                self.sink
                    .send_line(&format!("FRAM read failed at {addr:#06x}"));
                self.ack("dfb", "FAIL");
                return;
            }
            for b in &buf[..take] {
                hex.push_str(&format!("{b:02X}"));
            }
            addr += take;
        }
        self.sink.send_line(&format!("DFB,{len},{hex},EN"));
    }

    fn cmd_dfr(&mut self, argv: &[String]) {
        let (Some(len_tok), Some(hex_tok)) = (argv.get(1), argv.get(2)) else {
            self.usage("dfr len hex");
            return;
        };
        let Some(expected) = len_tok.parse::<usize>().ok() else {
            self.ack("dfr", "PARSE");
            return;
        };
        let Some(bytes) = parse_hex_bytes(hex_tok) else {
            self.ack("dfr", "PARSE");
            return;
        };
        if bytes.len() > FRAM_RESTORE_MAX {
            self.ack("dfr", "RANGE");
            return;
        }
        if bytes.len() != expected {
            self.sink.send_line(&format!(
                "Expected {expected} bytes, got {}",
                bytes.len()
            ));
        }
        match self.board.fram_write(0, &bytes) {
            Ok(()) => self.ack("dfr", "OK"),
            Err(e) => {
                tracing::error!(error = %e, "FRAM restore failed");
                self.ack("dfr", "FAIL");
            }
        }
    }

    fn cmd_dfw(&mut self, argv: &[String]) {
        let (Some(addr_tok), Some(data_tok)) = (argv.get(1), argv.get(2)) else {
            self.usage("dfw addr_hex data_hex");
            return;
        };
        let Some(addr) = u16::from_str_radix(addr_tok, 16).ok() else {
            self.ack("dfw", "PARSE");
            return;
        };
        let Some(mut bytes) = parse_hex_bytes(data_tok) else {
            self.ack("dfw", "PARSE");
            return;
        };
        bytes.truncate(64);
        if bytes.is_empty() {
            self.ack("dfw", "PARSE");
            return;
        }
        match self.board.fram_write(addr, &bytes) {
            Ok(()) => self.ack("dfw", "OK"),
            Err(_) => self.ack("dfw", "FAIL"),
        }
    }

    // ---- RF sensor commands ------------------------------------------------

    fn handle_rf(&mut self, argv: &[String]) {
        let op = argv[0].clone();
        let selected = argv.get(1).and_then(|t| match t.as_str() {
            "i" => Some(true),
            "o" => Some(false),
            _ => None,
        });

        match op.as_str() {
            "ri" => {
                let Some(is_input) = selected else {
                    self.usage("ri [i|o]");
                    return;
                };
                match self.sensor_mut(is_input).init_frontend() {
                    Ok(()) => self.ack("ri", "OK"),
                    Err(e) => {
                        tracing::error!(error = %e, "frontend init failed");
                        self.ack("ri", "FAIL");
                    }
                }
            }
            "rrs" | "rrv" => {
                let Some(is_input) = selected else {
                    self.usage("rrs|rrv [i|o] [run|stop] [rate_ms]");
                    return;
                };
                let Some(mode) = argv.get(2) else {
                    self.usage("rrs|rrv [i|o] [run|stop] [rate_ms]");
                    return;
                };
                let run = mode == "run";
                let rate = argv.get(3).and_then(|t| t.parse::<i32>().ok());
                let channel = match (op.as_str(), is_input) {
                    ("rrs", true) => &mut self.streams.imp_input,
                    ("rrs", false) => &mut self.streams.imp_output,
                    (_, true) => &mut self.streams.vi_input,
                    (_, false) => &mut self.streams.vi_output,
                };
                if let Some(rate) = rate
                    && run
                    && (store::STREAM_RATE_MIN..=store::STREAM_RATE_MAX).contains(&rate)
                {
                    channel.rate_ms = rate as u64;
                }
                channel.enabled = run;
                self.ack(&op, if run { "RUN" } else { "STOP" });
            }
            "rf" => {
                let Some(is_input) = selected else {
                    self.usage("rf [i|o]");
                    return;
                };
                let voltage = self.sensor_mut(is_input).spectrum(SpectrumChannel::Voltage);
                let opcode = if is_input { "FI" } else { "FO" };
                protocol::send_spectrum(&mut self.sink, opcode, &voltage);
                let current = self.sensor_mut(is_input).spectrum(SpectrumChannel::Current);
                let opcode = if is_input { "CI" } else { "CO" };
                protocol::send_spectrum(&mut self.sink, opcode, &current);
            }
            "rz" => {
                let Some(is_input) = selected else {
                    self.usage("rz [i|o] [avg]");
                    return;
                };
                let avg = argv.get(2).and_then(|t| t.parse::<usize>().ok());
                let s = self.sensor_mut(is_input).sample(avg);
                protocol::send_impedance(
                    &mut self.sink,
                    is_input,
                    s.r,
                    s.x,
                    s.v_mag,
                    s.i_mag,
                    s.phase_deg,
                );
            }
            "rk" => {
                let (Some(is_input), Some(coupling)) = (selected, argv.get(2)) else {
                    self.usage("rk [i|o] [ac|dc]");
                    return;
                };
                let ac = coupling == "ac";
                self.sensor_mut(is_input).set_coupling_ac(ac);
                self.ack("rk", if ac { "AC" } else { "DC" });
            }
            "rr" => {
                let Some(is_input) = selected else {
                    self.usage("rr [i|o]");
                    return;
                };
                self.sensor_mut(is_input).reset_settings();
                self.ack("rr", "OK");
            }
            "rsc" => self.cmd_rsc(argv, selected),
            "rgc" => {
                let Some(is_input) = selected else {
                    self.usage("rgc [i|o]");
                    return;
                };
                let cal = self.sensor_mut(is_input).calibration();
                let phase_deg = self.sensor_mut(is_input).phase_offset_deg();
                let tag = if is_input { "i" } else { "o" };
                let line = format!(
                    "RGC,{tag},{},{},{},EN",
                    fixed6(cal.v_gain),
                    fixed6(cal.i_gain),
                    fixed6(phase_deg)
                );
                self.sink.send_line(&line);
            }
            "rsa" => {
                let (Some(is_input), Some(count_tok)) = (selected, argv.get(2)) else {
                    self.usage("rsa [i|o] [count]");
                    return;
                };
                match count_tok.parse::<usize>() {
                    Ok(count) if (1..=512).contains(&count) => {
                        self.sensor_mut(is_input).set_avg_count(count);
                        self.ack("rsa", "OK");
                    }
                    Ok(_) => self.ack("rsa", "RANGE"),
                    Err(_) => self.ack("rsa", "PARSE"),
                }
            }
            "rga" => {
                let Some(is_input) = selected else {
                    self.usage("rga [i|o]");
                    return;
                };
                let count = self.sensor_mut(is_input).avg_count();
                let tag = if is_input { "i" } else { "o" };
                self.sink.send_line(&format!("RGA,{tag},{count},EN"));
            }
            _ => {}
        }
    }

    fn cmd_rsc(&mut self, argv: &[String], selected: Option<bool>) {
        let (Some(is_input), Some(kind), Some(value_tok)) = (selected, argv.get(2), argv.get(3))
        else {
            self.usage("rsc [i|o] [v|i|p] [value]");
            return;
        };
        let Ok(value) = value_tok.parse::<f32>() else {
            self.ack("rsc", "PARSE");
            return;
        };
        if !value.is_finite() {
            self.ack("rsc", "RANGE");
            return;
        }
        let slot = match kind.as_str() {
            "v" => 0,
            "i" => 1,
            "p" => 2,
            _ => {
                self.usage("rsc [i|o] [v|i|p] [value]");
                return;
            }
        };
        {
            let sensor = self.sensor_mut(is_input);
            match slot {
                0 => sensor.set_v_gain(value),
                1 => sensor.set_i_gain(value),
                _ => sensor.set_phase_offset_deg(value),
            }
        }
        let cal = if is_input {
            &mut self.board.info.input_cal
        } else {
            &mut self.board.info.output_cal
        };
        cal[slot] = value;
        match self.board.save_calibration() {
            Ok(()) => self.ack("rsc", "OK_SAVED"),
            Err(e) => {
                tracing::error!(error = %e, "calibration save failed");
                self.ack("rsc", "OK_SAVE_FAIL");
            }
        }
    }

    // ---- motor commands ----------------------------------------------------

    fn motor_index(&mut self, argv: &[String], usage: &str) -> Option<usize> {
        match argv.get(1).map(|t| t.parse::<usize>()) {
            Some(Ok(idx)) if idx < 2 => Some(idx),
            Some(_) => {
                self.sink.send_line("Invalid motor index (0 or 1)");
                None
            }
            None => {
                self.usage(usage);
                None
            }
        }
    }

    fn handle_motor(&mut self, argv: &[String]) {
        match argv[0].as_str() {
            "mi" => {
                let Some(idx) = self.motor_index(argv, "mi [0|1]") else {
                    return;
                };
                match self.board.init_motor(idx) {
                    Ok(()) => self.ack("mi", "OK"),
                    Err(e) => {
                        tracing::error!(error = %e, motor = idx, "driver init failed");
                        self.ack("mi", "FAIL");
                    }
                }
            }
            "mr" | "mf" => {
                let op = argv[0].clone();
                let Some(idx) = self.motor_index(argv, "mr|mf [0|1] [position]") else {
                    return;
                };
                let Some(pos) = argv.get(2).and_then(|t| t.parse::<i32>().ok()) else {
                    self.ack(&op, "PARSE");
                    return;
                };
                if op == "mr" {
                    self.board.motors[idx].run_to(pos);
                } else {
                    self.board.motors[idx].run_to_force(pos);
                }
                self.ack(&op, "OK");
            }
            "mo" | "moi" => {
                let op = argv[0].clone();
                let Some(idx) = self.motor_index(argv, "mo|moi [0|1] [position]") else {
                    return;
                };
                let pos = argv
                    .get(2)
                    .and_then(|t| t.parse::<i32>().ok())
                    .unwrap_or(0);
                if op == "mo" {
                    self.board.motors[idx].set_origin(pos);
                } else {
                    self.board.motors[idx].set_origin_on_index(pos);
                }
                self.ack(&op, "OK");
            }
            "mgp" => {
                let Some(idx) = self.motor_index(argv, "mgp [0|1]") else {
                    return;
                };
                let pos = self.board.motors[idx].position();
                let pct = self.board.motors[idx].position_percent();
                self.sink.send_line(&format!("MGP,{idx},{pos},{pct},EN"));
            }
            "mrp" => {
                let Some(mode) = argv.get(1) else {
                    self.usage("mrp [run|stop] [rate_ms]");
                    return;
                };
                let run = mode == "run";
                if let Some(rate) = argv.get(2).and_then(|t| t.parse::<i32>().ok())
                    && run
                    && (store::STREAM_RATE_MIN..=store::STREAM_RATE_MAX).contains(&rate)
                {
                    self.streams.motor_pos.rate_ms = rate as u64;
                }
                self.streams.motor_pos.enabled = run;
                self.ack("mrp", if run { "RUN" } else { "STOP" });
            }
            "mss" => self.cmd_mss(argv),
            "msg" => {
                let r = self.board.info.stream_rates;
                self.sink.send_line(&format!("SST,{},{},EN", r.imp_ms, r.vi_ms));
                self.sink.send_line(&format!("MST,{},EN", r.pos_ms));
            }
            "msc" | "mst" => {
                let op = argv[0].clone();
                let Some(idx) = self.motor_index(argv, "msc|mst [0|1] [value]") else {
                    return;
                };
                let Some(value) = argv.get(2).and_then(|t| t.parse::<u16>().ok()) else {
                    self.ack(&op, "PARSE");
                    return;
                };
                let result = if op == "msc" {
                    self.board.set_ctrl_reg(idx, value)
                } else {
                    self.board.set_torque(idx, value)
                };
                match result {
                    Ok(()) => self.ack(&op, "OK"),
                    Err(_) => self.ack(&op, "FAIL"),
                }
            }
            "mgs" => {
                let Some(idx) = self.motor_index(argv, "mgs [0|1]") else {
                    return;
                };
                match self.board.driver_status(idx) {
                    Ok(regs) => {
                        let fields: Vec<String> =
                            regs.iter().map(|r| format!("{r:04X}")).collect();
                        self.sink
                            .send_line(&format!("MGS,{idx},{},EN", fields.join(",")));
                    }
                    Err(_) => self.ack("mgs", "FAIL"),
                }
            }
            "msl" => self.cmd_msl(argv),
            "mgl" => {
                let Some(idx) = self.motor_index(argv, "mgl [0|1]") else {
                    return;
                };
                let line = self.board.mgl_frame(idx);
                self.sink.send_line(&line);
            }
            "mfc" => self.cmd_mfc(argv),
            "msd" => self.cmd_msd(argv),
            "mgi" => {
                let Some(idx) = self.motor_index(argv, "mgi [0|1]") else {
                    return;
                };
                let index_pos = self.board.motors[idx].index_position();
                let stall = i32::from(self.board.motors[idx].stall_flag());
                self.sink
                    .send_line(&format!("MXI,{idx},{index_pos},{stall},EN"));
            }
            "mor" => {
                let Some(idx) = self.motor_index(argv, "mor [0|1] [rpm]") else {
                    return;
                };
                match argv.get(2).map(|t| t.parse::<u32>()) {
                    None => {
                        let rpm = self.board.motors[idx].override_rpm();
                        self.sink.send_line(&format!("MOR,{idx},{rpm},EN"));
                    }
                    Some(Ok(rpm)) => {
                        self.board.motors[idx].set_override_rpm(rpm);
                        self.ack("mor", "OK");
                    }
                    Some(Err(_)) => self.ack("mor", "PARSE"),
                }
            }
            "mfi" => {
                let Some(idx) = self.motor_index(argv, "mfi [0|1] [targetPos] [rpm]") else {
                    return;
                };
                let (Some(target), Some(rpm)) = (
                    argv.get(2).and_then(|t| t.parse::<i32>().ok()),
                    argv.get(3).and_then(|t| t.parse::<u32>().ok()),
                ) else {
                    self.usage("mfi [0|1] [targetPos] [rpm]");
                    return;
                };
                let r = self.board.motors[idx].find_index(target, rpm);
                self.sink.send_line(&format!(
                    "MFI,{idx},{},{},{},{},EN",
                    i32::from(r.found),
                    r.index_pos,
                    r.motor_pos_at_index,
                    r.final_pos
                ));
            }
            "mrw" => {
                let Some(idx) = self.motor_index(argv, "mrw [0|1]") else {
                    return;
                };
                let r = self.board.motors[idx].rewind();
                self.sink.send_line(&format!(
                    "MRW,{idx},{},{},{},EN",
                    i32::from(r.completed),
                    r.final_pos,
                    r.movement
                ));
            }
            "mis" => {
                let Some(idx) = self.motor_index(argv, "mis [0|1] [indexPos]") else {
                    return;
                };
                let Some(pos) = argv.get(2).and_then(|t| t.parse::<i32>().ok()) else {
                    self.ack("mis", "PARSE");
                    return;
                };
                match self.board.save_first_index_pos(idx, pos) {
                    Ok(()) => self.ack("mis", "OK"),
                    Err(_) => self.ack("mis", "FAIL"),
                }
            }
            "msw" => {
                let Some(idx) = self.motor_index(argv, "msw [0|1] [0|1]") else {
                    return;
                };
                let Some(level) = argv.get(2).and_then(|t| t.parse::<u8>().ok()) else {
                    self.ack("msw", "PARSE");
                    return;
                };
                match self.board.set_sleep(idx, level != 0) {
                    Ok(()) => self.ack("msw", "OK"),
                    Err(_) => self.ack("msw", "FAIL"),
                }
            }
            "mhr" => {
                let Some(idx) = self.motor_index(argv, "mhr [0|1]") else {
                    return;
                };
                match self.board.hw_reset(idx) {
                    Ok(()) => self.ack("mhr", "OK"),
                    Err(_) => self.ack("mhr", "FAIL"),
                }
            }
            _ => {}
        }
    }

    fn cmd_mss(&mut self, argv: &[String]) {
        let (Some(imp), Some(vi), Some(pos)) = (
            argv.get(1).and_then(|t| t.parse::<i32>().ok()),
            argv.get(2).and_then(|t| t.parse::<i32>().ok()),
            argv.get(3).and_then(|t| t.parse::<i32>().ok()),
        ) else {
            self.usage("mss [impRate] [viRate] [posRate]");
            return;
        };
        let in_range =
            |r: i32| (store::STREAM_RATE_MIN..=store::STREAM_RATE_MAX).contains(&r);
        if !in_range(imp) || !in_range(vi) || !in_range(pos) {
            self.ack("mss", "RANGE");
            return;
        }
        self.board.info.stream_rates = store::StreamRates {
            imp_ms: imp,
            vi_ms: vi,
            pos_ms: pos,
        };
        self.streams.apply_rates(self.board.info.stream_rates);
        match self.board.save_stream_rates() {
            Ok(()) => self.ack("mss", "OK"),
            Err(_) => self.ack("mss", "SAVE_FAIL"),
        }
    }

    fn cmd_msl(&mut self, argv: &[String]) {
        let Some(idx) = self.motor_index(argv, "msl [0|1] [min,max,lower,upper[,minCap,maxCap]]")
        else {
            return;
        };
        let Some(arg) = argv.get(2) else {
            self.usage("msl [0|1] [min,max,lower,upper[,minCap,maxCap]]");
            return;
        };
        let values: Vec<Option<i32>> = arg.split(',').map(|p| p.parse::<i32>().ok()).collect();
        if values.len() < 4 || values.iter().any(Option::is_none) {
            self.ack("msl", "PARSE");
            return;
        }
        let v: Vec<i32> = values.into_iter().flatten().collect();
        let limits = MotorLimits {
            min: v[0],
            max: v[1],
            lower: v[2],
            upper: v[3],
        };
        if limits.validate().is_err() {
            self.ack("msl", "RANGE");
            return;
        }
        let caps = if v.len() >= 6 {
            if v[4] >= v[5] {
                self.ack("msl", "RANGE");
                return;
            }
            Some((v[4], v[5]))
        } else {
            None
        };

        self.board.motors[idx].limits = limits;
        self.board.info.motor_limits[idx] = [limits.min, limits.max, limits.lower, limits.upper];
        let mut save = self.board.save_motor_limits();
        if let Some((min_cap, max_cap)) = caps {
            self.board.info.motor_caps[idx] = [min_cap, max_cap];
            save = save.and(self.board.save_motor_caps());
        }
        match save {
            Ok(()) => self.ack("msl", "OK"),
            Err(_) => self.ack("msl", "SAVE_FAIL"),
        }
    }

    fn cmd_mfc(&mut self, argv: &[String]) {
        let Some(idx) = self.motor_index(argv, "mfc [0|1] [a0,a1,a2,a3]") else {
            return;
        };
        let Some(arg) = argv.get(2) else {
            // Report the current coefficients.
            let c = self.board.motors[idx].fit_coeffs;
            self.sink.send_line(&format!(
                "MFC,{idx},{},{},{},{},EN",
                fixed6(c[0]),
                fixed6(c[1]),
                fixed6(c[2]),
                fixed6(c[3])
            ));
            return;
        };
        let parts: Vec<Option<f32>> = arg.split(',').map(|p| p.parse::<f32>().ok()).collect();
        if parts.len() != 4 || parts.iter().any(Option::is_none) {
            self.ack("mfc", "PARSE");
            return;
        }
        let coeffs: Vec<f32> = parts.into_iter().flatten().collect();
        if coeffs.iter().any(|c| !c.is_finite()) {
            self.ack("mfc", "RANGE");
            return;
        }
        let coeffs = [coeffs[0], coeffs[1], coeffs[2], coeffs[3]];
        self.board.info.motor_fit_coeffs[idx] = coeffs;
        match self.board.save_fit_coeffs() {
            Ok(()) => {
                self.sink.send_line(&format!(
                    "MFC,{idx},{},{},{},{},EN",
                    fixed6(coeffs[0]),
                    fixed6(coeffs[1]),
                    fixed6(coeffs[2]),
                    fixed6(coeffs[3])
                ));
                self.ack("mfc", "OK");
            }
            Err(_) => self.ack("mfc", "SAVE_FAIL"),
        }
    }

    fn cmd_msd(&mut self, argv: &[String]) {
        let Some(idx) = self.motor_index(
            argv,
            "msd [0|1] [standby,disable,ctrl,torque,off,blank,decay,stall,drive]",
        ) else {
            return;
        };
        let Some(arg) = argv.get(2) else {
            self.usage("msd [0|1] [standby,disable,ctrl,torque,off,blank,decay,stall,drive]");
            return;
        };
        let parts: Vec<Option<u16>> = arg.split(',').map(|p| p.parse::<u16>().ok()).collect();
        if parts.len() != 9 || parts.iter().any(Option::is_none) {
            self.ack("msd", "PARSE");
            return;
        }
        let v: Vec<u16> = parts.into_iter().flatten().collect();
        self.board.set_driver_settings(
            idx,
            DriverSettings {
                standby: v[0],
                disable: v[1],
                ctrl: v[2],
                torque: v[3],
                off: v[4],
                blank: v[5],
                decay: v[6],
                stall: v[7],
                drive: v[8],
            },
        );
        self.ack("msd", "OK");
    }

    // ---- auto-match commands -----------------------------------------------

    fn measured_args(&mut self, argv: &[String]) -> Option<(f64, f64, Option<(f64, f64)>)> {
        let (Some(rm), Some(xm)) = (
            argv.get(1).and_then(|t| t.parse::<f64>().ok()),
            argv.get(2).and_then(|t| t.parse::<f64>().ok()),
        ) else {
            return None;
        };
        let output = match (
            argv.get(3).and_then(|t| t.parse::<f64>().ok()),
            argv.get(4).and_then(|t| t.parse::<f64>().ok()),
        ) {
            (Some(rpm), Some(xpm)) => Some((rpm, xpm)),
            _ => None,
        };
        Some((rm, xm, output))
    }

    fn handle_automatch(&mut self, argv: &[String]) {
        match argv[0].as_str() {
            "amc" => self.cmd_amc(argv),
            "amg" => self.cmd_amg(argv),
            "amr" => self.cmd_amr(argv),
            "ams" => self.cmd_ams(argv),
            "asv" => self.cmd_asv(argv),
            "agv" => {
                let v = self.board.info.vswr;
                self.sink.send_line(&format!(
                    "VSW,{},{},{},EN",
                    fixed6(v.start),
                    fixed6(v.stop),
                    fixed6(v.restart)
                ));
                self.ack("agv", "OK");
            }
            "ass" => self.cmd_ass(argv),
            "ags" => {
                let a = self.board.info.ams;
                self.sink.send_line(&format!(
                    "AST,{},{},{},EN",
                    a.interval_ms, a.timeout_ms, a.log_interval
                ));
                self.ack("ags", "OK");
            }
            _ => {}
        }
    }

    fn cmd_amc(&mut self, argv: &[String]) {
        let Some((rm, xm, _)) = self.measured_args(argv) else {
            self.usage("amc <Rm> <Xm> [Rpm] [Xpm]");
            return;
        };
        let vvc0 = f64::from(self.board.motors[0].capacitance()) / 100.0;
        let vvc1 = f64::from(self.board.motors[1].capacitance()) / 100.0;
        let pts = self.algo.impedance_points(rm, xm, vvc0, vvc1);
        let swr = vswr(rm, xm);
        let fields = [
            pts.ra, pts.xa, pts.rb, pts.xb, pts.rc, pts.xc, pts.rd, pts.xd, pts.re, pts.xe,
            pts.rp, pts.xp, swr,
        ];
        let rendered: Vec<String> = fields.iter().map(|f| fixed6(*f as f32)).collect();
        self.sink
            .send_line(&format!("AMC,{},EN", rendered.join(",")));
        self.ack("amc", "OK");
    }

    fn goals_for(
        &mut self,
        rm: f64,
        xm: f64,
        output: Option<(f64, f64)>,
    ) -> crate::matching::MatchingGoals {
        let swr = vswr(rm, xm);
        let use_output = output.is_some() && swr > 2.0;
        let vvc0 = f64::from(self.board.motors[0].capacitance()) / 100.0;
        let vvc1 = f64::from(self.board.motors[1].capacitance()) / 100.0;
        self.algo.matching_goals(
            rm,
            xm,
            vvc0,
            vvc1,
            if use_output { output } else { None },
            &self.board.motors[0],
            &self.board.motors[1],
        )
    }

    fn cmd_amg(&mut self, argv: &[String]) {
        let Some((rm, xm, output)) = self.measured_args(argv) else {
            self.usage("amg <Rm> <Xm> [Rpm] [Xpm]");
            return;
        };
        let goals = self.goals_for(rm, xm, output);
        let s0 = goals.solutions[0];
        let s1 = goals.solutions[1];
        self.sink.send_line(&format!(
            "AMG,{},{},{},{},{},{},{},{},{},{},EN",
            fixed6(s0.vvc0_pf as f32),
            fixed6(s0.vvc1_pf as f32),
            s0.step0,
            s0.step1,
            i32::from(s0.valid),
            fixed6(s1.vvc0_pf as f32),
            fixed6(s1.vvc1_pf as f32),
            s1.step0,
            s1.step1,
            i32::from(s1.valid)
        ));
        self.ack("amg", "OK");
    }

    fn cmd_amr(&mut self, argv: &[String]) {
        let Some((rm, xm, output)) = self.measured_args(argv) else {
            self.usage("amr <Rm> <Xm> [Rpm] [Xpm]");
            return;
        };
        let goals = self.goals_for(rm, xm, output);
        let selected = goals.solutions.iter().enumerate().find(|(_, sol)| {
            if !sol.valid {
                return false;
            }
            let cap0 = (sol.vvc0_pf * 100.0) as i32;
            let cap1 = (sol.vvc1_pf * 100.0) as i32;
            let (l0, l1) = (self.board.motors[0].limits, self.board.motors[1].limits);
            cap0 >= self.board.motors[0].min_cap
                && cap0 <= self.board.motors[0].max_cap
                && cap1 >= self.board.motors[1].min_cap
                && cap1 <= self.board.motors[1].max_cap
                && (l0.lower..=l0.upper).contains(&sol.step0)
                && (l1.lower..=l1.upper).contains(&sol.step1)
        });
        match selected {
            Some((idx, sol)) => {
                let (step0, step1) = (sol.step0, sol.step1);
                self.board.motors[0].run_to(step0);
                self.board.motors[1].run_to(step1);
                self.sink
                    .send_line(&format!("AMR,{idx},{step0},{step1},EN"));
                self.ack("amr", "OK");
            }
            None => self.ack("amr", "NO_VALID_GOAL"),
        }
    }

    fn cmd_ams(&mut self, argv: &[String]) {
        match argv.get(1).map(String::as_str) {
            Some("stop") => {
                self.ams.stop();
                self.ack("ams", "STOP");
            }
            Some("start") => {
                let defaults = self.board.info.ams;
                let interval = argv
                    .get(2)
                    .and_then(|t| t.parse::<i64>().ok())
                    .unwrap_or(i64::from(defaults.interval_ms))
                    .clamp(1, 1000) as u64;
                let timeout = argv
                    .get(3)
                    .and_then(|t| t.parse::<i64>().ok())
                    .unwrap_or(i64::from(defaults.timeout_ms));
                let timeout = if timeout == 0 {
                    0
                } else {
                    timeout.clamp(100, 60_000) as u64
                };
                let log_interval = argv
                    .get(4)
                    .and_then(|t| t.parse::<i64>().ok())
                    .unwrap_or(i64::from(defaults.log_interval))
                    .clamp(1, 1000) as u32;
                let now = self.now_ms();
                self.ams.start(now, interval, timeout, log_interval);
                self.ack("ams", "START");
            }
            _ => self.usage("ams start|stop [interval [timeout [logInterval]]]"),
        }
    }

    fn cmd_asv(&mut self, argv: &[String]) {
        let (Some(start), Some(stop), Some(restart)) = (
            argv.get(1).and_then(|t| t.parse::<f32>().ok()),
            argv.get(2).and_then(|t| t.parse::<f32>().ok()),
            argv.get(3).and_then(|t| t.parse::<f32>().ok()),
        ) else {
            self.usage("asv <start> <stop> <restart>");
            return;
        };
        let in_range = |v: f32, (lo, hi): (f32, f32)| v.is_finite() && v >= lo && v <= hi;
        if !in_range(start, store::VSWR_START_RANGE)
            || !in_range(stop, store::VSWR_STOP_RANGE)
            || !in_range(restart, store::VSWR_RESTART_RANGE)
            || !(stop <= start && start <= restart)
        {
            self.ack("asv", "RANGE");
            return;
        }
        self.board.info.vswr = store::VswrThresholds {
            start,
            stop,
            restart,
        };
        match self.board.save_vswr() {
            Ok(()) => self.ack("asv", "OK"),
            Err(_) => self.ack("asv", "FRAM_ERROR"),
        }
    }

    fn cmd_ass(&mut self, argv: &[String]) {
        let (Some(interval), Some(timeout), Some(log_interval)) = (
            argv.get(1).and_then(|t| t.parse::<i32>().ok()),
            argv.get(2).and_then(|t| t.parse::<i32>().ok()),
            argv.get(3).and_then(|t| t.parse::<i32>().ok()),
        ) else {
            self.usage("ass <interval> <timeout> <logInterval>");
            return;
        };
        if !(1..=1000).contains(&interval)
            || !(timeout == 0 || (100..=60_000).contains(&timeout))
            || !(1..=1000).contains(&log_interval)
        {
            self.ack("ass", "RANGE");
            return;
        }
        self.board.info.ams = store::AmsSettings {
            interval_ms: interval,
            timeout_ms: timeout,
            log_interval,
        };
        match self.board.save_ams() {
            Ok(()) => self.ack("ass", "OK"),
            Err(_) => self.ack("ass", "FRAM_ERROR"),
        }
    }

    fn print_help(&mut self) {
        let help = [
            "=== Command Reference ===",
            "--- Device (d*) ---",
            "da          leave shell (auto matching mode)",
            "dh          this help",
            "dsi m,d,s   set device info",
            "dgi         get device info",
            "dfb [len]   FRAM backup (hex dump)",
            "dfr len hex FRAM restore",
            "dfw addr hex  FRAM write",
            "--- RF Sensor (r*) [i|o] ---",
            "ri  i       init frontend",
            "rrs i run [ms]  impedance stream",
            "rrv i run [ms]  V/I stream",
            "rf  i       spectrum dump",
            "rz  i [avg] single impedance",
            "rk  i ac|dc input coupling",
            "rr  i       reset settings",
            "rsc i v|i|p val  set calibration",
            "rgc i       get calibration",
            "rsa i n     set average count",
            "rga i       get average count",
            "--- Motor (m*) [0|1] ---",
            "mi  0       init driver",
            "mr  0 pos   run to position",
            "mf  0 pos   force run (no limits)",
            "mo  0 [pos] set origin",
            "moi 0 [pos] origin on next index",
            "mgp 0       get position",
            "mrp run [ms]  position stream",
            "mss i v p   set stream rates",
            "msg         get stream rates",
            "msl 0 min,max,lower,upper[,minCap,maxCap]",
            "mgl 0       get limits",
            "mfc 0 [a0,a1,a2,a3]  fit coefficients",
            "msd 0 9-vals  driver settings",
            "msc 0 val   ctrl register",
            "mst 0 val   torque register",
            "mgs 0       driver status",
            "mgi 0       index pos + stall",
            "mor 0 [rpm] override rpm",
            "mfi 0 tgt rpm  find index",
            "mrw 0       rewind to stop",
            "mis 0 pos   save index pos",
            "msw 0 0|1   sleep/wake",
            "mhr 0       hardware reset",
            "--- Auto Matching (a*) ---",
            "amc Rm Xm [Rpm Xpm]  impedance points",
            "amg Rm Xm [Rpm Xpm]  matching goals",
            "amr Rm Xm [Rpm Xpm]  match and move",
            "ams start|stop [int [tout [log]]]",
            "asv s p r   set VSWR thresholds",
            "agv         get VSWR thresholds",
            "ass i t l   set AMS settings",
            "ags         get AMS settings",
        ];
        for line in help {
            self.sink.send_line(line);
        }
    }
}

/// Split into at most 16 lower-cased tokens of at most 63 bytes.
fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace()
        .take(MAX_TOKENS)
        .map(|t| clip(t.to_ascii_lowercase(), MAX_TOKEN_BYTES))
        .collect()
}

/// Byte-bounded truncation that never splits a character.
fn clip(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

fn parse_hex_bytes(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_caps_count_and_length() {
        let line = (0..40).map(|i| format!("tok{i}")).collect::<Vec<_>>().join(" ");
        let tokens = tokenize(&line);
        assert_eq!(tokens.len(), MAX_TOKENS);

        let long = "A".repeat(200);
        let tokens = tokenize(&long);
        assert_eq!(tokens[0].len(), MAX_TOKEN_BYTES);
        assert_eq!(tokens[0], "a".repeat(MAX_TOKEN_BYTES));
    }

    #[test]
    fn tokenizer_folds_case() {
        assert_eq!(tokenize("RSC I V 1.25"), vec!["rsc", "i", "v", "1.25"]);
    }

    #[test]
    fn clip_respects_char_boundaries() {
        let s = "é".repeat(40); // 2 bytes each
        let clipped = clip(s, MAX_TOKEN_BYTES);
        assert!(clipped.len() <= MAX_TOKEN_BYTES);
        assert!(clipped.chars().all(|c| c == 'é'));
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(parse_hex_bytes("00ff10"), Some(vec![0x00, 0xFF, 0x10]));
        assert_eq!(parse_hex_bytes("0"), None);
        assert_eq!(parse_hex_bytes("zz"), None);
        assert_eq!(parse_hex_bytes(""), Some(vec![]));
    }
}

use rfmatch_core::board::MotionBoard;
use rfmatch_core::motor::MotorController;
use rfmatch_core::sensor::RfSensor;
use rfmatch_core::shell::{Shell, ShellOutcome};
use rfmatch_hardware::{SimMotionBus, SimMotor, SimSensor};
use rfmatch_traits::{Clock, ManualClock};
use std::sync::Arc;

type SimShell = Shell<SimSensor, SimMotionBus, SimMotor, Vec<String>>;

struct Rig {
    shell: SimShell,
    input: SimSensor,
    m0: SimMotor,
    bus: SimMotionBus,
    clock: ManualClock,
}

fn rig() -> Rig {
    let clock = ManualClock::new();
    let input = SimSensor::new();
    let output = SimSensor::new();
    let bus = SimMotionBus::new();
    let m0 = SimMotor::new(clock.clone(), 32_000);
    let m1 = SimMotor::new(clock.clone(), 32_000);

    let clock_arc: Arc<dyn Clock + Send + Sync> = Arc::new(clock.clone());
    let shell = Shell::new(
        RfSensor::new(input.clone()),
        RfSensor::new(output.clone()),
        MotionBoard::new(
            bus.clone(),
            MotorController::new(m0.clone(), 0, clock_arc.clone()),
            MotorController::new(m1.clone(), 1, clock_arc.clone()),
            clock_arc.clone(),
        ),
        Vec::new(),
        clock_arc,
    );
    Rig {
        shell,
        input,
        m0,
        bus,
        clock,
    }
}

fn has_line(sink: &[String], needle: &str) -> bool {
    sink.iter().any(|l| l.contains(needle))
}

#[test]
fn rsc_then_rgc_round_trips_at_six_digits() {
    let mut r = rig();
    r.shell.handle_line("rsc i v 1.25");
    assert!(has_line(&r.shell.sink, "ACK,rsc,OK_SAVED"), "{:?}", r.shell.sink);

    r.shell.sink.clear();
    r.shell.handle_line("rgc i");
    assert!(
        has_line(&r.shell.sink, "RGC,i,1.250000,1.000000,0.000000,EN"),
        "{:?}",
        r.shell.sink
    );
}

#[test]
fn commands_are_case_folded() {
    let mut r = rig();
    r.shell.handle_line("RSC I V 2.5");
    assert!(has_line(&r.shell.sink, "ACK,rsc,OK_SAVED"));
}

#[test]
fn missing_arguments_emit_usage() {
    let mut r = rig();
    r.shell.handle_line("rsc");
    assert!(has_line(&r.shell.sink, "Usage: rsc"));
    r.shell.sink.clear();
    r.shell.handle_line("msl 0");
    assert!(has_line(&r.shell.sink, "Usage: msl"));
    r.shell.sink.clear();
    r.shell.handle_line("amg");
    assert!(has_line(&r.shell.sink, "Usage: amg"));
}

#[test]
fn unknown_opcode_is_acked() {
    let mut r = rig();
    r.shell.handle_line("zz 1 2");
    assert!(has_line(&r.shell.sink, "ACK,zz,UNKNOWN"));
}

#[test]
fn da_leaves_the_shell_and_stops_streams() {
    let mut r = rig();
    r.shell.handle_line("rrs i run 100");
    assert!(r.shell.streams.imp_input.enabled);
    let outcome = r.shell.handle_line("da");
    assert_eq!(outcome, ShellOutcome::LeaveShell);
    assert!(!r.shell.streams.imp_input.enabled);
    assert!(!r.shell.ams.enabled);
}

#[test]
fn rz_reports_the_programmed_load() {
    let mut r = rig();
    r.input.set_load(50.0, 0.0);
    r.shell.handle_line("rz i 64");
    let line = r
        .shell
        .sink
        .iter()
        .find(|l| l.starts_with("ZI,"))
        .expect("no ZI frame");
    assert!(line.starts_with("ZI,50.000000,"), "{line}");
    assert!(line.ends_with(",EN"));
}

#[test]
fn rsa_validates_its_range() {
    let mut r = rig();
    r.shell.handle_line("rsa i 513");
    assert!(has_line(&r.shell.sink, "ACK,rsa,RANGE"));
    r.shell.sink.clear();
    r.shell.handle_line("rsa i 256");
    assert!(has_line(&r.shell.sink, "ACK,rsa,OK"));
    r.shell.sink.clear();
    r.shell.handle_line("rga i");
    assert!(has_line(&r.shell.sink, "RGA,i,256,EN"));
}

#[test]
fn msl_rejects_out_of_order_limits() {
    let mut r = rig();
    r.shell.handle_line("msl 0 0,64000,60000,4000");
    assert!(has_line(&r.shell.sink, "ACK,msl,RANGE"));

    r.shell.sink.clear();
    r.shell.handle_line("msl 0 0,64000,5000,59000,0,80000");
    assert!(has_line(&r.shell.sink, "ACK,msl,OK"), "{:?}", r.shell.sink);
    assert_eq!(r.shell.board.motors[0].limits.lower, 5_000);
    assert_eq!(r.shell.board.motors[0].max_cap, 80_000);
}

#[test]
fn mgl_frame_shape() {
    let mut r = rig();
    r.shell.handle_line("mgl 0");
    let line = r
        .shell
        .sink
        .iter()
        .find(|l| l.starts_with("MGL,0,"))
        .expect("no MGL frame");
    let fields: Vec<&str> = line.split(',').collect();
    // MGL,idx,min,max,lower,upper,minCap,maxCap,pos,pct,cap,EN
    assert_eq!(fields.len(), 12);
    assert_eq!(fields[2], "0");
    assert_eq!(fields[3], "64000");
    assert_eq!(*fields.last().unwrap(), "EN");
}

#[test]
fn mfc_set_and_get() {
    let mut r = rig();
    r.shell.handle_line("mfc 0 1.5,100,0,0");
    assert!(has_line(&r.shell.sink, "ACK,mfc,OK"));
    assert!(has_line(&r.shell.sink, "MFC,0,1.500000,100.000000,0.000000,0.000000,EN"));

    r.shell.sink.clear();
    r.shell.handle_line("mfc 0");
    assert!(has_line(&r.shell.sink, "MFC,0,1.500000,100.000000,0.000000,0.000000,EN"));
}

#[test]
fn mr_clamps_into_the_operating_window() {
    let mut r = rig();
    r.shell.handle_line("mr 0 100");
    assert!(has_line(&r.shell.sink, "ACK,mr,OK"));
    assert_eq!(r.m0.last_target(), 4_000);

    r.shell.handle_line("mf 0 100");
    assert_eq!(r.m0.last_target(), 100);
}

#[test]
fn asv_rejects_bad_ordering_and_accepts_good() {
    let mut r = rig();
    r.shell.handle_line("asv 1.04 1.5 1.2");
    assert!(has_line(&r.shell.sink, "ACK,asv,RANGE"));

    r.shell.sink.clear();
    r.shell.handle_line("asv 1.1 1.05 1.3");
    assert!(has_line(&r.shell.sink, "ACK,asv,OK"));

    r.shell.sink.clear();
    r.shell.handle_line("agv");
    assert!(has_line(&r.shell.sink, "VSW,1.100000,1.050000,1.300000,EN"));
}

#[test]
fn ass_then_ags_round_trip() {
    let mut r = rig();
    r.shell.handle_line("ass 20 5000 5");
    assert!(has_line(&r.shell.sink, "ACK,ass,OK"));
    r.shell.sink.clear();
    r.shell.handle_line("ags");
    assert!(has_line(&r.shell.sink, "AST,20,5000,5,EN"));
}

#[test]
fn dsi_then_dgi_round_trip() {
    let mut r = rig();
    r.shell.handle_line("dsi mat-50,2025-11,sn0042");
    assert!(has_line(&r.shell.sink, "ACK,dsi,OK"));
    r.shell.sink.clear();
    r.shell.handle_line("dgi");
    assert!(has_line(&r.shell.sink, "DGI,mat-50,2025-11,sn0042,EN"));
}

#[test]
fn dfw_then_dfb_round_trip() {
    let mut r = rig();
    r.shell.handle_line("dfw 0100 deadbeef");
    assert!(has_line(&r.shell.sink, "ACK,dfw,OK"));
    let snapshot = r.bus.fram_snapshot();
    assert_eq!(&snapshot[0x100..0x104], &[0xDE, 0xAD, 0xBE, 0xEF]);

    r.shell.sink.clear();
    r.shell.handle_line("dfb 512");
    let line = r
        .shell
        .sink
        .iter()
        .find(|l| l.starts_with("DFB,512,"))
        .expect("no DFB frame");
    assert!(line.contains("DEADBEEF"));
}

#[test]
fn dfr_restores_bytes() {
    let mut r = rig();
    r.shell.handle_line("dfr 4 01020304");
    assert!(has_line(&r.shell.sink, "ACK,dfr,OK"));
    assert_eq!(&r.bus.fram_snapshot()[..4], &[1, 2, 3, 4]);

    r.shell.sink.clear();
    r.shell.handle_line("dfr 2 0x");
    assert!(has_line(&r.shell.sink, "ACK,dfr,PARSE"));
}

#[test]
fn amg_emits_two_solutions() {
    let mut r = rig();
    r.shell.handle_line("amg 45 5");
    let line = r
        .shell
        .sink
        .iter()
        .find(|l| l.starts_with("AMG,"))
        .expect("no AMG frame");
    let fields: Vec<&str> = line.split(',').collect();
    // AMG + 2x (vvc0, vvc1, step0, step1, valid) + EN
    assert_eq!(fields.len(), 12);
    assert!(has_line(&r.shell.sink, "ACK,amg,OK"));
}

#[test]
fn amr_moves_both_motors_on_a_valid_goal() {
    let mut r = rig();
    let before = r.m0.last_target();
    r.shell.handle_line("amr 45 5");
    if has_line(&r.shell.sink, "ACK,amr,OK") {
        assert!(has_line(&r.shell.sink, "AMR,"));
        assert_ne!(r.m0.last_target(), before);
    } else {
        assert!(has_line(&r.shell.sink, "ACK,amr,NO_VALID_GOAL"));
    }
}

#[test]
fn amc_reports_thirteen_fields() {
    let mut r = rig();
    r.shell.handle_line("amc 50 0");
    let line = r
        .shell
        .sink
        .iter()
        .find(|l| l.starts_with("AMC,"))
        .expect("no AMC frame");
    let fields: Vec<&str> = line.split(',').collect();
    assert_eq!(fields.len(), 15); // AMC + 13 values + EN
    // Matched load: the trailing VSWR field is 1.0.
    assert_eq!(fields[13], "1.000000");
}

#[test]
fn mrw_homes_to_the_physical_stop() {
    let mut r = rig();
    // Start close to the stop so the stall comes quickly.
    r.m0.set_travel(0, 64_000);
    r.shell.handle_line("mf 0 3840");
    r.clock.advance(std::time::Duration::from_secs(5));
    let _ = r.shell.board.motors[0].position();

    r.shell.sink.clear();
    r.shell.handle_line("mrw 0");
    let line = r
        .shell
        .sink
        .iter()
        .find(|l| l.starts_with("MRW,0,"))
        .expect("no MRW frame");
    let fields: Vec<&str> = line.split(',').collect();
    assert_eq!(fields[2], "1", "rewind did not complete: {line}");
    let final_pos: i32 = fields[3].parse().unwrap();
    let movement: i32 = fields[4].parse().unwrap();
    assert!(final_pos < 3840, "{line}");
    assert!(movement > 0, "{line}");
}

#[test]
fn mfi_finds_the_encoder_index() {
    let mut r = rig();
    r.m0.set_index_phase(500);
    r.shell.handle_line("mf 0 0");
    r.clock.advance(std::time::Duration::from_secs(30));
    let _ = r.shell.board.motors[0].position();

    r.shell.sink.clear();
    r.shell.handle_line("mfi 0 15000 30");
    let line = r
        .shell
        .sink
        .iter()
        .find(|l| l.starts_with("MFI,0,"))
        .expect("no MFI frame");
    let fields: Vec<&str> = line.split(',').collect();
    assert_eq!(fields[2], "1", "index not found: {line}");
    let index_pos: i32 = fields[3].parse().unwrap();
    assert_eq!(index_pos % 6400, 500);
}

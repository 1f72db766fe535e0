use rfmatch_core::board::MotionBoard;
use rfmatch_core::motor::MotorController;
use rfmatch_core::sensor::RfSensor;
use rfmatch_core::store;
use rfmatch_hardware::{SimMotionBus, SimMotor, SimSensor};
use rfmatch_traits::{Clock, ManualClock};
use std::sync::Arc;

fn board_on(bus: SimMotionBus) -> MotionBoard<SimMotionBus, SimMotor> {
    let clock = ManualClock::new();
    let clock_arc: Arc<dyn Clock + Send + Sync> = Arc::new(clock.clone());
    MotionBoard::new(
        bus,
        MotorController::new(SimMotor::new(clock.clone(), 32_000), 0, clock_arc.clone()),
        MotorController::new(SimMotor::new(clock.clone(), 32_000), 1, clock_arc.clone()),
        clock_arc,
    )
}

fn sensors() -> (RfSensor<SimSensor>, RfSensor<SimSensor>) {
    (
        RfSensor::new(SimSensor::new()),
        RfSensor::new(SimSensor::new()),
    )
}

fn has_line(sink: &[String], needle: &str) -> bool {
    sink.iter().any(|l| l.contains(needle))
}

#[test]
fn records_survive_a_power_cycle() {
    let bus = SimMotionBus::new();

    {
        let mut board = board_on(bus.clone());
        board.info.model = "mat-50r".into();
        board.info.date = "2026-08".into();
        board.info.serial = "sn1207".into();
        board.info.input_cal = [1.25, 0.8, 3.5];
        board.info.motor_limits[0] = [0, 50_000, 2_000, 48_000];
        board.info.motor_caps[1] = [100, 40_000];
        board.info.motor_fit_coeffs[0] = [1.0, 95.5, -4.25, 0.5];
        board.info.vswr = store::VswrThresholds {
            start: 1.2,
            stop: 1.1,
            restart: 1.5,
        };
        board.info.ams = store::AmsSettings {
            interval_ms: 25,
            timeout_ms: 30_000,
            log_interval: 4,
        };
        board.info.stream_rates = store::StreamRates {
            imp_ms: 250,
            vi_ms: 500,
            pos_ms: 1000,
        };
        board.save_product_info().unwrap();
        board.save_calibration().unwrap();
        board.save_motor_limits().unwrap();
        board.save_motor_caps().unwrap();
        board.save_fit_coeffs().unwrap();
        board.save_vswr().unwrap();
        board.save_ams().unwrap();
        board.save_stream_rates().unwrap();
        board.save_first_index_pos(0, 6_900).unwrap();
    }

    // Fresh board on the same FRAM: everything comes back.
    let mut board = board_on(bus);
    let (mut input, mut output) = sensors();
    let mut sink: Vec<String> = Vec::new();
    board.load_all(&mut input, &mut output, &mut sink);

    assert_eq!(board.info.model, "mat-50r");
    assert_eq!(board.info.serial, "sn1207");
    assert_eq!(board.info.input_cal, [1.25, 0.8, 3.5]);
    assert_eq!(board.info.motor_limits[0], [0, 50_000, 2_000, 48_000]);
    assert_eq!(board.info.motor_caps[1], [100, 40_000]);
    assert_eq!(board.info.motor_fit_coeffs[0], [1.0, 95.5, -4.25, 0.5]);
    assert_eq!(board.info.vswr.start, 1.2);
    assert_eq!(board.info.ams.interval_ms, 25);
    assert_eq!(board.info.stream_rates.pos_ms, 1000);
    assert_eq!(board.info.first_index_pos[0], 6_900);

    // Applied to the live controllers, not just the mirror.
    assert_eq!(board.motors[0].limits.upper, 48_000);
    assert_eq!(board.motors[1].max_cap, 40_000);
    assert_eq!(board.motors[0].fit_coeffs[1], 95.5);
    let cal = input.calibration();
    assert!((cal.v_gain - 1.25).abs() < f32::EPSILON);
    assert!((input.phase_offset_deg() - 3.5).abs() < 1e-4);

    // Every restored record announces itself.
    assert!(has_line(&sink, "DGI,mat-50r,2026-08,sn1207,EN"));
    assert!(has_line(&sink, "RGC,i,1.250000,0.800000,3.500000,EN"));
    assert!(has_line(&sink, "MGL,0,0,50000,2000,48000,"));
    assert!(has_line(&sink, "MFC,0,1.000000,95.500000,-4.250000,0.500000,EN"));
    assert!(has_line(&sink, "RGA,i,512,EN"));
    assert!(has_line(&sink, "SST,250,500,EN"));
    assert!(has_line(&sink, "MST,1000,EN"));
    assert!(has_line(&sink, "VSW,1.200000,1.100000,1.500000,EN"));
    assert!(has_line(&sink, "AST,25,30000,4,EN"));
}

#[test]
fn read_failure_substitutes_defaults_and_continues() {
    let bus = SimMotionBus::new();
    bus.fail_fram(true);

    let mut board = board_on(bus);
    let (mut input, mut output) = sensors();
    let mut sink: Vec<String> = Vec::new();
    board.load_all(&mut input, &mut output, &mut sink);

    assert_eq!(board.info.motor_limits[0], [0, 64_000, 4_000, 60_000]);
    assert_eq!(board.info.motor_caps[0], [0, 100_000]);
    assert_eq!(board.info.vswr, store::VswrThresholds::default());
    assert_eq!(board.info.ams, store::AmsSettings::default());
    let cal = input.calibration();
    assert!((cal.v_gain - 1.0).abs() < f32::EPSILON);

    // The UI still hears about the (default) state.
    assert!(has_line(&sink, "VSW,1.040000,1.020000,1.040000,EN"));
    assert!(has_line(&sink, "AST,10,0,10,EN"));
    assert!(has_line(&sink, "SST,100,100,EN"));
}

#[test]
fn out_of_range_fields_fall_back_individually() {
    let bus = SimMotionBus::new();

    {
        let mut board = board_on(bus.clone());
        // stop = 7.0 is outside its 1..5 range; the others are fine.
        board.info.vswr = store::VswrThresholds {
            start: 2.0,
            stop: 7.0,
            restart: 3.0,
        };
        // save_vswr writes raw values; validation happens on load.
        board.save_vswr().unwrap();
        board.info.ams = store::AmsSettings {
            interval_ms: 50,
            timeout_ms: -7,
            log_interval: 20,
        };
        board.save_ams().unwrap();
    }

    let mut board = board_on(bus);
    let (mut input, mut output) = sensors();
    let mut sink: Vec<String> = Vec::new();
    board.load_all(&mut input, &mut output, &mut sink);

    assert_eq!(board.info.vswr.start, 2.0);
    assert_eq!(board.info.vswr.stop, store::VSWR_STOP_DEFAULT);
    assert_eq!(board.info.vswr.restart, 3.0);
    assert_eq!(board.info.ams.interval_ms, 50);
    assert_eq!(board.info.ams.timeout_ms, store::AMS_TIMEOUT_DEFAULT);
    assert_eq!(board.info.ams.log_interval, 20);
}

#[test]
fn boot_homing_finds_the_saved_index() {
    let clock = ManualClock::new();
    let clock_arc: Arc<dyn Clock + Send + Sync> = Arc::new(clock.clone());
    let m0_fabric = SimMotor::new(clock.clone(), 3_840);
    m0_fabric.set_index_phase(500);
    let mut board = MotionBoard::new(
        SimMotionBus::new(),
        MotorController::new(m0_fabric.clone(), 0, clock_arc.clone()),
        MotorController::new(SimMotor::new(clock.clone(), 3_840), 1, clock_arc.clone()),
        clock_arc,
    );
    board.info.first_index_pos[0] = 6_900;

    assert!(board.init_by_index(0));

    // The fabric was armed for origin-on-index with the saved position:
    // base word (pos << 2), then bit 1 raised, then cleared.
    let base = (6_900u32) << 2;
    let words = m0_fabric.origin_words();
    assert!(
        words.windows(3).any(|w| w == [base, base | 2, base]),
        "origin-on-index sequence missing: {words:?}"
    );
}

//! Serial frame grammar.
//!
//! Every outgoing message is `<OPCODE>,<field>,...,<field>,EN`; the sink
//! appends the line terminator. Floats are rendered by [`fixed6`]: sign,
//! integer part, `.`, six zero-padded fractional digits, half-up rounding
//! at the sixth place. The host parses exactly this shape.

use rfmatch_traits::FrameSink;
use std::fmt::Write as _;

/// Render a float as `[-]int.dddddd` with half-up rounding at the sixth
/// fractional digit. Non-finite values render as `0.000000`.
pub fn fixed6(value: f32) -> String {
    if !value.is_finite() {
        return "0.000000".to_owned();
    }
    let negative = value < 0.0;
    let abs = f64::from(value.abs());
    let mut ip = abs.trunc() as i64;
    let mut fp = ((abs - abs.trunc()) * 1_000_000.0 + 0.5) as i64;
    if fp >= 1_000_000 {
        ip += 1;
        fp -= 1_000_000;
    }
    if negative {
        format!("-{ip}.{fp:06}")
    } else {
        format!("{ip}.{fp:06}")
    }
}

/// `ACK,<op>,<status>,EN`
pub fn send_ack(sink: &mut impl FrameSink, op: &str, status: &str) {
    sink.send_line(&format!("ACK,{op},{status},EN"));
}

/// `ZI`/`ZO`: R, X, |V|, |I|, phase in degrees.
pub fn send_impedance(
    sink: &mut impl FrameSink,
    is_input: bool,
    r: f32,
    x: f32,
    v_mag: f32,
    i_mag: f32,
    phase_deg: f32,
) {
    let opcode = if is_input { "ZI" } else { "ZO" };
    sink.send_line(&format!(
        "{opcode},{},{},{},{},{},EN",
        fixed6(r),
        fixed6(x),
        fixed6(v_mag),
        fixed6(i_mag),
        fixed6(phase_deg)
    ));
}

/// `VI`/`VO`: voltage and current magnitudes.
pub fn send_vi_mag(sink: &mut impl FrameSink, is_input: bool, v_mag: f32, i_mag: f32) {
    let opcode = if is_input { "VI" } else { "VO" };
    sink.send_line(&format!(
        "{opcode},{},{},EN",
        fixed6(v_mag),
        fixed6(i_mag)
    ));
}

/// Spectrum frames: `FI`/`FO` carry the voltage channel, `CI`/`CO` the
/// current channel, 1024 floats each.
pub fn send_spectrum(sink: &mut impl FrameSink, opcode: &str, data: &[f32]) {
    let mut line = String::with_capacity(data.len() * 10 + 8);
    line.push_str(opcode);
    line.push(',');
    for v in data {
        let _ = write!(line, "{},", fixed6(*v));
    }
    line.push_str("EN");
    sink.send_line(&line);
}

/// `MPB`: both motors' position, travel percent and capacitance.
pub fn send_motor_position_both(
    sink: &mut impl FrameSink,
    pos0: i32,
    pct0: i32,
    cap0: i32,
    pos1: i32,
    pct1: i32,
    cap1: i32,
) {
    sink.send_line(&format!("MPB,{pos0},{pct0},{cap0},{pos1},{pct1},{cap1},EN"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed6_pads_and_rounds_half_up() {
        assert_eq!(fixed6(1.25), "1.250000");
        assert_eq!(fixed6(0.0), "0.000000");
        assert_eq!(fixed6(-3.5), "-3.500000");
        // Half-up at the sixth place: 0.0000005 -> 0.000001
        assert_eq!(fixed6(0.000_000_5), "0.000001");
        assert_eq!(fixed6(12.000_000_4), "12.000000");
    }

    #[test]
    fn fixed6_carries_into_integer_part() {
        assert_eq!(fixed6(1.999_999_9), "2.000000");
        assert_eq!(fixed6(-0.999_999_9), "-1.000000");
    }

    #[test]
    fn fixed6_squashes_non_finite() {
        assert_eq!(fixed6(f32::NAN), "0.000000");
        assert_eq!(fixed6(f32::INFINITY), "0.000000");
    }

    #[test]
    fn frames_end_in_en() {
        let mut sink: Vec<String> = Vec::new();
        send_ack(&mut sink, "rsc", "OK_SAVED");
        send_impedance(&mut sink, true, 50.0, 0.0, 1.0, 0.02, 0.0);
        send_vi_mag(&mut sink, false, 1.5, 0.5);
        send_motor_position_both(&mut sink, 100, 1, 200, 300, 2, 400);
        assert_eq!(sink[0], "ACK,rsc,OK_SAVED,EN");
        assert_eq!(
            sink[1],
            "ZI,50.000000,0.000000,1.000000,0.020000,0.000000,EN"
        );
        assert_eq!(sink[2], "VO,1.500000,0.500000,EN");
        assert_eq!(sink[3], "MPB,100,1,200,300,2,400,EN");
        assert!(sink.iter().all(|l| l.ends_with(",EN")));
    }

    #[test]
    fn spectrum_frame_has_all_values() {
        let mut sink: Vec<String> = Vec::new();
        send_spectrum(&mut sink, "FI", &[0.5, 1.0]);
        assert_eq!(sink[0], "FI,0.500000,1.000000,EN");
    }
}

use rfmatch_config::load_fit_coeffs_csv;
use std::io::Write;

fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(name);
    let mut f = std::fs::File::create(&path).expect("create temp csv");
    f.write_all(content.as_bytes()).expect("write temp csv");
    path
}

#[test]
fn loads_both_motor_rows() {
    let path = write_temp(
        "rfmatch_fit_ok.csv",
        "motor,a0,a1,a2,a3\n0,1.5,95.0,-4.0,0.5\n1,2.0,110.0,0.0,0.0\n",
    );
    let coeffs = load_fit_coeffs_csv(&path).expect("load");
    assert_eq!(coeffs[0], [1.5, 95.0, -4.0, 0.5]);
    assert_eq!(coeffs[1], [2.0, 110.0, 0.0, 0.0]);
}

#[test]
fn rejects_wrong_headers() {
    let path = write_temp("rfmatch_fit_hdr.csv", "idx,a0,a1,a2,a3\n0,1,2,3,4\n");
    let err = load_fit_coeffs_csv(&path).expect_err("bad headers");
    assert!(err.to_string().contains("headers"));
}

#[test]
fn rejects_missing_motor_row() {
    let path = write_temp("rfmatch_fit_missing.csv", "motor,a0,a1,a2,a3\n0,1,2,3,4\n");
    let err = load_fit_coeffs_csv(&path).expect_err("missing row");
    assert!(err.to_string().contains("both motors"));
}

#[test]
fn rejects_out_of_range_motor_index() {
    let path = write_temp(
        "rfmatch_fit_idx.csv",
        "motor,a0,a1,a2,a3\n0,1,2,3,4\n5,1,2,3,4\n",
    );
    let err = load_fit_coeffs_csv(&path).expect_err("bad index");
    assert!(err.to_string().contains("out of range"));
}

#[test]
fn rejects_non_finite_coefficients() {
    let path = write_temp(
        "rfmatch_fit_nan.csv",
        "motor,a0,a1,a2,a3\n0,NaN,2,3,4\n1,1,2,3,4\n",
    );
    let err = load_fit_coeffs_csv(&path).expect_err("nan coefficient");
    assert!(err.to_string().contains("finite"));
}

#![no_main]

use libfuzzer_sys::fuzz_target;

// The TOML loader and validator must reject garbage without panicking.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(cfg) = rfmatch_config::load_toml(text) {
        let _ = cfg.validate();
    }
});

//! Serial line assembly.
//!
//! The receive side mirrors the UART ISR contract: a background reader
//! owns the byte stream and touches exactly one shared structure — the
//! line buffer with its completion state — which the main loop polls
//! between ticks. CR terminates a command, LF is ignored, and bytes past
//! the buffer limit are dropped until the next terminator.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::thread;

const RX_BUF_LIMIT: usize = 1024;

#[derive(Default)]
struct RxState {
    current: Vec<u8>,
    completed: Vec<String>,
}

/// Polled handle over the background byte reader.
pub struct LineReader {
    state: Arc<Mutex<RxState>>,
}

impl LineReader {
    /// Spawn a reader over any byte stream (the serial port, or stdin in
    /// sim mode).
    pub fn spawn<R: Read + Send + 'static>(source: R) -> Self {
        let state = Arc::new(Mutex::new(RxState::default()));
        let shared = state.clone();

        thread::spawn(move || {
            for byte in source.bytes() {
                let Ok(byte) = byte else { break };
                let mut rx = match shared.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                match byte {
                    b'\r' => {
                        let line = String::from_utf8_lossy(&rx.current).into_owned();
                        rx.current.clear();
                        rx.completed.push(line);
                    }
                    b'\n' => {}
                    _ => {
                        if rx.current.len() < RX_BUF_LIMIT - 1 {
                            rx.current.push(byte);
                        }
                    }
                }
            }
        });

        Self { state }
    }

    /// Take the next completed line, if any.
    pub fn poll(&self) -> Option<String> {
        let mut rx = self.state.lock().ok()?;
        if rx.completed.is_empty() {
            None
        } else {
            Some(rx.completed.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain(reader: &LineReader, want: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for _ in 0..200 {
            while let Some(l) = reader.poll() {
                lines.push(l);
            }
            if lines.len() >= want {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        lines
    }

    #[test]
    fn cr_terminates_and_lf_is_ignored() {
        let reader = LineReader::spawn(&b"rz i 16\r\nmgp 0\r"[..]);
        let lines = drain(&reader, 2);
        assert_eq!(lines, vec!["rz i 16".to_owned(), "mgp 0".to_owned()]);
    }

    #[test]
    fn oversized_line_is_clipped_not_split() {
        let mut bytes = vec![b'x'; 4096];
        bytes.push(b'\r');
        let reader = LineReader::spawn(std::io::Cursor::new(bytes));
        let lines = drain(&reader, 1);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), RX_BUF_LIMIT - 1);
    }
}

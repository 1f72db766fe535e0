use thiserror::Error;

/// Typed failure kinds surfaced by the core. Each maps to an
/// `ACK,<op>,<reason>` frame when user input caused it.
#[derive(Debug, Error, Clone)]
pub enum MatchError {
    #[error("bus error: {0}")]
    Bus(String),
    #[error("{0} out of range")]
    Range(&'static str),
    #[error("record inconsistency: {0}")]
    Invariant(&'static str),
    #[error("{0} not available")]
    Unavailable(&'static str),
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;

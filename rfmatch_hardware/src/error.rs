use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("i2c error: {0}")]
    I2c(String),
    #[error("bus nak")]
    Nak,
    #[error("bus timeout")]
    Timeout,
    #[error("fram address {0:#06x} out of range")]
    Address(u16),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;

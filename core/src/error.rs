use thiserror::Error;

#[derive(Debug, Error)]
pub enum TncError {
    #[error("Invalid callsign")]
    InvalidCallsign,

    #[error("Invalid operating mode")]
    InvalidMode,

    #[error("Invalid TCP port")]
    InvalidPort,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to open audio device")]
    AudioOpenFailed,

    #[error("PTT backend connection failed")]
    PttConnectFailed,

    #[error("Invalid frame size")]
    InvalidFrameSize,

    #[error("Insufficient data")]
    InsufficientData,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TncError>;

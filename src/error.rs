#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("serialport error")]
    SerialPort(#[from] serialport::Error),
    #[error("invalid config file")]
    Config(#[from] toml::de::Error),
    #[error("failed to write config file")]
    ConfigWrite(#[from] toml::ser::Error),
    #[error("the interface could not be opened")]
    OpenFailed,
    #[error("the communication loop is not running")]
    NotRunning,
    #[error("an operation is already running")]
    Busy,
    #[error("invalid memory layout: {0}")]
    InvalidLayout(String),
    #[error("invalid compressed data: {0}")]
    Compression(&'static str),
    #[error("invalid relocation payload: {0}")]
    InvalidPayload(String),
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("operation aborted")]
    Aborted,
}

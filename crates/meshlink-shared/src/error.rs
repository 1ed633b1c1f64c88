use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshlinkError {
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for MeshlinkError {
    fn from(e: bincode::Error) -> Self {
        MeshlinkError::Serialization(e.to_string())
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SmtpdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server has been closed")]
    ServerClosed,

    #[error("Shutdown deadline exceeded with {0} session(s) still open")]
    ShutdownTimeout(usize),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Invalid listen address: {0}")]
    InvalidListenAddr(String),

    #[error("Socket already in use: {0}")]
    SocketInUse(String),
}

pub type Result<T> = std::result::Result<T, SmtpdError>;

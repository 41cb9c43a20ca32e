use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiftError {
    #[error("http request failed: {0}")]
    Http(String),
    #[error("credential request failed: {0}")]
    Credential(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("room error: {0}")]
    Room(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("command failed: {0}")]
    Command(String),
}

use thiserror::Error;

/// Errors raised while starting the callback server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("No available port in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("Could not determine a local address to advertise")]
    NoLocalAddress,
}

//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Driver error: {0}")]
    Driver(#[from] driver::DriverError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use driver::DriverError;

    #[test]
    fn test_driver_error_converts() {
        let err: Error = DriverError::Busy.into();
        assert!(matches!(err, Error::Driver(DriverError::Busy)));
        assert!(err.to_string().starts_with("Driver error"));
    }

    #[test]
    fn test_io_error_converts() {
        let err: Error = std::io::Error::other("boom").into();
        assert_eq!(err.to_string(), "IO error: boom");
    }
}

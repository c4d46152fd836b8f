//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for the Bayou crate.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct BayouError(pub String);

impl BayouError {
    /// Creates an error from anything displayable.
    pub fn msg(m: impl fmt::Display) -> Self {
        BayouError(m.to_string())
    }
}

impl fmt::Display for BayouError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `BayouError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for BayouError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                BayouError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for BayouError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        BayouError(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for BayouError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        BayouError(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = BayouError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = BayouError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}

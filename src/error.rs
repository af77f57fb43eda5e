//! Error taxonomy shared by the sampler, transport and collector

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Discovery window elapsed without seeing the advertised name
    #[error("no device advertising {name:?} found within {timeout:?}")]
    DeviceNotFound { name: String, timeout: Duration },
    /// A payload that doesn't decode to a sample
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    /// Transport severed or unusable mid-session
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Rejected before any hardware sequencing starts
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to write {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit status, one per taxonomy entry (sysexits values)
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MalformedPacket(_) => 65,
            Error::DeviceNotFound { .. } => 69,
            Error::Storage { .. } => 73,
            Error::ConnectionLost(_) => 74,
            Error::Configuration(_) => 78,
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn link(context: &str, source: std::io::Error) -> Self {
        Error::ConnectionLost(format!("{context}: {source}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let errors = [
            Error::DeviceNotFound {
                name: "iq_digitizer".to_owned(),
                timeout: Duration::from_secs(1),
            },
            Error::MalformedPacket("3 bytes".to_owned()),
            Error::ConnectionLost("reset".to_owned()),
            Error::Configuration("decimation".to_owned()),
            Error::storage("out.txt", std::io::Error::from(std::io::ErrorKind::Other)),
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c != 0));
    }
}

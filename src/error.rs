use std::time::Duration;

use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lease was not found: partition {0}")]
    LeaseNotFound(String),
    #[error("lease for partition {0} isn't owned by this host")]
    NotOwned(String),
    #[error("no partition host attached")]
    NotAttached,
    #[error("no tokio runtime to run the lease persister on")]
    NoRuntime,
    #[error("lease contention on partition {partition}: {source}")]
    Contention {
        partition: String,
        #[source]
        source: StoreError,
    },
    #[error("store error on {partition}: {source}")]
    Store {
        partition: String,
        #[source]
        source: StoreError,
    },
    #[error("lease record codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("unsupported lease record version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Classifies a store failure against `partition` as contention or transport.
    pub(crate) fn from_store(partition: &str, source: StoreError) -> Self {
        let partition = partition.to_string();
        if source.is_contention() {
            Error::Contention { partition, source }
        } else {
            Error::Store { partition, source }
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Contention { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Timeout(_))
    }

    /// Contract violations: the caller asked for something it never held.
    pub fn is_not_owned(&self) -> bool {
        matches!(self, Error::NotOwned(_) | Error::LeaseNotFound(_))
    }

    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Error::Contention { source, .. } | Error::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ObjectKey;

    #[test]
    fn store_errors_are_classified() {
        let key = ObjectKey::new("leases", "0");
        let err = Error::from_store("0", StoreError::LockMismatch(key));
        assert!(err.is_contention());
        assert!(!err.is_cancelled());

        let err = Error::from_store("0", StoreError::Backend("connection reset".into()));
        assert!(!err.is_contention());
        assert!(matches!(err, Error::Store { .. }));
        assert!(err.store_error().is_some());

        assert!(Error::Timeout(Duration::from_secs(1)).is_cancelled());
        assert!(Error::NotOwned("0".into()).is_not_owned());
    }

    #[test]
    fn messages_name_the_partition() {
        let err = Error::LeaseNotFound("7".into());
        assert_eq!(err.to_string(), "lease was not found: partition 7");
        let err = Error::NotOwned("7".into());
        assert_eq!(err.to_string(), "lease for partition 7 isn't owned by this host");
    }
}

//! Error taxonomy for the unit agent's remote-state and network-info core.

use thiserror::Error;

use crate::types::Life;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// An entity the caller was following no longer exists.
    #[error("{0} not found")]
    NotFound(String),

    /// A change source did not deliver its initial event.
    #[error("{source_name} did not deliver an initial event: {reason}")]
    InitFailed {
        source_name: String,
        reason: String,
    },

    /// A change source ended mid-stream.
    #[error("{source_name} terminated: {reason}")]
    SourceTerminated {
        source_name: String,
        reason: String,
    },

    #[error("machine {machine:?} has no devices in space {space:?}")]
    NoAddressInSpace { space: String, machine: String },

    #[error("no public address for unit {0:?}")]
    NoPublicAddress(String),

    #[error("no private address for unit {0:?}")]
    NoPrivateAddress(String),

    #[error("cancelled")]
    Cancelled,

    #[error("attempt count exceeded ({attempts} attempts): {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// Life only moves forward.
    #[error("{entity} cannot go from {from:?} back to {to:?}")]
    LifeRegression { entity: String, from: Life, to: Life },

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("invalid model seed: {0}")]
    Seed(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The error behind any retry annotation.
    pub fn root(&self) -> &Error {
        match self {
            Error::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_address_in_space_names_machine_and_space() {
        let err = Error::NoAddressInSpace {
            space: "666".into(),
            machine: "0".into(),
        };
        assert_eq!(err.to_string(), r#"machine "0" has no devices in space "666""#);
    }

    #[test]
    fn root_unwraps_retry_annotation() {
        let err = Error::RetryExhausted {
            attempts: 3,
            last: Box::new(Error::NoPrivateAddress("wordpress/0".into())),
        };
        assert!(matches!(err.root(), Error::NoPrivateAddress(_)));
        assert!(err.to_string().starts_with("attempt count exceeded (3 attempts)"));
    }
}

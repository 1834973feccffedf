//! Library error type. Binary entrypoints wrap these in `anyhow::Result`.

use crate::codec::CodecError;
use crate::registry::RegistryError;
use crate::types::InvalidName;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("name {0:?} is already in use")]
    NameInUse(String),
    #[error("subscriber {0:?} is not registered")]
    NotRegistered(String),
    #[error("stream mode {0} is disabled by configuration")]
    ModeDisabled(&'static str),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] CodecError),
    #[error("invalid subscriber name: {0}")]
    InvalidName(#[from] InvalidName),
    #[error("upstream source error: {0}")]
    Upstream(String),
}

impl From<RegistryError> for BrokerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NameInUse(name) => BrokerError::NameInUse(name.to_string()),
            RegistryError::NotRegistered(name) => BrokerError::NotRegistered(name.to_string()),
        }
    }
}

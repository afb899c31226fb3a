//! Errors surfaced by the token cache
//!
//! Anything that can be explained as "no cached data" degrades to a cache
//! miss and is only logged. The errors here are the ones worth surfacing:
//! corrupted current-format state, ambiguous lookups, invalid entities, and
//! failures raised by the host's own notification callbacks.

use thiserror::Error;

pub use crate::{
    client_info::InvalidClientInfo, entities::InvalidEntity, keys::MissingKeyComponent,
    lookup::MultipleTokensMatched, notification::NotificationError,
    serialization::CacheFormatError,
};

/// An error from a token cache operation
#[derive(Debug, Error)]
pub enum TokenCacheError {
    /// More than one cached access token matched the request
    #[error(transparent)]
    MultipleTokensMatched(#[from] MultipleTokensMatched),
    /// The current-format document could not be read
    #[error(transparent)]
    CacheFormat(#[from] CacheFormatError),
    /// An entity could not be constructed
    #[error(transparent)]
    InvalidEntity(#[from] InvalidEntity),
    /// The host's notification callback failed
    #[error(transparent)]
    Notification(#[from] NotificationError),
}

impl From<MissingKeyComponent> for TokenCacheError {
    fn from(err: MissingKeyComponent) -> Self {
        Self::InvalidEntity(err.into())
    }
}

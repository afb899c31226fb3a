//! Host notifications around cache operations
//!
//! Every cache operation is bracketed by notifications: before-access fires
//! before any read or write, before-write fires only before mutations, and
//! after-access fires when the operation completes, including when it fails.
//! Hosts typically reload persisted state in before-access, take an advisory
//! lock in before-write, and persist and unlock in after-access.

use std::{error, fmt};

use async_trait::async_trait;
use idcache_clock::UnixTime;
use thiserror::Error;

use crate::{
    accessor::TokenCacheAccessor,
    braids::{ClientIdRef, HomeAccountIdRef},
    entities::EntityKinds,
    legacy::LegacyCachePersistence,
    serialization::{self, CacheFormatError},
};

/// A host notification callback failed
#[derive(Debug, Error)]
#[error("token cache notification failed")]
pub struct NotificationError {
    #[source]
    source: Box<dyn error::Error + Send + Sync + 'static>,
}

impl NotificationError {
    /// Wraps the underlying failure
    pub fn new(source: impl Into<Box<dyn error::Error + Send + Sync + 'static>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl From<CacheFormatError> for NotificationError {
    fn from(err: CacheFormatError) -> Self {
        Self::new(err)
    }
}

/// Gives notification callbacks access to the cache's persisted forms
#[derive(Clone, Copy)]
pub struct CacheSerializer<'a> {
    accessor: &'a dyn TokenCacheAccessor,
    legacy: Option<&'a dyn LegacyCachePersistence>,
}

impl<'a> CacheSerializer<'a> {
    pub(crate) fn new(
        accessor: &'a dyn TokenCacheAccessor,
        legacy: Option<&'a dyn LegacyCachePersistence>,
    ) -> Self {
        Self { accessor, legacy }
    }

    /// Serializes the current cache document
    pub fn serialize(&self) -> Result<Vec<u8>, CacheFormatError> {
        serialization::serialize(self.accessor)
    }

    /// Loads a current cache document, replacing each bucket it contains
    pub fn deserialize(&self, data: &[u8]) -> Result<EntityKinds, CacheFormatError> {
        serialization::deserialize(self.accessor, data)
    }

    /// The legacy blob, if legacy persistence is configured and readable
    pub fn legacy_blob(&self) -> Option<Vec<u8>> {
        let legacy = self.legacy?;
        match legacy.load() {
            Ok(data) => Some(data),
            Err(error) => {
                tracing::warn!(error = (&*error as &dyn error::Error), "unable to read legacy cache");
                None
            }
        }
    }

    /// Replaces the legacy blob, if legacy persistence is configured
    pub fn replace_legacy_blob(&self, data: &[u8]) {
        if let Some(legacy) = self.legacy {
            if let Err(error) = legacy.store(data) {
                tracing::warn!(error = (&*error as &dyn error::Error), "unable to replace legacy cache");
            }
        }
    }
}

impl fmt::Debug for CacheSerializer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CacheSerializer")
            .field("legacy", &self.legacy.is_some())
            .finish()
    }
}

/// The context passed to notification callbacks
#[derive(Clone, Copy, Debug)]
pub struct TokenCacheNotificationArgs<'a> {
    pub(crate) client_id: &'a ClientIdRef,
    pub(crate) home_account_id: Option<&'a HomeAccountIdRef>,
    pub(crate) kinds: EntityKinds,
    pub(crate) has_state_changed: bool,
    pub(crate) has_tokens: bool,
    pub(crate) suggested_cache_key: Option<&'a str>,
    pub(crate) suggested_cache_expiry: Option<UnixTime>,
    pub(crate) serializer: CacheSerializer<'a>,
}

impl<'a> TokenCacheNotificationArgs<'a> {
    /// The client the cache belongs to
    #[inline]
    pub fn client_id(&self) -> &'a ClientIdRef {
        self.client_id
    }

    /// The account the operation concerns, if any
    #[inline]
    pub fn home_account_id(&self) -> Option<&'a HomeAccountIdRef> {
        self.home_account_id
    }

    /// The entity kinds the operation reads or writes
    #[inline]
    pub fn kinds(&self) -> EntityKinds {
        self.kinds
    }

    /// Whether the operation changed cache state
    ///
    /// Only meaningful in after-access.
    #[inline]
    pub fn has_state_changed(&self) -> bool {
        self.has_state_changed
    }

    /// Whether the cache holds any access or refresh token
    #[inline]
    pub fn has_tokens(&self) -> bool {
        self.has_tokens
    }

    /// A key under which the host may partition persisted caches
    #[inline]
    pub fn suggested_cache_key(&self) -> Option<&'a str> {
        self.suggested_cache_key
    }

    /// When the persisted cache may be discarded, if known
    #[inline]
    pub fn suggested_cache_expiry(&self) -> Option<UnixTime> {
        self.suggested_cache_expiry
    }

    /// Access to the cache's persisted forms
    #[inline]
    pub fn serializer(&self) -> CacheSerializer<'a> {
        self.serializer
    }
}

/// Receives notifications around cache operations
///
/// Callbacks are awaited to completion before the operation continues. An
/// error from before-access or before-write aborts the operation; an error
/// from after-access is reported after the operation's own result.
#[async_trait]
pub trait TokenCacheNotification: fmt::Debug + Send + Sync {
    /// Called before any read or write
    async fn before_access(
        &self,
        _args: &TokenCacheNotificationArgs<'_>,
    ) -> Result<(), NotificationError> {
        Ok(())
    }

    /// Called before a write, after before-access
    async fn before_write(
        &self,
        _args: &TokenCacheNotificationArgs<'_>,
    ) -> Result<(), NotificationError> {
        Ok(())
    }

    /// Called when the operation completes
    async fn after_access(
        &self,
        _args: &TokenCacheNotificationArgs<'_>,
    ) -> Result<(), NotificationError> {
        Ok(())
    }
}

/// Ignores all notifications
#[derive(Clone, Copy, Debug, Default)]
pub struct NoNotification;

#[async_trait]
impl TokenCacheNotification for NoNotification {}

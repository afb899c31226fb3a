//! Storage for cached entities
//!
//! The accessor is the only component that owns entity state. It must allow
//! concurrent reads; the cache façade serializes writes.

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::{
    entities::{
        AccessToken, Account, AdditionalFields, AppMetadata, EntityKind, IdToken, RefreshToken,
    },
    keys::{CacheKey, CacheKeyRef},
};

/// An entity that can be held in an accessor bucket
pub trait CacheEntity: Clone + fmt::Debug + Send + Sync + 'static {
    /// The kind of entity
    const KIND: EntityKind;

    /// The key the entity is stored under
    fn cache_key(&self) -> &CacheKeyRef;
}

impl CacheEntity for AccessToken {
    const KIND: EntityKind = EntityKind::AccessToken;

    #[inline]
    fn cache_key(&self) -> &CacheKeyRef {
        self.cache_key()
    }
}

impl CacheEntity for RefreshToken {
    const KIND: EntityKind = EntityKind::RefreshToken;

    #[inline]
    fn cache_key(&self) -> &CacheKeyRef {
        self.cache_key()
    }
}

impl CacheEntity for IdToken {
    const KIND: EntityKind = EntityKind::IdToken;

    #[inline]
    fn cache_key(&self) -> &CacheKeyRef {
        self.cache_key()
    }
}

impl CacheEntity for Account {
    const KIND: EntityKind = EntityKind::Account;

    #[inline]
    fn cache_key(&self) -> &CacheKeyRef {
        self.cache_key()
    }
}

impl CacheEntity for AppMetadata {
    const KIND: EntityKind = EntityKind::AppMetadata;

    #[inline]
    fn cache_key(&self) -> &CacheKeyRef {
        self.cache_key()
    }
}

/// Storage for every kind of cached entity
///
/// Saving an entity replaces any existing entity under the same key.
/// Enumeration returns entities sorted by key.
pub trait TokenCacheAccessor: fmt::Debug + Send + Sync {
    /// Saves an access token
    fn save_access_token(&self, at: AccessToken);
    /// Saves a refresh token
    fn save_refresh_token(&self, rt: RefreshToken);
    /// Saves an ID token
    fn save_id_token(&self, idt: IdToken);
    /// Saves an account
    fn save_account(&self, account: Account);
    /// Saves application metadata
    fn save_app_metadata(&self, meta: AppMetadata);

    /// Gets an access token by key
    fn access_token(&self, key: &CacheKeyRef) -> Option<AccessToken>;
    /// Gets a refresh token by key
    fn refresh_token(&self, key: &CacheKeyRef) -> Option<RefreshToken>;
    /// Gets an ID token by key
    fn id_token(&self, key: &CacheKeyRef) -> Option<IdToken>;
    /// Gets an account by key
    fn account(&self, key: &CacheKeyRef) -> Option<Account>;
    /// Gets application metadata by key
    fn app_metadata(&self, key: &CacheKeyRef) -> Option<AppMetadata>;

    /// Deletes an access token, returning whether it existed
    fn delete_access_token(&self, key: &CacheKeyRef) -> bool;
    /// Deletes a refresh token, returning whether it existed
    fn delete_refresh_token(&self, key: &CacheKeyRef) -> bool;
    /// Deletes an ID token, returning whether it existed
    fn delete_id_token(&self, key: &CacheKeyRef) -> bool;
    /// Deletes an account, returning whether it existed
    fn delete_account(&self, key: &CacheKeyRef) -> bool;

    /// All access tokens
    fn access_tokens(&self) -> Vec<AccessToken>;
    /// All refresh tokens
    fn refresh_tokens(&self) -> Vec<RefreshToken>;
    /// All ID tokens
    fn id_tokens(&self) -> Vec<IdToken>;
    /// All accounts
    fn accounts(&self) -> Vec<Account>;
    /// All application metadata
    fn all_app_metadata(&self) -> Vec<AppMetadata>;

    /// Removes every entity of one kind
    ///
    /// This is the only way application metadata is ever removed, and is
    /// used when a document replaces the whole bucket.
    fn clear_kind(&self, kind: EntityKind);

    /// Top-level document nodes this version does not understand
    fn unknown_nodes(&self) -> Arc<AdditionalFields>;
    /// Replaces the preserved top-level nodes
    fn set_unknown_nodes(&self, nodes: AdditionalFields);

    /// Removes all tokens and accounts, keeping application metadata
    fn clear(&self) {
        self.clear_kind(EntityKind::AccessToken);
        self.clear_kind(EntityKind::RefreshToken);
        self.clear_kind(EntityKind::IdToken);
        self.clear_kind(EntityKind::Account);
    }

    /// Whether any access or refresh token is cached
    fn has_access_or_refresh_tokens(&self) -> bool {
        !self.access_tokens().is_empty() || !self.refresh_tokens().is_empty()
    }
}

/// A concurrent map of one kind of entity
#[derive(Debug)]
pub(crate) struct Bucket<T> {
    entries: DashMap<CacheKey, T>,
}

impl<T> Default for Bucket<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T: CacheEntity> Bucket<T> {
    fn save(&self, entity: T) {
        let key = entity.cache_key().to_owned();
        tracing::trace!(kind = ?T::KIND, key = %key, "saving cache entry");
        self.entries.insert(key, entity);
    }

    fn get(&self, key: &CacheKeyRef) -> Option<T> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn delete(&self, key: &CacheKeyRef) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            tracing::trace!(kind = ?T::KIND, key = %key, "removed cache entry");
        }
        removed
    }

    fn values(&self) -> Vec<T> {
        let mut values: Vec<T> = self.entries.iter().map(|e| e.value().clone()).collect();
        values.sort_by(|a, b| a.cache_key().as_str().cmp(b.cache_key().as_str()));
        values
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

/// An in-memory accessor backed by concurrent maps
#[derive(Debug, Default)]
pub struct InMemoryAccessor {
    access_tokens: Bucket<AccessToken>,
    refresh_tokens: Bucket<RefreshToken>,
    id_tokens: Bucket<IdToken>,
    accounts: Bucket<Account>,
    app_metadata: Bucket<AppMetadata>,
    unknown_nodes: ArcSwap<AdditionalFields>,
}

impl InMemoryAccessor {
    /// Constructs an empty accessor
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenCacheAccessor for InMemoryAccessor {
    fn save_access_token(&self, at: AccessToken) {
        self.access_tokens.save(at)
    }

    fn save_refresh_token(&self, rt: RefreshToken) {
        self.refresh_tokens.save(rt)
    }

    fn save_id_token(&self, idt: IdToken) {
        self.id_tokens.save(idt)
    }

    fn save_account(&self, account: Account) {
        self.accounts.save(account)
    }

    fn save_app_metadata(&self, meta: AppMetadata) {
        self.app_metadata.save(meta)
    }

    fn access_token(&self, key: &CacheKeyRef) -> Option<AccessToken> {
        self.access_tokens.get(key)
    }

    fn refresh_token(&self, key: &CacheKeyRef) -> Option<RefreshToken> {
        self.refresh_tokens.get(key)
    }

    fn id_token(&self, key: &CacheKeyRef) -> Option<IdToken> {
        self.id_tokens.get(key)
    }

    fn account(&self, key: &CacheKeyRef) -> Option<Account> {
        self.accounts.get(key)
    }

    fn app_metadata(&self, key: &CacheKeyRef) -> Option<AppMetadata> {
        self.app_metadata.get(key)
    }

    fn delete_access_token(&self, key: &CacheKeyRef) -> bool {
        self.access_tokens.delete(key)
    }

    fn delete_refresh_token(&self, key: &CacheKeyRef) -> bool {
        self.refresh_tokens.delete(key)
    }

    fn delete_id_token(&self, key: &CacheKeyRef) -> bool {
        self.id_tokens.delete(key)
    }

    fn delete_account(&self, key: &CacheKeyRef) -> bool {
        self.accounts.delete(key)
    }

    fn access_tokens(&self) -> Vec<AccessToken> {
        self.access_tokens.values()
    }

    fn refresh_tokens(&self) -> Vec<RefreshToken> {
        self.refresh_tokens.values()
    }

    fn id_tokens(&self) -> Vec<IdToken> {
        self.id_tokens.values()
    }

    fn accounts(&self) -> Vec<Account> {
        self.accounts.values()
    }

    fn all_app_metadata(&self) -> Vec<AppMetadata> {
        self.app_metadata.values()
    }

    fn clear_kind(&self, kind: EntityKind) {
        match kind {
            EntityKind::AccessToken => self.access_tokens.clear(),
            EntityKind::RefreshToken => self.refresh_tokens.clear(),
            EntityKind::IdToken => self.id_tokens.clear(),
            EntityKind::Account => self.accounts.clear(),
            EntityKind::AppMetadata => self.app_metadata.clear(),
        }
    }

    fn unknown_nodes(&self) -> Arc<AdditionalFields> {
        self.unknown_nodes.load_full()
    }

    fn set_unknown_nodes(&self, nodes: AdditionalFields) {
        self.unknown_nodes.store(Arc::new(nodes));
    }

    fn has_access_or_refresh_tokens(&self) -> bool {
        !self.access_tokens.entries.is_empty() || !self.refresh_tokens.entries.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use idcache_clock::UnixTime;

    use crate::{
        braids::*,
        entities::{AccessToken, Account, AppMetadata, AuthorityType, IdToken, RefreshToken},
        scope::ScopeSet,
    };

    pub const ENV: &str = "login.example.com";
    pub const CLIENT: &str = "client-1";
    pub const TENANT: &str = "contoso";
    pub const HOME: &str = "uid.utid";

    pub fn access_token(scopes: &str, cached_at: u64, expires_on: u64) -> AccessToken {
        AccessToken::builder(
            Environment::from_static(ENV),
            ClientId::from_static(CLIENT),
            TenantId::from_static(TENANT),
            AccessTokenSecret::new(format!("at-{}", scopes)),
            ScopeSet::parse(scopes),
        )
        .with_home_account_id(HomeAccountId::from_static(HOME))
        .with_lifetime(UnixTime(cached_at), UnixTime(expires_on))
        .build()
        .expect("valid access token")
    }

    pub fn refresh_token(client: &str, family: Option<&str>) -> RefreshToken {
        RefreshToken::new(
            HomeAccountId::from_static(HOME),
            Environment::from_static(ENV),
            ClientId::new(client.to_owned()),
            RefreshTokenSecret::new(format!("rt-{}", client)),
            family.map(|f| FamilyId::new(f.to_owned())),
        )
        .expect("valid refresh token")
    }

    pub fn id_token() -> IdToken {
        IdToken::new(
            HomeAccountId::from_static(HOME),
            Environment::from_static(ENV),
            ClientId::from_static(CLIENT),
            TenantId::from_static(TENANT),
            IdTokenSecret::from_static("header.payload.signature"),
        )
        .expect("valid id token")
    }

    pub fn account() -> Account {
        Account::new(
            HomeAccountId::from_static(HOME),
            Environment::from_static(ENV),
            TenantId::from_static(TENANT),
            "user@contoso.com",
            AuthorityType::MsSts,
        )
        .expect("valid account")
    }

    pub fn app_metadata(client: &str, family: Option<&str>) -> AppMetadata {
        AppMetadata::new(
            Environment::from_static(ENV),
            ClientId::new(client.to_owned()),
            family.map(|f| FamilyId::new(f.to_owned())),
        )
        .expect("valid app metadata")
    }
}

#[cfg(test)]
mod tests {
    use super::{fixtures::*, *};

    #[test]
    fn saving_replaces_by_key() {
        let accessor = InMemoryAccessor::new();
        let first = access_token("User.Read", 0, 100);
        let second = access_token("user.read", 10, 200);
        assert_eq!(first.cache_key(), second.cache_key());

        accessor.save_access_token(first);
        accessor.save_access_token(second.clone());

        assert_eq!(accessor.access_tokens(), vec![second]);
    }

    #[test]
    fn clear_keeps_app_metadata() {
        let accessor = InMemoryAccessor::new();
        accessor.save_access_token(access_token("a", 0, 100));
        accessor.save_refresh_token(refresh_token(CLIENT, None));
        accessor.save_id_token(id_token());
        accessor.save_account(account());
        accessor.save_app_metadata(app_metadata(CLIENT, Some("1")));

        accessor.clear();

        assert!(accessor.access_tokens().is_empty());
        assert!(accessor.refresh_tokens().is_empty());
        assert!(accessor.id_tokens().is_empty());
        assert!(accessor.accounts().is_empty());
        assert!(!accessor.has_access_or_refresh_tokens());
        assert_eq!(accessor.all_app_metadata().len(), 1);
    }

    #[test]
    fn enumeration_is_sorted_by_key() {
        let accessor = InMemoryAccessor::new();
        accessor.save_access_token(access_token("z", 0, 100));
        accessor.save_access_token(access_token("a", 0, 100));
        accessor.save_access_token(access_token("m", 0, 100));

        let scopes: Vec<String> = accessor
            .access_tokens()
            .iter()
            .map(|at| at.scopes().to_string())
            .collect();
        assert_eq!(scopes, vec!["a", "m", "z"]);
    }

    #[test]
    fn delete_reports_presence() {
        let accessor = InMemoryAccessor::new();
        let rt = refresh_token(CLIENT, None);
        accessor.save_refresh_token(rt.clone());

        assert!(accessor.delete_refresh_token(rt.cache_key()));
        assert!(!accessor.delete_refresh_token(rt.cache_key()));
        assert!(accessor.refresh_token(rt.cache_key()).is_none());
    }
}

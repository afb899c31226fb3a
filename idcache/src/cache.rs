//! The token cache façade
//!
//! [`TokenCache`] composes the accessor, lookup engine, serialization and
//! legacy interop into the operations the token acquisition flow calls.
//! Every operation is bracketed by the host's notifications. Writes are
//! serialized against each other; reads run concurrently.

use std::{fmt, sync::Arc};

use idcache_clock::{Clock, System, UnixTime};

use crate::{
    accessor::{InMemoryAccessor, TokenCacheAccessor},
    aliases::{environment_of, tenant_of, AuthorityAliases, ExactEnvironment},
    braids::{
        ClientId, ClientIdRef, EnvironmentRef, HomeAccountId, HomeAccountIdRef, OboCacheKeyRef,
        TenantId,
    },
    client_info::{home_account_id_from_raw, ClientInfo},
    config::TokenCacheConfig,
    entities::{
        AccessToken, Account, AppMetadata, AuthorityType, EntityKind, EntityKinds, IdToken,
        IdTokenClaims, RefreshToken,
    },
    error::{MissingKeyComponent, NotificationError, TokenCacheError},
    interop::{self, LegacyWriteThrough},
    legacy::{codec, LegacyCachePersistence},
    lookup::{
        self, AccessTokenMatch, AccessTokenQuery, FamilyMembership, RefreshTokenMatch,
        RefreshTokenQuery, RefreshTokenSource,
    },
    notification::{
        CacheSerializer, NoNotification, TokenCacheNotification, TokenCacheNotificationArgs,
    },
    response::{SaveTokenRequest, TokenResponse},
    serialization,
};

const CREDENTIAL_KINDS: EntityKinds = EntityKinds::NONE
    .with(EntityKind::AccessToken)
    .with(EntityKind::RefreshToken)
    .with(EntityKind::IdToken)
    .with(EntityKind::Account);

/// The entities written by [`TokenCache::save_token_response`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SavedTokens {
    /// The access token, if the response carried one with a lifetime
    pub access_token: Option<AccessToken>,
    /// The refresh token, if the response carried one for a user
    pub refresh_token: Option<RefreshToken>,
    /// The ID token, if the response carried one for a user
    pub id_token: Option<IdToken>,
    /// The account, if the response identified a user
    pub account: Option<Account>,
}

/// Identifies an operation to the host's notifications
struct Scope<'a> {
    home_account_id: Option<&'a HomeAccountIdRef>,
    kinds: EntityKinds,
    suggested_cache_key: Option<String>,
}

impl<'a> Scope<'a> {
    fn new(kinds: EntityKinds) -> Self {
        Self {
            home_account_id: None,
            kinds,
            suggested_cache_key: None,
        }
    }

    fn for_account(mut self, home_account_id: &'a HomeAccountIdRef) -> Self {
        self.home_account_id = Some(home_account_id);
        self.suggested_cache_key = Some(home_account_id.as_str().to_owned());
        self
    }
}

/// A client application's token cache
///
/// The cache is an explicit handle: construct one per client application and
/// pass it to each token acquisition.
pub struct TokenCache {
    client_id: ClientId,
    config: TokenCacheConfig,
    accessor: Arc<dyn TokenCacheAccessor>,
    clock: Arc<dyn Clock + Send + Sync>,
    aliases: Arc<dyn AuthorityAliases>,
    notification: Arc<dyn TokenCacheNotification>,
    legacy: Option<Arc<dyn LegacyCachePersistence>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl TokenCache {
    /// Constructs an empty in-memory cache for `client_id`
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            config: TokenCacheConfig::default(),
            accessor: Arc::new(InMemoryAccessor::new()),
            clock: Arc::new(System),
            aliases: Arc::new(ExactEnvironment),
            notification: Arc::new(NoNotification),
            legacy: None,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Sets the cache configuration
    #[must_use]
    pub fn with_config(mut self, config: TokenCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets a custom clock
    ///
    /// Useful for testing purposes
    #[must_use]
    pub fn with_clock<C: Clock + Send + Sync + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Sets the source of environment alias knowledge
    #[must_use]
    pub fn with_aliases(mut self, aliases: impl AuthorityAliases + 'static) -> Self {
        self.aliases = Arc::new(aliases);
        self
    }

    /// Sets the host's notification callbacks
    #[must_use]
    pub fn with_notification(mut self, notification: impl TokenCacheNotification + 'static) -> Self {
        self.notification = Arc::new(notification);
        self
    }

    /// Keeps a legacy cache in sync with this one
    #[must_use]
    pub fn with_legacy_persistence(mut self, legacy: Arc<dyn LegacyCachePersistence>) -> Self {
        self.legacy = Some(legacy);
        self
    }

    /// Replaces the in-memory store
    #[must_use]
    pub fn with_accessor(mut self, accessor: Arc<dyn TokenCacheAccessor>) -> Self {
        self.accessor = accessor;
        self
    }

    /// The client this cache belongs to
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The cache configuration
    #[inline]
    pub fn config(&self) -> &TokenCacheConfig {
        &self.config
    }

    /// The underlying store
    #[inline]
    pub fn accessor(&self) -> &dyn TokenCacheAccessor {
        &*self.accessor
    }

    fn legacy(&self) -> Option<&dyn LegacyCachePersistence> {
        self.legacy
            .as_deref()
            .filter(|_| self.config.legacy_compatibility())
    }

    fn serializer(&self) -> CacheSerializer<'_> {
        CacheSerializer::new(&*self.accessor, self.legacy.as_deref())
    }

    fn args<'a>(&'a self, scope: &'a Scope<'_>, has_state_changed: bool) -> TokenCacheNotificationArgs<'a> {
        TokenCacheNotificationArgs {
            client_id: &self.client_id,
            home_account_id: scope.home_account_id,
            kinds: scope.kinds,
            has_state_changed,
            has_tokens: self.accessor.has_access_or_refresh_tokens(),
            suggested_cache_key: scope.suggested_cache_key.as_deref(),
            suggested_cache_expiry: lookup::suggested_cache_expiry(
                &*self.accessor,
                &self.config,
                self.clock.now(),
            ),
            serializer: self.serializer(),
        }
    }

    async fn before_access(&self, scope: &Scope<'_>) -> Result<(), NotificationError> {
        self.notification.before_access(&self.args(scope, false)).await
    }

    async fn before_write(&self, scope: &Scope<'_>) -> Result<(), NotificationError> {
        self.notification.before_write(&self.args(scope, false)).await
    }

    /// Fires after-access and settles the operation's result
    ///
    /// The operation's own error takes precedence over a failure in the
    /// notification.
    async fn after_access<T>(
        &self,
        scope: &Scope<'_>,
        has_state_changed: bool,
        result: Result<T, TokenCacheError>,
    ) -> Result<T, TokenCacheError> {
        let notified = self
            .notification
            .after_access(&self.args(scope, has_state_changed))
            .await;

        match (result, notified) {
            (Err(error), Err(notify_error)) => {
                tracing::warn!(
                    error = (&notify_error as &dyn std::error::Error),
                    "after-access notification failed while reporting an earlier error"
                );
                Err(error)
            }
            (Err(error), Ok(())) => Err(error),
            (Ok(_), Err(notify_error)) => Err(notify_error.into()),
            (Ok(value), Ok(())) => Ok(value),
        }
    }

    async fn read<T, F>(&self, scope: &Scope<'_>, op: F) -> Result<T, TokenCacheError>
    where
        F: FnOnce() -> Result<T, TokenCacheError>,
    {
        let result = match self.before_access(scope).await {
            Ok(()) => op(),
            Err(error) => Err(error.into()),
        };
        self.after_access(scope, false, result).await
    }

    async fn write<T, F>(&self, scope: &Scope<'_>, op: F) -> Result<T, TokenCacheError>
    where
        F: FnOnce(&mut bool) -> Result<T, TokenCacheError>,
    {
        let _guard = self.write_lock.lock().await;

        let mut changed = false;
        let result = match self.before_access(scope).await {
            Ok(()) => match self.before_write(scope).await {
                Ok(()) => op(&mut changed),
                Err(error) => Err(error.into()),
            },
            Err(error) => Err(error.into()),
        };
        self.after_access(scope, changed, result).await
    }

    /// Stores the tokens from a provider response
    ///
    /// Older access tokens sharing a scope with the new one, for the same
    /// client, tenant and account, are deleted before it is inserted.
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id, authority = request.authority()))]
    pub async fn save_token_response(
        &self,
        request: SaveTokenRequest,
        response: TokenResponse,
    ) -> Result<SavedTokens, TokenCacheError> {
        let environment = environment_of(request.authority())
            .ok_or_else(|| MissingKeyComponent::new("environment"))?;

        let claims = response
            .id_token
            .as_ref()
            .and_then(|idt| IdTokenClaims::parse(idt.as_str()));

        let tenant_id = claims
            .as_ref()
            .and_then(|c| c.tid.clone())
            .map(TenantId::new)
            .or_else(|| request.tenant_id().cloned())
            .or_else(|| tenant_of(request.authority()).map(TenantId::new))
            .unwrap_or_else(|| TenantId::from_static(""));

        let raw_client_info = response.client_info.as_deref().filter(|s| !s.is_empty());
        let client_info = raw_client_info.and_then(|raw| ClientInfo::parse(raw).ok());
        let home_account_id: Option<HomeAccountId> = raw_client_info
            .and_then(home_account_id_from_raw)
            .or_else(|| {
                claims
                    .as_ref()
                    .and_then(IdTokenClaims::object_id)
                    .map(|oid| HomeAccountId::new(oid.to_owned()))
            });

        let scopes = response
            .scope
            .clone()
            .unwrap_or_else(|| request.scopes().clone());

        let mut scope = Scope::new(EntityKinds::ALL);
        if let Some(home) = &home_account_id {
            scope = scope.for_account(home);
        }
        scope.suggested_cache_key = match request.obo_cache_key() {
            Some(obo) => Some(obo.as_str().to_owned()),
            None => scope.suggested_cache_key.take().or_else(|| {
                Some(format!("{}_{}_AppTokenCache", self.client_id, tenant_id))
            }),
        };

        self.write(&scope, |changed| {
            let now = self.clock.now();

            let access_token = match (&response.access_token, response.expires_in) {
                (Some(secret), Some(expires_in)) => {
                    let mut builder = AccessToken::builder(
                        environment.clone(),
                        self.client_id.clone(),
                        tenant_id.clone(),
                        secret.clone(),
                        scopes.clone(),
                    )
                    .with_lifetime(now, now + expires_in)
                    .with_extended_expires_on(now + response.ext_expires_in.unwrap_or(expires_in));

                    if let Some(refresh_in) = response.refresh_in {
                        builder = builder.with_refresh_on(now + refresh_in);
                    }
                    if let Some(home) = &home_account_id {
                        builder = builder.with_home_account_id(home.clone());
                    }
                    if let Some(key_id) = request.key_id() {
                        builder = builder.with_key_id(key_id.clone());
                    }
                    if let Some(token_type) = &response.token_type {
                        builder = builder.with_token_type(token_type.clone());
                    }
                    if let Some(obo) = request.obo_cache_key() {
                        builder = builder.with_obo_cache_key(obo.clone());
                    }
                    Some(builder.build()?)
                }
                (Some(_), None) => {
                    tracing::warn!("access token has no lifetime, not caching it");
                    None
                }
                _ => None,
            };

            let id_token = match (&home_account_id, &response.id_token) {
                (Some(home), Some(secret)) => Some(IdToken::new(
                    home.clone(),
                    environment.clone(),
                    self.client_id.clone(),
                    tenant_id.clone(),
                    secret.clone(),
                )?),
                _ => None,
            };

            let account = match &home_account_id {
                Some(home) => {
                    let mut account = Account::new(
                        home.clone(),
                        environment.clone(),
                        tenant_id.clone(),
                        claims.as_ref().and_then(IdTokenClaims::username).unwrap_or_default(),
                        request.authority_type(),
                    )?;
                    if let Some(claims) = &claims {
                        if let Some(oid) = claims.object_id() {
                            account = account.with_local_account_id(oid);
                        }
                        if let Some(name) = &claims.name {
                            account = account.with_name(name.clone());
                        }
                        if let Some(given_name) = &claims.given_name {
                            account = account.with_given_name(given_name.clone());
                        }
                        if let Some(family_name) = &claims.family_name {
                            account = account.with_family_name(family_name.clone());
                        }
                    }
                    if let Some(raw) = raw_client_info {
                        account = account.with_client_info(raw);
                    }
                    if let Some(previous) = self.accessor.account(account.cache_key()) {
                        account.merge_wam_account_ids(&previous);
                    }
                    Some(account)
                }
                None => None,
            };

            let refresh_token = match (&home_account_id, &response.refresh_token) {
                (Some(home), Some(secret)) => {
                    let mut rt = RefreshToken::new(
                        home.clone(),
                        environment.clone(),
                        self.client_id.clone(),
                        secret.clone(),
                        response.family_id.clone(),
                    )?
                    .with_tenant_id(tenant_id.clone());
                    if let Some(obo) = request.obo_cache_key() {
                        rt = rt.with_obo_cache_key(obo.clone());
                    }
                    Some(rt)
                }
                (None, Some(_)) => {
                    tracing::warn!("refresh token cannot be tied to an account, not caching it");
                    None
                }
                _ => None,
            };

            let app_metadata = AppMetadata::new(
                environment.clone(),
                self.client_id.clone(),
                response.family_id.clone(),
            )?;

            if let Some(at) = &access_token {
                for stale in lookup::superseded_access_tokens(&*self.accessor, &*self.aliases, at) {
                    tracing::debug!(key = %stale.cache_key(), "deleting superseded access token");
                    self.accessor.delete_access_token(stale.cache_key());
                }
                self.accessor.save_access_token(at.clone());
            }
            if let Some(idt) = &id_token {
                self.accessor.save_id_token(idt.clone());
            }
            if let Some(account) = &account {
                self.accessor.save_account(account.clone());
            }
            if let Some(rt) = &refresh_token {
                self.accessor.save_refresh_token(rt.clone());
            }
            self.accessor.save_app_metadata(app_metadata);
            *changed = true;

            if let (Some(legacy), None) = (self.legacy(), request.obo_cache_key()) {
                let unique_id = client_info
                    .as_ref()
                    .map(|ci| ci.uid.as_str())
                    .or_else(|| claims.as_ref().and_then(IdTokenClaims::object_id));
                interop::write_legacy_refresh_token(
                    legacy,
                    LegacyWriteThrough {
                        authority: request.authority(),
                        refresh_token: refresh_token.as_ref(),
                        id_token: id_token.as_ref(),
                        unique_id,
                        raw_client_info,
                        scopes: &scopes,
                    },
                );
            }

            tracing::debug!(
                access_token = access_token.is_some(),
                refresh_token = refresh_token.is_some(),
                id_token = id_token.is_some(),
                "saved token response"
            );

            Ok(SavedTokens {
                access_token,
                refresh_token,
                id_token,
                account,
            })
        })
        .await
    }

    /// Finds a usable access token for the request
    ///
    /// Tokens inside the expiration buffer are a miss but are left in place.
    /// Expired tokens that can no longer be refreshed are evicted.
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id, environment = %query.environment))]
    pub async fn find_access_token(
        &self,
        query: &AccessTokenQuery<'_>,
    ) -> Result<Option<AccessTokenMatch>, TokenCacheError> {
        let mut scope = Scope::new(EntityKinds::from(EntityKind::AccessToken));
        if let Some(home) = query.home_account_id {
            scope = scope.for_account(home);
        } else if let Some(tenant) = query.tenant_id {
            scope.suggested_cache_key =
                Some(format!("{}_{}_AppTokenCache", query.client_id, tenant));
        }
        if let Some(obo) = query.obo_cache_key {
            scope.suggested_cache_key = Some(obo.as_str().to_owned());
        }

        if let Err(error) = self.before_access(&scope).await {
            return self.after_access(&scope, false, Err(error.into())).await;
        }

        let now = self.clock.now();
        let found = lookup::find_access_token(&*self.accessor, &*self.aliases, &self.config, query, now);

        let mut changed = false;
        let mut _guard = None;
        let result: Result<Option<AccessTokenMatch>, TokenCacheError> = match found {
            Ok(Some(m)) if m.is_usable() => Ok(Some(m)),
            Ok(Some(m)) => {
                if lookup::is_dead_access_token(&*self.accessor, &*self.aliases, &self.config, &m.token, now) {
                    _guard = Some(self.write_lock.lock().await);
                    match self.before_write(&scope).await {
                        Ok(()) => {
                            tracing::debug!(key = %m.token.cache_key(), "evicting dead access token");
                            changed = self.accessor.delete_access_token(m.token.cache_key());
                            Ok(None)
                        }
                        Err(error) => Err(error.into()),
                    }
                } else {
                    tracing::debug!(outcome = ?m.outcome, "cached access token is not usable");
                    Ok(None)
                }
            }
            Ok(None) => Ok(None),
            Err(error) => Err(error.into()),
        };

        self.after_access(&scope, changed, result).await
    }

    /// Finds a refresh token for the account
    ///
    /// When the current cache has none and legacy compatibility is enabled,
    /// the legacy cache is consulted for the account.
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id, environment = %query.environment))]
    pub async fn find_refresh_token(
        &self,
        query: &RefreshTokenQuery<'_>,
    ) -> Result<Option<RefreshTokenMatch>, TokenCacheError> {
        let mut scope = Scope::new(EntityKinds::from(EntityKind::RefreshToken))
            .for_account(query.home_account_id);
        if let Some(obo) = query.obo_cache_key {
            scope.suggested_cache_key = Some(obo.as_str().to_owned());
        }

        self.read(&scope, || {
            let found = lookup::find_refresh_token(&*self.accessor, &*self.aliases, &self.config, query);
            if found.is_some() || query.obo_cache_key.is_some() {
                return Ok(found);
            }

            let legacy = match self.legacy() {
                Some(legacy) => legacy,
                None => return Ok(None),
            };

            let token = self
                .find_account(query.home_account_id, query.environment)
                .and_then(|account| {
                    interop::legacy_refresh_token_for_account(
                        legacy,
                        &*self.aliases,
                        query.environment,
                        query.client_id,
                        &account,
                    )
                });

            Ok(token.map(|token| {
                tracing::debug!("refresh token found in legacy cache");
                RefreshTokenMatch {
                    token,
                    source: RefreshTokenSource::Legacy,
                }
            }))
        })
        .await
    }

    /// Whether this client belongs to a family, according to its metadata
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id, environment = %environment))]
    pub async fn family_membership(
        &self,
        environment: &EnvironmentRef,
    ) -> Result<FamilyMembership, TokenCacheError> {
        let scope = Scope::new(EntityKinds::from(EntityKind::AppMetadata));
        self.read(&scope, || {
            Ok(lookup::family_membership(
                &*self.accessor,
                &*self.aliases,
                environment,
                &self.client_id,
            ))
        })
        .await
    }

    /// The accounts that hold a refresh token for this client in
    /// `environment`
    ///
    /// With legacy compatibility enabled, users known only to the legacy
    /// cache are included when their entries identify them.
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id, environment = %environment))]
    pub async fn accounts(&self, environment: &EnvironmentRef) -> Result<Vec<Account>, TokenCacheError> {
        let scope = Scope::new(
            EntityKinds::from(EntityKind::Account).with(EntityKind::RefreshToken),
        );
        self.read(&scope, || {
            let refresh_tokens: Vec<RefreshToken> = self
                .accessor
                .refresh_tokens()
                .into_iter()
                .filter(|rt| {
                    rt.client_id().as_str().eq_ignore_ascii_case(self.client_id.as_str())
                        && self.aliases.is_alias(rt.environment(), environment)
                })
                .collect();

            let mut accounts: Vec<Account> = self
                .accessor
                .accounts()
                .into_iter()
                .filter(|a| {
                    self.aliases.is_alias(a.environment(), environment)
                        && refresh_tokens.iter().any(|rt| {
                            rt.home_account_id()
                                .as_str()
                                .eq_ignore_ascii_case(a.home_account_id().as_str())
                        })
                })
                .collect();

            if let Some(legacy) = self.legacy() {
                let users = interop::legacy_users(legacy, &self.client_id);
                for (home, user) in users.with_client_info {
                    let env = match environment_of(&user.authority) {
                        Some(env) if self.aliases.is_alias(&env, environment) => env,
                        _ => continue,
                    };
                    if accounts
                        .iter()
                        .any(|a| a.home_account_id().as_str().eq_ignore_ascii_case(&home))
                    {
                        continue;
                    }

                    let tenant = tenant_of(&user.authority).unwrap_or_default();
                    let username = user.user_info.displayable_id.clone().unwrap_or_default();
                    match Account::new(
                        HomeAccountId::new(home),
                        env,
                        TenantId::new(tenant),
                        username,
                        AuthorityType::MsSts,
                    ) {
                        Ok(account) => {
                            let account = match &user.raw_client_info {
                                Some(raw) => account.with_client_info(raw.clone()),
                                None => account,
                            };
                            accounts.push(account);
                        }
                        Err(error) => tracing::debug!(
                            error = (&error as &dyn std::error::Error),
                            "skipping legacy user"
                        ),
                    }
                }
            }

            tracing::debug!(count = accounts.len(), "listed accounts");
            Ok(accounts)
        })
        .await
    }

    fn find_account(&self, home_account_id: &HomeAccountIdRef, environment: &EnvironmentRef) -> Option<Account> {
        let matching: Vec<Account> = self
            .accessor
            .accounts()
            .into_iter()
            .filter(|a| {
                a.home_account_id()
                    .as_str()
                    .eq_ignore_ascii_case(home_account_id.as_str())
                    && self.aliases.is_alias(a.environment(), environment)
            })
            .collect();

        matching
            .iter()
            .find(|a| a.environment().eq_ignore_case(environment))
            .or_else(|| matching.first())
            .cloned()
    }

    /// The account with the given home account id in `environment`
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id, environment = %environment))]
    pub async fn account_for(
        &self,
        home_account_id: &HomeAccountIdRef,
        environment: &EnvironmentRef,
    ) -> Result<Option<Account>, TokenCacheError> {
        let scope = Scope::new(EntityKinds::from(EntityKind::Account)).for_account(home_account_id);
        self.read(&scope, || Ok(self.find_account(home_account_id, environment)))
            .await
    }

    /// The ID token this client holds for `account`
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id))]
    pub async fn id_token_for(&self, account: &Account) -> Result<Option<IdToken>, TokenCacheError> {
        let scope =
            Scope::new(EntityKinds::from(EntityKind::IdToken)).for_account(account.home_account_id());
        self.read(&scope, || {
            let matching: Vec<IdToken> = self
                .accessor
                .id_tokens()
                .into_iter()
                .filter(|idt| {
                    idt.home_account_id()
                        .as_str()
                        .eq_ignore_ascii_case(account.home_account_id().as_str())
                        && idt.client_id().as_str().eq_ignore_ascii_case(self.client_id.as_str())
                        && idt
                            .tenant_id()
                            .as_str()
                            .eq_ignore_ascii_case(account.tenant_id().as_str())
                        && self.aliases.is_alias(idt.environment(), account.environment())
                })
                .collect();

            Ok(matching
                .iter()
                .find(|idt| idt.environment().eq_ignore_case(account.environment()))
                .or_else(|| matching.first())
                .cloned())
        })
        .await
    }

    /// Removes everything this client holds for `account`
    ///
    /// Family refresh tokens for the account are removed too when this
    /// client belongs to their family. Application metadata is kept.
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id))]
    pub async fn remove_account(&self, account: &Account) -> Result<(), TokenCacheError> {
        let home = account.home_account_id();
        let environment = account.environment();
        let scope = Scope::new(CREDENTIAL_KINDS).for_account(home);

        self.write(&scope, |changed| {
            let for_account = |h: &str, env: &EnvironmentRef| {
                h.eq_ignore_ascii_case(home.as_str()) && self.aliases.is_alias(env, environment)
            };
            let ours = |c: &ClientIdRef| c.as_str().eq_ignore_ascii_case(self.client_id.as_str());

            let family = match lookup::family_membership(
                &*self.accessor,
                &*self.aliases,
                environment,
                &self.client_id,
            ) {
                FamilyMembership::Member(family) => Some(family),
                _ => None,
            };

            let mut removed = 0_usize;
            for at in self.accessor.access_tokens() {
                let at_home = at.home_account_id().map(|h| h.as_str()).unwrap_or_default();
                if for_account(at_home, at.environment()) && ours(at.client_id()) {
                    removed += usize::from(self.accessor.delete_access_token(at.cache_key()));
                }
            }
            for rt in self.accessor.refresh_tokens() {
                let in_family = match (&family, rt.family_id()) {
                    (Some(family), Some(rt_family)) => {
                        rt_family.as_str().eq_ignore_ascii_case(family.as_str())
                    }
                    _ => false,
                };
                if for_account(rt.home_account_id().as_str(), rt.environment())
                    && (ours(rt.client_id()) || in_family)
                {
                    removed += usize::from(self.accessor.delete_refresh_token(rt.cache_key()));
                }
            }
            for idt in self.accessor.id_tokens() {
                if for_account(idt.home_account_id().as_str(), idt.environment()) && ours(idt.client_id()) {
                    removed += usize::from(self.accessor.delete_id_token(idt.cache_key()));
                }
            }
            for a in self.accessor.accounts() {
                if for_account(a.home_account_id().as_str(), a.environment()) {
                    removed += usize::from(self.accessor.delete_account(a.cache_key()));
                }
            }
            *changed = removed > 0;

            if let Some(legacy) = self.legacy() {
                interop::remove_legacy_user(
                    legacy,
                    &self.client_id,
                    account.username(),
                    Some(home.as_str()),
                );
                *changed = true;
            }

            tracing::info!(removed, "removed account from cache");
            Ok(())
        })
        .await
    }

    /// Removes the access and refresh tokens in an on-behalf-of partition
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id))]
    pub async fn remove_obo_tokens(&self, obo_cache_key: &OboCacheKeyRef) -> Result<usize, TokenCacheError> {
        let mut scope = Scope::new(
            EntityKinds::from(EntityKind::AccessToken).with(EntityKind::RefreshToken),
        );
        scope.suggested_cache_key = Some(obo_cache_key.as_str().to_owned());

        self.write(&scope, |changed| {
            let in_partition = |k: Option<&OboCacheKeyRef>| k.map_or(false, |k| k.as_str() == obo_cache_key.as_str());

            let mut removed = 0_usize;
            for at in self.accessor.access_tokens() {
                if in_partition(at.obo_cache_key()) {
                    removed += usize::from(self.accessor.delete_access_token(at.cache_key()));
                }
            }
            for rt in self.accessor.refresh_tokens() {
                if in_partition(rt.obo_cache_key()) {
                    removed += usize::from(self.accessor.delete_refresh_token(rt.cache_key()));
                }
            }
            *changed = removed > 0;

            tracing::info!(removed, "removed on-behalf-of tokens");
            Ok(removed)
        })
        .await
    }

    /// Removes every token and account; application metadata is kept
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id))]
    pub async fn clear(&self) -> Result<(), TokenCacheError> {
        let scope = Scope::new(CREDENTIAL_KINDS);
        self.write(&scope, |changed| {
            self.accessor.clear();
            *changed = true;
            tracing::info!("cleared token cache");
            Ok(())
        })
        .await
    }

    /// Serializes the current cache document
    ///
    /// No notifications fire; this is meant to be called by hosts that
    /// manage persistence themselves.
    pub fn serialize(&self) -> Result<Vec<u8>, TokenCacheError> {
        Ok(serialization::serialize(&*self.accessor)?)
    }

    /// Loads a current cache document, replacing each bucket it contains
    ///
    /// Waits for in-flight writes. Must not be called from inside a
    /// notification; use the serializer passed to the callback instead.
    pub async fn deserialize(&self, data: &[u8]) -> Result<EntityKinds, TokenCacheError> {
        let _guard = self.write_lock.lock().await;
        Ok(serialization::deserialize(&*self.accessor, data)?)
    }

    /// The legacy blob, normalized
    ///
    /// Without legacy persistence, this is an empty blob.
    pub fn serialize_legacy(&self) -> Vec<u8> {
        let dict = self
            .legacy
            .as_deref()
            .map(|legacy| interop::load_legacy_cache(legacy))
            .unwrap_or_default();
        codec::serialize(&dict)
    }

    /// Replaces the legacy blob
    ///
    /// A blob that cannot be read replaces the legacy cache with an empty
    /// one. Without legacy persistence, this does nothing.
    pub async fn deserialize_legacy(&self, data: &[u8]) {
        let legacy = match self.legacy.as_deref() {
            Some(legacy) => legacy,
            None => {
                tracing::debug!("no legacy persistence, ignoring legacy blob");
                return;
            }
        };

        let _guard = self.write_lock.lock().await;
        let dict = codec::deserialize(data);
        if let Err(error) = legacy.store(&codec::serialize(&dict)) {
            tracing::warn!(error = (&*error as &dyn std::error::Error), "unable to replace legacy cache");
        }
    }

    /// Copies refresh tokens and accounts this client holds only in the
    /// legacy cache into the current cache
    ///
    /// Returns the number of refresh tokens added.
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.client_id))]
    pub async fn migrate_legacy_cache(&self) -> Result<usize, TokenCacheError> {
        let scope = Scope::new(
            EntityKinds::from(EntityKind::RefreshToken).with(EntityKind::Account),
        );
        let legacy = match self.legacy() {
            Some(legacy) => legacy,
            None => return Ok(0),
        };

        self.write(&scope, |changed| {
            let mut migrated = 0_usize;
            for (rt, account) in interop::migrate_legacy_entries(legacy, &self.client_id) {
                if self.accessor.refresh_token(rt.cache_key()).is_some() {
                    continue;
                }
                if self.accessor.account(account.cache_key()).is_none() {
                    self.accessor.save_account(account);
                }
                self.accessor.save_refresh_token(rt);
                migrated += 1;
            }
            *changed = migrated > 0;

            tracing::info!(migrated, "migrated legacy refresh tokens");
            Ok(migrated)
        })
        .await
    }

    /// The current time according to the cache's clock
    pub fn now(&self) -> UnixTime {
        self.clock.now()
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("client_id", &self.client_id)
            .field("config", &self.config)
            .field("accessor", &self.accessor)
            .field("notification", &self.notification)
            .field("legacy", &self.legacy.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use idcache_clock::{DurationSecs, TestClock};
    use serde_json::json;

    use super::*;
    use crate::{
        accessor::fixtures::{self, CLIENT, ENV},
        braids::{AccessTokenSecret, Environment, FamilyId, OboCacheKey, RefreshTokenSecret},
        entities::encode_test_id_token,
        legacy::InMemoryLegacyPersistence,
        persistence::{InMemoryCachePersistence, PersistentCacheNotification},
        scope::ScopeSet,
    };

    const AUTHORITY: &str = "https://login.example.com/contoso/";
    const HOME: &str = "uid.utid";

    #[derive(Clone, Debug, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
        fail_before_write: bool,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    #[async_trait]
    impl TokenCacheNotification for Recorder {
        async fn before_access(
            &self,
            args: &TokenCacheNotificationArgs<'_>,
        ) -> Result<(), NotificationError> {
            self.push(format!("before_access {}", args.client_id()));
            Ok(())
        }

        async fn before_write(
            &self,
            _args: &TokenCacheNotificationArgs<'_>,
        ) -> Result<(), NotificationError> {
            self.push("before_write".to_owned());
            if self.fail_before_write {
                return Err(NotificationError::new("lock unavailable"));
            }
            Ok(())
        }

        async fn after_access(
            &self,
            args: &TokenCacheNotificationArgs<'_>,
        ) -> Result<(), NotificationError> {
            self.push(format!("after_access changed={}", args.has_state_changed()));
            Ok(())
        }
    }

    fn clock() -> TestClock {
        TestClock::new(UnixTime(1_000_000))
    }

    fn user_response(at: &str, scopes: &str) -> TokenResponse {
        TokenResponse {
            access_token: Some(AccessTokenSecret::new(at.to_owned())),
            expires_in: Some(DurationSecs(3599)),
            scope: Some(ScopeSet::parse(scopes)),
            refresh_token: Some(RefreshTokenSecret::from_static("rt-1")),
            id_token: Some(encode_test_id_token(&json!({
                "oid": "uid",
                "tid": "contoso",
                "preferred_username": "user@contoso.com",
                "name": "A User",
            }))),
            client_info: Some(ClientInfo::new("uid", "utid").encode()),
            ..TokenResponse::default()
        }
    }

    fn at_query<'a>(
        env: &'a Environment,
        client: &'a ClientId,
        tenant: &'a TenantId,
        home: Option<&'a HomeAccountId>,
        scopes: &'a ScopeSet,
    ) -> AccessTokenQuery<'a> {
        AccessTokenQuery {
            environment: env,
            client_id: client,
            tenant_id: Some(tenant),
            home_account_id: home.map(|h| &**h),
            scopes,
            key_id: None,
            token_type: None,
            obo_cache_key: None,
        }
    }

    #[tokio::test]
    async fn expiry_buffer_and_superseding_writes() -> color_eyre::Result<()> {
        let clock = clock();
        let cache = TokenCache::new(ClientId::from_static(CLIENT)).with_clock(clock.clone());

        cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;

        let env = Environment::from_static(ENV);
        let client = ClientId::from_static(CLIENT);
        let tenant = TenantId::from_static("contoso");
        let home = HomeAccountId::from_static(HOME);
        let scopes = ScopeSet::parse("User.Read");
        let query = at_query(&env, &client, &tenant, Some(&home), &scopes);

        let hit = cache.find_access_token(&query).await?;
        assert_eq!(hit.map(|m| m.token.secret().as_str().to_owned()), Some("at-1".to_owned()));

        clock.advance(DurationSecs(3599 - 200));
        assert_eq!(cache.find_access_token(&query).await?, None);
        assert_eq!(cache.accessor().access_tokens().len(), 1);

        cache
            .save_token_response(
                SaveTokenRequest::new(AUTHORITY),
                user_response("at-2", "User.Read User.Read.All"),
            )
            .await?;

        let remaining = cache.accessor().access_tokens();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].secret().as_str(), "at-2");
        assert_eq!(remaining[0].scopes(), &ScopeSet::parse("user.read user.read.all"));
        Ok(())
    }

    #[tokio::test]
    async fn save_derives_account_from_response() -> color_eyre::Result<()> {
        let cache = TokenCache::new(ClientId::from_static(CLIENT)).with_clock(clock());

        let saved = cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;

        let account = saved.account.ok_or_else(|| color_eyre::eyre::eyre!("no account"))?;
        assert_eq!(account.home_account_id().as_str(), HOME);
        assert_eq!(account.tenant_id().as_str(), "contoso");
        assert_eq!(account.username(), "user@contoso.com");
        assert_eq!(account.local_account_id(), "uid");
        assert_eq!(account.name(), Some("A User"));

        let rt = saved.refresh_token.ok_or_else(|| color_eyre::eyre::eyre!("no refresh token"))?;
        assert_eq!(rt.tenant_id().map(|t| t.as_str()), Some("contoso"));
        assert!(saved.id_token.is_some());
        assert_eq!(cache.accessor().all_app_metadata().len(), 1);

        let env = Environment::from_static(ENV);
        let accounts = cache.accounts(&env).await?;
        assert_eq!(accounts, vec![account.clone()]);

        let idt = cache.id_token_for(&account).await?;
        assert_eq!(idt, saved.id_token);

        let found = cache.account_for(account.home_account_id(), &env).await?;
        assert_eq!(found, Some(account));
        Ok(())
    }

    #[tokio::test]
    async fn app_only_tokens_use_an_empty_home_account() -> color_eyre::Result<()> {
        let cache = TokenCache::new(ClientId::from_static(CLIENT)).with_clock(clock());
        let response = TokenResponse {
            access_token: Some(AccessTokenSecret::from_static("app-at")),
            expires_in: Some(DurationSecs(3599)),
            ..TokenResponse::default()
        };
        let request = SaveTokenRequest::new(AUTHORITY).with_scopes(ScopeSet::parse("api://res/.default"));

        let saved = cache.save_token_response(request, response).await?;
        let at = saved.access_token.ok_or_else(|| color_eyre::eyre::eyre!("no access token"))?;
        assert_eq!(at.home_account_id(), None);
        assert!(saved.account.is_none());
        assert!(saved.refresh_token.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_environment_is_rejected() {
        let cache = TokenCache::new(ClientId::from_static(CLIENT));
        let result = cache
            .save_token_response(SaveTokenRequest::new(""), TokenResponse::default())
            .await;
        assert!(matches!(result, Err(TokenCacheError::InvalidEntity(_))));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn dead_app_tokens_are_evicted() -> color_eyre::Result<()> {
        let clock = clock();
        let recorder = Recorder::default();
        let cache = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock.clone())
            .with_notification(recorder.clone());

        let response = TokenResponse {
            access_token: Some(AccessTokenSecret::from_static("app-at")),
            expires_in: Some(DurationSecs(60)),
            scope: Some(ScopeSet::parse("api://res/.default")),
            ..TokenResponse::default()
        };
        cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), response)
            .await?;
        recorder.take();

        clock.advance(DurationSecs(120));

        let env = Environment::from_static(ENV);
        let client = ClientId::from_static(CLIENT);
        let tenant = TenantId::from_static("contoso");
        let scopes = ScopeSet::parse("api://res/.default");
        let query = at_query(&env, &client, &tenant, None, &scopes);

        assert_eq!(cache.find_access_token(&query).await?, None);
        assert!(cache.accessor().access_tokens().is_empty());
        assert!(logs_contain("evicting dead access token"));
        assert_eq!(
            recorder.take(),
            vec![
                "before_access client-1".to_owned(),
                "before_write".to_owned(),
                "after_access changed=true".to_owned(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn expired_user_tokens_with_refresh_token_are_kept() -> color_eyre::Result<()> {
        let clock = clock();
        let cache = TokenCache::new(ClientId::from_static(CLIENT)).with_clock(clock.clone());
        cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;

        clock.advance(DurationSecs(4000));

        let env = Environment::from_static(ENV);
        let client = ClientId::from_static(CLIENT);
        let tenant = TenantId::from_static("contoso");
        let home = HomeAccountId::from_static(HOME);
        let scopes = ScopeSet::parse("User.Read");
        let query = at_query(&env, &client, &tenant, Some(&home), &scopes);

        assert_eq!(cache.find_access_token(&query).await?, None);
        assert_eq!(cache.accessor().access_tokens().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn notifications_bracket_reads_and_writes() -> color_eyre::Result<()> {
        let recorder = Recorder::default();
        let cache = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_notification(recorder.clone());

        cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;
        assert_eq!(
            recorder.take(),
            vec![
                "before_access client-1".to_owned(),
                "before_write".to_owned(),
                "after_access changed=true".to_owned(),
            ]
        );

        let env = Environment::from_static(ENV);
        cache.family_membership(&env).await?;
        assert_eq!(
            recorder.take(),
            vec![
                "before_access client-1".to_owned(),
                "after_access changed=false".to_owned(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_before_write_still_fires_after_access() {
        let recorder = Recorder {
            fail_before_write: true,
            ..Recorder::default()
        };
        let cache = TokenCache::new(ClientId::from_static(CLIENT)).with_notification(recorder.clone());

        let result = cache.clear().await;

        assert!(matches!(result, Err(TokenCacheError::Notification(_))));
        assert_eq!(
            recorder.take(),
            vec![
                "before_access client-1".to_owned(),
                "before_write".to_owned(),
                "after_access changed=false".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn clear_keeps_app_metadata() -> color_eyre::Result<()> {
        let cache = TokenCache::new(ClientId::from_static(CLIENT)).with_clock(clock());
        cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;

        cache.clear().await?;

        assert!(!cache.accessor().has_access_or_refresh_tokens());
        assert!(cache.accessor().accounts().is_empty());
        assert!(cache.accessor().id_tokens().is_empty());
        assert_eq!(cache.accessor().all_app_metadata().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn remove_account_removes_every_kind() -> color_eyre::Result<()> {
        let legacy = Arc::new(InMemoryLegacyPersistence::new());
        let cache = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_legacy_persistence(legacy.clone());
        let saved = cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;
        assert_eq!(codec::deserialize(&legacy.contents()).len(), 1);

        let account = saved.account.ok_or_else(|| color_eyre::eyre::eyre!("no account"))?;
        cache.remove_account(&account).await?;

        let accessor = cache.accessor();
        assert!(accessor.access_tokens().is_empty());
        assert!(accessor.refresh_tokens().is_empty());
        assert!(accessor.id_tokens().is_empty());
        assert!(accessor.accounts().is_empty());
        assert_eq!(accessor.all_app_metadata().len(), 1);
        assert!(codec::deserialize(&legacy.contents()).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn family_refresh_tokens_serve_family_members() -> color_eyre::Result<()> {
        let accessor: Arc<dyn TokenCacheAccessor> = Arc::new(InMemoryAccessor::new());
        let first = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_accessor(accessor.clone());
        let mut response = user_response("at-1", "User.Read");
        response.family_id = Some(FamilyId::from_static("1"));
        first
            .save_token_response(SaveTokenRequest::new(AUTHORITY), response)
            .await?;

        let second = TokenCache::new(ClientId::from_static("client-2"))
            .with_clock(clock())
            .with_accessor(accessor.clone());

        let env = Environment::from_static(ENV);
        let home = HomeAccountId::from_static(HOME);
        let client = ClientId::from_static("client-2");
        let query = RefreshTokenQuery {
            environment: &env,
            client_id: &client,
            home_account_id: &home,
            tenant_id: None,
            obo_cache_key: None,
        };

        assert_eq!(second.find_refresh_token(&query).await?, None);
        assert_eq!(second.family_membership(&env).await?, FamilyMembership::Unknown);

        accessor.save_app_metadata(fixtures::app_metadata("client-2", Some("1")));

        let found = second
            .find_refresh_token(&query)
            .await?
            .ok_or_else(|| color_eyre::eyre::eyre!("no refresh token"))?;
        assert_eq!(found.source, RefreshTokenSource::Family);
        assert_eq!(found.token.secret().as_str(), "rt-1");
        Ok(())
    }

    #[tokio::test]
    async fn legacy_users_and_refresh_tokens_fill_gaps() -> color_eyre::Result<()> {
        let legacy = Arc::new(InMemoryLegacyPersistence::new());
        let cache = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_legacy_persistence(legacy.clone());
        let saved = cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;
        let account = saved.account.ok_or_else(|| color_eyre::eyre::eyre!("no account"))?;

        cache.accessor().clear_kind(EntityKind::RefreshToken);

        let env = Environment::from_static(ENV);
        let accounts = cache.accounts(&env).await?;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].home_account_id().as_str(), HOME);

        let client = ClientId::from_static(CLIENT);
        let query = RefreshTokenQuery {
            environment: &env,
            client_id: &client,
            home_account_id: account.home_account_id(),
            tenant_id: None,
            obo_cache_key: None,
        };
        let found = cache
            .find_refresh_token(&query)
            .await?
            .ok_or_else(|| color_eyre::eyre::eyre!("no refresh token"))?;
        assert_eq!(found.source, RefreshTokenSource::Legacy);
        assert_eq!(found.token.secret().as_str(), "rt-1");

        assert_eq!(cache.migrate_legacy_cache().await?, 1);
        assert_eq!(cache.accessor().refresh_tokens().len(), 1);
        assert_eq!(cache.migrate_legacy_cache().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn legacy_compatibility_can_be_disabled() -> color_eyre::Result<()> {
        let legacy = Arc::new(InMemoryLegacyPersistence::new());
        let cache = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_config(TokenCacheConfig::new().with_legacy_compatibility(false))
            .with_legacy_persistence(legacy.clone());

        cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;

        assert!(legacy.contents().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn obo_tokens_are_partitioned() -> color_eyre::Result<()> {
        let legacy = Arc::new(InMemoryLegacyPersistence::new());
        let cache = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_legacy_persistence(legacy.clone());
        let request = SaveTokenRequest::new(AUTHORITY)
            .with_obo_cache_key(OboCacheKey::from_static("assertion-hash"));

        cache
            .save_token_response(request, user_response("obo-at", "User.Read"))
            .await?;
        assert!(legacy.contents().is_empty());

        let removed = cache
            .remove_obo_tokens(OboCacheKeyRef::from_static("assertion-hash"))
            .await?;
        assert_eq!(removed, 2);
        assert!(!cache.accessor().has_access_or_refresh_tokens());
        Ok(())
    }

    #[tokio::test]
    async fn persistent_notification_shares_state_between_caches() -> color_eyre::Result<()> {
        let persistence = Arc::new(InMemoryCachePersistence::new());

        let writer = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_notification(PersistentCacheNotification::new(persistence.clone()));
        writer
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;
        assert!(!persistence.contents().is_empty());

        let reader = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_notification(PersistentCacheNotification::new(persistence.clone()));

        let env = Environment::from_static(ENV);
        let client = ClientId::from_static(CLIENT);
        let tenant = TenantId::from_static("contoso");
        let home = HomeAccountId::from_static(HOME);
        let scopes = ScopeSet::parse("User.Read");
        let query = at_query(&env, &client, &tenant, Some(&home), &scopes);

        let hit = reader.find_access_token(&query).await?;
        assert_eq!(hit.map(|m| m.token.secret().as_str().to_owned()), Some("at-1".to_owned()));
        Ok(())
    }

    #[tokio::test]
    async fn serialize_and_legacy_round_trip() -> color_eyre::Result<()> {
        let legacy = Arc::new(InMemoryLegacyPersistence::new());
        let cache = TokenCache::new(ClientId::from_static(CLIENT))
            .with_clock(clock())
            .with_legacy_persistence(legacy.clone());
        cache
            .save_token_response(SaveTokenRequest::new(AUTHORITY), user_response("at-1", "User.Read"))
            .await?;

        let data = cache.serialize()?;
        let blob = cache.serialize_legacy();

        let restored = TokenCache::new(ClientId::from_static(CLIENT))
            .with_legacy_persistence(Arc::new(InMemoryLegacyPersistence::new()));
        assert_eq!(restored.deserialize(&data).await?, EntityKinds::ALL);
        restored.deserialize_legacy(&blob).await;

        assert_eq!(restored.accessor().access_tokens(), cache.accessor().access_tokens());
        assert_eq!(restored.serialize_legacy(), blob);

        restored.deserialize_legacy(&[1, 0, 0, 0, 0, 0, 0, 0]).await;
        assert_eq!(restored.serialize_legacy(), codec::serialize(&Default::default()));
        Ok(())
    }

    #[tokio::test]
    async fn id_token_claims_fill_tenant_when_authority_is_common() -> color_eyre::Result<()> {
        let cache = TokenCache::new(ClientId::from_static(CLIENT)).with_clock(clock());
        let mut response = user_response("at-1", "User.Read");
        response.id_token = Some(encode_test_id_token(&json!({
            "oid": "uid",
            "tid": "utid",
            "preferred_username": "user@contoso.com",
        })));

        let saved = cache
            .save_token_response(SaveTokenRequest::new("https://login.example.com/common/"), response)
            .await?;

        let at = saved.access_token.ok_or_else(|| color_eyre::eyre::eyre!("no access token"))?;
        assert_eq!(at.tenant_id().as_str(), "utid");
        Ok(())
    }
}

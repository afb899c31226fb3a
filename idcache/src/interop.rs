//! Interop between the legacy and current caches
//!
//! Every operation here is best effort. A failure to read or write legacy
//! state is logged and treated as "no legacy data"; it never blocks an
//! operation on the current cache.

use std::{collections::BTreeMap, error, fmt};

use thiserror::Error;

use crate::{
    aliases::{environment_of, tenant_of, AuthorityAliases},
    braids::{
        ClientId, ClientIdRef, Environment, EnvironmentRef, HomeAccountId, RefreshTokenSecret,
        TenantId,
    },
    client_info::{home_account_id_from_raw, ClientInfo},
    entities::{Account, AuthorityType, IdToken, InvalidEntity, RefreshToken},
    legacy::{
        codec, InvalidLegacyKey, LegacyCacheKey, LegacyCachePersistence, LegacyResult,
        LegacyResultWrapper, LegacyTokenDictionary, LegacyUserInfo, TokenSubjectType,
    },
    scope::ScopeSet,
};

/// Logged when a refresh token and its ID token name different environments
pub const DIFFERENT_ENVIRONMENT: &str =
    "refresh token and ID token have different environments when writing to the legacy cache";
/// Logged when the authority host differs from the refresh token's environment
pub const DIFFERENT_AUTHORITY: &str =
    "authority host differs from the refresh token and ID token environment";

#[derive(Debug, Error)]
enum InteropError {
    #[error("unable to build legacy key")]
    Key(#[from] InvalidLegacyKey),
    #[error("unable to load legacy cache")]
    Load(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    #[error("unable to store legacy cache")]
    Store(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

fn try_load(
    persistence: &dyn LegacyCachePersistence,
) -> Result<LegacyTokenDictionary, InteropError> {
    let data = persistence.load().map_err(InteropError::Load)?;
    Ok(codec::deserialize(&data))
}

fn try_store(
    persistence: &dyn LegacyCachePersistence,
    dict: &LegacyTokenDictionary,
) -> Result<(), InteropError> {
    persistence
        .store(&codec::serialize(dict))
        .map_err(InteropError::Store)
}

/// Loads the legacy dictionary, treating any failure as an empty cache
pub fn load_legacy_cache(persistence: &dyn LegacyCachePersistence) -> LegacyTokenDictionary {
    match try_load(persistence) {
        Ok(dict) => dict,
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "treating unreadable legacy cache as empty"
            );
            LegacyTokenDictionary::new()
        }
    }
}

fn entry_environment(key: &LegacyCacheKey) -> Option<Environment> {
    environment_of(key.authority())
}

fn matches_environment(
    key: &LegacyCacheKey,
    environment: &EnvironmentRef,
    aliases: &dyn AuthorityAliases,
) -> bool {
    entry_environment(key).map_or(false, |env| aliases.is_alias(&env, environment))
}

/// A refresh token about to be written through to the legacy cache
#[derive(Clone, Copy, Debug)]
pub struct LegacyWriteThrough<'a> {
    /// The authority the token was acquired from
    pub authority: &'a str,
    /// The newly obtained refresh token
    pub refresh_token: Option<&'a RefreshToken>,
    /// The ID token received alongside it
    pub id_token: Option<&'a IdToken>,
    /// The user's unique id
    pub unique_id: Option<&'a str>,
    /// The raw client info received alongside it
    pub raw_client_info: Option<&'a str>,
    /// The scopes the token was issued for
    pub scopes: &'a ScopeSet,
}

/// Upserts a legacy entry for a newly obtained refresh token
///
/// Family refresh tokens are never written to the legacy cache. The scopes
/// take the place of the legacy resource and are also recorded as the
/// resource in the response, so legacy readers treat the token as a
/// multi-resource refresh token.
pub fn write_legacy_refresh_token(
    persistence: &dyn LegacyCachePersistence,
    write: LegacyWriteThrough<'_>,
) {
    let rt = match write.refresh_token {
        Some(rt) => rt,
        None => {
            tracing::info!("no refresh token, skipping legacy cache write");
            return;
        }
    };

    if rt.is_family_refresh_token() {
        tracing::info!("not writing family refresh token to legacy cache");
        return;
    }

    if let Err(error) = try_write_legacy_refresh_token(persistence, rt, &write) {
        let rt_environment = rt.environment().as_str();
        let id_token_environment = write.id_token.map(|idt| idt.environment().as_str());
        let authority_host = environment_of(write.authority);

        if id_token_environment.map_or(false, |env| !env.eq_ignore_ascii_case(rt_environment)) {
            tracing::error!(
                rt_environment,
                id_token_environment,
                "{}",
                DIFFERENT_ENVIRONMENT
            );
        }

        if authority_host
            .as_ref()
            .map_or(true, |host| !host.as_str().eq_ignore_ascii_case(rt_environment))
        {
            tracing::error!(
                rt_environment,
                authority_host = authority_host.as_ref().map(|h| h.as_str()),
                "{}",
                DIFFERENT_AUTHORITY
            );
        }

        tracing::warn!(
            error = (&error as &dyn error::Error),
            "unable to write refresh token to legacy cache"
        );
    }
}

fn try_write_legacy_refresh_token(
    persistence: &dyn LegacyCachePersistence,
    rt: &RefreshToken,
    write: &LegacyWriteThrough<'_>,
) -> Result<(), InteropError> {
    let displayable_id = write
        .id_token
        .and_then(IdToken::claims)
        .and_then(|c| c.username())
        .map(str::to_owned);
    let scope = write.scopes.to_string();

    let key = LegacyCacheKey::new(
        write.authority,
        &scope,
        rt.client_id().as_str(),
        TokenSubjectType::User,
        write.unique_id,
        displayable_id.as_deref(),
    )?;

    let wrapper = LegacyResultWrapper {
        result: LegacyResult {
            user_info: Some(LegacyUserInfo {
                unique_id: write.unique_id.map(str::to_owned),
                displayable_id,
                ..LegacyUserInfo::default()
            }),
            ..LegacyResult::default()
        },
        refresh_token: Some(rt.secret().as_str().to_owned()),
        resource_in_response: Some(scope),
        raw_client_info: write.raw_client_info.map(str::to_owned),
        user_assertion_hash: None,
    };

    let mut dict = try_load(persistence)?;
    dict.insert(key, wrapper);
    try_store(persistence, &dict)?;

    tracing::debug!(entries = dict.len(), "wrote refresh token to legacy cache");
    Ok(())
}

/// A user known to the legacy cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyUser {
    /// The authority the user's entry was issued by
    pub authority: String,
    /// The raw client info, if the entry carries any
    pub raw_client_info: Option<String>,
    /// The recorded user information
    pub user_info: LegacyUserInfo,
}

/// Users found in the legacy cache for one client
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LegacyUsers {
    /// Users whose entries carry client info, keyed by home account id
    pub with_client_info: BTreeMap<String, LegacyUser>,
    /// Users whose entries carry no client info
    pub without_client_info: Vec<LegacyUser>,
}

impl LegacyUsers {
    /// Whether no users were found
    pub fn is_empty(&self) -> bool {
        self.with_client_info.is_empty() && self.without_client_info.is_empty()
    }
}

/// Lists the users the legacy cache holds for a client
pub fn legacy_users(
    persistence: &dyn LegacyCachePersistence,
    client_id: &ClientIdRef,
) -> LegacyUsers {
    let mut users = LegacyUsers::default();

    let dict = load_legacy_cache(persistence);
    for (key, value) in dict {
        if !key.client_id().eq_ignore_ascii_case(client_id.as_str()) || key.authority().is_empty() {
            continue;
        }

        let user = LegacyUser {
            authority: key.authority().to_owned(),
            raw_client_info: value.raw_client_info.filter(|s| !s.is_empty()),
            user_info: value.result.user_info.unwrap_or_default(),
        };

        let home = user
            .raw_client_info
            .as_deref()
            .and_then(home_account_id_from_raw);
        match home {
            Some(home) => {
                users.with_client_info.insert(home.take(), user);
            }
            None => users.without_client_info.push(user),
        }
    }

    users
}

/// Removes a user's entries from the legacy cache
///
/// When `account_id` (a home account id) is given, entries whose client
/// info resolves to it are removed. Entries whose displayable id matches
/// `displayable_id` are then removed as well; an empty displayable id skips
/// that step. Both are scoped to the client only, so the user's entries
/// under every authority are removed.
pub fn remove_legacy_user(
    persistence: &dyn LegacyCachePersistence,
    client_id: &ClientIdRef,
    displayable_id: &str,
    account_id: Option<&str>,
) {
    let result = try_load(persistence).and_then(|mut dict| {
        let before = dict.len();
        dict.retain(|key, value| {
            if !key.client_id().eq_ignore_ascii_case(client_id.as_str()) {
                return true;
            }

            let by_id = account_id.filter(|id| !id.is_empty()).map_or(false, |id| {
                value
                    .raw_client_info
                    .as_deref()
                    .and_then(home_account_id_from_raw)
                    .map_or(false, |home| home.as_str().eq_ignore_ascii_case(id))
            });

            let by_name = !displayable_id.is_empty()
                && key
                    .displayable_id()
                    .map_or(false, |d| d.eq_ignore_ascii_case(displayable_id));

            !(by_id || by_name)
        });

        if displayable_id.is_empty() {
            tracing::error!("cannot remove legacy entries by username: the username is empty");
        }

        let removed = before - dict.len();
        tracing::debug!(removed, "removed user from legacy cache");
        try_store(persistence, &dict)
    });

    if let Err(error) = result {
        tracing::warn!(
            error = (&error as &dyn error::Error),
            "unable to remove user from legacy cache"
        );
    }
}

/// A refresh token read from the legacy cache
#[derive(Clone, PartialEq, Eq)]
pub struct LegacyRefreshToken {
    /// The environment of the issuing authority
    pub environment: Environment,
    /// The client the token was issued to
    pub client_id: ClientId,
    /// The refresh token secret
    pub secret: RefreshTokenSecret,
    /// The raw client info, if recorded
    pub raw_client_info: Option<String>,
    /// The home account id derived from the client info
    pub home_account_id: Option<HomeAccountId>,
    /// The user's displayable id
    pub displayable_id: Option<String>,
    /// The user's unique id
    pub unique_id: Option<String>,
}

impl fmt::Debug for LegacyRefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyRefreshToken")
            .field("environment", &self.environment)
            .field("client_id", &self.client_id)
            .field("secret", &self.secret)
            .field("home_account_id", &self.home_account_id)
            .field("displayable_id", &self.displayable_id)
            .finish()
    }
}

impl LegacyRefreshToken {
    fn from_entry(key: &LegacyCacheKey, value: &LegacyResultWrapper) -> Option<Self> {
        let secret = value.refresh_token.as_deref().filter(|s| !s.is_empty())?;
        let environment = entry_environment(key)?;
        let raw_client_info = value.raw_client_info.clone().filter(|s| !s.is_empty());

        Some(Self {
            environment,
            client_id: ClientId::from(key.client_id()),
            secret: RefreshTokenSecret::from(secret),
            home_account_id: raw_client_info.as_deref().and_then(home_account_id_from_raw),
            raw_client_info,
            displayable_id: key.displayable_id().map(str::to_owned),
            unique_id: key.unique_id().map(str::to_owned),
        })
    }

    /// Converts into a current refresh token
    ///
    /// Entries without client info take `fallback_home_account_id`.
    pub fn into_refresh_token(
        self,
        fallback_home_account_id: Option<HomeAccountId>,
    ) -> Result<RefreshToken, InvalidEntity> {
        let home = self
            .home_account_id
            .or(fallback_home_account_id)
            .unwrap_or_else(|| HomeAccountId::from_static(""));
        RefreshToken::new(home, self.environment, self.client_id, self.secret, None)
    }
}

/// Narrows legacy refresh tokens for one client
#[derive(Clone, Copy, Debug)]
pub struct LegacyRefreshTokenQuery<'a> {
    /// The client the tokens were issued to
    pub client_id: &'a ClientIdRef,
    /// Entries must be from an alias of this environment
    pub environment: &'a EnvironmentRef,
    /// Entries from exactly this environment are preferred
    pub preferred_environment: Option<&'a EnvironmentRef>,
    /// The user's displayable id
    pub username: Option<&'a str>,
    /// The user's unique id
    pub unique_id: Option<&'a str>,
    /// The user's raw client info
    pub raw_client_info: Option<&'a str>,
}

fn narrow<'d, F>(
    entries: Vec<(&'d LegacyCacheKey, &'d LegacyResultWrapper)>,
    filter: Option<&str>,
    mut predicate: F,
) -> Vec<(&'d LegacyCacheKey, &'d LegacyResultWrapper)>
where
    F: FnMut(&str, &LegacyCacheKey, &LegacyResultWrapper) -> bool,
{
    let filter = match filter.filter(|f| !f.is_empty()) {
        Some(f) => f,
        None => return entries,
    };

    let narrowed: Vec<_> = entries
        .iter()
        .copied()
        .filter(|(k, v)| predicate(filter, k, v))
        .collect();

    if narrowed.is_empty() {
        tracing::trace!("narrowing filter matched nothing, keeping broader set");
        entries
    } else {
        narrowed
    }
}

fn query_entries(
    dict: &LegacyTokenDictionary,
    aliases: &dyn AuthorityAliases,
    query: &LegacyRefreshTokenQuery<'_>,
) -> Vec<LegacyRefreshToken> {
    let entries: Vec<_> = dict
        .iter()
        .filter(|(k, _)| {
            k.client_id().eq_ignore_ascii_case(query.client_id.as_str())
                && matches_environment(k, query.environment, aliases)
        })
        .collect();

    let entries = narrow(entries, query.raw_client_info, |ci, _, v| {
        v.raw_client_info
            .as_deref()
            .map_or(false, |raw| raw.eq_ignore_ascii_case(ci))
    });
    let entries = narrow(entries, query.username, |upn, k, _| {
        k.displayable_id()
            .map_or(false, |d| d.eq_ignore_ascii_case(upn))
    });
    let entries = narrow(entries, query.unique_id, |uid, k, _| {
        k.unique_id().map_or(false, |u| u.eq_ignore_ascii_case(uid))
    });

    entries
        .into_iter()
        .filter_map(|(k, v)| LegacyRefreshToken::from_entry(k, v))
        .collect()
}

/// Enumerates legacy refresh tokens matching the query
///
/// After filtering by client and environment, entries are narrowed by
/// client info, then username, then unique id. A narrowing step that would
/// leave nothing is skipped.
pub fn legacy_refresh_tokens(
    persistence: &dyn LegacyCachePersistence,
    aliases: &dyn AuthorityAliases,
    query: &LegacyRefreshTokenQuery<'_>,
) -> Vec<LegacyRefreshToken> {
    let dict = load_legacy_cache(persistence);
    query_entries(&dict, aliases, query)
}

/// Selects one legacy refresh token matching the query
///
/// An entry from the preferred environment wins; otherwise the first match.
pub fn legacy_refresh_token(
    persistence: &dyn LegacyCachePersistence,
    aliases: &dyn AuthorityAliases,
    query: &LegacyRefreshTokenQuery<'_>,
) -> Option<LegacyRefreshToken> {
    let mut tokens = legacy_refresh_tokens(persistence, aliases, query);

    let preferred = query.preferred_environment.and_then(|pref| {
        tokens
            .iter()
            .position(|t| t.environment.eq_ignore_case(pref))
    });

    match preferred {
        Some(idx) => Some(tokens.swap_remove(idx)),
        None if tokens.is_empty() => None,
        None => Some(tokens.swap_remove(0)),
    }
}

/// Finds a legacy refresh token for a known account
///
/// Unlike enumeration, filters are strict: entries must match the account's
/// username and object id when those are known. An account with neither
/// cannot be matched safely and yields `None`.
pub fn legacy_refresh_token_for_account(
    persistence: &dyn LegacyCachePersistence,
    aliases: &dyn AuthorityAliases,
    environment: &EnvironmentRef,
    client_id: &ClientIdRef,
    account: &Account,
) -> Option<RefreshToken> {
    let username = Some(account.username()).filter(|u| !u.is_empty());
    let object_id = account
        .home_account_id()
        .as_str()
        .split('.')
        .next()
        .filter(|oid| !oid.is_empty());

    if username.is_none() && object_id.is_none() {
        tracing::warn!("cannot match legacy entries without a username or object id, skipping");
        return None;
    }

    let dict = load_legacy_cache(persistence);
    let found = dict
        .iter()
        .filter(|(k, _)| {
            k.client_id().eq_ignore_ascii_case(client_id.as_str())
                && matches_environment(k, environment, aliases)
        })
        .filter(|(k, _)| {
            username.map_or(true, |u| {
                k.displayable_id().map_or(false, |d| d.eq_ignore_ascii_case(u))
            })
        })
        .filter(|(k, _)| {
            object_id.map_or(true, |oid| {
                k.unique_id().map_or(false, |u| u.eq_ignore_ascii_case(oid))
            })
        })
        .find_map(|(k, v)| LegacyRefreshToken::from_entry(k, v))?;

    match found.into_refresh_token(Some(account.home_account_id().to_owned())) {
        Ok(rt) => Some(rt),
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "legacy refresh token cannot be used in the current cache"
            );
            None
        }
    }
}

/// Converts a legacy entry into a current refresh token and account
///
/// Only entries with a refresh token and decodable client info can be
/// migrated; others yield `None`.
pub fn migrate_legacy_entry(
    key: &LegacyCacheKey,
    value: &LegacyResultWrapper,
) -> Option<(RefreshToken, Account)> {
    let raw_client_info = value.raw_client_info.as_deref().filter(|s| !s.is_empty())?;
    let client_info = match ClientInfo::parse(raw_client_info) {
        Ok(ci) => ci,
        Err(error) => {
            tracing::debug!(
                error = (&error as &dyn error::Error),
                "legacy entry has undecodable client info, not migrating"
            );
            return None;
        }
    };
    let home = client_info.home_account_id()?;
    let legacy = LegacyRefreshToken::from_entry(key, value)?;

    let tenant = tenant_of(key.authority())
        .map(TenantId::new)
        .unwrap_or_else(|| TenantId::new(client_info.utid.clone()));
    let user_info = value.result.user_info.clone().unwrap_or_default();

    let build = || -> Result<(RefreshToken, Account), InvalidEntity> {
        let rt = RefreshToken::new(
            home.clone(),
            legacy.environment.clone(),
            legacy.client_id.clone(),
            legacy.secret.clone(),
            None,
        )?
        .with_tenant_id(tenant.clone());

        let mut account = Account::new(
            home.clone(),
            legacy.environment.clone(),
            tenant.clone(),
            user_info.displayable_id.clone().unwrap_or_default(),
            AuthorityType::MsSts,
        )?
        .with_client_info(raw_client_info);
        if let Some(uid) = user_info.unique_id.as_deref() {
            account = account.with_local_account_id(uid);
        }
        if let Some(given) = user_info.given_name.as_deref() {
            account = account.with_given_name(given);
        }
        if let Some(family) = user_info.family_name.as_deref() {
            account = account.with_family_name(family);
        }
        Ok((rt, account))
    };

    match build() {
        Ok(migrated) => Some(migrated),
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn error::Error),
                "unable to migrate legacy entry"
            );
            None
        }
    }
}

/// Converts every migratable legacy entry for a client
pub fn migrate_legacy_entries(
    persistence: &dyn LegacyCachePersistence,
    client_id: &ClientIdRef,
) -> Vec<(RefreshToken, Account)> {
    load_legacy_cache(persistence)
        .iter()
        .filter(|(k, _)| k.client_id().eq_ignore_ascii_case(client_id.as_str()))
        .filter_map(|(k, v)| migrate_legacy_entry(k, v))
        .collect()
}

//! Resolving requests against cached credentials
//!
//! Lookups are a pipeline of narrowing filters over the accessor's content.
//! Reads use scope containment: a token matches when it covers every
//! requested scope. Writes use scope intersection: a new token supersedes
//! every existing token it shares a scope with.

use idcache_clock::{DurationSecs, UnixTime};
use thiserror::Error;

use crate::{
    accessor::TokenCacheAccessor,
    aliases::AuthorityAliases,
    braids::{
        ClientIdRef, EnvironmentRef, FamilyId, HomeAccountIdRef, KeyIdRef, OboCacheKeyRef,
        TenantIdRef,
    },
    config::TokenCacheConfig,
    entities::{auth_scheme, AccessToken, AccessTokenStatus, AppMetadata, RefreshToken},
    keys::app_metadata_key,
    scope::ScopeSet,
};

/// More than one cached access token matched a request
///
/// This indicates the cache was written inconsistently; the lookup does not
/// guess which token to return.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("{count} cached access tokens match the request; expected at most one")]
pub struct MultipleTokensMatched {
    count: usize,
}

impl MultipleTokensMatched {
    /// The number of matching tokens
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }
}

/// A request for a cached access token
#[derive(Clone, Copy, Debug)]
pub struct AccessTokenQuery<'a> {
    /// The environment of the requesting authority
    pub environment: &'a EnvironmentRef,
    /// The requesting client
    pub client_id: &'a ClientIdRef,
    /// The tenant, if the request is tenant specific
    pub tenant_id: Option<&'a TenantIdRef>,
    /// The account; `None` for application tokens
    pub home_account_id: Option<&'a HomeAccountIdRef>,
    /// The requested scopes
    pub scopes: &'a ScopeSet,
    /// The proof-of-possession key the token must be bound to
    pub key_id: Option<&'a KeyIdRef>,
    /// The token type for non-bearer schemes
    pub token_type: Option<&'a str>,
    /// The on-behalf-of partition; replaces tenant and account matching
    pub obo_cache_key: Option<&'a OboCacheKeyRef>,
}

/// How a matched access token may be used
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessTokenOutcome {
    /// The token is usable
    Usable,
    /// The token is usable, but a proactive refresh should be started
    RefreshSuggested,
    /// The token is inside the expiration buffer and must be refreshed
    NearExpiry,
    /// The token is past expiry but inside its extended lifetime
    Extended,
    /// The token is past expiry
    Expired,
}

impl AccessTokenOutcome {
    /// Whether the token may be handed to the caller
    #[inline]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Usable | Self::RefreshSuggested | Self::Extended)
    }
}

/// The access token that matched a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessTokenMatch {
    /// The matched token
    pub token: AccessToken,
    /// How the token may be used
    pub outcome: AccessTokenOutcome,
}

impl AccessTokenMatch {
    /// Whether the token may be handed to the caller
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.outcome.is_usable()
    }
}

fn eq_opt(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    }
}

fn matches_access_token_query(
    at: &AccessToken,
    aliases: &dyn AuthorityAliases,
    query: &AccessTokenQuery<'_>,
) -> bool {
    if !at.client_id().as_str().eq_ignore_ascii_case(query.client_id.as_str())
        || !aliases.is_alias(at.environment(), query.environment)
    {
        return false;
    }

    let partition_matches = match query.obo_cache_key {
        Some(obo) => at.obo_cache_key().map_or(false, |k| k.as_str() == obo.as_str()),
        None => {
            at.obo_cache_key().is_none()
                && query.tenant_id.map_or(true, |t| {
                    at.tenant_id().as_str().eq_ignore_ascii_case(t.as_str())
                })
                && eq_opt(
                    at.home_account_id().map(|h| h.as_str()),
                    query.home_account_id.map(|h| h.as_str()),
                )
        }
    };

    partition_matches
        && eq_opt(at.token_type(), auth_scheme(query.token_type))
        && eq_opt(at.key_id().map(|k| k.as_str()), query.key_id.map(|k| k.as_str()))
        && at.scopes().contains_all_requested(query.scopes)
}

/// Keeps only candidates from exactly `environment` when there are any
fn prefer_environment<T, F>(candidates: Vec<T>, environment: &EnvironmentRef, env_of: F) -> Vec<T>
where
    F: Fn(&T) -> &EnvironmentRef,
{
    if candidates.iter().any(|c| env_of(c).eq_ignore_case(environment)) {
        candidates
            .into_iter()
            .filter(|c| env_of(c).eq_ignore_case(environment))
            .collect()
    } else {
        candidates
    }
}

fn has_absurd_lifetime(at: &AccessToken, max_lifetime: DurationSecs) -> bool {
    at.expires_on() - at.cached_at() > max_lifetime
}

/// Classifies a token's usability at `now`
pub fn access_token_outcome(
    at: &AccessToken,
    config: &TokenCacheConfig,
    now: UnixTime,
) -> AccessTokenOutcome {
    match at.status_at(now, config.expiration_buffer()) {
        AccessTokenStatus::Fresh => AccessTokenOutcome::Usable,
        AccessTokenStatus::RefreshDue => AccessTokenOutcome::RefreshSuggested,
        AccessTokenStatus::NearExpiry => AccessTokenOutcome::NearExpiry,
        AccessTokenStatus::Expired
            if config.extended_lifetime() && at.is_within_extended_lifetime_at(now) =>
        {
            AccessTokenOutcome::Extended
        }
        AccessTokenStatus::Expired => AccessTokenOutcome::Expired,
    }
}

/// Finds the access token matching a request
///
/// Returns `Ok(None)` when nothing matches. A token whose claimed lifetime
/// exceeds the configured maximum is treated as corrupt and ignored. More
/// than one match is an error.
pub fn find_access_token(
    accessor: &dyn TokenCacheAccessor,
    aliases: &dyn AuthorityAliases,
    config: &TokenCacheConfig,
    query: &AccessTokenQuery<'_>,
    now: UnixTime,
) -> Result<Option<AccessTokenMatch>, MultipleTokensMatched> {
    let candidates: Vec<AccessToken> = accessor
        .access_tokens()
        .into_iter()
        .filter(|at| {
            let matched = matches_access_token_query(at, aliases, query);
            tracing::trace!(key = %at.cache_key(), matched, "access token filter");
            matched
        })
        .collect();

    let mut candidates = prefer_environment(candidates, query.environment, |at| at.environment());

    if candidates.len() > 1 {
        tracing::debug!(count = candidates.len(), "multiple access tokens match");
        return Err(MultipleTokensMatched {
            count: candidates.len(),
        });
    }

    let token = match candidates.pop() {
        Some(at) => at,
        None => {
            tracing::debug!("no access token matches");
            return Ok(None);
        }
    };

    if has_absurd_lifetime(&token, config.max_access_token_lifetime()) {
        tracing::warn!(
            key = %token.cache_key(),
            cached_at = %token.cached_at(),
            expires_on = %token.expires_on(),
            "ignoring access token with an implausible lifetime"
        );
        return Ok(None);
    }

    let outcome = access_token_outcome(&token, config, now);
    tracing::debug!(?outcome, key = %token.cache_key(), "access token found");
    Ok(Some(AccessTokenMatch { token, outcome }))
}

/// Whether an access token is dead
///
/// A dead token is past its usable lifetime and has no refresh token for its
/// account and environment that could replace it.
pub fn is_dead_access_token(
    accessor: &dyn TokenCacheAccessor,
    aliases: &dyn AuthorityAliases,
    config: &TokenCacheConfig,
    at: &AccessToken,
    now: UnixTime,
) -> bool {
    if access_token_outcome(at, config, now) != AccessTokenOutcome::Expired {
        return false;
    }

    let home = match at.home_account_id() {
        Some(home) => home,
        None => return true,
    };

    !accessor.refresh_tokens().iter().any(|rt| {
        rt.home_account_id().as_str().eq_ignore_ascii_case(home.as_str())
            && aliases.is_alias(rt.environment(), at.environment())
    })
}

/// Lists cached access tokens that a newly obtained token supersedes
///
/// These share the new token's environment, client, tenant, account,
/// token scheme and on-behalf-of partition, and at least one scope.
pub fn superseded_access_tokens(
    accessor: &dyn TokenCacheAccessor,
    aliases: &dyn AuthorityAliases,
    new_token: &AccessToken,
) -> Vec<AccessToken> {
    accessor
        .access_tokens()
        .into_iter()
        .filter(|at| {
            at.client_id().as_str().eq_ignore_ascii_case(new_token.client_id().as_str())
                && aliases.is_alias(at.environment(), new_token.environment())
                && at
                    .tenant_id()
                    .as_str()
                    .eq_ignore_ascii_case(new_token.tenant_id().as_str())
                && eq_opt(
                    at.home_account_id().map(|h| h.as_str()),
                    new_token.home_account_id().map(|h| h.as_str()),
                )
                && eq_opt(at.token_type(), new_token.token_type())
                && eq_opt(
                    at.key_id().map(|k| k.as_str()),
                    new_token.key_id().map(|k| k.as_str()),
                )
                && eq_opt(
                    at.obo_cache_key().map(|k| k.as_str()),
                    new_token.obo_cache_key().map(|k| k.as_str()),
                )
                && at.scopes().intersects(new_token.scopes())
        })
        .collect()
}

/// Whether a client belongs to a family
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FamilyMembership {
    /// The client is known to belong to the family
    Member(FamilyId),
    /// The client is known not to belong to any family
    NotMember,
    /// Nothing is known about the client
    Unknown,
}

/// Consults application metadata for a client's family
pub fn family_membership(
    accessor: &dyn TokenCacheAccessor,
    aliases: &dyn AuthorityAliases,
    environment: &EnvironmentRef,
    client_id: &ClientIdRef,
) -> FamilyMembership {
    let exact = app_metadata_key(environment.as_str(), client_id.as_str())
        .ok()
        .and_then(|key| accessor.app_metadata(&key));

    let meta = exact.or_else(|| {
        let candidates: Vec<AppMetadata> = accessor
            .all_app_metadata()
            .into_iter()
            .filter(|m| {
                m.client_id().as_str().eq_ignore_ascii_case(client_id.as_str())
                    && aliases.is_alias(m.environment(), environment)
            })
            .collect();
        prefer_environment(candidates, environment, |m| m.environment())
            .into_iter()
            .next()
    });

    match meta {
        Some(meta) => match meta.family_id() {
            Some(family) => FamilyMembership::Member(family.to_owned()),
            None => FamilyMembership::NotMember,
        },
        None => FamilyMembership::Unknown,
    }
}

/// A request for a cached refresh token
#[derive(Clone, Copy, Debug)]
pub struct RefreshTokenQuery<'a> {
    /// The environment of the requesting authority
    pub environment: &'a EnvironmentRef,
    /// The requesting client
    pub client_id: &'a ClientIdRef,
    /// The account
    pub home_account_id: &'a HomeAccountIdRef,
    /// The tenant, if the request is tenant specific
    pub tenant_id: Option<&'a TenantIdRef>,
    /// The on-behalf-of partition
    pub obo_cache_key: Option<&'a OboCacheKeyRef>,
}

/// Which resolution step produced a refresh token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshTokenSource {
    /// Issued to this client for the requested tenant
    ExactTenant,
    /// Issued to this client for another tenant
    CrossTenant,
    /// A family refresh token for the client's family
    Family,
    /// Read from the legacy cache
    Legacy,
}

/// The refresh token that satisfied a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshTokenMatch {
    /// The matched token
    pub token: RefreshToken,
    /// Which resolution step produced it
    pub source: RefreshTokenSource,
}

fn first_preferred(
    candidates: Vec<RefreshToken>,
    environment: &EnvironmentRef,
) -> Option<RefreshToken> {
    prefer_environment(candidates, environment, |rt| rt.environment())
        .into_iter()
        .next()
}

/// Resolves the refresh token for a request
///
/// Resolution stops at the first step with any result: a token for this
/// client and the requested tenant, then a token for this client from any
/// tenant, then a family refresh token for the client's family as recorded
/// in application metadata. A client with unknown family membership never
/// receives a family refresh token.
pub fn find_refresh_token(
    accessor: &dyn TokenCacheAccessor,
    aliases: &dyn AuthorityAliases,
    config: &TokenCacheConfig,
    query: &RefreshTokenQuery<'_>,
) -> Option<RefreshTokenMatch> {
    let all = accessor.refresh_tokens();

    let for_account = |rt: &RefreshToken| {
        rt.home_account_id()
            .as_str()
            .eq_ignore_ascii_case(query.home_account_id.as_str())
            && aliases.is_alias(rt.environment(), query.environment)
            && eq_opt(
                rt.obo_cache_key().map(|k| k.as_str()),
                query.obo_cache_key.map(|k| k.as_str()),
            )
    };

    let client_tokens: Vec<RefreshToken> = all
        .iter()
        .filter(|rt| {
            !rt.is_family_refresh_token()
                && rt.client_id().as_str().eq_ignore_ascii_case(query.client_id.as_str())
                && for_account(*rt)
        })
        .cloned()
        .collect();

    if let Some(tenant) = query.tenant_id {
        let exact: Vec<RefreshToken> = client_tokens
            .iter()
            .filter(|rt| {
                rt.tenant_id()
                    .map_or(false, |t| t.as_str().eq_ignore_ascii_case(tenant.as_str()))
            })
            .cloned()
            .collect();

        if let Some(token) = first_preferred(exact, query.environment) {
            tracing::debug!(key = %token.cache_key(), "refresh token found for tenant");
            return Some(RefreshTokenMatch {
                token,
                source: RefreshTokenSource::ExactTenant,
            });
        }
    }

    if let Some(token) = first_preferred(client_tokens, query.environment) {
        tracing::debug!(key = %token.cache_key(), "refresh token found for client");
        return Some(RefreshTokenMatch {
            token,
            source: RefreshTokenSource::CrossTenant,
        });
    }

    if !config.family_refresh_tokens() {
        return None;
    }

    let family = match family_membership(accessor, aliases, query.environment, query.client_id) {
        FamilyMembership::Member(family) => family,
        membership => {
            tracing::debug!(?membership, "no family refresh token fallback");
            return None;
        }
    };

    let family_tokens: Vec<RefreshToken> = all
        .into_iter()
        .filter(|rt| {
            rt.family_id()
                .map_or(false, |f| f.as_str().eq_ignore_ascii_case(family.as_str()))
                && for_account(rt)
        })
        .collect();

    first_preferred(family_tokens, query.environment).map(|token| {
        tracing::debug!(key = %token.cache_key(), family = %family, "family refresh token found");
        RefreshTokenMatch {
            token,
            source: RefreshTokenSource::Family,
        }
    })
}

/// Suggests when a persisted copy of the cache may be discarded
///
/// While any refresh token is held, there is no suggestion. Otherwise this is
/// the latest access token expiry, unless that is already inside the
/// expiration buffer.
pub fn suggested_cache_expiry(
    accessor: &dyn TokenCacheAccessor,
    config: &TokenCacheConfig,
    now: UnixTime,
) -> Option<UnixTime> {
    if !accessor.refresh_tokens().is_empty() {
        return None;
    }

    accessor
        .access_tokens()
        .iter()
        .map(AccessToken::expires_on)
        .max()
        .filter(|&expiry| expiry > now + config.expiration_buffer())
}

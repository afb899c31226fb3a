use std::convert::TryFrom;

use idcache_clock::{Clock, DurationSecs, System, UnixTime};
use serde::{Deserialize, Serialize};

use super::{check_credential_type, non_empty, AdditionalFields, InvalidEntity};
use crate::{
    braids::{
        AccessTokenSecret, AccessTokenSecretRef, ClientId, ClientIdRef, Environment,
        EnvironmentRef, HomeAccountId, HomeAccountIdRef, KeyId, KeyIdRef, OboCacheKey,
        OboCacheKeyRef, TenantId, TenantIdRef,
    },
    keys::{CacheKey, CacheKeyRef, CredentialKeyParts, CredentialType},
    scope::ScopeSet,
};

const BEARER: &str = "Bearer";

/// Drops the default bearer scheme, leaving only explicit auth schemes
pub(crate) fn auth_scheme(token_type: Option<&str>) -> Option<&str> {
    token_type.filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case(BEARER))
}

#[derive(Serialize, Deserialize)]
struct AccessTokenRecord {
    #[serde(default)]
    home_account_id: String,
    environment: Environment,
    #[serde(default)]
    credential_type: String,
    client_id: ClientId,
    secret: AccessTokenSecret,
    #[serde(default)]
    realm: TenantIdDefault,
    #[serde(default)]
    target: ScopeSet,
    #[serde(with = "idcache_clock::as_string")]
    cached_at: UnixTime,
    #[serde(with = "idcache_clock::as_string")]
    expires_on: UnixTime,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "idcache_clock::as_string::option"
    )]
    extended_expires_on: Option<UnixTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "idcache_clock::as_string::option"
    )]
    refresh_on: Option<UnixTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keyid: Option<KeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_assertion_hash: Option<OboCacheKey>,
    #[serde(flatten)]
    additional_fields: AdditionalFields,
}

/// Realms may be absent in documents written by app-only flows
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct TenantIdDefault(TenantId);

impl Default for TenantIdDefault {
    fn default() -> Self {
        Self(TenantId::from_static(""))
    }
}

/// A cached access token
///
/// Access tokens are scoped to an environment, client, tenant and (for
/// delegated tokens) a home account. App-only tokens carry no home account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AccessTokenRecord", into = "AccessTokenRecord")]
pub struct AccessToken {
    home_account_id: Option<HomeAccountId>,
    environment: Environment,
    client_id: ClientId,
    tenant_id: TenantId,
    secret: AccessTokenSecret,
    scopes: ScopeSet,
    cached_at: UnixTime,
    expires_on: UnixTime,
    extended_expires_on: UnixTime,
    refresh_on: Option<UnixTime>,
    key_id: Option<KeyId>,
    token_type: Option<String>,
    obo_cache_key: Option<OboCacheKey>,
    additional_fields: AdditionalFields,
    key: CacheKey,
}

/// An access token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessTokenStatus {
    /// The token is usable
    Fresh,
    /// The token is usable, but the provider asked for a proactive refresh
    RefreshDue,
    /// The token is still valid but inside the expiration buffer, so it
    /// must not be handed out
    NearExpiry,
    /// The token is past its expiry
    Expired,
}

impl AccessTokenStatus {
    /// Whether a lookup may return the token
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Fresh | Self::RefreshDue)
    }
}

impl AccessToken {
    /// Starts building an access token
    pub fn builder(
        environment: Environment,
        client_id: ClientId,
        tenant_id: TenantId,
        secret: AccessTokenSecret,
        scopes: ScopeSet,
    ) -> AccessTokenBuilder {
        AccessTokenBuilder {
            home_account_id: None,
            environment,
            client_id,
            tenant_id,
            secret,
            scopes,
            cached_at: UnixTime::EPOCH,
            expires_on: UnixTime::EPOCH,
            extended_expires_on: None,
            refresh_on: None,
            key_id: None,
            token_type: None,
            obo_cache_key: None,
        }
    }

    /// The key this token is stored under
    #[inline]
    pub fn cache_key(&self) -> &CacheKeyRef {
        &self.key
    }

    /// The home account, or `None` for app-only tokens
    #[inline]
    pub fn home_account_id(&self) -> Option<&HomeAccountIdRef> {
        self.home_account_id.as_deref()
    }

    /// The provider host
    #[inline]
    pub fn environment(&self) -> &EnvironmentRef {
        &self.environment
    }

    /// The client the token was issued to
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The tenant the token was issued by
    #[inline]
    pub fn tenant_id(&self) -> &TenantIdRef {
        &self.tenant_id
    }

    /// The token itself
    #[inline]
    pub fn secret(&self) -> &AccessTokenSecretRef {
        &self.secret
    }

    /// The scopes the token was granted
    #[inline]
    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    /// When the token was cached
    #[inline]
    pub fn cached_at(&self) -> UnixTime {
        self.cached_at
    }

    /// When the token expires
    #[inline]
    pub fn expires_on(&self) -> UnixTime {
        self.expires_on
    }

    /// The latest time the token may be used while the provider is
    /// unavailable
    #[inline]
    pub fn extended_expires_on(&self) -> UnixTime {
        self.extended_expires_on
    }

    /// When the provider suggested refreshing the token proactively
    #[inline]
    pub fn refresh_on(&self) -> Option<UnixTime> {
        self.refresh_on
    }

    /// The key a proof-of-possession token is bound to
    #[inline]
    pub fn key_id(&self) -> Option<&KeyIdRef> {
        self.key_id.as_deref()
    }

    /// The token type, `None` for bearer tokens
    #[inline]
    pub fn token_type(&self) -> Option<&str> {
        self.token_type.as_deref()
    }

    /// The on-behalf-of partition this token belongs to
    #[inline]
    pub fn obo_cache_key(&self) -> Option<&OboCacheKeyRef> {
        self.obo_cache_key.as_deref()
    }

    /// Fields not understood by this version
    #[inline]
    pub fn additional_fields(&self) -> &AdditionalFields {
        &self.additional_fields
    }

    /// The credential type, derived from the token type
    pub fn credential_type(&self) -> CredentialType {
        if self.token_type.is_some() {
            CredentialType::AccessTokenWithAuthScheme
        } else {
            CredentialType::AccessToken
        }
    }

    /// Gets the token's current lifecycle status
    #[inline]
    pub fn status(&self, expiration_buffer: DurationSecs) -> AccessTokenStatus {
        self.status_with_clock(&System, expiration_buffer)
    }

    /// Gets the token's lifecycle status based on the current time
    /// as reported by the provided clock
    #[inline]
    pub fn status_with_clock<C: Clock>(
        &self,
        clock: &C,
        expiration_buffer: DurationSecs,
    ) -> AccessTokenStatus {
        self.status_at(clock.now(), expiration_buffer)
    }

    /// Gets the token's lifecycle status as of the provided time
    pub fn status_at(&self, time: UnixTime, expiration_buffer: DurationSecs) -> AccessTokenStatus {
        if time >= self.expires_on {
            AccessTokenStatus::Expired
        } else if time + expiration_buffer >= self.expires_on {
            AccessTokenStatus::NearExpiry
        } else if self.refresh_on.map_or(false, |r| time >= r) {
            AccessTokenStatus::RefreshDue
        } else {
            AccessTokenStatus::Fresh
        }
    }

    /// Whether the token may still be used as of the provided time while the
    /// provider is unavailable
    #[inline]
    pub fn is_within_extended_lifetime_at(&self, time: UnixTime) -> bool {
        time < self.extended_expires_on
    }
}

/// Builds an [`AccessToken`]
#[derive(Debug)]
#[must_use]
pub struct AccessTokenBuilder {
    home_account_id: Option<HomeAccountId>,
    environment: Environment,
    client_id: ClientId,
    tenant_id: TenantId,
    secret: AccessTokenSecret,
    scopes: ScopeSet,
    cached_at: UnixTime,
    expires_on: UnixTime,
    extended_expires_on: Option<UnixTime>,
    refresh_on: Option<UnixTime>,
    key_id: Option<KeyId>,
    token_type: Option<String>,
    obo_cache_key: Option<OboCacheKey>,
}

impl AccessTokenBuilder {
    /// Scopes the token to a user
    pub fn with_home_account_id(mut self, home_account_id: HomeAccountId) -> Self {
        self.home_account_id = Some(home_account_id);
        self
    }

    /// Sets when the token was cached and when it expires
    pub fn with_lifetime(mut self, cached_at: UnixTime, expires_on: UnixTime) -> Self {
        self.cached_at = cached_at;
        self.expires_on = expires_on;
        self
    }

    /// Sets the extended expiry; defaults to the regular expiry
    pub fn with_extended_expires_on(mut self, extended_expires_on: UnixTime) -> Self {
        self.extended_expires_on = Some(extended_expires_on);
        self
    }

    /// Sets when the token should be proactively refreshed
    pub fn with_refresh_on(mut self, refresh_on: UnixTime) -> Self {
        self.refresh_on = Some(refresh_on);
        self
    }

    /// Binds the token to a proof-of-possession key
    pub fn with_key_id(mut self, key_id: KeyId) -> Self {
        self.key_id = Some(key_id);
        self
    }

    /// Sets the token type; bearer tokens need not set this
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into());
        self
    }

    /// Places the token in an on-behalf-of partition
    pub fn with_obo_cache_key(mut self, obo_cache_key: OboCacheKey) -> Self {
        self.obo_cache_key = Some(obo_cache_key);
        self
    }

    /// Validates the token and derives its cache key
    pub fn build(self) -> Result<AccessToken, InvalidEntity> {
        AccessToken::try_from(AccessTokenRecord {
            home_account_id: self.home_account_id.map(HomeAccountId::take).unwrap_or_default(),
            environment: self.environment,
            credential_type: String::new(),
            client_id: self.client_id,
            secret: self.secret,
            realm: TenantIdDefault(self.tenant_id),
            target: self.scopes,
            cached_at: self.cached_at,
            expires_on: self.expires_on,
            extended_expires_on: self.extended_expires_on,
            refresh_on: self.refresh_on,
            keyid: self.key_id,
            token_type: self.token_type,
            user_assertion_hash: self.obo_cache_key,
            additional_fields: AdditionalFields::new(),
        })
    }
}

impl TryFrom<AccessTokenRecord> for AccessToken {
    type Error = InvalidEntity;

    fn try_from(record: AccessTokenRecord) -> Result<Self, Self::Error> {
        if record.expires_on < record.cached_at {
            return Err(InvalidEntity::ExpiresBeforeCached {
                cached_at: record.cached_at,
                expires_on: record.expires_on,
            });
        }

        let token_type = auth_scheme(record.token_type.as_deref()).map(str::to_owned);

        let credential_type = if token_type.is_some() {
            CredentialType::AccessTokenWithAuthScheme
        } else {
            CredentialType::AccessToken
        };

        if !record.credential_type.is_empty()
            && !record
                .credential_type
                .eq_ignore_ascii_case(CredentialType::AccessToken.as_str())
        {
            check_credential_type(credential_type, &record.credential_type)?;
        }

        let key = CredentialKeyParts {
            home_account_id: &record.home_account_id,
            environment: record.environment.as_str(),
            credential_type,
            client_id: record.client_id.as_str(),
            family_id: None,
            tenant_id: record.realm.0.as_str(),
            scopes: Some(&record.target),
            token_type: token_type.as_deref(),
        }
        .cache_key()?;

        let expires_on = record.expires_on;
        let extended_expires_on = record
            .extended_expires_on
            .filter(|&e| e >= expires_on)
            .unwrap_or(expires_on);

        Ok(Self {
            home_account_id: non_empty(record.home_account_id).map(HomeAccountId::from),
            environment: record.environment,
            client_id: record.client_id,
            tenant_id: record.realm.0,
            secret: record.secret,
            scopes: record.target,
            cached_at: record.cached_at,
            expires_on,
            extended_expires_on,
            refresh_on: record.refresh_on,
            key_id: record.keyid,
            token_type,
            obo_cache_key: record.user_assertion_hash,
            additional_fields: record.additional_fields,
            key,
        })
    }
}

impl From<AccessToken> for AccessTokenRecord {
    fn from(at: AccessToken) -> Self {
        let credential_type = at.credential_type().as_str().to_owned();
        Self {
            home_account_id: at
                .home_account_id
                .map(HomeAccountId::take)
                .unwrap_or_default(),
            environment: at.environment,
            credential_type,
            client_id: at.client_id,
            secret: at.secret,
            realm: TenantIdDefault(at.tenant_id),
            target: at.scopes,
            cached_at: at.cached_at,
            expires_on: at.expires_on,
            extended_expires_on: Some(at.extended_expires_on),
            refresh_on: at.refresh_on,
            keyid: at.key_id,
            token_type: at.token_type,
            user_assertion_hash: at.obo_cache_key,
            additional_fields: at.additional_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Result<AccessToken, InvalidEntity> {
        AccessToken::builder(
            Environment::from_static("login.example.com"),
            ClientId::from_static("client-1"),
            TenantId::from_static("contoso"),
            AccessTokenSecret::from_static("secret"),
            ScopeSet::parse("User.Read"),
        )
        .with_home_account_id(HomeAccountId::from_static("uid.utid"))
        .with_lifetime(UnixTime(1000), UnixTime(4599))
        .build()
    }

    #[test]
    fn status_respects_expiration_buffer() -> color_eyre::Result<()> {
        let at = token()?;
        let buffer = DurationSecs::from_minutes(5);

        assert_eq!(at.status_at(UnixTime(1000), buffer), AccessTokenStatus::Fresh);
        assert_eq!(at.status_at(UnixTime(4299), buffer), AccessTokenStatus::NearExpiry);
        assert_eq!(at.status_at(UnixTime(4298), buffer), AccessTokenStatus::Fresh);
        assert_eq!(at.status_at(UnixTime(4599), buffer), AccessTokenStatus::Expired);
        Ok(())
    }

    #[test]
    fn refresh_on_marks_token_due() -> color_eyre::Result<()> {
        let at = AccessToken::builder(
            Environment::from_static("login.example.com"),
            ClientId::from_static("client-1"),
            TenantId::from_static("contoso"),
            AccessTokenSecret::from_static("secret"),
            ScopeSet::parse("User.Read"),
        )
        .with_lifetime(UnixTime(0), UnixTime(10_000))
        .with_refresh_on(UnixTime(5_000))
        .build()?;

        let status = at.status_at(UnixTime(6_000), DurationSecs::ZERO);
        assert_eq!(status, AccessTokenStatus::RefreshDue);
        assert!(status.is_usable());
        assert_eq!(at.home_account_id(), None);
        Ok(())
    }

    #[test]
    fn rejects_expiry_before_cached() {
        let err = AccessToken::builder(
            Environment::from_static("login.example.com"),
            ClientId::from_static("client-1"),
            TenantId::from_static("contoso"),
            AccessTokenSecret::from_static("secret"),
            ScopeSet::parse("a"),
        )
        .with_lifetime(UnixTime(10), UnixTime(5))
        .build()
        .unwrap_err();

        assert!(matches!(err, InvalidEntity::ExpiresBeforeCached { .. }));
    }

    #[test]
    fn round_trips_with_unknown_fields() -> color_eyre::Result<()> {
        let json = r#"{
            "home_account_id": "uid.utid",
            "environment": "login.example.com",
            "credential_type": "AccessToken",
            "client_id": "client-1",
            "secret": "secret",
            "realm": "contoso",
            "target": "User.Read Mail.Send",
            "cached_at": "1000",
            "expires_on": "4599",
            "extended_expires_on": "8199",
            "future_field": {"nested": [1, 2.5, "x"]},
            "another": "value"
        }"#;

        let at: AccessToken = serde_json::from_str(json)?;
        assert_eq!(
            at.cache_key().as_str(),
            "uid.utid-login.example.com-accesstoken-client-1-contoso-mail.send user.read"
        );
        assert_eq!(at.extended_expires_on(), UnixTime(8199));
        assert_eq!(at.additional_fields().len(), 2);

        let value = serde_json::to_value(&at)?;
        assert_eq!(value["future_field"]["nested"][1], serde_json::json!(2.5));
        assert_eq!(value["cached_at"], "1000");
        assert!(value.get("refresh_on").is_none());

        let again: AccessToken = serde_json::from_value(value)?;
        assert_eq!(again, at);
        Ok(())
    }

    #[test]
    fn extended_expiry_is_never_before_expiry() -> color_eyre::Result<()> {
        let record = |extended: &str| {
            format!(
                r#"{{
                    "home_account_id": "uid.utid",
                    "environment": "login.example.com",
                    "credential_type": "AccessToken",
                    "client_id": "client-1",
                    "secret": "secret",
                    "realm": "contoso",
                    "target": "a",
                    "cached_at": "1000",
                    "expires_on": "4599"{}
                }}"#,
                extended
            )
        };

        let earlier: AccessToken = serde_json::from_str(&record(r#", "extended_expires_on": "2000""#))?;
        assert_eq!(earlier.expires_on(), UnixTime(4599));
        assert_eq!(earlier.extended_expires_on(), UnixTime(4599));

        let missing: AccessToken = serde_json::from_str(&record(""))?;
        assert_eq!(missing.extended_expires_on(), UnixTime(4599));

        let later: AccessToken = serde_json::from_str(&record(r#", "extended_expires_on": "9000""#))?;
        assert_eq!(later.extended_expires_on(), UnixTime(9000));
        Ok(())
    }

    #[test]
    fn unknown_numbers_keep_their_text() -> color_eyre::Result<()> {
        let json = r#"{"home_account_id":"uid.utid","environment":"login.example.com","credential_type":"AccessToken","client_id":"client-1","secret":"secret","realm":"contoso","target":"a","cached_at":"1000","expires_on":"4599","x_price":1.50,"x_big":1e2,"x_huge":123456789012345678901234567890}"#;

        let at: AccessToken = serde_json::from_str(json)?;
        let written = serde_json::to_string(&at)?;

        assert!(written.contains(r#""x_price":1.50"#), "{}", written);
        assert!(written.contains(r#""x_big":1e2"#), "{}", written);
        assert!(written.contains(r#""x_huge":123456789012345678901234567890"#), "{}", written);
        Ok(())
    }

    #[test]
    fn non_bearer_tokens_use_auth_scheme_type() -> color_eyre::Result<()> {
        let at = AccessToken::builder(
            Environment::from_static("login.example.com"),
            ClientId::from_static("client-1"),
            TenantId::from_static("contoso"),
            AccessTokenSecret::from_static("secret"),
            ScopeSet::parse("a"),
        )
        .with_lifetime(UnixTime(0), UnixTime(100))
        .with_token_type("pop")
        .with_key_id(KeyId::from_static("kid"))
        .build()?;

        assert_eq!(at.credential_type(), CredentialType::AccessTokenWithAuthScheme);
        assert!(at.cache_key().as_str().ends_with("-a-pop"));

        let value = serde_json::to_value(&at)?;
        assert_eq!(value["credential_type"], "AccessToken_With_AuthScheme");
        assert_eq!(value["keyid"], "kid");
        Ok(())
    }

    #[test]
    fn wrong_credential_type_is_rejected() {
        let json = r#"{
            "home_account_id": "uid.utid",
            "environment": "login.example.com",
            "credential_type": "RefreshToken",
            "client_id": "client-1",
            "secret": "secret",
            "realm": "contoso",
            "target": "a",
            "cached_at": "1",
            "expires_on": "2"
        }"#;

        let err = serde_json::from_str::<AccessToken>(json).unwrap_err();
        assert!(err.to_string().contains("expected a credential of type"));
    }
}

//! Token responses handed to the cache by the acquisition flow

use idcache_clock::DurationSecs;
use serde::{Deserialize, Serialize};

use crate::{
    braids::{AccessTokenSecret, FamilyId, IdTokenSecret, KeyId, OboCacheKey, RefreshTokenSecret, TenantId},
    entities::AuthorityType,
    scope::ScopeSet,
};

/// A successful response from the provider's token endpoint
///
/// Lifetimes may be sent as numbers or as numeric strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<AccessTokenSecret>,
    /// The access token type; bearer when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Seconds until the access token expires
    #[serde(default, with = "seconds", skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<DurationSecs>,
    /// Seconds until the access token expires when the provider is unavailable
    #[serde(default, with = "seconds", skip_serializing_if = "Option::is_none")]
    pub ext_expires_in: Option<DurationSecs>,
    /// Seconds until the access token should be proactively refreshed
    #[serde(default, with = "seconds", skip_serializing_if = "Option::is_none")]
    pub refresh_in: Option<DurationSecs>,
    /// The granted scopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSet>,
    /// The refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshTokenSecret>,
    /// The ID token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdTokenSecret>,
    /// Base64url-encoded client info
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<String>,
    /// The family the client belongs to
    #[serde(default, rename = "foci", skip_serializing_if = "Option::is_none")]
    pub family_id: Option<FamilyId>,
}

mod seconds {
    use idcache_clock::DurationSecs;
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SecondsDto {
        Number(u64),
        String(String),
    }

    pub fn serialize<S: Serializer>(
        d: &Option<DurationSecs>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        d.map(|d| d.0).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DurationSecs>, D::Error> {
        match Option::<SecondsDto>::deserialize(deserializer)? {
            None => Ok(None),
            Some(SecondsDto::Number(n)) => Ok(Some(DurationSecs(n))),
            Some(SecondsDto::String(s)) if s.trim().is_empty() => Ok(None),
            Some(SecondsDto::String(s)) => s
                .trim()
                .parse()
                .map(|n| Some(DurationSecs(n)))
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&s), &"a number of seconds")),
        }
    }
}

/// The context in which a token response was obtained
#[derive(Clone, Debug)]
pub struct SaveTokenRequest {
    authority: String,
    tenant_id: Option<TenantId>,
    scopes: ScopeSet,
    key_id: Option<KeyId>,
    obo_cache_key: Option<OboCacheKey>,
    authority_type: AuthorityType,
}

impl SaveTokenRequest {
    /// Constructs a request context for tokens from `authority`
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            tenant_id: None,
            scopes: ScopeSet::empty(),
            key_id: None,
            obo_cache_key: None,
            authority_type: AuthorityType::default(),
        }
    }

    /// Sets the tenant the request was made for
    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Sets the requested scopes, used when the response does not echo them
    #[must_use]
    pub fn with_scopes(mut self, scopes: ScopeSet) -> Self {
        self.scopes = scopes;
        self
    }

    /// Binds the access token to a proof-of-possession key
    #[must_use]
    pub fn with_key_id(mut self, key_id: KeyId) -> Self {
        self.key_id = Some(key_id);
        self
    }

    /// Places the tokens in an on-behalf-of partition
    #[must_use]
    pub fn with_obo_cache_key(mut self, obo_cache_key: OboCacheKey) -> Self {
        self.obo_cache_key = Some(obo_cache_key);
        self
    }

    /// Sets the kind of authority that issued the tokens
    #[must_use]
    pub fn with_authority_type(mut self, authority_type: AuthorityType) -> Self {
        self.authority_type = authority_type;
        self
    }

    /// The authority URL
    #[inline]
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The tenant the request was made for
    #[inline]
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    /// The requested scopes
    #[inline]
    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    /// The proof-of-possession key
    #[inline]
    pub fn key_id(&self) -> Option<&KeyId> {
        self.key_id.as_ref()
    }

    /// The on-behalf-of partition
    #[inline]
    pub fn obo_cache_key(&self) -> Option<&OboCacheKey> {
        self.obo_cache_key.as_ref()
    }

    /// The kind of authority
    #[inline]
    pub fn authority_type(&self) -> AuthorityType {
        self.authority_type
    }
}

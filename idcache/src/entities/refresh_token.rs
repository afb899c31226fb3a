use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use super::{check_credential_type, non_empty, AdditionalFields, InvalidEntity};
use crate::{
    braids::{
        ClientId, ClientIdRef, Environment, EnvironmentRef, FamilyId, FamilyIdRef, HomeAccountId,
        HomeAccountIdRef, OboCacheKey, OboCacheKeyRef, RefreshTokenSecret, RefreshTokenSecretRef,
        TenantId, TenantIdRef,
    },
    keys::{CacheKey, CacheKeyRef, CredentialKeyParts, CredentialType},
};

#[derive(Serialize, Deserialize)]
struct RefreshTokenRecord {
    home_account_id: HomeAccountId,
    environment: Environment,
    #[serde(default)]
    credential_type: String,
    client_id: ClientId,
    secret: RefreshTokenSecret,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    family_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    realm: Option<TenantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_assertion_hash: Option<OboCacheKey>,
    #[serde(flatten)]
    additional_fields: AdditionalFields,
}

/// A cached refresh token
///
/// A refresh token with a family id is a family refresh token: it is keyed by
/// the family rather than the client and may be redeemed by any client in
/// that family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RefreshTokenRecord", into = "RefreshTokenRecord")]
pub struct RefreshToken {
    home_account_id: HomeAccountId,
    environment: Environment,
    client_id: ClientId,
    secret: RefreshTokenSecret,
    family_id: Option<FamilyId>,
    tenant_id: Option<TenantId>,
    obo_cache_key: Option<OboCacheKey>,
    additional_fields: AdditionalFields,
    key: CacheKey,
}

impl RefreshToken {
    /// Constructs a new refresh token, deriving its cache key
    pub fn new(
        home_account_id: HomeAccountId,
        environment: Environment,
        client_id: ClientId,
        secret: RefreshTokenSecret,
        family_id: Option<FamilyId>,
    ) -> Result<Self, InvalidEntity> {
        Self::try_from(RefreshTokenRecord {
            home_account_id,
            environment,
            credential_type: String::new(),
            client_id,
            secret,
            family_id: family_id.map(FamilyId::take).unwrap_or_default(),
            realm: None,
            user_assertion_hash: None,
            additional_fields: AdditionalFields::new(),
        })
    }

    /// Records the tenant the token was issued for
    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Places the token in an on-behalf-of partition
    #[must_use]
    pub fn with_obo_cache_key(mut self, obo_cache_key: OboCacheKey) -> Self {
        self.obo_cache_key = Some(obo_cache_key);
        self
    }

    /// The key this token is stored under
    #[inline]
    pub fn cache_key(&self) -> &CacheKeyRef {
        &self.key
    }

    /// The user the token belongs to
    #[inline]
    pub fn home_account_id(&self) -> &HomeAccountIdRef {
        &self.home_account_id
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

    /// The token itself
    #[inline]
    pub fn secret(&self) -> &RefreshTokenSecretRef {
        &self.secret
    }

    /// The application family this token is shared with
    #[inline]
    pub fn family_id(&self) -> Option<&FamilyIdRef> {
        self.family_id.as_deref()
    }

    /// Whether this is a family refresh token
    #[inline]
    pub fn is_family_refresh_token(&self) -> bool {
        self.family_id.is_some()
    }

    /// The tenant the token was issued for, if recorded
    #[inline]
    pub fn tenant_id(&self) -> Option<&TenantIdRef> {
        self.tenant_id.as_deref()
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
}

impl TryFrom<RefreshTokenRecord> for RefreshToken {
    type Error = InvalidEntity;

    fn try_from(record: RefreshTokenRecord) -> Result<Self, Self::Error> {
        check_credential_type(CredentialType::RefreshToken, &record.credential_type)?;

        let family_id = non_empty(record.family_id);

        let key = CredentialKeyParts {
            home_account_id: record.home_account_id.as_str(),
            environment: record.environment.as_str(),
            credential_type: CredentialType::RefreshToken,
            client_id: record.client_id.as_str(),
            family_id: family_id.as_deref(),
            tenant_id: "",
            scopes: None,
            token_type: None,
        }
        .cache_key()?;

        Ok(Self {
            home_account_id: record.home_account_id,
            environment: record.environment,
            client_id: record.client_id,
            secret: record.secret,
            family_id: family_id.map(FamilyId::from),
            tenant_id: record.realm.filter(|t| !t.as_str().is_empty()),
            obo_cache_key: record.user_assertion_hash,
            additional_fields: record.additional_fields,
            key,
        })
    }
}

impl From<RefreshToken> for RefreshTokenRecord {
    fn from(rt: RefreshToken) -> Self {
        Self {
            home_account_id: rt.home_account_id,
            environment: rt.environment,
            credential_type: CredentialType::RefreshToken.as_str().to_owned(),
            client_id: rt.client_id,
            secret: rt.secret,
            family_id: rt.family_id.map(FamilyId::take).unwrap_or_default(),
            realm: rt.tenant_id,
            user_assertion_hash: rt.obo_cache_key,
            additional_fields: rt.additional_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_tokens_are_keyed_by_family() -> color_eyre::Result<()> {
        let frt = RefreshToken::new(
            HomeAccountId::from_static("uid.utid"),
            Environment::from_static("login.example.com"),
            ClientId::from_static("client-1"),
            RefreshTokenSecret::from_static("rt"),
            Some(FamilyId::from_static("1")),
        )?;

        assert!(frt.is_family_refresh_token());
        assert_eq!(
            frt.cache_key().as_str(),
            "uid.utid-login.example.com-refreshtoken-1--"
        );
        Ok(())
    }

    #[test]
    fn empty_family_id_is_not_a_family() -> color_eyre::Result<()> {
        let json = r#"{
            "home_account_id": "uid.utid",
            "environment": "login.example.com",
            "credential_type": "RefreshToken",
            "client_id": "client-1",
            "secret": "rt",
            "family_id": "",
            "last_modification_time": "1548803419"
        }"#;

        let rt: RefreshToken = serde_json::from_str(json)?;
        assert!(!rt.is_family_refresh_token());
        assert_eq!(
            rt.cache_key().as_str(),
            "uid.utid-login.example.com-refreshtoken-client-1--"
        );

        let value = serde_json::to_value(&rt)?;
        assert!(value.get("family_id").is_none());
        assert_eq!(value["last_modification_time"], "1548803419");
        Ok(())
    }

    #[test]
    fn missing_home_account_is_rejected() {
        let err = RefreshToken::new(
            HomeAccountId::from_static(""),
            Environment::from_static("login.example.com"),
            ClientId::from_static("client-1"),
            RefreshTokenSecret::from_static("rt"),
            None,
        )
        .unwrap_err();

        assert!(matches!(err, InvalidEntity::MissingKeyComponent(_)));
    }
}

use std::convert::TryFrom;

use aliri_base64::Base64Url;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{check_credential_type, AdditionalFields, InvalidEntity};
use crate::{
    braids::{
        ClientId, ClientIdRef, Environment, EnvironmentRef, HomeAccountId, HomeAccountIdRef,
        IdTokenSecret, IdTokenSecretRef, TenantId, TenantIdRef,
    },
    keys::{CacheKey, CacheKeyRef, CredentialKeyParts, CredentialType},
};

/// The identity claims carried by an ID token
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Object id of the user within the tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Tenant id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// The username the user signs in with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// User principal name, issued by older authorities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upn: Option<String>,
    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Given name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    /// Family name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
}

impl IdTokenClaims {
    /// Parses the claims from the payload segment of an encoded token
    ///
    /// Signatures are not verified; the token was received directly from the
    /// provider over a trusted channel.
    pub fn parse(raw: &str) -> Option<Self> {
        let payload = raw.split('.').nth(1)?;
        let decoded = match Base64Url::from_encoded(payload.trim_end_matches('=')) {
            Ok(d) => d,
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "id token payload is not base64url"
                );
                return None;
            }
        };

        match serde_json::from_slice(&decoded.into_inner()) {
            Ok(claims) => Some(claims),
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "id token payload is not a claims object"
                );
                None
            }
        }
    }

    /// The object id, falling back to the subject
    pub fn object_id(&self) -> Option<&str> {
        self.oid.as_deref().or_else(|| self.sub.as_deref())
    }

    /// The username, from the first of `preferred_username`, `upn` or `email`
    pub fn username(&self) -> Option<&str> {
        self.preferred_username
            .as_deref()
            .or_else(|| self.upn.as_deref())
            .or_else(|| self.email.as_deref())
    }
}

#[derive(Serialize, Deserialize)]
struct IdTokenRecord {
    home_account_id: HomeAccountId,
    environment: Environment,
    #[serde(default)]
    credential_type: String,
    client_id: ClientId,
    secret: IdTokenSecret,
    #[serde(default = "empty_tenant")]
    realm: TenantId,
    #[serde(flatten)]
    additional_fields: AdditionalFields,
}

fn empty_tenant() -> TenantId {
    TenantId::from_static("")
}

/// A cached OpenID Connect ID token
///
/// Claims are parsed from the raw token the first time they are requested and
/// memoized for the life of this value.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "IdTokenRecord", into = "IdTokenRecord")]
pub struct IdToken {
    home_account_id: HomeAccountId,
    environment: Environment,
    client_id: ClientId,
    tenant_id: TenantId,
    secret: IdTokenSecret,
    additional_fields: AdditionalFields,
    key: CacheKey,
    claims: OnceCell<Option<IdTokenClaims>>,
}

impl PartialEq for IdToken {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.home_account_id == other.home_account_id
            && self.environment == other.environment
            && self.client_id == other.client_id
            && self.tenant_id == other.tenant_id
            && self.secret == other.secret
            && self.additional_fields == other.additional_fields
    }
}

impl Eq for IdToken {}

impl IdToken {
    /// Constructs a new ID token, deriving its cache key
    pub fn new(
        home_account_id: HomeAccountId,
        environment: Environment,
        client_id: ClientId,
        tenant_id: TenantId,
        secret: IdTokenSecret,
    ) -> Result<Self, InvalidEntity> {
        Self::try_from(IdTokenRecord {
            home_account_id,
            environment,
            credential_type: String::new(),
            client_id,
            secret,
            realm: tenant_id,
            additional_fields: AdditionalFields::new(),
        })
    }

    /// The key this token is stored under
    #[inline]
    pub fn cache_key(&self) -> &CacheKeyRef {
        &self.key
    }

    /// The user the token describes
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

    /// The tenant the token was issued by
    #[inline]
    pub fn tenant_id(&self) -> &TenantIdRef {
        &self.tenant_id
    }

    /// The raw token
    #[inline]
    pub fn secret(&self) -> &IdTokenSecretRef {
        &self.secret
    }

    /// Fields not understood by this version
    #[inline]
    pub fn additional_fields(&self) -> &AdditionalFields {
        &self.additional_fields
    }

    /// The token's claims, or `None` if the token cannot be parsed
    pub fn claims(&self) -> Option<&IdTokenClaims> {
        self.claims
            .get_or_init(|| IdTokenClaims::parse(self.secret.as_str()))
            .as_ref()
    }
}

impl TryFrom<IdTokenRecord> for IdToken {
    type Error = InvalidEntity;

    fn try_from(record: IdTokenRecord) -> Result<Self, Self::Error> {
        check_credential_type(CredentialType::IdToken, &record.credential_type)?;

        let key = CredentialKeyParts {
            home_account_id: record.home_account_id.as_str(),
            environment: record.environment.as_str(),
            credential_type: CredentialType::IdToken,
            client_id: record.client_id.as_str(),
            family_id: None,
            tenant_id: record.realm.as_str(),
            scopes: None,
            token_type: None,
        }
        .cache_key()?;

        Ok(Self {
            home_account_id: record.home_account_id,
            environment: record.environment,
            client_id: record.client_id,
            tenant_id: record.realm,
            secret: record.secret,
            additional_fields: record.additional_fields,
            key,
            claims: OnceCell::new(),
        })
    }
}

impl From<IdToken> for IdTokenRecord {
    fn from(idt: IdToken) -> Self {
        Self {
            home_account_id: idt.home_account_id,
            environment: idt.environment,
            credential_type: CredentialType::IdToken.as_str().to_owned(),
            client_id: idt.client_id,
            secret: idt.secret,
            realm: idt.tenant_id,
            additional_fields: idt.additional_fields,
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_test_id_token(claims: &serde_json::Value) -> IdTokenSecret {
    let header = Base64Url::from_raw(r#"{"alg":"none"}"#.as_bytes());
    let payload = Base64Url::from_raw(claims.to_string().into_bytes());
    IdTokenSecret::new(format!("{}.{}.", header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_token(secret: IdTokenSecret) -> Result<IdToken, InvalidEntity> {
        IdToken::new(
            HomeAccountId::from_static("uid.utid"),
            Environment::from_static("login.example.com"),
            ClientId::from_static("client-1"),
            TenantId::from_static("contoso"),
            secret,
        )
    }

    #[test]
    fn claims_are_parsed_on_demand() -> color_eyre::Result<()> {
        let secret = encode_test_id_token(&serde_json::json!({
            "oid": "object-1",
            "preferred_username": "user@contoso.com",
            "tid": "contoso",
            "name": "A User",
        }));
        let idt = id_token(secret)?;

        let claims = idt.claims().expect("claims should parse");
        assert_eq!(claims.object_id(), Some("object-1"));
        assert_eq!(claims.username(), Some("user@contoso.com"));
        assert_eq!(claims.name.as_deref(), Some("A User"));
        assert_eq!(
            idt.cache_key().as_str(),
            "uid.utid-login.example.com-idtoken-client-1-contoso-"
        );
        Ok(())
    }

    #[test]
    fn garbage_tokens_have_no_claims() -> color_eyre::Result<()> {
        let idt = id_token(IdTokenSecret::from_static("not-a-jwt"))?;
        assert!(idt.claims().is_none());

        let idt = id_token(IdTokenSecret::from_static("a.!!!.c"))?;
        assert!(idt.claims().is_none());
        Ok(())
    }

    #[test]
    fn memoized_claims_do_not_affect_equality() -> color_eyre::Result<()> {
        let secret = encode_test_id_token(&serde_json::json!({ "sub": "s" }));
        let a = id_token(secret.clone())?;
        let b = id_token(secret)?;
        let _ = a.claims();
        assert_eq!(a, b);

        let round_tripped: IdToken = serde_json::from_value(serde_json::to_value(&a)?)?;
        assert_eq!(round_tripped, a);
        Ok(())
    }
}

//! Cache key derivation
//!
//! Every cached entity is stored under a key derived from its scoping
//! attributes. String keys are used by the JSON document buckets; the
//! [`KeychainKey`] tuple is the equivalent for attribute-based secure stores.
//!
//! Keys are lower-cased and joined by [`KEY_DELIMITER`]. Absent optional
//! segments are written as empty strings.

use std::fmt;

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{entities::AuthorityType, scope::ScopeSet};

/// Separates the segments of a string cache key
pub const KEY_DELIMITER: &str = "-";

const APP_METADATA_PREFIX: &str = "appmetadata";

/// A derived cache key
///
/// Keys are always lower case.
#[braid(serde)]
pub struct CacheKey;

/// A mandatory component of a cache key was absent or empty
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("cannot derive a cache key without a {component}")]
pub struct MissingKeyComponent {
    component: &'static str,
}

impl MissingKeyComponent {
    pub(crate) const fn new(component: &'static str) -> Self {
        Self { component }
    }

    /// The name of the missing component
    pub fn component(&self) -> &'static str {
        self.component
    }
}

fn require<'a>(value: &'a str, component: &'static str) -> Result<&'a str, MissingKeyComponent> {
    if value.trim().is_empty() {
        Err(MissingKeyComponent::new(component))
    } else {
        Ok(value)
    }
}

fn join_lower(segments: &[&str]) -> String {
    segments.join(KEY_DELIMITER).to_ascii_lowercase()
}

/// The kind of credential an entry holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialType {
    /// A bearer access token
    AccessToken,
    /// An access token bound to a non-bearer authentication scheme
    #[serde(rename = "AccessToken_With_AuthScheme")]
    AccessTokenWithAuthScheme,
    /// A refresh token
    RefreshToken,
    /// An OpenID Connect ID token
    IdToken,
}

impl CredentialType {
    /// The name of the credential type as written in the cache document
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "AccessToken",
            Self::AccessTokenWithAuthScheme => "AccessToken_With_AuthScheme",
            Self::RefreshToken => "RefreshToken",
            Self::IdToken => "IdToken",
        }
    }

    /// The numeric item type used by keychain-style stores
    pub const fn keychain_type(self) -> u32 {
        match self {
            Self::AccessToken | Self::AccessTokenWithAuthScheme => 2001,
            Self::RefreshToken => 2002,
            Self::IdToken => 2003,
        }
    }

    /// Whether this is one of the access token types
    pub const fn is_access_token(self) -> bool {
        matches!(self, Self::AccessToken | Self::AccessTokenWithAuthScheme)
    }
}

impl fmt::Display for CredentialType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key tuple for attribute-based secure stores
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeychainKey {
    /// The `account` attribute
    pub account: String,
    /// The `service` attribute
    pub service: String,
    /// The `generic` attribute
    pub generic: String,
    /// The item type code
    pub type_code: u32,
}

/// The scoping attributes of a credential
///
/// Refresh tokens that belong to a family are keyed by their family id in
/// place of the client id.
#[derive(Clone, Copy, Debug)]
pub struct CredentialKeyParts<'a> {
    /// The home account id; may only be empty for app-only access tokens
    pub home_account_id: &'a str,
    /// The provider host
    pub environment: &'a str,
    /// The kind of credential
    pub credential_type: CredentialType,
    /// The client the credential was issued to
    pub client_id: &'a str,
    /// The family id, for family refresh tokens
    pub family_id: Option<&'a str>,
    /// The tenant, empty for refresh tokens
    pub tenant_id: &'a str,
    /// The scopes, access tokens only
    pub scopes: Option<&'a ScopeSet>,
    /// The token type for non-bearer access tokens
    pub token_type: Option<&'a str>,
}

impl<'a> CredentialKeyParts<'a> {
    fn client_or_family(&self) -> Result<&'a str, MissingKeyComponent> {
        match self.family_id {
            Some(family) if !family.is_empty() => Ok(family),
            _ => require(self.client_id, "client id"),
        }
    }

    fn validate(&self) -> Result<(&'a str, &'a str), MissingKeyComponent> {
        let environment = require(self.environment, "environment")?;
        if !self.credential_type.is_access_token() {
            require(self.home_account_id, "home account id")?;
        }
        let client = self.client_or_family()?;
        Ok((environment, client))
    }

    /// Derives the string key
    pub fn cache_key(&self) -> Result<CacheKey, MissingKeyComponent> {
        let (environment, client) = self.validate()?;
        let scopes = self.scopes.map(ScopeSet::to_string).unwrap_or_default();

        let mut key = join_lower(&[
            self.home_account_id,
            environment,
            self.credential_type.as_str(),
            client,
            self.tenant_id,
            &scopes,
        ]);

        if let Some(token_type) = self.token_type.filter(|_| {
            self.credential_type == CredentialType::AccessTokenWithAuthScheme
        }) {
            key.push_str(KEY_DELIMITER);
            key.push_str(&token_type.to_ascii_lowercase());
        }

        Ok(CacheKey::new(key))
    }

    /// Derives the keychain tuple
    pub fn keychain_key(&self) -> Result<KeychainKey, MissingKeyComponent> {
        let (environment, client) = self.validate()?;
        let scopes = self.scopes.map(ScopeSet::to_string).unwrap_or_default();
        let credential_type = self.credential_type.as_str();

        Ok(KeychainKey {
            account: join_lower(&[self.home_account_id, environment]),
            service: join_lower(&[credential_type, client, self.tenant_id, &scopes]),
            generic: join_lower(&[credential_type, client, self.tenant_id]),
            type_code: self.credential_type.keychain_type(),
        })
    }
}

/// Derives the string key for an account
pub fn account_key(
    home_account_id: &str,
    environment: &str,
    tenant_id: &str,
) -> Result<CacheKey, MissingKeyComponent> {
    let home_account_id = require(home_account_id, "home account id")?;
    let environment = require(environment, "environment")?;
    Ok(CacheKey::new(join_lower(&[
        home_account_id,
        environment,
        tenant_id,
    ])))
}

/// Derives the keychain tuple for an account
pub fn account_keychain_key(
    home_account_id: &str,
    environment: &str,
    tenant_id: &str,
    username: &str,
    authority_type: AuthorityType,
) -> Result<KeychainKey, MissingKeyComponent> {
    let home_account_id = require(home_account_id, "home account id")?;
    let environment = require(environment, "environment")?;
    Ok(KeychainKey {
        account: join_lower(&[home_account_id, environment]),
        service: tenant_id.to_ascii_lowercase(),
        generic: username.to_ascii_lowercase(),
        type_code: authority_type.keychain_type(),
    })
}

/// Derives the string key for application metadata
pub fn app_metadata_key(environment: &str, client_id: &str) -> Result<CacheKey, MissingKeyComponent> {
    let environment = require(environment, "environment")?;
    let client_id = require(client_id, "client id")?;
    Ok(CacheKey::new(join_lower(&[
        APP_METADATA_PREFIX,
        environment,
        client_id,
    ])))
}

/// Derives the keychain tuple for application metadata
pub fn app_metadata_keychain_key(
    environment: &str,
    client_id: &str,
) -> Result<KeychainKey, MissingKeyComponent> {
    let environment = require(environment, "environment")?;
    let client_id = require(client_id, "client id")?;
    Ok(KeychainKey {
        account: environment.to_ascii_lowercase(),
        service: join_lower(&[APP_METADATA_PREFIX, client_id]),
        generic: "1".to_owned(),
        type_code: 3001,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access_token_parts(scopes: &ScopeSet) -> CredentialKeyParts<'_> {
        CredentialKeyParts {
            home_account_id: "uid.utid",
            environment: "login.example.com",
            credential_type: CredentialType::AccessToken,
            client_id: "Client-1",
            family_id: None,
            tenant_id: "contoso",
            scopes: Some(scopes),
            token_type: None,
        }
    }

    #[test]
    fn access_token_key_layout() -> color_eyre::Result<()> {
        let scopes = ScopeSet::parse("User.Read Mail.Send");
        let key = access_token_parts(&scopes).cache_key()?;
        assert_eq!(
            key.as_str(),
            "uid.utid-login.example.com-accesstoken-client-1-contoso-mail.send user.read"
        );
        Ok(())
    }

    #[test]
    fn scope_order_and_case_give_the_same_key() -> color_eyre::Result<()> {
        let a = ScopeSet::parse("User.Read Mail.Send");
        let b = ScopeSet::parse("mail.send USER.READ");
        assert_eq!(
            access_token_parts(&a).cache_key()?,
            access_token_parts(&b).cache_key()?
        );
        Ok(())
    }

    #[test]
    fn family_refresh_token_folds_family_id() -> color_eyre::Result<()> {
        let parts = CredentialKeyParts {
            home_account_id: "uid.utid",
            environment: "login.example.com",
            credential_type: CredentialType::RefreshToken,
            client_id: "client-1",
            family_id: Some("1"),
            tenant_id: "",
            scopes: None,
            token_type: None,
        };
        assert_eq!(
            parts.cache_key()?.as_str(),
            "uid.utid-login.example.com-refreshtoken-1--"
        );

        let plain = CredentialKeyParts {
            family_id: None,
            ..parts
        };
        assert_eq!(
            plain.cache_key()?.as_str(),
            "uid.utid-login.example.com-refreshtoken-client-1--"
        );
        Ok(())
    }

    #[test]
    fn pop_tokens_carry_their_scheme() -> color_eyre::Result<()> {
        let scopes = ScopeSet::parse("a");
        let parts = CredentialKeyParts {
            credential_type: CredentialType::AccessTokenWithAuthScheme,
            token_type: Some("PoP"),
            ..access_token_parts(&scopes)
        };
        assert_eq!(
            parts.cache_key()?.as_str(),
            "uid.utid-login.example.com-accesstoken_with_authscheme-client-1-contoso-a-pop"
        );
        Ok(())
    }

    #[test]
    fn missing_components_are_rejected() {
        let scopes = ScopeSet::parse("a");
        let no_env = CredentialKeyParts {
            environment: "",
            ..access_token_parts(&scopes)
        };
        assert_eq!(
            no_env.cache_key().unwrap_err().component(),
            "environment"
        );

        let refresh_without_account = CredentialKeyParts {
            home_account_id: "",
            credential_type: CredentialType::RefreshToken,
            ..access_token_parts(&scopes)
        };
        assert_eq!(
            refresh_without_account.cache_key().unwrap_err().component(),
            "home account id"
        );

        let app_only = CredentialKeyParts {
            home_account_id: "",
            ..access_token_parts(&scopes)
        };
        assert!(app_only.cache_key().is_ok());

        assert_eq!(
            app_metadata_key("login.example.com", " ").unwrap_err().component(),
            "client id"
        );
    }

    #[test]
    fn account_and_metadata_keys() -> color_eyre::Result<()> {
        assert_eq!(
            account_key("UID.UTID", "login.example.com", "Contoso")?.as_str(),
            "uid.utid-login.example.com-contoso"
        );
        assert_eq!(
            app_metadata_key("login.example.com", "Client-1")?.as_str(),
            "appmetadata-login.example.com-client-1"
        );
        Ok(())
    }

    #[test]
    fn keychain_tuples() -> color_eyre::Result<()> {
        let scopes = ScopeSet::parse("b a");
        let key = access_token_parts(&scopes).keychain_key()?;
        assert_eq!(
            key,
            KeychainKey {
                account: "uid.utid-login.example.com".into(),
                service: "accesstoken-client-1-contoso-a b".into(),
                generic: "accesstoken-client-1-contoso".into(),
                type_code: 2001,
            }
        );

        let account = account_keychain_key(
            "uid.utid",
            "login.example.com",
            "contoso",
            "User@Contoso.com",
            AuthorityType::Msa,
        )?;
        assert_eq!(account.generic, "user@contoso.com");
        assert_eq!(account.type_code, 1003);

        let meta = app_metadata_keychain_key("login.example.com", "client-1")?;
        assert_eq!(meta.service, "appmetadata-client-1");
        assert_eq!(meta.type_code, 3001);
        Ok(())
    }
}

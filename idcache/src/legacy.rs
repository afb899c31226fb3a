//! The legacy token cache
//!
//! Older library generations persist a single flat dictionary, keyed by a
//! composite of authority, resource, client and subject type, as one
//! versioned binary blob. See [`codec`] for the blob layout.

use std::{
    collections::BTreeMap,
    convert::TryFrom,
    error, fmt,
    sync::{Mutex, PoisonError},
};

use idcache_clock::UnixTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod codec;

/// Separates the components of a serialized legacy key
pub const LEGACY_KEY_DELIMITER: &str = ":::";

/// The subject a legacy token was issued to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TokenSubjectType {
    /// A user
    User = 0,
    /// A confidential client acting as itself
    Client = 1,
    /// A user through a confidential client
    UserPlusClient = 2,
}

impl TokenSubjectType {
    /// The numeric value written in serialized keys
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for TokenSubjectType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::User),
            1 => Ok(Self::Client),
            2 => Ok(Self::UserPlusClient),
            other => Err(other),
        }
    }
}

/// A legacy key component contained the key delimiter
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("legacy key {component} must not contain `{}`", LEGACY_KEY_DELIMITER)]
pub struct InvalidLegacyKey {
    component: &'static str,
}

/// The composite key of a legacy cache entry
///
/// Authority, resource, client id and displayable id compare without case;
/// they are stored lower-cased.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LegacyCacheKey {
    authority: String,
    resource: String,
    client_id: String,
    subject_type: TokenSubjectType,
    unique_id: Option<String>,
    displayable_id: Option<String>,
}

fn checked(value: &str, component: &'static str) -> Result<String, InvalidLegacyKey> {
    if value.contains(LEGACY_KEY_DELIMITER) {
        Err(InvalidLegacyKey { component })
    } else {
        Ok(value.to_ascii_lowercase())
    }
}

impl LegacyCacheKey {
    /// Constructs a legacy key
    pub fn new(
        authority: &str,
        resource: &str,
        client_id: &str,
        subject_type: TokenSubjectType,
        unique_id: Option<&str>,
        displayable_id: Option<&str>,
    ) -> Result<Self, InvalidLegacyKey> {
        Ok(Self {
            authority: checked(authority, "authority")?,
            resource: checked(resource, "resource")?,
            client_id: checked(client_id, "client id")?,
            subject_type,
            unique_id: unique_id.filter(|s| !s.is_empty()).map(str::to_owned),
            displayable_id: displayable_id
                .filter(|s| !s.is_empty())
                .map(str::to_ascii_lowercase),
        })
    }

    /// The authority URL
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// The resource, or space-delimited scopes for entries written through
    /// from the current cache
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The client id
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The subject type
    pub fn subject_type(&self) -> TokenSubjectType {
        self.subject_type
    }

    /// The user's unique id
    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    /// The user's displayable id, usually a UPN
    pub fn displayable_id(&self) -> Option<&str> {
        self.displayable_id.as_deref()
    }

    /// The string form written to the blob
    ///
    /// User identifiers are not part of the string; they are recovered from
    /// the entry's value when read.
    pub fn to_key_string(&self) -> String {
        format!(
            "{a}{d}{r}{d}{c}{d}{s}",
            a = self.authority,
            r = self.resource,
            c = self.client_id,
            s = self.subject_type.as_i32(),
            d = LEGACY_KEY_DELIMITER,
        )
    }
}

/// User information recorded with a legacy result
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LegacyUserInfo {
    /// The user's unique (object) id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    /// The user's displayable id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayable_id: Option<String>,
    /// Given name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    /// Family name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    /// The identity provider that authenticated the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_provider: Option<String>,
}

/// The token response recorded by a legacy entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LegacyResult {
    /// The access token, if one is cached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// The access token type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token_type: Option<String>,
    /// When the access token expires
    #[serde(default)]
    pub expires_on: UnixTime,
    /// When the access token expires if the provider is unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_expires_on: Option<UnixTime>,
    /// The tenant that issued the token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// The raw ID token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// The user the token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<LegacyUserInfo>,
}

/// The value of a legacy cache entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LegacyResultWrapper {
    /// The wrapped token response
    #[serde(default)]
    pub result: LegacyResult,
    /// The refresh token secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// The resource (or scopes) the refresh token was issued for; non-empty
    /// for multi-resource refresh tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_in_response: Option<String>,
    /// Raw client info for the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_client_info: Option<String>,
    /// Hash of the assertion for on-behalf-of entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_assertion_hash: Option<String>,
}

impl LegacyResultWrapper {
    /// Whether the entry carries a refresh token redeemable for other
    /// resources
    pub fn is_multiple_resource_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().map_or(false, |rt| !rt.is_empty())
            && self
                .resource_in_response
                .as_deref()
                .map_or(false, |r| !r.is_empty())
    }

    /// The user's unique id, if recorded
    pub fn unique_id(&self) -> Option<&str> {
        self.result
            .user_info
            .as_ref()
            .and_then(|u| u.unique_id.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// The user's displayable id, if recorded
    pub fn displayable_id(&self) -> Option<&str> {
        self.result
            .user_info
            .as_ref()
            .and_then(|u| u.displayable_id.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// The full legacy cache
pub type LegacyTokenDictionary = BTreeMap<LegacyCacheKey, LegacyResultWrapper>;

/// Loads and stores the legacy blob
///
/// Failures are reported to the caller, which logs them and carries on
/// without legacy data.
pub trait LegacyCachePersistence: fmt::Debug + Send + Sync {
    /// Loads the current blob; an empty vector means nothing is stored
    fn load(&self) -> Result<Vec<u8>, Box<dyn error::Error + Send + Sync + 'static>>;

    /// Replaces the stored blob
    fn store(&self, data: &[u8]) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>>;
}

/// Keeps the legacy blob in memory
#[derive(Debug, Default)]
pub struct InMemoryLegacyPersistence {
    data: Mutex<Vec<u8>>,
}

impl InMemoryLegacyPersistence {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store holding `data`
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// A copy of the stored blob
    pub fn contents(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LegacyCachePersistence for InMemoryLegacyPersistence {
    fn load(&self) -> Result<Vec<u8>, Box<dyn error::Error + Send + Sync + 'static>> {
        Ok(self.contents())
    }

    fn store(&self, data: &[u8]) -> Result<(), Box<dyn error::Error + Send + Sync + 'static>> {
        let mut stored = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        stored.clear();
        stored.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_reject_the_delimiter() {
        let err = LegacyCacheKey::new(
            "https://login.example.com/contoso/",
            "a:::b",
            "client-1",
            TokenSubjectType::User,
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "legacy key resource must not contain `:::`");
    }

    #[test]
    fn key_string_layout() -> color_eyre::Result<()> {
        let key = LegacyCacheKey::new(
            "https://Login.Example.com/contoso/",
            "https://graph.example.com",
            "Client-1",
            TokenSubjectType::UserPlusClient,
            Some("unique"),
            Some("User@Contoso.com"),
        )?;

        assert_eq!(
            key.to_key_string(),
            "https://login.example.com/contoso/:::https://graph.example.com:::client-1:::2"
        );
        assert_eq!(key.displayable_id(), Some("user@contoso.com"));
        assert_eq!(key.unique_id(), Some("unique"));
        Ok(())
    }

    #[test]
    fn mrrt_requires_refresh_token_and_resource() {
        let mut wrapper = LegacyResultWrapper {
            refresh_token: Some("rt".into()),
            ..Default::default()
        };
        assert!(!wrapper.is_multiple_resource_refresh_token());

        wrapper.resource_in_response = Some("https://graph.example.com".into());
        assert!(wrapper.is_multiple_resource_refresh_token());

        wrapper.refresh_token = Some(String::new());
        assert!(!wrapper.is_multiple_resource_refresh_token());
    }

    #[test]
    fn wrapper_json_uses_pascal_case() -> color_eyre::Result<()> {
        let wrapper = LegacyResultWrapper {
            result: LegacyResult {
                expires_on: UnixTime(10),
                user_info: Some(LegacyUserInfo {
                    unique_id: Some("u".into()),
                    displayable_id: Some("d".into()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            refresh_token: Some("rt".into()),
            ..Default::default()
        };

        let json = serde_json::to_string(&wrapper)?;
        assert_eq!(
            json,
            r#"{"Result":{"ExpiresOn":10,"UserInfo":{"UniqueId":"u","DisplayableId":"d"}},"RefreshToken":"rt"}"#
        );
        Ok(())
    }

    #[test]
    fn in_memory_persistence_replaces_content() {
        let store = InMemoryLegacyPersistence::with_data(vec![1, 2, 3]);
        assert!(store.store(&[9]).is_ok());
        assert_eq!(store.load().ok(), Some(vec![9]));
    }
}

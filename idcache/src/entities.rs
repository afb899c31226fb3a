//! Cached entities
//!
//! Each entity serializes through a private record type. Converting a record
//! into its entity is the finalize step: it validates mandatory fields,
//! parses the scope set, and derives the cache key before the entity can be
//! observed.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::{CredentialType, MissingKeyComponent};

mod access_token;
mod account;
mod app_metadata;
mod id_token;
mod refresh_token;

pub(crate) use access_token::auth_scheme;
pub use access_token::{AccessToken, AccessTokenBuilder, AccessTokenStatus};
pub use account::Account;
pub use app_metadata::AppMetadata;
pub use id_token::{IdToken, IdTokenClaims};
pub use refresh_token::RefreshToken;

#[cfg(test)]
pub(crate) use id_token::encode_test_id_token;

/// Fields not understood by this version of the schema
///
/// These are carried through untouched so that a newer writer sharing the
/// same cache does not lose data.
pub type AdditionalFields = serde_json::Map<String, serde_json::Value>;

/// An entity failed validation while being constructed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidEntity {
    /// A component required for the cache key was missing
    #[error(transparent)]
    MissingKeyComponent(#[from] MissingKeyComponent),
    /// The entity's declared credential type does not match its bucket
    #[error("expected a credential of type {expected}, found {found:?}")]
    WrongCredentialType {
        /// The credential type the entity must declare
        expected: CredentialType,
        /// The credential type that was found
        found: String,
    },
    /// The token claims to expire before it was cached
    #[error("token expires at {expires_on}, before it was cached at {cached_at}")]
    ExpiresBeforeCached {
        /// When the token was cached
        cached_at: idcache_clock::UnixTime,
        /// When the token expires
        expires_on: idcache_clock::UnixTime,
    },
}

/// The kind of authority that issued an account
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AuthorityType {
    /// A multi-tenant authority issuing client info
    MsSts,
    /// An on-premises federation authority
    Adfs,
    /// A consumer account authority
    Msa,
    /// Any other authority
    Other,
}

impl AuthorityType {
    /// The name as written in the cache document
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MsSts => "MSSTS",
            Self::Adfs => "ADFS",
            Self::Msa => "MSA",
            Self::Other => "Other",
        }
    }

    /// The numeric item type used by keychain-style stores
    pub const fn keychain_type(self) -> u32 {
        match self {
            Self::MsSts => 1001,
            Self::Adfs => 1002,
            Self::Msa => 1003,
            Self::Other => 1004,
        }
    }
}

impl Default for AuthorityType {
    fn default() -> Self {
        Self::MsSts
    }
}

impl fmt::Display for AuthorityType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthorityType {
    type Err = std::convert::Infallible;

    /// Unrecognized names map to [`AuthorityType::Other`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.eq_ignore_ascii_case("MSSTS") || s.eq_ignore_ascii_case("AAD") {
            Self::MsSts
        } else if s.eq_ignore_ascii_case("ADFS") {
            Self::Adfs
        } else if s.eq_ignore_ascii_case("MSA") {
            Self::Msa
        } else {
            Self::Other
        })
    }
}

impl Serialize for AuthorityType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AuthorityType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().unwrap_or(Self::Other))
    }
}

/// The kinds of entity held by the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Access tokens
    AccessToken,
    /// Refresh tokens
    RefreshToken,
    /// ID tokens
    IdToken,
    /// Accounts
    Account,
    /// Application metadata
    AppMetadata,
}

/// A set of entity kinds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EntityKinds(u8);

impl EntityKinds {
    /// No entity kinds
    pub const NONE: Self = Self(0);

    /// Every entity kind
    pub const ALL: Self = Self(0b1_1111);

    const fn bit(kind: EntityKind) -> u8 {
        match kind {
            EntityKind::AccessToken => 1,
            EntityKind::RefreshToken => 1 << 1,
            EntityKind::IdToken => 1 << 2,
            EntityKind::Account => 1 << 3,
            EntityKind::AppMetadata => 1 << 4,
        }
    }

    /// Adds a kind to the set
    #[must_use]
    pub const fn with(self, kind: EntityKind) -> Self {
        Self(self.0 | Self::bit(kind))
    }

    /// Adds a kind to the set in place
    pub fn insert(&mut self, kind: EntityKind) {
        *self = self.with(kind);
    }

    /// Whether the set includes `kind`
    pub const fn contains(self, kind: EntityKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    /// Whether the set is empty
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EntityKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<EntityKind> for EntityKinds {
    fn from(kind: EntityKind) -> Self {
        Self::NONE.with(kind)
    }
}

/// Reads an empty string as absent
pub(crate) fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub(crate) fn check_credential_type(
    expected: CredentialType,
    found: &str,
) -> Result<(), InvalidEntity> {
    if found.is_empty() || found.eq_ignore_ascii_case(expected.as_str()) {
        Ok(())
    } else {
        Err(InvalidEntity::WrongCredentialType {
            expected,
            found: found.to_owned(),
        })
    }
}

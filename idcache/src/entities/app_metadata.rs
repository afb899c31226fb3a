use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use super::{non_empty, AdditionalFields, InvalidEntity};
use crate::{
    braids::{ClientId, ClientIdRef, Environment, EnvironmentRef, FamilyId, FamilyIdRef},
    keys::{self, CacheKey, CacheKeyRef, KeychainKey, MissingKeyComponent},
};

#[derive(Serialize, Deserialize)]
struct AppMetadataRecord {
    client_id: ClientId,
    environment: Environment,
    #[serde(default)]
    family_id: String,
    #[serde(flatten)]
    additional_fields: AdditionalFields,
}

/// Records which application family, if any, a client belongs to
///
/// A record with no family id means the client is known not to be part of a
/// family. The absence of a record means membership is unknown. Application
/// metadata survives cache clears.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AppMetadataRecord", into = "AppMetadataRecord")]
pub struct AppMetadata {
    client_id: ClientId,
    environment: Environment,
    family_id: Option<FamilyId>,
    additional_fields: AdditionalFields,
    key: CacheKey,
}

impl AppMetadata {
    /// Constructs a new metadata record, deriving its cache key
    pub fn new(
        environment: Environment,
        client_id: ClientId,
        family_id: Option<FamilyId>,
    ) -> Result<Self, InvalidEntity> {
        Self::try_from(AppMetadataRecord {
            client_id,
            environment,
            family_id: family_id.map(FamilyId::take).unwrap_or_default(),
            additional_fields: AdditionalFields::new(),
        })
    }

    /// The key this record is stored under
    #[inline]
    pub fn cache_key(&self) -> &CacheKeyRef {
        &self.key
    }

    /// The keychain tuple for this record
    pub fn keychain_key(&self) -> Result<KeychainKey, MissingKeyComponent> {
        keys::app_metadata_keychain_key(self.environment.as_str(), self.client_id.as_str())
    }

    /// The client this record describes
    #[inline]
    pub fn client_id(&self) -> &ClientIdRef {
        &self.client_id
    }

    /// The provider host
    #[inline]
    pub fn environment(&self) -> &EnvironmentRef {
        &self.environment
    }

    /// The family the client belongs to, if any
    #[inline]
    pub fn family_id(&self) -> Option<&FamilyIdRef> {
        self.family_id.as_deref()
    }

    /// Fields not understood by this version
    #[inline]
    pub fn additional_fields(&self) -> &AdditionalFields {
        &self.additional_fields
    }
}

impl TryFrom<AppMetadataRecord> for AppMetadata {
    type Error = InvalidEntity;

    fn try_from(record: AppMetadataRecord) -> Result<Self, Self::Error> {
        let key = keys::app_metadata_key(record.environment.as_str(), record.client_id.as_str())?;

        Ok(Self {
            client_id: record.client_id,
            environment: record.environment,
            family_id: non_empty(record.family_id).map(FamilyId::from),
            additional_fields: record.additional_fields,
            key,
        })
    }
}

impl From<AppMetadata> for AppMetadataRecord {
    fn from(meta: AppMetadata) -> Self {
        Self {
            client_id: meta.client_id,
            environment: meta.environment,
            family_id: meta.family_id.map(FamilyId::take).unwrap_or_default(),
            additional_fields: meta.additional_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_empty_family_for_non_members() -> color_eyre::Result<()> {
        let meta = AppMetadata::new(
            Environment::from_static("login.example.com"),
            ClientId::from_static("client-1"),
            None,
        )?;

        let value = serde_json::to_value(&meta)?;
        assert_eq!(value["family_id"], "");
        assert_eq!(
            meta.cache_key().as_str(),
            "appmetadata-login.example.com-client-1"
        );
        Ok(())
    }

    #[test]
    fn requires_client_id() {
        let err = AppMetadata::new(
            Environment::from_static("login.example.com"),
            ClientId::from_static(""),
            Some(FamilyId::from_static("1")),
        )
        .unwrap_err();

        assert_eq!(
            err,
            InvalidEntity::MissingKeyComponent(MissingKeyComponent::new("client id"))
        );
    }
}

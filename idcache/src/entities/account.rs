use std::{collections::BTreeMap, convert::TryFrom};

use serde::{Deserialize, Serialize};

use super::{AdditionalFields, AuthorityType, InvalidEntity};
use crate::{
    braids::{Environment, EnvironmentRef, HomeAccountId, HomeAccountIdRef, TenantId, TenantIdRef},
    keys::{self, CacheKey, CacheKeyRef, KeychainKey, MissingKeyComponent},
};

#[derive(Serialize, Deserialize)]
struct AccountRecord {
    home_account_id: HomeAccountId,
    environment: Environment,
    #[serde(default = "empty_tenant")]
    realm: TenantId,
    #[serde(default)]
    local_account_id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    authority_type: AuthorityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    middle_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_info: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    wam_account_ids: BTreeMap<String, String>,
    #[serde(flatten)]
    additional_fields: AdditionalFields,
}

fn empty_tenant() -> TenantId {
    TenantId::from_static("")
}

/// A cached account
///
/// Accounts are the join target when resolving a token to a human-readable
/// identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AccountRecord", into = "AccountRecord")]
pub struct Account {
    home_account_id: HomeAccountId,
    environment: Environment,
    tenant_id: TenantId,
    local_account_id: String,
    username: String,
    authority_type: AuthorityType,
    name: Option<String>,
    given_name: Option<String>,
    middle_name: Option<String>,
    family_name: Option<String>,
    client_info: Option<String>,
    wam_account_ids: BTreeMap<String, String>,
    additional_fields: AdditionalFields,
    key: CacheKey,
}

impl Account {
    /// Constructs a new account, deriving its cache key
    pub fn new(
        home_account_id: HomeAccountId,
        environment: Environment,
        tenant_id: TenantId,
        username: impl Into<String>,
        authority_type: AuthorityType,
    ) -> Result<Self, InvalidEntity> {
        Self::try_from(AccountRecord {
            home_account_id,
            environment,
            realm: tenant_id,
            local_account_id: String::new(),
            username: username.into(),
            authority_type,
            name: None,
            given_name: None,
            middle_name: None,
            family_name: None,
            client_info: None,
            wam_account_ids: BTreeMap::new(),
            additional_fields: AdditionalFields::new(),
        })
    }

    /// Sets the account's object id within its tenant
    #[must_use]
    pub fn with_local_account_id(mut self, local_account_id: impl Into<String>) -> Self {
        self.local_account_id = local_account_id.into();
        self
    }

    /// Sets the display name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the given name
    #[must_use]
    pub fn with_given_name(mut self, given_name: impl Into<String>) -> Self {
        self.given_name = Some(given_name.into());
        self
    }

    /// Sets the middle name
    #[must_use]
    pub fn with_middle_name(mut self, middle_name: impl Into<String>) -> Self {
        self.middle_name = Some(middle_name.into());
        self
    }

    /// Sets the family name
    #[must_use]
    pub fn with_family_name(mut self, family_name: impl Into<String>) -> Self {
        self.family_name = Some(family_name.into());
        self
    }

    /// Sets the raw client info the account was derived from
    #[must_use]
    pub fn with_client_info(mut self, client_info: impl Into<String>) -> Self {
        self.client_info = Some(client_info.into());
        self
    }

    /// Records a platform broker's identifier for this account
    #[must_use]
    pub fn with_wam_account_id(
        mut self,
        client_id: impl Into<String>,
        wam_account_id: impl Into<String>,
    ) -> Self {
        self.wam_account_ids
            .insert(client_id.into(), wam_account_id.into());
        self
    }

    /// Carries over broker identifiers from a previous version of this
    /// account that this one does not already define
    pub fn merge_wam_account_ids(&mut self, previous: &Account) {
        for (client, id) in &previous.wam_account_ids {
            self.wam_account_ids
                .entry(client.clone())
                .or_insert_with(|| id.clone());
        }
    }

    /// The key this account is stored under
    #[inline]
    pub fn cache_key(&self) -> &CacheKeyRef {
        &self.key
    }

    /// The keychain tuple for this account
    pub fn keychain_key(&self) -> Result<KeychainKey, MissingKeyComponent> {
        keys::account_keychain_key(
            self.home_account_id.as_str(),
            self.environment.as_str(),
            self.tenant_id.as_str(),
            &self.username,
            self.authority_type,
        )
    }

    /// The user's stable identifier
    #[inline]
    pub fn home_account_id(&self) -> &HomeAccountIdRef {
        &self.home_account_id
    }

    /// The provider host
    #[inline]
    pub fn environment(&self) -> &EnvironmentRef {
        &self.environment
    }

    /// The tenant this account record describes
    #[inline]
    pub fn tenant_id(&self) -> &TenantIdRef {
        &self.tenant_id
    }

    /// The user's object id within the tenant
    #[inline]
    pub fn local_account_id(&self) -> &str {
        &self.local_account_id
    }

    /// The username, usually the preferred username claim
    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The kind of authority that issued the account
    #[inline]
    pub fn authority_type(&self) -> AuthorityType {
        self.authority_type
    }

    /// The display name
    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The given name
    #[inline]
    pub fn given_name(&self) -> Option<&str> {
        self.given_name.as_deref()
    }

    /// The middle name
    #[inline]
    pub fn middle_name(&self) -> Option<&str> {
        self.middle_name.as_deref()
    }

    /// The family name
    #[inline]
    pub fn family_name(&self) -> Option<&str> {
        self.family_name.as_deref()
    }

    /// The raw client info
    #[inline]
    pub fn client_info(&self) -> Option<&str> {
        self.client_info.as_deref()
    }

    /// Broker identifiers by client id
    #[inline]
    pub fn wam_account_ids(&self) -> &BTreeMap<String, String> {
        &self.wam_account_ids
    }

    /// Fields not understood by this version
    #[inline]
    pub fn additional_fields(&self) -> &AdditionalFields {
        &self.additional_fields
    }
}

impl TryFrom<AccountRecord> for Account {
    type Error = InvalidEntity;

    fn try_from(record: AccountRecord) -> Result<Self, Self::Error> {
        let key = keys::account_key(
            record.home_account_id.as_str(),
            record.environment.as_str(),
            record.realm.as_str(),
        )?;

        Ok(Self {
            home_account_id: record.home_account_id,
            environment: record.environment,
            tenant_id: record.realm,
            local_account_id: record.local_account_id,
            username: record.username,
            authority_type: record.authority_type,
            name: record.name,
            given_name: record.given_name,
            middle_name: record.middle_name,
            family_name: record.family_name,
            client_info: record.client_info,
            wam_account_ids: record.wam_account_ids,
            additional_fields: record.additional_fields,
            key,
        })
    }
}

impl From<Account> for AccountRecord {
    fn from(account: Account) -> Self {
        Self {
            home_account_id: account.home_account_id,
            environment: account.environment,
            realm: account.tenant_id,
            local_account_id: account.local_account_id,
            username: account.username,
            authority_type: account.authority_type,
            name: account.name,
            given_name: account.given_name,
            middle_name: account.middle_name,
            family_name: account.family_name,
            client_info: account.client_info,
            wam_account_ids: account.wam_account_ids,
            additional_fields: account.additional_fields,
        }
    }
}

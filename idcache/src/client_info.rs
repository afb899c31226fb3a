//! Provider-issued client info
//!
//! Client info is a base64url-encoded JSON object carrying the user's object
//! id (`uid`) and home tenant id (`utid`). Together they form the home account
//! id, `uid.utid`.

use aliri_base64::{Base64Url, InvalidBase64Data};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::braids::HomeAccountId;

/// Client info could not be decoded
#[derive(Debug, Error)]
pub enum InvalidClientInfo {
    /// The value was not base64url
    #[error("client info is not base64url encoded")]
    Encoding(#[from] InvalidBase64Data),
    /// The decoded value was not the expected JSON object
    #[error("client info is not a JSON object")]
    Json(#[from] serde_json::Error),
}

/// Decoded client info
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// The user's object id in their home tenant
    #[serde(default)]
    pub uid: String,
    /// The user's home tenant id
    #[serde(default)]
    pub utid: String,
}

impl ClientInfo {
    /// Constructs client info from its parts
    pub fn new(uid: impl Into<String>, utid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            utid: utid.into(),
        }
    }

    /// Decodes raw client info as received from the provider
    pub fn parse(raw: &str) -> Result<Self, InvalidClientInfo> {
        let decoded = Base64Url::from_encoded(raw.trim().trim_end_matches('='))?;
        Ok(serde_json::from_slice(&decoded.into_inner())?)
    }

    /// The home account id, or `None` if either part is missing
    pub fn home_account_id(&self) -> Option<HomeAccountId> {
        if self.uid.is_empty() || self.utid.is_empty() {
            None
        } else {
            Some(HomeAccountId::new(format!("{}.{}", self.uid, self.utid)))
        }
    }

    /// Encodes the client info the way the provider would
    pub fn encode(&self) -> String {
        let json = serde_json::json!({ "uid": self.uid, "utid": self.utid });
        Base64Url::from_raw(json.to_string().into_bytes()).to_string()
    }
}

/// Derives a home account id directly from raw client info
///
/// Returns `None` for missing or undecodable client info; the failure is
/// logged.
pub fn home_account_id_from_raw(raw: &str) -> Option<HomeAccountId> {
    if raw.trim().is_empty() {
        return None;
    }

    match ClientInfo::parse(raw) {
        Ok(info) => info.home_account_id(),
        Err(error) => {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "unable to decode client info"
            );
            None
        }
    }
}

//! The current cache document format
//!
//! The document is a single JSON object with one bucket per entity kind.
//! Each bucket maps an entity's derived key to the entity. Top-level nodes
//! that are not known buckets are preserved and written back unchanged.
//!
//! ```json
//! {
//!   "access_tokens": { "<key>": { ... } },
//!   "refresh_tokens": { ... },
//!   "id_tokens": { ... },
//!   "accounts": { ... },
//!   "app_metadata": { ... }
//! }
//! ```

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    accessor::{CacheEntity, TokenCacheAccessor},
    entities::{
        AccessToken, Account, AdditionalFields, AppMetadata, EntityKind, EntityKinds, IdToken,
        RefreshToken,
    },
};

/// The access token bucket
pub const ACCESS_TOKENS: &str = "access_tokens";
/// The refresh token bucket
pub const REFRESH_TOKENS: &str = "refresh_tokens";
/// The ID token bucket
pub const ID_TOKENS: &str = "id_tokens";
/// The account bucket
pub const ACCOUNTS: &str = "accounts";
/// The application metadata bucket
pub const APP_METADATA: &str = "app_metadata";

const KNOWN_BUCKETS: [&str; 5] = [ACCESS_TOKENS, REFRESH_TOKENS, ID_TOKENS, ACCOUNTS, APP_METADATA];

/// A current-format cache document could not be read or written
#[derive(Debug, Error)]
pub enum CacheFormatError {
    /// The document is not valid JSON
    #[error("cache document is not valid JSON")]
    Parse(#[source] serde_json::Error),
    /// The document is valid JSON, but not an object
    #[error("cache document must be a JSON object")]
    NotAnObject,
    /// A known bucket is not an object
    #[error("bucket `{bucket}` must be a JSON object")]
    InvalidBucket {
        /// The bucket name
        bucket: &'static str,
    },
    /// An entry could not be read as its entity kind
    #[error("invalid entry `{key}` in bucket `{bucket}`")]
    InvalidEntry {
        /// The bucket name
        bucket: &'static str,
        /// The entry's key in the document
        key: String,
        /// The underlying error
        #[source]
        source: serde_json::Error,
    },
    /// An entity could not be written
    #[error("unable to write cache document")]
    Write(#[source] serde_json::Error),
}

fn bucket_to_value<T: CacheEntity + Serialize>(entities: Vec<T>) -> Result<Value, CacheFormatError> {
    let mut bucket = Map::with_capacity(entities.len());
    for entity in entities {
        let key = entity.cache_key().as_str().to_owned();
        let value = serde_json::to_value(entity).map_err(CacheFormatError::Write)?;
        bucket.insert(key, value);
    }
    Ok(Value::Object(bucket))
}

/// Serializes the accessor's full content
pub fn serialize(accessor: &dyn TokenCacheAccessor) -> Result<Vec<u8>, CacheFormatError> {
    let mut doc = Map::new();
    doc.insert(ACCESS_TOKENS.to_owned(), bucket_to_value(accessor.access_tokens())?);
    doc.insert(REFRESH_TOKENS.to_owned(), bucket_to_value(accessor.refresh_tokens())?);
    doc.insert(ID_TOKENS.to_owned(), bucket_to_value(accessor.id_tokens())?);
    doc.insert(ACCOUNTS.to_owned(), bucket_to_value(accessor.accounts())?);
    doc.insert(APP_METADATA.to_owned(), bucket_to_value(accessor.all_app_metadata())?);

    for (name, node) in accessor.unknown_nodes().iter() {
        if !KNOWN_BUCKETS.contains(&name.as_str()) {
            doc.insert(name.clone(), node.clone());
        }
    }

    serde_json::to_vec(&Value::Object(doc)).map_err(CacheFormatError::Write)
}

fn read_bucket<T: DeserializeOwned>(
    doc: &mut Map<String, Value>,
    bucket: &'static str,
) -> Result<Option<Vec<T>>, CacheFormatError> {
    let entries = match doc.remove(bucket) {
        None => return Ok(None),
        Some(Value::Object(entries)) => entries,
        Some(_) => return Err(CacheFormatError::InvalidBucket { bucket }),
    };

    let mut entities = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let entity = serde_json::from_value(value)
            .map_err(|source| CacheFormatError::InvalidEntry { bucket, key, source })?;
        entities.push(entity);
    }

    Ok(Some(entities))
}

fn replace_bucket<T>(
    accessor: &dyn TokenCacheAccessor,
    entities: Option<Vec<T>>,
    save: fn(&dyn TokenCacheAccessor, T),
    kind: EntityKind,
    replaced: &mut EntityKinds,
) {
    if let Some(entities) = entities {
        accessor.clear_kind(kind);
        for entity in entities {
            save(accessor, entity);
        }
        replaced.insert(kind);
    }
}

/// Loads a document into the accessor
///
/// Each bucket present in the document replaces the accessor's content for
/// that entity kind; buckets absent from the document are left untouched.
/// The whole document is validated before anything is replaced. Empty input
/// is treated as an empty cache and changes nothing.
///
/// Returns the entity kinds that were replaced.
pub fn deserialize(
    accessor: &dyn TokenCacheAccessor,
    data: &[u8],
) -> Result<EntityKinds, CacheFormatError> {
    if data.iter().all(u8::is_ascii_whitespace) {
        tracing::debug!("cache document is empty");
        return Ok(EntityKinds::NONE);
    }

    let mut doc = match serde_json::from_slice::<Value>(data).map_err(CacheFormatError::Parse)? {
        Value::Object(doc) => doc,
        _ => return Err(CacheFormatError::NotAnObject),
    };

    let access_tokens = read_bucket::<AccessToken>(&mut doc, ACCESS_TOKENS)?;
    let refresh_tokens = read_bucket::<RefreshToken>(&mut doc, REFRESH_TOKENS)?;
    let id_tokens = read_bucket::<IdToken>(&mut doc, ID_TOKENS)?;
    let accounts = read_bucket::<Account>(&mut doc, ACCOUNTS)?;
    let app_metadata = read_bucket::<AppMetadata>(&mut doc, APP_METADATA)?;

    let mut replaced = EntityKinds::NONE;
    replace_bucket(
        accessor,
        access_tokens,
        |a, e| a.save_access_token(e),
        EntityKind::AccessToken,
        &mut replaced,
    );
    replace_bucket(
        accessor,
        refresh_tokens,
        |a, e| a.save_refresh_token(e),
        EntityKind::RefreshToken,
        &mut replaced,
    );
    replace_bucket(
        accessor,
        id_tokens,
        |a, e| a.save_id_token(e),
        EntityKind::IdToken,
        &mut replaced,
    );
    replace_bucket(
        accessor,
        accounts,
        |a, e| a.save_account(e),
        EntityKind::Account,
        &mut replaced,
    );
    replace_bucket(
        accessor,
        app_metadata,
        |a, e| a.save_app_metadata(e),
        EntityKind::AppMetadata,
        &mut replaced,
    );

    let unknown: AdditionalFields = doc;
    if !unknown.is_empty() {
        tracing::debug!(
            nodes = unknown.len(),
            "preserving unrecognized top-level cache nodes"
        );
    }
    accessor.set_unknown_nodes(unknown);

    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::accessor::{fixtures::*, InMemoryAccessor};

    fn populated() -> InMemoryAccessor {
        let accessor = InMemoryAccessor::new();
        accessor.save_access_token(access_token("User.Read", 1000, 4599));
        accessor.save_refresh_token(refresh_token(CLIENT, None));
        accessor.save_id_token(id_token());
        accessor.save_account(account());
        accessor.save_app_metadata(app_metadata(CLIENT, Some("1")));
        accessor
    }

    #[test]
    fn round_trips_every_bucket() -> color_eyre::Result<()> {
        let source = populated();
        let data = serialize(&source)?;

        let target = InMemoryAccessor::new();
        let replaced = deserialize(&target, &data)?;

        assert_eq!(replaced, EntityKinds::ALL);
        assert_eq!(target.access_tokens(), source.access_tokens());
        assert_eq!(target.refresh_tokens(), source.refresh_tokens());
        assert_eq!(target.id_tokens(), source.id_tokens());
        assert_eq!(target.accounts(), source.accounts());
        assert_eq!(target.all_app_metadata(), source.all_app_metadata());

        assert_eq!(serialize(&target)?, data);
        Ok(())
    }

    #[test]
    fn preserves_unknown_top_level_nodes() -> color_eyre::Result<()> {
        let doc = json!({
            "access_tokens": {},
            "x_future_bucket": { "k": { "v": 1 } },
            "x_flag": true,
        });

        let accessor = InMemoryAccessor::new();
        deserialize(&accessor, doc.to_string().as_bytes())?;

        let written: Value = serde_json::from_slice(&serialize(&accessor)?)?;
        assert_eq!(written["x_future_bucket"], json!({ "k": { "v": 1 } }));
        assert_eq!(written["x_flag"], json!(true));
        assert_eq!(written["refresh_tokens"], json!({}));
        Ok(())
    }

    #[test]
    fn unknown_members_are_written_verbatim() -> color_eyre::Result<()> {
        let input = br#"{"access_tokens":{"any-key":{"home_account_id":"uid.utid","environment":"login.example.com","credential_type":"AccessToken","client_id":"client-1","secret":"secret","realm":"contoso","target":"User.Read","cached_at":"1000","expires_on":"4599","x_price":1.50,"x_big":1e2,"x_list":[0.10,-0.0]}},"x_top":{"v":2.0E1},"x_after":[1.000]}"#;

        let accessor = InMemoryAccessor::new();
        deserialize(&accessor, input)?;
        let out = String::from_utf8(serialize(&accessor)?)?;

        assert!(out.contains(r#""x_price":1.50,"x_big":1e2,"x_list":[0.10,-0.0]"#), "{}", out);
        assert!(out.contains(r#""x_top":{"v":2.0E1},"x_after":[1.000]"#), "{}", out);
        Ok(())
    }

    #[test]
    fn omitted_buckets_are_left_alone() -> color_eyre::Result<()> {
        let accessor = populated();
        let doc = json!({ "access_tokens": {} });

        let replaced = deserialize(&accessor, doc.to_string().as_bytes())?;

        assert_eq!(replaced, EntityKind::AccessToken.into());
        assert!(accessor.access_tokens().is_empty());
        assert_eq!(accessor.refresh_tokens().len(), 1);
        assert_eq!(accessor.accounts().len(), 1);
        assert_eq!(accessor.all_app_metadata().len(), 1);
        Ok(())
    }

    #[test]
    fn malformed_documents_are_errors() {
        let accessor = populated();

        assert!(matches!(
            deserialize(&accessor, b"{ not json"),
            Err(CacheFormatError::Parse(_))
        ));
        assert!(matches!(
            deserialize(&accessor, b"[1, 2]"),
            Err(CacheFormatError::NotAnObject)
        ));
        assert!(matches!(
            deserialize(&accessor, br#"{"accounts": []}"#),
            Err(CacheFormatError::InvalidBucket { bucket: ACCOUNTS })
        ));

        let bad_entry = json!({
            "access_tokens": {},
            "refresh_tokens": { "k": { "environment": "login.example.com" } },
        });
        match deserialize(&accessor, bad_entry.to_string().as_bytes()) {
            Err(CacheFormatError::InvalidEntry { bucket, key, .. }) => {
                assert_eq!(bucket, REFRESH_TOKENS);
                assert_eq!(key, "k");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Nothing was replaced by the failed loads
        assert_eq!(accessor.access_tokens().len(), 1);
    }

    #[test]
    fn empty_input_changes_nothing() -> color_eyre::Result<()> {
        let accessor = populated();
        assert_eq!(deserialize(&accessor, b"")?, EntityKinds::NONE);
        assert_eq!(deserialize(&accessor, b" \n")?, EntityKinds::NONE);
        assert_eq!(accessor.access_tokens().len(), 1);
        Ok(())
    }

    #[test]
    fn writes_no_nulls() -> color_eyre::Result<()> {
        let data = serialize(&populated())?;
        let text = String::from_utf8(data)?;
        assert!(!text.contains("null"));
        Ok(())
    }
}

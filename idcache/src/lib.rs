//! A client-side token cache for OAuth2 and OpenID Connect
//!
//! This library holds the access tokens, refresh tokens, ID tokens, accounts and
//! application metadata that a public or confidential client accumulates while
//! acquiring tokens, and answers the question the acquisition flow asks before
//! every network round trip: _is there already something usable?_
//!
//! The cache itself performs no I/O. Hosts decide where state lives by
//! implementing [`TokenCacheNotification`][notification::TokenCacheNotification];
//! every operation fires before-access, before-write (mutations only) and
//! after-access callbacks, which is where a host reloads, locks and persists
//! the serialized document. [`PersistentCacheNotification`][persistence::PersistentCacheNotification]
//! does this for any [`AsyncCachePersistence`][persistence::AsyncCachePersistence].
//!
//! Two persisted forms are understood:
//!
//! * the current JSON document, with one bucket per entity kind keyed by a
//!   derived [`CacheKey`][keys::CacheKey], preserving fields and top-level
//!   nodes it does not understand; and
//! * the legacy binary blob, which is kept in sync on a best-effort basis so
//!   that older applications sharing the same store continue to find refresh
//!   tokens.
//!
//! # Lookups
//!
//! Access tokens are matched by scope containment: a cached token granting
//! `User.Read User.Read.All` satisfies a request for `User.Read`. When more
//! than one cached token could answer a request, the lookup fails with
//! [`MultipleTokensMatched`][error::MultipleTokensMatched] rather than guess.
//! Tokens inside the expiration buffer are a miss, forcing a refresh, but are
//! left in place.
//!
//! Refresh tokens are resolved for the exact tenant first, then across
//! tenants, and finally through the client's application family when its
//! metadata says it belongs to one.
//!
//! ```
//! use idcache::{
//!     lookup::AccessTokenQuery,
//!     response::{SaveTokenRequest, TokenResponse},
//!     scope::ScopeSet,
//!     AccessTokenSecret, ClientId, ClientIdRef, EnvironmentRef, TenantIdRef, TokenCache,
//! };
//! use idcache_clock::DurationSecs;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), idcache::TokenCacheError> {
//! let cache = TokenCache::new(ClientId::from_static("my-client"));
//!
//! let response = TokenResponse {
//!     access_token: Some(AccessTokenSecret::from_static("an-access-token")),
//!     expires_in: Some(DurationSecs(3600)),
//!     scope: Some(ScopeSet::parse("api://my-api/.default")),
//!     ..TokenResponse::default()
//! };
//!
//! cache
//!     .save_token_response(SaveTokenRequest::new("https://login.example.com/contoso/"), response)
//!     .await?;
//!
//! let scopes = ScopeSet::parse("api://my-api/.default");
//! let query = AccessTokenQuery {
//!     environment: EnvironmentRef::from_static("login.example.com"),
//!     client_id: ClientIdRef::from_static("my-client"),
//!     tenant_id: Some(TenantIdRef::from_static("contoso")),
//!     home_account_id: None,
//!     scopes: &scopes,
//!     key_id: None,
//!     token_type: None,
//!     obo_cache_key: None,
//! };
//!
//! let found = cache.find_access_token(&query).await?;
//! assert_eq!(
//!     found.map(|m| m.token.secret().as_str().to_owned()),
//!     Some("an-access-token".to_owned())
//! );
//! # Ok(())
//! # }
//! ```
//!
//! This crate includes an example that persists the cache to a local file.
//! Refer to that example for more details on wiring up persistence.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `file`: Provides [`FileCachePersistence`][persistence::FileCachePersistence], which
//!   persists the current cache document to the local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod accessor;
pub mod aliases;
mod braids;
mod cache;
pub mod client_info;
pub mod config;
pub mod entities;
pub mod error;
pub mod interop;
pub mod keys;
pub mod legacy;
pub mod lookup;
pub mod notification;
pub mod persistence;
pub mod response;
pub mod scope;
pub mod serialization;

pub use braids::*;
pub use cache::{SavedTokens, TokenCache};
pub use config::TokenCacheConfig;
pub use error::TokenCacheError;

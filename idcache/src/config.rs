//! Token cache configuration

use idcache_clock::DurationSecs;

/// Default margin before expiry inside which an access token is not handed out
pub const DEFAULT_EXPIRATION_BUFFER: DurationSecs = DurationSecs(300);

/// Longest access token lifetime accepted as genuine
pub const DEFAULT_MAX_ACCESS_TOKEN_LIFETIME: DurationSecs = DurationSecs::from_days(3650);

/// Tunables for a [`TokenCache`][crate::TokenCache]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenCacheConfig {
    expiration_buffer: DurationSecs,
    legacy_compatibility: bool,
    family_refresh_tokens: bool,
    extended_lifetime: bool,
    max_access_token_lifetime: DurationSecs,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            expiration_buffer: DEFAULT_EXPIRATION_BUFFER,
            legacy_compatibility: true,
            family_refresh_tokens: true,
            extended_lifetime: false,
            max_access_token_lifetime: DEFAULT_MAX_ACCESS_TOKEN_LIFETIME,
        }
    }
}

impl TokenCacheConfig {
    /// The default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the margin before expiry inside which access tokens are treated
    /// as unusable
    #[must_use]
    pub fn with_expiration_buffer(mut self, buffer: DurationSecs) -> Self {
        self.expiration_buffer = buffer;
        self
    }

    /// Enables or disables reading and writing the legacy cache
    #[must_use]
    pub fn with_legacy_compatibility(mut self, enabled: bool) -> Self {
        self.legacy_compatibility = enabled;
        self
    }

    /// Enables or disables falling back to family refresh tokens
    #[must_use]
    pub fn with_family_refresh_tokens(mut self, enabled: bool) -> Self {
        self.family_refresh_tokens = enabled;
        self
    }

    /// Allows access tokens past expiry, but inside their extended lifetime,
    /// to be returned
    #[must_use]
    pub fn with_extended_lifetime(mut self, enabled: bool) -> Self {
        self.extended_lifetime = enabled;
        self
    }

    /// Sets the longest lifetime an access token may claim before it is
    /// treated as corrupt
    #[must_use]
    pub fn with_max_access_token_lifetime(mut self, lifetime: DurationSecs) -> Self {
        self.max_access_token_lifetime = lifetime;
        self
    }

    /// The expiration buffer
    #[inline]
    pub fn expiration_buffer(&self) -> DurationSecs {
        self.expiration_buffer
    }

    /// Whether the legacy cache is kept in sync
    #[inline]
    pub fn legacy_compatibility(&self) -> bool {
        self.legacy_compatibility
    }

    /// Whether family refresh tokens are considered
    #[inline]
    pub fn family_refresh_tokens(&self) -> bool {
        self.family_refresh_tokens
    }

    /// Whether extended lifetimes are honored
    #[inline]
    pub fn extended_lifetime(&self) -> bool {
        self.extended_lifetime
    }

    /// The longest accepted access token lifetime
    #[inline]
    pub fn max_access_token_lifetime(&self) -> DurationSecs {
        self.max_access_token_lifetime
    }
}

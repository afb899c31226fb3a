use aliri_braid::braid;
use std::fmt;

macro_rules! limited_reveal {
    ($ty:ty: $hidden:literal, $default:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str("\"")?;
                    limited_reveal(&self.0, &mut *f, $default)?;
                    f.write_str("\"")
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    limited_reveal(&self.0, &mut *f, usize::MAX)
                } else {
                    f.write_str(concat!("***", $hidden, "***"))
                }
            }
        }
    };
}

fn limited_reveal(unprotected: &str, f: &mut fmt::Formatter, default_len: usize) -> fmt::Result {
    let max_len = f.width().unwrap_or(default_len);
    if max_len <= 1 {
        f.write_str("…")
    } else if max_len > unprotected.len() {
        f.write_str(unprotected)
    } else {
        match unprotected.char_indices().nth(max_len - 2) {
            Some((idx, c)) if idx + c.len_utf8() < unprotected.len() => {
                f.write_str(&unprotected[0..idx + c.len_utf8()])?;
                f.write_str("…")
            }
            _ => f.write_str(unprotected),
        }
    }
}

/// The identifier of a client application registered with the provider
#[braid(serde)]
pub struct ClientId;

/// The host of an identity provider, such as `login.example.com`
#[braid(serde)]
pub struct Environment;

impl EnvironmentRef {
    /// Compares two environments, ignoring ASCII case
    #[inline]
    pub fn eq_ignore_case(&self, other: &EnvironmentRef) -> bool {
        self.as_str().eq_ignore_ascii_case(other.as_str())
    }
}

/// A tenant (or "realm") within an identity provider
#[braid(serde)]
pub struct TenantId;

/// A stable per-user identifier, usually `uid.utid` from client info
#[braid(serde)]
pub struct HomeAccountId;

/// The identifier of an application family sharing refresh tokens
#[braid(serde)]
pub struct FamilyId;

/// Identifies the key a proof-of-possession token is bound to
#[braid(serde)]
pub struct KeyId;

/// Partitions on-behalf-of tokens by the assertion they were exchanged for
#[braid(serde)]
pub struct OboCacheKey;

/// A cached access token secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessTokenSecret;

limited_reveal!(AccessTokenSecretRef: "ACCESS TOKEN", 15);

/// A cached refresh token secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshTokenSecret;

limited_reveal!(RefreshTokenSecretRef: "REFRESH TOKEN", 5);

/// A raw, encoded OpenID Connect ID token
#[braid(serde, debug = "owned", display = "owned")]
pub struct IdTokenSecret;

limited_reveal!(IdTokenSecretRef: "ID TOKEN", 15);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_hidden_unless_asked() {
        let secret = RefreshTokenSecret::from_static("0123456789abcdef");

        assert_eq!(format!("{:?}", secret), "***REFRESH TOKEN***");
        assert_eq!(format!("{}", secret), "***REFRESH TOKEN***");
        assert_eq!(format!("{:#?}", secret), "\"0123…\"");
        assert_eq!(format!("{:#}", secret), "0123456789abcdef");
    }

    #[test]
    fn environments_compare_without_case() {
        let a = Environment::from_static("Login.Example.COM");
        let b = Environment::from_static("login.example.com");
        assert!(a.eq_ignore_case(&b));
        assert_ne!(a, b);
    }
}

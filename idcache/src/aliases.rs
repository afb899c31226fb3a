//! Environment alias resolution
//!
//! A provider may be reachable under several host names that share one
//! token cache. Deciding which hosts are equivalent is the job of an
//! [`AuthorityAliases`] implementation supplied by the host application.

use std::fmt;

use url::Url;

use crate::braids::{Environment, EnvironmentRef};

/// Answers whether two environment host names are equivalent
pub trait AuthorityAliases: fmt::Debug + Send + Sync {
    /// Whether `a` and `b` name the same provider
    fn is_alias(&self, a: &EnvironmentRef, b: &EnvironmentRef) -> bool;
}

/// Treats environments as equivalent only when they match, ignoring case
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactEnvironment;

impl AuthorityAliases for ExactEnvironment {
    #[inline]
    fn is_alias(&self, a: &EnvironmentRef, b: &EnvironmentRef) -> bool {
        a.eq_ignore_case(b)
    }
}

/// A fixed set of alias groups
///
/// Hosts in the same group are equivalent. Hosts that are not in any group
/// are equivalent only to themselves.
#[derive(Clone, Debug, Default)]
pub struct StaticAliasGroups {
    groups: Vec<Vec<Environment>>,
}

impl StaticAliasGroups {
    /// Constructs an empty set of groups
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group of equivalent hosts
    #[must_use]
    pub fn with_group<I, E>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Environment>,
    {
        self.groups.push(hosts.into_iter().map(Into::into).collect());
        self
    }

    fn group_of(&self, env: &EnvironmentRef) -> Option<&[Environment]> {
        self.groups
            .iter()
            .find(|g| g.iter().any(|e| e.eq_ignore_case(env)))
            .map(Vec::as_slice)
    }
}

impl AuthorityAliases for StaticAliasGroups {
    fn is_alias(&self, a: &EnvironmentRef, b: &EnvironmentRef) -> bool {
        if a.eq_ignore_case(b) {
            return true;
        }

        self.group_of(a)
            .map_or(false, |g| g.iter().any(|e| e.eq_ignore_case(b)))
    }
}

/// Extracts the host from an authority URL such as
/// `https://login.example.com/contoso/`
///
/// Bare host names are returned as-is.
pub fn environment_of(authority: &str) -> Option<Environment> {
    let authority = authority.trim();
    if authority.is_empty() {
        return None;
    }

    match Url::parse(authority) {
        Ok(url) => url.host_str().map(|h| Environment::new(h.to_ascii_lowercase())),
        Err(_) if !authority.contains('/') => Some(Environment::new(authority.to_ascii_lowercase())),
        Err(error) => {
            tracing::debug!(
                authority,
                error = (&error as &dyn std::error::Error),
                "authority is not a valid URL"
            );
            None
        }
    }
}

/// Extracts the tenant, the first path segment, from an authority URL
pub fn tenant_of(authority: &str) -> Option<String> {
    let url = Url::parse(authority.trim()).ok()?;
    url.path_segments()?
        .find(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_ignores_case_only() {
        let a = Environment::from_static("Login.Example.com");
        let b = Environment::from_static("login.example.com");
        let c = Environment::from_static("login.example.net");

        assert!(ExactEnvironment.is_alias(&a, &b));
        assert!(!ExactEnvironment.is_alias(&a, &c));
    }

    #[test]
    fn static_groups_are_symmetric() {
        let aliases = StaticAliasGroups::new()
            .with_group(vec!["login.example.com", "login.example.net"])
            .with_group(vec!["sts.other.org"]);

        let com = Environment::from_static("login.example.com");
        let net = Environment::from_static("LOGIN.example.net");
        let org = Environment::from_static("sts.other.org");
        let unknown = Environment::from_static("unknown.host");

        assert!(aliases.is_alias(&com, &net));
        assert!(aliases.is_alias(&net, &com));
        assert!(!aliases.is_alias(&com, &org));
        assert!(aliases.is_alias(&unknown, &unknown));
        assert!(!aliases.is_alias(&unknown, &com));
    }

    #[test]
    fn authority_parts() {
        assert_eq!(
            environment_of("https://Login.Example.com/contoso/").map(Environment::take),
            Some("login.example.com".to_owned())
        );
        assert_eq!(
            environment_of("login.example.com").map(Environment::take),
            Some("login.example.com".to_owned())
        );
        assert_eq!(environment_of("  "), None);
        assert_eq!(
            tenant_of("https://login.example.com/contoso/"),
            Some("contoso".to_owned())
        );
        assert_eq!(tenant_of("https://login.example.com/"), None);
    }
}

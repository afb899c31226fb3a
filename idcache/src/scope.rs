//! Normalized scope sets

use std::{collections::btree_set, collections::BTreeSet, fmt, iter::FromIterator, str::FromStr};

use serde::{Deserialize, Serialize};

/// Scopes requested implicitly by every OpenID Connect flow
///
/// These are never part of an access token's audience and are ignored when
/// matching a request against cached tokens.
pub const RESERVED_SCOPES: &[&str] = &["openid", "profile", "offline_access"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum ScopeDto {
    String(String),
    Array(Vec<String>),
}

impl From<ScopeDto> for ScopeSet {
    fn from(dto: ScopeDto) -> Self {
        match dto {
            ScopeDto::String(s) => Self::parse(&s),
            ScopeDto::Array(arr) => arr.into_iter().collect(),
        }
    }
}

impl From<ScopeSet> for ScopeDto {
    fn from(s: ScopeSet) -> Self {
        ScopeDto::String(s.to_string())
    }
}

/// A normalized set of OAuth2 scopes
///
/// Scope tokens are lower-cased and de-duplicated on insertion, and iterate
/// in sorted order. Two sets built from the same tokens in any order or casing
/// are equal and display identically, which keeps derived cache keys stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "ScopeDto", into = "ScopeDto")]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// Produces an empty scope set
    #[inline]
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    /// Parses a whitespace-delimited scope string
    pub fn parse(s: &str) -> Self {
        s.split_whitespace().collect()
    }

    /// Adds a scope token to the set
    #[inline]
    pub fn insert(&mut self, scope_token: &str) {
        let token = scope_token.trim();
        if !token.is_empty() {
            self.0.insert(token.to_ascii_lowercase());
        }
    }

    /// Whether the set contains no scope tokens
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The number of scope tokens in the set
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the set contains `scope_token`, ignoring case
    pub fn contains(&self, scope_token: &str) -> bool {
        self.0.contains(&scope_token.to_ascii_lowercase())
    }

    /// Produces an iterator of the scope tokens in this set
    #[inline]
    pub fn iter(&self) -> Iter<'_> {
        self.into_iter()
    }

    /// Checks to see whether this set contains all of
    /// the scope tokens in `subset`.
    #[inline]
    pub fn contains_all(&self, subset: &ScopeSet) -> bool {
        self.0.is_superset(&subset.0)
    }

    /// As [`contains_all()`][Self::contains_all()], but reserved OpenID
    /// Connect scopes in `subset` are not required to be present
    pub fn contains_all_requested(&self, subset: &ScopeSet) -> bool {
        subset
            .0
            .iter()
            .filter(|s| !is_reserved(s))
            .all(|s| self.0.contains(s))
    }

    /// Checks whether the two sets share at least one scope token
    #[inline]
    pub fn intersects(&self, other: &ScopeSet) -> bool {
        self.0.intersection(&other.0).next().is_some()
    }

    /// A copy of this set with the reserved OpenID Connect scopes removed
    pub fn without_reserved(&self) -> Self {
        Self(self.0.iter().filter(|s| !is_reserved(s)).cloned().collect())
    }
}

fn is_reserved(s: &str) -> bool {
    RESERVED_SCOPES.iter().any(|r| r.eq_ignore_ascii_case(s))
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for s in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(s)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ScopeSet {
    type Err = std::convert::Infallible;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// An iterator over the scope tokens in a set, in sorted order
#[derive(Clone, Debug)]
pub struct Iter<'a> {
    iter: btree_set::Iter<'a, String>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a str;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(String::as_str)
    }
}

impl<'a> IntoIterator for &'a ScopeSet {
    type Item = &'a str;
    type IntoIter = Iter<'a>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        Iter {
            iter: self.0.iter(),
        }
    }
}

impl<S> Extend<S> for ScopeSet
where
    S: AsRef<str>,
{
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = S>,
    {
        for s in iter {
            self.insert(s.as_ref());
        }
    }
}

impl<S> FromIterator<S> for ScopeSet
where
    S: AsRef<str>,
{
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = S>,
    {
        let mut set = Self::empty();
        set.extend(iter);
        set
    }
}

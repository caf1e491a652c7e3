//! Dispatches a stored piece of content to either the local durable store or
//! the remote backend, depending on which kind of identifier the mapping
//! file holds for it.

use std::fmt;
use std::str::FromStr;

use crate::digest::Digest;

/// Either a `sha256:<hex>` digest naming a blob or manifest still on local
/// disk, or an opaque content identifier naming something pinned to the
/// remote backend. Serializes as the bare string form (not a tagged enum) so
/// existing mapping files stay readable without a schema bump.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContentRef {
    Local(Digest),
    Remote(String),
}

impl ContentRef {
    pub fn as_local(&self) -> Option<&Digest> {
        match self {
            Self::Local(d) => Some(d),
            Self::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&str> {
        match self {
            Self::Remote(id) => Some(id),
            Self::Local(_) => None,
        }
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(d) => write!(f, "{d}"),
            Self::Remote(id) => f.write_str(id),
        }
    }
}

impl FromStr for ContentRef {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<Digest>() {
            Ok(d) => Self::Local(d),
            Err(_) => Self::Remote(s.to_string()),
        })
    }
}

impl From<Digest> for ContentRef {
    fn from(d: Digest) -> Self {
        Self::Local(d)
    }
}

impl TryFrom<String> for ContentRef {
    type Error = std::convert::Infallible;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ContentRef> for String {
    fn from(r: ContentRef) -> String {
        r.to_string()
    }
}

impl serde::Serialize for ContentRef {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ContentRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(s.parse().expect("ContentRef parsing is infallible"))
    }
}

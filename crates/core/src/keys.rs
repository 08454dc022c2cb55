//! Symbolic node keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum allowed length for a [`NodeKey`].
const NODE_KEY_MAX_LEN: usize = 128;

/// Errors from constructing a [`NodeKey`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeKeyError {
    /// The input was empty or contained only whitespace.
    #[error("node key cannot be empty or whitespace")]
    Empty,
    /// The key contains characters outside `A-Z a-z 0-9 _ - .`.
    #[error("node key contains invalid characters: {0:?}")]
    InvalidCharacters(String),
    /// The key exceeds [`NODE_KEY_MAX_LEN`] characters.
    #[error("node key exceeds maximum length of {NODE_KEY_MAX_LEN} characters")]
    TooLong,
}

/// The stable, program-unique identifier of a process node.
///
/// Keys are case-sensitive and are never normalised: they end up in the
/// compiled program's symbol table and therefore in its content hash.
/// Surrounding whitespace is the only thing trimmed.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeKey(String);

impl NodeKey {
    /// Create a new `NodeKey`, validating the input.
    pub fn new(raw: &str) -> Result<Self, NodeKeyError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(NodeKeyError::Empty);
        }
        if !trimmed
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        {
            return Err(NodeKeyError::InvalidCharacters(trimmed.to_owned()));
        }
        if trimmed.len() > NODE_KEY_MAX_LEN {
            return Err(NodeKeyError::TooLong);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Return the inner string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeKey {
    type Err = NodeKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for NodeKey {
    type Error = NodeKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for NodeKey {
    type Error = NodeKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<NodeKey> for String {
    fn from(key: NodeKey) -> Self {
        key.0
    }
}

impl AsRef<str> for NodeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for NodeKey {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NodeKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

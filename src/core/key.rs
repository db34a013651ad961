use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::identity::CanonicalIdentity;

/// Joins the three components of a key. Normalized components never contain it.
pub const KEY_SEPARATOR: char = '_';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Malformed identity key {key:?}: expected NAME_SIZE_SURFACE")]
    Malformed { key: String },
}

/// `<name>_<size>_<surface>`, the grouping key for one logical product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits from the right into (name, size, surface).
    pub fn parts(&self) -> Result<(&str, &str, &str), KeyError> {
        let mut parts = self.0.rsplitn(3, KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(surface), Some(size), Some(name))
                if !surface.is_empty() && !size.is_empty() && !name.is_empty() =>
            {
                Ok((name, size, surface))
            }
            _ => Err(KeyError::Malformed {
                key: self.0.clone(),
            }),
        }
    }

    pub fn parse(key: &str) -> Result<Self, KeyError> {
        let key = Self(key.to_string());
        key.parts()?;
        Ok(key)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct KeyBuilder;

impl KeyBuilder {
    pub fn build(identity: &CanonicalIdentity) -> IdentityKey {
        debug_assert!(
            [&identity.name, &identity.size, &identity.surface]
                .iter()
                .all(|part| !part.contains(KEY_SEPARATOR)),
            "normalized component contains the key separator: {identity:?}"
        );
        IdentityKey(format!(
            "{}{sep}{}{sep}{}",
            identity.name,
            identity.size,
            identity.surface,
            sep = KEY_SEPARATOR
        ))
    }
}

//! Two-tier content storage.
//!
//! Downloaded payloads live in exactly one of two tiers:
//! - **ephemeral** (`<root>/cache`): streaming cache, evictable at any time
//! - **persistent** (`<root>/downloads`): user downloads, kept until deleted
//!
//! Transfers stream into `<root>/staging` and are committed into a tier with a
//! rename, so a partially written file is never visible at its final path.

mod error;
mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use error::ContentError;
pub use store::{ContentStore, ReconcileReport};

/// Result type for content store operations.
pub type Result<T> = std::result::Result<T, ContentError>;

/// Storage tier of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Purgeable streaming cache.
    Ephemeral,
    /// User-owned downloads.
    Persistent,
}

impl Tier {
    /// Both tiers, persistent first (lookup preference order).
    pub const ALL: [Tier; 2] = [Tier::Persistent, Tier::Ephemeral];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ephemeral => "ephemeral",
            Self::Persistent => "persistent",
        }
    }

    /// Directory under the storage root.
    #[must_use]
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Ephemeral => "cache",
            Self::Persistent => "downloads",
        }
    }

    #[must_use]
    pub fn other(&self) -> Tier {
        match self {
            Self::Ephemeral => Self::Persistent,
            Self::Persistent => Self::Ephemeral,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ephemeral" => Ok(Self::Ephemeral),
            "persistent" => Ok(Self::Persistent),
            _ => Err(format!("invalid tier: {s}")),
        }
    }
}

//! Opaque resume tokens.
//!
//! Outside this module a token is just bytes stored in the task row. Inside,
//! it is the JSON encoding of [`ResumeState`].

use serde::{Deserialize, Serialize};

/// Resume data captured when a transfer stops with usable partial bytes.
///
/// Absent means the next attempt must start from byte zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken(Vec<u8>);

impl ResumeToken {
    /// Wraps bytes read back from storage.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Bytes to persist.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn encode(state: &ResumeState) -> Option<Self> {
        serde_json::to_vec(state).ok().map(Self)
    }

    /// `None` when the bytes are not a token this build wrote.
    pub(crate) fn decode(&self) -> Option<ResumeState> {
        serde_json::from_slice(&self.0).ok()
    }
}

/// What a range request needs to continue a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ResumeState {
    /// URL the partial bytes came from.
    pub url: String,
    /// Bytes already staged.
    pub bytes: u64,
    /// `ETag` or `Last-Modified`, sent back as `If-Range`.
    pub validator: String,
    /// Full length when the server declared it.
    pub total: Option<u64>,
}

impl ResumeState {
    /// A token is only worth keeping with bytes on disk, a validator and range support.
    pub(crate) fn capture(
        url: &str,
        bytes: u64,
        validator: Option<&str>,
        accepts_ranges: bool,
        total: Option<u64>,
    ) -> Option<ResumeToken> {
        if bytes == 0 || !accepts_ranges {
            return None;
        }
        let validator = validator?.to_string();
        ResumeToken::encode(&Self {
            url: url.to_string(),
            bytes,
            validator,
            total,
        })
    }
}

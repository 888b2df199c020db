//! Data spaces and storage paths
//!
//! Every key lives in one of three spaces: `all` (public mutable),
//! `frozen` (public immutable) and `user` (private encrypted). Keys are
//! normalized (Unicode NFKC, then lower-cased) and prefixed by the space
//! tag to form the storage path the trie indexes:
//!
//! ```text
//! all/<key>
//! frozen/<key>
//! user/<author-public-key>/<key>
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

use crate::error::{WeaveError, WeaveResult};
use crate::identity::PublicKey;

/// Prefix under which handle claims live in the frozen space.
pub const HANDLES_PREFIX: &str = "frozen/handles/";

/// Prefix under which username claim sets live in the public space.
pub const USERNAME_CLAIMS_PREFIX: &str = "all/claims/username/";

/// Visibility/mutability class of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Space {
    /// Public, mutable, last-write-wins
    All,
    /// Public, immutable, first-write-wins
    Frozen,
    /// Private to the author, encrypted
    User,
}

impl Space {
    pub fn tag(&self) -> &'static str {
        match self {
            Space::All => "all",
            Space::Frozen => "frozen",
            Space::User => "user",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "all" => Some(Space::All),
            "frozen" => Some(Space::Frozen),
            "user" => Some(Space::User),
            _ => None,
        }
    }
}

impl Default for Space {
    fn default() -> Self {
        Space::All
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Normalize a user-supplied key: Unicode NFKC, then lower-cased.
pub fn normalize_key(key: &str) -> String {
    key.nfkc().collect::<String>().to_lowercase()
}

/// Build the storage path for a key in a space. The `user` space embeds
/// the author's public key between the tag and the key.
pub fn storage_path(space: Space, key: &str, author: Option<&PublicKey>) -> WeaveResult<String> {
    if key.is_empty() {
        return Err(WeaveError::InvalidArgument("Key must not be empty".to_string()));
    }
    let key = normalize_key(key);
    match space {
        Space::All => Ok(format!("all/{}", key)),
        Space::Frozen => Ok(format!("frozen/{}", key)),
        Space::User => {
            let author = author.ok_or(WeaveError::NotAuthenticated)?;
            Ok(format!("user/{}/{}", author.to_base64(), key))
        }
    }
}

/// Split a storage path into its space and the remainder after the tag.
pub fn parse_path(path: &str) -> Option<(Space, &str)> {
    let (tag, rest) = path.split_once('/')?;
    Some((Space::from_tag(tag)?, rest))
}

/// The `<pk>` segment of a `user/<pk>/...` path.
pub fn user_path_owner(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("user/")?;
    let (owner, _) = rest.split_once('/')?;
    Some(owner)
}

/// Whether a path holds a username claim set.
pub fn is_username_claims_path(path: &str) -> bool {
    path.starts_with(USERNAME_CLAIMS_PREFIX)
}

/// Whether a path holds a handle claim.
pub fn is_handle_claim_path(path: &str) -> bool {
    path.starts_with(HANDLES_PREFIX)
}

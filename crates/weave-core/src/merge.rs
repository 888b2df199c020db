//! Space-aware admission of remote envelopes
//!
//! `admit` is the single gate through which remote writes enter the
//! trie. It is a pure decision: given the envelope currently at the
//! path (if any) and the incoming one, it either rejects with a typed
//! error, keeps the existing envelope, or yields the envelope to store.
//! The sync engine absorbs rejections (warn and drop the one envelope);
//! they never abort a sync.

use crate::claims::{self, validate_handle_claim};
use crate::envelope::Envelope;
use crate::error::{WeaveError, WeaveResult};
use crate::space::{self, Space};

/// Replay barrier for frozen writes: stale claims are refused because
/// first-arrival is the only ordering the frozen space has.
pub const MAX_CLAIM_AGE_MS: u64 = 3_600_000;

/// Outcome of admitting an envelope against the current trie state.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Persist this envelope at the path (possibly a merged claim set).
    Store(Envelope),
    /// The existing envelope is retained untouched.
    Keep,
}

/// Decide whether `incoming` is admitted at its path.
///
/// `existing` is the envelope currently stored at that path. `now` is
/// the local millisecond clock, used only for the frozen replay barrier.
pub fn admit(
    existing: Option<&Envelope>,
    incoming: Envelope,
    now: u64,
    max_claim_age: u64,
) -> WeaveResult<Admission> {
    if !incoming.verify() {
        return Err(WeaveError::SignatureInvalid(format!(
            "Envelope at {} fails verification",
            incoming.payload.key
        )));
    }

    let path = incoming.payload.key.as_str();
    let (path_space, _) = space::parse_path(path).ok_or_else(|| {
        WeaveError::InvalidArgument(format!("Path has no space tag: {}", path))
    })?;
    if path_space != incoming.payload.space {
        return Err(WeaveError::Forged(format!(
            "Path {} disagrees with declared space {}",
            path, incoming.payload.space
        )));
    }

    match incoming.payload.space {
        Space::User => {
            let owner = space::user_path_owner(path).ok_or_else(|| {
                WeaveError::InvalidArgument(format!("Malformed user path: {}", path))
            })?;
            if owner != incoming.payload.author.to_base64() {
                return Err(WeaveError::Forged(format!(
                    "User-space write to {} by a different author",
                    path
                )));
            }
            if !incoming.payload.is_encrypted {
                return Err(WeaveError::Forged(format!(
                    "User-space envelope at {} is not encrypted",
                    path
                )));
            }
        }
        Space::Frozen => {
            if existing.is_some() {
                return Err(WeaveError::Immutable(path.to_string()));
            }
            if now.saturating_sub(incoming.payload.timestamp) > max_claim_age {
                return Err(WeaveError::Replay(format!(
                    "Frozen write to {} is {} ms old",
                    path,
                    now.saturating_sub(incoming.payload.timestamp)
                )));
            }
            if space::is_handle_claim_path(path) {
                validate_handle_claim(&incoming)?;
            }
        }
        Space::All => {}
    }

    if let Some(existing) = existing {
        if space::is_username_claims_path(path) {
            return Ok(Admission::Store(merge_claim_envelopes(existing, &incoming)));
        }
        // Last-write-wins; equal timestamps retain the existing write.
        if incoming.payload.timestamp > existing.payload.timestamp {
            return Ok(Admission::Store(incoming));
        }
        return Ok(Admission::Keep);
    }

    Ok(Admission::Store(incoming))
}

/// Union two claim-set envelopes. The stored envelope is the newer of
/// the two with its value replaced by the union and its timestamp set to
/// the max; each claim inside carries its own signature, which is what
/// `resolve_winner` validates.
fn merge_claim_envelopes(existing: &Envelope, incoming: &Envelope) -> Envelope {
    let merged_value = claims::merge_claim_sets(&existing.payload.value, &incoming.payload.value);
    let mut base = if incoming.payload.timestamp >= existing.payload.timestamp {
        incoming.clone()
    } else {
        existing.clone()
    };
    base.payload.timestamp = existing.payload.timestamp.max(incoming.payload.timestamp);
    base.payload.value = merged_value;
    base
}

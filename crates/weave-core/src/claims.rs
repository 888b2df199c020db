//! Handle and username claims
//!
//! Two claim schemas ride on top of the ordinary write path:
//!
//! - **Handle claims** live at `frozen/handles/<normalized_handle>`.
//!   Unforgeability comes from the suffix being a deterministic function
//!   of the claiming key plus the first-write-wins guarantee of the
//!   frozen space.
//! - **Username claim sets** live at `all/claims/username/<name>`: an
//!   unordered set of signed claims merged by set union, resolved to a
//!   winner by the earliest valid, non-revoked `created_at`.

use crate::canonical::{canonical_bytes, to_canonical_json};
use crate::codec::Value;
use crate::envelope::Envelope;
use crate::error::{WeaveError, WeaveResult};
use crate::identity::{deterministic_suffix, split_handle, PublicKey};

/// A claim on a handle, stored in the frozen space.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleClaim {
    pub handle: String,
    pub pub_key: PublicKey,
    pub claimed_at: u64,
    /// Signature over the canonical form of `{claimed_at, handle, pub_key}`.
    pub proof: Vec<u8>,
}

impl HandleClaim {
    fn proof_bytes(handle: &str, pub_key: &PublicKey, claimed_at: u64) -> Vec<u8> {
        let value = Value::Map(vec![
            ("claimed_at".to_string(), Value::Int(claimed_at as i64)),
            ("handle".to_string(), Value::Text(handle.to_string())),
            ("pub_key".to_string(), Value::Text(pub_key.to_base64())),
        ]);
        canonical_bytes(&to_canonical_json(&value))
    }

    /// Build and sign a claim.
    pub fn seal(
        handle: &str,
        pub_key: PublicKey,
        claimed_at: u64,
        sign_fn: impl Fn(&[u8]) -> Vec<u8>,
    ) -> Self {
        let proof = sign_fn(&Self::proof_bytes(handle, &pub_key, claimed_at));
        Self {
            handle: handle.to_string(),
            pub_key,
            claimed_at,
            proof,
        }
    }

    /// Verify the proof signature.
    pub fn verify(&self) -> bool {
        self.pub_key.verify(
            &Self::proof_bytes(&self.handle, &self.pub_key, self.claimed_at),
            &self.proof,
        )
    }

    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            ("handle".to_string(), Value::Text(self.handle.clone())),
            ("pub_key".to_string(), Value::Text(self.pub_key.to_base64())),
            ("claimed_at".to_string(), Value::Int(self.claimed_at as i64)),
            ("proof".to_string(), Value::Bytes(self.proof.clone())),
        ])
    }

    pub fn from_value(value: &Value) -> WeaveResult<Self> {
        let handle = value
            .get("handle")
            .and_then(Value::as_text)
            .ok_or_else(|| WeaveError::InvalidEncoding("Claim missing handle".to_string()))?
            .to_string();
        let pub_key = value
            .get("pub_key")
            .and_then(Value::as_text)
            .ok_or_else(|| WeaveError::InvalidEncoding("Claim missing pub_key".to_string()))
            .and_then(PublicKey::from_base64)?;
        let claimed_at = value
            .get("claimed_at")
            .and_then(Value::as_int)
            .filter(|t| *t >= 0)
            .ok_or_else(|| WeaveError::InvalidEncoding("Claim missing claimed_at".to_string()))?
            as u64;
        let proof = value
            .get("proof")
            .and_then(Value::as_bytes)
            .ok_or_else(|| WeaveError::InvalidEncoding("Claim missing proof".to_string()))?
            .to_vec();
        Ok(Self {
            handle,
            pub_key,
            claimed_at,
            proof,
        })
    }
}

/// Admission checks for an envelope targeting `frozen/handles/*`.
///
/// Requires the claim to be authored by its own key, the handle suffix
/// to be the deterministic function of that key, and the proof to
/// verify.
pub fn validate_handle_claim(envelope: &Envelope) -> WeaveResult<()> {
    let claim = HandleClaim::from_value(&envelope.payload.value)?;

    if claim.pub_key != envelope.payload.author {
        return Err(WeaveError::Forged(
            "Handle claim key differs from envelope author".to_string(),
        ));
    }

    let suffix = split_handle(&claim.handle)
        .map(|(_, suffix)| suffix)
        .ok_or_else(|| WeaveError::InvalidArgument("Handle has no suffix".to_string()))?;
    if suffix != deterministic_suffix(&claim.pub_key) {
        return Err(WeaveError::Forged(format!(
            "Handle suffix #{} does not match the claiming key",
            suffix
        )));
    }

    if !claim.verify() {
        return Err(WeaveError::SignatureInvalid(
            "Handle claim proof does not verify".to_string(),
        ));
    }
    Ok(())
}

/// One signed assertion of ownership of a username.
#[derive(Debug, Clone, PartialEq)]
pub struct UsernameClaim {
    pub username: String,
    pub pub_key: PublicKey,
    pub created_at: u64,
    pub revoked: bool,
    /// Signature over the canonical form of
    /// `{created_at, pub_key, revoked, username}`.
    pub signature: Vec<u8>,
}

impl UsernameClaim {
    fn claim_bytes(username: &str, pub_key: &PublicKey, created_at: u64, revoked: bool) -> Vec<u8> {
        let value = Value::Map(vec![
            ("created_at".to_string(), Value::Int(created_at as i64)),
            ("pub_key".to_string(), Value::Text(pub_key.to_base64())),
            ("revoked".to_string(), Value::Bool(revoked)),
            ("username".to_string(), Value::Text(username.to_string())),
        ]);
        canonical_bytes(&to_canonical_json(&value))
    }

    pub fn seal(
        username: &str,
        pub_key: PublicKey,
        created_at: u64,
        revoked: bool,
        sign_fn: impl Fn(&[u8]) -> Vec<u8>,
    ) -> Self {
        let signature = sign_fn(&Self::claim_bytes(username, &pub_key, created_at, revoked));
        Self {
            username: username.to_string(),
            pub_key,
            created_at,
            revoked,
            signature,
        }
    }

    pub fn verify(&self) -> bool {
        self.pub_key.verify(
            &Self::claim_bytes(&self.username, &self.pub_key, self.created_at, self.revoked),
            &self.signature,
        )
    }

    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            ("username".to_string(), Value::Text(self.username.clone())),
            ("pub_key".to_string(), Value::Text(self.pub_key.to_base64())),
            ("created_at".to_string(), Value::Int(self.created_at as i64)),
            ("revoked".to_string(), Value::Bool(self.revoked)),
            ("signature".to_string(), Value::Bytes(self.signature.clone())),
        ])
    }

    pub fn from_value(value: &Value) -> WeaveResult<Self> {
        let username = value
            .get("username")
            .and_then(Value::as_text)
            .ok_or_else(|| WeaveError::InvalidEncoding("Claim missing username".to_string()))?
            .to_string();
        let pub_key = value
            .get("pub_key")
            .and_then(Value::as_text)
            .ok_or_else(|| WeaveError::InvalidEncoding("Claim missing pub_key".to_string()))
            .and_then(PublicKey::from_base64)?;
        let created_at = value
            .get("created_at")
            .and_then(Value::as_int)
            .filter(|t| *t >= 0)
            .ok_or_else(|| WeaveError::InvalidEncoding("Claim missing created_at".to_string()))?
            as u64;
        let revoked = value
            .get("revoked")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let signature = value
            .get("signature")
            .and_then(Value::as_bytes)
            .ok_or_else(|| WeaveError::InvalidEncoding("Claim missing signature".to_string()))?
            .to_vec();
        Ok(Self {
            username,
            pub_key,
            created_at,
            revoked,
            signature,
        })
    }
}

/// Parse a claim-set value. Entries that fail to parse are dropped
/// rather than poisoning the whole set.
pub fn claim_set_from_value(value: &Value) -> Vec<UsernameClaim> {
    match value.as_array() {
        Some(items) => items
            .iter()
            .filter_map(|item| UsernameClaim::from_value(item).ok())
            .collect(),
        None => Vec::new(),
    }
}

/// Render a claim set as a value. Claims are ordered by
/// `(created_at, signature)` so the same set encodes identically on
/// every peer, which keeps converged roots equal.
pub fn claim_set_to_value(claims: &[UsernameClaim]) -> Value {
    let mut sorted: Vec<&UsernameClaim> = claims.iter().collect();
    sorted.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.signature.cmp(&b.signature))
    });
    Value::Array(sorted.iter().map(|c| c.to_value()).collect())
}

/// Set union keyed by signature bytes.
pub fn merge_claim_sets(ours: &Value, theirs: &Value) -> Value {
    let mut merged = claim_set_from_value(ours);
    for claim in claim_set_from_value(theirs) {
        if !merged.iter().any(|c| c.signature == claim.signature) {
            merged.push(claim);
        }
    }
    claim_set_to_value(&merged)
}

/// Resolve a claim set to a winner: valid signatures only, owners with a
/// valid revocation excluded, earliest `created_at` wins, ties broken on
/// signature bytes.
pub fn resolve_winner(claims: &[UsernameClaim]) -> Option<UsernameClaim> {
    let valid: Vec<&UsernameClaim> = claims.iter().filter(|c| c.verify()).collect();

    let revoked_owners: Vec<&PublicKey> = valid
        .iter()
        .filter(|c| c.revoked)
        .map(|c| &c.pub_key)
        .collect();

    valid
        .into_iter()
        .filter(|c| !c.revoked)
        .filter(|c| !revoked_owners.contains(&&c.pub_key))
        .min_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.signature.cmp(&b.signature))
        })
        .cloned()
}

//! Binary-packed trie node
//!
//! A node carries an optional value reference and a map from path byte to
//! child digest. Its identity is the SHA-256 of its serialization, so any
//! mutation produces a fresh node and a fresh digest.
//!
//! ## Wire Format
//!
//! ```text
//! +------+-----------------+-------------------------+----------------------+
//! | flag | [count u16 BE]  | [len u16 BE][ref bytes] | count * (byte, 32B)  |
//! | (1B) | only if esc=127 | only if has_value       | ascending by byte    |
//! +------+-----------------+-------------------------+----------------------+
//! ```
//!
//! The flag byte carries `has_value` in the low bit and the child count in
//! the upper 7 bits; the escape value 127 means the real count follows as
//! a big-endian u16.

use std::collections::BTreeMap;

use crate::digest::Digest;
use crate::error::{WeaveError, WeaveResult};

/// Child-count value in the flag byte that escapes to a 16-bit count.
const COUNT_ESCAPE: u8 = 127;

/// A persistent trie node. Children iterate in ascending byte order,
/// which the serialization relies on for stable digests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrieNode {
    /// Reference key into the value store; absent for interior nodes.
    pub value_ref: Option<String>,
    /// Path byte to child-node digest.
    pub children: BTreeMap<u8, Digest>,
}

impl TrieNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_value(&self) -> bool {
        self.value_ref.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.value_ref.is_none() && self.children.is_empty()
    }

    /// Serialize to the binary node format.
    pub fn serialize(&self) -> Vec<u8> {
        let count = self.children.len();
        let mut out = Vec::with_capacity(1 + 2 + count * 33);

        let has_value = self.has_value() as u8;
        if count < COUNT_ESCAPE as usize {
            out.push(has_value | ((count as u8) << 1));
        } else {
            out.push(has_value | (COUNT_ESCAPE << 1));
            out.extend_from_slice(&(count as u16).to_be_bytes());
        }

        if let Some(ref_key) = &self.value_ref {
            out.extend_from_slice(&(ref_key.len() as u16).to_be_bytes());
            out.extend_from_slice(ref_key.as_bytes());
        }

        // BTreeMap iterates ascending by key, as the format requires.
        for (byte, digest) in &self.children {
            out.push(*byte);
            out.extend_from_slice(digest.as_bytes());
        }

        out
    }

    /// Deserialize the binary node format. Fails with `MalformedNode`
    /// on truncation or trailing bytes.
    pub fn deserialize(bytes: &[u8]) -> WeaveResult<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };

        let flag = cursor.take(1)?[0];
        let has_value = flag & 1 == 1;
        let mut count = (flag >> 1) as usize;
        if count == COUNT_ESCAPE as usize {
            let b = cursor.take(2)?;
            count = u16::from_be_bytes([b[0], b[1]]) as usize;
        }

        let value_ref = if has_value {
            let b = cursor.take(2)?;
            let len = u16::from_be_bytes([b[0], b[1]]) as usize;
            let raw = cursor.take(len)?;
            let s = std::str::from_utf8(raw)
                .map_err(|_| WeaveError::MalformedNode("Value ref is not UTF-8".to_string()))?;
            Some(s.to_string())
        } else {
            None
        };

        let mut children = BTreeMap::new();
        for _ in 0..count {
            let byte = cursor.take(1)?[0];
            let raw = cursor.take(32)?;
            let mut arr = [0u8; 32];
            arr.copy_from_slice(raw);
            children.insert(byte, Digest::from_bytes(arr));
        }

        if cursor.pos != bytes.len() {
            return Err(WeaveError::MalformedNode(format!(
                "{} trailing bytes after node",
                bytes.len() - cursor.pos
            )));
        }

        Ok(Self {
            value_ref,
            children,
        })
    }

    /// The node's identity: the digest of its serialization.
    pub fn digest(&self) -> Digest {
        Digest::of(&self.serialize())
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> WeaveResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(WeaveError::MalformedNode(format!(
                "Truncated node: wanted {} bytes at offset {}",
                n, self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_for(n: u8) -> Digest {
        Digest::of(&[n])
    }

    #[test]
    fn test_empty_node_roundtrip() {
        let node = TrieNode::new();
        let bytes = node.serialize();
        assert_eq!(bytes, vec![0u8]);
        assert_eq!(TrieNode::deserialize(&bytes).unwrap(), node);
    }

    #[test]
    fn test_leaf_roundtrip() {
        let node = TrieNode {
            value_ref: Some("v:abc123".to_string()),
            children: BTreeMap::new(),
        };
        let decoded = TrieNode::deserialize(&node.serialize()).unwrap();
        assert_eq!(decoded, node);
        assert!(decoded.has_value());
    }

    #[test]
    fn test_children_serialize_ascending() {
        let mut node = TrieNode::new();
        node.children.insert(b'z', digest_for(1));
        node.children.insert(b'a', digest_for(2));
        node.children.insert(b'm', digest_for(3));

        let bytes = node.serialize();
        // flag byte: no value, 3 children
        assert_eq!(bytes[0], 3 << 1);
        // entries appear in ascending byte order regardless of insert order
        assert_eq!(bytes[1], b'a');
        assert_eq!(bytes[1 + 33], b'm');
        assert_eq!(bytes[1 + 66], b'z');

        assert_eq!(TrieNode::deserialize(&bytes).unwrap(), node);
    }

    #[test]
    fn test_count_escape_roundtrip() {
        // More than 126 children forces the u16 count escape.
        let mut node = TrieNode::new();
        for byte in 0u8..=200 {
            node.children.insert(byte, digest_for(byte));
        }
        let bytes = node.serialize();
        assert_eq!(bytes[0] >> 1, COUNT_ESCAPE);
        assert_eq!(u16::from_be_bytes([bytes[1], bytes[2]]), 201);
        assert_eq!(TrieNode::deserialize(&bytes).unwrap(), node);
    }

    #[test]
    fn test_digest_changes_on_mutation() {
        let mut node = TrieNode::new();
        let before = node.digest();
        node.value_ref = Some("v:x".to_string());
        assert_ne!(before, node.digest());
    }

    #[test]
    fn test_digest_stable_across_runs() {
        let mut node = TrieNode::new();
        node.value_ref = Some("v:ref".to_string());
        node.children.insert(b'k', digest_for(9));
        assert_eq!(node.digest(), node.clone().digest());
        assert_eq!(
            node.digest(),
            TrieNode::deserialize(&node.serialize()).unwrap().digest()
        );
    }

    #[test]
    fn test_truncated_node_fails() {
        let mut node = TrieNode::new();
        node.children.insert(b'a', digest_for(1));
        let mut bytes = node.serialize();
        bytes.truncate(bytes.len() - 5);
        assert!(matches!(
            TrieNode::deserialize(&bytes),
            Err(WeaveError::MalformedNode(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_fail() {
        let mut bytes = TrieNode::new().serialize();
        bytes.push(7);
        assert!(matches!(
            TrieNode::deserialize(&bytes),
            Err(WeaveError::MalformedNode(_))
        ));
    }
}

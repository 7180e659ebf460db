//! Repository domain types: seals, trees, blobs and timeline metadata.
//!
//! These are immutable, content-addressed records. Their storage and
//! timeline-reference bookkeeping lives outside this crate (see
//! [`crate::storage`]); this module only defines the shapes that travel over
//! the wire during synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::{Hash, Hashable};

/// `name <email>` pair identifying the author of a seal or timeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// A commit-like, immutable record. `hash` is derived from every other field
/// and must never be mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seal {
    pub name: String,
    pub iteration: u64,
    pub message: String,
    pub author: Identity,
    pub timestamp: DateTime<Utc>,
    pub parents: Vec<Hash>,
    /// Hash of the tree snapshot this seal points at; zero for an empty tree.
    pub position: Hash,
    hash: Hash,
}

impl Seal {
    /// Construct a seal and compute its content hash from the other fields.
    pub fn new(
        name: String,
        iteration: u64,
        message: String,
        author: Identity,
        timestamp: DateTime<Utc>,
        parents: Vec<Hash>,
        position: Hash,
    ) -> Self {
        let mut seal = Seal {
            name,
            iteration,
            message,
            author,
            timestamp,
            parents,
            position,
            hash: Hash::zero(),
        };
        seal.hash = seal.content_hash();
        seal
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }
}

impl Hashable for Seal {
    fn canonical_bytes(&self) -> Vec<u8> {
        // Serialize everything except the memoized hash itself.
        #[derive(Serialize)]
        struct Unhashed<'a> {
            name: &'a str,
            iteration: u64,
            message: &'a str,
            author: &'a Identity,
            timestamp: DateTime<Utc>,
            parents: &'a [Hash],
            position: Hash,
        }
        let unhashed = Unhashed {
            name: &self.name,
            iteration: self.iteration,
            message: &self.message,
            author: &self.author,
            timestamp: self.timestamp,
            parents: &self.parents,
            position: self.position,
        };
        serde_json::to_vec(&unhashed).expect("seal fields are always serializable")
    }
}

/// The kind of object a [`TreeEntry`] points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Tree,
    Blob,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub hash: Hash,
}

/// An ordered set of entries, content-addressed by its own serialization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(entries: Vec<TreeEntry>) -> Self {
        Self { entries }
    }

    /// Hashes directly referenced by this tree's entries (one hop, not
    /// transitive).
    pub fn child_hashes(&self) -> impl Iterator<Item = (&TreeEntry, Hash)> {
        self.entries.iter().map(|e| (e, e.hash))
    }
}

impl Hashable for Tree {
    fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("tree is always serializable")
    }
}

/// An immutable byte sequence, content-addressed by its own bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Hashable for Blob {
    fn canonical_bytes(&self) -> Vec<u8> {
        self.0.clone()
    }
}

/// A named, mutable reference to a seal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineMetadata {
    pub name: String,
    pub description: String,
    pub head: Hash,
    pub last_update: DateTime<Utc>,
    pub author: Identity,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> Identity {
        Identity::new("ivaldi", "ivaldi@example.com")
    }

    #[test]
    fn seal_hash_is_deterministic() {
        let ts = Utc::now();
        let a = Seal::new(
            "main".into(),
            1,
            "init".into(),
            author(),
            ts,
            vec![],
            Hash::zero(),
        );
        let b = Seal::new(
            "main".into(),
            1,
            "init".into(),
            author(),
            ts,
            vec![],
            Hash::zero(),
        );
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn seal_hash_changes_with_message() {
        let ts = Utc::now();
        let a = Seal::new(
            "main".into(),
            1,
            "init".into(),
            author(),
            ts,
            vec![],
            Hash::zero(),
        );
        let b = Seal::new(
            "main".into(),
            1,
            "different".into(),
            author(),
            ts,
            vec![],
            Hash::zero(),
        );
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn tree_hash_respects_entry_order() {
        let e1 = TreeEntry {
            name: "a".into(),
            kind: EntryKind::Blob,
            mode: 0o644,
            hash: crate::hash::hash(b"a"),
        };
        let e2 = TreeEntry {
            name: "b".into(),
            kind: EntryKind::Blob,
            mode: 0o644,
            hash: crate::hash::hash(b"b"),
        };
        let t1 = Tree::new(vec![e1.clone(), e2.clone()]);
        let t2 = Tree::new(vec![e2, e1]);
        assert_ne!(t1.content_hash(), t2.content_hash());
    }

    #[test]
    fn blob_hash_matches_plain_content_hash() {
        let blob = Blob::new(b"hello".to_vec());
        assert_eq!(blob.content_hash(), crate::hash::hash(b"hello"));
    }
}

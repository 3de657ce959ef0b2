//! Append-only index-window engine (C6): the kernel's canonicality clock.
//!
//! An ordered sequence of windows, at most one `open`. Each window is a
//! Merkle tree over the leaves submitted to it while open; closing a window
//! computes its root and a signed head. Grounded in
//! `ibank_core::ledger::AppendOnlyLedger`'s hash-chained append log,
//! generalized from a flat chain to a tree. Per REDESIGN FLAG 3, this is an
//! instance holding a storage handle — never a module-level global.

use ck_canon::{canonicalize, CanonicalValue};
use ck_storage::{IndexStore, StorageError};
use ck_types::{IndexWindow, InclusionProof, ProofDirection, ProofStep};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("a window is already open")]
    WindowAlreadyOpen,
    #[error("no window is open")]
    NoOpenWindow,
    #[error("window {0} not found")]
    WindowNotFound(String),
    #[error("window {0} is still open; inclusion proofs are only derived from closed windows")]
    WindowStillOpen(String),
    #[error(transparent)]
    Signing(#[from] ck_crypto::CryptoError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of `submit`: the leaf is durable but the window it landed in has
/// not necessarily closed yet, so the root over it isn't final.
#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub window_id: String,
    pub leaf_hash: String,
    pub position: u64,
    pub ack: &'static str,
}

/// What `head()` reports about the engine's current reference point.
#[derive(Debug, Clone)]
pub struct WindowHead {
    pub window_id: String,
    pub root_hash: Option<String>,
    pub leaf_count: u64,
    pub signed_head: Option<String>,
}

pub struct IndexEngine<S: IndexStore> {
    storage: Arc<S>,
    kernel_private_hex: String,
    kernel_pubkey_hex: String,
}

impl<S: IndexStore> IndexEngine<S> {
    pub fn new(
        storage: Arc<S>,
        kernel_private_hex: impl Into<String>,
        kernel_pubkey_hex: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            kernel_private_hex: kernel_private_hex.into(),
            kernel_pubkey_hex: kernel_pubkey_hex.into(),
        }
    }

    pub async fn open_window(&self) -> Result<IndexWindow, IndexError> {
        if self.storage.get_open_window().await?.is_some() {
            return Err(IndexError::WindowAlreadyOpen);
        }
        let previous = self.storage.get_latest_window().await?;
        let window = IndexWindow {
            window_id: uuid::Uuid::new_v4().to_string(),
            previous_window_id: previous.as_ref().map(|w| w.window_id.clone()),
            previous_root_hash: previous.and_then(|w| w.root_hash),
            opened_at_ms: Utc::now().timestamp_millis(),
            closed_at_ms: None,
            leaf_count: 0,
            root_hash: None,
            kernel_signature: None,
        };
        self.storage.create_window(window.clone()).await.map_err(|e| match e {
            StorageError::Conflict(_) => IndexError::WindowAlreadyOpen,
            other => IndexError::Storage(other),
        })?;
        tracing::info!(window_id = %window.window_id, "index window opened");
        Ok(window)
    }

    /// Appends a leaf `hash(canonicalize({type, payload_hash}))` to the open
    /// window at `position = current leaf_count`. Fails if no window is open.
    pub async fn submit(&self, leaf_type: &str, payload_hash: &str) -> Result<SubmitAck, IndexError> {
        let window = self
            .storage
            .get_open_window()
            .await?
            .ok_or(IndexError::NoOpenWindow)?;
        let leaf_body = CanonicalValue::map()
            .field("type", CanonicalValue::str(leaf_type))
            .field("payload_hash", CanonicalValue::str(payload_hash))
            .build();
        let leaf_hash = ck_crypto::hash(&canonicalize(&leaf_body));
        let position = window.leaf_count;
        let leaf = ck_types::IndexLeaf {
            window_id: window.window_id.clone(),
            position,
            leaf_type: leaf_type.to_string(),
            payload_hash: payload_hash.to_string(),
            leaf_hash: leaf_hash.clone(),
            submitted_at_ms: Utc::now().timestamp_millis(),
        };
        self.storage.append_leaf(leaf).await?;
        Ok(SubmitAck {
            window_id: window.window_id,
            leaf_hash,
            position,
            ack: "pending_close",
        })
    }

    /// Finalizes the currently open window: computes its Merkle root,
    /// stamps `closed_at_ms`, and signs the head.
    pub async fn close_window(&self) -> Result<IndexWindow, IndexError> {
        let window = self
            .storage
            .get_open_window()
            .await?
            .ok_or(IndexError::NoOpenWindow)?;
        let leaves = self.storage.list_leaves(&window.window_id).await?;
        let leaf_hashes: Vec<String> = leaves.iter().map(|l| l.leaf_hash.clone()).collect();
        let root_hash = merkle_root(&leaf_hashes);
        let closed_at_ms = Utc::now().timestamp_millis();

        let head_body = CanonicalValue::map()
            .field("window_id", CanonicalValue::str(&window.window_id))
            .field("root_hash", CanonicalValue::str(&root_hash))
            .field("closed_at_ms", CanonicalValue::Int(closed_at_ms))
            .field("leaf_count", CanonicalValue::Int(leaf_hashes.len() as i64))
            .build();
        let head_hash = ck_crypto::hash(&canonicalize(&head_body));
        let kernel_signature = ck_crypto::sign(&head_hash, &self.kernel_private_hex)?;

        self.storage
            .close_window(&window.window_id, root_hash.clone(), closed_at_ms, kernel_signature.clone())
            .await?;
        tracing::info!(window_id = %window.window_id, leaf_count = leaf_hashes.len(), "index window closed");

        Ok(IndexWindow {
            closed_at_ms: Some(closed_at_ms),
            root_hash: Some(root_hash),
            kernel_signature: Some(kernel_signature),
            leaf_count: leaf_hashes.len() as u64,
            ..window
        })
    }

    /// Reports the open window if one exists, otherwise the most recently
    /// closed window.
    pub async fn head(&self) -> Result<Option<WindowHead>, IndexError> {
        let window = match self.storage.get_open_window().await? {
            Some(w) => Some(w),
            None => self.storage.get_latest_window().await?,
        };
        Ok(window.map(|w| WindowHead {
            window_id: w.window_id,
            root_hash: w.root_hash,
            leaf_count: w.leaf_count,
            signed_head: w.kernel_signature,
        }))
    }

    /// Derives an inclusion proof for `leaf_hash` in `window_id`. Only closed
    /// windows carry proofs — an open window's tree isn't final.
    pub async fn proof(
        &self,
        window_id: &str,
        leaf_hash: &str,
    ) -> Result<Option<InclusionProof>, IndexError> {
        let window = self
            .storage
            .get_window(window_id)
            .await?
            .ok_or_else(|| IndexError::WindowNotFound(window_id.to_string()))?;
        if window.is_open() {
            return Err(IndexError::WindowStillOpen(window_id.to_string()));
        }
        let leaves = self.storage.list_leaves(window_id).await?;
        let Some(leaf) = leaves.iter().find(|l| l.leaf_hash == leaf_hash) else {
            return Ok(None);
        };
        let leaf_hashes: Vec<String> = leaves.iter().map(|l| l.leaf_hash.clone()).collect();
        let levels = merkle_levels(&leaf_hashes);
        let path = build_proof_path(&levels, leaf.position as usize);

        Ok(Some(InclusionProof {
            window_id: window_id.to_string(),
            leaf_hash: leaf_hash.to_string(),
            position: leaf.position,
            path,
            root_hash: window.root_hash.unwrap_or_default(),
            signed_head: window.kernel_signature.unwrap_or_default(),
        }))
    }
}

/// Pure function: walks a proof path from `leaf_hash` and checks the
/// resulting root matches `root_hash`. Does not touch storage.
pub fn verify_proof(leaf_hash: &str, proof: &InclusionProof, root_hash: &str) -> bool {
    let mut computed = leaf_hash.to_string();
    for step in &proof.path {
        let body = match step.direction {
            ProofDirection::Left => CanonicalValue::map()
                .field("left", CanonicalValue::str(&step.sibling))
                .field("right", CanonicalValue::str(&computed)),
            ProofDirection::Right => CanonicalValue::map()
                .field("left", CanonicalValue::str(&computed))
                .field("right", CanonicalValue::str(&step.sibling)),
        };
        computed = ck_crypto::hash(&canonicalize(&body.build()));
    }
    computed == root_hash && proof.root_hash == root_hash
}

/// Empty-tree root per spec.md §4.6: `hash(canonicalize({empty: true}))`.
fn empty_root() -> String {
    let body = CanonicalValue::map().field("empty", CanonicalValue::Bool(true)).build();
    ck_crypto::hash(&canonicalize(&body))
}

fn merkle_root(leaf_hashes: &[String]) -> String {
    if leaf_hashes.is_empty() {
        return empty_root();
    }
    let levels = merkle_levels(leaf_hashes);
    levels.last().expect("at least one level").first().expect("root present").clone()
}

/// Builds every level of the tree, leaves first. Pads the leaf level up to a
/// power of two by duplicating the last leaf (once, at the leaves — not by
/// self-hashing at each odd level).
fn merkle_levels(leaf_hashes: &[String]) -> Vec<Vec<String>> {
    let mut padded = leaf_hashes.to_vec();
    let target_len = padded.len().next_power_of_two();
    while padded.len() < target_len {
        let last = padded.last().expect("nonempty before padding").clone();
        padded.push(last);
    }
    let mut levels = vec![padded];
    while levels.last().expect("levels nonempty").len() > 1 {
        let current = levels.last().expect("levels nonempty");
        let mut next = Vec::with_capacity(current.len() / 2);
        for pair in current.chunks(2) {
            let body = CanonicalValue::map()
                .field("left", CanonicalValue::str(&pair[0]))
                .field("right", CanonicalValue::str(&pair[1]))
                .build();
            next.push(ck_crypto::hash(&canonicalize(&body)));
        }
        levels.push(next);
    }
    levels
}

/// Walks from the leaf level up to the root, recording the sibling and its
/// side at each level. `direction = Left` when the sibling sits to the left
/// of the current node, `Right` otherwise.
fn build_proof_path(levels: &[Vec<String>], leaf_position: usize) -> Vec<ProofStep> {
    let mut path = Vec::with_capacity(levels.len().saturating_sub(1));
    let mut index = leaf_position;
    for level in levels.iter().take(levels.len().saturating_sub(1)) {
        let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
        let direction = if sibling_index < index {
            ProofDirection::Left
        } else {
            ProofDirection::Right
        };
        path.push(ProofStep {
            sibling: level[sibling_index].clone(),
            direction,
        });
        index /= 2;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_storage::InMemoryKernelStorage;

    fn engine() -> IndexEngine<InMemoryKernelStorage> {
        let (private, public) = ck_crypto::generate_keypair();
        IndexEngine::new(Arc::new(InMemoryKernelStorage::new()), private, public)
    }

    #[tokio::test]
    async fn first_submit_position_is_zero() {
        let engine = engine();
        engine.open_window().await.unwrap();
        let ack = engine.submit("msr", "payload-hash-1").await.unwrap();
        assert_eq!(ack.position, 0);
        assert_eq!(ack.ack, "pending_close");
    }

    #[tokio::test]
    async fn submit_without_open_window_fails() {
        let engine = engine();
        let err = engine.submit("msr", "payload-hash-1").await.unwrap_err();
        assert!(matches!(err, IndexError::NoOpenWindow));
    }

    #[tokio::test]
    async fn second_open_window_fails_while_one_is_open() {
        let engine = engine();
        engine.open_window().await.unwrap();
        let err = engine.open_window().await.unwrap_err();
        assert!(matches!(err, IndexError::WindowAlreadyOpen));
    }

    #[tokio::test]
    async fn closing_empty_window_yields_empty_tree_root() {
        let engine = engine();
        engine.open_window().await.unwrap();
        let closed = engine.close_window().await.unwrap();
        assert_eq!(closed.root_hash, Some(empty_root()));
        assert!(closed.kernel_signature.is_some());
    }

    #[tokio::test]
    async fn four_leaf_window_produces_verifiable_inclusion_proofs() {
        let engine = engine();
        engine.open_window().await.unwrap();
        let mut acks = Vec::new();
        for i in 0..4 {
            acks.push(engine.submit("msr", &format!("payload-{i}")).await.unwrap());
        }
        let closed = engine.close_window().await.unwrap();
        let root_hash = closed.root_hash.clone().unwrap();

        for ack in &acks {
            let proof = engine
                .proof(&closed.window_id, &ack.leaf_hash)
                .await
                .unwrap()
                .expect("leaf should be present");
            assert_eq!(proof.path.len(), 2);
            assert!(verify_proof(&ack.leaf_hash, &proof, &root_hash));
        }
    }

    #[tokio::test]
    async fn tampering_a_sibling_byte_invalidates_the_proof() {
        let engine = engine();
        engine.open_window().await.unwrap();
        for i in 0..4 {
            engine.submit("msr", &format!("payload-{i}")).await.unwrap();
        }
        let closed = engine.close_window().await.unwrap();
        let root_hash = closed.root_hash.clone().unwrap();
        let leaves = engine.storage.list_leaves(&closed.window_id).await.unwrap();
        let target = &leaves[2];

        let mut proof = engine
            .proof(&closed.window_id, &target.leaf_hash)
            .await
            .unwrap()
            .unwrap();
        let mut tampered = proof.path[0].sibling.clone();
        tampered.replace_range(0..1, if &tampered[0..1] == "0" { "1" } else { "0" });
        proof.path[0].sibling = tampered;

        assert!(!verify_proof(&target.leaf_hash, &proof, &root_hash));
    }

    #[tokio::test]
    async fn second_window_chains_to_first() {
        let engine = engine();
        engine.open_window().await.unwrap();
        engine.submit("msr", "payload-0").await.unwrap();
        let first = engine.close_window().await.unwrap();

        let second = engine.open_window().await.unwrap();
        assert_eq!(second.previous_window_id, Some(first.window_id));
        assert_eq!(second.previous_root_hash, first.root_hash);
    }
}

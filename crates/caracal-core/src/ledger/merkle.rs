//! Merkle tamper-evidence over ledger event batches.
//!
//! Leaves are SHA-256 of each event's canonical JSON encoding; the tree is
//! built pairwise in SHA-256, duplicating a dangling odd leaf, same as the
//! construction used for the mandate-chain batching. The signed root commits
//! the whole batch: flipping a single historical event changes its leaf
//! hash and therefore every ancestor up to the root, which invalidates the
//! signature.

use chrono::Utc;
use rusqlite::params;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crypto::{sign_merkle_root, verify_merkle_root};
use crate::error::LedgerError;
use crate::model::{LedgerEvent, SignedMerkleBatch};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// A compact proof that a single event is included in a signed Merkle batch.
#[derive(Debug, Clone)]
pub struct InclusionProof {
    pub event_id: u64,
    leaf_hash: [u8; 32],
    path: Vec<(Side, [u8; 32])>,
}

impl InclusionProof {
    /// Recompute the root implied by this proof and compare against `root_hex`.
    pub fn verify(&self, root_hex: &str) -> bool {
        let mut current = self.leaf_hash;
        for (side, sibling) in &self.path {
            let mut hasher = Sha256::new();
            match side {
                Side::Left => {
                    hasher.update(current);
                    hasher.update(sibling);
                }
                Side::Right => {
                    hasher.update(sibling);
                    hasher.update(current);
                }
            }
            current = hasher.finalize().into();
        }
        hex::encode(current) == root_hex
    }
}

fn leaf_hash(event: &LedgerEvent) -> [u8; 32] {
    let encoded = serde_json::to_vec(event).unwrap_or_default();
    Sha256::digest(encoded).into()
}

fn parent_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Builds every level of the tree, bottom to top. `levels[0]` is the leaves;
/// the last level holds exactly one node, the root.
fn build_levels(leaves: Vec<[u8; 32]>) -> Vec<Vec<[u8; 32]>> {
    let mut levels = vec![leaves];
    while levels.last().unwrap().len() > 1 {
        let prev = levels.last().unwrap();
        let mut next = Vec::with_capacity(prev.len().div_ceil(2));
        let mut i = 0;
        while i < prev.len() {
            let left = prev[i];
            let right = if i + 1 < prev.len() { prev[i + 1] } else { prev[i] };
            next.push(parent_hash(&left, &right));
            i += 2;
        }
        levels.push(next);
    }
    levels
}

/// Builds and signs a Merkle batch, and generates per-event inclusion
/// proofs against the same persisted root.
#[derive(Clone)]
pub struct MerkleBatcher {
    store: Store,
}

impl MerkleBatcher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Builds, signs, and persists a batch covering exactly `events`.
    /// `events` must be non-empty and ordered by `event_id` ascending; the
    /// caller (the periodic batching job) is responsible for that ordering.
    pub fn build_and_sign(
        &self,
        events: &[LedgerEvent],
        signing_key_pem: &str,
    ) -> Result<SignedMerkleBatch, LedgerError> {
        assert!(!events.is_empty(), "merkle batch must cover at least one event");
        let leaves: Vec<[u8; 32]> = events.iter().map(leaf_hash).collect();
        let levels = build_levels(leaves);
        let root = levels.last().unwrap()[0];
        let root_hex = hex::encode(root);
        let signature_hex = sign_merkle_root(&root, signing_key_pem)
            .map_err(|e| LedgerError::Store(crate::store::StoreError::Database(e.to_string())))?;

        let batch = SignedMerkleBatch {
            batch_id: Uuid::new_v4(),
            first_event_id: events.first().unwrap().event_id,
            last_event_id: events.last().unwrap().event_id,
            event_count: events.len() as u64,
            root_hex,
            signature_hex,
            created_at: Utc::now(),
        };

        let conn = self.store.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO merkle_batches (
                batch_id, first_event_id, last_event_id, event_count,
                root_hex, signature_hex, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                batch.batch_id.to_string(),
                batch.first_event_id as i64,
                batch.last_event_id as i64,
                batch.event_count as i64,
                batch.root_hex,
                batch.signature_hex,
                batch.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| LedgerError::Store(e.into()))?;

        Ok(batch)
    }

    /// Verifies a batch's signature against `public_key_pem` — confirms the
    /// root was signed by the claimed ledger key, not that any particular
    /// event is included (use [`inclusion_proof`] + [`InclusionProof::verify`]
    /// for that).
    pub fn verify_batch(batch: &SignedMerkleBatch, public_key_pem: &str) -> bool {
        let Ok(root_bytes) = hex::decode(&batch.root_hex) else {
            return false;
        };
        let Ok(root): Result<[u8; 32], _> = root_bytes.try_into() else {
            return false;
        };
        verify_merkle_root(&root, &batch.signature_hex, public_key_pem)
    }
}

/// Builds an inclusion proof for `target_event_id` within `events`, the
/// exact ordered slice that produced a batch's root. `O(log n)` proof size.
pub fn inclusion_proof(events: &[LedgerEvent], target_event_id: u64) -> Option<InclusionProof> {
    let index = events.iter().position(|e| e.event_id == target_event_id)?;
    let leaves: Vec<[u8; 32]> = events.iter().map(leaf_hash).collect();
    let target_leaf = leaves[index];
    let levels = build_levels(leaves);

    let mut path = Vec::new();
    let mut idx = index;
    for level in &levels[..levels.len() - 1] {
        let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
        let sibling = if sibling_idx < level.len() {
            level[sibling_idx]
        } else {
            level[idx]
        };
        let side = if idx % 2 == 0 { Side::Left } else { Side::Right };
        path.push((side, sibling));
        idx /= 2;
    }

    Some(InclusionProof {
        event_id: target_event_id,
        leaf_hash: target_leaf,
        path,
    })
}

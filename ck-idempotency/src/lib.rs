//! Lookup-or-execute idempotency controller (C5).
//!
//! Per spec.md §4.5, the `UNIQUE` constraint on `request_hash` — not
//! application code — is the source of truth: a concurrent duplicate fails
//! the insert, and the caller falls back to the lookup path. This crate
//! supplies the generic shape of that fallback so every component
//! (`ck-netting`, `ck-credit`, `ck-allocation`, receipts in general) doesn't
//! reimplement it: check first (cheap, no side effects), and if absent, run
//! the domain operation and let storage's [`InsertOutcome`] settle any race.
//!
//! Grounded in `maple_storage`'s unique-constraint-is-truth pattern and
//! `ibank_core::ledger`'s dedup-by-id checks.

use ck_storage::InsertOutcome;
use std::future::Future;

/// Whether this call actually ran side effects or replayed a prior result.
/// The dispatcher uses this to decide whether to charge a fee.
#[derive(Debug, Clone)]
pub enum IdempotentOutcome<T> {
    Fresh(T),
    Replayed(T),
}

impl<T> IdempotentOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            IdempotentOutcome::Fresh(v) => v,
            IdempotentOutcome::Replayed(v) => v,
        }
    }

    pub fn was_fresh(&self) -> bool {
        matches!(self, IdempotentOutcome::Fresh(_))
    }
}

/// `existing` is the result of a fast-path lookup by `request_hash` run
/// before any domain work or fee quoting. If it's `Some`, `execute` never
/// runs and no fee should be charged. Otherwise `execute` performs the
/// domain operation and its own `UNIQUE`-guarded insert; if that insert loses
/// a race, the `AlreadyExists` variant the backend returns is treated as a
/// replay too — the side effects already happened on the transaction that
/// won the race, not on this one.
pub async fn execute_idempotent<T, E, Fut>(
    existing: Option<T>,
    execute: impl FnOnce() -> Fut,
) -> Result<IdempotentOutcome<T>, E>
where
    Fut: Future<Output = Result<InsertOutcome<T>, E>>,
{
    if let Some(found) = existing {
        return Ok(IdempotentOutcome::Replayed(found));
    }
    Ok(match execute().await? {
        InsertOutcome::Inserted(v) => IdempotentOutcome::Fresh(v),
        InsertOutcome::AlreadyExists(v) => IdempotentOutcome::Replayed(v),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_storage::{InMemoryKernelStorage, ReceiptStore};
    use ck_types::ReceiptEnvelope;

    fn sample_receipt(request_hash: &str) -> ReceiptEnvelope {
        ReceiptEnvelope {
            receipt_hash: format!("hash-for-{request_hash}"),
            kernel_signature: "sig".to_string(),
            receipt_type: "MSR".to_string(),
            issuer: "clearing-kernel".to_string(),
            kernel_pubkey: "pub".to_string(),
            timestamp_ms: 0,
            request_hash: request_hash.to_string(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn fresh_request_runs_side_effects_once() {
        let storage = InMemoryKernelStorage::new();
        let existing = storage.get_by_request_hash("r1").await.unwrap();
        let outcome = execute_idempotent(existing, || storage.insert_receipt(sample_receipt("r1")))
            .await
            .unwrap();
        assert!(outcome.was_fresh());
    }

    #[tokio::test]
    async fn replayed_request_skips_side_effects() {
        let storage = InMemoryKernelStorage::new();
        storage.insert_receipt(sample_receipt("r1")).await.unwrap();

        let existing = storage.get_by_request_hash("r1").await.unwrap();
        let ran_execute = std::cell::Cell::new(false);
        let outcome = execute_idempotent(existing, || {
            ran_execute.set(true);
            storage.insert_receipt(sample_receipt("r1"))
        })
        .await
        .unwrap();
        assert!(!ran_execute.get(), "execute must not run when a prior result exists");

        assert!(!outcome.was_fresh());
        assert_eq!(outcome.into_inner().request_hash, "r1");
    }
}

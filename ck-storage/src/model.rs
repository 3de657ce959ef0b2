use ck_types::{Micros, WalletTransaction};
use serde::{Deserialize, Serialize};

/// Outcome of inserting a row guarded by a UNIQUE constraint on some
/// caller-supplied hash (`request_hash`, `input_hash`, `target`, ...). The
/// constraint is the idempotency boundary; callers that see `AlreadyExists`
/// must replay the stored row rather than re-run the operation.
#[derive(Debug, Clone)]
pub enum InsertOutcome<T> {
    Inserted(T),
    AlreadyExists(T),
}

impl<T> InsertOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Inserted(v) => v,
            InsertOutcome::AlreadyExists(v) => v,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Outcome of an atomic wallet deduction. Insufficient funds is a normal,
/// expected outcome (not a backend failure), so it is modeled as data rather
/// than a `StorageError` variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeductOutcome {
    Applied {
        balance_after: Micros,
        transaction: WalletTransaction,
    },
    InsufficientFunds {
        current_balance: Micros,
    },
}

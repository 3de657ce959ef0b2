use async_trait::async_trait;
use ck_types::{
    Agent, AllocationRecord, CollateralLock, CollateralStatus, CreditEventLogEntry, CreditLine,
    CreditLineStatus, CreditPosition, Escrow, EscrowStatus, InclusionProof, IndexLeaf, IndexWindow,
    MarginCall, MarginCallStatus, Micros, NettingJob, ReceiptEnvelope, Seal, Wallet,
    WalletTransaction, WalletTransactionKind,
};

use crate::error::StorageError;
use crate::model::{DeductOutcome, InsertOutcome};

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StorageError>;
    async fn put_agent(&self, agent: Agent) -> Result<(), StorageError>;

    /// Adds `amount` to the agent's lifetime settlement volume counter.
    async fn record_settlement_volume(
        &self,
        agent_id: &str,
        amount: Micros,
    ) -> Result<(), StorageError>;

    /// Increments the free-settlement counter for the period starting at
    /// `period_start_ms` (derived from the last-reset event, never wall
    /// clock). Resets the counter to 1 if the agent's stored period start
    /// differs from `period_start_ms`. Returns the counter value after the
    /// increment.
    async fn increment_free_settlement(
        &self,
        agent_id: &str,
        period_start_ms: i64,
    ) -> Result<u32, StorageError>;
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_balance(&self, wallet_id: &str) -> Result<Micros, StorageError>;

    async fn get_wallet(&self, wallet_id: &str) -> Result<Option<Wallet>, StorageError>;

    /// `amount` must be > 0. Atomically upserts the wallet row and appends a
    /// transaction log entry; returns the resulting balance.
    async fn credit(
        &self,
        wallet_id: &str,
        amount: Micros,
        kind: WalletTransactionKind,
        reference_type: &str,
        reference: &str,
    ) -> Result<WalletTransaction, StorageError>;

    /// Atomic check-and-decrement under row lock.
    async fn deduct(
        &self,
        wallet_id: &str,
        amount: Micros,
        reference_type: &str,
        reference: &str,
    ) -> Result<DeductOutcome, StorageError>;

    /// Deducts `amount + fee` from `from_wallet`, credits `amount` to
    /// `to_wallet`, and — if `fee > 0` — credits `fee` to `fee_wallet`, as one
    /// transaction. If the deduction is short, neither credit is applied and
    /// no transaction log entries are written. Used by operations that move
    /// funds between two parties and route a cut to a third wallet in the
    /// same breath (allocation settlement), so the three mutations commit or
    /// fail together rather than as three independent calls.
    async fn transfer_with_fee(
        &self,
        from_wallet: &str,
        to_wallet: &str,
        fee_wallet: &str,
        amount: Micros,
        fee: Micros,
        reference_type: &str,
        reference: &str,
    ) -> Result<DeductOutcome, StorageError>;

    async fn list_transactions(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<WalletTransaction>, StorageError>;
}

#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// `request_hash` is UNIQUE; a duplicate insert returns the existing row
    /// rather than failing.
    async fn insert_receipt(
        &self,
        receipt: ReceiptEnvelope,
    ) -> Result<InsertOutcome<ReceiptEnvelope>, StorageError>;

    async fn get_by_hash(&self, receipt_hash: &str) -> Result<Option<ReceiptEnvelope>, StorageError>;

    async fn get_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<ReceiptEnvelope>, StorageError>;
}

#[async_trait]
pub trait CreditLineStore: Send + Sync {
    async fn get_line(&self, credit_line_id: &str) -> Result<Option<CreditLine>, StorageError>;

    async fn get_position(
        &self,
        credit_line_id: &str,
    ) -> Result<Option<CreditPosition>, StorageError>;

    /// Inserts the credit line and its zeroed position atomically.
    async fn open_line(
        &self,
        line: CreditLine,
        position: CreditPosition,
    ) -> Result<(), StorageError>;

    async fn update_line_status(
        &self,
        credit_line_id: &str,
        status: CreditLineStatus,
    ) -> Result<(), StorageError>;

    async fn update_position(
        &self,
        credit_line_id: &str,
        position: CreditPosition,
    ) -> Result<(), StorageError>;

    /// `request_hash` is UNIQUE on this table.
    async fn append_event(
        &self,
        event: CreditEventLogEntry,
    ) -> Result<InsertOutcome<CreditEventLogEntry>, StorageError>;

    async fn get_event_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<CreditEventLogEntry>, StorageError>;

    async fn list_events(
        &self,
        credit_line_id: &str,
    ) -> Result<Vec<CreditEventLogEntry>, StorageError>;
}

#[async_trait]
pub trait CollateralStore: Send + Sync {
    async fn lock_collateral(&self, lock: CollateralLock) -> Result<(), StorageError>;

    async fn get_lock(&self, lock_id: &str) -> Result<Option<CollateralLock>, StorageError>;

    async fn update_lock_status(
        &self,
        lock_id: &str,
        status: CollateralStatus,
    ) -> Result<(), StorageError>;

    async fn list_locked_for_line(
        &self,
        credit_line_id: &str,
    ) -> Result<Vec<CollateralLock>, StorageError>;
}

#[async_trait]
pub trait MarginCallStore: Send + Sync {
    async fn create_margin_call(&self, call: MarginCall) -> Result<(), StorageError>;

    async fn get_margin_call(&self, margin_call_id: &str) -> Result<Option<MarginCall>, StorageError>;

    async fn update_margin_call_status(
        &self,
        margin_call_id: &str,
        status: MarginCallStatus,
        resolved_ts_ms: Option<i64>,
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// `request_hash` is UNIQUE on this table.
    async fn insert_allocation(
        &self,
        record: AllocationRecord,
    ) -> Result<InsertOutcome<AllocationRecord>, StorageError>;

    async fn get_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<AllocationRecord>, StorageError>;

    async fn list_for_wallet(&self, wallet_id: &str) -> Result<Vec<AllocationRecord>, StorageError>;
}

#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn create_escrow(&self, escrow: Escrow) -> Result<(), StorageError>;

    async fn get_escrow(&self, escrow_id: &str) -> Result<Option<Escrow>, StorageError>;

    async fn update_escrow_status(
        &self,
        escrow_id: &str,
        status: EscrowStatus,
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait NettingJobStore: Send + Sync {
    /// `input_hash` is UNIQUE on this table.
    async fn insert_job(&self, job: NettingJob) -> Result<InsertOutcome<NettingJob>, StorageError>;

    async fn get_by_input_hash(&self, input_hash: &str) -> Result<Option<NettingJob>, StorageError>;

    async fn update_job(&self, job: NettingJob) -> Result<(), StorageError>;
}

#[async_trait]
pub trait SealStore: Send + Sync {
    /// `target` is UNIQUE on this table.
    async fn issue_seal(&self, seal: Seal) -> Result<InsertOutcome<Seal>, StorageError>;

    async fn get_seal(&self, target: &str) -> Result<Option<Seal>, StorageError>;
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    async fn get_open_window(&self) -> Result<Option<IndexWindow>, StorageError>;

    async fn get_window(&self, window_id: &str) -> Result<Option<IndexWindow>, StorageError>;

    /// Fails with `StorageError::Conflict` if a window is already open.
    async fn create_window(&self, window: IndexWindow) -> Result<(), StorageError>;

    /// Most recently created window, open or closed — used to chain a new
    /// window's `previous_window_id`/`previous_root_hash`.
    async fn get_latest_window(&self) -> Result<Option<IndexWindow>, StorageError>;

    async fn append_leaf(&self, leaf: IndexLeaf) -> Result<(), StorageError>;

    async fn close_window(
        &self,
        window_id: &str,
        root_hash: String,
        closed_at_ms: i64,
        kernel_signature: String,
    ) -> Result<(), StorageError>;

    async fn list_leaves(&self, window_id: &str) -> Result<Vec<IndexLeaf>, StorageError>;

    async fn get_leaf(
        &self,
        window_id: &str,
        leaf_hash: &str,
    ) -> Result<Option<IndexLeaf>, StorageError>;
}

/// A precomputed inclusion proof cache is not required by the design — proofs
/// are derived on demand from a closed window's leaves — so there is no
/// separate proof-storage trait. `InclusionProof` values are constructed by
/// the index engine and never persisted.
pub type CacheableProof = InclusionProof;

/// Supertrait aggregating every logical table family. Backends implement
/// this once; every other crate depends only on `KernelStorage`.
pub trait KernelStorage:
    AgentStore
    + WalletStore
    + ReceiptStore
    + CreditLineStore
    + CollateralStore
    + MarginCallStore
    + AllocationStore
    + EscrowStore
    + NettingJobStore
    + SealStore
    + IndexStore
    + Send
    + Sync
{
}

impl<T> KernelStorage for T where
    T: AgentStore
        + WalletStore
        + ReceiptStore
        + CreditLineStore
        + CollateralStore
        + MarginCallStore
        + AllocationStore
        + EscrowStore
        + NettingJobStore
        + SealStore
        + IndexStore
        + Send
        + Sync
{
}

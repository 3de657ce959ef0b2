//! Clearing kernel facade: re-exports every component crate behind one
//! surface, mirroring `ibank-core/lib.rs`'s aggregator-crate shape so an
//! embedder depends on a single path instead of wiring eleven crates by hand.
//! Carries no logic of its own beyond re-exports; `KernelDispatcher` in
//! `ck-dispatch` is the actual entry point.

pub use ck_allocation::{
    AllocationEngine, AllocationError, AllocationFeeSchedule, AllocationOutcome, EscrowOutcome,
};
pub use ck_canon::{canonicalize, canonicalize_json, CanonicalValue, EncodingError};
pub use ck_credit::{CreditEngine, CreditError, CreditFeeSchedule, CreditOutcome};
pub use ck_crypto::{generate_keypair, hash, sign, verify, CryptoError};
pub use ck_dispatch::{
    CoverageReport, CreditPackOffer, KernelDispatcher, KernelError, SealOutcome, SettleOutcome,
    VerifyOutcome, SEAL_ISSUANCE_FEE_MICROS,
};
pub use ck_idempotency::{execute_idempotent, IdempotentOutcome};
pub use ck_index::{verify_proof, IndexEngine, IndexError, SubmitAck, WindowHead};
pub use ck_netting::{NettingEngine, NettingError, NettingOutcome, VerificationPolicy};
pub use ck_receipts::{fields, ReceiptError, ReceiptFactory};
pub use ck_reports::{ReportsConfig, ReportsEngine, ReportsError};
pub use ck_storage::{DeductOutcome, InMemoryKernelStorage, InsertOutcome, KernelStorage, StorageError};
pub use ck_types::{
    bps_of, Agent, AllocationRecord, CollateralAssetType, CollateralLock, CollateralStatus,
    CreditEventLogEntry, CreditLine, CreditLineStatus, CreditPosition, Escrow, EscrowStatus,
    IndexWindow, InclusionProof, MarginCall, MarginCallStatus, Micros, NettingJob,
    NettingJobStatus, ReceiptEnvelope, Seal, Wallet, WalletTransaction, WalletTransactionKind,
    USD,
};
pub use ck_wallet::{WalletError, WalletService};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a `tracing` subscriber reading `RUST_LOG` (falling back to
/// `default_level` when unset), in the same `EnvFilter` + fmt-layer shape
/// `palm-daemon` wires up at startup. An embedder that already has its own
/// subscriber should skip this and call `tracing::subscriber::set_global_default`
/// itself instead; this is a convenience for embedders that don't.
pub fn init_tracing(default_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

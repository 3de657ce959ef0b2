//! Storage collaborator for the clearing kernel.
//!
//! Defines one `#[async_trait]` per logical table family (agents, wallets,
//! receipts, credit lines, ...) plus the [`KernelStorage`] supertrait that
//! aggregates them. [`memory::InMemoryKernelStorage`] is the reference
//! backend used by tests and by deployments that don't need durability.
//! [`postgres::PostgresKernelStorage`] (behind the `postgres` feature) is the
//! durable backend.

pub mod error;
pub mod memory;
pub mod model;
pub mod traits;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::StorageError;
pub use memory::InMemoryKernelStorage;
pub use model::{DeductOutcome, InsertOutcome};
pub use traits::{
    AgentStore, AllocationStore, CollateralStore, CreditLineStore, EscrowStore, IndexStore,
    KernelStorage, MarginCallStore, NettingJobStore, ReceiptStore, SealStore, WalletStore,
};

#[cfg(feature = "postgres")]
pub use postgres::PostgresKernelStorage;

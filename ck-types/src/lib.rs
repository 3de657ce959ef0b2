//! Shared data model for the clearing kernel.
//!
//! These types are pure data: no storage, no crypto, no policy. Every other
//! crate in the workspace builds on top of this one.

pub mod agent;
pub mod allocation;
pub mod credit;
pub mod escrow;
pub mod index;
pub mod money;
pub mod netting;
pub mod receipt;
pub mod seal;
pub mod wallet;

pub use agent::Agent;
pub use allocation::AllocationRecord;
pub use credit::{CollateralAssetType, CollateralLock, CollateralStatus, CreditEventLogEntry, CreditLine, CreditLineStatus, CreditPosition, MarginCall, MarginCallStatus};
pub use escrow::{Escrow, EscrowStatus};
pub use index::{IndexLeaf, IndexWindow, InclusionProof, ProofDirection, ProofStep};
pub use money::{bps_of, Micros, USD};
pub use netting::{NettingJob, NettingJobStatus};
pub use receipt::ReceiptEnvelope;
pub use seal::Seal;
pub use wallet::{Wallet, WalletTransaction, WalletTransactionKind};

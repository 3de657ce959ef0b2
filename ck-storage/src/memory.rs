use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use ck_types::{
    Agent, AllocationRecord, CollateralLock, CollateralStatus, CreditEventLogEntry, CreditLine,
    CreditLineStatus, CreditPosition, Escrow, EscrowStatus, IndexLeaf, IndexWindow, MarginCall,
    MarginCallStatus, Micros, NettingJob, ReceiptEnvelope, Seal, Wallet, WalletTransaction,
    WalletTransactionKind,
};

use crate::error::StorageError;
use crate::model::{DeductOutcome, InsertOutcome};
use crate::traits::{
    AgentStore, AllocationStore, CollateralStore, CreditLineStore, EscrowStore, IndexStore,
    MarginCallStore, NettingJobStore, ReceiptStore, SealStore, WalletStore,
};

#[derive(Default)]
struct WalletRow {
    balance: Micros,
    transactions: Vec<WalletTransaction>,
}

#[derive(Default)]
struct FreeSettlementCounter {
    period_start_ms: i64,
    used: u32,
}

/// Reference storage backend: plain in-process maps guarded by `std::sync`
/// locks. Used for tests and for deployments that don't need durability
/// across process restarts.
#[derive(Default)]
pub struct InMemoryKernelStorage {
    agents: RwLock<HashMap<String, Agent>>,
    free_settlement: RwLock<HashMap<String, FreeSettlementCounter>>,
    wallets: RwLock<HashMap<String, WalletRow>>,
    receipts_by_hash: RwLock<HashMap<String, ReceiptEnvelope>>,
    receipts_by_request: RwLock<HashMap<String, String>>,
    credit_lines: RwLock<HashMap<String, CreditLine>>,
    credit_positions: RwLock<HashMap<String, CreditPosition>>,
    credit_events: RwLock<Vec<CreditEventLogEntry>>,
    credit_events_by_request: RwLock<HashMap<String, usize>>,
    collateral_locks: RwLock<HashMap<String, CollateralLock>>,
    margin_calls: RwLock<HashMap<String, MarginCall>>,
    allocations_by_request: RwLock<HashMap<String, AllocationRecord>>,
    escrows: RwLock<HashMap<String, Escrow>>,
    netting_jobs_by_input: RwLock<HashMap<String, NettingJob>>,
    seals_by_target: RwLock<HashMap<String, Seal>>,
    index_windows: RwLock<HashMap<String, IndexWindow>>,
    open_window_id: RwLock<Option<String>>,
    index_leaves: RwLock<HashMap<String, Vec<IndexLeaf>>>,
    window_sequence: RwLock<Vec<String>>,
}

impl InMemoryKernelStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(what: &str) -> StorageError {
    StorageError::lock_poisoned(what)
}

#[async_trait]
impl AgentStore for InMemoryKernelStorage {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StorageError> {
        let agents = self.agents.read().map_err(|_| poisoned("agents"))?;
        Ok(agents.get(agent_id).cloned())
    }

    async fn put_agent(&self, agent: Agent) -> Result<(), StorageError> {
        let mut agents = self.agents.write().map_err(|_| poisoned("agents"))?;
        agents.insert(agent.agent_id.clone(), agent);
        Ok(())
    }

    async fn record_settlement_volume(
        &self,
        agent_id: &str,
        amount: Micros,
    ) -> Result<(), StorageError> {
        let mut agents = self.agents.write().map_err(|_| poisoned("agents"))?;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| StorageError::NotFound(format!("agent {agent_id}")))?;
        agent.lifetime_volume_micros += amount;
        Ok(())
    }

    async fn increment_free_settlement(
        &self,
        agent_id: &str,
        period_start_ms: i64,
    ) -> Result<u32, StorageError> {
        let mut counters = self
            .free_settlement
            .write()
            .map_err(|_| poisoned("free_settlement"))?;
        let counter = counters.entry(agent_id.to_string()).or_default();
        if counter.period_start_ms != period_start_ms {
            counter.period_start_ms = period_start_ms;
            counter.used = 0;
        }
        counter.used += 1;
        Ok(counter.used)
    }
}

#[async_trait]
impl WalletStore for InMemoryKernelStorage {
    async fn get_balance(&self, wallet_id: &str) -> Result<Micros, StorageError> {
        let wallets = self.wallets.read().map_err(|_| poisoned("wallets"))?;
        Ok(wallets.get(wallet_id).map(|w| w.balance).unwrap_or(0))
    }

    async fn get_wallet(&self, wallet_id: &str) -> Result<Option<Wallet>, StorageError> {
        let wallets = self.wallets.read().map_err(|_| poisoned("wallets"))?;
        Ok(wallets.get(wallet_id).map(|w| Wallet {
            wallet_id: wallet_id.to_string(),
            balance_micros: w.balance,
        }))
    }

    async fn credit(
        &self,
        wallet_id: &str,
        amount: Micros,
        kind: WalletTransactionKind,
        reference_type: &str,
        reference: &str,
    ) -> Result<WalletTransaction, StorageError> {
        if amount <= 0 {
            return Err(StorageError::InvalidInput(
                "credit amount must be > 0".into(),
            ));
        }
        let mut wallets = self.wallets.write().map_err(|_| poisoned("wallets"))?;
        let row = wallets.entry(wallet_id.to_string()).or_default();
        row.balance += amount;
        let transaction = WalletTransaction {
            entry_id: uuid::Uuid::new_v4().to_string(),
            wallet_id: wallet_id.to_string(),
            kind,
            amount_micros: amount,
            reference_type: reference_type.to_string(),
            reference: reference.to_string(),
            balance_after_micros: row.balance,
            timestamp: chrono::Utc::now(),
        };
        row.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn deduct(
        &self,
        wallet_id: &str,
        amount: Micros,
        reference_type: &str,
        reference: &str,
    ) -> Result<DeductOutcome, StorageError> {
        if amount <= 0 {
            return Err(StorageError::InvalidInput(
                "deduct amount must be > 0".into(),
            ));
        }
        let mut wallets = self.wallets.write().map_err(|_| poisoned("wallets"))?;
        let row = wallets.entry(wallet_id.to_string()).or_default();
        if row.balance < amount {
            return Ok(DeductOutcome::InsufficientFunds {
                current_balance: row.balance,
            });
        }
        row.balance -= amount;
        let transaction = WalletTransaction {
            entry_id: uuid::Uuid::new_v4().to_string(),
            wallet_id: wallet_id.to_string(),
            kind: WalletTransactionKind::Deduct,
            amount_micros: amount,
            reference_type: reference_type.to_string(),
            reference: reference.to_string(),
            balance_after_micros: row.balance,
            timestamp: chrono::Utc::now(),
        };
        row.transactions.push(transaction.clone());
        Ok(DeductOutcome::Applied {
            balance_after: row.balance,
            transaction,
        })
    }

    async fn transfer_with_fee(
        &self,
        from_wallet: &str,
        to_wallet: &str,
        fee_wallet: &str,
        amount: Micros,
        fee: Micros,
        reference_type: &str,
        reference: &str,
    ) -> Result<DeductOutcome, StorageError> {
        if amount <= 0 {
            return Err(StorageError::InvalidInput(
                "transfer amount must be > 0".into(),
            ));
        }
        let total = amount + fee;
        let mut wallets = self.wallets.write().map_err(|_| poisoned("wallets"))?;

        let from_balance = wallets.get(from_wallet).map(|w| w.balance).unwrap_or(0);
        if from_balance < total {
            return Ok(DeductOutcome::InsufficientFunds {
                current_balance: from_balance,
            });
        }

        let from_row = wallets.entry(from_wallet.to_string()).or_default();
        from_row.balance -= total;
        let deduct_txn = WalletTransaction {
            entry_id: uuid::Uuid::new_v4().to_string(),
            wallet_id: from_wallet.to_string(),
            kind: WalletTransactionKind::Deduct,
            amount_micros: total,
            reference_type: reference_type.to_string(),
            reference: reference.to_string(),
            balance_after_micros: from_row.balance,
            timestamp: chrono::Utc::now(),
        };
        from_row.transactions.push(deduct_txn.clone());

        let to_row = wallets.entry(to_wallet.to_string()).or_default();
        to_row.balance += amount;
        to_row.transactions.push(WalletTransaction {
            entry_id: uuid::Uuid::new_v4().to_string(),
            wallet_id: to_wallet.to_string(),
            kind: WalletTransactionKind::Credit,
            amount_micros: amount,
            reference_type: reference_type.to_string(),
            reference: reference.to_string(),
            balance_after_micros: to_row.balance,
            timestamp: chrono::Utc::now(),
        });

        if fee > 0 {
            let fee_row = wallets.entry(fee_wallet.to_string()).or_default();
            fee_row.balance += fee;
            fee_row.transactions.push(WalletTransaction {
                entry_id: uuid::Uuid::new_v4().to_string(),
                wallet_id: fee_wallet.to_string(),
                kind: WalletTransactionKind::Credit,
                amount_micros: fee,
                reference_type: reference_type.to_string(),
                reference: format!("{reference}_fee"),
                balance_after_micros: fee_row.balance,
                timestamp: chrono::Utc::now(),
            });
        }

        Ok(DeductOutcome::Applied {
            balance_after: deduct_txn.balance_after_micros,
            transaction: deduct_txn,
        })
    }

    async fn list_transactions(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<WalletTransaction>, StorageError> {
        let wallets = self.wallets.read().map_err(|_| poisoned("wallets"))?;
        Ok(wallets
            .get(wallet_id)
            .map(|w| w.transactions.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ReceiptStore for InMemoryKernelStorage {
    async fn insert_receipt(
        &self,
        receipt: ReceiptEnvelope,
    ) -> Result<InsertOutcome<ReceiptEnvelope>, StorageError> {
        let mut by_request = self
            .receipts_by_request
            .write()
            .map_err(|_| poisoned("receipts_by_request"))?;
        if let Some(existing_hash) = by_request.get(&receipt.request_hash) {
            let by_hash = self
                .receipts_by_hash
                .read()
                .map_err(|_| poisoned("receipts_by_hash"))?;
            let existing = by_hash
                .get(existing_hash)
                .cloned()
                .ok_or_else(|| StorageError::Backend("dangling request_hash index".into()))?;
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        let mut by_hash = self
            .receipts_by_hash
            .write()
            .map_err(|_| poisoned("receipts_by_hash"))?;
        by_request.insert(receipt.request_hash.clone(), receipt.receipt_hash.clone());
        by_hash.insert(receipt.receipt_hash.clone(), receipt.clone());
        Ok(InsertOutcome::Inserted(receipt))
    }

    async fn get_by_hash(&self, receipt_hash: &str) -> Result<Option<ReceiptEnvelope>, StorageError> {
        let by_hash = self
            .receipts_by_hash
            .read()
            .map_err(|_| poisoned("receipts_by_hash"))?;
        Ok(by_hash.get(receipt_hash).cloned())
    }

    async fn get_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<ReceiptEnvelope>, StorageError> {
        let by_request = self
            .receipts_by_request
            .read()
            .map_err(|_| poisoned("receipts_by_request"))?;
        let Some(receipt_hash) = by_request.get(request_hash) else {
            return Ok(None);
        };
        let by_hash = self
            .receipts_by_hash
            .read()
            .map_err(|_| poisoned("receipts_by_hash"))?;
        Ok(by_hash.get(receipt_hash).cloned())
    }
}

#[async_trait]
impl CreditLineStore for InMemoryKernelStorage {
    async fn get_line(&self, credit_line_id: &str) -> Result<Option<CreditLine>, StorageError> {
        let lines = self.credit_lines.read().map_err(|_| poisoned("credit_lines"))?;
        Ok(lines.get(credit_line_id).cloned())
    }

    async fn get_position(
        &self,
        credit_line_id: &str,
    ) -> Result<Option<CreditPosition>, StorageError> {
        let positions = self
            .credit_positions
            .read()
            .map_err(|_| poisoned("credit_positions"))?;
        Ok(positions.get(credit_line_id).cloned())
    }

    async fn open_line(
        &self,
        line: CreditLine,
        position: CreditPosition,
    ) -> Result<(), StorageError> {
        let mut lines = self.credit_lines.write().map_err(|_| poisoned("credit_lines"))?;
        let mut positions = self
            .credit_positions
            .write()
            .map_err(|_| poisoned("credit_positions"))?;
        if lines.contains_key(&line.credit_line_id) {
            return Err(StorageError::Conflict(format!(
                "credit line {} already exists",
                line.credit_line_id
            )));
        }
        positions.insert(line.credit_line_id.clone(), position);
        lines.insert(line.credit_line_id.clone(), line);
        Ok(())
    }

    async fn update_line_status(
        &self,
        credit_line_id: &str,
        status: CreditLineStatus,
    ) -> Result<(), StorageError> {
        let mut lines = self.credit_lines.write().map_err(|_| poisoned("credit_lines"))?;
        let line = lines
            .get_mut(credit_line_id)
            .ok_or_else(|| StorageError::NotFound(format!("credit line {credit_line_id}")))?;
        line.status = status;
        Ok(())
    }

    async fn update_position(
        &self,
        credit_line_id: &str,
        position: CreditPosition,
    ) -> Result<(), StorageError> {
        let mut positions = self
            .credit_positions
            .write()
            .map_err(|_| poisoned("credit_positions"))?;
        if !positions.contains_key(credit_line_id) {
            return Err(StorageError::NotFound(format!(
                "credit position {credit_line_id}"
            )));
        }
        positions.insert(credit_line_id.to_string(), position);
        Ok(())
    }

    async fn append_event(
        &self,
        event: CreditEventLogEntry,
    ) -> Result<InsertOutcome<CreditEventLogEntry>, StorageError> {
        let mut by_request = self
            .credit_events_by_request
            .write()
            .map_err(|_| poisoned("credit_events_by_request"))?;
        if let Some(&idx) = by_request.get(&event.request_hash) {
            let events = self
                .credit_events
                .read()
                .map_err(|_| poisoned("credit_events"))?;
            return Ok(InsertOutcome::AlreadyExists(events[idx].clone()));
        }
        let mut events = self
            .credit_events
            .write()
            .map_err(|_| poisoned("credit_events"))?;
        let idx = events.len();
        by_request.insert(event.request_hash.clone(), idx);
        events.push(event.clone());
        Ok(InsertOutcome::Inserted(event))
    }

    async fn get_event_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<CreditEventLogEntry>, StorageError> {
        let by_request = self
            .credit_events_by_request
            .read()
            .map_err(|_| poisoned("credit_events_by_request"))?;
        let events = self
            .credit_events
            .read()
            .map_err(|_| poisoned("credit_events"))?;
        Ok(by_request.get(request_hash).map(|&idx| events[idx].clone()))
    }

    async fn list_events(
        &self,
        credit_line_id: &str,
    ) -> Result<Vec<CreditEventLogEntry>, StorageError> {
        let events = self
            .credit_events
            .read()
            .map_err(|_| poisoned("credit_events"))?;
        Ok(events
            .iter()
            .filter(|e| e.credit_line_id == credit_line_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CollateralStore for InMemoryKernelStorage {
    async fn lock_collateral(&self, lock: CollateralLock) -> Result<(), StorageError> {
        let mut locks = self
            .collateral_locks
            .write()
            .map_err(|_| poisoned("collateral_locks"))?;
        locks.insert(lock.lock_id.clone(), lock);
        Ok(())
    }

    async fn get_lock(&self, lock_id: &str) -> Result<Option<CollateralLock>, StorageError> {
        let locks = self
            .collateral_locks
            .read()
            .map_err(|_| poisoned("collateral_locks"))?;
        Ok(locks.get(lock_id).cloned())
    }

    async fn update_lock_status(
        &self,
        lock_id: &str,
        status: CollateralStatus,
    ) -> Result<(), StorageError> {
        let mut locks = self
            .collateral_locks
            .write()
            .map_err(|_| poisoned("collateral_locks"))?;
        let lock = locks
            .get_mut(lock_id)
            .ok_or_else(|| StorageError::NotFound(format!("collateral lock {lock_id}")))?;
        lock.status = status;
        Ok(())
    }

    async fn list_locked_for_line(
        &self,
        credit_line_id: &str,
    ) -> Result<Vec<CollateralLock>, StorageError> {
        let locks = self
            .collateral_locks
            .read()
            .map_err(|_| poisoned("collateral_locks"))?;
        Ok(locks
            .values()
            .filter(|l| l.credit_line_id == credit_line_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MarginCallStore for InMemoryKernelStorage {
    async fn create_margin_call(&self, call: MarginCall) -> Result<(), StorageError> {
        let mut calls = self.margin_calls.write().map_err(|_| poisoned("margin_calls"))?;
        calls.insert(call.margin_call_id.clone(), call);
        Ok(())
    }

    async fn get_margin_call(&self, margin_call_id: &str) -> Result<Option<MarginCall>, StorageError> {
        let calls = self.margin_calls.read().map_err(|_| poisoned("margin_calls"))?;
        Ok(calls.get(margin_call_id).cloned())
    }

    async fn update_margin_call_status(
        &self,
        margin_call_id: &str,
        status: MarginCallStatus,
        resolved_ts_ms: Option<i64>,
    ) -> Result<(), StorageError> {
        let mut calls = self.margin_calls.write().map_err(|_| poisoned("margin_calls"))?;
        let call = calls
            .get_mut(margin_call_id)
            .ok_or_else(|| StorageError::NotFound(format!("margin call {margin_call_id}")))?;
        call.status = status;
        if resolved_ts_ms.is_some() {
            call.resolved_ts_ms = resolved_ts_ms;
        }
        Ok(())
    }
}

#[async_trait]
impl AllocationStore for InMemoryKernelStorage {
    async fn insert_allocation(
        &self,
        record: AllocationRecord,
    ) -> Result<InsertOutcome<AllocationRecord>, StorageError> {
        let mut allocations = self
            .allocations_by_request
            .write()
            .map_err(|_| poisoned("allocations_by_request"))?;
        if let Some(existing) = allocations.get(&record.request_hash) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        allocations.insert(record.request_hash.clone(), record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn get_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        let allocations = self
            .allocations_by_request
            .read()
            .map_err(|_| poisoned("allocations_by_request"))?;
        Ok(allocations.get(request_hash).cloned())
    }

    async fn list_for_wallet(&self, wallet_id: &str) -> Result<Vec<AllocationRecord>, StorageError> {
        let allocations = self
            .allocations_by_request
            .read()
            .map_err(|_| poisoned("allocations_by_request"))?;
        Ok(allocations
            .values()
            .filter(|a| a.from_wallet == wallet_id || a.to_wallet == wallet_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EscrowStore for InMemoryKernelStorage {
    async fn create_escrow(&self, escrow: Escrow) -> Result<(), StorageError> {
        let mut escrows = self.escrows.write().map_err(|_| poisoned("escrows"))?;
        escrows.insert(escrow.escrow_id.clone(), escrow);
        Ok(())
    }

    async fn get_escrow(&self, escrow_id: &str) -> Result<Option<Escrow>, StorageError> {
        let escrows = self.escrows.read().map_err(|_| poisoned("escrows"))?;
        Ok(escrows.get(escrow_id).cloned())
    }

    async fn update_escrow_status(
        &self,
        escrow_id: &str,
        status: EscrowStatus,
    ) -> Result<(), StorageError> {
        let mut escrows = self.escrows.write().map_err(|_| poisoned("escrows"))?;
        let escrow = escrows
            .get_mut(escrow_id)
            .ok_or_else(|| StorageError::NotFound(format!("escrow {escrow_id}")))?;
        escrow.status = status;
        Ok(())
    }
}

#[async_trait]
impl NettingJobStore for InMemoryKernelStorage {
    async fn insert_job(&self, job: NettingJob) -> Result<InsertOutcome<NettingJob>, StorageError> {
        let mut jobs = self
            .netting_jobs_by_input
            .write()
            .map_err(|_| poisoned("netting_jobs_by_input"))?;
        if let Some(existing) = jobs.get(&job.input_hash) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        jobs.insert(job.input_hash.clone(), job.clone());
        Ok(InsertOutcome::Inserted(job))
    }

    async fn get_by_input_hash(&self, input_hash: &str) -> Result<Option<NettingJob>, StorageError> {
        let jobs = self
            .netting_jobs_by_input
            .read()
            .map_err(|_| poisoned("netting_jobs_by_input"))?;
        Ok(jobs.get(input_hash).cloned())
    }

    async fn update_job(&self, job: NettingJob) -> Result<(), StorageError> {
        let mut jobs = self
            .netting_jobs_by_input
            .write()
            .map_err(|_| poisoned("netting_jobs_by_input"))?;
        if !jobs.contains_key(&job.input_hash) {
            return Err(StorageError::NotFound(format!(
                "netting job {}",
                job.input_hash
            )));
        }
        jobs.insert(job.input_hash.clone(), job);
        Ok(())
    }
}

#[async_trait]
impl SealStore for InMemoryKernelStorage {
    async fn issue_seal(&self, seal: Seal) -> Result<InsertOutcome<Seal>, StorageError> {
        let mut seals = self
            .seals_by_target
            .write()
            .map_err(|_| poisoned("seals_by_target"))?;
        if let Some(existing) = seals.get(&seal.target) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        seals.insert(seal.target.clone(), seal.clone());
        Ok(InsertOutcome::Inserted(seal))
    }

    async fn get_seal(&self, target: &str) -> Result<Option<Seal>, StorageError> {
        let seals = self
            .seals_by_target
            .read()
            .map_err(|_| poisoned("seals_by_target"))?;
        Ok(seals.get(target).cloned())
    }
}

#[async_trait]
impl IndexStore for InMemoryKernelStorage {
    async fn get_open_window(&self) -> Result<Option<IndexWindow>, StorageError> {
        let open_id = self
            .open_window_id
            .read()
            .map_err(|_| poisoned("open_window_id"))?
            .clone();
        let Some(id) = open_id else { return Ok(None) };
        let windows = self.index_windows.read().map_err(|_| poisoned("index_windows"))?;
        Ok(windows.get(&id).cloned())
    }

    async fn get_window(&self, window_id: &str) -> Result<Option<IndexWindow>, StorageError> {
        let windows = self.index_windows.read().map_err(|_| poisoned("index_windows"))?;
        Ok(windows.get(window_id).cloned())
    }

    async fn create_window(&self, window: IndexWindow) -> Result<(), StorageError> {
        let mut open_id = self
            .open_window_id
            .write()
            .map_err(|_| poisoned("open_window_id"))?;
        if open_id.is_some() {
            return Err(StorageError::Conflict(
                "a window is already open".into(),
            ));
        }
        let mut windows = self.index_windows.write().map_err(|_| poisoned("index_windows"))?;
        let mut sequence = self.window_sequence.write().map_err(|_| poisoned("window_sequence"))?;
        *open_id = Some(window.window_id.clone());
        sequence.push(window.window_id.clone());
        windows.insert(window.window_id.clone(), window);
        Ok(())
    }

    async fn get_latest_window(&self) -> Result<Option<IndexWindow>, StorageError> {
        let sequence = self.window_sequence.read().map_err(|_| poisoned("window_sequence"))?;
        let Some(latest_id) = sequence.last() else { return Ok(None) };
        let windows = self.index_windows.read().map_err(|_| poisoned("index_windows"))?;
        Ok(windows.get(latest_id).cloned())
    }

    async fn append_leaf(&self, leaf: IndexLeaf) -> Result<(), StorageError> {
        let mut windows = self.index_windows.write().map_err(|_| poisoned("index_windows"))?;
        let window = windows
            .get_mut(&leaf.window_id)
            .ok_or_else(|| StorageError::NotFound(format!("index window {}", leaf.window_id)))?;
        if !window.is_open() {
            return Err(StorageError::InvariantViolation(format!(
                "window {} is closed",
                leaf.window_id
            )));
        }
        window.leaf_count += 1;
        let mut leaves = self.index_leaves.write().map_err(|_| poisoned("index_leaves"))?;
        leaves.entry(leaf.window_id.clone()).or_default().push(leaf);
        Ok(())
    }

    async fn close_window(
        &self,
        window_id: &str,
        root_hash: String,
        closed_at_ms: i64,
        kernel_signature: String,
    ) -> Result<(), StorageError> {
        let mut open_id = self
            .open_window_id
            .write()
            .map_err(|_| poisoned("open_window_id"))?;
        let mut windows = self.index_windows.write().map_err(|_| poisoned("index_windows"))?;
        let window = windows
            .get_mut(window_id)
            .ok_or_else(|| StorageError::NotFound(format!("index window {window_id}")))?;
        window.closed_at_ms = Some(closed_at_ms);
        window.root_hash = Some(root_hash);
        window.kernel_signature = Some(kernel_signature);
        if open_id.as_deref() == Some(window_id) {
            *open_id = None;
        }
        Ok(())
    }

    async fn list_leaves(&self, window_id: &str) -> Result<Vec<IndexLeaf>, StorageError> {
        let leaves = self.index_leaves.read().map_err(|_| poisoned("index_leaves"))?;
        Ok(leaves.get(window_id).cloned().unwrap_or_default())
    }

    async fn get_leaf(
        &self,
        window_id: &str,
        leaf_hash: &str,
    ) -> Result<Option<IndexLeaf>, StorageError> {
        let leaves = self.index_leaves.read().map_err(|_| poisoned("index_leaves"))?;
        Ok(leaves
            .get(window_id)
            .and_then(|ls| ls.iter().find(|l| l.leaf_hash == leaf_hash).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deduct_is_atomic_and_rejects_insufficient_funds() {
        let storage = InMemoryKernelStorage::new();
        storage
            .credit("agent-a", 100, WalletTransactionKind::Credit, "test", "seed")
            .await
            .unwrap();
        let outcome = storage.deduct("agent-a", 150, "test", "over").await.unwrap();
        assert!(matches!(outcome, DeductOutcome::InsufficientFunds { current_balance: 100 }));
        assert_eq!(storage.get_balance("agent-a").await.unwrap(), 100);

        let outcome = storage.deduct("agent-a", 40, "test", "ok").await.unwrap();
        assert!(matches!(outcome, DeductOutcome::Applied { balance_after: 60, .. }));
    }

    #[tokio::test]
    async fn receipt_request_hash_dedup() {
        let storage = InMemoryKernelStorage::new();
        let receipt = ReceiptEnvelope {
            receipt_hash: "h1".into(),
            kernel_signature: "s1".into(),
            receipt_type: "msr".into(),
            issuer: "clearing-kernel".into(),
            kernel_pubkey: "pk".into(),
            timestamp_ms: 1,
            request_hash: "r1".into(),
            payload: serde_json::json!({}),
        };
        let first = storage.insert_receipt(receipt.clone()).await.unwrap();
        assert!(first.was_inserted());
        let second = storage.insert_receipt(receipt).await.unwrap();
        assert!(!second.was_inserted());
    }

    #[tokio::test]
    async fn index_window_rejects_second_concurrent_open() {
        let storage = InMemoryKernelStorage::new();
        let window = IndexWindow {
            window_id: "w1".into(),
            previous_window_id: None,
            previous_root_hash: None,
            opened_at_ms: 0,
            closed_at_ms: None,
            leaf_count: 0,
            root_hash: None,
            kernel_signature: None,
        };
        storage.create_window(window).await.unwrap();
        let second = IndexWindow {
            window_id: "w2".into(),
            previous_window_id: Some("w1".into()),
            previous_root_hash: None,
            opened_at_ms: 1,
            closed_at_ms: None,
            leaf_count: 0,
            root_hash: None,
            kernel_signature: None,
        };
        assert!(storage.create_window(second).await.is_err());
    }
}

//! Durable Postgres backend. Mirrors the in-memory reference backend
//! field-for-field; every logical table from the persisted-state layout gets
//! its own physical table, with structured columns for anything queried by
//! key and a `JSONB` column for payload-shaped data.

use async_trait::async_trait;
use ck_types::{
    Agent, AllocationRecord, CollateralAssetType, CollateralLock, CollateralStatus,
    CreditEventLogEntry, CreditLine, CreditLineStatus, CreditPosition, Escrow, EscrowStatus,
    IndexLeaf, IndexWindow, MarginCall, MarginCallStatus, Micros, NettingJob, NettingJobStatus,
    ReceiptEnvelope, Seal, Wallet, WalletTransaction, WalletTransactionKind,
};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::error::StorageError;
use crate::model::{DeductOutcome, InsertOutcome};
use crate::traits::{
    AgentStore, AllocationStore, CollateralStore, CreditLineStore, EscrowStore, IndexStore,
    MarginCallStore, NettingJobStore, ReceiptStore, SealStore, WalletStore,
};

pub struct PostgresKernelStorage {
    pool: PgPool,
}

impl PostgresKernelStorage {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("connect: {e}")))?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS ck_agents (
                agent_id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                pubkey_hex TEXT NOT NULL,
                lifetime_volume_micros BIGINT NOT NULL,
                free_settlements_used INT NOT NULL,
                free_settlements_period_start_ms BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_wallets (
                wallet_id TEXT PRIMARY KEY,
                balance_micros BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_wallet_transactions (
                entry_id TEXT PRIMARY KEY,
                wallet_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount_micros BIGINT NOT NULL,
                reference_type TEXT NOT NULL,
                reference TEXT NOT NULL,
                balance_after_micros BIGINT NOT NULL,
                ts TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS ck_wallet_transactions_wallet_idx
                ON ck_wallet_transactions (wallet_id)",
            "CREATE TABLE IF NOT EXISTS ck_receipts (
                receipt_hash TEXT PRIMARY KEY,
                receipt_type TEXT NOT NULL,
                issuer TEXT NOT NULL,
                kernel_pubkey TEXT NOT NULL,
                timestamp_ms BIGINT NOT NULL,
                request_hash TEXT NOT NULL UNIQUE,
                kernel_signature TEXT NOT NULL,
                payload JSONB NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_credit_lines (
                credit_line_id TEXT PRIMARY KEY,
                borrower TEXT NOT NULL,
                lender TEXT NOT NULL,
                limit_micros BIGINT NOT NULL,
                spread_bps INT NOT NULL,
                maturity_ts_ms BIGINT,
                collateral_ratio_min_bps INT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_credit_positions (
                credit_line_id TEXT PRIMARY KEY,
                principal_micros BIGINT NOT NULL,
                interest_accrued_micros BIGINT NOT NULL,
                fees_micros BIGINT NOT NULL,
                last_accrual_ts_ms BIGINT,
                last_accrual_window TEXT
            )",
            "CREATE TABLE IF NOT EXISTS ck_credit_events (
                id BIGSERIAL PRIMARY KEY,
                credit_line_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                receipt_hash TEXT NOT NULL,
                request_hash TEXT NOT NULL UNIQUE,
                delta_principal_micros BIGINT NOT NULL,
                delta_interest_micros BIGINT NOT NULL,
                delta_fees_micros BIGINT NOT NULL,
                ts TIMESTAMPTZ NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS ck_credit_events_line_idx
                ON ck_credit_events (credit_line_id)",
            "CREATE TABLE IF NOT EXISTS ck_collateral_locks (
                lock_id TEXT PRIMARY KEY,
                credit_line_id TEXT NOT NULL,
                asset_ref TEXT NOT NULL,
                asset_type TEXT NOT NULL,
                amount_micros BIGINT NOT NULL,
                status TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_margin_calls (
                margin_call_id TEXT PRIMARY KEY,
                credit_line_id TEXT NOT NULL,
                required_amount_micros BIGINT NOT NULL,
                due_ts_ms BIGINT NOT NULL,
                status TEXT NOT NULL,
                resolved_ts_ms BIGINT
            )",
            "CREATE TABLE IF NOT EXISTS ck_allocations (
                allocation_id TEXT PRIMARY KEY,
                from_wallet TEXT NOT NULL,
                to_wallet TEXT NOT NULL,
                amount_micros BIGINT NOT NULL,
                fee_micros BIGINT NOT NULL,
                fee_bps INT NOT NULL,
                window_id TEXT,
                request_hash TEXT NOT NULL UNIQUE,
                receipt_hash TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_escrows (
                escrow_id TEXT PRIMARY KEY,
                buyer TEXT NOT NULL,
                seller TEXT NOT NULL,
                amount_micros BIGINT NOT NULL,
                description TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_netting_jobs (
                job_id TEXT PRIMARY KEY,
                agent TEXT NOT NULL,
                input_hash TEXT NOT NULL UNIQUE,
                receipt_hashes JSONB NOT NULL,
                status TEXT NOT NULL,
                ian_payload JSONB,
                fee_charged_micros BIGINT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_seals (
                target TEXT PRIMARY KEY,
                conformance_hash TEXT NOT NULL,
                issued_at TIMESTAMPTZ NOT NULL,
                receipt_hash TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS ck_index_windows (
                window_id TEXT PRIMARY KEY,
                previous_window_id TEXT,
                previous_root_hash TEXT,
                opened_at_ms BIGINT NOT NULL,
                closed_at_ms BIGINT,
                leaf_count BIGINT NOT NULL,
                root_hash TEXT,
                kernel_signature TEXT
            )",
            "CREATE TABLE IF NOT EXISTS ck_index_leaves (
                window_id TEXT NOT NULL,
                position BIGINT NOT NULL,
                leaf_type TEXT NOT NULL,
                payload_hash TEXT NOT NULL,
                leaf_hash TEXT NOT NULL,
                submitted_at_ms BIGINT NOT NULL,
                PRIMARY KEY (window_id, position)
            )",
            "CREATE TABLE IF NOT EXISTS ck_free_settlement_counters (
                agent_id TEXT PRIMARY KEY,
                period_start_ms BIGINT NOT NULL,
                used INT NOT NULL
            )",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("ensure_schema: {e}")))?;
        }
        Ok(())
    }
}

fn backend_err(context: &str, e: sqlx::Error) -> StorageError {
    StorageError::Backend(format!("{context}: {e}"))
}

fn status_str(status: CreditLineStatus) -> &'static str {
    match status {
        CreditLineStatus::Active => "active",
        CreditLineStatus::Suspended => "suspended",
        CreditLineStatus::Closed => "closed",
        CreditLineStatus::Liquidated => "liquidated",
    }
}

fn parse_line_status(s: &str) -> Result<CreditLineStatus, StorageError> {
    match s {
        "active" => Ok(CreditLineStatus::Active),
        "suspended" => Ok(CreditLineStatus::Suspended),
        "closed" => Ok(CreditLineStatus::Closed),
        "liquidated" => Ok(CreditLineStatus::Liquidated),
        other => Err(StorageError::Serialization(format!(
            "unknown credit line status {other}"
        ))),
    }
}

fn collateral_asset_str(kind: CollateralAssetType) -> &'static str {
    match kind {
        CollateralAssetType::Ian => "ian",
        CollateralAssetType::Msr => "msr",
        CollateralAssetType::Fc => "fc",
        CollateralAssetType::External => "external",
    }
}

fn parse_collateral_asset(s: &str) -> Result<CollateralAssetType, StorageError> {
    match s {
        "ian" => Ok(CollateralAssetType::Ian),
        "msr" => Ok(CollateralAssetType::Msr),
        "fc" => Ok(CollateralAssetType::Fc),
        "external" => Ok(CollateralAssetType::External),
        other => Err(StorageError::Serialization(format!(
            "unknown collateral asset type {other}"
        ))),
    }
}

fn collateral_status_str(status: CollateralStatus) -> &'static str {
    match status {
        CollateralStatus::Locked => "locked",
        CollateralStatus::Unlocked => "unlocked",
        CollateralStatus::Liquidated => "liquidated",
    }
}

fn parse_collateral_status(s: &str) -> Result<CollateralStatus, StorageError> {
    match s {
        "locked" => Ok(CollateralStatus::Locked),
        "unlocked" => Ok(CollateralStatus::Unlocked),
        "liquidated" => Ok(CollateralStatus::Liquidated),
        other => Err(StorageError::Serialization(format!(
            "unknown collateral status {other}"
        ))),
    }
}

fn margin_status_str(status: MarginCallStatus) -> &'static str {
    match status {
        MarginCallStatus::Pending => "pending",
        MarginCallStatus::Resolved => "resolved",
        MarginCallStatus::Escalated => "escalated",
        MarginCallStatus::Liquidated => "liquidated",
    }
}

fn parse_margin_status(s: &str) -> Result<MarginCallStatus, StorageError> {
    match s {
        "pending" => Ok(MarginCallStatus::Pending),
        "resolved" => Ok(MarginCallStatus::Resolved),
        "escalated" => Ok(MarginCallStatus::Escalated),
        "liquidated" => Ok(MarginCallStatus::Liquidated),
        other => Err(StorageError::Serialization(format!(
            "unknown margin call status {other}"
        ))),
    }
}

fn escrow_status_str(status: EscrowStatus) -> &'static str {
    match status {
        EscrowStatus::Locked => "locked",
        EscrowStatus::Released => "released",
        EscrowStatus::Disputed => "disputed",
        EscrowStatus::Expired => "expired",
    }
}

fn parse_escrow_status(s: &str) -> Result<EscrowStatus, StorageError> {
    match s {
        "locked" => Ok(EscrowStatus::Locked),
        "released" => Ok(EscrowStatus::Released),
        "disputed" => Ok(EscrowStatus::Disputed),
        "expired" => Ok(EscrowStatus::Expired),
        other => Err(StorageError::Serialization(format!(
            "unknown escrow status {other}"
        ))),
    }
}

fn netting_status_str(status: NettingJobStatus) -> &'static str {
    match status {
        NettingJobStatus::Pending => "pending",
        NettingJobStatus::Completed => "completed",
        NettingJobStatus::Failed => "failed",
    }
}

fn parse_netting_status(s: &str) -> Result<NettingJobStatus, StorageError> {
    match s {
        "pending" => Ok(NettingJobStatus::Pending),
        "completed" => Ok(NettingJobStatus::Completed),
        "failed" => Ok(NettingJobStatus::Failed),
        other => Err(StorageError::Serialization(format!(
            "unknown netting job status {other}"
        ))),
    }
}

fn wallet_kind_str(kind: WalletTransactionKind) -> &'static str {
    match kind {
        WalletTransactionKind::Credit => "credit",
        WalletTransactionKind::Deduct => "deduct",
    }
}

fn parse_wallet_kind(s: &str) -> Result<WalletTransactionKind, StorageError> {
    match s {
        "credit" => Ok(WalletTransactionKind::Credit),
        "deduct" => Ok(WalletTransactionKind::Deduct),
        other => Err(StorageError::Serialization(format!(
            "unknown wallet transaction kind {other}"
        ))),
    }
}

#[async_trait]
impl AgentStore for PostgresKernelStorage {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StorageError> {
        let row = sqlx::query(
            "SELECT agent_id, display_name, pubkey_hex, lifetime_volume_micros,
                    free_settlements_used, free_settlements_period_start_ms, created_at
             FROM ck_agents WHERE agent_id = $1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_agent", e))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Agent {
            agent_id: row.try_get("agent_id").map_err(|e| backend_err("agent_id", e))?,
            display_name: row
                .try_get("display_name")
                .map_err(|e| backend_err("display_name", e))?,
            pubkey_hex: row
                .try_get("pubkey_hex")
                .map_err(|e| backend_err("pubkey_hex", e))?,
            lifetime_volume_micros: row
                .try_get("lifetime_volume_micros")
                .map_err(|e| backend_err("lifetime_volume_micros", e))?,
            free_settlements_used: row
                .try_get::<i32, _>("free_settlements_used")
                .map_err(|e| backend_err("free_settlements_used", e))? as u32,
            free_settlements_period_start_ms: row
                .try_get("free_settlements_period_start_ms")
                .map_err(|e| backend_err("free_settlements_period_start_ms", e))?,
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .map_err(|e| backend_err("created_at", e))?,
        }))
    }

    async fn put_agent(&self, agent: Agent) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ck_agents
                (agent_id, display_name, pubkey_hex, lifetime_volume_micros,
                 free_settlements_used, free_settlements_period_start_ms, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (agent_id) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                pubkey_hex = EXCLUDED.pubkey_hex,
                lifetime_volume_micros = EXCLUDED.lifetime_volume_micros,
                free_settlements_used = EXCLUDED.free_settlements_used,
                free_settlements_period_start_ms = EXCLUDED.free_settlements_period_start_ms",
        )
        .bind(&agent.agent_id)
        .bind(&agent.display_name)
        .bind(&agent.pubkey_hex)
        .bind(agent.lifetime_volume_micros)
        .bind(agent.free_settlements_used as i32)
        .bind(agent.free_settlements_period_start_ms)
        .bind(agent.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("put_agent", e))?;
        Ok(())
    }

    async fn record_settlement_volume(
        &self,
        agent_id: &str,
        amount: Micros,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE ck_agents SET lifetime_volume_micros = lifetime_volume_micros + $2
             WHERE agent_id = $1",
        )
        .bind(agent_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("record_settlement_volume", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("agent {agent_id}")));
        }
        Ok(())
    }

    async fn increment_free_settlement(
        &self,
        agent_id: &str,
        period_start_ms: i64,
    ) -> Result<u32, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_err("increment_free_settlement begin", e))?;
        let existing = sqlx::query(
            "SELECT period_start_ms, used FROM ck_free_settlement_counters
             WHERE agent_id = $1 FOR UPDATE",
        )
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| backend_err("increment_free_settlement select", e))?;
        let used = match existing {
            Some(row) => {
                let stored_period: i64 = row
                    .try_get("period_start_ms")
                    .map_err(|e| backend_err("period_start_ms", e))?;
                let used: i32 = if stored_period == period_start_ms {
                    row.try_get::<i32, _>("used")
                        .map_err(|e| backend_err("used", e))?
                        + 1
                } else {
                    1
                };
                sqlx::query(
                    "UPDATE ck_free_settlement_counters
                     SET period_start_ms = $2, used = $3 WHERE agent_id = $1",
                )
                .bind(agent_id)
                .bind(period_start_ms)
                .bind(used)
                .execute(&mut *tx)
                .await
                .map_err(|e| backend_err("increment_free_settlement update", e))?;
                used
            }
            None => {
                sqlx::query(
                    "INSERT INTO ck_free_settlement_counters (agent_id, period_start_ms, used)
                     VALUES ($1, $2, 1)",
                )
                .bind(agent_id)
                .bind(period_start_ms)
                .execute(&mut *tx)
                .await
                .map_err(|e| backend_err("increment_free_settlement insert", e))?;
                1
            }
        };
        tx.commit()
            .await
            .map_err(|e| backend_err("increment_free_settlement commit", e))?;
        Ok(used as u32)
    }
}

#[async_trait]
impl WalletStore for PostgresKernelStorage {
    async fn get_balance(&self, wallet_id: &str) -> Result<Micros, StorageError> {
        let row = sqlx::query("SELECT balance_micros FROM ck_wallets WHERE wallet_id = $1")
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend_err("get_balance", e))?;
        Ok(row
            .map(|r| r.try_get::<i64, _>("balance_micros"))
            .transpose()
            .map_err(|e| backend_err("balance_micros", e))?
            .unwrap_or(0))
    }

    async fn get_wallet(&self, wallet_id: &str) -> Result<Option<Wallet>, StorageError> {
        let row = sqlx::query("SELECT balance_micros FROM ck_wallets WHERE wallet_id = $1")
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend_err("get_wallet", e))?;
        Ok(row
            .map(|r| -> Result<Wallet, StorageError> {
                Ok(Wallet {
                    wallet_id: wallet_id.to_string(),
                    balance_micros: r
                        .try_get("balance_micros")
                        .map_err(|e| backend_err("balance_micros", e))?,
                })
            })
            .transpose()?)
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_err("credit begin", e))?;
        let transaction = credit_in_tx(&mut tx, wallet_id, amount, kind, reference_type, reference).await?;
        tx.commit()
            .await
            .map_err(|e| backend_err("credit commit", e))?;
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_err("deduct begin", e))?;
        let outcome = deduct_in_tx(&mut tx, wallet_id, amount, reference_type, reference).await?;
        tx.commit()
            .await
            .map_err(|e| backend_err("deduct commit", e))?;
        Ok(outcome)
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
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_err("transfer_with_fee begin", e))?;
        let outcome = deduct_in_tx(&mut tx, from_wallet, total, reference_type, reference).await?;
        if matches!(outcome, DeductOutcome::Applied { .. }) {
            credit_in_tx(&mut tx, to_wallet, amount, WalletTransactionKind::Credit, reference_type, reference).await?;
            if fee > 0 {
                let fee_reference = format!("{reference}_fee");
                credit_in_tx(&mut tx, fee_wallet, fee, WalletTransactionKind::Credit, reference_type, &fee_reference).await?;
            }
        }
        tx.commit()
            .await
            .map_err(|e| backend_err("transfer_with_fee commit", e))?;
        Ok(outcome)
    }

    async fn list_transactions(
        &self,
        wallet_id: &str,
    ) -> Result<Vec<WalletTransaction>, StorageError> {
        let rows = sqlx::query(
            "SELECT entry_id, wallet_id, kind, amount_micros, reference_type, reference,
                    balance_after_micros, ts
             FROM ck_wallet_transactions WHERE wallet_id = $1 ORDER BY ts ASC",
        )
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend_err("list_transactions", e))?;
        rows.into_iter()
            .map(|row| {
                let kind_str: String =
                    row.try_get("kind").map_err(|e| backend_err("kind", e))?;
                Ok(WalletTransaction {
                    entry_id: row.try_get("entry_id").map_err(|e| backend_err("entry_id", e))?,
                    wallet_id: row.try_get("wallet_id").map_err(|e| backend_err("wallet_id", e))?,
                    kind: parse_wallet_kind(&kind_str)?,
                    amount_micros: row
                        .try_get("amount_micros")
                        .map_err(|e| backend_err("amount_micros", e))?,
                    reference_type: row
                        .try_get("reference_type")
                        .map_err(|e| backend_err("reference_type", e))?,
                    reference: row.try_get("reference").map_err(|e| backend_err("reference", e))?,
                    balance_after_micros: row
                        .try_get("balance_after_micros")
                        .map_err(|e| backend_err("balance_after_micros", e))?,
                    timestamp: row.try_get("ts").map_err(|e| backend_err("ts", e))?,
                })
            })
            .collect()
    }
}

/// Upserts `wallet_id`'s balance and appends a transaction log entry within
/// an already-open transaction. Shared by `WalletStore::credit`, which opens
/// its own transaction and commits immediately, and `transfer_with_fee`,
/// which calls this (and `deduct_in_tx`) multiple times before committing once.
async fn credit_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    wallet_id: &str,
    amount: Micros,
    kind: WalletTransactionKind,
    reference_type: &str,
    reference: &str,
) -> Result<WalletTransaction, StorageError> {
    let row = sqlx::query(
        "INSERT INTO ck_wallets (wallet_id, balance_micros) VALUES ($1, $2)
         ON CONFLICT (wallet_id) DO UPDATE SET balance_micros = ck_wallets.balance_micros + $2
         RETURNING balance_micros",
    )
    .bind(wallet_id)
    .bind(amount)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| backend_err("credit upsert", e))?;
    let balance_after: i64 = row
        .try_get("balance_micros")
        .map_err(|e| backend_err("balance_micros", e))?;
    let transaction = WalletTransaction {
        entry_id: uuid::Uuid::new_v4().to_string(),
        wallet_id: wallet_id.to_string(),
        kind,
        amount_micros: amount,
        reference_type: reference_type.to_string(),
        reference: reference.to_string(),
        balance_after_micros: balance_after,
        timestamp: Utc::now(),
    };
    insert_wallet_transaction(tx, &transaction).await?;
    Ok(transaction)
}

/// Check-and-decrement under row lock within an already-open transaction.
/// On insufficient funds, returns without writing a transaction log entry
/// but does not roll back the transaction itself — the caller still commits
/// (or, for `transfer_with_fee`, skips the credits and commits the no-op).
async fn deduct_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    wallet_id: &str,
    amount: Micros,
    reference_type: &str,
    reference: &str,
) -> Result<DeductOutcome, StorageError> {
    sqlx::query(
        "INSERT INTO ck_wallets (wallet_id, balance_micros) VALUES ($1, 0)
         ON CONFLICT (wallet_id) DO NOTHING",
    )
    .bind(wallet_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| backend_err("deduct seed", e))?;
    let row = sqlx::query("SELECT balance_micros FROM ck_wallets WHERE wallet_id = $1 FOR UPDATE")
        .bind(wallet_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| backend_err("deduct select", e))?;
    let current: i64 = row
        .try_get("balance_micros")
        .map_err(|e| backend_err("balance_micros", e))?;
    if current < amount {
        return Ok(DeductOutcome::InsufficientFunds {
            current_balance: current,
        });
    }
    let new_balance = current - amount;
    sqlx::query("UPDATE ck_wallets SET balance_micros = $2 WHERE wallet_id = $1")
        .bind(wallet_id)
        .bind(new_balance)
        .execute(&mut **tx)
        .await
        .map_err(|e| backend_err("deduct update", e))?;
    let transaction = WalletTransaction {
        entry_id: uuid::Uuid::new_v4().to_string(),
        wallet_id: wallet_id.to_string(),
        kind: WalletTransactionKind::Deduct,
        amount_micros: amount,
        reference_type: reference_type.to_string(),
        reference: reference.to_string(),
        balance_after_micros: new_balance,
        timestamp: Utc::now(),
    };
    insert_wallet_transaction(tx, &transaction).await?;
    Ok(DeductOutcome::Applied {
        balance_after: new_balance,
        transaction,
    })
}

async fn insert_wallet_transaction(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    transaction: &WalletTransaction,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO ck_wallet_transactions
            (entry_id, wallet_id, kind, amount_micros, reference_type, reference,
             balance_after_micros, ts)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&transaction.entry_id)
    .bind(&transaction.wallet_id)
    .bind(wallet_kind_str(transaction.kind))
    .bind(transaction.amount_micros)
    .bind(&transaction.reference_type)
    .bind(&transaction.reference)
    .bind(transaction.balance_after_micros)
    .bind(transaction.timestamp)
    .execute(&mut **tx)
    .await
    .map_err(|e| backend_err("insert_wallet_transaction", e))?;
    Ok(())
}

#[async_trait]
impl ReceiptStore for PostgresKernelStorage {
    async fn insert_receipt(
        &self,
        receipt: ReceiptEnvelope,
    ) -> Result<InsertOutcome<ReceiptEnvelope>, StorageError> {
        if let Some(existing) = ReceiptStore::get_by_request_hash(self, &receipt.request_hash).await? {
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        let result = sqlx::query(
            "INSERT INTO ck_receipts
                (receipt_hash, receipt_type, issuer, kernel_pubkey, timestamp_ms,
                 request_hash, kernel_signature, payload)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (request_hash) DO NOTHING",
        )
        .bind(&receipt.receipt_hash)
        .bind(&receipt.receipt_type)
        .bind(&receipt.issuer)
        .bind(&receipt.kernel_pubkey)
        .bind(receipt.timestamp_ms)
        .bind(&receipt.request_hash)
        .bind(&receipt.kernel_signature)
        .bind(&receipt.payload)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("insert_receipt", e))?;
        if result.rows_affected() == 0 {
            let existing = ReceiptStore::get_by_request_hash(self, &receipt.request_hash)
                .await?
                .ok_or_else(|| {
                    StorageError::Backend("race inserting receipt but no row found".into())
                })?;
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        Ok(InsertOutcome::Inserted(receipt))
    }

    async fn get_by_hash(&self, receipt_hash: &str) -> Result<Option<ReceiptEnvelope>, StorageError> {
        let row = sqlx::query(
            "SELECT receipt_hash, receipt_type, issuer, kernel_pubkey, timestamp_ms,
                    request_hash, kernel_signature, payload
             FROM ck_receipts WHERE receipt_hash = $1",
        )
        .bind(receipt_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_by_hash", e))?;
        row.map(receipt_from_row).transpose()
    }

    async fn get_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<ReceiptEnvelope>, StorageError> {
        let row = sqlx::query(
            "SELECT receipt_hash, receipt_type, issuer, kernel_pubkey, timestamp_ms,
                    request_hash, kernel_signature, payload
             FROM ck_receipts WHERE request_hash = $1",
        )
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_by_request_hash", e))?;
        row.map(receipt_from_row).transpose()
    }
}

fn receipt_from_row(row: sqlx::postgres::PgRow) -> Result<ReceiptEnvelope, StorageError> {
    Ok(ReceiptEnvelope {
        receipt_hash: row
            .try_get("receipt_hash")
            .map_err(|e| backend_err("receipt_hash", e))?,
        kernel_signature: row
            .try_get("kernel_signature")
            .map_err(|e| backend_err("kernel_signature", e))?,
        receipt_type: row
            .try_get("receipt_type")
            .map_err(|e| backend_err("receipt_type", e))?,
        issuer: row.try_get("issuer").map_err(|e| backend_err("issuer", e))?,
        kernel_pubkey: row
            .try_get("kernel_pubkey")
            .map_err(|e| backend_err("kernel_pubkey", e))?,
        timestamp_ms: row
            .try_get("timestamp_ms")
            .map_err(|e| backend_err("timestamp_ms", e))?,
        request_hash: row
            .try_get("request_hash")
            .map_err(|e| backend_err("request_hash", e))?,
        payload: row.try_get("payload").map_err(|e| backend_err("payload", e))?,
    })
}

#[async_trait]
impl CreditLineStore for PostgresKernelStorage {
    async fn get_line(&self, credit_line_id: &str) -> Result<Option<CreditLine>, StorageError> {
        let row = sqlx::query(
            "SELECT credit_line_id, borrower, lender, limit_micros, spread_bps, maturity_ts_ms,
                    collateral_ratio_min_bps, status, created_at
             FROM ck_credit_lines WHERE credit_line_id = $1",
        )
        .bind(credit_line_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_line", e))?;
        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status").map_err(|e| backend_err("status", e))?;
        Ok(Some(CreditLine {
            credit_line_id: row
                .try_get("credit_line_id")
                .map_err(|e| backend_err("credit_line_id", e))?,
            borrower: row.try_get("borrower").map_err(|e| backend_err("borrower", e))?,
            lender: row.try_get("lender").map_err(|e| backend_err("lender", e))?,
            limit_micros: row
                .try_get("limit_micros")
                .map_err(|e| backend_err("limit_micros", e))?,
            spread_bps: row
                .try_get::<i32, _>("spread_bps")
                .map_err(|e| backend_err("spread_bps", e))? as u32,
            maturity_ts_ms: row
                .try_get("maturity_ts_ms")
                .map_err(|e| backend_err("maturity_ts_ms", e))?,
            collateral_ratio_min_bps: row
                .try_get::<i32, _>("collateral_ratio_min_bps")
                .map_err(|e| backend_err("collateral_ratio_min_bps", e))? as u32,
            status: parse_line_status(&status)?,
            created_at: row
                .try_get("created_at")
                .map_err(|e| backend_err("created_at", e))?,
        }))
    }

    async fn get_position(
        &self,
        credit_line_id: &str,
    ) -> Result<Option<CreditPosition>, StorageError> {
        let row = sqlx::query(
            "SELECT principal_micros, interest_accrued_micros, fees_micros,
                    last_accrual_ts_ms, last_accrual_window
             FROM ck_credit_positions WHERE credit_line_id = $1",
        )
        .bind(credit_line_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_position", e))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(CreditPosition {
            principal_micros: row
                .try_get("principal_micros")
                .map_err(|e| backend_err("principal_micros", e))?,
            interest_accrued_micros: row
                .try_get("interest_accrued_micros")
                .map_err(|e| backend_err("interest_accrued_micros", e))?,
            fees_micros: row
                .try_get("fees_micros")
                .map_err(|e| backend_err("fees_micros", e))?,
            last_accrual_ts_ms: row
                .try_get("last_accrual_ts_ms")
                .map_err(|e| backend_err("last_accrual_ts_ms", e))?,
            last_accrual_window: row
                .try_get("last_accrual_window")
                .map_err(|e| backend_err("last_accrual_window", e))?,
        }))
    }

    async fn open_line(
        &self,
        line: CreditLine,
        position: CreditPosition,
    ) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_err("open_line begin", e))?;
        sqlx::query(
            "INSERT INTO ck_credit_lines
                (credit_line_id, borrower, lender, limit_micros, spread_bps, maturity_ts_ms,
                 collateral_ratio_min_bps, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&line.credit_line_id)
        .bind(&line.borrower)
        .bind(&line.lender)
        .bind(line.limit_micros)
        .bind(line.spread_bps as i32)
        .bind(line.maturity_ts_ms)
        .bind(line.collateral_ratio_min_bps as i32)
        .bind(status_str(line.status))
        .bind(line.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend_err("open_line insert line", e))?;
        sqlx::query(
            "INSERT INTO ck_credit_positions
                (credit_line_id, principal_micros, interest_accrued_micros, fees_micros,
                 last_accrual_ts_ms, last_accrual_window)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&line.credit_line_id)
        .bind(position.principal_micros)
        .bind(position.interest_accrued_micros)
        .bind(position.fees_micros)
        .bind(position.last_accrual_ts_ms)
        .bind(&position.last_accrual_window)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend_err("open_line insert position", e))?;
        tx.commit()
            .await
            .map_err(|e| backend_err("open_line commit", e))?;
        Ok(())
    }

    async fn update_line_status(
        &self,
        credit_line_id: &str,
        status: CreditLineStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE ck_credit_lines SET status = $2 WHERE credit_line_id = $1")
            .bind(credit_line_id)
            .bind(status_str(status))
            .execute(&self.pool)
            .await
            .map_err(|e| backend_err("update_line_status", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "credit line {credit_line_id}"
            )));
        }
        Ok(())
    }

    async fn update_position(
        &self,
        credit_line_id: &str,
        position: CreditPosition,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE ck_credit_positions
             SET principal_micros = $2, interest_accrued_micros = $3, fees_micros = $4,
                 last_accrual_ts_ms = $5, last_accrual_window = $6
             WHERE credit_line_id = $1",
        )
        .bind(credit_line_id)
        .bind(position.principal_micros)
        .bind(position.interest_accrued_micros)
        .bind(position.fees_micros)
        .bind(position.last_accrual_ts_ms)
        .bind(&position.last_accrual_window)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("update_position", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "credit position {credit_line_id}"
            )));
        }
        Ok(())
    }

    async fn append_event(
        &self,
        event: CreditEventLogEntry,
    ) -> Result<InsertOutcome<CreditEventLogEntry>, StorageError> {
        if let Some(existing) = self.get_event_by_request_hash(&event.request_hash).await? {
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        let result = sqlx::query(
            "INSERT INTO ck_credit_events
                (credit_line_id, event_type, receipt_hash, request_hash,
                 delta_principal_micros, delta_interest_micros, delta_fees_micros, ts)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (request_hash) DO NOTHING",
        )
        .bind(&event.credit_line_id)
        .bind(&event.event_type)
        .bind(&event.receipt_hash)
        .bind(&event.request_hash)
        .bind(event.delta_principal_micros)
        .bind(event.delta_interest_micros)
        .bind(event.delta_fees_micros)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("append_event", e))?;
        if result.rows_affected() == 0 {
            let existing = self
                .get_event_by_request_hash(&event.request_hash)
                .await?
                .ok_or_else(|| {
                    StorageError::Backend("race inserting credit event but no row found".into())
                })?;
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        Ok(InsertOutcome::Inserted(event))
    }

    async fn get_event_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<CreditEventLogEntry>, StorageError> {
        let row = sqlx::query(
            "SELECT credit_line_id, event_type, receipt_hash, request_hash,
                    delta_principal_micros, delta_interest_micros, delta_fees_micros, ts
             FROM ck_credit_events WHERE request_hash = $1",
        )
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_event_by_request_hash", e))?;
        row.map(credit_event_from_row).transpose()
    }

    async fn list_events(
        &self,
        credit_line_id: &str,
    ) -> Result<Vec<CreditEventLogEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT credit_line_id, event_type, receipt_hash, request_hash,
                    delta_principal_micros, delta_interest_micros, delta_fees_micros, ts
             FROM ck_credit_events WHERE credit_line_id = $1 ORDER BY id ASC",
        )
        .bind(credit_line_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend_err("list_events", e))?;
        rows.into_iter().map(credit_event_from_row).collect()
    }
}

fn credit_event_from_row(row: sqlx::postgres::PgRow) -> Result<CreditEventLogEntry, StorageError> {
    Ok(CreditEventLogEntry {
        credit_line_id: row
            .try_get("credit_line_id")
            .map_err(|e| backend_err("credit_line_id", e))?,
        event_type: row.try_get("event_type").map_err(|e| backend_err("event_type", e))?,
        receipt_hash: row
            .try_get("receipt_hash")
            .map_err(|e| backend_err("receipt_hash", e))?,
        request_hash: row
            .try_get("request_hash")
            .map_err(|e| backend_err("request_hash", e))?,
        delta_principal_micros: row
            .try_get("delta_principal_micros")
            .map_err(|e| backend_err("delta_principal_micros", e))?,
        delta_interest_micros: row
            .try_get("delta_interest_micros")
            .map_err(|e| backend_err("delta_interest_micros", e))?,
        delta_fees_micros: row
            .try_get("delta_fees_micros")
            .map_err(|e| backend_err("delta_fees_micros", e))?,
        timestamp: row.try_get("ts").map_err(|e| backend_err("ts", e))?,
    })
}

#[async_trait]
impl CollateralStore for PostgresKernelStorage {
    async fn lock_collateral(&self, lock: CollateralLock) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ck_collateral_locks
                (lock_id, credit_line_id, asset_ref, asset_type, amount_micros, status)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&lock.lock_id)
        .bind(&lock.credit_line_id)
        .bind(&lock.asset_ref)
        .bind(collateral_asset_str(lock.asset_type))
        .bind(lock.amount_micros)
        .bind(collateral_status_str(lock.status))
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("lock_collateral", e))?;
        Ok(())
    }

    async fn get_lock(&self, lock_id: &str) -> Result<Option<CollateralLock>, StorageError> {
        let row = sqlx::query(
            "SELECT lock_id, credit_line_id, asset_ref, asset_type, amount_micros, status
             FROM ck_collateral_locks WHERE lock_id = $1",
        )
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_lock", e))?;
        row.map(collateral_lock_from_row).transpose()
    }

    async fn update_lock_status(
        &self,
        lock_id: &str,
        status: CollateralStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE ck_collateral_locks SET status = $2 WHERE lock_id = $1")
            .bind(lock_id)
            .bind(collateral_status_str(status))
            .execute(&self.pool)
            .await
            .map_err(|e| backend_err("update_lock_status", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("collateral lock {lock_id}")));
        }
        Ok(())
    }

    async fn list_locked_for_line(
        &self,
        credit_line_id: &str,
    ) -> Result<Vec<CollateralLock>, StorageError> {
        let rows = sqlx::query(
            "SELECT lock_id, credit_line_id, asset_ref, asset_type, amount_micros, status
             FROM ck_collateral_locks WHERE credit_line_id = $1",
        )
        .bind(credit_line_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend_err("list_locked_for_line", e))?;
        rows.into_iter().map(collateral_lock_from_row).collect()
    }
}

fn collateral_lock_from_row(row: sqlx::postgres::PgRow) -> Result<CollateralLock, StorageError> {
    let asset_type: String = row
        .try_get("asset_type")
        .map_err(|e| backend_err("asset_type", e))?;
    let status: String = row.try_get("status").map_err(|e| backend_err("status", e))?;
    Ok(CollateralLock {
        lock_id: row.try_get("lock_id").map_err(|e| backend_err("lock_id", e))?,
        credit_line_id: row
            .try_get("credit_line_id")
            .map_err(|e| backend_err("credit_line_id", e))?,
        asset_ref: row.try_get("asset_ref").map_err(|e| backend_err("asset_ref", e))?,
        asset_type: parse_collateral_asset(&asset_type)?,
        amount_micros: row
            .try_get("amount_micros")
            .map_err(|e| backend_err("amount_micros", e))?,
        status: parse_collateral_status(&status)?,
    })
}

#[async_trait]
impl MarginCallStore for PostgresKernelStorage {
    async fn create_margin_call(&self, call: MarginCall) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ck_margin_calls
                (margin_call_id, credit_line_id, required_amount_micros, due_ts_ms, status, resolved_ts_ms)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&call.margin_call_id)
        .bind(&call.credit_line_id)
        .bind(call.required_amount_micros)
        .bind(call.due_ts_ms)
        .bind(margin_status_str(call.status))
        .bind(call.resolved_ts_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("create_margin_call", e))?;
        Ok(())
    }

    async fn get_margin_call(&self, margin_call_id: &str) -> Result<Option<MarginCall>, StorageError> {
        let row = sqlx::query(
            "SELECT margin_call_id, credit_line_id, required_amount_micros, due_ts_ms, status, resolved_ts_ms
             FROM ck_margin_calls WHERE margin_call_id = $1",
        )
        .bind(margin_call_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_margin_call", e))?;
        row.map(margin_call_from_row).transpose()
    }

    async fn update_margin_call_status(
        &self,
        margin_call_id: &str,
        status: MarginCallStatus,
        resolved_ts_ms: Option<i64>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE ck_margin_calls
             SET status = $2, resolved_ts_ms = COALESCE($3, resolved_ts_ms)
             WHERE margin_call_id = $1",
        )
        .bind(margin_call_id)
        .bind(margin_status_str(status))
        .bind(resolved_ts_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("update_margin_call_status", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "margin call {margin_call_id}"
            )));
        }
        Ok(())
    }
}

fn margin_call_from_row(row: sqlx::postgres::PgRow) -> Result<MarginCall, StorageError> {
    let status: String = row.try_get("status").map_err(|e| backend_err("status", e))?;
    Ok(MarginCall {
        margin_call_id: row
            .try_get("margin_call_id")
            .map_err(|e| backend_err("margin_call_id", e))?,
        credit_line_id: row
            .try_get("credit_line_id")
            .map_err(|e| backend_err("credit_line_id", e))?,
        required_amount_micros: row
            .try_get("required_amount_micros")
            .map_err(|e| backend_err("required_amount_micros", e))?,
        due_ts_ms: row.try_get("due_ts_ms").map_err(|e| backend_err("due_ts_ms", e))?,
        status: parse_margin_status(&status)?,
        resolved_ts_ms: row
            .try_get("resolved_ts_ms")
            .map_err(|e| backend_err("resolved_ts_ms", e))?,
    })
}

#[async_trait]
impl AllocationStore for PostgresKernelStorage {
    async fn insert_allocation(
        &self,
        record: AllocationRecord,
    ) -> Result<InsertOutcome<AllocationRecord>, StorageError> {
        if let Some(existing) = AllocationStore::get_by_request_hash(self, &record.request_hash).await? {
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        let result = sqlx::query(
            "INSERT INTO ck_allocations
                (allocation_id, from_wallet, to_wallet, amount_micros, fee_micros, fee_bps,
                 window_id, request_hash, receipt_hash)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (request_hash) DO NOTHING",
        )
        .bind(&record.allocation_id)
        .bind(&record.from_wallet)
        .bind(&record.to_wallet)
        .bind(record.amount_micros)
        .bind(record.fee_micros)
        .bind(record.fee_bps as i32)
        .bind(&record.window_id)
        .bind(&record.request_hash)
        .bind(&record.receipt_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("insert_allocation", e))?;
        if result.rows_affected() == 0 {
            let existing = AllocationStore::get_by_request_hash(self, &record.request_hash)
                .await?
                .ok_or_else(|| {
                    StorageError::Backend("race inserting allocation but no row found".into())
                })?;
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        Ok(InsertOutcome::Inserted(record))
    }

    async fn get_by_request_hash(
        &self,
        request_hash: &str,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT allocation_id, from_wallet, to_wallet, amount_micros, fee_micros, fee_bps,
                    window_id, request_hash, receipt_hash
             FROM ck_allocations WHERE request_hash = $1",
        )
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_by_request_hash", e))?;
        row.map(allocation_from_row).transpose()
    }

    async fn list_for_wallet(&self, wallet_id: &str) -> Result<Vec<AllocationRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT allocation_id, from_wallet, to_wallet, amount_micros, fee_micros, fee_bps,
                    window_id, request_hash, receipt_hash
             FROM ck_allocations WHERE from_wallet = $1 OR to_wallet = $1",
        )
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend_err("list_for_wallet", e))?;
        rows.into_iter().map(allocation_from_row).collect()
    }
}

fn allocation_from_row(row: sqlx::postgres::PgRow) -> Result<AllocationRecord, StorageError> {
    Ok(AllocationRecord {
        allocation_id: row
            .try_get("allocation_id")
            .map_err(|e| backend_err("allocation_id", e))?,
        from_wallet: row
            .try_get("from_wallet")
            .map_err(|e| backend_err("from_wallet", e))?,
        to_wallet: row.try_get("to_wallet").map_err(|e| backend_err("to_wallet", e))?,
        amount_micros: row
            .try_get("amount_micros")
            .map_err(|e| backend_err("amount_micros", e))?,
        fee_micros: row.try_get("fee_micros").map_err(|e| backend_err("fee_micros", e))?,
        fee_bps: row
            .try_get::<i32, _>("fee_bps")
            .map_err(|e| backend_err("fee_bps", e))? as u32,
        window_id: row.try_get("window_id").map_err(|e| backend_err("window_id", e))?,
        request_hash: row
            .try_get("request_hash")
            .map_err(|e| backend_err("request_hash", e))?,
        receipt_hash: row
            .try_get("receipt_hash")
            .map_err(|e| backend_err("receipt_hash", e))?,
    })
}

#[async_trait]
impl EscrowStore for PostgresKernelStorage {
    async fn create_escrow(&self, escrow: Escrow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO ck_escrows
                (escrow_id, buyer, seller, amount_micros, description, expires_at, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&escrow.escrow_id)
        .bind(&escrow.buyer)
        .bind(&escrow.seller)
        .bind(escrow.amount_micros)
        .bind(&escrow.description)
        .bind(escrow.expires_at)
        .bind(escrow_status_str(escrow.status))
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("create_escrow", e))?;
        Ok(())
    }

    async fn get_escrow(&self, escrow_id: &str) -> Result<Option<Escrow>, StorageError> {
        let row = sqlx::query(
            "SELECT escrow_id, buyer, seller, amount_micros, description, expires_at, status
             FROM ck_escrows WHERE escrow_id = $1",
        )
        .bind(escrow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_escrow", e))?;
        row.map(escrow_from_row).transpose()
    }

    async fn update_escrow_status(
        &self,
        escrow_id: &str,
        status: EscrowStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE ck_escrows SET status = $2 WHERE escrow_id = $1")
            .bind(escrow_id)
            .bind(escrow_status_str(status))
            .execute(&self.pool)
            .await
            .map_err(|e| backend_err("update_escrow_status", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("escrow {escrow_id}")));
        }
        Ok(())
    }
}

fn escrow_from_row(row: sqlx::postgres::PgRow) -> Result<Escrow, StorageError> {
    let status: String = row.try_get("status").map_err(|e| backend_err("status", e))?;
    Ok(Escrow {
        escrow_id: row.try_get("escrow_id").map_err(|e| backend_err("escrow_id", e))?,
        buyer: row.try_get("buyer").map_err(|e| backend_err("buyer", e))?,
        seller: row.try_get("seller").map_err(|e| backend_err("seller", e))?,
        amount_micros: row
            .try_get("amount_micros")
            .map_err(|e| backend_err("amount_micros", e))?,
        description: row
            .try_get("description")
            .map_err(|e| backend_err("description", e))?,
        expires_at: row
            .try_get("expires_at")
            .map_err(|e| backend_err("expires_at", e))?,
        status: parse_escrow_status(&status)?,
    })
}

#[async_trait]
impl NettingJobStore for PostgresKernelStorage {
    async fn insert_job(&self, job: NettingJob) -> Result<InsertOutcome<NettingJob>, StorageError> {
        if let Some(existing) = self.get_by_input_hash(&job.input_hash).await? {
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        let result = sqlx::query(
            "INSERT INTO ck_netting_jobs
                (job_id, agent, input_hash, receipt_hashes, status, ian_payload, fee_charged_micros)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (input_hash) DO NOTHING",
        )
        .bind(&job.job_id)
        .bind(&job.agent)
        .bind(&job.input_hash)
        .bind(serde_json::to_value(&job.receipt_hashes).map_err(|e| StorageError::Serialization(e.to_string()))?)
        .bind(netting_status_str(job.status))
        .bind(&job.ian_payload)
        .bind(job.fee_charged_micros)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("insert_job", e))?;
        if result.rows_affected() == 0 {
            let existing = self
                .get_by_input_hash(&job.input_hash)
                .await?
                .ok_or_else(|| {
                    StorageError::Backend("race inserting netting job but no row found".into())
                })?;
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        Ok(InsertOutcome::Inserted(job))
    }

    async fn get_by_input_hash(&self, input_hash: &str) -> Result<Option<NettingJob>, StorageError> {
        let row = sqlx::query(
            "SELECT job_id, agent, input_hash, receipt_hashes, status, ian_payload, fee_charged_micros
             FROM ck_netting_jobs WHERE input_hash = $1",
        )
        .bind(input_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_by_input_hash", e))?;
        row.map(netting_job_from_row).transpose()
    }

    async fn update_job(&self, job: NettingJob) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE ck_netting_jobs
             SET status = $2, ian_payload = $3, fee_charged_micros = $4, receipt_hashes = $5
             WHERE input_hash = $1",
        )
        .bind(&job.input_hash)
        .bind(netting_status_str(job.status))
        .bind(&job.ian_payload)
        .bind(job.fee_charged_micros)
        .bind(serde_json::to_value(&job.receipt_hashes).map_err(|e| StorageError::Serialization(e.to_string()))?)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("update_job", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "netting job {}",
                job.input_hash
            )));
        }
        Ok(())
    }
}

fn netting_job_from_row(row: sqlx::postgres::PgRow) -> Result<NettingJob, StorageError> {
    let status: String = row.try_get("status").map_err(|e| backend_err("status", e))?;
    let receipt_hashes: serde_json::Value = row
        .try_get("receipt_hashes")
        .map_err(|e| backend_err("receipt_hashes", e))?;
    Ok(NettingJob {
        job_id: row.try_get("job_id").map_err(|e| backend_err("job_id", e))?,
        agent: row.try_get("agent").map_err(|e| backend_err("agent", e))?,
        input_hash: row.try_get("input_hash").map_err(|e| backend_err("input_hash", e))?,
        receipt_hashes: serde_json::from_value(receipt_hashes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        status: parse_netting_status(&status)?,
        ian_payload: row
            .try_get("ian_payload")
            .map_err(|e| backend_err("ian_payload", e))?,
        fee_charged_micros: row
            .try_get("fee_charged_micros")
            .map_err(|e| backend_err("fee_charged_micros", e))?,
    })
}

#[async_trait]
impl SealStore for PostgresKernelStorage {
    async fn issue_seal(&self, seal: Seal) -> Result<InsertOutcome<Seal>, StorageError> {
        if let Some(existing) = self.get_seal(&seal.target).await? {
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        let result = sqlx::query(
            "INSERT INTO ck_seals (target, conformance_hash, issued_at, receipt_hash)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (target) DO NOTHING",
        )
        .bind(&seal.target)
        .bind(&seal.conformance_hash)
        .bind(seal.issued_at)
        .bind(&seal.receipt_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("issue_seal", e))?;
        if result.rows_affected() == 0 {
            let existing = self.get_seal(&seal.target).await?.ok_or_else(|| {
                StorageError::Backend("race inserting seal but no row found".into())
            })?;
            return Ok(InsertOutcome::AlreadyExists(existing));
        }
        Ok(InsertOutcome::Inserted(seal))
    }

    async fn get_seal(&self, target: &str) -> Result<Option<Seal>, StorageError> {
        let row = sqlx::query(
            "SELECT target, conformance_hash, issued_at, receipt_hash FROM ck_seals WHERE target = $1",
        )
        .bind(target)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_seal", e))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Seal {
            target: row.try_get("target").map_err(|e| backend_err("target", e))?,
            conformance_hash: row
                .try_get("conformance_hash")
                .map_err(|e| backend_err("conformance_hash", e))?,
            issued_at: row.try_get("issued_at").map_err(|e| backend_err("issued_at", e))?,
            receipt_hash: row
                .try_get("receipt_hash")
                .map_err(|e| backend_err("receipt_hash", e))?,
        }))
    }
}

#[async_trait]
impl IndexStore for PostgresKernelStorage {
    async fn get_open_window(&self) -> Result<Option<IndexWindow>, StorageError> {
        let row = sqlx::query(
            "SELECT window_id, previous_window_id, previous_root_hash, opened_at_ms,
                    closed_at_ms, leaf_count, root_hash, kernel_signature
             FROM ck_index_windows WHERE closed_at_ms IS NULL",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_open_window", e))?;
        row.map(index_window_from_row).transpose()
    }

    async fn get_window(&self, window_id: &str) -> Result<Option<IndexWindow>, StorageError> {
        let row = sqlx::query(
            "SELECT window_id, previous_window_id, previous_root_hash, opened_at_ms,
                    closed_at_ms, leaf_count, root_hash, kernel_signature
             FROM ck_index_windows WHERE window_id = $1",
        )
        .bind(window_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_window", e))?;
        row.map(index_window_from_row).transpose()
    }

    async fn create_window(&self, window: IndexWindow) -> Result<(), StorageError> {
        if self.get_open_window().await?.is_some() {
            return Err(StorageError::Conflict("a window is already open".into()));
        }
        sqlx::query(
            "INSERT INTO ck_index_windows
                (window_id, previous_window_id, previous_root_hash, opened_at_ms,
                 closed_at_ms, leaf_count, root_hash, kernel_signature)
             VALUES ($1, $2, $3, $4, NULL, 0, NULL, NULL)",
        )
        .bind(&window.window_id)
        .bind(&window.previous_window_id)
        .bind(&window.previous_root_hash)
        .bind(window.opened_at_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("create_window", e))?;
        Ok(())
    }

    async fn get_latest_window(&self) -> Result<Option<IndexWindow>, StorageError> {
        let row = sqlx::query(
            "SELECT window_id, previous_window_id, previous_root_hash, opened_at_ms,
                    closed_at_ms, leaf_count, root_hash, kernel_signature
             FROM ck_index_windows ORDER BY opened_at_ms DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_latest_window", e))?;
        row.map(index_window_from_row).transpose()
    }

    async fn append_leaf(&self, leaf: IndexLeaf) -> Result<(), StorageError> {
        let window = self
            .get_window(&leaf.window_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("index window {}", leaf.window_id)))?;
        if !window.is_open() {
            return Err(StorageError::InvariantViolation(format!(
                "window {} is closed",
                leaf.window_id
            )));
        }
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| backend_err("append_leaf begin", e))?;
        sqlx::query(
            "INSERT INTO ck_index_leaves
                (window_id, position, leaf_type, payload_hash, leaf_hash, submitted_at_ms)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&leaf.window_id)
        .bind(leaf.position as i64)
        .bind(&leaf.leaf_type)
        .bind(&leaf.payload_hash)
        .bind(&leaf.leaf_hash)
        .bind(leaf.submitted_at_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| backend_err("append_leaf insert", e))?;
        sqlx::query("UPDATE ck_index_windows SET leaf_count = leaf_count + 1 WHERE window_id = $1")
            .bind(&leaf.window_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend_err("append_leaf update count", e))?;
        tx.commit()
            .await
            .map_err(|e| backend_err("append_leaf commit", e))?;
        Ok(())
    }

    async fn close_window(
        &self,
        window_id: &str,
        root_hash: String,
        closed_at_ms: i64,
        kernel_signature: String,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE ck_index_windows
             SET closed_at_ms = $2, root_hash = $3, kernel_signature = $4
             WHERE window_id = $1",
        )
        .bind(window_id)
        .bind(closed_at_ms)
        .bind(&root_hash)
        .bind(&kernel_signature)
        .execute(&self.pool)
        .await
        .map_err(|e| backend_err("close_window", e))?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("index window {window_id}")));
        }
        Ok(())
    }

    async fn list_leaves(&self, window_id: &str) -> Result<Vec<IndexLeaf>, StorageError> {
        let rows = sqlx::query(
            "SELECT window_id, position, leaf_type, payload_hash, leaf_hash, submitted_at_ms
             FROM ck_index_leaves WHERE window_id = $1 ORDER BY position ASC",
        )
        .bind(window_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend_err("list_leaves", e))?;
        rows.into_iter().map(index_leaf_from_row).collect()
    }

    async fn get_leaf(
        &self,
        window_id: &str,
        leaf_hash: &str,
    ) -> Result<Option<IndexLeaf>, StorageError> {
        let row = sqlx::query(
            "SELECT window_id, position, leaf_type, payload_hash, leaf_hash, submitted_at_ms
             FROM ck_index_leaves WHERE window_id = $1 AND leaf_hash = $2",
        )
        .bind(window_id)
        .bind(leaf_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend_err("get_leaf", e))?;
        row.map(index_leaf_from_row).transpose()
    }
}

fn index_window_from_row(row: sqlx::postgres::PgRow) -> Result<IndexWindow, StorageError> {
    Ok(IndexWindow {
        window_id: row.try_get("window_id").map_err(|e| backend_err("window_id", e))?,
        previous_window_id: row
            .try_get("previous_window_id")
            .map_err(|e| backend_err("previous_window_id", e))?,
        previous_root_hash: row
            .try_get("previous_root_hash")
            .map_err(|e| backend_err("previous_root_hash", e))?,
        opened_at_ms: row
            .try_get("opened_at_ms")
            .map_err(|e| backend_err("opened_at_ms", e))?,
        closed_at_ms: row
            .try_get("closed_at_ms")
            .map_err(|e| backend_err("closed_at_ms", e))?,
        leaf_count: row
            .try_get::<i64, _>("leaf_count")
            .map_err(|e| backend_err("leaf_count", e))? as u64,
        root_hash: row.try_get("root_hash").map_err(|e| backend_err("root_hash", e))?,
        kernel_signature: row
            .try_get("kernel_signature")
            .map_err(|e| backend_err("kernel_signature", e))?,
    })
}

fn index_leaf_from_row(row: sqlx::postgres::PgRow) -> Result<IndexLeaf, StorageError> {
    Ok(IndexLeaf {
        window_id: row.try_get("window_id").map_err(|e| backend_err("window_id", e))?,
        position: row
            .try_get::<i64, _>("position")
            .map_err(|e| backend_err("position", e))? as u64,
        leaf_type: row.try_get("leaf_type").map_err(|e| backend_err("leaf_type", e))?,
        payload_hash: row
            .try_get("payload_hash")
            .map_err(|e| backend_err("payload_hash", e))?,
        leaf_hash: row.try_get("leaf_hash").map_err(|e| backend_err("leaf_hash", e))?,
        submitted_at_ms: row
            .try_get("submitted_at_ms")
            .map_err(|e| backend_err("submitted_at_ms", e))?,
    })
}

//! Typed receipt factory. Builds one of the fourteen receipt kinds
//! (MSR, IAN, CL, DRAW, REPAY, IAR, FEE, COLL, MARGIN, LIQ, ALLOC, SEAL, MBS,
//! ALR), stamps it with `receipt_hash` and `kernel_signature`, and returns an
//! immutable [`ReceiptEnvelope`].
//!
//! Grounded in `rcf_commitment::CommitmentBuilder`'s two-pass
//! build-then-hash-then-stamp shape: fields are assembled into a payload
//! first, the hash is computed once over that payload alone, and the
//! envelope is built around it afterward — never mutate a payload map in
//! place to add its own hash (REDESIGN FLAG 1).

use ck_canon::{canonicalize, CanonicalMapBuilder, CanonicalValue};
use ck_types::ReceiptEnvelope;
use chrono::Utc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("failed to sign receipt: {0}")]
    Signing(#[from] ck_crypto::CryptoError),
}

/// Holds the kernel's signing material and stamps every receipt it builds.
pub struct ReceiptFactory {
    kernel_private_hex: String,
    kernel_pubkey_hex: String,
}

impl ReceiptFactory {
    pub fn new(kernel_private_hex: impl Into<String>, kernel_pubkey_hex: impl Into<String>) -> Self {
        Self {
            kernel_private_hex: kernel_private_hex.into(),
            kernel_pubkey_hex: kernel_pubkey_hex.into(),
        }
    }

    pub fn kernel_pubkey_hex(&self) -> &str {
        &self.kernel_pubkey_hex
    }

    /// Builds and seals a receipt of the given kind. `fields` carries only
    /// the kind-specific attributes; envelope fields (`receipt_type`,
    /// `issuer`, `kernel_pubkey`, `timestamp_ms`, `request_hash`) are added
    /// here so every call site gets them for free and identically.
    pub fn seal(
        &self,
        receipt_type: &str,
        request_hash: &str,
        fields: CanonicalMapBuilder,
    ) -> Result<ReceiptEnvelope, ReceiptError> {
        let timestamp_ms = Utc::now().timestamp_millis();
        let payload = fields
            .field("receipt_type", CanonicalValue::str(receipt_type))
            .field("issuer", CanonicalValue::str("clearing-kernel"))
            .field("kernel_pubkey", CanonicalValue::str(&self.kernel_pubkey_hex))
            .field("timestamp_ms", CanonicalValue::Int(timestamp_ms))
            .field("request_hash", CanonicalValue::str(request_hash))
            .build();

        let canonical_bytes = canonicalize(&payload);
        let receipt_hash = ck_crypto::hash(&canonical_bytes);
        let kernel_signature = ck_crypto::sign(&receipt_hash, &self.kernel_private_hex)?;

        Ok(ReceiptEnvelope {
            receipt_hash,
            kernel_signature,
            receipt_type: receipt_type.to_string(),
            issuer: "clearing-kernel".to_string(),
            kernel_pubkey: self.kernel_pubkey_hex.clone(),
            timestamp_ms,
            request_hash: request_hash.to_string(),
            payload: payload.into(),
        })
    }
}

/// Required fields for each receipt kind, per spec.md §3's "hard attributes"
/// table. These are thin constructors over [`CanonicalMapBuilder`] so call
/// sites in `ck-netting`/`ck-credit`/`ck-allocation`/`ck-reports` stay
/// declarative; they do not stamp the envelope themselves — `seal` does that.
pub mod fields {
    use ck_canon::{CanonicalMapBuilder, CanonicalValue};
    use ck_types::Micros;

    pub fn msr(
        payer: &str,
        payee: &str,
        amount: Micros,
        escrow_id: Option<&str>,
        settlement_id: Option<&str>,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("msr_version", CanonicalValue::Int(1))
            .field("payer", CanonicalValue::str(payer))
            .field("payee", CanonicalValue::str(payee))
            .field("amount_micros", CanonicalValue::Int(amount))
            .field_opt("escrow_id", escrow_id.map(CanonicalValue::str))
            .field_opt("settlement_id", settlement_id.map(CanonicalValue::str))
    }

    pub fn ian(
        agent: &str,
        receipt_hashes: &[String],
        net_obligations: CanonicalValue,
        fee_charged_micros: Micros,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("ian_version", CanonicalValue::Int(1))
            .field("agent", CanonicalValue::str(agent))
            .field(
                "receipt_hashes",
                CanonicalValue::seq(receipt_hashes.iter().cloned().map(CanonicalValue::Str)),
            )
            .field("count", CanonicalValue::Int(receipt_hashes.len() as i64))
            .field("net_obligations", net_obligations)
            .field("fee_charged_micros", CanonicalValue::Int(fee_charged_micros))
    }

    pub fn cl(
        credit_line_id: &str,
        borrower: &str,
        lender: &str,
        limit_micros: Micros,
        spread_bps: u32,
        maturity_ts_ms: Option<i64>,
        action: &str,
        status: &str,
        seal_required: bool,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("cl_version", CanonicalValue::Int(1))
            .field("credit_line_id", CanonicalValue::str(credit_line_id))
            .field("borrower", CanonicalValue::str(borrower))
            .field("lender", CanonicalValue::str(lender))
            .field("limit_micros", CanonicalValue::Int(limit_micros))
            .field("spread_bps", CanonicalValue::Int(spread_bps as i64))
            .field_opt("maturity_ts_ms", maturity_ts_ms.map(CanonicalValue::Int))
            .field("action", CanonicalValue::str(action))
            .field("status", CanonicalValue::str(status))
            .field("seal_required", CanonicalValue::Bool(seal_required))
    }

    pub fn draw_or_repay(
        kind: &str,
        credit_line_id: &str,
        delta_principal_micros: Micros,
        new_principal_micros: Micros,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field(format!("{kind}_version"), CanonicalValue::Int(1))
            .field("credit_line_id", CanonicalValue::str(credit_line_id))
            .field("delta_principal_micros", CanonicalValue::Int(delta_principal_micros))
            .field("new_principal_micros", CanonicalValue::Int(new_principal_micros))
    }

    pub fn iar(
        credit_line_id: &str,
        principal_micros: Micros,
        spread_bps: u32,
        days: u32,
        interest_micros: Micros,
        window_id: &str,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("iar_version", CanonicalValue::Int(1))
            .field("credit_line_id", CanonicalValue::str(credit_line_id))
            .field("principal_micros", CanonicalValue::Int(principal_micros))
            .field("spread_bps", CanonicalValue::Int(spread_bps as i64))
            .field("days", CanonicalValue::Int(days as i64))
            .field("interest_micros", CanonicalValue::Int(interest_micros))
            .field("window_id", CanonicalValue::str(window_id))
    }

    pub fn fee(
        credit_line_id: &str,
        fee_type: &str,
        amount_micros: Micros,
        reason: Option<&str>,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("fee_version", CanonicalValue::Int(1))
            .field("credit_line_id", CanonicalValue::str(credit_line_id))
            .field("fee_type", CanonicalValue::str(fee_type))
            .field("amount_micros", CanonicalValue::Int(amount_micros))
            .field_opt("reason", reason.map(CanonicalValue::str))
    }

    pub fn coll(
        credit_line_id: &str,
        lock_id: &str,
        action: &str,
        asset_ref: &str,
        asset_type: &str,
        amount_micros: Micros,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("coll_version", CanonicalValue::Int(1))
            .field("credit_line_id", CanonicalValue::str(credit_line_id))
            .field("lock_id", CanonicalValue::str(lock_id))
            .field("action", CanonicalValue::str(action))
            .field("asset_ref", CanonicalValue::str(asset_ref))
            .field("asset_type", CanonicalValue::str(asset_type))
            .field("amount_micros", CanonicalValue::Int(amount_micros))
    }

    pub fn margin(
        credit_line_id: &str,
        margin_call_id: &str,
        action: &str,
        required_amount_micros: Option<Micros>,
        due_ts_ms: Option<i64>,
        status: &str,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("margin_version", CanonicalValue::Int(1))
            .field("credit_line_id", CanonicalValue::str(credit_line_id))
            .field("margin_call_id", CanonicalValue::str(margin_call_id))
            .field("action", CanonicalValue::str(action))
            .field_opt(
                "required_amount_micros",
                required_amount_micros.map(CanonicalValue::Int),
            )
            .field_opt("due_ts_ms", due_ts_ms.map(CanonicalValue::Int))
            .field("status", CanonicalValue::str(status))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn liq(
        credit_line_id: &str,
        margin_call_id: &str,
        per_lock_amounts: CanonicalValue,
        total_collateral_micros: Micros,
        liquidation_fee_micros: Micros,
        fees_covered_micros: Micros,
        interest_covered_micros: Micros,
        principal_covered_micros: Micros,
        shortfall_micros: Micros,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("liq_version", CanonicalValue::Int(1))
            .field("credit_line_id", CanonicalValue::str(credit_line_id))
            .field("margin_call_id", CanonicalValue::str(margin_call_id))
            .field("per_lock_amounts", per_lock_amounts)
            .field("total_collateral_micros", CanonicalValue::Int(total_collateral_micros))
            .field("liquidation_fee_micros", CanonicalValue::Int(liquidation_fee_micros))
            .field("fees_covered_micros", CanonicalValue::Int(fees_covered_micros))
            .field("interest_covered_micros", CanonicalValue::Int(interest_covered_micros))
            .field("principal_covered_micros", CanonicalValue::Int(principal_covered_micros))
            .field("shortfall_micros", CanonicalValue::Int(shortfall_micros))
    }

    pub fn alloc(
        allocation_id: &str,
        from_wallet: &str,
        to_wallet: &str,
        amount_micros: Micros,
        fee_micros: Micros,
        fee_bps: u32,
        window_id: Option<&str>,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("alloc_version", CanonicalValue::Int(1))
            .field("allocation_id", CanonicalValue::str(allocation_id))
            .field("from_wallet", CanonicalValue::str(from_wallet))
            .field("to_wallet", CanonicalValue::str(to_wallet))
            .field("amount_micros", CanonicalValue::Int(amount_micros))
            .field("fee_micros", CanonicalValue::Int(fee_micros))
            .field("fee_bps", CanonicalValue::Int(fee_bps as i64))
            .field_opt("window_id", window_id.map(CanonicalValue::str))
    }

    pub fn seal(target: &str, conformance_hash: &str) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("seal_version", CanonicalValue::Int(1))
            .field("target", CanonicalValue::str(target))
            .field("conformance_hash", CanonicalValue::str(conformance_hash))
    }

    pub fn mbs(
        agent: &str,
        total_receivable_micros: Micros,
        total_payable_micros: Micros,
        counterparty_positions: CanonicalValue,
        as_of_epoch_ms: i64,
        include_pending: bool,
        pending_receipt_count: u64,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("mbs_version", CanonicalValue::Int(1))
            .field("agent", CanonicalValue::str(agent))
            .field("total_receivable_micros", CanonicalValue::Int(total_receivable_micros))
            .field("total_payable_micros", CanonicalValue::Int(total_payable_micros))
            .field("counterparty_positions", counterparty_positions)
            .field("as_of_epoch_ms", CanonicalValue::Int(as_of_epoch_ms))
            .field("include_pending", CanonicalValue::Bool(include_pending))
            .field("pending_receipt_count", CanonicalValue::Int(pending_receipt_count as i64))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn alr(
        agent: &str,
        period_start_ms: i64,
        period_end_ms: i64,
        counterparty_breakdown: CanonicalValue,
        line_items: CanonicalValue,
        format: &str,
        total_receivable_micros: Micros,
        total_payable_micros: Micros,
    ) -> CanonicalMapBuilder {
        CanonicalValue::map()
            .field("alr_version", CanonicalValue::Int(1))
            .field("agent", CanonicalValue::str(agent))
            .field("period_start_ms", CanonicalValue::Int(period_start_ms))
            .field("period_end_ms", CanonicalValue::Int(period_end_ms))
            .field("counterparty_breakdown", counterparty_breakdown)
            .field("line_items", line_items)
            .field("format", CanonicalValue::str(format))
            .field("total_receivable_micros", CanonicalValue::Int(total_receivable_micros))
            .field("total_payable_micros", CanonicalValue::Int(total_payable_micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> ReceiptFactory {
        let (private, public) = ck_crypto::generate_keypair();
        ReceiptFactory::new(private, public)
    }

    #[test]
    fn sealed_receipt_verifies_under_kernel_pubkey() {
        let factory = factory();
        let payload = fields::msr("agent-a", "agent-b", 50_000_000, None, None);
        let receipt = factory.seal("MSR", "req-1", payload).unwrap();

        assert!(ck_crypto::verify(
            &receipt.receipt_hash,
            &receipt.kernel_signature,
            factory.kernel_pubkey_hex(),
        ));
    }

    #[test]
    fn receipt_hash_excludes_hash_and_signature_fields() {
        let factory = factory();
        let payload = fields::seal("agent-a", "conformance-hash-abc");
        let receipt = factory.seal("SEAL", "req-2", payload).unwrap();

        let recomputed_fields = CanonicalValue::map()
            .field("seal_version", CanonicalValue::Int(1))
            .field("target", CanonicalValue::str("agent-a"))
            .field("conformance_hash", CanonicalValue::str("conformance-hash-abc"))
            .field("receipt_type", CanonicalValue::str("SEAL"))
            .field("issuer", CanonicalValue::str("clearing-kernel"))
            .field("kernel_pubkey", CanonicalValue::str(factory.kernel_pubkey_hex()))
            .field("timestamp_ms", CanonicalValue::Int(receipt.timestamp_ms))
            .field("request_hash", CanonicalValue::str("req-2"))
            .build();
        let expected_hash = ck_crypto::hash(&canonicalize(&recomputed_fields));

        assert_eq!(receipt.receipt_hash, expected_hash);
    }

    #[test]
    fn two_receipts_built_moments_apart_have_distinct_hashes() {
        let factory = factory();
        let r1 = factory.seal("FEE", "req-a", fields::fee("cl-1", "origination", 1_000_000, None)).unwrap();
        let r2 = factory.seal("FEE", "req-b", fields::fee("cl-1", "origination", 1_000_000, None)).unwrap();
        assert_ne!(r1.receipt_hash, r2.receipt_hash);
    }
}

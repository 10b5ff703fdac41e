//! Internal funds ledger
//!
//! Append-only: a ledger entry is written once, in the same commit as the
//! wallet movement it records, and never touched again. All amounts are
//! integer minor units of a single currency; no floating point anywhere in
//! the money path.

use chrono::Utc;
use uuid::Uuid;

use crate::model::{paths, LedgerTx, LedgerTxType, PayoutBreakdown};
use crate::store::{DocumentStore, Precondition, StoreError, Write};

/// Split a bounty reward into platform fee, claimer share and filmer share.
///
/// `platform_fee = floor(reward * fee_bps / 10000)`, the filmer cut is a
/// floor of the net, and the claimer takes the remainder, so the three
/// parts always sum to the reward exactly.
pub fn payout_breakdown(
    reward: u64,
    fee_bps: u32,
    filmer_cut_bps: u32,
    filmer_confirmed: bool,
) -> PayoutBreakdown {
    let platform_fee = reward * fee_bps as u64 / 10_000;
    let net = reward - platform_fee;
    let filmer_amount = if filmer_confirmed {
        net * filmer_cut_bps as u64 / 10_000
    } else {
        0
    };
    let claimer_amount = net - filmer_amount;

    PayoutBreakdown {
        platform_fee,
        claimer_amount,
        filmer_amount,
    }
}

/// Amount returned to the creator when an open bounty expires. The retained
/// remainder is the listing fee.
pub fn refund_amount(reward: u64, refund_bps: u32) -> u64 {
    reward * refund_bps as u64 / 10_000
}

pub struct TxBuilder {
    tx: LedgerTx,
}

impl TxBuilder {
    pub fn new(tx_type: LedgerTxType, amount: u64, currency: &str) -> Self {
        Self {
            tx: LedgerTx {
                id: Uuid::new_v4().to_string(),
                tx_type,
                amount,
                currency: currency.to_string(),
                from_user: None,
                to_user: None,
                bounty_id: None,
                claim_id: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn from_user(mut self, user: &str) -> Self {
        self.tx.from_user = Some(user.to_string());
        self
    }

    pub fn to_user(mut self, user: &str) -> Self {
        self.tx.to_user = Some(user.to_string());
        self
    }

    pub fn bounty(mut self, bounty_id: &str) -> Self {
        self.tx.bounty_id = Some(bounty_id.to_string());
        self
    }

    pub fn claim(mut self, claim_id: &str) -> Self {
        self.tx.claim_id = Some(claim_id.to_string());
        self
    }

    /// Finish as a store write. Fresh uuid doc id, so the precondition is
    /// not-exists: an append can never overwrite an earlier entry.
    pub fn into_write(self) -> Result<Write, StoreError> {
        Write::put(
            paths::ledger_tx(&self.tx.id),
            Precondition::NotExists,
            &self.tx,
        )
    }
}

/// All ledger entries linked to one bounty, for audit and tests.
pub async fn entries_for_bounty(
    store: &dyn DocumentStore,
    bounty_id: &str,
) -> Result<Vec<LedgerTx>, StoreError> {
    let all = crate::store::list_docs::<LedgerTx>(store, "ledger/").await?;
    Ok(all
        .into_iter()
        .map(|(_, snap)| snap.doc)
        .filter(|tx| tx.bounty_id.as_deref() == Some(bounty_id))
        .collect())
}

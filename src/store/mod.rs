//! The transaction store (C1): a durable queue of public transactions
//! indexed by signing address, nonce, and status. See `SPEC_FULL.md` §4.1.

pub mod memory;
pub mod postgres;
pub mod retry;

use async_trait::async_trait;
use ethers::types::{Address, H256};

use crate::error::StoreError;
use crate::types::{
    ErrorKind, GasPrice, NewTransaction, PublicTransaction, TransactionFilter, TransactionId,
    TxStatus,
};

/// Fields updated alongside a status transition. Every field is optional so
/// a caller can update only what changed (e.g. bumping the attempt count
/// without touching the broadcast hash).
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub nonce: Option<u64>,
    pub gas_price: Option<GasPrice>,
    pub broadcast_hash: Option<H256>,
    pub attempt_count: Option<u32>,
    pub error_kind: Option<ErrorKind>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Enqueues a brand-new Pending transaction with no nonce assigned yet.
    async fn insert_transaction(&self, tx: NewTransaction) -> Result<TransactionId, StoreError>;

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<PublicTransaction>, StoreError>;

    /// Returns pending public transactions matching `filter`. Ordering is
    /// ascending creation sequence by default, descending nonce when the
    /// filter asks for it (the fueling manager's idempotence check).
    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PublicTransaction>, StoreError>;

    /// Single-result query filtered on `has_value = true`, descending
    /// nonce: the most recent outstanding fueling transaction to
    /// `destination`, if any.
    async fn get_pending_fueling_transaction(
        &self,
        source: Address,
        destination: Address,
    ) -> Result<Option<PublicTransaction>, StoreError>;

    /// First-submission-only nonce assignment. Rejected (as a `Refused`
    /// error) if the transaction already has a nonce.
    async fn assign_nonce(&self, id: TransactionId, nonce: u64) -> Result<(), StoreError>;

    /// Conditional update enforcing nonce invariant 1: rejects setting
    /// `Succeeded` while a lower nonce for the same signer is still
    /// non-terminal.
    async fn update_status(
        &self,
        id: TransactionId,
        new_status: TxStatus,
        fields: StatusUpdate,
    ) -> Result<(), StoreError>;

    /// Permitted only while status = Pending and no nonce assigned;
    /// otherwise refused.
    async fn cancel_transaction(&self, id: TransactionId) -> Result<(), StoreError>;

    /// Records an inclusion receipt for `hash`, used by the confirmation
    /// tracker.
    async fn record_receipt(
        &self,
        hash: H256,
        transaction_id: TransactionId,
        block_number: u64,
        succeeded: bool,
    ) -> Result<(), StoreError>;

    /// Removes a previously recorded receipt, used when a reorg drops the
    /// block it was included in before the confirmation threshold.
    async fn unrecord_receipt(&self, hash: H256) -> Result<(), StoreError>;

    /// The highest nonce among this signer's terminal (Succeeded or
    /// Failed) transactions, used to seed the completed-nonce cache on a
    /// miss.
    async fn highest_terminal_nonce(&self, signer: Address) -> Result<Option<u64>, StoreError>;
}

//! Wraps any [`Store`] so transient failures are retried indefinitely with
//! capped exponential backoff, per `SPEC_FULL.md` §4.1: "the engine treats
//! indefinite retry as the only correct behavior because losing the queue
//! would break nonce monotonicity." Non-transient errors (refusals, the
//! nonce invariant) pass straight through - retrying those would never
//! succeed and would hide a real bug or a legitimate refusal from the
//! caller.

use std::future::Future;

use async_trait::async_trait;
use ethers::types::{Address, H256};
use tracing::warn;

use super::{Store, StatusUpdate};
use crate::config::RetryConfig;
use crate::error::StoreError;
use crate::shutdown::Shutdown;
use crate::types::{NewTransaction, PublicTransaction, TransactionFilter, TransactionId, TxStatus};
use crate::utils::Backoff;

pub struct RetryingStore<S> {
    inner: S,
    retry: RetryConfig,
    shutdown: Shutdown,
}

impl<S: Store> RetryingStore<S> {
    pub const fn new(inner: S, retry: RetryConfig, shutdown: Shutdown) -> Self {
        Self { inner, retry, shutdown }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.retry.initial_delay, self.retry.max_delay, self.retry.factor)
    }

    /// Retries `op` until it succeeds, hits a non-transient error, or
    /// shutdown begins (in which case the last transient error is
    /// returned).
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut backoff = self.backoff();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() => {
                    warn!(%error, "retrying store operation after transient error");
                    if self.shutdown.is_shutting_down() {
                        return Err(error);
                    }
                    backoff.wait().await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl<S: Store> Store for RetryingStore<S> {
    async fn insert_transaction(&self, tx: NewTransaction) -> Result<TransactionId, StoreError> {
        self.with_retry(|| self.inner.insert_transaction(tx.clone())).await
    }

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<PublicTransaction>, StoreError> {
        self.with_retry(|| self.inner.get_transaction(id)).await
    }

    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PublicTransaction>, StoreError> {
        self.with_retry(|| self.inner.list_transactions(filter.clone())).await
    }

    async fn get_pending_fueling_transaction(
        &self,
        source: Address,
        destination: Address,
    ) -> Result<Option<PublicTransaction>, StoreError> {
        self.with_retry(|| self.inner.get_pending_fueling_transaction(source, destination)).await
    }

    async fn assign_nonce(&self, id: TransactionId, nonce: u64) -> Result<(), StoreError> {
        self.with_retry(|| self.inner.assign_nonce(id, nonce)).await
    }

    async fn update_status(
        &self,
        id: TransactionId,
        new_status: TxStatus,
        fields: StatusUpdate,
    ) -> Result<(), StoreError> {
        self.with_retry(|| self.inner.update_status(id, new_status, fields.clone())).await
    }

    async fn cancel_transaction(&self, id: TransactionId) -> Result<(), StoreError> {
        self.with_retry(|| self.inner.cancel_transaction(id)).await
    }

    async fn record_receipt(
        &self,
        hash: H256,
        transaction_id: TransactionId,
        block_number: u64,
        succeeded: bool,
    ) -> Result<(), StoreError> {
        self.with_retry(|| self.inner.record_receipt(hash, transaction_id, block_number, succeeded))
            .await
    }

    async fn unrecord_receipt(&self, hash: H256) -> Result<(), StoreError> {
        self.with_retry(|| self.inner.unrecord_receipt(hash)).await
    }

    async fn highest_terminal_nonce(&self, signer: Address) -> Result<Option<u64>, StoreError> {
        self.with_retry(|| self.inner.highest_terminal_nonce(signer)).await
    }
}

//! Confirmation Tracker (C6, `SPEC_FULL.md` §4.6): watches the base
//! ledger's new-block stream, resolves receipts for outstanding broadcast
//! hashes, and applies the `k`-block confirmation threshold, including
//! reorg handling.

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::H256;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::error::StoreError;
use crate::fueling::CompletedNonceCache;
use crate::ledger::BaseLedger;
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::types::{ReceiptStatus, TransactionId, TxStatus};
use crate::utils::Backoff;

/// A hash currently being watched for inclusion, tied to the transaction
/// it was broadcast for.
#[derive(Clone, Copy)]
struct Watched {
    transaction_id: TransactionId,
    signer: ethers::types::Address,
    nonce: u64,
}

/// Tracks broadcast hashes pending confirmation. Orchestrators register a
/// hash here when they broadcast; the tracker removes it once it reaches
/// the configured confirmation depth or is proven permanently failed.
pub struct ConfirmationTracker<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    completed_nonces: Arc<CompletedNonceCache>,
    confirmation_blocks: u64,
    watched: Mutex<HashMap<H256, Watched>>,
    confirmed_at: Mutex<HashMap<H256, u64>>,
}

impl<S: Store, L: BaseLedger> ConfirmationTracker<S, L> {
    pub fn new(
        store: Arc<S>,
        ledger: Arc<L>,
        completed_nonces: Arc<CompletedNonceCache>,
        confirmation_blocks: u64,
    ) -> Self {
        Self {
            store,
            ledger,
            completed_nonces,
            confirmation_blocks,
            watched: Mutex::new(HashMap::new()),
            confirmed_at: Mutex::new(HashMap::new()),
        }
    }

    pub async fn watch(&self, hash: H256, transaction_id: TransactionId, signer: ethers::types::Address, nonce: u64) {
        self.watched.lock().await.insert(hash, Watched { transaction_id, signer, nonce });
    }

    /// Runs until shutdown, reacting to each new block by resolving
    /// receipts for every outstanding hash.
    pub async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        let mut backoff = Backoff::new(
            std::time::Duration::from_millis(250),
            std::time::Duration::from_secs(30),
            2.0,
        );

        loop {
            if shutdown.is_shutting_down() {
                return Ok(());
            }

            let mut stream = match self.ledger.subscribe_new_blocks().await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%error, "failed to subscribe to new blocks, retrying");
                    backoff.wait().await;
                    continue;
                }
            };

            while let Some(block_number) = stream.next().await {
                if shutdown.is_shutting_down() {
                    return Ok(());
                }
                if let Err(error) = self.on_new_block(block_number).await {
                    warn!(%error, "error resolving receipts for block");
                }
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn on_new_block(&self, block_number: u64) -> Result<(), StoreError> {
        let hashes: Vec<H256> = self.watched.lock().await.keys().copied().collect();

        for hash in hashes {
            self.resolve(hash, block_number).await?;
        }

        self.check_reorgs(block_number).await?;
        Ok(())
    }

    async fn resolve(&self, hash: H256, current_block: u64) -> Result<(), StoreError> {
        let Some(watched) = self.watched.lock().await.get(&hash).copied() else {
            return Ok(());
        };

        let receipt = match self.ledger.get_receipt(hash).await {
            Ok(receipt) => receipt,
            Err(error) => {
                warn!(%error, "failed to fetch receipt");
                return Ok(());
            }
        };

        let Some(receipt) = receipt else { return Ok(()) };

        if current_block.saturating_sub(receipt.block_number) < self.confirmation_blocks {
            self.confirmed_at.lock().await.insert(hash, receipt.block_number);
            return Ok(());
        }

        let succeeded = matches!(receipt.status, ReceiptStatus::Succeeded);
        self.store
            .record_receipt(hash, watched.transaction_id, receipt.block_number, succeeded)
            .await?;

        let new_status = if succeeded { TxStatus::Succeeded } else { TxStatus::Failed };
        self.store
            .update_status(watched.transaction_id, new_status, crate::store::StatusUpdate::default())
            .await?;

        self.completed_nonces.record(watched.signer, watched.nonce);
        self.watched.lock().await.remove(&hash);
        self.confirmed_at.lock().await.remove(&hash);
        Ok(())
    }

    /// Reorg handling: a hash with a receipt not yet past the confirmation
    /// threshold (tracked in `confirmed_at`) whose block disappears is
    /// un-marked - the transaction is still `Submitted` in the store (it
    /// was never promoted to terminal), so it simply stays watched and
    /// will be re-resolved, and re-broadcast by its orchestrator, on a
    /// later tick. A reorg deep enough to revert an already-finalized
    /// (past-threshold) receipt is outside `confirmation_blocks`' purpose
    /// and is not handled here.
    async fn check_reorgs(&self, current_block: u64) -> Result<(), StoreError> {
        let tentative: Vec<(H256, u64)> = self.confirmed_at.lock().await.iter().map(|(h, b)| (*h, *b)).collect();

        for (hash, recorded_block) in tentative {
            let still_present = match self.ledger.get_receipt(hash).await {
                Ok(receipt) => receipt.is_some_and(|r| r.block_number == recorded_block),
                Err(error) => {
                    warn!(%error, "failed to re-check receipt during reorg scan");
                    continue;
                }
            };

            if !still_present {
                warn!(%hash, current_block, "reorg dropped a previously observed receipt");
                self.confirmed_at.lock().await.remove(&hash);
            }
        }
        Ok(())
    }
}

//! An in-memory [`Store`], used by the engine's own test suite so
//! orchestrator and engine behavior can be exercised without a database.
//! Implements the same nonce invariant the Postgres store enforces with a
//! unique index and a conditional update.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{Address, H256};

use super::{StatusUpdate, Store};
use crate::error::StoreError;
use crate::types::{NewTransaction, PublicTransaction, TransactionFilter, TransactionId, TxStatus};

#[derive(Default)]
struct Inner {
    rows: HashMap<TransactionId, PublicTransaction>,
    next_sequence: i64,
    receipts: HashMap<H256, (TransactionId, u64, bool)>,
    /// Durable mirror of each signer's highest terminal nonce, maintained
    /// alongside `rows` the way `completed_nonces` mirrors
    /// `public_transactions` in the Postgres store.
    completed_nonces: HashMap<Address, u64>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_transaction(&self, tx: NewTransaction) -> Result<TransactionId, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = TransactionId::new_v4();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        inner.rows.insert(
            id,
            PublicTransaction {
                id,
                signing_address: tx.signing_address,
                nonce: None,
                status: TxStatus::Pending,
                to: tx.to,
                data: tx.data,
                value: tx.value,
                gas_limit: tx.gas_limit,
                gas_price: None,
                has_value: tx.has_value,
                sequence,
                last_action_time: Utc::now(),
                attempt_count: 0,
                last_broadcast_hash: None,
                last_error_kind: None,
            },
        );
        Ok(id)
    }

    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<PublicTransaction>, StoreError> {
        Ok(self.inner.lock().unwrap().rows.get(&id).cloned())
    }

    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PublicTransaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<PublicTransaction> = inner
            .rows
            .values()
            .filter(|row| filter.status.is_none_or(|s| s == row.status))
            .filter(|row| !filter.not_from.contains(&row.signing_address))
            .cloned()
            .collect();

        match filter.order {
            crate::types::SortOrder::AscendingSequence => {
                rows.sort_by_key(|row| row.sequence);
            }
            crate::types::SortOrder::DescendingNonce => {
                rows.sort_by_key(|row| std::cmp::Reverse(row.nonce));
            }
        }

        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn get_pending_fueling_transaction(
        &self,
        source: Address,
        destination: Address,
    ) -> Result<Option<PublicTransaction>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matches: Vec<_> = inner
            .rows
            .values()
            .filter(|row| {
                row.has_value
                    && row.signing_address == source
                    && row.to == destination
                    && !row.status.is_terminal()
            })
            .cloned()
            .collect();
        matches.sort_by_key(|row| std::cmp::Reverse(row.nonce));
        Ok(matches.into_iter().next())
    }

    async fn assign_nonce(&self, id: TransactionId, nonce: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Refused("no such transaction".into()))?;
        if row.nonce.is_some() {
            return Err(StoreError::Refused("nonce already assigned".into()));
        }
        row.nonce = Some(nonce);
        Ok(())
    }

    async fn update_status(
        &self,
        id: TransactionId,
        new_status: TxStatus,
        fields: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();

        let (signer, nonce) = {
            let row = inner
                .rows
                .get(&id)
                .ok_or_else(|| StoreError::Refused("no such transaction".into()))?;
            (row.signing_address, row.nonce)
        };

        if new_status == TxStatus::Succeeded {
            if let Some(nonce) = nonce {
                let blocking = inner.rows.values().find(|other| {
                    other.id != id
                        && other.signing_address == signer
                        && other.nonce.is_some_and(|n| n < nonce)
                        && !other.status.is_terminal()
                });
                if let Some(blocking) = blocking {
                    return Err(StoreError::NonceInvariant {
                        signer: format!("{signer:?}"),
                        blocking_nonce: blocking.nonce.unwrap(),
                    });
                }
            }
        }

        let row = inner.rows.get_mut(&id).unwrap();
        row.status = new_status;
        row.last_action_time = Utc::now();
        if let Some(nonce) = fields.nonce {
            row.nonce = Some(nonce);
        }
        if let Some(gas_price) = fields.gas_price {
            row.gas_price = Some(gas_price);
        }
        if let Some(hash) = fields.broadcast_hash {
            row.last_broadcast_hash = Some(hash);
        }
        if let Some(count) = fields.attempt_count {
            row.attempt_count = count;
        }
        if let Some(kind) = fields.error_kind {
            row.last_error_kind = Some(kind);
        }

        if new_status.is_terminal() {
            if let Some(nonce) = row.nonce {
                let entry = inner.completed_nonces.entry(signer).or_insert(nonce);
                if nonce > *entry {
                    *entry = nonce;
                }
            }
        }
        Ok(())
    }

    async fn cancel_transaction(&self, id: TransactionId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Refused("no such transaction".into()))?;
        if row.status != TxStatus::Pending || row.nonce.is_some() {
            return Err(StoreError::Refused(
                "transaction already has a nonce assigned".into(),
            ));
        }
        row.status = TxStatus::Failed;
        Ok(())
    }

    async fn record_receipt(
        &self,
        hash: H256,
        transaction_id: TransactionId,
        block_number: u64,
        succeeded: bool,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .receipts
            .insert(hash, (transaction_id, block_number, succeeded));
        Ok(())
    }

    async fn unrecord_receipt(&self, hash: H256) -> Result<(), StoreError> {
        self.inner.lock().unwrap().receipts.remove(&hash);
        Ok(())
    }

    async fn highest_terminal_nonce(&self, signer: Address) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.lock().unwrap().completed_nonces.get(&signer).copied())
    }
}

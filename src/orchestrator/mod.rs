//! Orchestrator (C4, `SPEC_FULL.md` §4.4): the per-signing-address state
//! machine. Owns a bounded in-flight queue and drives each transaction
//! through nonce assignment, gas pricing, signing, and broadcast.

mod metrics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::core::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip2930::AccessList;
use ethers::types::{Address, Eip1559TransactionRequest, TransactionRequest};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{instrument, warn};

use crate::config::OrchestratorConfig;
use crate::error::LedgerError;
use crate::fueling::{CompletedNonceCache, FuelingManager};
use crate::gas_oracle::GasPriceOracle;
use crate::keystore::KeyStore;
use crate::ledger::BaseLedger;
use crate::store::{StatusUpdate, Store};
use crate::types::{ErrorKind, GasPrice, PublicTransaction, TxStatus};
use crate::utils::async_queue::AsyncQueue;

/// The orchestrator's lifecycle state (`SPEC_FULL.md` §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestratorState {
    Stale,
    Idle,
    Running,
    Paused,
    Stopped,
}

struct StateInfo {
    state: OrchestratorState,
    entered_at: Instant,
}

/// Owns one signing address's in-flight work. Exclusively owned and
/// scheduled by the engine; never holds a reference back to it (the
/// cyclic-ownership design note in `SPEC_FULL.md` §9).
pub struct Orchestrator<S, L, K> {
    pub signing_address: Address,
    birth: Instant,
    state: AsyncMutex<StateInfo>,
    queue: AsyncQueue<PublicTransaction>,
    next_nonce: AsyncMutex<Option<u64>>,
    store: Arc<S>,
    ledger: Arc<L>,
    keystore: Arc<K>,
    gas_oracle: Arc<GasPriceOracle<L>>,
    fueling: Arc<FuelingManager<S>>,
    completed_nonces: Arc<CompletedNonceCache>,
    config: OrchestratorConfig,
    chain_id: u64,
    legacy: bool,
    stopped: AtomicBool,
}

impl<S: Store, L: BaseLedger, K: KeyStore> Orchestrator<S, L, K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signing_address: Address,
        store: Arc<S>,
        ledger: Arc<L>,
        keystore: Arc<K>,
        gas_oracle: Arc<GasPriceOracle<L>>,
        fueling: Arc<FuelingManager<S>>,
        completed_nonces: Arc<CompletedNonceCache>,
        config: OrchestratorConfig,
        chain_id: u64,
        legacy: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            signing_address,
            birth: now,
            state: AsyncMutex::new(StateInfo { state: OrchestratorState::Stale, entered_at: now }),
            queue: AsyncQueue::new(config.max_in_flight_queue),
            next_nonce: AsyncMutex::new(None),
            store,
            ledger,
            keystore,
            gas_oracle,
            fueling,
            completed_nonces,
            config,
            chain_id,
            legacy,
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn birth(&self) -> Instant {
        self.birth
    }

    pub async fn state(&self) -> OrchestratorState {
        self.state.lock().await.state
    }

    pub async fn state_age(&self) -> Duration {
        self.state.lock().await.entered_at.elapsed()
    }

    async fn transition(&self, new_state: OrchestratorState) {
        let mut info = self.state.lock().await;
        if info.state != new_state {
            info.state = new_state;
            info.entered_at = Instant::now();
        }
    }

    /// Enqueues a new transaction for this signer. Blocks if the in-flight
    /// queue is at capacity; the engine's capacity phase is what prevents
    /// this from happening in practice.
    pub async fn enqueue(&self, tx: PublicTransaction) {
        self.queue.push(tx).await;
        self.transition(OrchestratorState::Running).await;
    }

    /// Idempotent stop request. The state transition is observed by the
    /// engine only on its next poll (`SPEC_FULL.md` §4.4 stop semantics).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn seeded_nonce(&self) -> Result<u64, LedgerError> {
        let mut next = self.next_nonce.lock().await;
        if let Some(nonce) = *next {
            return Ok(nonce);
        }
        let seeded = self.ledger.get_nonce(self.signing_address).await?;
        *next = Some(seeded);
        Ok(seeded)
    }

    async fn take_nonce(&self) -> Result<u64, LedgerError> {
        let nonce = self.seeded_nonce().await?;
        *self.next_nonce.lock().await = Some(nonce + 1);
        Ok(nonce)
    }

    /// Runs one pass over the in-flight queue, in ascending nonce order.
    /// Drains the queue, processes each entry, and replaces whatever is
    /// still in-flight afterward. Returns `Ok(())` unless a fatal
    /// (non-recoverable) condition occurred.
    #[instrument(skip(self), fields(signer = %format!("{:#x}", self.signing_address)))]
    pub async fn tick(&self) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            self.transition(OrchestratorState::Stopped).await;
            return Ok(());
        }

        let mut transactions = self.queue.drain().await;
        transactions.sort_by_key(|tx| tx.nonce.unwrap_or(u64::MAX));

        let mut still_in_flight = Vec::with_capacity(transactions.len());
        let mut suspended_gap = 0u32;
        let mut gap_limited = false;

        for tx in transactions {
            if self.completed_nonces.check_transaction_completed(self.store.as_ref(), &tx).await.is_ok_and(|done| done) {
                continue;
            }

            if suspended_gap >= self.config.suspended_gap_limit {
                gap_limited = true;
                still_in_flight.push(tx);
                continue;
            }

            match self.advance(tx).await {
                Advance::Requeue(tx) => still_in_flight.push(tx),
                Advance::Suspended(tx) => {
                    suspended_gap += 1;
                    still_in_flight.push(tx);
                }
            }
        }

        self.queue.replace(still_in_flight).await;

        if gap_limited {
            self.transition(OrchestratorState::Paused).await;
        } else if self.queue.is_empty().await {
            self.transition(OrchestratorState::Idle).await;
        } else {
            self.transition(OrchestratorState::Running).await;
        }

        Ok(())
    }

    /// Advances one transaction by at most one broadcast attempt, per the
    /// per-tick algorithm (`SPEC_FULL.md` §4.4 steps 1-4).
    async fn advance(&self, mut tx: PublicTransaction) -> Advance {
        if tx.status == TxStatus::Pending && tx.nonce.is_none() {
            match self.take_nonce().await {
                Ok(nonce) => {
                    if let Err(error) = self.store.assign_nonce(tx.id, nonce).await {
                        warn!(%error, "failed to persist assigned nonce");
                        return Advance::Requeue(tx);
                    }
                    tx.nonce = Some(nonce);
                }
                Err(error) => {
                    warn!(%error, "failed to seed nonce from ledger");
                    return Advance::Requeue(tx);
                }
            }
        }

        let snapshot = match self.gas_oracle.current_price().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(%error, "gas oracle unavailable, deferring broadcast");
                return Advance::Requeue(tx);
            }
        };

        let current_price = snapshot.price.as_gas_price();
        let price = match tx.gas_price {
            Some(old) if old.is_stale_against(current_price, self.config.replacement_threshold_pct) => {
                old.bump(self.config.replacement_threshold_pct)
            }
            Some(old) => old,
            None => current_price,
        };

        let broadcast_deadline = self.config.broadcast_deadline;
        match tokio::time::timeout(broadcast_deadline, self.broadcast(&tx, price)).await {
            Ok(Ok(hash)) => {
                metrics::BROADCASTS_TOTAL.inc();
                let update = StatusUpdate {
                    nonce: tx.nonce,
                    gas_price: Some(price),
                    broadcast_hash: Some(hash),
                    attempt_count: Some(tx.attempt_count + 1),
                    error_kind: None,
                };
                if let Err(error) = self.store.update_status(tx.id, TxStatus::Submitted, update).await {
                    warn!(%error, "failed to persist submitted status");
                }
                tx.status = TxStatus::Submitted;
                tx.gas_price = Some(price);
                tx.attempt_count += 1;
                Advance::Requeue(tx)
            }
            Ok(Err(LedgerError::BenignRejection(reason))) => {
                warn!(reason, "benign broadcast rejection, treating as already in-flight");
                tx.status = TxStatus::Submitted;
                Advance::Requeue(tx)
            }
            Ok(Err(LedgerError::Transient(reason))) => {
                warn!(reason, "transient broadcast failure, retrying next tick");
                Advance::Requeue(tx)
            }
            Ok(Err(error @ LedgerError::NonBenignRejection(_))) => self.handle_rejection(tx, error).await,
            Ok(Err(LedgerError::FatalConfig(reason))) => {
                if let Err(error) = self
                    .store
                    .update_status(
                        tx.id,
                        TxStatus::Suspended,
                        StatusUpdate { error_kind: Some(ErrorKind::FatalConfig), ..Default::default() },
                    )
                    .await
                {
                    warn!(%error, "failed to persist fatal-config suspension");
                }
                warn!(reason, "fatal config error broadcasting transaction");
                tx.status = TxStatus::Suspended;
                Advance::Suspended(tx)
            }
            Err(_elapsed) => {
                warn!("broadcast deadline elapsed, deferring judgment to confirmation tracking");
                Advance::Requeue(tx)
            }
        }
    }

    async fn handle_rejection(&self, mut tx: PublicTransaction, error: LedgerError) -> Advance {
        let reason = error.to_string();
        if reason.to_ascii_lowercase().contains("insufficient funds") {
            match self.fueling.funding_amount() {
                Ok(amount) => {
                    if let Err(error) = self.fueling.request_fueling(self.signing_address, amount).await {
                        warn!(%error, "failed to request fueling");
                    }
                }
                Err(error) => warn!(%error, "failed to compute fueling amount"),
            }
        }

        let attempt_count = tx.attempt_count + 1;
        let mut update = StatusUpdate {
            attempt_count: Some(attempt_count),
            error_kind: Some(error.kind()),
            ..Default::default()
        };

        if attempt_count >= self.config.max_attempts {
            warn!(reason, attempt_count, "transaction exceeded max attempts, suspending");
            if let Err(error) = self.store.update_status(tx.id, TxStatus::Suspended, update).await {
                warn!(%error, "failed to persist suspension");
            }
            tx.status = TxStatus::Suspended;
            tx.attempt_count = attempt_count;
            return Advance::Suspended(tx);
        }

        update.nonce = None;
        if let Err(error) = self.store.update_status(tx.id, tx.status, update).await {
            warn!(%error, "failed to persist attempt count");
        }
        tx.attempt_count = attempt_count;
        Advance::Requeue(tx)
    }

    async fn broadcast(&self, tx: &PublicTransaction, price: GasPrice) -> Result<ethers::types::H256, LedgerError> {
        let nonce = tx.nonce.expect("nonce assigned before broadcast");
        let typed = self.build_typed_transaction(tx, nonce, price);
        let raw = self.keystore.sign(self.signing_address, &typed).await?;
        self.ledger.send_raw_transaction(raw).await
    }

    fn build_typed_transaction(&self, tx: &PublicTransaction, nonce: u64, price: GasPrice) -> TypedTransaction {
        if self.legacy {
            let gas_price = match price {
                GasPrice::Legacy { gas_price } => gas_price,
                GasPrice::Eip1559 { max_fee_per_gas, .. } => max_fee_per_gas,
            };
            TypedTransaction::Legacy(
                TransactionRequest::new()
                    .to(tx.to)
                    .data(tx.data.clone())
                    .value(tx.value)
                    .gas(tx.gas_limit)
                    .gas_price(gas_price)
                    .nonce(nonce)
                    .chain_id(self.chain_id),
            )
        } else {
            let (max_fee, priority_fee) = match price {
                GasPrice::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas } => {
                    (max_fee_per_gas, max_priority_fee_per_gas)
                }
                GasPrice::Legacy { gas_price } => (gas_price, gas_price),
            };
            TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .to(tx.to)
                    .data(tx.data.clone())
                    .value(tx.value)
                    .gas(tx.gas_limit)
                    .max_fee_per_gas(max_fee)
                    .max_priority_fee_per_gas(priority_fee)
                    .nonce(nonce)
                    .chain_id(self.chain_id)
                    .access_list(AccessList::default()),
            )
        }
    }
}

enum Advance {
    /// The transaction remains in-flight and goes back on the queue.
    Requeue(PublicTransaction),
    /// The transaction was suspended; stays queued so an operator can see
    /// it and because the gap-limit rule may need to halt later nonces.
    Suspended(PublicTransaction),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use ethers::types::{Bytes, U256};

    use super::*;
    use crate::fueling::{CompletedNonceCache, FuelingManager};
    use crate::gas_oracle::GasPriceOracle;
    use crate::ledger::CurrentPrice;
    use crate::store::memory::MemStore;
    use crate::types::{NewTransaction, Receipt};

    enum Broadcast {
        Ok(ethers::types::H256),
        FatalConfig(String),
    }

    struct MockLedger {
        nonce: u64,
        price: CurrentPrice,
        broadcast: StdMutex<Broadcast>,
    }

    #[async_trait]
    impl BaseLedger for MockLedger {
        async fn estimate_gas(&self, _: Address, _: &Bytes, _: U256) -> Result<U256, LedgerError> {
            unimplemented!()
        }
        async fn get_nonce(&self, _: Address) -> Result<u64, LedgerError> {
            Ok(self.nonce)
        }
        async fn current_price(&self) -> Result<CurrentPrice, LedgerError> {
            Ok(self.price)
        }
        async fn send_raw_transaction(&self, _: Bytes) -> Result<ethers::types::H256, LedgerError> {
            match &*self.broadcast.lock().unwrap() {
                Broadcast::Ok(hash) => Ok(*hash),
                Broadcast::FatalConfig(reason) => Err(LedgerError::FatalConfig(reason.clone())),
            }
        }
        async fn get_receipt(&self, _: ethers::types::H256) -> Result<Option<Receipt>, LedgerError> {
            unimplemented!()
        }
        async fn subscribe_new_blocks<'a>(
            &'a self,
        ) -> Result<Box<dyn futures::Stream<Item = u64> + Send + Unpin + 'a>, LedgerError> {
            unimplemented!()
        }
    }

    struct MockKeyStore {
        captured: StdMutex<Vec<TypedTransaction>>,
    }

    impl MockKeyStore {
        fn new() -> Self {
            Self { captured: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl KeyStore for MockKeyStore {
        async fn sign(&self, _: Address, tx: &TypedTransaction) -> Result<Bytes, LedgerError> {
            self.captured.lock().unwrap().push(tx.clone());
            Ok(Bytes::default())
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn harness(
        store: Arc<MemStore>,
        ledger: Arc<MockLedger>,
        keystore: Arc<MockKeyStore>,
        config: OrchestratorConfig,
    ) -> Orchestrator<MemStore, MockLedger, MockKeyStore> {
        let gas_oracle = Arc::new(GasPriceOracle::new(ledger.clone(), Duration::from_secs(60)));
        let fueling = Arc::new(FuelingManager::new(
            store.clone(),
            crate::config::FuelingConfig {
                funding_address: Address::from_low_u64_be(0xF00D),
                minimum_balance: "0".into(),
            },
        ));
        Orchestrator::new(
            Address::from_low_u64_be(1),
            store,
            ledger,
            keystore,
            gas_oracle,
            fueling,
            Arc::new(CompletedNonceCache::new()),
            config,
            1,
            true,
        )
    }

    fn new_tx(signer: Address) -> NewTransaction {
        NewTransaction {
            signing_address: signer,
            to: Address::zero(),
            data: Bytes::default(),
            value: U256::zero(),
            gas_limit: U256::from(21_000),
            has_value: false,
        }
    }

    #[tokio::test]
    async fn happy_path_broadcasts_and_stays_in_flight_pending_confirmation() {
        let store = Arc::new(MemStore::new());
        let signer = Address::from_low_u64_be(1);
        let id = store.insert_transaction(new_tx(signer)).await.unwrap();

        let hash = ethers::types::H256::random();
        let ledger = Arc::new(MockLedger {
            nonce: 7,
            price: CurrentPrice::Legacy { gas_price: U256::from(100) },
            broadcast: StdMutex::new(Broadcast::Ok(hash)),
        });
        let keystore = Arc::new(MockKeyStore::new());
        let orchestrator = harness(store.clone(), ledger, keystore, OrchestratorConfig::default());

        let tx = store.get_transaction(id).await.unwrap().unwrap();
        orchestrator.enqueue(tx).await;
        orchestrator.tick().await.unwrap();

        let updated = store.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(updated.status, TxStatus::Submitted);
        assert_eq!(updated.nonce, Some(7));
        assert_eq!(updated.last_broadcast_hash, Some(hash));
        assert_eq!(orchestrator.queue.len().await, 1);
    }

    #[tokio::test]
    async fn completed_nonce_drops_transaction_from_queue() {
        let store = Arc::new(MemStore::new());
        let signer = Address::from_low_u64_be(1);
        let id = store.insert_transaction(new_tx(signer)).await.unwrap();
        store.assign_nonce(id, 3).await.unwrap();

        let ledger = Arc::new(MockLedger {
            nonce: 0,
            price: CurrentPrice::Legacy { gas_price: U256::from(1) },
            broadcast: StdMutex::new(Broadcast::Ok(ethers::types::H256::random())),
        });
        let keystore = Arc::new(MockKeyStore::new());
        let orchestrator = harness(store.clone(), ledger, keystore, OrchestratorConfig::default());

        orchestrator.completed_nonces.record(signer, 3);
        let tx = store.get_transaction(id).await.unwrap().unwrap();
        orchestrator.enqueue(tx).await;
        orchestrator.tick().await.unwrap();

        assert!(orchestrator.queue.is_empty().await);
    }

    #[tokio::test]
    async fn suspended_gap_limit_halts_subsequent_nonces() {
        let store = Arc::new(MemStore::new());
        let signer = Address::from_low_u64_be(1);
        let low = store.insert_transaction(new_tx(signer)).await.unwrap();
        let high = store.insert_transaction(new_tx(signer)).await.unwrap();
        store.assign_nonce(low, 0).await.unwrap();
        store.assign_nonce(high, 1).await.unwrap();

        let ledger = Arc::new(MockLedger {
            nonce: 0,
            price: CurrentPrice::Legacy { gas_price: U256::from(1) },
            broadcast: StdMutex::new(Broadcast::FatalConfig("no key".into())),
        });
        let keystore = Arc::new(MockKeyStore::new());
        // Default `suspended_gap_limit` (1): tolerate one suspended nonce
        // ahead of the gap, then halt.
        let config = OrchestratorConfig::default();
        assert_eq!(config.suspended_gap_limit, 1);
        let orchestrator = harness(store.clone(), ledger, keystore, config);

        orchestrator.enqueue(store.get_transaction(low).await.unwrap().unwrap()).await;
        orchestrator.enqueue(store.get_transaction(high).await.unwrap().unwrap()).await;
        orchestrator.tick().await.unwrap();

        let low_after = store.get_transaction(low).await.unwrap().unwrap();
        let high_after = store.get_transaction(high).await.unwrap().unwrap();
        assert_eq!(low_after.status, TxStatus::Suspended);
        assert_eq!(high_after.status, TxStatus::Pending, "gap-limited nonce must not be advanced this tick");
        assert_eq!(orchestrator.queue.len().await, 2);
        assert_eq!(orchestrator.state().await, OrchestratorState::Paused);
    }

    #[tokio::test]
    async fn suspended_gap_limit_zero_halts_immediately() {
        let store = Arc::new(MemStore::new());
        let signer = Address::from_low_u64_be(1);
        let low = store.insert_transaction(new_tx(signer)).await.unwrap();
        store.assign_nonce(low, 0).await.unwrap();

        let ledger = Arc::new(MockLedger {
            nonce: 0,
            price: CurrentPrice::Legacy { gas_price: U256::from(1) },
            broadcast: StdMutex::new(Broadcast::FatalConfig("no key".into())),
        });
        let keystore = Arc::new(MockKeyStore::new());
        let config = OrchestratorConfig { suspended_gap_limit: 0, ..OrchestratorConfig::default() };
        let orchestrator = harness(store.clone(), ledger, keystore, config);

        orchestrator.enqueue(store.get_transaction(low).await.unwrap().unwrap()).await;
        orchestrator.tick().await.unwrap();

        let low_after = store.get_transaction(low).await.unwrap().unwrap();
        assert_eq!(low_after.status, TxStatus::Pending, "a zero gap limit halts before any nonce advances");
        assert_eq!(orchestrator.state().await, OrchestratorState::Paused);
    }

    #[tokio::test]
    async fn stale_price_bumps_before_rebroadcast() {
        let store = Arc::new(MemStore::new());
        let signer = Address::from_low_u64_be(1);
        let id = store.insert_transaction(new_tx(signer)).await.unwrap();
        store.assign_nonce(id, 0).await.unwrap();
        store
            .update_status(
                id,
                TxStatus::Submitted,
                StatusUpdate {
                    gas_price: Some(GasPrice::Legacy { gas_price: U256::from(100) }),
                    broadcast_hash: Some(ethers::types::H256::random()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let ledger = Arc::new(MockLedger {
            nonce: 0,
            price: CurrentPrice::Legacy { gas_price: U256::from(200) },
            broadcast: StdMutex::new(Broadcast::Ok(ethers::types::H256::random())),
        });
        let keystore = Arc::new(MockKeyStore::new());
        let config = OrchestratorConfig { replacement_threshold_pct: 10, ..OrchestratorConfig::default() };
        let orchestrator = harness(store.clone(), ledger, keystore.clone(), config);

        orchestrator.enqueue(store.get_transaction(id).await.unwrap().unwrap()).await;
        orchestrator.tick().await.unwrap();

        let updated = store.get_transaction(id).await.unwrap().unwrap();
        assert_eq!(updated.gas_price, Some(GasPrice::Legacy { gas_price: U256::from(110) }));

        let captured = keystore.captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        match &captured[0] {
            TypedTransaction::Legacy(inner) => assert_eq!(inner.gas_price, Some(U256::from(110))),
            other => panic!("expected legacy transaction, got {other:?}"),
        }
    }
}

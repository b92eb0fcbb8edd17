//! Engine (C5, `SPEC_FULL.md` §4.5): the pool manager. Owns the set of
//! orchestrators, polls the store, enforces max concurrency and fairness,
//! and pauses/resumes stuck signers.

mod metrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ethers::types::Address;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::{EngineConfig, OrchestratorConfig};
use crate::fueling::{CompletedNonceCache, FuelingManager};
use crate::gas_oracle::GasPriceOracle;
use crate::keystore::KeyStore;
use crate::ledger::BaseLedger;
use crate::orchestrator::{Orchestrator, OrchestratorState};
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::types::{SortOrder, TransactionFilter, TxStatus};

struct Slot<S, L, K> {
    orchestrator: Arc<Orchestrator<S, L, K>>,
    handle: JoinHandle<()>,
}

/// Owns the orchestrator pool. Not a singleton: callers construct and
/// `run()` as many engines as they need, each independent (`SPEC_FULL.md`
/// §9 design notes).
pub struct Engine<S, L, K> {
    store: Arc<S>,
    ledger: Arc<L>,
    keystore: Arc<K>,
    gas_oracle: Arc<GasPriceOracle<L>>,
    fueling: Arc<FuelingManager<S>>,
    completed_nonces: Arc<CompletedNonceCache>,
    engine_config: EngineConfig,
    orchestrator_config: OrchestratorConfig,
    chain_id: u64,
    legacy: bool,
    orchestrators: Mutex<HashMap<Address, Slot<S, L, K>>>,
    pause_table: Mutex<HashMap<Address, Instant>>,
    stale_notify: Notify,
    shutdown: Shutdown,
}

impl<S: Store + 'static, L: BaseLedger + 'static, K: KeyStore + 'static> Engine<S, L, K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        ledger: Arc<L>,
        keystore: Arc<K>,
        gas_oracle: Arc<GasPriceOracle<L>>,
        fueling: Arc<FuelingManager<S>>,
        completed_nonces: Arc<CompletedNonceCache>,
        engine_config: EngineConfig,
        orchestrator_config: OrchestratorConfig,
        chain_id: u64,
        legacy: bool,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            ledger,
            keystore,
            gas_oracle,
            fueling,
            completed_nonces,
            engine_config,
            orchestrator_config,
            chain_id,
            legacy,
            orchestrators: Mutex::new(HashMap::new()),
            pause_table: Mutex::new(HashMap::new()),
            stale_notify: Notify::new(),
            shutdown,
        }
    }

    /// The non-blocking wake primitive (`SPEC_FULL.md` §4.5): a
    /// single-buffer notify, coalescing any number of calls between two
    /// ticks into exactly one extra poll.
    pub fn mark_in_flight_orchestrators_stale(&self) {
        self.stale_notify.notify_one();
    }

    /// Runs the main loop until shutdown begins.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.engine_config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.stale_notify.notified() => {}
                () = self.shutdown.await_shutdown_begin() => {
                    info!("engine shutting down, stopping all orchestrators");
                    self.stop_all().await;
                    return Ok(());
                }
            }

            if let Err(error) = self.poll_once().await {
                warn!(%error, "engine poll failed");
            }
        }
    }

    async fn stop_all(&self) {
        let orchestrators = self.orchestrators.lock().await;
        for slot in orchestrators.values() {
            slot.orchestrator.stop();
        }
    }

    #[instrument(skip(self))]
    async fn poll_once(&self) -> anyhow::Result<()> {
        let mut orchestrators = self.orchestrators.lock().await;
        let mut pause_table = self.pause_table.lock().await;

        self.reap(&mut orchestrators).await;

        let now_paused: Vec<Address> =
            pause_table.iter().filter(|(_, until)| **until > Instant::now()).map(|(a, _)| *a).collect();
        pause_table.retain(|_, until| *until > Instant::now());

        let slots = self.engine_config.max_in_flight_orchestrators.saturating_sub(orchestrators.len());

        if slots > 0 {
            self.fill_capacity(&mut orchestrators, &now_paused, slots).await?;
        } else {
            self.evict_for_fairness(&mut orchestrators, &mut pause_table).await;
        }

        self.publish_metrics(&orchestrators).await;
        Ok(())
    }

    async fn reap(&self, orchestrators: &mut HashMap<Address, Slot<S, L, K>>) {
        let mut to_remove = Vec::new();

        for (address, slot) in orchestrators.iter() {
            let state = slot.orchestrator.state().await;
            let age = slot.orchestrator.state_age().await;
            let should_reap = match state {
                OrchestratorState::Stale => age > self.engine_config.max_stale_time,
                OrchestratorState::Idle => age > self.engine_config.max_idle_time,
                OrchestratorState::Stopped => true,
                OrchestratorState::Running | OrchestratorState::Paused => false,
            };
            if should_reap {
                to_remove.push(*address);
            }
        }

        for address in to_remove {
            if let Some(slot) = orchestrators.remove(&address) {
                slot.orchestrator.stop();
                slot.handle.abort();
                info!(signer = %format!("{address:#x}"), "reaped orchestrator");
            }
        }
    }

    async fn fill_capacity(
        &self,
        orchestrators: &mut HashMap<Address, Slot<S, L, K>>,
        paused: &[Address],
        slots: usize,
    ) -> anyhow::Result<()> {
        let mut not_from: Vec<Address> = orchestrators.keys().copied().collect();
        not_from.extend_from_slice(paused);

        let pending = self
            .store
            .list_transactions(TransactionFilter {
                status: Some(TxStatus::Pending),
                not_from,
                limit: Some(slots),
                order: SortOrder::AscendingSequence,
            })
            .await?;

        for tx in pending {
            if orchestrators.contains_key(&tx.signing_address) {
                continue;
            }
            if orchestrators.len() >= self.engine_config.max_in_flight_orchestrators {
                break;
            }

            let orchestrator = Arc::new(Orchestrator::new(
                tx.signing_address,
                self.store.clone(),
                self.ledger.clone(),
                self.keystore.clone(),
                self.gas_oracle.clone(),
                self.fueling.clone(),
                self.completed_nonces.clone(),
                self.orchestrator_config.clone(),
                self.chain_id,
                self.legacy,
            ));
            orchestrator.enqueue(tx).await;

            let handle = self.spawn_ticker(orchestrator.clone());
            orchestrators.insert(orchestrator.signing_address, Slot { orchestrator, handle });
        }

        Ok(())
    }

    fn spawn_ticker(&self, orchestrator: Arc<Orchestrator<S, L, K>>) -> JoinHandle<()> {
        let interval = self.engine_config.interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = shutdown.await_shutdown_begin() => return,
                }

                if orchestrator.is_stop_requested() {
                    return;
                }
                if let Err(error) = orchestrator.tick().await {
                    warn!(%error, "orchestrator tick failed");
                }
            }
        })
    }

    async fn evict_for_fairness(
        &self,
        orchestrators: &mut HashMap<Address, Slot<S, L, K>>,
        pause_table: &mut HashMap<Address, Instant>,
    ) {
        let threshold = self.engine_config.max_overload_process_time;
        let mut to_evict = Vec::new();

        for (address, slot) in orchestrators.iter() {
            if slot.orchestrator.birth().elapsed() > threshold {
                to_evict.push(*address);
            }
        }

        for address in to_evict {
            if let Some(slot) = orchestrators.remove(&address) {
                slot.orchestrator.stop();
                slot.handle.abort();
                pause_table.insert(address, Instant::now() + threshold);
                metrics::FAIRNESS_EVICTIONS_TOTAL.inc();
                warn!(signer = %format!("{address:#x}"), "evicted orchestrator for fairness");
            }
        }
    }

    async fn publish_metrics(&self, orchestrators: &HashMap<Address, Slot<S, L, K>>) {
        let free_slots = self.engine_config.max_in_flight_orchestrators.saturating_sub(orchestrators.len());
        metrics::FREE_SLOTS.set(free_slots as i64);

        let mut counts: HashMap<&'static str, i64> = HashMap::new();
        for slot in orchestrators.values() {
            let label = match slot.orchestrator.state().await {
                OrchestratorState::Stale => "stale",
                OrchestratorState::Idle => "idle",
                OrchestratorState::Running => "running",
                OrchestratorState::Paused => "paused",
                OrchestratorState::Stopped => "stopped",
            };
            *counts.entry(label).or_insert(0) += 1;
        }
        for label in ["stale", "idle", "running", "paused", "stopped"] {
            metrics::ORCHESTRATORS_BY_STATE.with_label_values(&[label]).set(*counts.get(label).unwrap_or(&0));
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ethers::core::types::transaction::eip2718::TypedTransaction;
    use ethers::types::{Bytes, H256, U256};

    use super::*;
    use crate::ledger::CurrentPrice;
    use crate::store::memory::MemStore;
    use crate::types::{NewTransaction, Receipt};

    struct MockLedger;

    #[async_trait]
    impl BaseLedger for MockLedger {
        async fn estimate_gas(&self, _: Address, _: &Bytes, _: U256) -> Result<U256, crate::error::LedgerError> {
            unimplemented!()
        }
        async fn get_nonce(&self, _: Address) -> Result<u64, crate::error::LedgerError> {
            Ok(0)
        }
        async fn current_price(&self) -> Result<CurrentPrice, crate::error::LedgerError> {
            Ok(CurrentPrice::Legacy { gas_price: U256::from(1) })
        }
        async fn send_raw_transaction(&self, _: Bytes) -> Result<H256, crate::error::LedgerError> {
            Ok(H256::random())
        }
        async fn get_receipt(&self, _: H256) -> Result<Option<Receipt>, crate::error::LedgerError> {
            unimplemented!()
        }
        async fn subscribe_new_blocks<'a>(
            &'a self,
        ) -> Result<Box<dyn futures::Stream<Item = u64> + Send + Unpin + 'a>, crate::error::LedgerError> {
            unimplemented!()
        }
    }

    struct MockKeyStore;

    #[async_trait]
    impl KeyStore for MockKeyStore {
        async fn sign(&self, _: Address, _: &TypedTransaction) -> Result<Bytes, crate::error::LedgerError> {
            Ok(Bytes::default())
        }
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

    fn engine(
        store: Arc<MemStore>,
        max_in_flight_orchestrators: usize,
        max_overload_process_time: std::time::Duration,
    ) -> Engine<MemStore, MockLedger, MockKeyStore> {
        let ledger = Arc::new(MockLedger);
        let gas_oracle = Arc::new(GasPriceOracle::new(ledger.clone(), std::time::Duration::from_secs(60)));
        let fueling = Arc::new(FuelingManager::new(
            store.clone(),
            crate::config::FuelingConfig {
                funding_address: Address::from_low_u64_be(0xF00D),
                minimum_balance: "0".into(),
            },
        ));
        Engine::new(
            store,
            ledger,
            Arc::new(MockKeyStore),
            gas_oracle,
            fueling,
            Arc::new(CompletedNonceCache::new()),
            EngineConfig { max_in_flight_orchestrators, max_overload_process_time, ..EngineConfig::default() },
            OrchestratorConfig::default(),
            1,
            true,
            Shutdown::new(std::time::Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn fill_capacity_spawns_one_orchestrator_per_pending_signer() {
        let store = Arc::new(MemStore::new());
        let a = Address::from_low_u64_be(1);
        let b = Address::from_low_u64_be(2);
        store.insert_transaction(new_tx(a)).await.unwrap();
        store.insert_transaction(new_tx(b)).await.unwrap();

        let engine = engine(store, 50, std::time::Duration::from_secs(600));
        engine.poll_once().await.unwrap();

        let orchestrators = engine.orchestrators.lock().await;
        assert_eq!(orchestrators.len(), 2);
        assert!(orchestrators.contains_key(&a));
        assert!(orchestrators.contains_key(&b));
    }

    #[tokio::test]
    async fn fill_capacity_respects_slot_ceiling() {
        let store = Arc::new(MemStore::new());
        for i in 0..5u64 {
            store.insert_transaction(new_tx(Address::from_low_u64_be(i + 1))).await.unwrap();
        }

        let engine = engine(store, 2, std::time::Duration::from_secs(600));
        engine.poll_once().await.unwrap();

        assert_eq!(engine.orchestrators.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn evicts_overloaded_orchestrator_and_pauses_its_signer() {
        let store = Arc::new(MemStore::new());
        let signer = Address::from_low_u64_be(1);
        store.insert_transaction(new_tx(signer)).await.unwrap();

        let engine = engine(store, 1, std::time::Duration::from_millis(0));
        engine.poll_once().await.unwrap();
        assert_eq!(engine.orchestrators.lock().await.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        engine.poll_once().await.unwrap();

        assert!(engine.orchestrators.lock().await.is_empty());
        assert!(engine.pause_table.lock().await.contains_key(&signer));
    }

    #[tokio::test]
    async fn paused_signer_is_excluded_from_fill_capacity() {
        let store = Arc::new(MemStore::new());
        let signer = Address::from_low_u64_be(1);
        store.insert_transaction(new_tx(signer)).await.unwrap();

        let engine = engine(store.clone(), 1, std::time::Duration::from_secs(600));
        engine.pause_table.lock().await.insert(signer, Instant::now() + std::time::Duration::from_secs(60));

        engine.poll_once().await.unwrap();

        assert!(engine.orchestrators.lock().await.is_empty());
    }
}

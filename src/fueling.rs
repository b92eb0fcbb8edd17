//! Fueling Manager (C3, `SPEC_FULL.md` §4.3): requests auto-fuel
//! transactions from a funding address to orchestrator addresses whose
//! balance has dropped below the floor required to submit their next
//! transaction, and maintains the completed-nonce cache.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use ethers::types::{Address, Bytes, U256};

use crate::config::FuelingConfig;
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{NewTransaction, PublicTransaction, TransactionId};

/// Default `transaction_cache.capacity` (`SPEC_FULL.md` §6) when a caller
/// constructs the cache without specifying one.
pub const DEFAULT_CAPACITY: usize = 1000;

struct State {
    highest: HashMap<Address, u64>,
    /// Recency order, least-recently-touched at the front. A signer
    /// appears at most once.
    order: VecDeque<Address>,
}

/// LRU-bounded mapping from signing address to its highest observed
/// terminal nonce. Updated monotonically: writers never lower an entry.
/// Bounded to `capacity` entries so a pool of many short-lived signing
/// addresses cannot grow this unboundedly; the least-recently-touched
/// signer is evicted first, and a miss simply re-seeds from the store's
/// durable `completed_nonces` mirror.
pub struct CompletedNonceCache {
    state: Mutex<State>,
    capacity: usize,
}

impl Default for CompletedNonceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletedNonceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State { highest: HashMap::new(), order: VecDeque::new() }),
            capacity,
        }
    }

    /// Records `nonce` as completed for `signer`, promoting the cached
    /// value only if it increases, and marking `signer` as most-recently
    /// used.
    pub fn record(&self, signer: Address, nonce: u64) {
        let mut state = self.state.lock().unwrap();
        let entry = state.highest.entry(signer).or_insert(nonce);
        if nonce > *entry {
            *entry = nonce;
        }
        self.touch(&mut state, signer);
    }

    fn get(&self, signer: Address) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        let highest = state.highest.get(&signer).copied();
        if highest.is_some() {
            self.touch(&mut state, signer);
        }
        highest
    }

    fn touch(&self, state: &mut State, signer: Address) {
        if let Some(pos) = state.order.iter().position(|&s| s == signer) {
            state.order.remove(pos);
        }
        state.order.push_back(signer);

        while state.order.len() > self.capacity {
            if let Some(evicted) = state.order.pop_front() {
                state.highest.remove(&evicted);
            }
        }
    }

    /// True iff `completed_nonce_cache[tx.from] >= tx.nonce`. Populates the
    /// cache from the store's durable `completed_nonces` mirror on a miss.
    pub async fn check_transaction_completed<S: Store + ?Sized>(
        &self,
        store: &S,
        tx: &PublicTransaction,
    ) -> Result<bool, StoreError> {
        let Some(nonce) = tx.nonce else { return Ok(false) };

        if let Some(highest) = self.get(tx.signing_address) {
            return Ok(highest >= nonce);
        }

        let Some(highest) = store.highest_terminal_nonce(tx.signing_address).await? else {
            return Ok(false);
        };
        self.record(tx.signing_address, highest);
        Ok(highest >= nonce)
    }
}

pub struct FuelingManager<S> {
    store: Arc<S>,
    config: FuelingConfig,
}

impl<S: Store> FuelingManager<S> {
    pub fn new(store: Arc<S>, config: FuelingConfig) -> Self {
        Self { store, config }
    }

    /// The funding floor (`FuelingConfig.minimum_balance`), parsed into
    /// wei. This is the amount an underfunded signer is topped up to, not
    /// the gas cost of whatever transaction revealed the shortfall.
    pub fn funding_amount(&self) -> Result<U256, StoreError> {
        U256::from_dec_str(&self.config.minimum_balance).map_err(|error| {
            StoreError::Refused(format!(
                "fueling.minimum_balance {:?} is not a valid wei amount: {error}",
                self.config.minimum_balance
            ))
        })
    }

    /// Requests that `destination` be fueled. Idempotent: if a fueling
    /// transaction to `destination` is already outstanding, its id is
    /// returned instead of enqueuing a second one.
    pub async fn request_fueling(
        &self,
        destination: Address,
        amount: U256,
    ) -> Result<TransactionId, StoreError> {
        if let Some(existing) = self
            .store
            .get_pending_fueling_transaction(self.config.funding_address, destination)
            .await?
        {
            return Ok(existing.id);
        }

        self.store
            .insert_transaction(NewTransaction {
                signing_address: self.config.funding_address,
                to: destination,
                data: Bytes::default(),
                value: amount,
                gas_limit: U256::from(21_000),
                has_value: true,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemStore;

    fn config() -> FuelingConfig {
        FuelingConfig {
            funding_address: Address::from_low_u64_be(0xF00D),
            minimum_balance: "1000000000000000000".into(),
        }
    }

    #[tokio::test]
    async fn request_fueling_is_idempotent() {
        let store = Arc::new(MemStore::new());
        let manager = FuelingManager::new(store.clone(), config());
        let destination = Address::from_low_u64_be(1);

        let first = manager.request_fueling(destination, U256::from(10)).await.unwrap();
        let second = manager.request_fueling(destination, U256::from(10)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            store
                .list_transactions(crate::types::TransactionFilter::default())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn completed_nonce_cache_is_monotonic() {
        let cache = CompletedNonceCache::new();
        let signer = Address::from_low_u64_be(1);

        cache.record(signer, 5);
        cache.record(signer, 3);
        assert_eq!(cache.get(signer), Some(5));

        cache.record(signer, 9);
        assert_eq!(cache.get(signer), Some(9));
    }

    #[tokio::test]
    async fn completed_nonce_cache_evicts_least_recently_used_past_capacity() {
        let cache = CompletedNonceCache::with_capacity(2);
        let a = Address::from_low_u64_be(1);
        let b = Address::from_low_u64_be(2);
        let c = Address::from_low_u64_be(3);

        cache.record(a, 1);
        cache.record(b, 1);
        // Touching `a` makes `b` the least-recently-used entry.
        assert_eq!(cache.get(a), Some(1));
        cache.record(c, 1);

        assert_eq!(cache.get(b), None, "evicted: least recently touched past capacity");
        assert_eq!(cache.get(a), Some(1));
        assert_eq!(cache.get(c), Some(1));
    }
}

//! Gas Price Oracle (C2, `SPEC_FULL.md` §4.2): a shared, signer-agnostic
//! current-price feed with a short TTL cache and single-flight dedup, so a
//! burst of orchestrators ticking at once issues one upstream fetch. On
//! transient oracle failure, returns the last known good snapshot with a
//! staleness flag instead of failing the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::LedgerError;
use crate::ledger::{BaseLedger, CurrentPrice};

/// A gas price snapshot together with whether it was served from a cache
/// entry older than the configured TTL because the upstream fetch failed.
#[derive(Debug, Clone, Copy)]
pub struct PriceSnapshot {
    pub price: CurrentPrice,
    pub stale: bool,
}

struct Cached {
    price: CurrentPrice,
    fetched_at: Instant,
}

pub struct GasPriceOracle<L: ?Sized> {
    ledger: Arc<L>,
    ttl: Duration,
    cached: Mutex<Option<Cached>>,
}

impl<L: BaseLedger + ?Sized> GasPriceOracle<L> {
    pub fn new(ledger: Arc<L>, ttl: Duration) -> Self {
        Self { ledger, ttl, cached: Mutex::new(None) }
    }

    /// Returns the current price, refreshing from the ledger if the cached
    /// value has aged past the TTL. Concurrent callers serialize on the
    /// same mutex, so at most one upstream fetch happens per staleness
    /// window (single-flight by construction: the second caller finds a
    /// fresh entry already installed by the first).
    pub async fn current_price(&self) -> Result<PriceSnapshot, LedgerError> {
        let mut cached = self.cached.lock().await;

        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(PriceSnapshot { price: entry.price, stale: false });
            }
        }

        match self.ledger.current_price().await {
            Ok(price) => {
                *cached = Some(Cached { price, fetched_at: Instant::now() });
                Ok(PriceSnapshot { price, stale: false })
            }
            Err(error) => {
                if let Some(entry) = cached.as_ref() {
                    warn!(%error, "gas oracle fetch failed, serving stale price");
                    Ok(PriceSnapshot { price: entry.price, stale: true })
                } else {
                    Err(error)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ethers::types::{Address, Bytes, H256, U256};

    use super::*;
    use crate::types::Receipt;

    struct CountingLedger {
        calls: AtomicUsize,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl BaseLedger for CountingLedger {
        async fn estimate_gas(&self, _: Address, _: &Bytes, _: U256) -> Result<U256, LedgerError> {
            unimplemented!()
        }
        async fn get_nonce(&self, _: Address) -> Result<u64, LedgerError> {
            unimplemented!()
        }
        async fn current_price(&self) -> Result<CurrentPrice, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(LedgerError::Transient("rpc down".into()));
            }
            Ok(CurrentPrice::Legacy { gas_price: U256::from(self.calls.load(Ordering::SeqCst)) })
        }
        async fn send_raw_transaction(&self, _: Bytes) -> Result<H256, LedgerError> {
            unimplemented!()
        }
        async fn get_receipt(&self, _: H256) -> Result<Option<Receipt>, LedgerError> {
            unimplemented!()
        }
        async fn subscribe_new_blocks<'a>(
            &'a self,
        ) -> Result<Box<dyn futures::Stream<Item = u64> + Send + Unpin + 'a>, LedgerError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn caches_within_ttl() {
        let ledger = Arc::new(CountingLedger {
            calls: AtomicUsize::new(0),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        });
        let oracle = GasPriceOracle::new(ledger.clone(), Duration::from_secs(60));

        oracle.current_price().await.unwrap();
        oracle.current_price().await.unwrap();

        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn serves_stale_on_transient_failure() {
        let ledger = Arc::new(CountingLedger {
            calls: AtomicUsize::new(0),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        });
        let oracle = GasPriceOracle::new(ledger.clone(), Duration::from_millis(1));

        let first = oracle.current_price().await.unwrap();
        assert!(!first.stale);

        tokio::time::sleep(Duration::from_millis(5)).await;
        ledger.fail_next.store(true, Ordering::SeqCst);

        let second = oracle.current_price().await.unwrap();
        assert!(second.stale);
        assert_eq!(second.price, first.price);
    }
}

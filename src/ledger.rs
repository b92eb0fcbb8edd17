//! The base ledger (outbound, §6): `estimate_gas`, `get_nonce`,
//! `send_raw_transaction`, `get_receipt`, `subscribe_new_blocks`. An
//! `ethers`-backed implementation plus a handful of trait methods the
//! gas price oracle and confirmation tracker call directly.

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use futures::StreamExt;

use crate::error::LedgerError;
use crate::types::{GasPrice, Receipt, ReceiptStatus};

/// A snapshot of the current gas market, chain-mode-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentPrice {
    Legacy { gas_price: U256 },
    Eip1559 { base_fee: U256, priority_fee: U256 },
}

impl CurrentPrice {
    #[must_use]
    pub fn as_gas_price(self) -> GasPrice {
        match self {
            Self::Legacy { gas_price } => GasPrice::Legacy { gas_price },
            Self::Eip1559 { base_fee, priority_fee } => GasPrice::Eip1559 {
                max_fee_per_gas: base_fee + priority_fee,
                max_priority_fee_per_gas: priority_fee,
            },
        }
    }
}

#[async_trait]
pub trait BaseLedger: Send + Sync {
    async fn estimate_gas(&self, to: Address, data: &Bytes, value: U256) -> Result<U256, LedgerError>;

    async fn get_nonce(&self, address: Address) -> Result<u64, LedgerError>;

    async fn current_price(&self) -> Result<CurrentPrice, LedgerError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, LedgerError>;

    async fn get_receipt(&self, hash: H256) -> Result<Option<Receipt>, LedgerError>;

    /// Streams newly observed block numbers. The confirmation tracker
    /// polls receipts for outstanding hashes on every emitted block.
    async fn subscribe_new_blocks<'a>(
        &'a self,
    ) -> Result<Box<dyn futures::Stream<Item = u64> + Send + Unpin + 'a>, LedgerError>;
}

/// `ethers`-backed ledger. `legacy` selects whether prices are quoted as a
/// single `gas_price` or split base fee / priority fee.
pub struct EthersLedger {
    provider: Provider<Http>,
    legacy: bool,
}

impl EthersLedger {
    pub fn new(rpc_url: &url::Url, legacy: bool) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url.as_str())?;
        Ok(Self { provider, legacy })
    }

    fn classify(error: ProviderError) -> LedgerError {
        LedgerError::classify(&error.to_string())
    }
}

#[async_trait]
impl BaseLedger for EthersLedger {
    async fn estimate_gas(&self, to: Address, data: &Bytes, value: U256) -> Result<U256, LedgerError> {
        let tx = TransactionRequest::new().to(to).data(data.clone()).value(value);
        self.provider
            .estimate_gas(&tx.into(), None)
            .await
            .map_err(Self::classify)
    }

    async fn get_nonce(&self, address: Address) -> Result<u64, LedgerError> {
        let nonce = self
            .provider
            .get_transaction_count(address, None)
            .await
            .map_err(Self::classify)?;
        Ok(nonce.as_u64())
    }

    async fn current_price(&self) -> Result<CurrentPrice, LedgerError> {
        if self.legacy {
            let gas_price = self.provider.get_gas_price().await.map_err(Self::classify)?;
            return Ok(CurrentPrice::Legacy { gas_price });
        }

        let (base_fee, priority_fee) = tokio::try_join!(
            async {
                let block = self
                    .provider
                    .get_block(ethers::types::BlockNumber::Latest)
                    .await
                    .map_err(Self::classify)?
                    .ok_or_else(|| LedgerError::Transient("no latest block".into()))?;
                Ok::<_, LedgerError>(block.base_fee_per_gas.unwrap_or_default())
            },
            async { self.provider.get_gas_price().await.map_err(Self::classify) },
        )?;

        Ok(CurrentPrice::Eip1559 { base_fee, priority_fee })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, LedgerError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(Self::classify)?;
        Ok(pending.tx_hash())
    }

    async fn get_receipt(&self, hash: H256) -> Result<Option<Receipt>, LedgerError> {
        let receipt = self.provider.get_transaction_receipt(hash).await.map_err(Self::classify)?;
        Ok(receipt.map(|receipt| Receipt {
            block_number: receipt.block_number.map(|n| n.as_u64()).unwrap_or_default(),
            status: match receipt.status.map(|s| s.as_u64()) {
                Some(1) => ReceiptStatus::Succeeded,
                _ => ReceiptStatus::Failed,
            },
        }))
    }

    async fn subscribe_new_blocks<'a>(
        &'a self,
    ) -> Result<Box<dyn futures::Stream<Item = u64> + Send + Unpin + 'a>, LedgerError> {
        let stream = self
            .provider
            .watch_blocks()
            .await
            .map_err(Self::classify)?
            .map(|_| ());
        let provider = self.provider.clone();
        let mapped = stream.then(move |()| {
            let provider = provider.clone();
            async move { provider.get_block_number().await.map(|n| n.as_u64()).unwrap_or_default() }
        });
        Ok(Box::new(Box::pin(mapped)))
    }
}

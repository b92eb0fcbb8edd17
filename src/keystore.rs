//! The key store (outbound, §6): `sign(key_handle, tx_payload)`. The
//! dev/test implementation holds `LocalWallet`s directly; a production
//! deployment would swap in an HSM- or KMS-backed store behind the same
//! trait.

use std::collections::HashMap;

use async_trait::async_trait;
use ethers::core::types::transaction::eip2718::TypedTransaction;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes};

use crate::error::LedgerError;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Signs `tx` with the key identified by `address`, returning the RLP
    /// bytes ready for `send_raw_transaction`.
    async fn sign(&self, address: Address, tx: &TypedTransaction) -> Result<Bytes, LedgerError>;
}

/// A `LocalWallet`-backed key store, grounded on this engine's local
/// dev/test signer rather than a remote signing service.
#[derive(Default)]
pub struct LocalKeyStore {
    wallets: HashMap<Address, LocalWallet>,
}

impl LocalKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, wallet: LocalWallet) {
        self.wallets.insert(wallet.address(), wallet);
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    async fn sign(&self, address: Address, tx: &TypedTransaction) -> Result<Bytes, LedgerError> {
        let wallet = self
            .wallets
            .get(&address)
            .ok_or_else(|| LedgerError::FatalConfig(format!("no signing key for {address:#x}")))?;

        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|error| LedgerError::FatalConfig(error.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }
}


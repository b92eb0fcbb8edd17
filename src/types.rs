//! Core data model shared by every component: the persisted
//! [`PublicTransaction`] row and the small value types it is built from.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identity of a public transaction, stable for its whole lifetime.
pub type TransactionId = Uuid;

/// Lifecycle status of a [`PublicTransaction`].
///
/// Transitions: Pending -> Submitted -> (Succeeded | Failed);
/// Submitted -> Suspended -> Submitted (re-broadcast with bumped fee);
/// Failed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Submitted,
    Succeeded,
    Failed,
    Suspended,
}

impl TxStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
        };
        f.write_str(s)
    }
}

impl FromStr for TxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "submitted" => Self::Submitted,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "suspended" => Self::Suspended,
            other => anyhow::bail!("unknown transaction status `{other}`"),
        })
    }
}

/// The behavioral error classes from the error-handling design (see
/// `SPEC_FULL.md` §7), persisted alongside a Suspended transaction so
/// operators can see why it stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientStorage,
    TransientLedger,
    NonBenignRejection,
    FatalConfig,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransientStorage => "transient_storage",
            Self::TransientLedger => "transient_ledger",
            Self::NonBenignRejection => "non_benign_rejection",
            Self::FatalConfig => "fatal_config",
        };
        f.write_str(s)
    }
}

/// Gas price parameters chosen for a broadcast. The chain mode (legacy vs.
/// EIP-1559) is fixed per deployment, not per transaction, but each
/// transaction remembers the parameters it was last broadcast with so a
/// replacement can be compared against the current oracle price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy { gas_price: U256 },
    Eip1559 { max_fee_per_gas: U256, max_priority_fee_per_gas: U256 },
}

impl GasPrice {
    /// Bumps this price by at least `pct` percent, the way the base ledger's
    /// replacement policy requires (§4.4 step 2).
    #[must_use]
    pub fn bump(self, pct: u64) -> Self {
        match self {
            Self::Legacy { gas_price } => Self::Legacy {
                gas_price: bump_by_pct(gas_price, pct),
            },
            Self::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas } => Self::Eip1559 {
                max_fee_per_gas: bump_by_pct(max_fee_per_gas, pct),
                max_priority_fee_per_gas: bump_by_pct(max_priority_fee_per_gas, pct),
            },
        }
    }

    /// True if `current` is more than `pct` percent above `self`, meaning a
    /// replacement broadcast is warranted.
    #[must_use]
    pub fn is_stale_against(self, current: Self, pct: u64) -> bool {
        match (self, current) {
            (Self::Legacy { gas_price: old }, Self::Legacy { gas_price: new }) => {
                new > bump_by_pct(old, pct)
            }
            (
                Self::Eip1559 { max_priority_fee_per_gas: old, .. },
                Self::Eip1559 { max_priority_fee_per_gas: new, .. },
            ) => new > bump_by_pct(old, pct),
            _ => false,
        }
    }
}

fn bump_by_pct(value: U256, pct: u64) -> U256 {
    value + (value * U256::from(pct) / U256::from(100))
}

/// A pending, in-flight, or terminal public transaction, persisted in the
/// `public_transactions` table. See `SPEC_FULL.md` §3 for the invariants
/// this type must never violate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicTransaction {
    pub id: TransactionId,
    pub signing_address: Address,
    /// Assigned at first submission; immutable thereafter.
    pub nonce: Option<u64>,
    pub status: TxStatus,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: U256,
    pub gas_price: Option<GasPrice>,
    /// Interpreted as a fueling transaction when set.
    pub has_value: bool,
    /// Monotonic, assigned by the store; used for FIFO ordering.
    pub sequence: i64,
    pub last_action_time: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_broadcast_hash: Option<H256>,
    pub last_error_kind: Option<ErrorKind>,
}

impl PublicTransaction {
    #[must_use]
    pub fn is_fueling(&self) -> bool {
        self.has_value
    }
}

/// A new transaction queued via `submit_public_transaction`, before the
/// store assigns it an id and sequence number.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub signing_address: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: U256,
    pub has_value: bool,
}

/// Filter used by `Store::list_transactions`.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub status: Option<TxStatus>,
    /// Exclude transactions whose signer is in this set ("give me pending
    /// work for signers I am not already running").
    pub not_from: Vec<Address>,
    pub limit: Option<usize>,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    AscendingSequence,
    DescendingNonce,
}

/// A base-ledger transaction receipt, as resolved by the confirmation
/// tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub block_number: u64,
    pub status: ReceiptStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Failed,
    Succeeded,
}

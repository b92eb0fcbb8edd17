//! Behavioral error taxonomy for the engine (`SPEC_FULL.md` §7). These are
//! classified by how a caller must react, not by which library raised them.

use thiserror::Error;

use crate::types::ErrorKind;

/// Errors raised by the transaction store (C1).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Retried indefinitely with capped exponential backoff by the caller;
    /// never surfaces unless shutdown begins.
    #[error("transient storage error: {0}")]
    Transient(#[source] sqlx::Error),

    /// The nonce invariant (`SPEC_FULL.md` §3 invariant 1) would be
    /// violated by this update.
    #[error("nonce invariant violated for {signer}: lower nonce {blocking_nonce} is not terminal")]
    NonceInvariant { signer: String, blocking_nonce: u64 },

    /// The transaction does not exist, or is not in a state that permits
    /// the requested operation (e.g. cancelling a Submitted transaction).
    #[error("refused: {0}")]
    Refused(String),
}

impl StoreError {
    /// Database errors are always transient from the store's point of view;
    /// callers retry them. A handful of driver errors (constraint
    /// violations used to enforce invariants) are classified separately by
    /// the call site instead of landing here.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors raised by the base ledger and key store (outbound, §6).
#[derive(Debug, Error)]
pub enum LedgerError {
    /// RPC timeout, 5xx, or an otherwise unrecognized transient failure.
    /// Broadcast is retried on the next orchestrator tick; does not
    /// advance the attempt counter.
    #[error("transient ledger error: {0}")]
    Transient(String),

    /// "already known" / "nonce too low": treated as a successful
    /// broadcast, proceed to confirmation tracking.
    #[error("benign rejection: {0}")]
    BenignRejection(String),

    /// "insufficient funds" / "gas too low" / "execution reverted at
    /// estimate": attempt counter incremented; transaction may be
    /// suspended on saturation.
    #[error("non-benign rejection: {0}")]
    NonBenignRejection(String),

    /// The signing key is missing or the key store refused to sign.
    #[error("fatal config error: {0}")]
    FatalConfig(String),
}

impl LedgerError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientLedger,
            Self::BenignRejection(_) => ErrorKind::TransientLedger,
            Self::NonBenignRejection(_) => ErrorKind::NonBenignRejection,
            Self::FatalConfig(_) => ErrorKind::FatalConfig,
        }
    }

    /// Classifies a raw RPC error message into one of the four behavioral
    /// buckets above, matching the base ledger's own wording for mempool
    /// rejections.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("already known") || lower.contains("nonce too low") {
            Self::BenignRejection(message.to_owned())
        } else if lower.contains("insufficient funds")
            || lower.contains("gas too low")
            || lower.contains("intrinsic gas too low")
            || lower.contains("execution reverted")
        {
            Self::NonBenignRejection(message.to_owned())
        } else {
            Self::Transient(message.to_owned())
        }
    }
}

/// Fatal errors that surface all the way out of the engine: missing key,
/// malformed config. Everything else is recovered locally by the
/// orchestrator or the engine.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing signing key for {0}")]
    MissingKey(String),
}

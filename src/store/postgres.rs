//! Postgres-backed [`Store`], the durable queue behind every other
//! component. Mirrors this codebase's `sqlx` conventions: a static
//! `Migrator`, `#[instrument]`'d methods, and row mapping via `sqlx::Row`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use tracing::instrument;
use uuid::Uuid;

use super::{StatusUpdate, Store};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::types::{
    ErrorKind, GasPrice, NewTransaction, PublicTransaction, SortOrder, TransactionFilter,
    TransactionId, TxStatus,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    #[instrument(skip_all)]
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        if config.migrate {
            MIGRATOR.run(&pool).await?;
        }

        Ok(Self { pool })
    }

    fn transient(error: sqlx::Error) -> StoreError {
        StoreError::Transient(error)
    }
}

fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<PublicTransaction, StoreError> {
    let status: String = row.try_get("status").map_err(PgStore::transient)?;
    let status = TxStatus::from_str(&status)
        .map_err(|error| StoreError::Refused(format!("corrupt status in row: {error}")))?;

    let signing_address: String = row.try_get("signing_address").map_err(PgStore::transient)?;
    let to_address: String = row.try_get("to_address").map_err(PgStore::transient)?;
    let data: Vec<u8> = row.try_get("data").map_err(PgStore::transient)?;
    let value: String = row.try_get("value").map_err(PgStore::transient)?;
    let gas_limit: String = row.try_get("gas_limit").map_err(PgStore::transient)?;
    let max_fee_per_gas: Option<String> =
        row.try_get("max_fee_per_gas").map_err(PgStore::transient)?;
    let max_priority_fee_per_gas: Option<String> =
        row.try_get("max_priority_fee_per_gas").map_err(PgStore::transient)?;
    let gas_price: Option<String> = row.try_get("gas_price").map_err(PgStore::transient)?;
    let last_broadcast_hash: Option<String> =
        row.try_get("last_broadcast_hash").map_err(PgStore::transient)?;
    let last_error_kind: Option<String> =
        row.try_get("last_error_kind").map_err(PgStore::transient)?;
    let nonce: Option<i64> = row.try_get("nonce").map_err(PgStore::transient)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(PgStore::transient)?;
    let sequence: i64 = row.try_get("sequence").map_err(PgStore::transient)?;
    let last_action_time: DateTime<Utc> =
        row.try_get("last_action_time").map_err(PgStore::transient)?;
    let id: Uuid = row.try_get("id").map_err(PgStore::transient)?;
    let has_value: bool = row.try_get("has_value").map_err(PgStore::transient)?;

    let gas_price = match (max_fee_per_gas, max_priority_fee_per_gas, gas_price) {
        (Some(max_fee), Some(priority_fee), _) => Some(GasPrice::Eip1559 {
            max_fee_per_gas: parse_u256(&max_fee)?,
            max_priority_fee_per_gas: parse_u256(&priority_fee)?,
        }),
        (_, _, Some(gas_price)) => Some(GasPrice::Legacy { gas_price: parse_u256(&gas_price)? }),
        _ => None,
    };

    Ok(PublicTransaction {
        id,
        signing_address: parse_address(&signing_address)?,
        nonce: nonce.map(|n| n as u64),
        status,
        to: parse_address(&to_address)?,
        data: Bytes::from(data),
        value: parse_u256(&value)?,
        gas_limit: parse_u256(&gas_limit)?,
        gas_price,
        has_value,
        sequence,
        last_action_time,
        attempt_count: attempt_count as u32,
        last_broadcast_hash: last_broadcast_hash
            .map(|h| parse_hash(&h))
            .transpose()?,
        last_error_kind: last_error_kind.as_deref().map(parse_error_kind).transpose()?,
    })
}

fn parse_address(s: &str) -> Result<Address, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Refused(format!("corrupt address in row: {s}")))
}

fn parse_hash(s: &str) -> Result<H256, StoreError> {
    s.parse()
        .map_err(|_| StoreError::Refused(format!("corrupt hash in row: {s}")))
}

fn parse_u256(s: &str) -> Result<U256, StoreError> {
    U256::from_dec_str(s).map_err(|_| StoreError::Refused(format!("corrupt amount in row: {s}")))
}

fn parse_error_kind(s: &str) -> Result<ErrorKind, StoreError> {
    Ok(match s {
        "transient_storage" => ErrorKind::TransientStorage,
        "transient_ledger" => ErrorKind::TransientLedger,
        "non_benign_rejection" => ErrorKind::NonBenignRejection,
        "fatal_config" => ErrorKind::FatalConfig,
        other => return Err(StoreError::Refused(format!("corrupt error kind in row: {other}"))),
    })
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, tx), level = "debug")]
    async fn insert_transaction(&self, tx: NewTransaction) -> Result<TransactionId, StoreError> {
        let id = Uuid::new_v4();

        sqlx::query(
            r"
            INSERT INTO public_transactions
                (id, signing_address, status, to_address, data, value, gas_limit, has_value)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7)
            ",
        )
        .bind(id)
        .bind(format!("{:#x}", tx.signing_address))
        .bind(format!("{:#x}", tx.to))
        .bind(tx.data.to_vec())
        .bind(tx.value.to_string())
        .bind(tx.gas_limit.to_string())
        .bind(tx.has_value)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;

        Ok(id)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<PublicTransaction>, StoreError> {
        let row = sqlx::query("SELECT * FROM public_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::transient)?;

        row.as_ref().map(row_to_transaction).transpose()
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_transactions(
        &self,
        filter: TransactionFilter,
    ) -> Result<Vec<PublicTransaction>, StoreError> {
        let mut builder =
            sqlx::QueryBuilder::new("SELECT * FROM public_transactions WHERE 1 = 1");

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.to_string());
        }
        if !filter.not_from.is_empty() {
            let not_from: Vec<String> =
                filter.not_from.iter().map(|a| format!("{a:#x}")).collect();
            builder.push(" AND NOT (signing_address = ANY(").push_bind(not_from).push("))");
        }
        builder.push(match filter.order {
            SortOrder::AscendingSequence => " ORDER BY sequence ASC",
            SortOrder::DescendingNonce => " ORDER BY nonce DESC",
        });
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(Self::transient)?;

        rows.iter().map(row_to_transaction).collect()
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_pending_fueling_transaction(
        &self,
        source: Address,
        destination: Address,
    ) -> Result<Option<PublicTransaction>, StoreError> {
        let row = sqlx::query(
            r"
            SELECT * FROM public_transactions
            WHERE has_value = TRUE
              AND signing_address = $1
              AND to_address = $2
              AND status NOT IN ('succeeded', 'failed')
            ORDER BY nonce DESC NULLS FIRST
            LIMIT 1
            ",
        )
        .bind(format!("{source:#x}"))
        .bind(format!("{destination:#x}"))
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;

        row.as_ref().map(row_to_transaction).transpose()
    }

    #[instrument(skip(self), level = "debug")]
    async fn assign_nonce(&self, id: TransactionId, nonce: u64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE public_transactions SET nonce = $1 WHERE id = $2 AND nonce IS NULL",
        )
        .bind(nonce as i64)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Refused(
                "transaction missing or nonce already assigned".into(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, fields), level = "debug")]
    async fn update_status(
        &self,
        id: TransactionId,
        new_status: TxStatus,
        fields: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(Self::transient)?;

        if new_status == TxStatus::Succeeded {
            let row = sqlx::query(
                r"
                SELECT nonce, signing_address FROM public_transactions WHERE id = $1 FOR UPDATE
                ",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Self::transient)?
            .ok_or_else(|| StoreError::Refused("no such transaction".into()))?;

            let nonce: Option<i64> = row.try_get("nonce").map_err(Self::transient)?;
            let signer: String = row.try_get("signing_address").map_err(Self::transient)?;

            if let Some(nonce) = nonce {
                let blocking = sqlx::query(
                    r"
                    SELECT nonce FROM public_transactions
                    WHERE signing_address = $1 AND nonce < $2
                      AND status NOT IN ('succeeded', 'failed')
                    ORDER BY nonce ASC LIMIT 1
                    ",
                )
                .bind(&signer)
                .bind(nonce)
                .fetch_optional(&mut *tx)
                .await
                .map_err(Self::transient)?;

                if let Some(blocking) = blocking {
                    let blocking_nonce: i64 = blocking.try_get("nonce").map_err(Self::transient)?;
                    return Err(StoreError::NonceInvariant {
                        signer,
                        blocking_nonce: blocking_nonce as u64,
                    });
                }
            }
        }

        let (max_fee, priority_fee, legacy_price) = match fields.gas_price {
            Some(GasPrice::Eip1559 { max_fee_per_gas, max_priority_fee_per_gas }) => {
                (Some(max_fee_per_gas.to_string()), Some(max_priority_fee_per_gas.to_string()), None)
            }
            Some(GasPrice::Legacy { gas_price }) => (None, None, Some(gas_price.to_string())),
            None => (None, None, None),
        };

        let row = sqlx::query(
            r"
            UPDATE public_transactions SET
                status = $1,
                last_action_time = now(),
                nonce = COALESCE($2, nonce),
                max_fee_per_gas = COALESCE($3, max_fee_per_gas),
                max_priority_fee_per_gas = COALESCE($4, max_priority_fee_per_gas),
                gas_price = COALESCE($5, gas_price),
                last_broadcast_hash = COALESCE($6, last_broadcast_hash),
                attempt_count = COALESCE($7, attempt_count),
                last_error_kind = COALESCE($8, last_error_kind)
            WHERE id = $9
            RETURNING signing_address, nonce
            ",
        )
        .bind(new_status.to_string())
        .bind(fields.nonce.map(|n| n as i64))
        .bind(max_fee)
        .bind(priority_fee)
        .bind(legacy_price)
        .bind(fields.broadcast_hash.map(|h| format!("{h:#x}")))
        .bind(fields.attempt_count.map(|c| c as i32))
        .bind(fields.error_kind.map(|k| k.to_string()))
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(Self::transient)?;

        if new_status.is_terminal() {
            let signer: String = row.try_get("signing_address").map_err(Self::transient)?;
            let nonce: Option<i64> = row.try_get("nonce").map_err(Self::transient)?;
            if let Some(nonce) = nonce {
                sqlx::query(
                    r"
                    INSERT INTO completed_nonces (signing_address, highest_nonce)
                    VALUES ($1, $2)
                    ON CONFLICT (signing_address)
                    DO UPDATE SET highest_nonce = GREATEST(completed_nonces.highest_nonce, EXCLUDED.highest_nonce)
                    ",
                )
                .bind(signer)
                .bind(nonce)
                .execute(&mut *tx)
                .await
                .map_err(Self::transient)?;
            }
        }

        tx.commit().await.map_err(Self::transient)?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn cancel_transaction(&self, id: TransactionId) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"
            UPDATE public_transactions SET status = 'failed'
            WHERE id = $1 AND status = 'pending' AND nonce IS NULL
            ",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Refused(
                "transaction already has a nonce assigned, or does not exist".into(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn record_receipt(
        &self,
        hash: H256,
        transaction_id: TransactionId,
        block_number: u64,
        succeeded: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO transaction_receipts (hash, transaction_id, block_number, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (hash) DO UPDATE SET block_number = EXCLUDED.block_number, status = EXCLUDED.status
            ",
        )
        .bind(format!("{hash:#x}"))
        .bind(transaction_id)
        .bind(block_number as i64)
        .bind(i16::from(succeeded))
        .execute(&self.pool)
        .await
        .map_err(Self::transient)?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn unrecord_receipt(&self, hash: H256) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM transaction_receipts WHERE hash = $1")
            .bind(format!("{hash:#x}"))
            .execute(&self.pool)
            .await
            .map_err(Self::transient)?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn highest_terminal_nonce(&self, signer: Address) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(
            "SELECT highest_nonce FROM completed_nonces WHERE signing_address = $1",
        )
        .bind(format!("{signer:#x}"))
        .fetch_optional(&self.pool)
        .await
        .map_err(Self::transient)?;

        let Some(row) = row else { return Ok(None) };
        let highest: i64 = row.try_get("highest_nonce").map_err(Self::transient)?;
        Ok(Some(highest as u64))
    }
}

/// Exercises [`PgStore`] against a real, throwaway Postgres instance,
/// mirroring `src/database/mod.rs`'s own `#[cfg(test)] mod test` in the
/// teacher: one `postgres_docker_utils`-spawned container shared across the
/// module, dropped at the end of the process.
#[cfg(test)]
mod postgres_tests {
    use ethers::types::{Address, Bytes, U256};
    use once_cell::sync::OnceCell;

    use super::*;
    use crate::store::StatusUpdate;
    use crate::types::{NewTransaction, TransactionFilter, TxStatus};

    static CONTAINER: OnceCell<postgres_docker_utils::DockerContainerGuard> = OnceCell::new();

    async fn connect() -> PgStore {
        let guard = CONTAINER.get_or_init(|| {
            futures::executor::block_on(postgres_docker_utils::setup())
                .expect("failed to start postgres container")
        });

        let config = DatabaseConfig {
            url: format!("postgres://postgres@127.0.0.1:{}/postgres", guard.port()),
            max_connections: 5,
            migrate: true,
        };

        PgStore::connect(&config).await.expect("failed to connect to throwaway postgres")
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
    async fn list_transactions_with_no_filter_returns_everything() {
        let store = connect().await;
        let signer = Address::random();
        store.insert_transaction(new_tx(signer)).await.unwrap();

        let rows = store.list_transactions(TransactionFilter::default()).await.unwrap();
        assert!(rows.iter().any(|row| row.signing_address == signer));
    }

    #[tokio::test]
    async fn list_transactions_filters_by_status_only() {
        let store = connect().await;
        let signer = Address::random();
        let id = store.insert_transaction(new_tx(signer)).await.unwrap();
        store.assign_nonce(id, 0).await.unwrap();
        store
            .update_status(id, TxStatus::Submitted, StatusUpdate::default())
            .await
            .unwrap();

        // A status filter with an empty `not_from` used to bind a second
        // value for a query with only one placeholder, failing at runtime.
        let rows = store
            .list_transactions(TransactionFilter {
                status: Some(TxStatus::Submitted),
                not_from: vec![],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rows.iter().any(|row| row.id == id));
    }

    #[tokio::test]
    async fn list_transactions_filters_by_not_from_only() {
        let store = connect().await;
        let excluded = Address::random();
        let included = Address::random();
        store.insert_transaction(new_tx(excluded)).await.unwrap();
        let kept = store.insert_transaction(new_tx(included)).await.unwrap();

        let rows = store
            .list_transactions(TransactionFilter {
                status: None,
                not_from: vec![excluded],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rows.iter().all(|row| row.signing_address != excluded));
        assert!(rows.iter().any(|row| row.id == kept));
    }

    #[tokio::test]
    async fn list_transactions_filters_by_both_status_and_not_from() {
        let store = connect().await;
        let excluded = Address::random();
        let included = Address::random();
        let kept = store.insert_transaction(new_tx(included)).await.unwrap();
        store.insert_transaction(new_tx(excluded)).await.unwrap();

        let rows = store
            .list_transactions(TransactionFilter {
                status: Some(TxStatus::Pending),
                not_from: vec![excluded],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(rows.iter().all(|row| row.signing_address != excluded));
        assert!(rows.iter().any(|row| row.id == kept));
    }

    #[tokio::test]
    async fn update_status_mirrors_terminal_nonce_into_completed_nonces() {
        let store = connect().await;
        let signer = Address::random();
        let id = store.insert_transaction(new_tx(signer)).await.unwrap();
        store.assign_nonce(id, 4).await.unwrap();

        assert_eq!(store.highest_terminal_nonce(signer).await.unwrap(), None);

        store
            .update_status(id, TxStatus::Succeeded, StatusUpdate::default())
            .await
            .unwrap();

        assert_eq!(store.highest_terminal_nonce(signer).await.unwrap(), Some(4));
    }
}

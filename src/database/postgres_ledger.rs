//! PostgreSQL-backed payment ledger
//!
//! Each transition runs in one database transaction: the transaction row is
//! locked with `SELECT ... FOR UPDATE`, the webhook dedupe row is inserted with
//! `ON CONFLICT DO NOTHING`, and the status, history and refund changes are
//! committed together. Concurrent engine processes therefore serialize on the
//! row even without the in-process lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info};

use crate::database::error::{DatabaseError, DatabaseResult};
use crate::database::repository::{CommitOutcome, PaymentLedger, RefundChange, Transition};
use crate::middleware::logging::log_database_query;
use crate::payments::types::{
    Page, PaymentTransaction, RefundRecord, StatusChange, TransactionFilter, TransactionStatus,
};

const TRANSACTION_COLUMNS: &str = "transaction_id, order_id, user_id, payer_vpa, amount_minor, \
     currency, status, gateway_reference, failure_reason, created_at, updated_at";

const REFUND_COLUMNS: &str = "refund_id, transaction_id, amount_minor, reason, status, \
     initiated_by, gateway_refund_reference, failure_reason, created_at, updated_at";

/// Connection pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    transaction_id: String,
    order_id: String,
    user_id: String,
    payer_vpa: String,
    amount_minor: i64,
    currency: String,
    status: String,
    gateway_reference: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(PaymentTransaction {
            status: parse_column(&row.status)?,
            transaction_id: row.transaction_id,
            order_id: row.order_id,
            user_id: row.user_id,
            payer_vpa: row.payer_vpa,
            amount_minor: row.amount_minor,
            currency: row.currency,
            gateway_reference: row.gateway_reference,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    refund_id: String,
    transaction_id: String,
    amount_minor: i64,
    reason: String,
    status: String,
    initiated_by: String,
    gateway_refund_reference: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for RefundRecord {
    type Error = DatabaseError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(RefundRecord {
            status: parse_column(&row.status)?,
            refund_id: row.refund_id,
            transaction_id: row.transaction_id,
            amount_minor: row.amount_minor,
            reason: row.reason,
            initiated_by: row.initiated_by,
            gateway_refund_reference: row.gateway_refund_reference,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    transaction_id: String,
    from_status: Option<String>,
    to_status: String,
    source: String,
    event_id: Option<String>,
    note: String,
    changed_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for StatusChange {
    type Error = DatabaseError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(StatusChange {
            from_status: row.from_status.as_deref().map(parse_column).transpose()?,
            to_status: parse_column(&row.to_status)?,
            source: parse_column(&row.source)?,
            transaction_id: row.transaction_id,
            event_id: row.event_id,
            note: row.note,
            changed_at: row.changed_at,
        })
    }
}

fn parse_column<T>(value: &str) -> DatabaseResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| DatabaseError::Storage {
        message: format!("corrupt column value '{}': {}", value, e),
        is_retryable: false,
    })
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filter: &TransactionFilter) {
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(order_id) = &filter.order_id {
        qb.push(" AND order_id = ").push_bind(order_id.clone());
    }
    if let Some(user_id) = &filter.user_id {
        qb.push(" AND user_id = ").push_bind(user_id.clone());
    }
    if let Some(from) = filter.created_from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.created_to {
        qb.push(" AND created_at <= ").push_bind(to);
    }
}

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool and run the embedded migrations
    pub async fn connect(database_url: &str, config: PoolConfig) -> DatabaseResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Storage {
                message: format!("migration failed: {}", e),
                is_retryable: false,
            })?;

        info!(
            max_connections = config.max_connections,
            "Payment ledger connection pool initialized"
        );
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_transaction(
        &self,
        column: &str,
        value: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE {} = $1",
            TRANSACTION_COLUMNS, column
        );
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PaymentTransaction::try_from).transpose()
    }
}

/// The only unique index an UPDATE can hit is `gateway_reference`; report it
/// the same way the in-memory ledger does
fn reference_conflict(err: sqlx::Error, transaction_id: &str) -> DatabaseError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            DatabaseError::GatewayReferenceAlreadySet {
                transaction_id: transaction_id.to_string(),
            }
        }
        _ => err.into(),
    }
}

#[async_trait]
impl PaymentLedger for PgLedger {
    async fn insert_transaction(&self, tx: &PaymentTransaction) -> DatabaseResult<()> {
        let mut db_tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO payment_transactions (
                transaction_id, order_id, user_id, payer_vpa, amount_minor, currency,
                status, gateway_reference, failure_reason, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(&tx.transaction_id)
        .bind(&tx.order_id)
        .bind(&tx.user_id)
        .bind(&tx.payer_vpa)
        .bind(tx.amount_minor)
        .bind(&tx.currency)
        .bind(tx.status.as_str())
        .bind(&tx.gateway_reference)
        .bind(&tx.failure_reason)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&mut *db_tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(DatabaseError::DuplicateOrder {
                order_id: tx.order_id.clone(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO transaction_status_history
                (transaction_id, from_status, to_status, source, event_id, note, changed_at)
            VALUES ($1, NULL, $2, 'initiation', NULL, 'Transaction created', $3)
            "#,
        )
        .bind(&tx.transaction_id)
        .bind(tx.status.as_str())
        .bind(tx.created_at)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, transaction_id: &str) -> DatabaseResult<Option<PaymentTransaction>> {
        self.fetch_transaction("transaction_id", transaction_id).await
    }

    async fn find_by_order(&self, order_id: &str) -> DatabaseResult<Option<PaymentTransaction>> {
        self.fetch_transaction("order_id", order_id).await
    }

    async fn find_by_gateway_reference(
        &self,
        gateway_reference: &str,
    ) -> DatabaseResult<Option<PaymentTransaction>> {
        self.fetch_transaction("gateway_reference", gateway_reference)
            .await
    }

    async fn commit_transition(&self, transition: Transition) -> DatabaseResult<CommitOutcome> {
        let tx_id = transition.transaction_id.clone();
        // dropping db_tx without commit rolls back every statement below
        let mut db_tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE transaction_id = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        );
        let current: PaymentTransaction = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(&tx_id)
            .fetch_optional(&mut *db_tx)
            .await?
            .ok_or_else(|| DatabaseError::TransactionNotFound {
                transaction_id: tx_id.clone(),
            })?
            .try_into()?;

        if let Some(event) = &transition.event {
            let recorded = sqlx::query(
                r#"
                INSERT INTO webhook_events (transaction_id, event_id, payload, signature, received_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (transaction_id, event_id) DO NOTHING
                "#,
            )
            .bind(&tx_id)
            .bind(&event.event_id)
            .bind(&event.payload)
            .bind(&event.signature)
            .bind(event.received_at)
            .execute(&mut *db_tx)
            .await?
            .rows_affected();

            if recorded == 0 {
                debug!(tx_id = %tx_id, event_id = %event.event_id, "Webhook event already recorded");
                db_tx.rollback().await?;
                return Ok(CommitOutcome::DuplicateEvent(current));
            }
        }

        if current.status != transition.from {
            return Err(DatabaseError::StaleState {
                transaction_id: tx_id,
                expected: transition.from,
                actual: current.status,
            });
        }

        if let (Some(existing), Some(requested)) =
            (&current.gateway_reference, &transition.gateway_reference)
        {
            if existing != requested {
                return Err(DatabaseError::GatewayReferenceAlreadySet {
                    transaction_id: tx_id,
                });
            }
        }

        let now = Utc::now();
        match &transition.refund {
            Some(RefundChange::Open(refund)) => {
                let active: bool = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM refunds WHERE transaction_id = $1 AND status <> 'FAILED')",
                )
                .bind(&tx_id)
                .fetch_one(&mut *db_tx)
                .await?;
                if active {
                    return Err(DatabaseError::ActiveRefundExists {
                        transaction_id: tx_id,
                    });
                }

                sqlx::query(
                    r#"
                    INSERT INTO refunds (
                        refund_id, transaction_id, amount_minor, reason, status, initiated_by,
                        gateway_refund_reference, failure_reason, created_at, updated_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(&refund.refund_id)
                .bind(&tx_id)
                .bind(refund.amount_minor)
                .bind(&refund.reason)
                .bind(refund.status.as_str())
                .bind(&refund.initiated_by)
                .bind(&refund.gateway_refund_reference)
                .bind(&refund.failure_reason)
                .bind(refund.created_at)
                .bind(refund.updated_at)
                .execute(&mut *db_tx)
                .await?;
            }
            Some(RefundChange::Settle {
                refund_id,
                status,
                gateway_refund_reference,
                failure_reason,
            }) => {
                let updated = sqlx::query(
                    r#"
                    UPDATE refunds
                    SET status = $3,
                        gateway_refund_reference = COALESCE(gateway_refund_reference, $4),
                        failure_reason = COALESCE($5, failure_reason),
                        updated_at = $6
                    WHERE refund_id = $1 AND transaction_id = $2
                    "#,
                )
                .bind(refund_id)
                .bind(&tx_id)
                .bind(status.as_str())
                .bind(gateway_refund_reference)
                .bind(failure_reason)
                .bind(now)
                .execute(&mut *db_tx)
                .await?
                .rows_affected();
                if updated == 0 {
                    return Err(DatabaseError::RefundNotFound {
                        refund_id: refund_id.clone(),
                    });
                }
            }
            None => {}
        }

        let sql = format!(
            r#"
            UPDATE payment_transactions
            SET status = $2,
                gateway_reference = COALESCE(gateway_reference, $3),
                failure_reason = COALESCE($4, failure_reason),
                updated_at = $5
            WHERE transaction_id = $1
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );
        let updated: PaymentTransaction = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(&tx_id)
            .bind(transition.to.as_str())
            .bind(&transition.gateway_reference)
            .bind(&transition.failure_reason)
            .bind(now)
            .fetch_one(&mut *db_tx)
            .await
            .map_err(|e| reference_conflict(e, &tx_id))?
            .try_into()?;

        let entry = transition.history_entry(now);
        sqlx::query(
            r#"
            INSERT INTO transaction_status_history
                (transaction_id, from_status, to_status, source, event_id, note, changed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&entry.transaction_id)
        .bind(entry.from_status.map(|s| s.as_str()))
        .bind(entry.to_status.as_str())
        .bind(entry.source.as_str())
        .bind(&entry.event_id)
        .bind(&entry.note)
        .bind(entry.changed_at)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(CommitOutcome::Applied(updated))
    }

    async fn is_event_applied(&self, transaction_id: &str, event_id: &str) -> DatabaseResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM webhook_events WHERE transaction_id = $1 AND event_id = $2)",
        )
        .bind(transaction_id)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn set_refund_reference(
        &self,
        refund_id: &str,
        gateway_refund_reference: &str,
    ) -> DatabaseResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE refunds
            SET gateway_refund_reference = COALESCE(gateway_refund_reference, $2),
                updated_at = NOW()
            WHERE refund_id = $1
            "#,
        )
        .bind(refund_id)
        .bind(gateway_refund_reference)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(DatabaseError::RefundNotFound {
                refund_id: refund_id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_refund(&self, refund_id: &str) -> DatabaseResult<Option<RefundRecord>> {
        let sql = format!("SELECT {} FROM refunds WHERE refund_id = $1", REFUND_COLUMNS);
        let row: Option<RefundRow> = sqlx::query_as(&sql)
            .bind(refund_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RefundRecord::try_from).transpose()
    }

    async fn find_refunds(&self, transaction_id: &str) -> DatabaseResult<Vec<RefundRecord>> {
        let sql = format!(
            "SELECT {} FROM refunds WHERE transaction_id = $1 ORDER BY created_at ASC",
            REFUND_COLUMNS
        );
        let rows: Vec<RefundRow> = sqlx::query_as(&sql)
            .bind(transaction_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RefundRecord::try_from).collect()
    }

    async fn history(&self, transaction_id: &str) -> DatabaseResult<Vec<StatusChange>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT transaction_id, from_status, to_status, source, event_id, note, changed_at
            FROM transaction_status_history
            WHERE transaction_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StatusChange::try_from).collect()
    }

    async fn list(&self, filter: &TransactionFilter) -> DatabaseResult<Page<PaymentTransaction>> {
        let mut count_qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM payment_transactions WHERE TRUE");
        push_filters(&mut count_qb, filter);

        let mut page_qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM payment_transactions WHERE TRUE",
            TRANSACTION_COLUMNS
        ));
        push_filters(&mut page_qb, filter);
        page_qb
            .push(" ORDER BY created_at DESC, transaction_id ASC LIMIT ")
            .push_bind(filter.per_page() as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset() as i64);

        let total: i64 = log_database_query(
            "SELECT COUNT(*) FROM payment_transactions",
            count_qb.build_query_scalar().fetch_one(&self.pool),
        )
        .await?;

        let rows: Vec<TransactionRow> = log_database_query(
            "SELECT ... FROM payment_transactions ORDER BY created_at DESC",
            page_qb.build_query_as().fetch_all(&self.pool),
        )
        .await?;

        let items = rows
            .into_iter()
            .map(PaymentTransaction::try_from)
            .collect::<DatabaseResult<Vec<_>>>()?;
        Ok(Page::new(
            items,
            total.max(0) as u64,
            filter.page(),
            filter.per_page(),
        ))
    }

    async fn find_stale(
        &self,
        statuses: &[TransactionStatus],
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> DatabaseResult<Vec<PaymentTransaction>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            SELECT {} FROM payment_transactions
            WHERE status = ANY($1)
            AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
            TRANSACTION_COLUMNS
        );

        let rows: Vec<TransactionRow> = log_database_query(
            "SELECT ... FROM payment_transactions WHERE status = ANY($1) AND updated_at < $2",
            sqlx::query_as(&sql)
                .bind(statuses)
                .bind(updated_before)
                .bind(limit)
                .fetch_all(&self.pool),
        )
        .await?;

        rows.into_iter().map(PaymentTransaction::try_from).collect()
    }
}

//! PostgreSQL ledger store for allocation-service.

use crate::models::{
    AllocationRecord, AuditStatus, AuditTransaction, FeatureFlagState, Invoice, InvoiceStatus,
    NewAllocation, NewAuditTransaction, NewInvoice, NewPayment, NewReconciliationRun, Payment,
    ReconciliationRun,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{FlagStore, LedgerStore, LedgerTx};
use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "allocation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn db_error(action: &'static str) -> impl Fn(sqlx::Error) -> AppError {
    move |e| AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", action, e))
}

fn ensure_updated(
    rows_affected: u64,
    what: &str,
    id: impl std::fmt::Display,
) -> Result<(), AppError> {
    if rows_affected == 0 {
        return Err(AppError::NotFound(anyhow::anyhow!("{} {} not found", what, id)));
    }
    Ok(())
}

/// An open PostgreSQL transaction. Row locks are `SELECT … FOR UPDATE`.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, representative_id, amount, payment_date, is_allocated, invoice_id, parent_payment_id, description, created_utc
            FROM payments
            WHERE payment_id = $1
            FOR UPDATE
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("lock payment"))?;

        timer.observe_duration();
        Ok(payment)
    }

    async fn lock_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, representative_id, invoice_number, amount, issue_date, due_date, status, created_utc
            FROM invoices
            WHERE invoice_id = $1
            FOR UPDATE
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("lock invoice"))?;

        timer.observe_duration();
        Ok(invoice)
    }

    async fn lock_open_invoices(
        &mut self,
        representative_id: Uuid,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_open_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, representative_id, invoice_number, amount, issue_date, due_date, status, created_utc
            FROM invoices
            WHERE representative_id = $1 AND status = ANY($2)
            ORDER BY invoice_id
            FOR UPDATE
            "#,
        )
        .bind(representative_id)
        .bind(&InvoiceStatus::OPEN[..])
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error("lock open invoices"))?;

        timer.observe_duration();
        Ok(invoices)
    }

    async fn lock_invoices(&mut self, invoice_ids: &[Uuid]) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, representative_id, invoice_number, amount, issue_date, due_date, status, created_utc
            FROM invoices
            WHERE invoice_id = ANY($1)
            ORDER BY invoice_id
            FOR UPDATE
            "#,
        )
        .bind(invoice_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error("lock invoices"))?;

        timer.observe_duration();
        Ok(invoices)
    }

    async fn allocated_to_invoice(&mut self, invoice_id: Uuid) -> Result<Decimal, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["allocated_to_invoice"])
            .start_timer();

        let total = sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(allocated_amount), 0) FROM payment_allocations WHERE invoice_id = $1",
        )
        .bind(invoice_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_error("sum invoice allocations"))?;

        timer.observe_duration();
        Ok(total)
    }

    async fn insert_allocation(
        &mut self,
        allocation: &NewAllocation,
    ) -> Result<AllocationRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_allocation"])
            .start_timer();

        let record = sqlx::query_as::<_, AllocationRecord>(
            r#"
            INSERT INTO payment_allocations (allocation_id, payment_id, invoice_id, allocated_amount, method, performed_by, transaction_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING allocation_id, payment_id, invoice_id, allocated_amount, method, performed_by, transaction_id, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(allocation.payment_id)
        .bind(allocation.invoice_id)
        .bind(allocation.allocated_amount)
        .bind(allocation.method.as_str())
        .bind(&allocation.performed_by)
        .bind(&allocation.transaction_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_error("insert allocation"))?;

        timer.observe_duration();
        Ok(record)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let row = insert_payment_query(payment)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_error("insert payment"))?;

        timer.observe_duration();
        Ok(row)
    }

    async fn mark_payment_allocated(
        &mut self,
        payment_id: Uuid,
        invoice_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE payments SET is_allocated = TRUE, invoice_id = COALESCE($2, invoice_id) WHERE payment_id = $1",
        )
        .bind(payment_id)
        .bind(invoice_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("mark payment allocated"))?;

        ensure_updated(result.rows_affected(), "Payment", payment_id)
    }

    async fn mark_payment_unallocated(
        &mut self,
        payment_id: Uuid,
        invoice_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE payments SET is_allocated = FALSE, invoice_id = $2 WHERE payment_id = $1",
        )
        .bind(payment_id)
        .bind(invoice_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("mark payment unallocated"))?;

        ensure_updated(result.rows_affected(), "Payment", payment_id)
    }

    async fn delete_payment(&mut self, payment_id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM payments WHERE payment_id = $1")
            .bind(payment_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("delete payment"))?;
        Ok(())
    }

    async fn update_invoice_status(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE invoices SET status = $2 WHERE invoice_id = $1")
            .bind(invoice_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("update invoice status"))?;

        ensure_updated(result.rows_affected(), "Invoice", invoice_id)
    }

    async fn delete_allocations_for_transaction(
        &mut self,
        transaction_id: &str,
    ) -> Result<Vec<AllocationRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_allocations"])
            .start_timer();

        let removed = sqlx::query_as::<_, AllocationRecord>(
            r#"
            DELETE FROM payment_allocations
            WHERE transaction_id = $1
            RETURNING allocation_id, payment_id, invoice_id, allocated_amount, method, performed_by, transaction_id, created_utc
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error("delete allocations"))?;

        timer.observe_duration();
        Ok(removed)
    }

    async fn insert_audit(
        &mut self,
        audit: &NewAuditTransaction,
    ) -> Result<AuditTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_audit"])
            .start_timer();

        let row = sqlx::query_as::<_, AuditTransaction>(
            r#"
            INSERT INTO audit_transactions (transaction_id, transaction_type, status, representative_id, payment_id, original_state, target_state, initiated_by, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING transaction_id, transaction_type, status, representative_id, payment_id, original_state, target_state, actual_state, rollback_data, initiated_by, reason, created_utc, completed_utc, rolled_back_utc
            "#,
        )
        .bind(&audit.transaction_id)
        .bind(audit.transaction_type.as_str())
        .bind(AuditStatus::Pending.as_str())
        .bind(audit.representative_id)
        .bind(audit.payment_id)
        .bind(&audit.original_state)
        .bind(&audit.target_state)
        .bind(&audit.initiated_by)
        .bind(&audit.reason)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Audit transaction {} already exists",
                    audit.transaction_id
                ))
            }
            other => db_error("insert audit transaction")(other),
        })?;

        timer.observe_duration();
        Ok(row)
    }

    async fn lock_audit(
        &mut self,
        transaction_id: &str,
    ) -> Result<Option<AuditTransaction>, AppError> {
        sqlx::query_as::<_, AuditTransaction>(
            r#"
            SELECT transaction_id, transaction_type, status, representative_id, payment_id, original_state, target_state, actual_state, rollback_data, initiated_by, reason, created_utc, completed_utc, rolled_back_utc
            FROM audit_transactions
            WHERE transaction_id = $1
            FOR UPDATE
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("lock audit transaction"))
    }

    async fn complete_audit(
        &mut self,
        transaction_id: &str,
        actual_state: serde_json::Value,
        rollback_data: serde_json::Value,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE audit_transactions
            SET status = $2, actual_state = $3, rollback_data = $4, completed_utc = NOW()
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(AuditStatus::Completed.as_str())
        .bind(actual_state)
        .bind(rollback_data)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("complete audit transaction"))?;

        ensure_updated(result.rows_affected(), "Audit transaction", transaction_id)
    }

    async fn mark_audit_rolled_back(
        &mut self,
        transaction_id: &str,
        actual_state: serde_json::Value,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE audit_transactions
            SET status = $2, actual_state = $3, rolled_back_utc = NOW()
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(AuditStatus::RolledBack.as_str())
        .bind(actual_state)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("roll back audit transaction"))?;

        ensure_updated(result.rows_affected(), "Audit transaction", transaction_id)
    }

    async fn commit(self) -> Result<(), AppError> {
        self.tx.commit().await.map_err(db_error("commit transaction"))
    }

    async fn rollback(self) -> Result<(), AppError> {
        self.tx
            .rollback()
            .await
            .map_err(db_error("roll back transaction"))
    }
}

fn insert_payment_query(
    payment: &NewPayment,
) -> sqlx::query::QueryAs<'static, Postgres, Payment, sqlx::postgres::PgArguments> {
    sqlx::query_as::<_, Payment>(
        r#"
        INSERT INTO payments (payment_id, representative_id, amount, payment_date, is_allocated, invoice_id, parent_payment_id, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING payment_id, representative_id, amount, payment_date, is_allocated, invoice_id, parent_payment_id, description, created_utc
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(payment.representative_id)
    .bind(payment.amount)
    .bind(payment.payment_date)
    .bind(payment.is_allocated)
    .bind(payment.invoice_id)
    .bind(payment.parent_payment_id)
    .bind(payment.description.clone())
}

#[async_trait]
impl LedgerStore for Database {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<PgLedgerTx, AppError> {
        let tx = self.pool.begin().await?;
        Ok(PgLedgerTx { tx })
    }

    #[instrument(skip(self, payment), fields(representative_id = %payment.representative_id))]
    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let row = insert_payment_query(payment)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("insert payment"))?;

        timer.observe_duration();
        info!(payment_id = %row.payment_id, amount = %row.amount, "Payment recorded");
        Ok(row)
    }

    #[instrument(skip(self, invoice), fields(representative_id = %invoice.representative_id))]
    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let row = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (invoice_id, representative_id, invoice_number, amount, issue_date, due_date, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING invoice_id, representative_id, invoice_number, amount, issue_date, due_date, status, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice.representative_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.amount)
        .bind(invoice.issue_date)
        .bind(invoice.due_date)
        .bind(InvoiceStatus::Unpaid.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("insert invoice"))?;

        timer.observe_duration();
        info!(invoice_id = %row.invoice_id, amount = %row.amount, "Invoice recorded");
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            SELECT payment_id, representative_id, amount, payment_date, is_allocated, invoice_id, parent_payment_id, description, created_utc
            FROM payments
            WHERE payment_id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get payment"))?;

        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, representative_id, invoice_number, amount, issue_date, due_date, status, created_utc
            FROM invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get invoice"))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn payment_chain(&self, payment_id: Uuid) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["payment_chain"])
            .start_timer();

        let chain = sqlx::query_as::<_, Payment>(
            r#"
            WITH RECURSIVE chain AS (
                SELECT payment_id, representative_id, amount, payment_date, is_allocated, invoice_id, parent_payment_id, description, created_utc, 0 AS depth
                FROM payments
                WHERE payment_id = $1
                UNION ALL
                SELECT p.payment_id, p.representative_id, p.amount, p.payment_date, p.is_allocated, p.invoice_id, p.parent_payment_id, p.description, p.created_utc, chain.depth + 1
                FROM payments p
                JOIN chain ON p.parent_payment_id = chain.payment_id
            )
            SELECT payment_id, representative_id, amount, payment_date, is_allocated, invoice_id, parent_payment_id, description, created_utc
            FROM chain
            ORDER BY depth, created_utc
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load payment chain"))?;

        timer.observe_duration();
        Ok(chain)
    }

    #[instrument(skip(self))]
    async fn allocations_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, AppError> {
        sqlx::query_as::<_, AllocationRecord>(
            r#"
            SELECT allocation_id, payment_id, invoice_id, allocated_amount, method, performed_by, transaction_id, created_utc
            FROM payment_allocations
            WHERE payment_id = $1
            ORDER BY created_utc, allocation_id
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list payment allocations"))
    }

    #[instrument(skip(self))]
    async fn allocations_for_invoice(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, AppError> {
        sqlx::query_as::<_, AllocationRecord>(
            r#"
            SELECT allocation_id, payment_id, invoice_id, allocated_amount, method, performed_by, transaction_id, created_utc
            FROM payment_allocations
            WHERE invoice_id = $1
            ORDER BY created_utc, allocation_id
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list invoice allocations"))
    }

    #[instrument(skip(self))]
    async fn get_audit_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<AuditTransaction>, AppError> {
        sqlx::query_as::<_, AuditTransaction>(
            r#"
            SELECT transaction_id, transaction_type, status, representative_id, payment_id, original_state, target_state, actual_state, rollback_data, initiated_by, reason, created_utc, completed_utc, rolled_back_utc
            FROM audit_transactions
            WHERE transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get audit transaction"))
    }

    #[instrument(skip(self))]
    async fn legacy_allocated_by_representative(
        &self,
        representative_id: Option<Uuid>,
    ) -> Result<Vec<(Uuid, Decimal)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["legacy_allocated"])
            .start_timer();

        let rows = sqlx::query_as::<_, (Uuid, Decimal)>(
            r#"
            SELECT representative_id, SUM(amount)
            FROM payments
            WHERE is_allocated AND ($1::uuid IS NULL OR representative_id = $1)
            GROUP BY representative_id
            ORDER BY representative_id
            "#,
        )
        .bind(representative_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("sum legacy allocations"))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn ledger_allocated_by_representative(
        &self,
        representative_id: Option<Uuid>,
    ) -> Result<Vec<(Uuid, Decimal)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["ledger_allocated"])
            .start_timer();

        let rows = sqlx::query_as::<_, (Uuid, Decimal)>(
            r#"
            SELECT p.representative_id, SUM(a.allocated_amount)
            FROM payment_allocations a
            JOIN payments p ON p.payment_id = a.payment_id
            WHERE ($1::uuid IS NULL OR p.representative_id = $1)
            GROUP BY p.representative_id
            ORDER BY p.representative_id
            "#,
        )
        .bind(representative_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("sum ledger allocations"))?;

        timer.observe_duration();
        Ok(rows)
    }

    #[instrument(skip(self, run), fields(scope = %run.scope, status = %run.status))]
    async fn insert_reconciliation_run(
        &self,
        run: &NewReconciliationRun,
    ) -> Result<ReconciliationRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_reconciliation_run"])
            .start_timer();

        let row = sqlx::query_as::<_, ReconciliationRun>(
            r#"
            INSERT INTO reconciliation_runs (run_id, scope, diff_abs, diff_ratio, status, mode, meta)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING run_id, scope, diff_abs, diff_ratio, status, mode, meta, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&run.scope)
        .bind(run.diff_abs)
        .bind(run.diff_ratio)
        .bind(run.status.as_str())
        .bind(&run.mode)
        .bind(&run.meta)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("insert reconciliation run"))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn list_reconciliation_runs(
        &self,
        limit: i64,
    ) -> Result<Vec<ReconciliationRun>, AppError> {
        sqlx::query_as::<_, ReconciliationRun>(
            r#"
            SELECT run_id, scope, diff_abs, diff_ratio, status, mode, meta, created_utc
            FROM reconciliation_runs
            ORDER BY created_utc DESC, run_id
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(0, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list reconciliation runs"))
    }

    #[instrument(skip(self))]
    async fn backfill_candidates(&self, limit: i64) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["backfill_candidates"])
            .start_timer();

        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT p.payment_id, p.representative_id, p.amount, p.payment_date, p.is_allocated,
                   p.invoice_id, p.parent_payment_id, p.description, p.created_utc
            FROM payments p
            WHERE p.is_allocated
              AND NOT EXISTS (
                  SELECT 1 FROM payment_allocations a WHERE a.payment_id = p.payment_id
              )
            ORDER BY p.created_utc, p.payment_id
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(0, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list backfill candidates"))?;

        timer.observe_duration();
        Ok(payments)
    }
}

#[async_trait]
impl FlagStore for Database {
    #[instrument(skip(self))]
    async fn load_flags(&self) -> Result<Vec<FeatureFlagState>, AppError> {
        sqlx::query_as::<_, FeatureFlagState>(
            "SELECT name, state, rollout_percentage, last_changed_by, reason, updated_utc FROM feature_flags ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("load feature flags"))
    }

    #[instrument(skip(self, flag), fields(flag = %flag.name, state = %flag.state))]
    async fn save_flag(&self, flag: &FeatureFlagState) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO feature_flags (name, state, rollout_percentage, last_changed_by, reason, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE
            SET state = EXCLUDED.state,
                rollout_percentage = EXCLUDED.rollout_percentage,
                last_changed_by = EXCLUDED.last_changed_by,
                reason = EXCLUDED.reason,
                updated_utc = EXCLUDED.updated_utc
            "#,
        )
        .bind(&flag.name)
        .bind(&flag.state)
        .bind(flag.rollout_percentage)
        .bind(&flag.last_changed_by)
        .bind(&flag.reason)
        .bind(flag.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(db_error("save feature flag"))?;
        Ok(())
    }
}

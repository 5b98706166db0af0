//! Database layer: pool setup, migrations and the SQLite contribution store.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::contribution::{Contribution, ContributionStatus, NewContribution};
use crate::errors::{PaymentError, Result};
use crate::store::{ContributionStore, Transition};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // An in-memory database lives and dies with its connection.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

#[derive(Clone)]
pub struct SqliteContributionStore {
    pool: SqlitePool,
}

impl SqliteContributionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn map_unique_violation(err: sqlx::Error, reference: Option<&str>) -> PaymentError {
    match (&err, reference) {
        (sqlx::Error::Database(db), Some(reference)) if db.is_unique_violation() => {
            PaymentError::DuplicateReference(reference.to_string())
        }
        _ => PaymentError::Database(err),
    }
}

// ─────────────────────────────────────────────────────────
// Store implementation
// ─────────────────────────────────────────────────────────

#[async_trait]
impl ContributionStore for SqliteContributionStore {
    async fn create(&self, new: NewContribution) -> Result<Contribution> {
        let c = Contribution::new_pending(new);
        sqlx::query(
            r#"
            INSERT INTO contributions
                (id, contributor_name, amount, phone_number, payment_method,
                 purpose, status, external_reference, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&c.id)
        .bind(&c.contributor_name)
        .bind(c.amount)
        .bind(&c.phone_number)
        .bind(c.payment_method)
        .bind(&c.purpose)
        .bind(c.status)
        .bind(&c.external_reference)
        .bind(c.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(c)
    }

    async fn get(&self, id: &str) -> Result<Option<Contribution>> {
        let row = sqlx::query_as::<_, Contribution>(
            r#"
            SELECT id, contributor_name, amount, phone_number, payment_method,
                   purpose, status, external_reference, timestamp
            FROM   contributions
            WHERE  id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<Contribution>> {
        let row = sqlx::query_as::<_, Contribution>(
            r#"
            SELECT id, contributor_name, amount, phone_number, payment_method,
                   purpose, status, external_reference, timestamp
            FROM   contributions
            WHERE  external_reference = ?1
            "#,
        )
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Single conditional UPDATE: the guard and the write are one statement,
    /// so concurrent writers cannot both pass it.
    async fn transition(
        &self,
        id: &str,
        next: ContributionStatus,
        external_reference: Option<&str>,
    ) -> Result<Transition> {
        let updated = sqlx::query_as::<_, Contribution>(
            r#"
            UPDATE contributions
            SET    status = ?1,
                   external_reference = COALESCE(?2, external_reference)
            WHERE  id = ?3
              AND  status IN ('pending', 'processing')
              AND  status <> ?1
              AND  ?1 <> 'pending'
              AND  (?1 <> 'completed' OR status = 'processing')
            RETURNING id, contributor_name, amount, phone_number, payment_method,
                      purpose, status, external_reference, timestamp
            "#,
        )
        .bind(next)
        .bind(external_reference)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, external_reference))?;

        if let Some(contribution) = updated {
            return Ok(Transition::Applied(contribution));
        }

        match self.get(id).await? {
            Some(current) => Ok(Transition::Stale(current)),
            None => Err(PaymentError::NotFound(id.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

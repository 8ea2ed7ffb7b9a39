//! PostgreSQL 支付存储
//!
//! 完整支付以 JSONB 保存，地址、派生路径、状态和地址索引另存为列，
//! 由数据库唯一约束兜底地址不复用。`version` 列实现跨进程的乐观并发控制。

use async_trait::async_trait;
use sqlx::{types::Json, PgPool, Row};
use uuid::Uuid;

use super::{scope_and_index, PaymentStore, StoreError, StoreResult};
use crate::domain::{AccountScope, DerivationPath, Payment, PaymentState};

pub struct PgPaymentStore {
    pool: PgPool,
}

impl PgPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_insert_error(err: sqlx::Error, payment: &Payment) -> StoreError {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return match db_err.constraint() {
                    Some("payments_address_key") => StoreError::Duplicate {
                        field: "address",
                        value: payment.address.address.clone(),
                    },
                    Some("payments_derivation_path_key") => StoreError::Duplicate {
                        field: "derivation_path",
                        value: payment.address.path.to_string(),
                    },
                    _ => StoreError::Duplicate {
                        field: "id",
                        value: payment.id.to_string(),
                    },
                };
            }
        }
        StoreError::Database(err)
    }

    async fn exists(&self, id: Uuid) -> StoreResult<bool> {
        let found: Option<Uuid> = sqlx::query_scalar("SELECT id FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        value: String,
    ) -> StoreResult<Option<Payment>> {
        let sql = format!("SELECT record FROM payments WHERE {} = $1", clause);
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.try_get::<Json<Payment>, _>("record").map(|j| j.0))
            .transpose()
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert(&self, payment: &Payment) -> StoreResult<()> {
        let (scope, index) = scope_and_index(&payment.address.path)
            .map(|(s, i)| (s.to_string(), i64::from(i)))
            .unwrap_or_else(|| (String::new(), -1));

        sqlx::query(
            r#"INSERT INTO payments
                 (id, address, derivation_path, account_scope, address_index, state, record, created_at, updated_at, version)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
        )
        .bind(payment.id)
        .bind(&payment.address.address)
        .bind(payment.address.path.to_string())
        .bind(scope)
        .bind(index)
        .bind(payment.state.as_str())
        .bind(Json(payment))
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .bind(version_column(payment.version))
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_insert_error(e, payment))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        let row = sqlx::query("SELECT record FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| r.try_get::<Json<Payment>, _>("record"))
            .transpose()?
            .map(|j| j.0))
    }

    async fn find_by_address(&self, address: &str) -> StoreResult<Option<Payment>> {
        self.fetch_one_where("address", address.to_string()).await
    }

    async fn find_by_path(&self, path: &DerivationPath) -> StoreResult<Option<Payment>> {
        self.fetch_one_where("derivation_path", path.to_string())
            .await
    }

    async fn put(&self, payment: &Payment, expected_version: u64) -> StoreResult<()> {
        let result = sqlx::query(
            r#"UPDATE payments
               SET state = $2, record = $3, updated_at = $4, version = $5
               WHERE id = $1 AND version = $6"#,
        )
        .bind(payment.id)
        .bind(payment.state.as_str())
        .bind(Json(payment))
        .bind(payment.updated_at)
        .bind(version_column(payment.version))
        .bind(version_column(expected_version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(if self.exists(payment.id).await? {
                StoreError::Conflict(payment.id)
            } else {
                StoreError::NotFound(payment.id)
            });
        }
        Ok(())
    }

    async fn list_by_states(&self, states: &[PaymentState]) -> StoreResult<Vec<Payment>> {
        let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            "SELECT record FROM payments WHERE state = ANY($1) ORDER BY created_at ASC",
        )
        .bind(states)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                r.try_get::<Json<Payment>, _>("record")
                    .map(|j| j.0)
                    .map_err(StoreError::from)
            })
            .collect()
    }

    async fn max_address_index(&self, scope: AccountScope) -> StoreResult<Option<u32>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(address_index) FROM payments WHERE account_scope = $1",
        )
        .bind(scope.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(max.and_then(|m| u32::try_from(m).ok()))
    }
}

fn version_column(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

use super::{AgreementStore, ReceiptClaim};
use crate::agreement::{Address, Agreement, AgreementState, Amount, Party, Role};
use crate::error::StoreError;

const SELECT_COLUMNS: &str = r#"
    SELECT id, on_chain_id, title, detail, payer, payee, arbiter, amount, deadline,
           current_state, payer_confirmed, payee_confirmed, dispute_winner, version,
           created_at, updated_at
    FROM agreements
"#;

/// SQLite-backed store.
///
/// `u64` identifiers are stored bit-for-bit in `INTEGER` columns.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect using a `sqlite:` URL and create the schema if needed.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // Every connection to `:memory:` sees its own database, so keep exactly one alive.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .connect_with(options)
                .await?
        };

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agreements (
                id TEXT PRIMARY KEY,
                on_chain_id INTEGER NOT NULL UNIQUE,
                title TEXT NULL,
                detail TEXT NULL,
                payer TEXT NOT NULL,
                payee TEXT NOT NULL,
                arbiter TEXT NOT NULL,
                amount TEXT NOT NULL,
                deadline TEXT NOT NULL,
                current_state TEXT NOT NULL,
                payer_confirmed BOOLEAN NOT NULL,
                payee_confirmed BOOLEAN NOT NULL,
                dispute_winner TEXT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS receipt_claims (
                tx_hash TEXT PRIMARY KEY,
                agreement_id TEXT NOT NULL,
                action TEXT NOT NULL,
                claimed_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for column in ["payer", "payee", "arbiter"] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_agreements_{column} ON agreements ({column})"
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl AgreementStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn insert(&self, agreement: &Agreement) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO agreements (
                id, on_chain_id, title, detail, payer, payee, arbiter, amount, deadline,
                current_state, payer_confirmed, payee_confirmed, dispute_winner, version,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agreement.id.to_string())
        .bind(agreement.on_chain_id as i64)
        .bind(agreement.title.as_deref())
        .bind(agreement.detail.as_deref())
        .bind(agreement.payer.as_str())
        .bind(agreement.payee.as_str())
        .bind(agreement.arbiter.as_str())
        .bind(agreement.amount.to_string())
        .bind(agreement.deadline)
        .bind(agreement.current_state.as_str())
        .bind(agreement.payer_confirmed)
        .bind(agreement.payee_confirmed)
        .bind(agreement.dispute_winner.map(Party::as_str))
        .bind(agreement.version as i64)
        .bind(agreement.created_at)
        .bind(agreement.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(agreement.on_chain_id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Agreement>, StoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(agreement_from_row).transpose()
    }

    async fn list_by_role(
        &self,
        role: Role,
        address: &Address,
    ) -> Result<Vec<Agreement>, StoreError> {
        // Column names come from the closed Role enum, never from input.
        let sql = format!(
            "{SELECT_COLUMNS} WHERE {} = ? ORDER BY created_at ASC, id ASC",
            role.as_str()
        );
        let rows = sqlx::query(&sql)
            .bind(address.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agreement_from_row).collect()
    }

    async fn update(
        &self,
        agreement: &Agreement,
        claim: Option<&ReceiptClaim>,
    ) -> Result<Agreement, StoreError> {
        let mut next = agreement.clone();
        next.version += 1;

        let mut tx = self.pool.begin().await?;

        if let Some(claim) = claim {
            let claimed = sqlx::query(
                "INSERT INTO receipt_claims (tx_hash, agreement_id, action, claimed_at) VALUES (?, ?, ?, ?)",
            )
            .bind(claim.tx_hash.as_str())
            .bind(agreement.id.to_string())
            .bind(claim.action.as_str())
            .bind(next.updated_at)
            .execute(&mut *tx)
            .await;
            match claimed {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    tx.rollback().await?;
                    return Err(StoreError::ReceiptClaimed {
                        tx_hash: claim.tx_hash.to_string(),
                        action: claim.action,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE agreements
            SET title = ?, detail = ?, deadline = ?, current_state = ?,
                payer_confirmed = ?, payee_confirmed = ?, dispute_winner = ?,
                version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(next.title.as_deref())
        .bind(next.detail.as_deref())
        .bind(next.deadline)
        .bind(next.current_state.as_str())
        .bind(next.payer_confirmed)
        .bind(next.payee_confirmed)
        .bind(next.dispute_winner.map(Party::as_str))
        .bind(next.version as i64)
        .bind(next.updated_at)
        .bind(agreement.id.to_string())
        .bind(agreement.version as i64)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(next);
        }

        // Releases the connection before the lookup; `:memory:` pools have one.
        tx.rollback().await?;
        let exists = sqlx::query("SELECT 1 FROM agreements WHERE id = ?")
            .bind(agreement.id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Err(StoreError::Conflict(agreement.id))
        } else {
            Err(StoreError::Missing(agreement.id))
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM agreements WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn agreement_from_row(row: &SqliteRow) -> Result<Agreement, StoreError> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(format!("id '{id}': {e}")))?;

    let address = |column: &str| -> Result<Address, StoreError> {
        let raw: String = row.try_get(column)?;
        Address::parse(&raw).map_err(|e| StoreError::Corrupt(format!("{column} '{raw}': {e}")))
    };

    let amount: String = row.try_get("amount")?;
    let amount = amount.parse::<Amount>().map_err(StoreError::Corrupt)?;

    let state: String = row.try_get("current_state")?;
    let current_state = state
        .parse::<AgreementState>()
        .map_err(StoreError::Corrupt)?;

    let winner: Option<String> = row.try_get("dispute_winner")?;
    let dispute_winner = winner
        .map(|raw| raw.parse::<Party>().map_err(StoreError::Corrupt))
        .transpose()?;

    let on_chain_id: i64 = row.try_get("on_chain_id")?;
    let version: i64 = row.try_get("version")?;
    let deadline: DateTime<Utc> = row.try_get("deadline")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Agreement {
        id,
        on_chain_id: on_chain_id as u64,
        title: row.try_get("title")?,
        detail: row.try_get("detail")?,
        payer: address("payer")?,
        payee: address("payee")?,
        arbiter: address("arbiter")?,
        amount,
        deadline,
        current_state,
        payer_confirmed: row.try_get("payer_confirmed")?,
        payee_confirmed: row.try_get("payee_confirmed")?,
        dispute_winner,
        version: version as u64,
        created_at,
        updated_at,
    })
}

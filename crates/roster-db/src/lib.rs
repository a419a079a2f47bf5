//! Roster persistence layer: the employee record store.
//!
//! A thin async API around SQLite (sqlx). The store keeps a single
//! `employees` table keyed by a generated UUID and offers the key-based
//! get/put/update/delete operations plus a full scan. Every single-row
//! statement is strongly consistent on the primary key; there is no
//! cross-row transaction support because nothing above this layer needs it.

use std::{path::Path, str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use uuid::Uuid;

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary entry point to the record store.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/roster/roster.db`) and applies the
    /// embedded migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running employee migrations")?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    /// Exposes the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persists a new employee under a freshly generated identifier and returns
    /// the stored record.
    pub async fn insert_employee(&self, data: NewEmployee<'_>) -> Result<EmployeeRecord> {
        let id = Uuid::new_v4();
        let now = timestamp(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO employees (
                id, name, role, email, photo_url, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(data.name)
        .bind(data.role)
        .bind(data.email)
        .bind(data.photo_url)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.fetch_employee(id).await?.ok_or_else(|| {
            anyhow!(
                "employee inserted but missing when reloaded (id={}, name={})",
                id,
                data.name
            )
        })
    }

    /// Retrieves an employee by its identifier.
    pub async fn fetch_employee(&self, id: Uuid) -> Result<Option<EmployeeRecord>> {
        let row = sqlx::query("SELECT * FROM employees WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_employee).transpose()
    }

    /// Full scan of the table in creation order.
    pub async fn list_employees(&self) -> Result<Vec<EmployeeRecord>> {
        let mut rows = sqlx::query("SELECT * FROM employees ORDER BY created_at ASC, rowid ASC")
            .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_employee(row)?);
        }
        Ok(out)
    }

    /// Overwrites the mutable fields of an existing employee.
    ///
    /// `photo_url` is only written when `Some`; `None` keeps the stored value.
    /// Returns `None` when no employee has the identifier, nothing is upserted.
    pub async fn update_employee(
        &self,
        id: Uuid,
        changes: EmployeeChanges<'_>,
    ) -> Result<Option<EmployeeRecord>> {
        let row = sqlx::query(
            r#"
            UPDATE employees
            SET name = ?, role = ?, email = ?,
                photo_url = COALESCE(?, photo_url),
                updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(changes.name)
        .bind(changes.role)
        .bind(changes.email)
        .bind(changes.photo_url)
        .bind(timestamp(Utc::now()))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(map_employee).transpose()
    }

    /// Removes an employee. Returns `false` when nothing matched.
    pub async fn delete_employee(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM employees WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_employee(row: SqliteRow) -> Result<EmployeeRecord> {
    let id: String = row.try_get("id")?;

    Ok(EmployeeRecord {
        id: Uuid::parse_str(&id).with_context(|| format!("corrupt employee id '{id}'"))?,
        name: row.try_get("name")?,
        role: row.try_get("role")?,
        email: row.try_get("email")?,
        photo_url: row.try_get("photo_url")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

/// Input payload for employee creation.
#[derive(Debug, Clone, Copy)]
pub struct NewEmployee<'a> {
    pub name: &'a str,
    pub role: &'a str,
    pub email: &'a str,
    pub photo_url: Option<&'a str>,
}

/// Replacement values applied by [`Database::update_employee`].
#[derive(Debug, Clone, Copy)]
pub struct EmployeeChanges<'a> {
    pub name: &'a str,
    pub role: &'a str,
    pub email: &'a str,
    pub photo_url: Option<&'a str>,
}

/// Persisted employee row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmployeeRecord {
    pub id: Uuid,
    pub name: String,
    pub role: String,
    pub email: String,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_db() -> (Database, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Database::connect_file(&temp.path().join("roster.db"))
            .await
            .unwrap();
        (db, temp)
    }

    fn ann() -> NewEmployee<'static> {
        NewEmployee {
            name: "Ann",
            role: "Eng",
            email: "a@x.com",
            photo_url: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_employee() {
        let (db, _tmp) = setup_db().await;
        let record = db.insert_employee(ann()).await.unwrap();

        assert_eq!(record.name, "Ann");
        assert_eq!(record.photo_url, None);
        assert_eq!(record.created_at, record.updated_at);

        let fetched = db.fetch_employee(record.id).await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(db.fetch_employee(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_every_employee_in_creation_order() {
        let (db, _tmp) = setup_db().await;
        let first = db.insert_employee(ann()).await.unwrap();
        let second = db
            .insert_employee(NewEmployee {
                name: "Bob",
                role: "Ops",
                email: "b@x.com",
                photo_url: Some("https://cdn.example.com/bob.png"),
            })
            .await
            .unwrap();

        let all = db.list_employees().await.unwrap();
        let ids: Vec<Uuid> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(
            all[1].photo_url.as_deref(),
            Some("https://cdn.example.com/bob.png")
        );
    }

    #[tokio::test]
    async fn update_without_photo_keeps_existing_photo() {
        let (db, _tmp) = setup_db().await;
        let record = db
            .insert_employee(NewEmployee {
                photo_url: Some("https://cdn.example.com/ann.png"),
                ..ann()
            })
            .await
            .unwrap();

        let updated = db
            .update_employee(
                record.id,
                EmployeeChanges {
                    name: "Ann B",
                    role: "Lead",
                    email: "ann@x.com",
                    photo_url: None,
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.name, "Ann B");
        assert_eq!(updated.role, "Lead");
        assert_eq!(updated.email, "ann@x.com");
        assert_eq!(
            updated.photo_url.as_deref(),
            Some("https://cdn.example.com/ann.png")
        );
        assert_eq!(updated.created_at, record.created_at);
        assert!(updated.updated_at >= record.updated_at);
    }

    #[tokio::test]
    async fn update_with_photo_replaces_it() {
        let (db, _tmp) = setup_db().await;
        let record = db
            .insert_employee(NewEmployee {
                photo_url: Some("https://cdn.example.com/old.png"),
                ..ann()
            })
            .await
            .unwrap();

        let updated = db
            .update_employee(
                record.id,
                EmployeeChanges {
                    name: "Ann",
                    role: "Eng",
                    email: "a@x.com",
                    photo_url: Some("https://cdn.example.com/new.png"),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            updated.photo_url.as_deref(),
            Some("https://cdn.example.com/new.png")
        );
    }

    #[tokio::test]
    async fn update_of_unknown_employee_does_not_upsert() {
        let (db, _tmp) = setup_db().await;
        let missing = Uuid::new_v4();
        let outcome = db
            .update_employee(
                missing,
                EmployeeChanges {
                    name: "Ghost",
                    role: "None",
                    email: "g@x.com",
                    photo_url: None,
                },
            )
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert!(db.list_employees().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_reports_whether_a_row_was_removed() {
        let (db, _tmp) = setup_db().await;
        let record = db.insert_employee(ann()).await.unwrap();

        assert!(db.delete_employee(record.id).await.unwrap());
        assert!(!db.delete_employee(record.id).await.unwrap());
        assert!(db.fetch_employee(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_pool_surfaces_errors() {
        let (db, _tmp) = setup_db().await;
        db.pool().close().await;

        assert!(db.list_employees().await.is_err());
        assert!(db.insert_employee(ann()).await.is_err());
    }
}

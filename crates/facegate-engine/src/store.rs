//! Identity records for enrolled people.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facegate_core::FaceToken;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate record: {0}")]
    Duplicate(String),
    #[error("no person with id {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
}

/// Registration details supplied for a new person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonProfile {
    pub name: String,
    pub email: String,
    pub employee_number: i64,
    pub position: Option<String>,
    pub department: Option<String>,
    pub phone_number: Option<String>,
}

/// A stored identity. `id` is the value bound in the face directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub email: String,
    pub employee_number: i64,
    pub position: Option<String>,
    pub department: Option<String>,
    pub phone_number: Option<String>,
    pub face_token: Option<FaceToken>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn create(&self, profile: PersonProfile) -> Result<Person, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Person>, StoreError>;

    async fn find_by_number(&self, employee_number: i64) -> Result<Option<Person>, StoreError>;

    /// Remove a record. `false` if it did not exist.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Record the face token enrolled for `id`.
    async fn attach_face(&self, id: &str, token: &FaceToken) -> Result<(), StoreError>;

    async fn touch_last_seen(&self, id: &str) -> Result<(), StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS people (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    email           TEXT NOT NULL UNIQUE,
    employee_number INTEGER NOT NULL UNIQUE,
    position        TEXT,
    department      TEXT,
    phone_number    TEXT,
    face_token      TEXT,
    registered_at   TEXT NOT NULL,
    last_seen       TEXT
);
";

const COLUMNS: &str = "id, name, email, employee_number, position, department, \
                       phone_number, face_token, registered_at, last_seen";

/// [`IdentityStore`] backed by a SQLite file.
pub struct SqliteIdentityStore {
    conn: tokio_rusqlite::Connection,
}

impl SqliteIdentityStore {
    /// Open (and create if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        tracing::info!(path = %path.display(), "identity store opened");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(tokio_rusqlite::Connection::open_in_memory().await?).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    async fn update_one(
        &self,
        id: &str,
        sql: &'static str,
        value: String,
    ) -> Result<(), StoreError> {
        let key = id.to_string();
        let changed = self
            .conn
            .call(move |conn| Ok(conn.execute(sql, params![value, key])?))
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn create(&self, profile: PersonProfile) -> Result<Person, StoreError> {
        let person = Person {
            id: uuid::Uuid::new_v4().to_string(),
            name: profile.name,
            email: profile.email,
            employee_number: profile.employee_number,
            position: profile.position,
            department: profile.department,
            phone_number: profile.phone_number,
            face_token: None,
            registered_at: Utc::now(),
            last_seen: None,
        };

        let row = person.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO people (id, name, email, employee_number, position, \
                     department, phone_number, registered_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.id,
                        row.name,
                        row.email,
                        row.employee_number,
                        row.position,
                        row.department,
                        row.phone_number,
                        row.registered_at.to_rfc3339(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(map_write_error)?;

        tracing::info!(id = %person.id, employee_number = person.employee_number, "person created");
        Ok(person)
    }

    async fn get(&self, id: &str) -> Result<Option<Person>, StoreError> {
        let id = id.to_string();
        let person = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM people WHERE id = ?1"),
                        params![id],
                        person_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(person)
    }

    async fn find_by_number(&self, employee_number: i64) -> Result<Option<Person>, StoreError> {
        let person = self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {COLUMNS} FROM people WHERE employee_number = ?1"),
                        params![employee_number],
                        person_from_row,
                    )
                    .optional()?)
            })
            .await?;
        Ok(person)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let key = id.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM people WHERE id = ?1", params![key])?))
            .await?;
        if removed > 0 {
            tracing::info!(id, "person deleted");
        }
        Ok(removed > 0)
    }

    async fn attach_face(&self, id: &str, token: &FaceToken) -> Result<(), StoreError> {
        self.update_one(
            id,
            "UPDATE people SET face_token = ?1 WHERE id = ?2",
            token.as_str().to_string(),
        )
        .await
    }

    async fn touch_last_seen(&self, id: &str) -> Result<(), StoreError> {
        self.update_one(
            id,
            "UPDATE people SET last_seen = ?1 WHERE id = ?2",
            Utc::now().to_rfc3339(),
        )
        .await
    }
}

fn map_write_error(err: tokio_rusqlite::Error) -> StoreError {
    match err {
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(code, message))
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Duplicate(message.unwrap_or_else(|| code.to_string()))
        }
        other => StoreError::Database(other),
    }
}

fn person_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
    let last_seen: Option<String> = row.get(9)?;
    Ok(Person {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        employee_number: row.get(3)?,
        position: row.get(4)?,
        department: row.get(5)?,
        phone_number: row.get(6)?,
        face_token: row.get::<_, Option<String>>(7)?.map(FaceToken::new),
        registered_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
        last_seen: last_seen.map(|raw| parse_timestamp(9, &raw)).transpose()?,
    })
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
        })
}

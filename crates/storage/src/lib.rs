use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Slot holding the PKCE verifier between the two legs of a login.
pub const VERIFIER_SLOT: &str = "verifier";

/// Single-slot persistence for the PKCE verifier. A write replaces whatever
/// an earlier login attempt left behind.
#[async_trait]
pub trait VerifierStore: Send + Sync {
    async fn save_verifier(&self, verifier: &str) -> Result<()>;
    async fn load_verifier(&self) -> Result<Option<String>>;
    async fn clear_verifier(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .create_if_missing(true);
        // A single connection keeps `sqlite::memory:` databases coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn put_slot(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO persisted_slots (name, value) VALUES (?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write slot '{name}'"))?;
        Ok(())
    }

    pub async fn load_slot(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM persisted_slots WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to read slot '{name}'"))?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Returns whether a value was present.
    pub async fn clear_slot(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM persisted_slots WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear slot '{name}'"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl VerifierStore for Storage {
    async fn save_verifier(&self, verifier: &str) -> Result<()> {
        self.put_slot(VERIFIER_SLOT, verifier).await
    }

    async fn load_verifier(&self) -> Result<Option<String>> {
        self.load_slot(VERIFIER_SLOT).await
    }

    async fn clear_verifier(&self) -> Result<()> {
        self.clear_slot(VERIFIER_SLOT).await?;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

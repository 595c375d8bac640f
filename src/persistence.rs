// =============================================================================
// UserStore — SQL-backed user persistence collaborator (§6).
// =============================================================================
//
// Out of scope as a *design* concern (spec §1 names it an external
// collaborator) but its contract must exist for the binary to run and for
// login/config flows to be testable. Grounded on
// `original_source/Src/usersdata.cpp`: a dirty-flag per user, flushed every
// `SAVE_USER_DATA_INTERVAL` (60s, here `persistence::FLUSH_INTERVAL`), and a
// schema of `{id, User, Password, Config, CreateUser, LastLogin}`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::types::{User, UserConfig};

pub const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<User>>;
    async fn find(&self, name: &str) -> Result<Option<User>>;
    async fn upsert(&self, user: &User) -> Result<()>;
    async fn create(&self, name: &str, password: &str, config: &UserConfig, now: DateTime<Utc>) -> Result<User>;
}

/// SQLite-backed implementation.
pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to user database")?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS Users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                User TEXT NOT NULL UNIQUE,
                Password TEXT NOT NULL,
                Config TEXT NOT NULL,
                CreateUser TEXT NOT NULL,
                LastLogin TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .context("failed to create Users table")?;
        Ok(Self { pool })
    }

    fn row_to_user(name: String, password: String, config_json: String, last_login: String) -> Result<User> {
        let config: UserConfig = serde_json::from_str(&config_json).unwrap_or_default();
        let last_login = DateTime::parse_from_rfc3339(&last_login)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(User {
            name,
            password,
            config,
            last_login,
        })
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn load_all(&self) -> Result<Vec<User>> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT User, Password, Config, LastLogin FROM Users",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load users")?;
        rows.into_iter()
            .map(|(name, password, config, last_login)| Self::row_to_user(name, password, config, last_login))
            .collect()
    }

    async fn find(&self, name: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT User, Password, Config, LastLogin FROM Users WHERE User = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to query user")?;
        row.map(|(name, password, config, last_login)| Self::row_to_user(name, password, config, last_login))
            .transpose()
    }

    async fn upsert(&self, user: &User) -> Result<()> {
        let config_json = serde_json::to_string(&user.config)?;
        sqlx::query(
            "UPDATE Users SET Password = ?, Config = ?, LastLogin = ? WHERE User = ?",
        )
        .bind(&user.password)
        .bind(&config_json)
        .bind(user.last_login.to_rfc3339())
        .bind(&user.name)
        .execute(&self.pool)
        .await
        .context("failed to upsert user")?;
        Ok(())
    }

    async fn create(&self, name: &str, password: &str, config: &UserConfig, now: DateTime<Utc>) -> Result<User> {
        let config_json = serde_json::to_string(config)?;
        sqlx::query(
            "INSERT INTO Users (User, Password, Config, CreateUser, LastLogin) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(password)
        .bind(&config_json)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to create user")?;
        info!(user = name, "provisional user created");
        Ok(User {
            name: name.to_string(),
            password: password.to_string(),
            config: config.clone(),
            last_login: now,
        })
    }
}

/// In-memory store used by tests (and available as a fallback collaborator
/// if no `[DATABASE]` section is configured in dev).
#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<HashMap<String, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn load_all(&self) -> Result<Vec<User>> {
        Ok(self.users.lock().values().cloned().collect())
    }

    async fn find(&self, name: &str) -> Result<Option<User>> {
        Ok(self.users.lock().get(name).cloned())
    }

    async fn upsert(&self, user: &User) -> Result<()> {
        self.users.lock().insert(user.name.clone(), user.clone());
        Ok(())
    }

    async fn create(&self, name: &str, password: &str, config: &UserConfig, now: DateTime<Utc>) -> Result<User> {
        let user = User {
            name: name.to_string(),
            password: password.to_string(),
            config: config.clone(),
            last_login: now,
        };
        self.users.lock().insert(name.to_string(), user.clone());
        Ok(user)
    }
}

/// Periodic flush loop: every `FLUSH_INTERVAL`, persist any user whose
/// in-memory config differs from what's stored (§3 "flushed every 60s if
/// dirty"). Dirty-tracking here is done by the caller supplying the
/// currently-online users' snapshots; a real dirty-flag per user mirrors
/// `UserData::isChange` in the original and is left to the caller
/// (`SessionRegistry` owns the authoritative in-memory config).
pub async fn run_flush_loop(store: &dyn UserStore, dirty: impl Fn() -> Vec<User>) {
    loop {
        tokio::time::sleep(FLUSH_INTERVAL).await;
        for user in dirty() {
            if let Err(e) = store.upsert(&user).await {
                warn!(error = %e, user = user.name, "failed to flush user record");
            }
        }
    }
}

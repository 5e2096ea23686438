//! Database grain: a throwaway SQLite database inside the sandbox

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::sandbox::instance::unique_ticks;
use crate::sandbox::{Grain, Sandbox};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Attribute name used by [`UseDatabase`]
pub const DATABASE: &str = "database";

const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// An open database file and its connection pool
#[derive(Debug)]
pub struct Database {
    name: String,
    path: PathBuf,
    pool: SqlitePool,
}

impl Database {
    /// Create (or recreate) `{directory}/{name}.db` and open a pool on it.
    /// Leftover files with the same name are deleted first.
    pub async fn create(name: &str, directory: &Path, max_connections: u32) -> Result<Self> {
        tokio::fs::create_dir_all(directory).await?;

        let path = directory.join(format!("{}.db", name));
        remove_database_files(&path)?;

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!("Created database {} at {}", name, path.display());

        Ok(Self {
            name: name.to_string(),
            path,
            pool,
        })
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connection string for clients opening their own connections
    pub fn connection_string(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    /// The shared pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Check out a connection
    pub async fn open_connection(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Close every connection and delete the database files
    pub async fn destroy(&self) -> Result<()> {
        self.pool.close().await;
        remove_database_files(&self.path)?;
        debug!("Destroyed database {}", self.name);
        Ok(())
    }
}

/// Delete a database file and its journal sidecars, ignoring missing files
fn remove_database_files(path: &Path) -> Result<()> {
    let mut files = vec![path.to_path_buf()];
    files.extend(SIDECAR_SUFFIXES.iter().map(|suffix| {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }));

    for file in files {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!("Removed {}", file.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Provisions a fresh database under the sandbox directory.
#[derive(Debug)]
pub struct DatabaseGrain {
    name: Option<String>,
    config: DatabaseConfig,
    instance: Mutex<Option<Arc<Database>>>,
}

impl DatabaseGrain {
    /// Grain with default settings
    pub fn new() -> Self {
        Self::with_config(DatabaseConfig::default())
    }

    /// Grain with explicit settings
    pub fn with_config(config: DatabaseConfig) -> Self {
        Self {
            name: None,
            config,
            instance: Mutex::new(None),
        }
    }

    /// Use a fixed database name instead of a generated one
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Prefix for the generated name
    pub fn set_prefix(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.config.prefix = Some(prefix.into());
        self
    }

    /// Configured prefix
    pub fn prefix(&self) -> Option<&str> {
        self.config.prefix.as_deref()
    }

    /// Settings
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Mutable settings; only meaningful before setup
    pub fn config_mut(&mut self) -> &mut DatabaseConfig {
        &mut self.config
    }

    /// The database, `None` before setup and after disposal
    pub fn instance(&self) -> Option<Arc<Database>> {
        self.instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn database_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }

        match self.prefix().filter(|p| !p.trim().is_empty()) {
            Some(prefix) => format!("{}_{}", prefix, unique_ticks()),
            None => format!("sandbox_{}", unique_ticks()),
        }
    }
}

impl Default for DatabaseGrain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Grain for DatabaseGrain {
    async fn setup(&self, sandbox: &Sandbox) -> Result<()> {
        if self.instance().is_some() {
            debug!("Database already created, skipping setup");
            return Ok(());
        }

        let directory = sandbox.location().join(&self.config.directory);
        let database =
            Database::create(&self.database_name(), &directory, self.config.max_connections).await?;

        *self.instance.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(database));
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let database = self
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match database {
            Some(database) => database.destroy().await,
            None => Ok(()),
        }
    }
}

/// Attach a [`DatabaseGrain`] to a sandbox under [`DATABASE`]
pub trait UseDatabase: Sized {
    /// Attach with default settings
    fn use_database(self) -> Self;

    /// Configure the grain before it is attached
    fn use_database_with<F>(self, configure: F) -> Self
    where
        F: FnOnce(&Sandbox, &mut DatabaseGrain);
}

impl UseDatabase for Sandbox {
    fn use_database(self) -> Self {
        self.use_database_with(|_, _| {})
    }

    fn use_database_with<F>(self, configure: F) -> Self
    where
        F: FnOnce(&Sandbox, &mut DatabaseGrain),
    {
        let mut grain = DatabaseGrain::new();
        configure(&self, &mut grain);
        self.with_grain(DATABASE, grain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_add_database_grain_to_sandbox() {
        let sandbox = Sandbox::new().use_database();

        assert!(sandbox.grain::<DatabaseGrain>(DATABASE).is_some());
        assert_eq!(sandbox.grains().len(), 1);
    }

    #[test]
    fn test_configure_using_closure() {
        let sandbox = Sandbox::new().use_database_with(|sb, cfg| {
            cfg.set_prefix("test");
            cfg.config_mut().max_connections = 2;
            assert!(!sb.location().exists());
        });

        let grain = sandbox.grain::<DatabaseGrain>(DATABASE).unwrap();
        assert_eq!(grain.prefix(), Some("test"));
        assert_eq!(grain.config().max_connections, 2);
        assert!(grain.database_name().starts_with("test_"));
    }

    #[test]
    fn test_generated_names_are_distinct() {
        let grain = DatabaseGrain::new();
        let a = grain.database_name();
        let b = grain.database_name();

        assert!(a.starts_with("sandbox_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_instance_is_none_when_not_setup() {
        let sandbox = Sandbox::new().use_database();
        assert!(sandbox.grain::<DatabaseGrain>(DATABASE).unwrap().instance().is_none());
    }

    #[tokio::test]
    async fn test_setup_and_tear_down() {
        let sandbox = Sandbox::new().use_database();
        sandbox.activate().await.unwrap();

        let grain = sandbox.grain::<DatabaseGrain>(DATABASE).unwrap();
        let database = grain.instance().unwrap();
        assert!(database.path().starts_with(sandbox.location().join("Data")));
        assert!(database.path().is_file());
        assert!(database.connection_string().starts_with("sqlite://"));

        let mut conn = database.open_connection().await.unwrap();
        sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, total INTEGER)")
            .execute(&mut *conn)
            .await
            .unwrap();
        sqlx::query("INSERT INTO orders (total) VALUES (42)")
            .execute(&mut *conn)
            .await
            .unwrap();
        drop(conn);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(database.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let path = database.path().to_path_buf();
        drop(database);

        let report = sandbox.dispose().await;
        assert!(report.is_clean(), "{:?}", report);
        assert!(grain.instance().is_none());
        assert!(!path.exists());
        assert!(!sandbox.location().exists());
    }

    #[tokio::test]
    async fn test_fixed_name_replaces_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("inventory.db");
        std::fs::write(&stale, "not a database").unwrap();
        std::fs::write(dir.path().join("inventory.db-wal"), "junk").unwrap();

        let database = Database::create("inventory", dir.path(), 1).await.unwrap();
        assert_eq!(database.name(), "inventory");

        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(database.pool())
            .await
            .unwrap();
        assert_eq!(one, 1);

        database.destroy().await.unwrap();
        assert!(!stale.exists());
        assert!(!dir.path().join("inventory.db-wal").exists());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let sandbox = Sandbox::new().use_database();
        sandbox.activate().await.unwrap();

        let grain = sandbox.grain::<DatabaseGrain>(DATABASE).unwrap();
        assert!(grain.dispose().await.is_ok());
        assert!(grain.dispose().await.is_ok());

        assert!(sandbox.dispose().await.is_clean());
    }
}

use crate::error::Error;
use crate::multistmt::{self, SplitConfig, Statement};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::time::Instant;

/// Version value meaning "no migration has been recorded".
pub const NIL_VERSION: i64 = -1;

/// Name of the version table when none is configured.
pub(crate) const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";

/// The migration version persisted for a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaVersion {
    pub version: i64,
    /// Set while a migration is being applied; still set afterwards if it never finished.
    pub dirty: bool,
}

impl SchemaVersion {
    pub const NIL: SchemaVersion = SchemaVersion {
        version: NIL_VERSION,
        dirty: false,
    };

    pub fn new(version: i64, dirty: bool) -> Self {
        Self { version, dirty }
    }

    pub fn is_nil(&self) -> bool {
        self.version == NIL_VERSION
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        Self::NIL
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            f.write_str("no version")?;
        } else {
            write!(f, "{}", self.version)?;
        }
        if self.dirty {
            f.write_str(" (dirty)")?;
        }
        Ok(())
    }
}

/// Whether a version row should exist after `set_version(version, dirty)`.
pub(crate) fn should_store_version(version: i64, dirty: bool) -> bool {
    version >= 0 || (version == NIL_VERSION && dirty)
}

/// Derive the advisory lock key for a schema.
///
/// The key is the first eight bytes of `SHA-256(database || 0x00 || schema)`, so
/// every process computing it for the same target agrees on it.
pub fn advisory_lock_key(database: &str, schema: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(database.as_bytes());
    hasher.update([0u8]);
    hasher.update(schema.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// The operations a migration backend offers.
///
/// One driver owns one connection and is scoped to the schema it resolved when
/// it was opened. Drivers for different schemas are fully independent: separate
/// version rows, separate locks.
///
/// Expected call sequence for a run:
/// `lock`, `begin`, (`set_version` | `run`)*, `commit` or `rollback`, `unlock`.
/// [`Migrator::apply`] drives exactly this sequence.
pub trait Driver {
    /// Acquire the schema's advisory lock, blocking until it is available.
    fn lock(&mut self) -> Result<(), Error>;

    /// Release the schema's advisory lock.
    fn unlock(&mut self) -> Result<(), Error>;

    /// Split and execute a migration script. Execution stops at the first failing statement.
    fn run(&mut self, script: &mut dyn Read) -> Result<(), Error>;

    /// Open a transaction that brackets subsequent `run` and `set_version` calls.
    fn begin(&mut self) -> Result<(), Error>;

    fn commit(&mut self) -> Result<(), Error>;

    /// Discard everything done since [`begin`](Driver::begin).
    fn rollback(&mut self) -> Result<(), Error>;

    /// Replace the stored version. Passing [`NIL_VERSION`] with `dirty == false` clears it.
    fn set_version(&mut self, version: i64, dirty: bool) -> Result<(), Error>;

    /// The stored version, or [`SchemaVersion::NIL`] if none was ever written.
    fn version(&mut self) -> Result<SchemaVersion, Error>;

    /// Release the lock if held and close the connection.
    fn close(self: Box<Self>) -> Result<(), Error>;
}

/// Drives a [`Driver`] through a complete, version-tracked migration run.
///
/// The driver's lock is held for the whole run and released on every path.
/// Failed runs are rolled back; nothing is retried.
#[derive(Default)]
pub struct Migrator {
    on_migration_start: Option<Box<dyn Fn(i64) + Send + Sync>>,
    on_migration_complete: Option<Box<dyn Fn(i64, std::time::Duration) + Send + Sync>>,
    on_migration_error: Option<Box<dyn Fn(i64, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("on_migration_start", &self.on_migration_start.is_some())
            .field(
                "on_migration_complete",
                &self.on_migration_complete.is_some(),
            )
            .field("on_migration_error", &self.on_migration_error.is_some())
            .finish()
    }
}

impl Migrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a callback to be invoked when a migration starts.
    pub fn on_migration_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        self.on_migration_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration has been committed.
    /// The callback receives the version and how long the run took.
    pub fn on_migration_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64, std::time::Duration) + Send + Sync + 'static,
    {
        self.on_migration_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a migration fails.
    pub fn on_migration_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(i64, &Error) + Send + Sync + 'static,
    {
        self.on_migration_error = Some(Box::new(callback));
        self
    }

    /// Apply `script` as migration `version`.
    ///
    /// The version is stamped dirty before the script runs and clean after it,
    /// all in one transaction, so a failed run leaves the previous version in place.
    pub fn apply<D>(&self, driver: &mut D, version: i64, script: &mut dyn Read) -> Result<(), Error>
    where
        D: Driver + ?Sized,
    {
        let _span = tracing::info_span!("migration_apply", version).entered();
        tracing::info!("Starting migration");

        if let Some(ref callback) = self.on_migration_start {
            callback(version);
        }
        let started = Instant::now();

        let result = with_lock(driver, |driver| {
            driver.begin()?;
            let applied = apply_in_transaction(driver, version, script);
            if applied.is_err() {
                if let Err(rollback_error) = driver.rollback() {
                    tracing::warn!(error = %rollback_error, "Rollback after failed migration also failed");
                }
            }
            applied
        });

        match &result {
            Ok(()) => {
                let duration = started.elapsed();
                tracing::info!(
                    duration_ms = duration.as_millis(),
                    "Migration completed successfully"
                );
                if let Some(ref callback) = self.on_migration_complete {
                    callback(version, duration);
                }
            }
            Err(error) => {
                tracing::error!(error = %error, "Migration failed");
                if let Some(ref callback) = self.on_migration_error {
                    callback(version, error);
                }
            }
        }
        result
    }

    /// Overwrite the stored version with a clean `version`, e.g. to clear a dirty flag
    /// after repairing a failed migration by hand.
    pub fn force<D>(&self, driver: &mut D, version: i64) -> Result<(), Error>
    where
        D: Driver + ?Sized,
    {
        tracing::info!(version, "Forcing schema version");
        with_lock(driver, |driver| driver.set_version(version, false))
    }

    /// Read the stored version.
    pub fn status<D>(&self, driver: &mut D) -> Result<SchemaVersion, Error>
    where
        D: Driver + ?Sized,
    {
        driver.version()
    }
}

fn apply_in_transaction<D>(driver: &mut D, version: i64, script: &mut dyn Read) -> Result<(), Error>
where
    D: Driver + ?Sized,
{
    driver.set_version(version, true)?;
    driver.run(script)?;
    driver.set_version(version, false)?;
    driver.commit()
}

/// Run `f` while holding the driver's lock. The lock is released whatever `f`
/// returns; an error from `f` takes precedence over an error from unlocking.
pub(crate) fn with_lock<D, T>(driver: &mut D, f: impl FnOnce(&mut D) -> Result<T, Error>) -> Result<T, Error>
where
    D: Driver + ?Sized,
{
    driver.lock()?;
    let result = f(driver);
    match (result, driver.unlock()) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(unlock_error)) => Err(unlock_error),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(unlock_error)) => {
            tracing::warn!(error = %unlock_error, "Failed to release migration lock");
            Err(error)
        }
    }
}

/// Read a whole migration script, refusing anything larger than `max_size` bytes.
pub(crate) fn read_script(script: &mut dyn Read, max_size: usize) -> Result<String, Error> {
    let mut text = String::new();
    let mut limited = script.take(max_size as u64 + 1);
    limited.read_to_string(&mut text)?;
    if text.len() > max_size {
        return Err(Error::ScriptTooLarge { max: max_size });
    }
    Ok(text)
}

/// Split `script` and pass every statement to `execute`.
///
/// Stops at the first failure. A [`MigrationError`](crate::MigrationError)
/// from `execute` is returned as is, since it already names the failing text.
pub(crate) fn run_script<F>(script: &str, config: &SplitConfig, execute: F) -> Result<(), Error>
where
    F: FnMut(&Statement) -> Result<(), Error>,
{
    match multistmt::split_statements(script.as_bytes(), config, execute) {
        Err(Error::Statement { source, .. }) if matches!(*source, Error::Migration(_)) => Err(*source),
        other => other,
    }
}

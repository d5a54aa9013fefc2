//! An in-memory [`Driver`] for exercising migration flows without a database.
//!
//! [`MemoryDatabase`] plays the role of a server: every [`MemoryDriver`] created
//! from it shares its version rows and its advisory lock table, so lock
//! contention behaves as it would against PostgreSQL. Executed statements are
//! recorded instead of interpreted.
//!
//! # Example
//!
//! ```
//! use migrun::testing::MemoryDatabase;
//! use migrun::{Driver, Migrator, SchemaVersion};
//!
//! let db = MemoryDatabase::new();
//! let mut driver = db.driver("public");
//! Migrator::new()
//!     .apply(&mut driver, 1, &mut "CREATE TABLE users (id int);".as_bytes())
//!     .unwrap();
//!
//! assert_eq!(driver.version().unwrap(), SchemaVersion::new(1, false));
//! assert_eq!(db.executed("public"), vec!["CREATE TABLE users (id int);".to_string()]);
//! ```

use crate::core::{self, advisory_lock_key, should_store_version, Driver, SchemaVersion};
use crate::error::{EngineReport, Error, MigrationError};
use crate::multistmt::{SplitConfig, Statement};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

const DATABASE_NAME: &str = "memory";
const MAX_SCRIPT_SIZE: usize = 10 * 1024 * 1024;

/// A driver operation, as recorded by [`MemoryDriver::calls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Lock,
    Unlock,
    Begin,
    Commit,
    Rollback,
    Run,
    SetVersion(i64, bool),
}

#[derive(Debug, Clone, Default)]
struct SchemaState {
    version: Option<SchemaVersion>,
    executed: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    schemas: HashMap<String, SchemaState>,
    held_locks: HashSet<i64>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    lock_released: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not wedge every other driver.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared state behind a set of [`MemoryDriver`]s.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
    fail_marker: Option<String>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every statement containing `marker` fail with a syntax error pointing at the marker.
    pub fn fail_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    /// Open a driver scoped to `schema`.
    pub fn driver(&self, schema: &str) -> MemoryDriver {
        MemoryDriver {
            shared: self.shared.clone(),
            schema: schema.to_string(),
            lock_key: advisory_lock_key(DATABASE_NAME, schema),
            fail_marker: self.fail_marker.clone(),
            split: SplitConfig::default(),
            is_locked: false,
            snapshot: None,
            calls: Vec::new(),
        }
    }

    /// Statements executed against `schema` and not rolled back, in order.
    pub fn executed(&self, schema: &str) -> Vec<String> {
        self.shared
            .state()
            .schemas
            .get(schema)
            .map(|s| s.executed.clone())
            .unwrap_or_default()
    }
}

/// A [`Driver`] backed by a [`MemoryDatabase`].
///
/// Transactions are not isolated from other drivers: writes are visible
/// immediately, and `rollback` restores the schema to how it was at `begin`.
#[derive(Debug)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
    schema: String,
    lock_key: i64,
    fail_marker: Option<String>,
    split: SplitConfig,
    is_locked: bool,
    snapshot: Option<SchemaState>,
    calls: Vec<Call>,
}

impl MemoryDriver {
    /// Use `config` when splitting scripts passed to [`Driver::run`].
    pub fn with_split_config(mut self, config: SplitConfig) -> Self {
        self.split = config;
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }

    /// Every operation issued through this driver, in order. Reads are not recorded.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    fn schema_state<'a>(&self, state: &'a mut State) -> &'a mut SchemaState {
        state.schemas.entry(self.schema.clone()).or_default()
    }

    fn execute(&self, script: &str, statement: &Statement) -> Result<(), Error> {
        let text = statement.as_str();
        if let Some(marker) = self.fail_marker.as_deref() {
            if let Some(at) = text.find(marker) {
                let message = format!("syntax error at or near \"{}\"", marker);
                let report = EngineReport {
                    message: &message,
                    detail: None,
                    position: Some(text[..at].chars().count() + 1),
                };
                return Err(MigrationError::from_engine(script, statement, report, message.clone()).into());
            }
        }

        let mut state = self.shared.state();
        self.schema_state(&mut state)
            .executed
            .push(text.to_string());
        Ok(())
    }

    fn release_lock(&mut self) {
        self.shared.state().held_locks.remove(&self.lock_key);
        self.shared.lock_released.notify_all();
        self.is_locked = false;
    }
}

impl Driver for MemoryDriver {
    fn lock(&mut self) -> Result<(), Error> {
        if self.is_locked {
            return Err(Error::AlreadyLocked);
        }
        let mut state = self.shared.state();
        while state.held_locks.contains(&self.lock_key) {
            state = self
                .shared
                .lock_released
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.held_locks.insert(self.lock_key);
        drop(state);

        self.is_locked = true;
        self.calls.push(Call::Lock);
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), Error> {
        self.release_lock();
        self.calls.push(Call::Unlock);
        Ok(())
    }

    fn run(&mut self, script: &mut dyn Read) -> Result<(), Error> {
        self.calls.push(Call::Run);
        let script = core::read_script(script, MAX_SCRIPT_SIZE)?;
        let this = &*self;
        core::run_script(&script, &this.split, |statement| this.execute(&script, statement))
    }

    fn begin(&mut self) -> Result<(), Error> {
        if self.snapshot.is_some() {
            return Err(Error::TransactionInProgress);
        }
        let mut state = self.shared.state();
        let snapshot = self.schema_state(&mut state).clone();
        drop(state);

        self.snapshot = Some(snapshot);
        self.calls.push(Call::Begin);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.snapshot.take().ok_or(Error::NoTransaction)?;
        self.calls.push(Call::Commit);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        let snapshot = self.snapshot.take().ok_or(Error::NoTransaction)?;
        let mut state = self.shared.state();
        *self.schema_state(&mut state) = snapshot;
        drop(state);

        self.calls.push(Call::Rollback);
        Ok(())
    }

    fn set_version(&mut self, version: i64, dirty: bool) -> Result<(), Error> {
        let mut state = self.shared.state();
        self.schema_state(&mut state).version =
            should_store_version(version, dirty).then(|| SchemaVersion::new(version, dirty));
        drop(state);

        self.calls.push(Call::SetVersion(version, dirty));
        Ok(())
    }

    fn version(&mut self) -> Result<SchemaVersion, Error> {
        let mut state = self.shared.state();
        Ok(self.schema_state(&mut state).version.unwrap_or(SchemaVersion::NIL))
    }

    fn close(mut self: Box<Self>) -> Result<(), Error> {
        if self.is_locked {
            self.release_lock();
        }
        Ok(())
    }
}

impl Drop for MemoryDriver {
    fn drop(&mut self) {
        if self.is_locked {
            self.release_lock();
        }
    }
}

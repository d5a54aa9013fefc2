#![cfg_attr(docsrs, feature(doc_cfg))]
//! `migrun` executes SQL migration scripts against PostgreSQL.
//!
//! Core concepts:
//! - A script is split into statements by a streaming splitter that understands
//!   `$$`-quoted bodies and line comments, so function definitions containing
//!   semicolons survive intact. See [`multistmt`].
//! - A [`Driver`] owns one connection and is scoped to one schema. It serializes
//!   concurrent migrators with a per-schema advisory lock and tracks the applied
//!   version in a single-row table.
//! - A [`Migrator`] runs one version-tracked migration: lock, stamp the version
//!   dirty, run the script, stamp it clean, commit, unlock. A failure rolls the
//!   whole run back.
//!
//! # Errors
//!
//! When the server rejects a statement, the returned [`MigrationError`] points at
//! the failing line and column of the script:
//!
//! ```text
//! migration failed: syntax error at or near "TABLEE" (column 37) in line 1: CREATE TABLE foo (foo text); CREATE TABLEE bar (bar text); (details: ...)
//! ```
//!
//! # Schema placeholders
//!
//! With [`postgres::Config::replace_schema_placeholder`] enabled, every
//! `<SCHEMA_NAME>` in a script is replaced by the driver's schema, so one script
//! can be applied to many tenant schemas.
//!
//! # Features
//!
//! - `postgres` (default): the [`postgres::PostgresDriver`].
//! - `testing`: an in-memory [`Driver`] for exercising migration code without a server.
//! - `integration-tests`: run the crate's own tests against a containerized PostgreSQL.

mod core;
pub use core::{advisory_lock_key, Driver, Migrator, SchemaVersion, NIL_VERSION};

mod error;
pub use error::{Error, MigrationError};

pub mod multistmt;

pub mod position;

#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(all(test, feature = "integration-tests"))]
pub(crate) mod test_postgres;

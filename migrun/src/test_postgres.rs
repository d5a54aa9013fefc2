#![allow(dead_code)]

//! PostgreSQL test infrastructure.
//!
//! Starts one shared container per test binary and hands every test its own
//! freshly created database, so tests can run in parallel without seeing each
//! other's schemas, version tables or advisory locks.

use std::sync::OnceLock;

use postgres::{Client, Config, NoTls};
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use uuid::Uuid;

/// Default credentials for testcontainers-modules postgres
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

struct SharedContainer {
    // Kept alive for the container's lifetime
    _runtime: tokio::runtime::Runtime,
    port: u16,
}

static CONTAINER: OnceLock<SharedContainer> = OnceLock::new();

fn postgres_port() -> u16 {
    CONTAINER
        .get_or_init(|| {
            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            let port = runtime.block_on(async {
                let container = Postgres::default()
                    .start()
                    .await
                    .expect("failed to start postgres container");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("failed to get postgres port");
                // Leaked so the container outlives every test in the binary
                std::mem::forget(container);
                port
            });
            SharedContainer {
                _runtime: runtime,
                port,
            }
        })
        .port
}

fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        postgres_port(),
        db
    )
}

/// Create a database with a unique name and return a connection URL for it.
pub fn fresh_database_url() -> String {
    let mut admin = Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .batch_execute(&format!("CREATE DATABASE \"{}\"", db_name))
        .expect("failed to create test database");

    url_with_db(&db_name)
}

/// Connect to `url`, optionally pinning the session's `search_path`.
pub fn connect(url: &str, search_path: Option<&str>) -> Client {
    let config: Config = url.parse().expect("invalid test database url");
    connect_with(config, search_path)
}

/// Connect to `url` as another role.
pub fn connect_as(url: &str, user: &str, password: &str, search_path: Option<&str>) -> Client {
    let mut config: Config = url.parse().expect("invalid test database url");
    config.user(user).password(password);
    connect_with(config, search_path)
}

fn connect_with(mut config: Config, search_path: Option<&str>) -> Client {
    if let Some(search_path) = search_path {
        config.options(&format!("-c search_path={}", search_path));
    }
    config.connect(NoTls).expect("failed to connect to test database")
}

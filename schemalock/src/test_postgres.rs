//! PostgreSQL test infrastructure module.
//!
//! One container is started for the whole test run; every test gets its own
//! freshly created database inside it.

use std::sync::OnceLock;

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

use crate::postgres::PostgresDatabase;

/// Default credentials for testcontainers-modules postgres
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

/// The runtime that owns the container, kept alive with it.
struct Shared {
    _runtime: tokio::runtime::Runtime,
    _container: ContainerAsync<Postgres>,
    port: u16,
}

static POSTGRES: OnceLock<Shared> = OnceLock::new();

fn postgres_port() -> u16 {
    POSTGRES
        .get_or_init(|| {
            // A dedicated runtime for container management
            let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            let (container, port) = runtime.block_on(async {
                let container = Postgres::default()
                    .start()
                    .await
                    .expect("failed to start postgres container");
                let port = container
                    .get_host_port_ipv4(5432)
                    .await
                    .expect("failed to get postgres port");
                (container, port)
            });
            Shared {
                _runtime: runtime,
                _container: container,
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

/// Create a fresh PostgreSQL database with a unique name and connect to it.
pub fn fresh_database() -> PostgresDatabase {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .execute(&format!("CREATE DATABASE \"{}\"", db_name), &[])
        .expect("failed to create test database");
    drop(admin);

    PostgresDatabase::connect(&url_with_db(&db_name)).expect("failed to connect to test database")
}

//! Database initialization for the order service.
//!
//! Provides `init_db_pool` for creating a connection pool and auto-applying
//! SQL migrations before anything else touches the store.

use anyhow::{Context, Result};
use app_config::AppConfig;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio::fs;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::info;

const MAX_CONNECT_RETRIES: u32 = 5;

/// Initializes the database connection pool and runs migrations.
///
/// Connecting is retried a few times to ride out a database container that
/// is still coming up. Migrations run on the first healthy connection; until
/// they have been applied the pool is not handed out.
///
/// # Errors
/// Returns an error if the connection string is invalid, the database stays
/// unreachable, or a migration fails.
pub async fn init_db_pool(cfg: &AppConfig) -> Result<Pool> {
    let pg_config: PgConfig = cfg
        .database_uri
        .parse()
        .context("Failed to parse database URI")?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(16)
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create database pool")?;

    let mut retry_count = 0;
    let mut last_error = None;

    while retry_count < MAX_CONNECT_RETRIES {
        match pool.get().await {
            Ok(client) => {
                info!(retries = retry_count, "connected to database");

                // Relative path for local runs, absolute one inside the image.
                let migrations_paths = ["./migrations", "/app/migrations"];
                let mut migrations_found = false;

                for migrations_dir in migrations_paths {
                    if fs::metadata(migrations_dir).await.is_ok() {
                        info!(dir = migrations_dir, "applying migrations");
                        run_migrations(&client, migrations_dir).await?;
                        migrations_found = true;
                        break;
                    }
                }

                if !migrations_found {
                    info!("no migrations directory found, skipping migrations");
                }
                return Ok(pool);
            }
            Err(e) => {
                retry_count += 1;
                last_error = Some(e);
                info!(
                    attempt = retry_count,
                    max = MAX_CONNECT_RETRIES,
                    "database not reachable yet, retrying in 1 second"
                );
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }

    Err(anyhow::anyhow!(
        "Failed to get DB connection after {} retries: {:?}",
        MAX_CONNECT_RETRIES,
        last_error
    ))
}

/// Applies all `.sql` migrations from the given directory, in file order.
///
/// # Errors
/// Returns an error if migration files cannot be read or applied.
pub async fn run_migrations(client: &Client, migrations_dir: &str) -> Result<()> {
    let mut entries = fs::read_dir(migrations_dir)
        .await
        .context("Failed to read migrations directory")?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            paths.push(path);
        }
    }
    paths.sort();

    for path in paths {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(migration = %file_name, "applying migration");
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read migration file {file_name}"))?;

        client
            .batch_execute(&content)
            .await
            .with_context(|| format!("Failed to execute migration {file_name}"))?;
    }
    Ok(())
}

use anyhow::{bail, Context, Result};
use clickhouse_rs::{ClientHandle, Pool};

/// One schema step with its forward and reverse SQL.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// Embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_init.up.sql"),
    down_sql: include_str!("sql/001_init.down.sql"),
}];

/// Applies the events schema.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// ClickHouse migration runner tracking state in `schema_migrations`.
pub struct ClickHouseMigrator {
    pool: Pool,
}

impl ClickHouseMigrator {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn handle(&self, purpose: &str) -> Result<ClientHandle> {
        self.pool
            .get_handle()
            .await
            .with_context(|| format!("getting ClickHouse handle for {purpose}"))
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        let mut handle = self.handle("migrations table").await?;
        handle
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version Int64,
                    dirty UInt8,
                    sequence UInt64
                ) ENGINE = TinyLog",
            )
            .await
            .context("creating schema_migrations table")?;
        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let mut handle = self.handle("version check").await?;
        let block = handle
            .query("SELECT version, dirty FROM schema_migrations ORDER BY sequence DESC LIMIT 1")
            .fetch_all()
            .await
            .context("querying migration version")?;

        let Some(row) = block.rows().next() else {
            return Ok((0, false));
        };
        let version: i64 = row.get("version").context("reading version")?;
        let dirty: u8 = row.get("dirty").context("reading dirty flag")?;
        let version = u32::try_from(version).context("migration version out of range")?;

        Ok((version, dirty != 0))
    }

    /// Replaces the tracked version; `None` clears it.
    async fn record_version(&self, version: Option<u32>, dirty: bool) -> Result<()> {
        let mut handle = self.handle("version update").await?;

        handle
            .execute("TRUNCATE TABLE schema_migrations")
            .await
            .context("truncating schema_migrations")?;

        if let Some(version) = version {
            let dirty = u8::from(dirty);
            let sql = format!(
                "INSERT INTO schema_migrations (version, dirty, sequence) VALUES ({version}, {dirty}, 1)"
            );
            handle
                .execute(sql.as_str())
                .await
                .context("inserting migration version")?;
        }

        Ok(())
    }

    async fn execute_sql(&self, sql: &str) -> Result<()> {
        let mut handle = self.handle("migration SQL").await?;

        for statement in split_statements(sql) {
            handle.execute(statement).await.with_context(|| {
                let preview: String = statement.chars().take(80).collect();
                format!("executing migration statement: {preview}...")
            })?;
        }

        Ok(())
    }
}

impl Migrator for ClickHouseMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current, dirty) = self.current_version().await?;
        if dirty {
            bail!("migration version {current} is dirty, manual intervention required");
        }

        let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
        if pending.is_empty() {
            tracing::info!(version = current, "schema up to date");
            return Ok(());
        }

        for migration in &pending {
            tracing::info!(version = migration.version, "applying migration");

            self.record_version(Some(migration.version), true).await?;
            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;
            self.record_version(Some(migration.version), false).await?;
        }

        tracing::info!(
            from = current,
            to = latest_version(),
            applied = pending.len(),
            "migrations completed",
        );

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current, _) = self.current_version().await?;
        if current == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current)
            .with_context(|| format!("migration version {current} not found"))?;

        tracing::info!(version = current, "rolling back migration");

        self.record_version(Some(current), true).await?;
        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current}"))?;

        let previous = previous_version(current);
        self.record_version(previous, false).await?;

        tracing::info!(version = previous.unwrap_or(0), "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

fn previous_version(current: u32) -> Option<u32> {
    MIGRATIONS
        .iter()
        .map(|m| m.version)
        .filter(|v| *v < current)
        .max()
}

/// Splits SQL text into statements on semicolons, skipping blanks.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

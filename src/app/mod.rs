use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::api::ApiServer;
use crate::config::{Config, StoreKind};
use crate::health::HealthMetrics;
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::service::EventService;
use crate::store::{ClickHouseConnector, ClickHouseStore, MemoryStore, Store};

/// Orchestrates the lifecycle of every service component.
pub struct App {
    cfg: Config,
    health: Arc<HealthMetrics>,
    service: Option<Arc<EventService<Store>>>,
    api: Option<ApiServer>,
}

impl App {
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            service: None,
            api: None,
        })
    }

    /// Connect the store, then start the pipeline and listeners.
    pub async fn start(&mut self) -> Result<()> {
        // Health first so /healthz answers while the store comes up.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let store = self.open_store().await?;
        info!(store = store.name(), mode = ?self.cfg.ingest.mode, "event store ready");

        let service = Arc::new(EventService::new(
            Arc::new(store),
            &self.cfg,
            Some(Arc::clone(&self.health)),
        ));

        let api = ApiServer::start(&self.cfg.server.addr, Arc::clone(&service))
            .await
            .context("starting API server")?;

        self.service = Some(service);
        self.api = Some(api);

        Ok(())
    }

    /// Address the public API is bound to, once started.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api.as_ref().map(ApiServer::local_addr)
    }

    /// Stop intake, drain buffered events, then stop the health server.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(api) = self.api.take() {
            if let Err(e) = api.stop().await {
                error!(error = %e, "error stopping API server");
            }
        }

        if let Some(service) = self.service.take() {
            service.shutdown().await;
        }

        self.health.stop();

        Ok(())
    }

    async fn open_store(&self) -> Result<Store> {
        match self.cfg.store.kind {
            StoreKind::Memory => Ok(Store::Memory(MemoryStore::new())),
            StoreKind::ClickHouse => {
                let ch = &self.cfg.clickhouse;
                let pool = ClickHouseConnector::new(ch.clone())
                    .connect()
                    .await
                    .context("connecting to ClickHouse")?;

                if ch.migrations.enabled {
                    ClickHouseMigrator::new(pool.clone())
                        .up()
                        .await
                        .context("running migrations")?;
                }

                Ok(Store::ClickHouse(ClickHouseStore::new(
                    pool,
                    ch.database.clone(),
                    Some(Arc::clone(&self.health)),
                )))
            }
        }
    }
}

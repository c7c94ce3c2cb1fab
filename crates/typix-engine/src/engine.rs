use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use typix_contracts::events::EventWriter;

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::providers::{default_provider_registry, map_object};
use crate::service::ChatService;
use crate::settings::SettingsSource;
use crate::store::{LocalFileStore, MemoryStore};
use crate::worker::WorkerPool;

const EVENT_SOURCE: &str = "typix-engine";
/// Events kept in memory when no events file is configured.
pub const RECENT_EVENT_CAPACITY: usize = 1024;

/// A ready-to-use service stack: default providers, in-memory records, files on disk and a
/// worker pool for background generations.
pub struct Engine {
    config: EngineConfig,
    service: ChatService,
    pool: Arc<WorkerPool>,
    events: EventWriter,
}

impl Engine {
    pub fn from_config(config: EngineConfig, settings: Arc<dyn SettingsSource>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;
        let files = LocalFileStore::new(config.data_dir.join("files"))?;
        let pool = Arc::new(WorkerPool::new(config.workers, "typix-worker")?);
        let events = match &config.events_path {
            Some(path) => EventWriter::new(path.clone(), EVENT_SOURCE),
            None => EventWriter::bounded(EVENT_SOURCE, RECENT_EVENT_CAPACITY),
        };
        let providers = default_provider_registry(&config);

        events.emit(
            "engine_started",
            map_object(json!({
                "data_dir": config.data_dir.to_string_lossy().to_string(),
                "workers": pool.size(),
                "providers": providers.list(),
                "builtin_credentials": config.runtime().builtin_credentials,
            })),
        )?;

        let dispatcher = Dispatcher::new(
            providers,
            Arc::new(MemoryStore::new()),
            Arc::new(files),
            settings,
            events.clone(),
        )
        .with_executor(pool.clone());

        Ok(Self {
            config,
            service: ChatService::new(dispatcher),
            pool,
            events,
        })
    }

    pub fn service(&self) -> &ChatService {
        &self.service
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    /// Waits for queued generations to finish; later dispatches fall back to detached threads.
    pub fn shutdown(&self) -> Result<()> {
        self.pool.shutdown();
        self.events
            .emit("engine_stopped", map_object(json!({})))
            .map(|_| ())
    }
}

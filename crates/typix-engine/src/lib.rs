pub mod config;
pub mod data_uri;
pub mod dispatch;
pub mod engine;
pub mod providers;
pub mod resolver;
pub mod service;
pub mod settings;
pub mod store;
pub mod worker;

pub use config::EngineConfig;
pub use dispatch::{DispatchJob, DispatchMode, Dispatcher};
pub use engine::Engine;
pub use providers::default_provider_registry;
pub use service::{ChatService, RequestContext};
pub use settings::{EnvSettings, SettingsSource, StaticSettings};
pub use store::{ChatStore, FileStore, LocalFileStore, MemoryFileStore, MemoryStore};
pub use worker::{DeferredExecutor, InlineExecutor, Task, WorkerPool};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::json;
use typix_contracts::chat::{Generation, GenerationStatus, Outcome};
use typix_contracts::error::{ConfigInvalid, ErrorReason};
use typix_contracts::events::EventWriter;
use typix_contracts::providers::{find_model, GenerateRequest, ProviderRegistry};

use crate::providers::{map_object, truncate_text};
use crate::resolver::{resolve_reference_images, ReferenceQuery};
use crate::settings::SettingsSource;
use crate::store::{ChatStore, FileStore};
use crate::worker::{DeferredExecutor, Task};

const DETAIL_MAX_CHARS: usize = 1024;

/// Everything a background run needs, captured when the generation is (re)set to pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchJob {
    pub generation_id: String,
    pub user_id: String,
    pub chat_id: String,
    /// Assistant message owning the generation; excluded from reference lookup.
    pub message_id: String,
    pub prompt: String,
    pub provider_id: String,
    pub model_id: String,
    /// Uploads on the triggering message, as data URIs.
    pub user_images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Registered with the host executor.
    Deferred,
    /// Fire-and-forget thread per dispatch.
    Detached,
}

struct DispatchContext {
    providers: ProviderRegistry,
    store: Arc<dyn ChatStore>,
    files: Arc<dyn FileStore>,
    settings: Arc<dyn SettingsSource>,
    events: EventWriter,
    executor: Option<Arc<dyn DeferredExecutor>>,
}

/// Runs generations off the request path and commits exactly one terminal state per run.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatchContext>,
}

impl Dispatcher {
    pub fn new(
        providers: ProviderRegistry,
        store: Arc<dyn ChatStore>,
        files: Arc<dyn FileStore>,
        settings: Arc<dyn SettingsSource>,
        events: EventWriter,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchContext {
                providers,
                store,
                files,
                settings,
                events,
                executor: None,
            }),
        }
    }

    /// Must be called before the dispatcher is cloned.
    pub fn with_executor(mut self, executor: Arc<dyn DeferredExecutor>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.executor = Some(executor),
            None => {
                let current = &self.inner;
                self.inner = Arc::new(DispatchContext {
                    providers: current.providers.clone(),
                    store: Arc::clone(&current.store),
                    files: Arc::clone(&current.files),
                    settings: Arc::clone(&current.settings),
                    events: current.events.clone(),
                    executor: Some(executor),
                });
            }
        }
        self
    }

    pub fn mode(&self) -> DispatchMode {
        if self.inner.executor.is_some() {
            DispatchMode::Deferred
        } else {
            DispatchMode::Detached
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    pub fn store(&self) -> &dyn ChatStore {
        self.inner.store.as_ref()
    }

    pub fn files(&self) -> &dyn FileStore {
        self.inner.files.as_ref()
    }

    pub fn events(&self) -> &EventWriter {
        &self.inner.events
    }

    /// Hands the job to the background and returns without waiting for it.
    pub fn dispatch(&self, job: DispatchJob) {
        self.inner.events.record(
            "generation_dispatched",
            map_object(json!({
                "generation_id": job.generation_id,
                "chat_id": job.chat_id,
                "provider": job.provider_id,
                "model": job.model_id,
                "mode": self.mode(),
            })),
        );

        let generation_id = job.generation_id.clone();
        let context = Arc::clone(&self.inner);
        let task: Task = Box::new(move || context.run(job));
        let task = match self.inner.executor.as_ref() {
            Some(executor) => match executor.defer(task) {
                Ok(()) => return,
                Err(refused) => refused,
            },
            None => task,
        };

        let spawned = thread::Builder::new()
            .name("typix-dispatch".to_string())
            .spawn(task);
        if let Err(err) = spawned {
            self.inner.commit(
                &generation_id,
                Outcome::Failed(ErrorReason::Unknown),
                Some(format!("dispatch thread spawn failed: {err}")),
            );
        }
    }
}

impl DispatchContext {
    fn run(&self, job: DispatchJob) {
        let started = Instant::now();
        let attempt = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&job, started)));
        let (outcome, detail) = match attempt {
            Ok(Ok(outcome)) => (outcome, None),
            Ok(Err(err)) => (
                Outcome::Failed(classify_error(&err)),
                Some(error_chain_text(&err, DETAIL_MAX_CHARS)),
            ),
            Err(payload) => (
                Outcome::Failed(ErrorReason::Unknown),
                Some(format!("generation panicked: {}", panic_message(payload.as_ref()))),
            ),
        };
        self.commit(&job.generation_id, outcome, detail);
    }

    fn execute(&self, job: &DispatchJob, started: Instant) -> Result<Outcome> {
        let provider = self.providers.expect(&job.provider_id)?;
        let model = find_model(provider.as_ref(), &job.model_id)?;
        let settings = self
            .settings
            .load(&job.user_id, provider.as_ref())
            .with_context(|| format!("failed loading settings for provider '{}'", provider.id()))?;

        let references = resolve_reference_images(
            self.store.as_ref(),
            self.files.as_ref(),
            ReferenceQuery {
                chat_id: &job.chat_id,
                user_id: &job.user_id,
                model,
                user_images: &job.user_images,
                exclude_message_id: Some(job.message_id.as_str()),
            },
        )
        .context("failed resolving reference images")?;
        self.events.record(
            "reference_images_resolved",
            map_object(json!({
                "generation_id": job.generation_id,
                "source": references.source,
                "count": references.images.len(),
                "file_ids": references.file_ids,
            })),
        );

        let request = GenerateRequest::new(&job.provider_id, &job.model_id, &job.prompt)
            .with_images(references.images);
        let response = provider
            .generate(&request, &settings)
            .with_context(|| format!("provider '{}' generate failed", provider.id()))?;
        if let Some(reason) = response.error_reason {
            return Ok(Outcome::Failed(reason));
        }
        if response.images.is_empty() {
            bail!("provider '{}' returned no images", provider.id());
        }

        let file_ids = self
            .files
            .save(&response.images, &job.user_id)
            .context("failed persisting generated images")?;
        Ok(Outcome::Completed {
            file_ids,
            generation_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn commit(&self, generation_id: &str, outcome: Outcome, detail: Option<String>) {
        match self.write_terminal(generation_id, outcome.clone()) {
            Ok((generation, previous)) => match outcome {
                Outcome::Completed { .. } => self.events.record(
                    "generation_completed",
                    map_object(json!({
                        "generation_id": generation.id,
                        "file_ids": generation.result_files(),
                        "generation_time_ms": generation.generation_time_ms,
                        "previous_status": previous,
                    })),
                ),
                Outcome::Failed(reason) => self.events.record(
                    "generation_failed",
                    map_object(json!({
                        "generation_id": generation.id,
                        "error_reason": reason,
                        "detail": detail,
                        "previous_status": previous,
                    })),
                ),
            },
            // saved files stay in the store; their ids are logged for cleanup
            Err(err) => self.events.record(
                "generation_commit_failed",
                map_object(json!({
                    "generation_id": generation_id,
                    "status": outcome.status(),
                    "orphaned_file_ids": match &outcome {
                        Outcome::Completed { file_ids, .. } => file_ids.clone(),
                        Outcome::Failed(_) => Vec::new(),
                    },
                    "detail": detail,
                    "error": error_chain_text(&err, DETAIL_MAX_CHARS),
                })),
            ),
        }
    }

    /// Last writer wins: an earlier run's terminal state is overwritten, never rejected.
    fn write_terminal(
        &self,
        generation_id: &str,
        outcome: Outcome,
    ) -> Result<(Generation, GenerationStatus)> {
        let mut generation = self
            .store
            .get_generation(generation_id)?
            .ok_or_else(|| anyhow!("generation {generation_id} not found"))?;
        let previous = generation.status;
        generation.commit(outcome)?;
        self.store.update_generation(&generation)?;
        Ok((generation, previous))
    }
}

/// `CONFIG_INVALID` when settings validation failed anywhere in the chain, else `UNKNOWN`.
pub fn classify_error(err: &anyhow::Error) -> ErrorReason {
    let invalid = err
        .chain()
        .any(|cause| cause.downcast_ref::<ConfigInvalid>().is_some());
    if invalid {
        ErrorReason::ConfigInvalid
    } else {
        ErrorReason::Unknown
    }
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(|last| last == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::anyhow;
    use typix_contracts::chat::{Chat, Generation, GenerationStatus, Message};
    use typix_contracts::error::{ConfigInvalid, ErrorReason};
    use typix_contracts::events::EventWriter;
    use typix_contracts::providers::ProviderRegistry;

    use super::{classify_error, error_chain_text, DispatchJob, DispatchMode, Dispatcher};
    use crate::providers::DryrunProvider;
    use crate::settings::StaticSettings;
    use crate::store::{ChatStore, MemoryFileStore, MemoryStore};
    use crate::worker::InlineExecutor;

    fn dispatcher(store: Arc<MemoryStore>) -> Dispatcher {
        let mut providers = ProviderRegistry::new();
        providers.register(DryrunProvider::new());
        Dispatcher::new(
            providers,
            store,
            Arc::new(MemoryFileStore::new()),
            Arc::new(StaticSettings::new()),
            EventWriter::memory("test"),
        )
    }

    fn pending_job(store: &MemoryStore, provider: &str, model: &str) -> anyhow::Result<DispatchJob> {
        let chat = Chat::new("user-1", None, provider, model);
        store.insert_chat(chat.clone())?;
        let generation = Generation::pending("user-1", "a lighthouse", provider, model);
        let message = Message::assistant_image(&chat.id, "user-1", &generation.id);
        let job = DispatchJob {
            generation_id: generation.id.clone(),
            user_id: "user-1".to_string(),
            chat_id: chat.id.clone(),
            message_id: message.id.clone(),
            prompt: generation.prompt.clone(),
            provider_id: provider.to_string(),
            model_id: model.to_string(),
            user_images: Vec::new(),
        };
        store.insert_generation_turn(generation, message)?;
        Ok(job)
    }

    #[test]
    fn mode_follows_executor_presence() {
        let store = Arc::new(MemoryStore::new());
        let detached = dispatcher(Arc::clone(&store));
        assert_eq!(detached.mode(), DispatchMode::Detached);
        let deferred = detached.with_executor(Arc::new(InlineExecutor));
        assert_eq!(deferred.mode(), DispatchMode::Deferred);
    }

    #[test]
    fn inline_dispatch_commits_completed_result() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(Arc::clone(&store)).with_executor(Arc::new(InlineExecutor));
        let job = pending_job(&store, "dryrun", "dryrun-t2i")?;
        dispatcher.dispatch(job.clone());

        let generation = store
            .get_generation(&job.generation_id)?
            .ok_or_else(|| anyhow!("generation missing"))?;
        assert_eq!(generation.status, GenerationStatus::Completed);
        assert_eq!(generation.result_files().len(), 1);
        assert!(generation.generation_time_ms.is_some());
        assert_eq!(
            dispatcher.events().event_types(),
            vec![
                "generation_dispatched",
                "reference_images_resolved",
                "generation_completed"
            ]
        );
        Ok(())
    }

    #[test]
    fn unknown_model_fails_as_unknown() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(Arc::clone(&store)).with_executor(Arc::new(InlineExecutor));
        let job = pending_job(&store, "dryrun", "dryrun-xl")?;
        dispatcher.dispatch(job.clone());

        let generation = store
            .get_generation(&job.generation_id)?
            .ok_or_else(|| anyhow!("generation missing"))?;
        assert_eq!(generation.status, GenerationStatus::Failed);
        assert_eq!(generation.error_reason, Some(ErrorReason::Unknown));
        Ok(())
    }

    #[test]
    fn overlapping_dispatch_overwrites_with_the_later_result() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(Arc::clone(&store)).with_executor(Arc::new(InlineExecutor));
        let job = pending_job(&store, "dryrun", "dryrun-t2i")?;
        dispatcher.dispatch(job.clone());
        let first = store
            .get_generation(&job.generation_id)?
            .ok_or_else(|| anyhow!("generation missing"))?;
        dispatcher.dispatch(job.clone());

        let last = store
            .get_generation(&job.generation_id)?
            .ok_or_else(|| anyhow!("generation missing"))?;
        assert_eq!(last.status, GenerationStatus::Completed);
        assert_ne!(last.result_files(), first.result_files());
        let completed = dispatcher
            .events()
            .snapshot()
            .into_iter()
            .filter(|event| event["type"] == "generation_completed")
            .collect::<Vec<_>>();
        assert_eq!(completed.len(), 2);
        assert_eq!(completed[1]["previous_status"], "completed");
        assert!(!dispatcher
            .events()
            .event_types()
            .contains(&"generation_commit_failed".to_string()));
        Ok(())
    }

    #[test]
    fn commit_without_a_record_logs_orphaned_files() -> anyhow::Result<()> {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(Arc::clone(&store)).with_executor(Arc::new(InlineExecutor));
        let job = pending_job(&store, "dryrun", "dryrun-t2i")?;
        store.delete_message(&job.message_id)?;
        dispatcher.dispatch(job);

        let failed = dispatcher
            .events()
            .snapshot()
            .into_iter()
            .find(|event| event["type"] == "generation_commit_failed")
            .ok_or_else(|| anyhow!("commit failure not logged"))?;
        assert_eq!(failed["status"], "completed");
        assert_eq!(failed["orphaned_file_ids"].as_array().map(Vec::len), Some(1));
        Ok(())
    }

    #[test]
    fn config_invalid_is_found_through_context() {
        let err = anyhow::Error::new(ConfigInvalid::new("fal", "missing required key 'apiKey'"))
            .context("provider 'fal' generate failed");
        assert_eq!(classify_error(&err), ErrorReason::ConfigInvalid);
        assert_eq!(classify_error(&anyhow!("socket closed")), ErrorReason::Unknown);
    }

    #[test]
    fn error_chain_text_joins_causes() {
        let err = anyhow!("connection reset").context("Flux request failed");
        assert_eq!(
            error_chain_text(&err, 200),
            "Flux request failed | caused by: connection reset"
        );
    }
}

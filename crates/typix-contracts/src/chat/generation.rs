use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::records::new_id;
use crate::error::ErrorReason;

/// Pending records younger than this are reported as `generating`.
pub const GENERATING_WINDOW_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Pending,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as a client should present it. `Generating` is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    #[default]
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("generation {generation_id}: illegal transition {from} -> {to}")]
    Illegal {
        generation_id: String,
        from: GenerationStatus,
        to: GenerationStatus,
    },
    #[error("generation {generation_id}: completed without result files")]
    EmptyResult { generation_id: String },
}

/// Terminal result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed {
        file_ids: Vec<String>,
        generation_time_ms: u64,
    },
    Failed(ErrorReason),
}

impl Outcome {
    pub fn status(&self) -> GenerationStatus {
        match self {
            Self::Completed { .. } => GenerationStatus::Completed,
            Self::Failed(_) => GenerationStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: GenerationKind,
    pub prompt: String,
    pub provider: String,
    pub model: String,
    pub status: GenerationStatus,
    pub file_ids: Option<Vec<String>>,
    pub error_reason: Option<ErrorReason>,
    pub generation_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Generation {
    pub fn pending(user_id: &str, prompt: &str, provider: &str, model: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            user_id: user_id.to_string(),
            kind: GenerationKind::Image,
            prompt: prompt.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            status: GenerationStatus::Pending,
            file_ids: None,
            error_reason: None,
            generation_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `pending -> completed`. Clears any stale error reason.
    pub fn complete(
        &mut self,
        file_ids: Vec<String>,
        generation_time_ms: u64,
    ) -> Result<(), TransitionError> {
        self.ensure_pending(GenerationStatus::Completed)?;
        if file_ids.is_empty() {
            return Err(TransitionError::EmptyResult {
                generation_id: self.id.clone(),
            });
        }
        self.status = GenerationStatus::Completed;
        self.file_ids = Some(file_ids);
        self.generation_time_ms = Some(generation_time_ms);
        self.error_reason = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// `pending -> failed`. Result fields stay empty.
    pub fn fail(&mut self, reason: ErrorReason) -> Result<(), TransitionError> {
        self.ensure_pending(GenerationStatus::Failed)?;
        self.status = GenerationStatus::Failed;
        self.error_reason = Some(reason);
        self.file_ids = None;
        self.generation_time_ms = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn apply(&mut self, outcome: Outcome) -> Result<(), TransitionError> {
        match outcome {
            Outcome::Completed {
                file_ids,
                generation_time_ms,
            } => self.complete(file_ids, generation_time_ms),
            Outcome::Failed(reason) => self.fail(reason),
        }
    }

    /// Terminal write of a finished dispatch. Unlike [`Generation::apply`] it also overwrites a
    /// terminal record: runs overlapping through a regeneration each commit when they finish,
    /// and the last one to finish is what the record keeps.
    pub fn commit(&mut self, outcome: Outcome) -> Result<(), TransitionError> {
        if let Outcome::Completed { file_ids, .. } = &outcome {
            if file_ids.is_empty() {
                return Err(TransitionError::EmptyResult {
                    generation_id: self.id.clone(),
                });
            }
        }
        self.status = GenerationStatus::Pending;
        self.apply(outcome)
    }

    /// Regeneration: back to `pending` with results, error and timing cleared.
    pub fn reset(&mut self) {
        self.status = GenerationStatus::Pending;
        self.file_ids = None;
        self.error_reason = None;
        self.generation_time_ms = None;
        self.updated_at = Utc::now();
    }

    pub fn observed_status(&self, now: DateTime<Utc>) -> ObservedStatus {
        match self.status {
            GenerationStatus::Completed => ObservedStatus::Completed,
            GenerationStatus::Failed => ObservedStatus::Failed,
            GenerationStatus::Pending => {
                if now - self.updated_at < Duration::seconds(GENERATING_WINDOW_SECS) {
                    ObservedStatus::Generating
                } else {
                    ObservedStatus::Pending
                }
            }
        }
    }

    pub fn result_files(&self) -> &[String] {
        self.file_ids.as_deref().unwrap_or_default()
    }

    fn ensure_pending(&self, to: GenerationStatus) -> Result<(), TransitionError> {
        if self.status == GenerationStatus::Pending {
            return Ok(());
        }
        Err(TransitionError::Illegal {
            generation_id: self.id.clone(),
            from: self.status,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{Generation, GenerationStatus, ObservedStatus, Outcome, TransitionError};
    use crate::error::ErrorReason;

    fn pending() -> Generation {
        Generation::pending("user-1", "draw a cat", "dryrun", "dryrun-t2i")
    }

    #[test]
    fn pending_completes_with_results_and_no_error() -> anyhow::Result<()> {
        let mut generation = pending();
        generation.complete(vec!["f1".to_string(), "f2".to_string()], 1200)?;
        assert_eq!(generation.status, GenerationStatus::Completed);
        assert_eq!(generation.result_files(), ["f1", "f2"]);
        assert_eq!(generation.error_reason, None);
        assert_eq!(generation.generation_time_ms, Some(1200));
        Ok(())
    }

    #[test]
    fn pending_fails_with_reason_and_no_results() -> anyhow::Result<()> {
        let mut generation = pending();
        generation.fail(ErrorReason::ConfigError)?;
        assert_eq!(generation.status, GenerationStatus::Failed);
        assert_eq!(generation.error_reason, Some(ErrorReason::ConfigError));
        assert!(generation.file_ids.is_none());
        Ok(())
    }

    #[test]
    fn terminal_records_reject_further_terminal_writes() -> anyhow::Result<()> {
        let mut generation = pending();
        generation.fail(ErrorReason::Unknown)?;
        let err = generation
            .apply(Outcome::Completed {
                file_ids: vec!["f1".to_string()],
                generation_time_ms: 10,
            })
            .err();
        assert!(matches!(
            err,
            Some(TransitionError::Illegal {
                from: GenerationStatus::Failed,
                to: GenerationStatus::Completed,
                ..
            })
        ));
        assert_eq!(generation.error_reason, Some(ErrorReason::Unknown));
        Ok(())
    }

    #[test]
    fn commit_overwrites_terminal_records_keeping_invariants() -> anyhow::Result<()> {
        let mut generation = pending();
        generation.fail(ErrorReason::ConfigError)?;
        generation.commit(Outcome::Completed {
            file_ids: vec!["f1".to_string()],
            generation_time_ms: 30,
        })?;
        assert_eq!(generation.status, GenerationStatus::Completed);
        assert_eq!(generation.error_reason, None);
        assert_eq!(generation.result_files(), ["f1"]);

        generation.commit(Outcome::Failed(ErrorReason::Unknown))?;
        assert_eq!(generation.status, GenerationStatus::Failed);
        assert!(generation.file_ids.is_none());
        assert!(generation.generation_time_ms.is_none());

        let empty = generation.commit(Outcome::Completed {
            file_ids: Vec::new(),
            generation_time_ms: 1,
        });
        assert!(matches!(empty, Err(TransitionError::EmptyResult { .. })));
        assert_eq!(generation.status, GenerationStatus::Failed);
        assert_eq!(generation.error_reason, Some(ErrorReason::Unknown));
        Ok(())
    }

    #[test]
    fn completion_requires_results() {
        let mut generation = pending();
        assert!(matches!(
            generation.complete(Vec::new(), 5),
            Err(TransitionError::EmptyResult { .. })
        ));
        assert_eq!(generation.status, GenerationStatus::Pending);
    }

    #[test]
    fn reset_clears_results_error_and_timing() -> anyhow::Result<()> {
        let mut generation = pending();
        generation.complete(vec!["f1".to_string()], 99)?;
        generation.reset();
        assert_eq!(generation.status, GenerationStatus::Pending);
        assert!(generation.file_ids.is_none());
        assert!(generation.error_reason.is_none());
        assert!(generation.generation_time_ms.is_none());

        generation.fail(ErrorReason::ConfigInvalid)?;
        generation.reset();
        assert!(generation.error_reason.is_none());
        Ok(())
    }

    #[test]
    fn generating_is_derived_from_recent_pending_records() -> anyhow::Result<()> {
        let mut generation = pending();
        let now = Utc::now();
        assert_eq!(generation.observed_status(now), ObservedStatus::Generating);
        assert_eq!(
            generation.observed_status(now + Duration::hours(1)),
            ObservedStatus::Pending
        );
        generation.complete(vec!["f1".to_string()], 1)?;
        assert_eq!(generation.observed_status(now), ObservedStatus::Completed);
        Ok(())
    }

    #[test]
    fn serializes_wire_shape() -> anyhow::Result<()> {
        let mut generation = pending();
        generation.fail(ErrorReason::ConfigInvalid)?;
        let value = serde_json::to_value(&generation)?;
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error_reason"], "CONFIG_INVALID");
        assert_eq!(value["type"], "image");
        Ok(())
    }
}

//! Data model for flow definitions and run execution state.
//!
//! Definition records (`Flow`, `Step`, `Dependency`) describe the static DAG
//! template. Execution records (`Run`, `StepState`, `StepTask`) track one
//! run of that template. Status enums carry `as_str`/`parse` pairs so the
//! stored representation stays a plain string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum slug length accepted by [`validate_slug`].
pub const MAX_SLUG_LEN: usize = 128;

/// Slugs that collide with keys the engine itself produces. `run` is the key
/// under which the run input is merged into non-map task payloads.
pub const RESERVED_SLUGS: &[&str] = &["run"];

// ============================================================================
// Definitions
// ============================================================================

/// A workflow definition (a DAG template).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub flow_slug: String,
    /// Default attempt budget per task before the run is failed.
    pub opt_max_attempts: i32,
    /// Default base delay in seconds for retry backoff.
    pub opt_base_delay: i32,
    /// Default per-task visibility timeout in seconds.
    pub opt_timeout: i32,
    pub created_at: DateTime<Utc>,
}

/// Whether a step runs once or fans out over an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Single,
    Map,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Map => "map",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(Self::Single),
            "map" => Some(Self::Map),
            _ => None,
        }
    }
}

/// A node in a flow's DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub flow_slug: String,
    pub step_slug: String,
    pub step_type: StepType,
    /// Insertion order within the flow.
    pub step_index: i32,
    pub deps_count: i32,
    pub opt_max_attempts: Option<i32>,
    pub opt_base_delay: Option<i32>,
    pub opt_timeout: Option<i32>,
    /// Delay in seconds applied to the first dispatch of each task.
    pub opt_start_delay: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// A directed edge `step_slug -> dep_slug` (step depends on dep).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub flow_slug: String,
    pub dep_slug: String,
    pub step_slug: String,
}

// ============================================================================
// Execution state
// ============================================================================

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One execution instance of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub status: RunStatus,
    pub input: Value,
    /// Aggregated leaf-step outputs; set when the run completes.
    pub output: Option<Value>,
    pub remaining_steps: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Status of one step within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Execution state of one step within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub step_slug: String,
    pub status: StepStatus,
    pub remaining_deps: i32,
    /// Tasks still outstanding; set when the step starts.
    pub remaining_tasks: Option<i32>,
    /// Total task count. Known at run creation for single and root map
    /// steps; dependent map steps stay unresolved until their dependency
    /// completes.
    pub initial_tasks: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One unit of work; map steps have one task per array index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTask {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub step_slug: String,
    pub task_index: i32,
    pub status: TaskStatus,
    pub attempts_count: i32,
    /// Queue message backing this task while it is in flight.
    pub message_id: Option<i64>,
    pub last_worker_id: Option<Uuid>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Queue message payload pointing a worker at one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub flow_slug: String,
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: i32,
}

// ============================================================================
// Slug validation
// ============================================================================

/// Validate a flow or step slug: non-empty, at most [`MAX_SLUG_LEN`] chars,
/// `[A-Za-z_][A-Za-z0-9_]*`, and not a reserved word.
pub fn validate_slug(slug: &str) -> Result<(), &'static str> {
    if slug.is_empty() {
        return Err("must not be empty");
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err("must be at most 128 characters");
    }
    let mut chars = slug.chars();
    let first = chars.next().expect("slug checked non-empty");
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err("must start with a letter or underscore");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err("must contain only letters, digits and underscores");
    }
    if RESERVED_SLUGS.contains(&slug) {
        return Err("is a reserved word");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_enums_roundtrip() {
        for status in [RunStatus::Started, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            StepStatus::Created,
            StepStatus::Started,
            StepStatus::Completed,
            StepStatus::Failed,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            TaskStatus::Queued,
            TaskStatus::Started,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        for step_type in [StepType::Single, StepType::Map] {
            assert_eq!(StepType::parse(step_type.as_str()), Some(step_type));
        }
        assert_eq!(RunStatus::parse("invalid"), None);
        assert_eq!(TaskStatus::parse("invalid"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Started.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Started.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn validate_slug_accepts_identifiers() {
        assert!(validate_slug("extract").is_ok());
        assert!(validate_slug("_private").is_ok());
        assert!(validate_slug("step_2").is_ok());
        assert!(validate_slug(&"a".repeat(MAX_SLUG_LEN)).is_ok());
    }

    #[test]
    fn validate_slug_rejects_bad_shapes() {
        assert!(validate_slug("").is_err());
        assert!(validate_slug("2fast").is_err());
        assert!(validate_slug("has space").is_err());
        assert!(validate_slug("has-dash").is_err());
        assert!(validate_slug(&"a".repeat(MAX_SLUG_LEN + 1)).is_err());
    }

    #[test]
    fn validate_slug_rejects_reserved_words() {
        assert!(validate_slug("run").is_err());
        assert!(validate_slug("run_report").is_ok());
    }

    #[test]
    fn task_message_roundtrips_through_json() {
        let message = TaskMessage {
            flow_slug: "analytics".to_string(),
            run_id: Uuid::new_v4(),
            step_slug: "extract".to_string(),
            task_index: 3,
        };
        let encoded = serde_json::to_value(&message).expect("encode");
        let decoded: TaskMessage = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, message);
    }
}

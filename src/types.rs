use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a registered worker.
///
/// Serialized lowercase; the names are part of the log and snapshot format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    #[default]
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Online => write!(f, "online"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Runtime state of a registered worker. This is the replicated record:
/// every replica that has applied the same log index holds the same set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub cloud_tag: String,
    #[serde(default)]
    pub status: WorkerStatus,
    #[serde(default = "unix_epoch")]
    pub last_seen: DateTime<Utc>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Identifies the state-machine command carried by a log entry.
///
/// The serialized names are part of the on-disk format and must not change.
/// Entries written by a newer version with a type this build does not know
/// decode as `Unknown` and fail at apply time without halting the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    RegisterWorker,
    UpdateWorkerStatus,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::RegisterWorker => write!(f, "register_worker"),
            CommandType::UpdateWorkerStatus => write!(f, "update_worker_status"),
            CommandType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Envelope for all replicated commands. The payload is type-specific JSON,
/// decoded by the state machine at apply time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub payload: serde_json::Value,
}

impl Command {
    pub fn register_worker(payload: &RegisterWorkerPayload) -> serde_json::Result<Self> {
        Ok(Self {
            kind: CommandType::RegisterWorker,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn update_worker_status(payload: &UpdateWorkerStatusPayload) -> serde_json::Result<Self> {
        Ok(Self {
            kind: CommandType::UpdateWorkerStatus,
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerPayload {
    pub id: String,
    pub address: String,
    pub cloud_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateWorkerStatusPayload {
    pub id: String,
    pub status: WorkerStatus,
}

/// Per-entry response from the state machine, carried back through consensus
/// to the caller of `apply`. An error here means the command was consumed but
/// rejected; the log index still advances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
        }
    }
}

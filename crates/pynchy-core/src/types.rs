use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a stored message.
///
/// `Host` messages are operational notifications (deploy summaries, denial
/// notices) that are shown to humans but must never be included in the
/// LLM-visible projection of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    System,
    Host,
    ToolResult,
    Security,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::User => "user",
            MessageType::Assistant => "assistant",
            MessageType::System => "system",
            MessageType::Host => "host",
            MessageType::ToolResult => "tool_result",
            MessageType::Security => "security",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageType::User),
            "assistant" => Ok(MessageType::Assistant),
            "system" => Ok(MessageType::System),
            "host" => Ok(MessageType::Host),
            "tool_result" => Ok(MessageType::ToolResult),
            "security" => Ok(MessageType::Security),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// A chat message, inbound or outbound. `(id, chat_jid)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    /// Canonical workspace jid (channel-native ids are remapped on ingest).
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    /// ISO-8601, UTC. Lexicographic comparison works for cursor math.
    pub timestamp: String,
    #[serde(default)]
    pub is_from_me: bool,
    pub message_type: MessageType,
    /// Free-form JSON attached by channels or handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A registered workspace: one long-lived logical conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceProfile {
    /// Opaque channel-namespaced id, e.g. `slack:C123` or `123@g.us`.
    pub jid: String,
    pub name: String,
    /// Lowercase hyphenated slug, stable, used as a path component.
    pub folder: String,
    /// Trigger pattern that wakes the agent in this workspace.
    pub trigger: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<ContainerOverrides>,
    pub added_at: DateTime<Utc>,
}

/// Per-workspace container overrides carried on the profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerOverrides {
    #[serde(default)]
    pub additional_mounts: Vec<MountSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

/// A single bind mount request, validated against the host allowlist
/// before it reaches a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// When and how often a scheduled task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Five-field cron expression evaluated in the task's timezone.
    Cron,
    /// Fixed interval in milliseconds.
    Interval,
    /// Single fire at an ISO-8601 instant.
    Once,
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleType::Cron),
            "interval" => Ok(ScheduleType::Interval),
            "once" => Ok(ScheduleType::Once),
            other => Err(format!("unknown schedule type: {other}")),
        }
    }
}

/// Lifecycle state of a scheduled task or host job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(TaskStatus::Active),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A persisted scheduled task. Tasks with an id starting with `host-`
/// execute a shell command on the host instead of invoking the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    /// Target workspace folder.
    pub group_folder: String,
    pub chat_jid: String,
    /// Agent prompt (tasks) or shell command (host jobs).
    pub prompt: String,
    pub schedule_type: ScheduleType,
    /// Cron expression, interval in ms, or ISO-8601 instant.
    pub schedule_value: String,
    /// IANA timezone for cron evaluation.
    pub timezone: String,
    pub status: TaskStatus,
    /// ISO-8601 UTC; due when `status=active` and `next_run <= now`.
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub created_at: String,
}

/// Prefix that routes a scheduled task to host shell execution.
pub const HOST_JOB_PREFIX: &str = "host-";

impl ScheduledTask {
    pub fn is_host_job(&self) -> bool {
        self.id.starts_with(HOST_JOB_PREFIX)
    }
}

/// An admin-scheduled shell command executed on the host, no agent
/// involvement. Ids carry the `host-` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostJob {
    pub id: String,
    pub name: String,
    pub command: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub timezone: String,
    pub status: TaskStatus,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub created_at: String,
    /// Workspace folder that scheduled the job.
    pub created_by: String,
    pub cwd: Option<String>,
    pub timeout_seconds: u64,
}

//! Handlers for task scheduling and lifecycle (pause/resume/cancel),
//! host jobs, and periodic agent creation.

use std::sync::Arc;

use chrono::Utc;
use pynchy_core::types::{
    HostJob, ScheduleType, ScheduledTask, TaskStatus, WorkspaceProfile, HOST_JOB_PREFIX,
};
use pynchy_core::util::{compute_next_run, generate_request_id, now_iso, truncate_chars};
use serde_json::Value;
use tracing::{info, warn};

use crate::deps::IpcDeps;
use crate::handlers::cop_gate::cop_gate;
use crate::write::{error_response, ipc_response_path, write_ipc_response};

fn field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(|v| v.as_str())
}

fn respond(deps: &Arc<IpcDeps>, group: &str, data: &Value, body: Value) {
    if let Some(request_id) = field(data, "request_id") {
        let path = ipc_response_path(&deps.config.ipc_root(), group, request_id);
        if let Err(e) = write_ipc_response(&path, &body) {
            warn!(group, request_id, error = %e, "failed to write IPC response");
        }
    }
}

/// `once` values are ISO instants used verbatim; cron/interval compute
/// their first fire from now in the host timezone.
fn next_run_for(
    schedule_type: ScheduleType,
    schedule_value: &str,
    timezone: &str,
) -> Result<Option<String>, String> {
    match schedule_type {
        ScheduleType::Once => {
            let parsed = chrono::DateTime::parse_from_rfc3339(schedule_value)
                .map_err(|e| format!("bad once timestamp: {e}"))?;
            Ok(Some(parsed.with_timezone(&Utc).to_rfc3339()))
        }
        _ => compute_next_run(schedule_type, schedule_value, timezone).map_err(|e| e.to_string()),
    }
}

pub async fn handle_schedule_task(
    data: Value,
    source_group: String,
    is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    let prompt = field(&data, "prompt").unwrap_or_default().to_string();
    let schedule_type_raw = field(&data, "schedule_type").unwrap_or_default().to_string();
    let schedule_value = field(&data, "schedule_value").unwrap_or_default().to_string();
    let target_folder = field(&data, "target_group").unwrap_or(&source_group).to_string();

    let summary = format!(
        "target={target_folder}, schedule={schedule_type_raw}:{schedule_value}, prompt={}",
        truncate_chars(&prompt, 500)
    );
    if !cop_gate("schedule_task", &summary, &data, &source_group, &deps).await {
        return;
    }

    if prompt.is_empty() || schedule_type_raw.is_empty() || schedule_value.is_empty() {
        respond(&deps, &source_group, &data, error_response("Missing required fields"));
        return;
    }

    let Ok(schedule_type) = schedule_type_raw.parse::<ScheduleType>() else {
        respond(
            &deps,
            &source_group,
            &data,
            error_response(format!("Unknown schedule type: {schedule_type_raw}")),
        );
        return;
    };

    // Resolve target folder → jid; tasks only target registered workspaces.
    let target_jid = deps
        .store
        .get_group_by_folder(&target_folder)
        .ok()
        .flatten()
        .map(|p| p.jid);
    let Some(target_jid) = target_jid else {
        warn!(target = %target_folder, "cannot schedule task: target not registered");
        respond(
            &deps,
            &source_group,
            &data,
            error_response(format!("Target group not registered: {target_folder}")),
        );
        return;
    };

    if !is_admin && target_folder != source_group {
        warn!(source = %source_group, target = %target_folder, "unauthorized schedule_task blocked");
        let _ = deps.store.record_security_event(&pynchy_store::SecurityEvent {
            chat_jid: target_jid,
            workspace: source_group.clone(),
            tool_name: "schedule_task".into(),
            decision: "admin_denied".into(),
            corruption_tainted: false,
            secret_tainted: false,
            reason: Some("cross-workspace schedule by non-admin".into()),
            request_id: field(&data, "request_id").map(String::from),
        });
        respond(&deps, &source_group, &data, error_response("Not authorized"));
        return;
    }

    let timezone = field(&data, "timezone").unwrap_or(&deps.config.timezone).to_string();
    let next_run = match next_run_for(schedule_type, &schedule_value, &timezone) {
        Ok(next) => next,
        Err(e) => {
            warn!(schedule_value = %schedule_value, error = %e, "invalid schedule value");
            respond(&deps, &source_group, &data, error_response(format!("Invalid schedule: {e}")));
            return;
        }
    };

    let task_id = format!(
        "task-{}-{}",
        Utc::now().timestamp_millis(),
        &generate_request_id()[..8]
    );
    let task = ScheduledTask {
        id: task_id.clone(),
        group_folder: target_folder.clone(),
        chat_jid: target_jid,
        prompt,
        schedule_type,
        schedule_value,
        timezone,
        status: TaskStatus::Active,
        next_run,
        last_run: None,
        last_result: None,
        created_at: now_iso(),
    };
    if let Err(e) = deps.store.create_task(&task) {
        respond(&deps, &source_group, &data, error_response(format!("Store error: {e}")));
        return;
    }

    info!(task_id = %task_id, source = %source_group, target = %target_folder, "task created via IPC");
    respond(
        &deps,
        &source_group,
        &data,
        serde_json::json!({ "ok": true, "task_id": task_id }),
    );
}

pub async fn handle_schedule_host_job(
    data: Value,
    source_group: String,
    is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    if !is_admin {
        warn!(source = %source_group, "unauthorized schedule_host_job attempt");
        let _ = deps.store.record_security_event(&pynchy_store::SecurityEvent {
            chat_jid: deps.resolve_chat_jid(&source_group).unwrap_or_default(),
            workspace: source_group.clone(),
            tool_name: "schedule_host_job".into(),
            decision: "admin_denied".into(),
            corruption_tainted: false,
            secret_tainted: false,
            reason: None,
            request_id: field(&data, "request_id").map(String::from),
        });
        respond(&deps, &source_group, &data, error_response("Admin only"));
        return;
    }

    let name = field(&data, "name").unwrap_or_default().to_string();
    let command = field(&data, "command").unwrap_or_default().to_string();
    let schedule_type_raw = field(&data, "schedule_type").unwrap_or_default().to_string();
    let schedule_value = field(&data, "schedule_value").unwrap_or_default().to_string();

    let summary =
        format!("name={name}, command={command}, schedule={schedule_type_raw}:{schedule_value}");
    if !cop_gate("schedule_host_job", &summary, &data, &source_group, &deps).await {
        return;
    }

    if name.is_empty() || command.is_empty() || schedule_type_raw.is_empty() || schedule_value.is_empty()
    {
        respond(&deps, &source_group, &data, error_response("Missing required fields"));
        return;
    }

    let Ok(schedule_type) = schedule_type_raw.parse::<ScheduleType>() else {
        respond(
            &deps,
            &source_group,
            &data,
            error_response(format!("Unknown schedule type: {schedule_type_raw}")),
        );
        return;
    };

    let timezone = field(&data, "timezone").unwrap_or(&deps.config.timezone).to_string();
    let next_run = match next_run_for(schedule_type, &schedule_value, &timezone) {
        Ok(next) => next,
        Err(e) => {
            respond(&deps, &source_group, &data, error_response(format!("Invalid schedule: {e}")));
            return;
        }
    };

    let job_id = format!(
        "{HOST_JOB_PREFIX}{}-{}",
        Utc::now().timestamp_millis(),
        &generate_request_id()[..8]
    );
    let job = HostJob {
        id: job_id.clone(),
        name,
        command,
        schedule_type,
        schedule_value,
        timezone,
        status: TaskStatus::Active,
        next_run,
        last_run: None,
        last_result: None,
        created_at: now_iso(),
        created_by: source_group.clone(),
        cwd: field(&data, "cwd").map(String::from),
        timeout_seconds: data
            .get("timeout_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(600),
    };
    if let Err(e) = deps.store.create_host_job(&job) {
        respond(&deps, &source_group, &data, error_response(format!("Store error: {e}")));
        return;
    }

    info!(job_id = %job_id, source = %source_group, "host job created via IPC");
    respond(
        &deps,
        &source_group,
        &data,
        serde_json::json!({ "ok": true, "job_id": job_id }),
    );
}

/// Create a fresh periodic agent: registers a synthetic workspace and
/// schedules its recurring prompt in one operation. Admin-only.
pub async fn handle_create_periodic_agent(
    data: Value,
    source_group: String,
    is_admin: bool,
    deps: Arc<IpcDeps>,
) {
    if !is_admin {
        warn!(source = %source_group, "unauthorized create_periodic_agent attempt");
        respond(&deps, &source_group, &data, error_response("Admin only"));
        return;
    }

    let folder = field(&data, "folder").unwrap_or_default().to_string();
    let prompt = field(&data, "prompt").unwrap_or_default().to_string();
    let schedule_value = field(&data, "schedule_value").unwrap_or_default().to_string();

    let summary = format!(
        "folder={folder}, schedule={schedule_value}, prompt={}",
        truncate_chars(&prompt, 500)
    );
    if !cop_gate("create_periodic_agent", &summary, &data, &source_group, &deps).await {
        return;
    }

    if folder.is_empty() || prompt.is_empty() || schedule_value.is_empty() {
        respond(&deps, &source_group, &data, error_response("Missing required fields"));
        return;
    }

    let jid = format!("agent:{folder}");
    let profile = WorkspaceProfile {
        jid: jid.clone(),
        name: field(&data, "name").unwrap_or(&folder).to_string(),
        folder: folder.clone(),
        trigger: field(&data, "trigger").unwrap_or("@pynchy").to_string(),
        is_admin: false,
        container_config: None,
        added_at: Utc::now(),
    };
    if let Err(e) = deps.store.set_registered_group(&profile) {
        respond(&deps, &source_group, &data, error_response(format!("Store error: {e}")));
        return;
    }
    (deps.on_refresh_groups)();

    let schedule_type_raw = field(&data, "schedule_type").unwrap_or("cron").to_string();
    let mut task_data = data.clone();
    if let Some(obj) = task_data.as_object_mut() {
        obj.insert("target_group".into(), Value::String(folder.clone()));
        obj.insert("schedule_type".into(), Value::String(schedule_type_raw));
        // The workspace exists now; the task creation must not re-gate.
        obj.insert("_cop_approved".into(), Value::Bool(true));
    }
    handle_schedule_task(task_data, source_group, true, deps).await;
}

async fn authorized_task_action(
    data: Value,
    source_group: String,
    is_admin: bool,
    deps: Arc<IpcDeps>,
    action_name: &str,
    new_status: Option<TaskStatus>,
) {
    let Some(task_id) = field(&data, "task_id").map(String::from) else {
        respond(&deps, &source_group, &data, error_response("Missing task_id"));
        return;
    };

    let is_host_job = task_id.starts_with(HOST_JOB_PREFIX);

    let authorized = if is_host_job {
        is_admin
    } else {
        match deps.store.get_task(&task_id) {
            Ok(Some(task)) => is_admin || task.group_folder == source_group,
            _ => false,
        }
    };
    if !authorized {
        warn!(task_id = %task_id, source = %source_group, action = action_name, "unauthorized task action");
        respond(&deps, &source_group, &data, error_response("Not authorized"));
        return;
    }

    let result = match (is_host_job, new_status) {
        (true, Some(status)) => deps.store.set_host_job_status(&task_id, status).map(|_| true),
        (true, None) => deps.store.delete_host_job(&task_id),
        (false, Some(status)) => deps.store.set_task_status(&task_id, status).map(|_| true),
        (false, None) => deps.store.delete_task(&task_id),
    };

    match result {
        Ok(true) => {
            info!(task_id = %task_id, action = action_name, source = %source_group, "task action applied");
            respond(&deps, &source_group, &data, serde_json::json!({ "ok": true }));
        }
        Ok(false) => {
            respond(&deps, &source_group, &data, error_response("Task not found"));
        }
        Err(e) => {
            respond(&deps, &source_group, &data, error_response(format!("{e}")));
        }
    }
}

pub async fn handle_pause_task(data: Value, source_group: String, is_admin: bool, deps: Arc<IpcDeps>) {
    authorized_task_action(data, source_group, is_admin, deps, "pause", Some(TaskStatus::Paused))
        .await;
}

pub async fn handle_resume_task(data: Value, source_group: String, is_admin: bool, deps: Arc<IpcDeps>) {
    authorized_task_action(data, source_group, is_admin, deps, "resume", Some(TaskStatus::Active))
        .await;
}

pub async fn handle_cancel_task(data: Value, source_group: String, is_admin: bool, deps: Arc<IpcDeps>) {
    authorized_task_action(data, source_group, is_admin, deps, "cancel", None).await;
}

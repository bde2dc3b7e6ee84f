//! Handler modules and their registration table.

pub mod ask_user;
pub mod cop_gate;
pub mod groups;
pub mod lifecycle;
pub mod security;
pub mod service;
pub mod tasks;
pub mod worktree;

use std::sync::Arc;

use crate::registry::{Handler, HandlerRegistry};

macro_rules! handler {
    ($f:path) => {{
        let h: Handler = Arc::new(|data, folder, is_admin, deps| {
            Box::pin($f(data, folder, is_admin, deps))
        });
        h
    }};
}

/// Build the full dispatch table. Exact types first, then the prefix
/// families (`service:*`, `security:*`).
pub fn register_all(registry: &mut HandlerRegistry) {
    registry.register("register_group", handler!(groups::handle_register_group));
    registry.register("schedule_task", handler!(tasks::handle_schedule_task));
    registry.register("schedule_host_job", handler!(tasks::handle_schedule_host_job));
    registry.register(
        "create_periodic_agent",
        handler!(tasks::handle_create_periodic_agent),
    );
    registry.register("pause_task", handler!(tasks::handle_pause_task));
    registry.register("resume_task", handler!(tasks::handle_resume_task));
    registry.register("cancel_task", handler!(tasks::handle_cancel_task));
    registry.register("reset_context", handler!(lifecycle::handle_reset_context));
    registry.register("finished_work", handler!(lifecycle::handle_finished_work));
    registry.register("sync_worktree_to_main", handler!(worktree::handle_sync_worktree));
    registry.register("ask_user", handler!(ask_user::handle_ask_user));
    registry.register_prefix("service:", handler!(service::handle_service_request));
    registry.register_prefix("security:", handler!(security::handle_security_request));
}

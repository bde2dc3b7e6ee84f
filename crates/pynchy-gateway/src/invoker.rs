//! Scheduler → agent bridge.

use std::sync::Arc;

use async_trait::async_trait;
use pynchy_core::types::ScheduledTask;
use pynchy_scheduler::TaskInvoker;
use tracing::warn;

use crate::app::App;
use crate::processor;

pub struct AppTaskInvoker(pub Arc<App>);

#[async_trait]
impl TaskInvoker for AppTaskInvoker {
    async fn invoke_task(&self, task: ScheduledTask) -> Result<String, String> {
        let Some(profile) = self.0.workspace_by_folder(&task.group_folder) else {
            warn!(task_id = %task.id, folder = %task.group_folder, "task for unknown workspace");
            return Err(format!("workspace '{}' not registered", task.group_folder));
        };
        processor::process_task(Arc::clone(&self.0), profile, task.prompt.clone()).await
    }
}

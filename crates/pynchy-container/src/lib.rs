//! Container orchestration: mount-set construction, sandboxed spawn via a
//! pluggable runtime, typed event-stream consumption, and session
//! preparation (settings, skills, credentials).

pub mod events;
pub mod mounts;
pub mod runtime;
pub mod session_prep;
pub mod spawn;

pub use events::{AgentEvent, ContainerInput};
pub use mounts::{build_container_args, build_volume_mounts, VolumeMount};
pub use runtime::{CliRuntime, ContainerRuntime};
pub use spawn::{run_container, ContainerOutcome};

//! Layered security for agent side-effects: the trust-based policy engine,
//! per-invocation gate registry, the Cop LLM inspector, untrusted-content
//! fencing, the bash three-tier cascade, the human-approval file protocol,
//! and the admin clean-room startup validation.

pub mod approval;
pub mod bash;
pub mod clean_room;
pub mod cop;
pub mod fencing;
pub mod gate;
pub mod policy;
pub mod questions;
pub mod scanner;

pub use cop::{Cop, CopVerdict};
pub use gate::{GateRegistry, SecurityGate};
pub use policy::{PolicyDecision, SecurityPolicy};

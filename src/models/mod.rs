//! Domain model module declarations.

pub mod registry;
pub mod session;
pub mod state;

pub use registry::SessionRegistry;
pub use session::{Liveness, PromptSchedule, Session, SessionStatus};
pub use state::{AgentState, DetectedState};

//! Concrete session backend used by the binary.

pub mod classifier;
pub mod tmux;

pub use classifier::PatternClassifier;
pub use tmux::{TmuxChannel, TmuxConfig};

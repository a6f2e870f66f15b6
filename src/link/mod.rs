//! Reliable, ordered link to the rover on top of the radio channel.

pub mod commands;
pub mod machine;
pub mod session;
pub mod station;

pub use commands::Command;
pub use machine::{Action, ConnectionStateMachine};
pub use session::{Session, SessionEvent, SessionSnapshot, SessionState};
pub use station::{SessionChannels, SessionHandle};

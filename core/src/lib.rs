//! Root of the `neo-core` library: the agent state machine, the command
//! registry and built-in commands, the persistent shell manager, the LLM
//! client pipeline and the session that wires them together.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the host (the CLI) or the tracing
// stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod client;
pub mod clock;
pub mod command;
pub mod commands;
pub mod config;
pub mod error;
pub mod flags;
pub mod session;
pub mod shells;
pub mod structured_log;
pub mod util;

pub use agent::Agent;
pub use command::CommandRegistry;
pub use command::OutputSchema;
pub use session::Session;
pub use session::SessionBuilder;

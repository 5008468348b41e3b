//! Runtime control: records arrive on a local socket, are parsed into
//! [`Command`]s and applied to the registry by the [`CommandDispatcher`].

pub mod command;
pub mod dispatcher;
pub mod server;

pub use command::{Command, CommandError};
pub use dispatcher::{CommandDispatcher, DispatchOutcome};
pub use server::ControlServer;

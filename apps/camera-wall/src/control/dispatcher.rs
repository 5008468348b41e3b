use std::sync::Arc;
use tracing::{debug, info, warn};

use super::command::{Command, CommandError};
use crate::engine::MediaEngine;
use crate::stream::SessionRegistry;

/// Result of handling one control record. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    /// Nothing to do: blank, malformed or incomplete record, unknown verb,
    /// removal of an unknown id.
    Ignored(String),
    /// The registry refused the request (duplicate id, invalid layout).
    Rejected(String),
}

/// Turns control commands into registry operations.
pub struct CommandDispatcher<E: MediaEngine> {
    registry: Arc<SessionRegistry<E>>,
}

impl<E: MediaEngine> Clone for CommandDispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<E: MediaEngine> CommandDispatcher<E> {
    pub fn new(registry: Arc<SessionRegistry<E>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<E>> {
        &self.registry
    }

    /// Parse and apply one raw control record.
    pub async fn dispatch_line(&self, line: &str) -> DispatchOutcome {
        match Command::parse(line) {
            Ok(command) => self.dispatch(command).await,
            Err(CommandError::Blank) => DispatchOutcome::Ignored("blank record".to_string()),
            Err(err) => {
                debug!("Ignoring control record: {}", err);
                DispatchOutcome::Ignored(err.to_string())
            }
        }
    }

    pub async fn dispatch(&self, command: Command) -> DispatchOutcome {
        debug!("Dispatching {:?}", command);
        match command {
            Command::AddStream { id, url } => match self.registry.add_stream(&id, &url).await {
                Ok(()) => DispatchOutcome::Applied,
                Err(err) => {
                    warn!("add_stream {} rejected: {}", id, err);
                    DispatchOutcome::Rejected(err.to_string())
                }
            },
            Command::RemoveStream { id } => match self.registry.remove_stream(&id).await {
                Ok(true) => DispatchOutcome::Applied,
                Ok(false) => DispatchOutcome::Ignored(format!("stream {} not found", id)),
                Err(err) => {
                    warn!("remove_stream {} failed: {}", id, err);
                    DispatchOutcome::Rejected(err.to_string())
                }
            },
            Command::Grid { rows, cols } => {
                let current = self.registry.layout().await;
                let rows = rows.unwrap_or(i64::from(current.rows));
                let cols = cols.unwrap_or(i64::from(current.cols));
                match self.registry.set_layout(rows, cols).await {
                    Ok(layout) => {
                        info!("Grid is now {}x{}", layout.rows, layout.cols);
                        DispatchOutcome::Applied
                    }
                    Err(err) => DispatchOutcome::Rejected(err.to_string()),
                }
            }
        }
    }
}

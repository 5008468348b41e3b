pub mod config;
pub mod consumer;
pub mod control;
pub mod engine;
pub mod gst_utils;
pub mod stream;

// Re-export commonly used types
pub use config::Config;
pub use control::{Command, CommandDispatcher};
pub use stream::{FrameRouter, SessionRegistry, SessionState, StreamSession};

// Common error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraWallError {
    #[error("Stream {0} already exists")]
    DuplicateIdentifier(String),

    #[error("Invalid grid layout {rows}x{cols}: rows and cols must be at least 1")]
    InvalidLayout { rows: i64, cols: i64 },

    #[error("Failed to build pipeline for {id}: {reason}")]
    PipelineCreate { id: String, reason: String },

    #[error("Stream {id} cannot {action} while {state}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        state: String,
    },

    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Task error: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, CameraWallError>;

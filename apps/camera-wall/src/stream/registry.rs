use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::router::{ConsumerEvent, FrameRouter};
use super::session::{SessionSettings, SessionState, StreamSession};
use crate::config::{GridConfig, StreamDefaultConfig};
use crate::engine::MediaEngine;
use crate::{CameraWallError, Result};

/// Reported grid shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    pub rows: u32,
    pub cols: u32,
}

impl Default for GridLayout {
    fn default() -> Self {
        Self { rows: 2, cols: 2 }
    }
}

impl From<&GridConfig> for GridLayout {
    fn from(config: &GridConfig) -> Self {
        Self {
            rows: config.rows,
            cols: config.cols,
        }
    }
}

impl GridLayout {
    /// Validate a requested shape; both dimensions must be at least 1.
    pub fn new(rows: i64, cols: i64) -> Result<Self> {
        match (u32::try_from(rows), u32::try_from(cols)) {
            (Ok(r), Ok(c)) if r >= 1 && c >= 1 => Ok(Self { rows: r, cols: c }),
            _ => Err(CameraWallError::InvalidLayout { rows, cols }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.rows as usize * self.cols as usize
    }
}

/// What the display surface needs: the shape and the streams in placement order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GridState {
    pub layout: GridLayout,
    pub ids: Vec<String>,
}

impl GridState {
    pub fn new(layout: GridLayout) -> Self {
        Self {
            layout,
            ids: Vec::new(),
        }
    }

    /// Row-major cell of `id`.
    pub fn cell_of(&self, id: &str) -> Option<(u32, u32)> {
        let index = self.ids.iter().position(|i| i == id)? as u32;
        Some((index / self.layout.cols, index % self.layout.cols))
    }

    /// Whether `id` falls inside the visible rows.
    pub fn is_visible(&self, id: &str) -> bool {
        self.cell_of(id).is_some_and(|(row, _)| row < self.layout.rows)
    }

    /// Follow registry events so a consumer can keep its own copy.
    pub fn apply(&mut self, event: &ConsumerEvent) {
        match event {
            ConsumerEvent::StreamAdded(id) => {
                if !self.ids.contains(id) {
                    self.ids.push(id.clone());
                }
            }
            ConsumerEvent::StreamRemoved(id) => self.ids.retain(|i| i != id),
            ConsumerEvent::LayoutChanged { rows, cols } => {
                self.layout = GridLayout {
                    rows: *rows,
                    cols: *cols,
                }
            }
            ConsumerEvent::FrameUpdated(_) | ConsumerEvent::StateChanged { .. } => {}
        }
    }
}

struct RegistryInner<E: MediaEngine> {
    sessions: HashMap<String, Arc<StreamSession<E::Graph>>>,
    order: Vec<String>,
    layout: GridLayout,
}

/// Owns every active session, keyed by stream id.
///
/// Add, remove and layout changes take the write lock, so they are
/// serialized; sessions keep reporting through the router in the meantime.
pub struct SessionRegistry<E: MediaEngine> {
    engine: Arc<E>,
    router: FrameRouter,
    settings: SessionSettings,
    inner: RwLock<RegistryInner<E>>,
}

impl<E: MediaEngine> SessionRegistry<E> {
    pub fn new(
        engine: E,
        router: FrameRouter,
        layout: GridLayout,
        defaults: &StreamDefaultConfig,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            router,
            settings: SessionSettings::from(defaults),
            inner: RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                order: Vec::new(),
                layout,
            }),
        }
    }

    pub fn router(&self) -> &FrameRouter {
        &self.router
    }

    /// Create, register and start a session for `id`.
    ///
    /// A session that fails to start stays registered in `Error` so the
    /// failure stays visible; it is removed like any other. Starting may block
    /// on the engine, so it runs on the blocking pool.
    pub async fn add_stream(&self, id: &str, url: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(id) {
            warn!("Stream {} already exists, ignoring add", id);
            return Err(CameraWallError::DuplicateIdentifier(id.to_string()));
        }

        info!("Adding stream {} ({})", id, url);
        let session = Arc::new(StreamSession::new(id, url, self.settings.clone()));
        session.attach(self.router.bind(id));

        inner.sessions.insert(id.to_string(), session.clone());
        inner.order.push(id.to_string());
        self.router.publish(ConsumerEvent::StreamAdded(id.to_string()));

        let engine = self.engine.clone();
        let started = tokio::task::spawn_blocking(move || session.start(&*engine))
            .await
            .map_err(|e| CameraWallError::Task(format!("starting {}: {}", id, e)))?;
        if let Err(err) = started {
            warn!("Stream {} did not start: {}", id, err);
        }
        Ok(())
    }

    /// Stop and forget `id`. Returns `false` when there was nothing to remove.
    ///
    /// Once this returns no frame or status for `id` reaches the consumer.
    /// The session leaves the table before the stop is awaited, so a caller
    /// that is cancelled mid-way still leaves nothing behind.
    pub async fn remove_stream(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(session) = inner.sessions.remove(id) else {
            debug!("Stream {} not registered, nothing to remove", id);
            return Ok(false);
        };

        info!("Removing stream {}", id);
        inner.order.retain(|i| i != id);
        session.detach();
        self.router.release(id);
        self.router.publish(ConsumerEvent::StreamRemoved(id.to_string()));

        tokio::task::spawn_blocking(move || session.stop())
            .await
            .map_err(|e| CameraWallError::Task(format!("stopping {}: {}", id, e)))?;
        Ok(true)
    }

    /// Change the reported grid shape. Sessions are untouched.
    pub async fn set_layout(&self, rows: i64, cols: i64) -> Result<GridLayout> {
        let layout = GridLayout::new(rows, cols).inspect_err(|_| {
            warn!("Rejecting grid layout {}x{}", rows, cols);
        })?;

        let mut inner = self.inner.write().await;
        inner.layout = layout;
        info!("Grid layout set to {}x{}", layout.rows, layout.cols);
        self.router.publish(ConsumerEvent::LayoutChanged {
            rows: layout.rows,
            cols: layout.cols,
        });
        Ok(layout)
    }

    pub async fn layout(&self) -> GridLayout {
        self.inner.read().await.layout
    }

    /// Registered ids in insertion order.
    pub async fn list(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    pub async fn state_of(&self, id: &str) -> Option<SessionState> {
        self.inner.read().await.sessions.get(id).map(|s| s.state())
    }

    pub async fn session(&self, id: &str) -> Option<Arc<StreamSession<E::Graph>>> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    pub async fn grid_state(&self) -> GridState {
        let inner = self.inner.read().await;
        GridState {
            layout: inner.layout,
            ids: inner.order.clone(),
        }
    }

    /// Remove every session, newest first.
    pub async fn shutdown(&self) {
        let ids = self.list().await;
        info!("Shutting down {} stream(s)", ids.len());
        for id in ids.iter().rev() {
            if let Err(err) = self.remove_stream(id).await {
                warn!("Failed to remove stream {} during shutdown: {}", id, err);
            }
        }
    }
}

//! The consumer context: the single place where coalesced notifications are
//! turned into frames for the display surface.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::stream::{ConsumerEvent, ConsumerEvents, DecodedFrame, FrameRouter, GridState};

/// Display surface. Only ever called from the consumer loop.
pub trait FrameConsumer {
    fn on_frame_updated(&mut self, frame: Arc<DecodedFrame>);

    fn on_state_changed(&mut self, id: &str, status: &str);

    /// The set of streams or the grid shape changed.
    fn on_grid_changed(&mut self, _grid: &GridState) {}
}

/// Drives a [`FrameConsumer`] from the router's event queue.
pub struct ConsumerLoop {
    events: ConsumerEvents,
    router: FrameRouter,
    grid: GridState,
}

impl ConsumerLoop {
    pub fn new(events: ConsumerEvents, router: FrameRouter, grid: GridState) -> Self {
        Self {
            events,
            router,
            grid,
        }
    }

    pub fn grid(&self) -> &GridState {
        &self.grid
    }

    /// Handle events until `shutdown` resolves or every router handle is gone.
    pub async fn run_until<C, F>(&mut self, consumer: &mut C, shutdown: F)
    where
        C: FrameConsumer,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(consumer, event),
                    None => break,
                },
            }
        }
        debug!("Consumer loop finished");
    }

    /// Handle whatever is queued right now. Returns the number of events.
    pub fn process_pending<C: FrameConsumer>(&mut self, consumer: &mut C) -> usize {
        let mut handled = 0;
        while let Some(event) = self.events.try_recv() {
            self.handle(consumer, event);
            handled += 1;
        }
        handled
    }

    fn handle<C: FrameConsumer>(&mut self, consumer: &mut C, event: ConsumerEvent) {
        match event {
            ConsumerEvent::FrameUpdated(id) => {
                if let Some(frame) = self.router.latest_frame(&id) {
                    consumer.on_frame_updated(frame);
                }
            }
            ConsumerEvent::StateChanged { id, status } => consumer.on_state_changed(&id, &status),
            grid_event => {
                self.grid.apply(&grid_event);
                consumer.on_grid_changed(&self.grid);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TileStatus {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub last_status: Option<String>,
}

/// Consumer without a display: keeps per-tile bookkeeping and logs it.
#[derive(Debug, Default)]
pub struct HeadlessWall {
    tiles: HashMap<String, TileStatus>,
}

impl HeadlessWall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tile(&self, id: &str) -> Option<&TileStatus> {
        self.tiles.get(id)
    }
}

impl FrameConsumer for HeadlessWall {
    fn on_frame_updated(&mut self, frame: Arc<DecodedFrame>) {
        let tile = self.tiles.entry(frame.id.clone()).or_default();
        if tile.width != frame.width || tile.height != frame.height {
            info!(
                "Stream {} frame size {}x{} ({:?})",
                frame.id, frame.width, frame.height, frame.format
            );
        }
        tile.frames += 1;
        tile.width = frame.width;
        tile.height = frame.height;
    }

    fn on_state_changed(&mut self, id: &str, status: &str) {
        info!("[{}] {}", id, status);
        self.tiles.entry(id.to_string()).or_default().last_status = Some(status.to_string());
    }

    fn on_grid_changed(&mut self, grid: &GridState) {
        self.tiles.retain(|id, _| grid.ids.contains(id));
        info!(
            "Grid {}x{} showing {}/{} stream(s)",
            grid.layout.rows,
            grid.layout.cols,
            grid.ids.len().min(grid.layout.capacity()),
            grid.ids.len()
        );
        for id in &grid.ids {
            if let Some((row, col)) = grid.cell_of(id) {
                debug!("  {} -> ({}, {})", id, row, col);
            }
        }
    }
}

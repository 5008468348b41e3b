use std::sync::Arc;

use camera_wall::{
    config::StreamDefaultConfig,
    engine::{scripted::ScriptedGraph, ScriptedEngine},
    stream::{ConsumerEvent, ConsumerEvents, FrameRouter, GridLayout, SessionRegistry},
};

/// Registry wired to a scripted engine, with the consumer side of the router.
pub struct TestFixture {
    pub engine: ScriptedEngine,
    pub registry: Arc<SessionRegistry<ScriptedEngine>>,
    pub events: ConsumerEvents,
}

impl TestFixture {
    pub fn new() -> Self {
        super::init_test_environment();

        let engine = ScriptedEngine::new();
        let (router, events) = FrameRouter::new();
        let registry = Arc::new(SessionRegistry::new(
            engine.clone(),
            router,
            GridLayout::default(),
            &StreamDefaultConfig::default(),
        ));

        Self {
            engine,
            registry,
            events,
        }
    }

    pub fn graph(&self, id: &str) -> ScriptedGraph {
        self.engine
            .graph(&format!("{}-pipeline", id))
            .unwrap_or_else(|| panic!("no graph for {}", id))
    }

    /// Events that concern `id`.
    pub fn events_for(&mut self, id: &str) -> Vec<ConsumerEvent> {
        self.events
            .drain()
            .into_iter()
            .filter(|event| event_id(event) == Some(id))
            .collect()
    }
}

pub fn event_id(event: &ConsumerEvent) -> Option<&str> {
    match event {
        ConsumerEvent::FrameUpdated(id)
        | ConsumerEvent::StateChanged { id, .. }
        | ConsumerEvent::StreamAdded(id)
        | ConsumerEvent::StreamRemoved(id) => Some(id),
        ConsumerEvent::LayoutChanged { .. } => None,
    }
}

pub fn frame_updated(id: &str) -> ConsumerEvent {
    ConsumerEvent::FrameUpdated(id.to_string())
}

pub fn state_changed(id: &str, status: &str) -> ConsumerEvent {
    ConsumerEvent::StateChanged {
        id: id.to_string(),
        status: status.to_string(),
    }
}

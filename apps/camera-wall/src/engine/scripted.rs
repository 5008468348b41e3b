//! In-process engine that builds no media at all.
//!
//! Every graph records what a session asked for (elements, links, source and
//! sink settings) and exposes hooks to play the engine's part: announce a
//! discovered port, push a frame, post a bus event. Faults can be injected per
//! element kind, per link and on the start request, which is how the session
//! and registry tests exercise their failure paths without a camera.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    ElementKind, EngineError, EventCallback, FrameCallback, FrameDescriptor, FrameSinkConfig,
    GraphEvent, GraphState, MediaEngine, MediaGraph, PixelFormat, PortCallback, PortInfo,
    SourceSettings, StateChange,
};

type SharedPortCallback = Arc<dyn Fn(PortInfo, ScriptedPort) + Send + Sync>;
type SharedFrameCallback = Arc<dyn Fn(&FrameDescriptor<'_>) + Send + Sync>;
type SharedEventCallback = Arc<dyn Fn(GraphEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct Faults {
    fail_graph: bool,
    failing_kinds: HashSet<ElementKind>,
    failing_links: usize,
    fail_start: bool,
    start_completes: bool,
    shutdown_delay: Duration,
}

#[derive(Default)]
struct EngineShared {
    faults: Mutex<Faults>,
    graphs: Mutex<Vec<ScriptedGraph>>,
    next_element: AtomicU64,
}

/// Engine whose graphs are driven by the test (or the caller) instead of media.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    shared: Arc<EngineShared>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make graph creation itself fail.
    pub fn fail_graph_creation(&self, fail: bool) {
        self.shared.faults.lock().fail_graph = fail;
    }

    /// Make every request for `kind` fail until [`ScriptedEngine::restore_element`].
    pub fn fail_element(&self, kind: ElementKind) {
        self.shared.faults.lock().failing_kinds.insert(kind);
    }

    pub fn restore_element(&self, kind: ElementKind) {
        self.shared.faults.lock().failing_kinds.remove(&kind);
    }

    /// Fail the next `count` link requests (chain or port).
    pub fn fail_next_links(&self, count: usize) {
        self.shared.faults.lock().failing_links = count;
    }

    /// Refuse the request to enter the playing state.
    pub fn fail_start(&self, fail: bool) {
        self.shared.faults.lock().fail_start = fail;
    }

    /// Make every graph shutdown block for `delay`, like a pipeline that is
    /// slow to reach null.
    pub fn slow_shutdown(&self, delay: Duration) {
        self.shared.faults.lock().shutdown_delay = delay;
    }

    /// Complete the playing request synchronously instead of asynchronously.
    pub fn start_completes_immediately(&self, complete: bool) {
        self.shared.faults.lock().start_completes = complete;
    }

    pub fn graphs(&self) -> Vec<ScriptedGraph> {
        self.shared.graphs.lock().clone()
    }

    pub fn graph(&self, name: &str) -> Option<ScriptedGraph> {
        self.shared
            .graphs
            .lock()
            .iter()
            .rev()
            .find(|g| g.name() == name)
            .cloned()
    }

    pub fn last_graph(&self) -> Option<ScriptedGraph> {
        self.shared.graphs.lock().last().cloned()
    }

    fn take_link_fault(&self) -> bool {
        let mut faults = self.shared.faults.lock();
        if faults.failing_links > 0 {
            faults.failing_links -= 1;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for ScriptedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEngine")
            .field("faults", &*self.shared.faults.lock())
            .field("graphs", &self.shared.graphs.lock().len())
            .finish()
    }
}

impl MediaEngine for ScriptedEngine {
    type Graph = ScriptedGraph;

    fn create_graph(&self, name: &str) -> Result<ScriptedGraph, EngineError> {
        if self.shared.faults.lock().fail_graph {
            return Err(EngineError::ElementCreation(format!("pipeline {}", name)));
        }

        let graph = ScriptedGraph {
            shared: Arc::new(GraphShared {
                name: name.to_string(),
                engine: self.clone(),
                record: Mutex::new(GraphRecord::default()),
                callbacks: Mutex::new(Callbacks::default()),
            }),
        };
        self.shared.graphs.lock().push(graph.clone());
        Ok(graph)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedElement {
    pub id: u64,
    pub kind: ElementKind,
    pub name: String,
}

/// A discovered output port.
#[derive(Debug, Clone)]
pub struct ScriptedPort {
    pub info: PortInfo,
}

#[derive(Debug, Default)]
struct GraphRecord {
    members: Vec<ScriptedElement>,
    removed: Vec<ScriptedElement>,
    links: Vec<(u64, u64)>,
    port_links: Vec<(String, u64)>,
    synced: Vec<u64>,
    source: Option<SourceSettings>,
    sink: Option<FrameSinkConfig>,
    playing: bool,
    shut_down: bool,
}

#[derive(Default)]
struct Callbacks {
    port: Option<SharedPortCallback>,
    frame: Option<SharedFrameCallback>,
    event: Option<SharedEventCallback>,
}

struct GraphShared {
    name: String,
    engine: ScriptedEngine,
    record: Mutex<GraphRecord>,
    callbacks: Mutex<Callbacks>,
}

#[derive(Clone)]
pub struct ScriptedGraph {
    shared: Arc<GraphShared>,
}

impl std::fmt::Debug for ScriptedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedGraph")
            .field("name", &self.shared.name)
            .field("record", &*self.shared.record.lock())
            .finish()
    }
}

impl ScriptedGraph {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Announce a newly discovered output port on the transport source.
    pub fn discover_port(&self, info: PortInfo) {
        let callback = self.shared.callbacks.lock().port.clone();
        if let Some(callback) = callback {
            callback(info.clone(), ScriptedPort { info });
        }
    }

    /// Push a solid-colour frame of the sink's requested format.
    /// Returns false when nothing is attached to the sink any more.
    pub fn push_frame(&self, width: u32, height: u32, fill: u8) -> bool {
        let format = self
            .shared
            .record
            .lock()
            .sink
            .map(|s| s.format)
            .unwrap_or(PixelFormat::Bgra);
        let stride = width as usize * format.bytes_per_pixel();
        let data = vec![fill; stride * height as usize];

        self.push_descriptor(&FrameDescriptor {
            width,
            height,
            format,
            stride,
            data: &data,
        })
    }

    pub fn push_descriptor(&self, descriptor: &FrameDescriptor<'_>) -> bool {
        let callback = self.shared.callbacks.lock().frame.clone();
        match callback {
            Some(callback) => {
                callback(descriptor);
                true
            }
            None => false,
        }
    }

    /// Post an engine event; `Playing` also marks the graph as playing.
    pub fn post(&self, event: GraphEvent) {
        if event == GraphEvent::Playing {
            let mut record = self.shared.record.lock();
            if record.shut_down {
                return;
            }
            record.playing = true;
        }

        let callback = self.shared.callbacks.lock().event.clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    /// Elements currently in the graph.
    pub fn elements(&self) -> Vec<ScriptedElement> {
        self.shared.record.lock().members.clone()
    }

    pub fn count_of(&self, kind: ElementKind) -> usize {
        self.shared
            .record
            .lock()
            .members
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn removed(&self) -> Vec<ScriptedElement> {
        self.shared.record.lock().removed.clone()
    }

    /// Element-to-element links as `(upstream kind, downstream kind)`.
    pub fn links(&self) -> Vec<(ElementKind, ElementKind)> {
        let record = self.shared.record.lock();
        let kind_of = |id: u64| {
            record
                .members
                .iter()
                .chain(record.removed.iter())
                .find(|e| e.id == id)
                .map(|e| e.kind)
        };

        record
            .links
            .iter()
            .filter_map(|(a, b)| Some((kind_of(*a)?, kind_of(*b)?)))
            .collect()
    }

    pub fn port_links(&self) -> Vec<String> {
        self.shared
            .record
            .lock()
            .port_links
            .iter()
            .map(|(port, _)| port.clone())
            .collect()
    }

    pub fn synced(&self) -> usize {
        self.shared.record.lock().synced.len()
    }

    pub fn source_settings(&self) -> Option<SourceSettings> {
        self.shared.record.lock().source.clone()
    }

    pub fn sink_config(&self) -> Option<FrameSinkConfig> {
        self.shared.record.lock().sink
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.record.lock().shut_down
    }

    fn check_member(&self, element: &ScriptedElement) -> Result<(), EngineError> {
        let record = self.shared.record.lock();
        if record.members.iter().any(|e| e.id == element.id) {
            Ok(())
        } else {
            Err(EngineError::Link(format!("{} is not in {}", element.name, self.shared.name)))
        }
    }
}

impl MediaGraph for ScriptedGraph {
    type Element = ScriptedElement;
    type Port = ScriptedPort;

    fn create_element(&self, kind: ElementKind, name: &str) -> Result<ScriptedElement, EngineError> {
        if self
            .shared
            .engine
            .shared
            .faults
            .lock()
            .failing_kinds
            .contains(&kind)
        {
            return Err(EngineError::ElementCreation(kind.factory_name().to_string()));
        }

        Ok(ScriptedElement {
            id: self.shared.engine.shared.next_element.fetch_add(1, Ordering::Relaxed),
            kind,
            name: name.to_string(),
        })
    }

    fn add(&self, elements: &[&ScriptedElement]) -> Result<(), EngineError> {
        let mut record = self.shared.record.lock();
        for element in elements {
            if record.members.iter().any(|e| e.id == element.id) {
                return Err(EngineError::Link(format!("{} added twice", element.name)));
            }
        }
        record.members.extend(elements.iter().map(|e| (*e).clone()));
        Ok(())
    }

    fn remove(&self, elements: &[&ScriptedElement]) {
        let mut record = self.shared.record.lock();
        for element in elements {
            if let Some(pos) = record.members.iter().position(|e| e.id == element.id) {
                let removed = record.members.remove(pos);
                record.removed.push(removed);
            }
        }
    }

    fn link_chain(&self, elements: &[&ScriptedElement]) -> Result<(), EngineError> {
        for element in elements {
            self.check_member(element)?;
        }
        if self.shared.engine.take_link_fault() {
            return Err(EngineError::Link("scripted link failure".to_string()));
        }

        let mut record = self.shared.record.lock();
        for pair in elements.windows(2) {
            record.links.push((pair[0].id, pair[1].id));
        }
        Ok(())
    }

    fn link_port(&self, port: &ScriptedPort, element: &ScriptedElement) -> Result<(), EngineError> {
        self.check_member(element)?;
        if self.shared.engine.take_link_fault() {
            return Err(EngineError::Link(format!("{} -> {}", port.info.name, element.name)));
        }

        let mut record = self.shared.record.lock();
        if record.port_links.iter().any(|(p, _)| *p == port.info.name) {
            return Err(EngineError::Link(format!("{} already linked", port.info.name)));
        }
        record.port_links.push((port.info.name.clone(), element.id));
        Ok(())
    }

    fn sync_with_parent(&self, element: &ScriptedElement) -> Result<(), EngineError> {
        self.check_member(element)?;
        self.shared.record.lock().synced.push(element.id);
        Ok(())
    }

    fn configure_source(
        &self,
        _source: &ScriptedElement,
        settings: &SourceSettings,
    ) -> Result<(), EngineError> {
        self.shared.record.lock().source = Some(settings.clone());
        Ok(())
    }

    fn on_dynamic_port(
        &self,
        _source: &ScriptedElement,
        callback: PortCallback<ScriptedPort>,
    ) -> Result<(), EngineError> {
        self.shared.callbacks.lock().port = Some(Arc::from(callback));
        Ok(())
    }

    fn register_frame_sink(
        &self,
        _sink: &ScriptedElement,
        config: &FrameSinkConfig,
        on_frame: FrameCallback,
    ) -> Result<(), EngineError> {
        self.shared.record.lock().sink = Some(*config);
        self.shared.callbacks.lock().frame = Some(Arc::from(on_frame));
        Ok(())
    }

    fn watch(&self, on_event: EventCallback) -> Result<(), EngineError> {
        self.shared.callbacks.lock().event = Some(Arc::from(on_event));
        Ok(())
    }

    fn set_state(&self, target: GraphState) -> Result<StateChange, EngineError> {
        match target {
            GraphState::Null => {
                self.shared.record.lock().playing = false;
                Ok(StateChange::Success)
            }
            GraphState::Playing => {
                let (fail, completes) = {
                    let faults = self.shared.engine.shared.faults.lock();
                    (faults.fail_start, faults.start_completes)
                };
                if fail {
                    return Err(EngineError::StateChange(format!(
                        "{} refused to play",
                        self.shared.name
                    )));
                }
                if completes {
                    self.shared.record.lock().playing = true;
                    Ok(StateChange::Success)
                } else {
                    Ok(StateChange::Async)
                }
            }
        }
    }

    fn is_playing(&self) -> bool {
        self.shared.record.lock().playing
    }

    fn shutdown(&self, _timeout: Duration) {
        let delay = self.shared.engine.shared.faults.lock().shutdown_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        *self.shared.callbacks.lock() = Callbacks::default();
        let mut record = self.shared.record.lock();
        record.playing = false;
        record.shut_down = true;
    }
}

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::StreamDefaultConfig;
use crate::engine::{
    ElementKind, EngineError, FrameDescriptor, FrameSinkConfig, GraphEvent, GraphState,
    MediaEngine, MediaGraph, PortInfo, SourceSettings, VideoCodec,
};
use crate::{CameraWallError, Result};

/// Lifecycle of one camera session.
///
/// `Error` absorbs everything except `stop()`; `Stopped` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Negotiating,
    Linked,
    Running,
    Error(String),
    Stopped,
}

impl SessionState {
    /// States in which the session holds a graph.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting
                | SessionState::Negotiating
                | SessionState::Linked
                | SessionState::Running
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Starting => "STARTING",
            SessionState::Negotiating => "NEGOTIATING",
            SessionState::Linked => "LINKED",
            SessionState::Running => "RUNNING",
            SessionState::Error(_) => "ERROR",
            SessionState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Error(reason) => write!(f, "ERROR ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Receiver of a session's frames and status messages. Called on engine threads.
pub trait SessionObserver: Send + Sync {
    fn on_frame(&self, frame: &FrameDescriptor<'_>);
    fn on_state_changed(&self, status: &str);
}

/// Observer attachment. Detaching waits for callbacks already running.
#[derive(Default)]
struct ObserverSlot {
    observer: RwLock<Option<Arc<dyn SessionObserver>>>,
}

impl ObserverSlot {
    fn attach(&self, observer: Arc<dyn SessionObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn detach(&self) {
        self.observer.write().take();
    }

    fn frame(&self, frame: &FrameDescriptor<'_>) {
        if let Some(observer) = self.observer.read().as_ref() {
            observer.on_frame(frame);
        }
    }

    fn status(&self, status: &str) {
        if let Some(observer) = self.observer.read().as_ref() {
            observer.on_state_changed(status);
        }
    }
}

/// Per-session media parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub latency_ms: u32,
    pub frame_sink: FrameSinkConfig,
    pub stop_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&StreamDefaultConfig::default())
    }
}

impl SessionSettings {
    pub fn source_settings(&self, location: &str) -> SourceSettings {
        SourceSettings {
            location: location.to_string(),
            latency_ms: self.latency_ms,
        }
    }
}

impl From<&StreamDefaultConfig> for SessionSettings {
    fn from(defaults: &StreamDefaultConfig) -> Self {
        Self {
            latency_ms: defaults.latency_ms,
            frame_sink: defaults.frame_sink(),
            stop_timeout: defaults.stop_timeout(),
        }
    }
}

struct SessionInner<G: MediaGraph> {
    state: SessionState,
    graph: Option<G>,
    tail_queue: Option<G::Element>,
    decode_chain: Vec<G::Element>,
    linked_codec: Option<VideoCodec>,
}

struct SessionCore<G: MediaGraph> {
    id: String,
    url: String,
    settings: SessionSettings,
    inner: Mutex<SessionInner<G>>,
    observer: ObserverSlot,
}

/// One camera connection: its graph, its negotiation and its lifecycle.
///
/// Engine callbacks only hold weak references, so dropping the session
/// (which stops it) is enough to end them.
pub struct StreamSession<G: MediaGraph> {
    core: Arc<SessionCore<G>>,
}

impl<G: MediaGraph> fmt::Debug for StreamSession<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.core.id)
            .field("url", &self.core.url)
            .field("state", &self.state())
            .finish()
    }
}

impl<G: MediaGraph> StreamSession<G> {
    pub fn new(id: &str, url: &str, settings: SessionSettings) -> Self {
        Self {
            core: Arc::new(SessionCore {
                id: id.to_string(),
                url: url.to_string(),
                settings,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Idle,
                    graph: None,
                    tail_queue: None,
                    decode_chain: Vec::new(),
                    linked_codec: None,
                }),
                observer: ObserverSlot::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn url(&self) -> &str {
        &self.core.url
    }

    pub fn state(&self) -> SessionState {
        self.core.inner.lock().state.clone()
    }

    /// Codec of the decode chain, once one has been linked.
    pub fn linked_codec(&self) -> Option<VideoCodec> {
        self.core.inner.lock().linked_codec
    }

    pub fn has_graph(&self) -> bool {
        self.core.inner.lock().graph.is_some()
    }

    pub fn attach(&self, observer: Arc<dyn SessionObserver>) {
        self.core.observer.attach(observer);
    }

    /// Stop delivering frames and status messages. Returns after any callback
    /// already in progress has finished.
    pub fn detach(&self) {
        self.core.observer.detach();
        debug!("Detached observer from stream {}", self.core.id);
    }

    /// Build the graph and request playback. Only valid from `Idle`.
    ///
    /// Construction and start failures leave the session in `Error`, with the
    /// failure reported to the observer and the graph released.
    pub fn start<E>(&self, engine: &E) -> Result<()>
    where
        E: MediaEngine<Graph = G>,
    {
        let core = &self.core;
        {
            let mut inner = core.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(CameraWallError::InvalidTransition {
                    id: core.id.clone(),
                    action: "start",
                    state: inner.state.to_string(),
                });
            }
            core.transition(&mut inner, SessionState::Starting);
        }

        info!("Starting stream {} from {}", core.id, core.url);

        let graph = match engine.create_graph(&format!("{}-pipeline", core.id)) {
            Ok(graph) => graph,
            Err(err) => return Err(core.fail_construction(None, "Failed to create pipeline", err)),
        };

        let queue = match SessionCore::assemble(core, &graph) {
            Ok(queue) => queue,
            Err(err) => {
                return Err(core.fail_construction(Some(graph), "Failed to create elements", err))
            }
        };

        {
            let mut inner = core.inner.lock();
            if inner.state != SessionState::Starting {
                // Stopped while the graph was being assembled.
                let state = inner.state.to_string();
                drop(inner);
                graph.shutdown(Duration::ZERO);
                return Err(CameraWallError::InvalidTransition {
                    id: core.id.clone(),
                    action: "start",
                    state,
                });
            }
            inner.graph = Some(graph.clone());
            inner.tail_queue = Some(queue);
        }

        match graph.set_state(GraphState::Playing) {
            Ok(change) => {
                debug!("Stream {} play request: {:?}", core.id, change);
                Ok(())
            }
            Err(err) => {
                error!("Failed to start pipeline for {}: {}", core.id, err);
                let released = {
                    let mut inner = core.inner.lock();
                    if inner.state.is_active() {
                        core.transition(
                            &mut inner,
                            SessionState::Error("Failed to start pipeline".to_string()),
                        );
                        core.take_graph(&mut inner)
                    } else {
                        None
                    }
                };
                if let Some(graph) = released {
                    graph.shutdown(core.settings.stop_timeout);
                    core.observer.status("Failed to start pipeline");
                }
                Err(err.into())
            }
        }
    }

    /// Tear the graph down and move to `Stopped`. Safe to call repeatedly.
    ///
    /// Blocks for at most the configured stop timeout while the engine
    /// settles.
    pub fn stop(&self) {
        let core = &self.core;
        let graph = {
            let mut inner = core.inner.lock();
            if inner.state == SessionState::Stopped {
                return;
            }
            core.transition(&mut inner, SessionState::Stopped);
            core.take_graph(&mut inner)
        };

        if let Some(graph) = graph {
            graph.shutdown(core.settings.stop_timeout);
        }
        info!("Stream {} stopped", core.id);
    }
}

impl<G: MediaGraph> Drop for StreamSession<G> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<G: MediaGraph> SessionCore<G> {
    fn transition(&self, inner: &mut SessionInner<G>, next: SessionState) {
        debug!("Stream {} state: {} -> {}", self.id, inner.state, next);
        inner.state = next;
    }

    fn take_graph(&self, inner: &mut SessionInner<G>) -> Option<G> {
        inner.tail_queue = None;
        inner.decode_chain.clear();
        inner.graph.take()
    }

    fn fail_construction(
        &self,
        graph: Option<G>,
        status: &str,
        err: EngineError,
    ) -> CameraWallError {
        error!("{} for {}: {}", status, self.id, err);
        if let Some(graph) = graph {
            graph.shutdown(Duration::ZERO);
        }
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Stopped {
                self.transition(&mut inner, SessionState::Error(status.to_string()));
            }
        }
        self.observer.status(status);

        CameraWallError::PipelineCreate {
            id: self.id.clone(),
            reason: format!("{}: {}", status, err),
        }
    }

    /// Create the source and the fixed tail, wire callbacks. Returns the tail
    /// queue the decode chain will feed.
    fn assemble(core: &Arc<Self>, graph: &G) -> std::result::Result<G::Element, EngineError> {
        let mut fixed = Vec::with_capacity(ElementKind::FIXED.len());
        for kind in ElementKind::FIXED {
            fixed.push(graph.create_element(kind, &format!("{}-{}", core.id, kind.role()))?);
        }
        let [source, queue, convert, sink] = &fixed[..] else {
            return Err(EngineError::ElementCreation("fixed graph".to_string()));
        };

        graph.add(&[source, queue, convert, sink])?;
        graph.link_chain(&[queue, convert, sink])?;
        graph.configure_source(source, &core.settings.source_settings(&core.url))?;

        let weak = Arc::downgrade(core);
        graph.register_frame_sink(
            sink,
            &core.settings.frame_sink,
            Box::new(move |frame| {
                if let Some(core) = weak.upgrade() {
                    core.observer.frame(frame);
                }
            }),
        )?;

        let weak: Weak<Self> = Arc::downgrade(core);
        graph.on_dynamic_port(
            source,
            Box::new(move |info, port| {
                if let Some(core) = weak.upgrade() {
                    core.negotiate(info, port);
                }
            }),
        )?;

        let weak: Weak<Self> = Arc::downgrade(core);
        graph.watch(Box::new(move |event| {
            if let Some(core) = weak.upgrade() {
                core.handle_event(event);
            }
        }))?;

        Ok(queue.clone())
    }

    /// Dynamic port discovery. The first video port with a supported encoding
    /// gets the decode chain; everything after that is ignored.
    fn negotiate(&self, info: PortInfo, port: G::Port) {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Starting => self.transition(&mut inner, SessionState::Negotiating),
            SessionState::Negotiating | SessionState::Linked | SessionState::Running => {}
            _ => return,
        }

        if inner.linked_codec.is_some() {
            debug!("Stream {} already linked, ignoring port {}", self.id, info.name);
            return;
        }

        if !info.is_video() {
            debug!(
                "Stream {} ignoring non-video port {} ({:?})",
                self.id, info.name, info.media
            );
            return;
        }

        let Some(codec) = info
            .encoding_name
            .as_deref()
            .and_then(VideoCodec::from_encoding_name)
        else {
            warn!(
                "Stream {} offers unsupported encoding {:?}",
                self.id, info.encoding_name
            );
            self.observer.status("Unsupported encoding");
            return;
        };

        let (Some(graph), Some(queue)) = (inner.graph.clone(), inner.tail_queue.clone()) else {
            return;
        };

        match self.link_decode_chain(&graph, &queue, codec, &port) {
            Ok(chain) => {
                info!("Stream {} linked {} decode chain on {}", self.id, codec, info.name);
                inner.decode_chain = chain;
                inner.linked_codec = Some(codec);
                self.transition(&mut inner, SessionState::Linked);

                if graph.is_playing() {
                    self.transition(&mut inner, SessionState::Running);
                    self.observer.status(&format!("{} -> PLAYING", self.id));
                }
            }
            Err(err) => {
                warn!("Stream {} failed to link {} chain: {}", self.id, codec, err);
                self.observer.status("Link failure");
            }
        }
    }

    fn link_decode_chain(
        &self,
        graph: &G,
        queue: &G::Element,
        codec: VideoCodec,
        port: &G::Port,
    ) -> std::result::Result<Vec<G::Element>, EngineError> {
        let mut chain = Vec::with_capacity(3);
        for kind in codec.decode_chain() {
            chain.push(graph.create_element(kind, &format!("{}-{}", self.id, kind.role()))?);
        }
        let refs: Vec<&G::Element> = chain.iter().collect();
        graph.add(&refs)?;

        let linked = (|| -> std::result::Result<(), EngineError> {
            let mut sequence = refs.clone();
            sequence.push(queue);
            graph.link_chain(&sequence)?;
            graph.link_port(port, refs[0])?;
            for element in &refs {
                graph.sync_with_parent(element)?;
            }
            Ok(())
        })();

        if let Err(err) = linked {
            graph.remove(&refs);
            return Err(err);
        }
        Ok(chain)
    }

    fn handle_event(&self, event: GraphEvent) {
        let status = match event {
            GraphEvent::Playing => {
                let mut inner = self.inner.lock();
                if inner.state == SessionState::Linked {
                    self.transition(&mut inner, SessionState::Running);
                    info!("Stream {} is playing", self.id);
                    self.observer.status(&format!("{} -> PLAYING", self.id));
                }
                return;
            }
            GraphEvent::Error(message) => format!("Error: {}", message),
            GraphEvent::EndOfStream => "End of stream".to_string(),
        };

        let graph = {
            let mut inner = self.inner.lock();
            if !inner.state.is_active() {
                return;
            }
            warn!("Stream {} failed: {}", self.id, status);
            self.transition(&mut inner, SessionState::Error(status.clone()));
            self.take_graph(&mut inner)
        };

        if let Some(graph) = graph {
            release_in_background(graph, self.settings.stop_timeout);
        }
        self.observer.status(&status);
    }
}

/// Shut a graph down without blocking an engine callback context.
fn release_in_background<G: MediaGraph>(graph: G, timeout: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || graph.shutdown(timeout));
        }
        Err(_) => graph.shutdown(timeout),
    }
}

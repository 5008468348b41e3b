use futures::stream::StreamExt;
use gst::prelude::*;
use gst_video::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    ElementKind, EngineError, EventCallback, FrameCallback, FrameDescriptor, FrameSinkConfig,
    GraphEvent, GraphState, MediaEngine, MediaGraph, PixelFormat, PortCallback, PortInfo,
    SourceSettings, StateChange,
};

/// Media engine backed by GStreamer pipelines.
#[derive(Debug, Clone, Copy)]
pub struct GstEngine {
    _private: (),
}

impl GstEngine {
    pub fn new() -> Result<Self, EngineError> {
        gst::init().map_err(|e| {
            EngineError::Unavailable(format!("GStreamer initialization failed: {}", e))
        })?;
        Ok(Self { _private: () })
    }
}

impl MediaEngine for GstEngine {
    type Graph = GstGraph;

    fn create_graph(&self, name: &str) -> Result<GstGraph, EngineError> {
        let pipeline = gst::Pipeline::builder().name(name).build();
        debug!("Created pipeline {}", name);
        Ok(GstGraph {
            pipeline,
            handles: Arc::new(Mutex::new(GraphHandles::default())),
        })
    }
}

/// Signal handlers and the bus watch task, released on shutdown.
#[derive(Default)]
struct GraphHandles {
    signals: Vec<(gst::Element, gst::glib::SignalHandlerId)>,
    bus_watch: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct GstGraph {
    pipeline: gst::Pipeline,
    handles: Arc<Mutex<GraphHandles>>,
}

impl std::fmt::Debug for GstGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GstGraph")
            .field("pipeline", &self.pipeline.name())
            .field("state", &self.pipeline.current_state())
            .finish()
    }
}

impl GstGraph {
    pub fn gst_pipeline(&self) -> &gst::Pipeline {
        &self.pipeline
    }
}

/// Read `media` and `encoding-name` from a pad's caps.
fn port_info(pad: &gst::Pad) -> PortInfo {
    let mut info = PortInfo {
        name: pad.name().to_string(),
        ..Default::default()
    };

    let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
    if let Some(structure) = caps.structure(0) {
        info.media = structure.get::<&str>("media").ok().map(str::to_string);
        info.encoding_name = structure
            .get::<&str>("encoding-name")
            .ok()
            .map(str::to_string);
    }

    info
}

/// Map a sample's first plane and hand it to `on_frame` while the mapping is alive.
fn deliver_sample(sample: &gst::Sample, on_frame: &FrameCallback) -> Result<(), String> {
    let caps = sample
        .caps()
        .ok_or_else(|| "sample without caps".to_string())?;
    let buffer = sample
        .buffer()
        .ok_or_else(|| "sample without buffer".to_string())?;
    let info = gst_video::VideoInfo::from_caps(caps).map_err(|e| e.to_string())?;

    let format = PixelFormat::from_caps_name(&info.format().to_string())
        .ok_or_else(|| format!("unsupported pixel format {}", info.format()))?;

    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
        .map_err(|e| e.to_string())?;
    let data = frame.plane_data(0).map_err(|e| e.to_string())?;
    let stride = frame.plane_stride()[0];

    on_frame(&FrameDescriptor {
        width: frame.width(),
        height: frame.height(),
        format,
        stride: stride.max(0) as usize,
        data,
    });

    Ok(())
}

impl MediaGraph for GstGraph {
    type Element = gst::Element;
    type Port = gst::Pad;

    fn create_element(&self, kind: ElementKind, name: &str) -> Result<gst::Element, EngineError> {
        gst::ElementFactory::make(kind.factory_name())
            .name(name)
            .build()
            .map_err(|e| {
                EngineError::ElementCreation(format!("{}: {}", kind.factory_name(), e))
            })
    }

    fn add(&self, elements: &[&gst::Element]) -> Result<(), EngineError> {
        self.pipeline
            .add_many(elements.iter().copied())
            .map_err(|e| {
                EngineError::Link(format!("Failed to add elements to pipeline: {}", e))
            })
    }

    fn remove(&self, elements: &[&gst::Element]) {
        for element in elements {
            let _ = element.set_state(gst::State::Null);
            if element.parent().is_some() {
                if let Err(e) = self.pipeline.remove(*element) {
                    warn!("Failed to remove {} from pipeline: {}", element.name(), e);
                }
            }
        }
    }

    fn link_chain(&self, elements: &[&gst::Element]) -> Result<(), EngineError> {
        gst::Element::link_many(elements.iter().copied())
            .map_err(|e| EngineError::Link(e.to_string()))
    }

    fn link_port(&self, port: &gst::Pad, element: &gst::Element) -> Result<(), EngineError> {
        let sink_pad = element.static_pad("sink").ok_or_else(|| {
            EngineError::Link(format!("{} has no sink pad", element.name()))
        })?;

        port.link(&sink_pad).map(|_| ()).map_err(|e| {
            EngineError::Link(format!("{} -> {}: {:?}", port.name(), element.name(), e))
        })
    }

    fn sync_with_parent(&self, element: &gst::Element) -> Result<(), EngineError> {
        element
            .sync_state_with_parent()
            .map_err(|e| EngineError::StateChange(format!("{}: {}", element.name(), e)))
    }

    fn configure_source(
        &self,
        source: &gst::Element,
        settings: &SourceSettings,
    ) -> Result<(), EngineError> {
        for property in ["location", "latency"] {
            if source.find_property(property).is_none() {
                return Err(EngineError::ElementCreation(format!(
                    "{} has no {} property",
                    source.name(),
                    property
                )));
            }
        }

        source.set_property("location", settings.location.as_str());
        source.set_property("latency", settings.latency_ms);
        Ok(())
    }

    fn on_dynamic_port(
        &self,
        source: &gst::Element,
        callback: PortCallback<gst::Pad>,
    ) -> Result<(), EngineError> {
        let handler = source.connect_pad_added(move |src, pad| {
            let info = port_info(pad);
            debug!(
                "New pad {} on {}: media={:?} encoding={:?}",
                info.name,
                src.name(),
                info.media,
                info.encoding_name
            );
            callback(info, pad.clone());
        });

        self.handles.lock().signals.push((source.clone(), handler));
        Ok(())
    }

    fn register_frame_sink(
        &self,
        sink: &gst::Element,
        config: &FrameSinkConfig,
        on_frame: FrameCallback,
    ) -> Result<(), EngineError> {
        let appsink = sink
            .clone()
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|e| {
                EngineError::ElementCreation(format!("{} is not an appsink", e.name()))
            })?;

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", config.format.caps_name())
            .build();

        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(config.max_queued_frames);
        appsink.set_drop(config.drop_oldest);
        appsink.set_property("sync", false);

        let sink_name = appsink.name().to_string();
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    if let Err(reason) = deliver_sample(&sample, &on_frame) {
                        // Undecodable samples are dropped, the next one is tried normally.
                        debug!("Dropping sample on {}: {}", sink_name, reason);
                    }
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        Ok(())
    }

    fn watch(&self, on_event: EventCallback) -> Result<(), EngineError> {
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| EngineError::Runtime("Failed to get pipeline bus".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            EngineError::Unavailable(format!("no async runtime for bus watch: {}", e))
        })?;

        let pipeline_weak = self.pipeline.downgrade();
        let name = self.pipeline.name().to_string();

        let task = runtime.spawn(async move {
            let mut messages = bus.stream();
            while let Some(msg) = messages.next().await {
                match msg.view() {
                    gst::MessageView::StateChanged(changed) => {
                        let Some(pipeline) = pipeline_weak.upgrade() else {
                            break;
                        };
                        if msg.src() == Some(pipeline.upcast_ref::<gst::Object>()) {
                            debug!(
                                "Pipeline {} state changed: {:?} -> {:?}",
                                name,
                                changed.old(),
                                changed.current()
                            );
                            if changed.current() == gst::State::Playing {
                                on_event(GraphEvent::Playing);
                            }
                        }
                    }
                    gst::MessageView::Error(err) => {
                        error!(
                            "Error from {}: {} (debug: {:?})",
                            err.src().map(|s| s.path_string()).unwrap_or_default(),
                            err.error(),
                            err.debug()
                        );
                        on_event(GraphEvent::Error(err.error().to_string()));
                    }
                    gst::MessageView::Eos(_) => {
                        info!("EOS received for pipeline {}", name);
                        on_event(GraphEvent::EndOfStream);
                    }
                    _ => {}
                }
            }
        });

        if let Some(previous) = self.handles.lock().bus_watch.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn set_state(&self, target: GraphState) -> Result<StateChange, EngineError> {
        let state = match target {
            GraphState::Null => gst::State::Null,
            GraphState::Playing => gst::State::Playing,
        };

        match self.pipeline.set_state(state) {
            Ok(gst::StateChangeSuccess::Success) => Ok(StateChange::Success),
            Ok(gst::StateChangeSuccess::Async) => Ok(StateChange::Async),
            Ok(gst::StateChangeSuccess::NoPreroll) => Ok(StateChange::NoPreroll),
            Err(err) => Err(EngineError::StateChange(format!(
                "{} -> {:?}: {:?}",
                self.pipeline.name(),
                state,
                err
            ))),
        }
    }

    fn is_playing(&self) -> bool {
        self.pipeline.current_state() == gst::State::Playing
    }

    fn shutdown(&self, timeout: Duration) {
        let (signals, bus_watch) = {
            let mut handles = self.handles.lock();
            (std::mem::take(&mut handles.signals), handles.bus_watch.take())
        };

        for (element, handler) in signals {
            element.disconnect(handler);
        }
        if let Some(task) = bus_watch {
            task.abort();
        }

        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline {}: {:?}", self.pipeline.name(), err);
        }

        let (result, current, _) = self
            .pipeline
            .state(gst::ClockTime::from_mseconds(timeout.as_millis() as u64));
        if result.is_err() || current != gst::State::Null {
            warn!(
                "Pipeline {} did not settle within {:?} (state {:?})",
                self.pipeline.name(),
                timeout,
                current
            );
        } else {
            debug!("Pipeline {} stopped", self.pipeline.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::VideoCodec;

    fn init_gst() -> bool {
        gst::init().is_ok()
    }

    fn has_factories(kinds: &[ElementKind]) -> bool {
        kinds
            .iter()
            .all(|kind| gst::ElementFactory::find(kind.factory_name()).is_some())
    }

    #[test]
    fn test_port_info_from_template_caps() {
        if !init_gst() {
            return;
        }

        let caps = gst::Caps::builder("application/x-rtp")
            .field("media", "video")
            .field("encoding-name", "H265")
            .build();
        let template = gst::PadTemplate::new(
            "recv_rtp_src_%u",
            gst::PadDirection::Src,
            gst::PadPresence::Sometimes,
            &caps,
        )
        .unwrap();
        let pad = gst::Pad::builder_from_template(&template)
            .name("recv_rtp_src_0")
            .build();

        let info = port_info(&pad);
        assert_eq!(info.name, "recv_rtp_src_0");
        assert!(info.is_video());
        assert_eq!(info.encoding_name.as_deref(), Some("H265"));
    }

    #[tokio::test]
    async fn test_fixed_tail_builds_and_stops() {
        if !init_gst() || !has_factories(&[ElementKind::Queue, ElementKind::Converter, ElementKind::FrameSink]) {
            return;
        }

        let engine = GstEngine::new().unwrap();
        let graph = engine.create_graph("test-tail").unwrap();
        let queue = graph.create_element(ElementKind::Queue, "q").unwrap();
        let convert = graph.create_element(ElementKind::Converter, "c").unwrap();
        let sink = graph.create_element(ElementKind::FrameSink, "s").unwrap();

        graph.add(&[&queue, &convert, &sink]).unwrap();
        graph.link_chain(&[&queue, &convert, &sink]).unwrap();
        graph
            .register_frame_sink(&sink, &FrameSinkConfig::default(), Box::new(|_| {}))
            .unwrap();
        graph.watch(Box::new(|_| {})).unwrap();

        assert!(!graph.is_playing());
        graph.shutdown(Duration::from_secs(1));
        assert_eq!(graph.gst_pipeline().current_state(), gst::State::Null);
    }

    #[test]
    fn test_frame_sink_requires_appsink() {
        if !init_gst() || !has_factories(&[ElementKind::Queue]) {
            return;
        }

        let engine = GstEngine::new().unwrap();
        let graph = engine.create_graph("test-not-appsink").unwrap();
        let queue = graph.create_element(ElementKind::Queue, "q").unwrap();
        let result = graph.register_frame_sink(&queue, &FrameSinkConfig::default(), Box::new(|_| {}));
        assert!(matches!(result, Err(EngineError::ElementCreation(_))));
    }

    #[test]
    fn test_unknown_factory_is_reported() {
        if !init_gst() {
            return;
        }

        let engine = GstEngine::new().unwrap();
        let graph = engine.create_graph("test-missing").unwrap();
        if gst::ElementFactory::find("avdec_h265").is_none() {
            let result = graph.create_element(ElementKind::Decoder(VideoCodec::H265), "d");
            assert!(matches!(result, Err(EngineError::ElementCreation(_))));
        }
    }
}

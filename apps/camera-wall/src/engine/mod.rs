//! Contract between stream sessions and the media pipeline engine.
//!
//! Sessions never talk to GStreamer directly. They build their graph through
//! [`MediaEngine`] / [`MediaGraph`], which keeps the negotiation state machine
//! testable with [`scripted::ScriptedEngine`] and lets [`gstreamer::GstEngine`]
//! carry the real pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod gstreamer;
pub mod scripted;

pub use self::gstreamer::GstEngine;
pub use self::scripted::ScriptedEngine;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Failed to create element: {0}")]
    ElementCreation(String),
    #[error("Failed to link elements: {0}")]
    Link(String),
    #[error("State change failed: {0}")]
    StateChange(String),
    #[error("Engine runtime error: {0}")]
    Runtime(String),
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// Video encodings a session knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub const ALL: [VideoCodec; 2] = [VideoCodec::H264, VideoCodec::H265];

    /// Map an RTP `encoding-name` to a codec.
    pub fn from_encoding_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "H264" => Some(Self::H264),
            "H265" | "HEVC" => Some(Self::H265),
            _ => None,
        }
    }

    /// Element kinds of the depacketize → parse → decode chain, in link order.
    pub fn decode_chain(self) -> [ElementKind; 3] {
        [
            ElementKind::Depayloader(self),
            ElementKind::Parser(self),
            ElementKind::Decoder(self),
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing elements a session asks the engine for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    TransportSource,
    Queue,
    Converter,
    FrameSink,
    Depayloader(VideoCodec),
    Parser(VideoCodec),
    Decoder(VideoCodec),
}

impl ElementKind {
    /// Fixed part of every session graph, in creation order.
    pub const FIXED: [ElementKind; 4] = [
        ElementKind::TransportSource,
        ElementKind::Queue,
        ElementKind::Converter,
        ElementKind::FrameSink,
    ];

    /// GStreamer factory providing this element.
    pub fn factory_name(&self) -> &'static str {
        match self {
            ElementKind::TransportSource => "rtspsrc",
            ElementKind::Queue => "queue",
            ElementKind::Converter => "videoconvert",
            ElementKind::FrameSink => "appsink",
            ElementKind::Depayloader(VideoCodec::H264) => "rtph264depay",
            ElementKind::Depayloader(VideoCodec::H265) => "rtph265depay",
            ElementKind::Parser(VideoCodec::H264) => "h264parse",
            ElementKind::Parser(VideoCodec::H265) => "h265parse",
            ElementKind::Decoder(VideoCodec::H264) => "avdec_h264",
            ElementKind::Decoder(VideoCodec::H265) => "avdec_h265",
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            ElementKind::TransportSource => "source",
            ElementKind::Queue => "queue",
            ElementKind::Converter => "convert",
            ElementKind::FrameSink => "sink",
            ElementKind::Depayloader(_) => "depay",
            ElementKind::Parser(_) => "parse",
            ElementKind::Decoder(_) => "decode",
        }
    }
}

/// Packed RGB layouts the frame sink can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    #[serde(rename = "BGRA")]
    Bgra,
    #[serde(rename = "BGRx")]
    Bgrx,
    #[serde(rename = "RGBA")]
    Rgba,
    #[serde(rename = "RGBx")]
    Rgbx,
}

impl PixelFormat {
    /// Name used in `video/x-raw` caps.
    pub fn caps_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Bgrx => "BGRx",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Rgbx => "RGBx",
        }
    }

    pub fn from_caps_name(name: &str) -> Option<Self> {
        match name {
            "BGRA" => Some(PixelFormat::Bgra),
            "BGRx" => Some(PixelFormat::Bgrx),
            "RGBA" => Some(PixelFormat::Rgba),
            "RGBx" => Some(PixelFormat::Rgbx),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        4
    }
}

/// Media parameters negotiated on a freshly discovered output port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    /// `media` field of the port caps (`video`, `audio`, ...).
    pub media: Option<String>,
    /// `encoding-name` field of the port caps (`H264`, `H265`, ...).
    pub encoding_name: Option<String>,
}

impl PortInfo {
    pub fn video(name: &str, encoding_name: &str) -> Self {
        Self {
            name: name.to_string(),
            media: Some("video".to_string()),
            encoding_name: Some(encoding_name.to_string()),
        }
    }

    pub fn audio(name: &str, encoding_name: &str) -> Self {
        Self {
            name: name.to_string(),
            media: Some("audio".to_string()),
            encoding_name: Some(encoding_name.to_string()),
        }
    }

    pub fn is_video(&self) -> bool {
        self.media.as_deref() == Some("video")
    }
}

/// Borrowed view of a decoded frame, valid only during the frame callback.
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor<'a> {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub stride: usize,
    pub data: &'a [u8],
}

/// Transport source configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    pub location: String,
    pub latency_ms: u32,
}

/// Frame sink configuration: one frame at a time, never block the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSinkConfig {
    pub max_queued_frames: u32,
    pub drop_oldest: bool,
    pub format: PixelFormat,
}

impl Default for FrameSinkConfig {
    fn default() -> Self {
        Self {
            max_queued_frames: 5,
            drop_oldest: true,
            format: PixelFormat::Bgra,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Null,
    Playing,
}

/// Outcome of a successful state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Success,
    Async,
    NoPreroll,
}

/// Asynchronous notifications posted by a running graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphEvent {
    /// The whole graph reached the playing state.
    Playing,
    Error(String),
    EndOfStream,
}

pub type PortCallback<P> = Box<dyn Fn(PortInfo, P) + Send + Sync + 'static>;
pub type FrameCallback = Box<dyn Fn(&FrameDescriptor<'_>) + Send + Sync + 'static>;
pub type EventCallback = Box<dyn Fn(GraphEvent) + Send + Sync + 'static>;

/// Factory for per-session graphs.
pub trait MediaEngine: Send + Sync + 'static {
    type Graph: MediaGraph;

    fn create_graph(&self, name: &str) -> Result<Self::Graph, EngineError>;
}

/// One session's processing graph. Handles are cheap clones of the same graph.
pub trait MediaGraph: Clone + Send + Sync + 'static {
    type Element: Clone + Send + Sync + 'static;
    type Port: Send + 'static;

    fn create_element(&self, kind: ElementKind, name: &str) -> Result<Self::Element, EngineError>;

    fn add(&self, elements: &[&Self::Element]) -> Result<(), EngineError>;

    /// Drop elements that never made it into a working chain.
    fn remove(&self, elements: &[&Self::Element]);

    /// Link elements in sequence.
    fn link_chain(&self, elements: &[&Self::Element]) -> Result<(), EngineError>;

    fn link_port(&self, port: &Self::Port, element: &Self::Element) -> Result<(), EngineError>;

    fn sync_with_parent(&self, element: &Self::Element) -> Result<(), EngineError>;

    fn configure_source(
        &self,
        source: &Self::Element,
        settings: &SourceSettings,
    ) -> Result<(), EngineError>;

    fn on_dynamic_port(
        &self,
        source: &Self::Element,
        callback: PortCallback<Self::Port>,
    ) -> Result<(), EngineError>;

    fn register_frame_sink(
        &self,
        sink: &Self::Element,
        config: &FrameSinkConfig,
        on_frame: FrameCallback,
    ) -> Result<(), EngineError>;

    fn watch(&self, on_event: EventCallback) -> Result<(), EngineError>;

    fn set_state(&self, target: GraphState) -> Result<StateChange, EngineError>;

    fn is_playing(&self) -> bool;

    /// Detach callbacks, force the graph to null and wait up to `timeout`
    /// for it to settle.
    fn shutdown(&self, timeout: Duration);
}

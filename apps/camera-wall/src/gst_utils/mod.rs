use gst::prelude::*;
use std::collections::HashMap;
use tracing::{debug, error, info};

use crate::engine::{ElementKind, VideoCodec};
use crate::{CameraWallError, Result};

/// Elements every session needs regardless of the camera's encoding.
const REQUIRED_ELEMENTS: [ElementKind; 4] = ElementKind::FIXED;

/// Represents the capabilities detected in the GStreamer installation
#[derive(Debug, Clone)]
pub struct GstCapabilities {
    pub version: String,
    pub available_elements: HashMap<String, bool>,
    pub codecs: Vec<VideoCodec>,
}

impl GstCapabilities {
    /// Check if a specific element is available
    pub fn has_element(&self, element: &str) -> bool {
        self.available_elements.get(element).copied().unwrap_or(false)
    }

    pub fn supports(&self, codec: VideoCodec) -> bool {
        self.codecs.contains(&codec)
    }

    pub fn missing_required(&self) -> Vec<&'static str> {
        REQUIRED_ELEMENTS
            .iter()
            .map(|kind| kind.factory_name())
            .filter(|name| !self.has_element(name))
            .collect()
    }
}

/// Initialize GStreamer and make sure a session graph can be built.
pub fn initialize() -> Result<GstCapabilities> {
    let capabilities = discover_plugins()?;

    let missing = capabilities.missing_required();
    if !missing.is_empty() {
        return Err(CameraWallError::Config(format!(
            "Missing required GStreamer elements: {:?}",
            missing
        )));
    }
    info!("All required elements found");

    if capabilities.codecs.is_empty() {
        return Err(CameraWallError::Config(
            "No H264 or H265 decode chain available".to_string(),
        ));
    }
    for codec in VideoCodec::ALL {
        info!(
            "  {} decoding: {}",
            codec,
            if capabilities.supports(codec) { "yes" } else { "no" }
        );
    }

    Ok(capabilities)
}

/// Initialize GStreamer and record which elements are installed.
pub fn discover_plugins() -> Result<GstCapabilities> {
    info!("Initializing GStreamer");
    gst::init().map_err(|e| {
        error!("Failed to initialize GStreamer: {}", e);
        CameraWallError::Config(format!("GStreamer initialization failed: {}", e))
    })?;

    let (major, minor, micro, nano) = gst::version();
    let version = format!("{}.{}.{}.{}", major, minor, micro, nano);
    info!("GStreamer version: {}", version);

    if let Ok(plugin_path) = std::env::var("GST_PLUGIN_PATH") {
        info!("Using custom GST_PLUGIN_PATH: {}", plugin_path);
    }

    let mut available_elements = HashMap::new();
    let chain_elements = VideoCodec::ALL.iter().flat_map(|c| c.decode_chain());
    for kind in REQUIRED_ELEMENTS.into_iter().chain(chain_elements) {
        let name = kind.factory_name();
        let found = match gst::ElementFactory::find(name) {
            Some(factory) => {
                debug!("Found element: {} (rank: {:?})", name, factory.rank());
                true
            }
            None => {
                debug!("Element not found: {}", name);
                false
            }
        };
        available_elements.insert(name.to_string(), found);
    }

    let codecs = VideoCodec::ALL
        .into_iter()
        .filter(|codec| {
            codec
                .decode_chain()
                .iter()
                .all(|kind| available_elements.get(kind.factory_name()) == Some(&true))
        })
        .collect();

    Ok(GstCapabilities {
        version,
        available_elements,
        codecs,
    })
}

/// Print detailed plugin information (for --check-plugins flag)
pub fn print_plugin_info(capabilities: &GstCapabilities) {
    println!("\nGStreamer Plugin Discovery Report");
    println!("==================================");
    println!("\nGStreamer Version: {}", capabilities.version);

    if let Ok(plugin_path) = std::env::var("GST_PLUGIN_PATH") {
        println!("Custom Plugin Path: {}", plugin_path);
    }

    println!("\nRequired Elements:");
    for kind in REQUIRED_ELEMENTS {
        print_element(capabilities, kind.factory_name());
    }

    for codec in VideoCodec::ALL {
        println!("\n{} Decode Chain:", codec);
        for kind in codec.decode_chain() {
            print_element(capabilities, kind.factory_name());
        }
    }

    println!("\nCapabilities Summary:");
    for codec in VideoCodec::ALL {
        println!(
            "  {} Decoding: {}",
            codec,
            if capabilities.supports(codec) { "Yes" } else { "No" }
        );
    }

    let registry = gst::Registry::get();
    println!("\nRegistry Statistics:");
    println!("  Total Plugins: {}", registry.plugins().len());
}

fn print_element(capabilities: &GstCapabilities, element: &str) {
    let status = if capabilities.has_element(element) {
        "✓"
    } else {
        "✗"
    };
    println!("  {} {}", status, element);
}

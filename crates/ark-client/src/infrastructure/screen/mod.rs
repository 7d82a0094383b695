//! Screen sampling through the device bridge.
//!
//! `exec-out screencap -p` streams a PNG over the bridge.  The frame is
//! downscaled so its longer side is at most `max_dimension`, converted to
//! RGB, and re-encoded as JPEG.  Decoding and encoding are CPU-bound and run
//! on the blocking pool.

use std::io::Cursor;
use std::sync::Arc;

use ark_core::domain::device::{parse_dumpsys_display, parse_wm_size};
use ark_core::{Device, Resolution};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, ImageFormat};
use thiserror::Error;
use tracing::{debug, warn};

use crate::application::automate::{DeviceMetadata, ScreenSampler};
use crate::infrastructure::device_bridge::{BridgeError, DeviceBridge};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Errors produced while capturing a frame.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// The bridge returned something that is not a PNG.
    #[error("screenshot is not a PNG ({0} bytes)")]
    NotPng(usize),

    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("encoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// [`ScreenSampler`] that captures via `screencap`.
pub struct BridgeScreenSampler {
    bridge: Arc<dyn DeviceBridge>,
    max_dimension: u32,
    jpeg_quality: u8,
}

impl BridgeScreenSampler {
    pub fn new(bridge: Arc<dyn DeviceBridge>, max_dimension: u32, jpeg_quality: u8) -> Self {
        Self {
            bridge,
            max_dimension,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    /// Captures one frame and returns it JPEG-encoded.
    pub async fn capture(&self, serial: &str) -> Result<Vec<u8>, CaptureError> {
        let png = self
            .bridge
            .run_raw(Some(serial), &["exec-out", "screencap", "-p"])
            .await?;
        if !png.starts_with(PNG_SIGNATURE) {
            return Err(CaptureError::NotPng(png.len()));
        }
        let (max_dimension, quality) = (self.max_dimension, self.jpeg_quality);
        let jpeg = tokio::task::spawn_blocking(move || reencode(&png, max_dimension, quality)).await??;
        debug!(device = serial, size = jpeg.len(), "frame captured");
        Ok(jpeg)
    }

    async fn resolution(&self, serial: &str) -> Option<Resolution> {
        if let Ok(out) = self.bridge.shell(serial, "wm size").await {
            if out.success {
                if let Some(res) = parse_wm_size(&out.stdout) {
                    return Some(res);
                }
            }
        }
        match self.bridge.shell(serial, "dumpsys display").await {
            Ok(out) if out.success => parse_dumpsys_display(&out.stdout),
            _ => None,
        }
    }
}

/// Target size for a frame whose longer side may exceed `max_dimension`.
fn scaled_size(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    let longest = width.max(height);
    if max_dimension == 0 || longest <= max_dimension {
        return (width, height);
    }
    let ratio = f64::from(max_dimension) / f64::from(longest);
    let w = (f64::from(width) * ratio) as u32;
    let h = (f64::from(height) * ratio) as u32;
    (w.max(1), h.max(1))
}

fn reencode(png: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let mut frame = image::load_from_memory_with_format(png, ImageFormat::Png)?;
    let (w, h) = scaled_size(frame.width(), frame.height(), max_dimension);
    if (w, h) != (frame.width(), frame.height()) {
        frame = frame.resize_exact(w, h, FilterType::Triangle);
    }
    let rgb = frame.to_rgb8();

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ColorType::Rgb8,
    )?;
    Ok(out.into_inner())
}

#[async_trait]
impl ScreenSampler for BridgeScreenSampler {
    async fn sample(&self, device: &Device) -> Option<Vec<u8>> {
        match self.capture(&device.serial).await {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!(device = %device.serial, error = %e, "screen capture failed");
                None
            }
        }
    }

    async fn device_info(&self, device: &Device) -> Option<DeviceMetadata> {
        let serial = device.serial.as_str();
        let Some(resolution) = self.resolution(serial).await else {
            warn!(device = serial, "resolution unavailable");
            return None;
        };
        let model = match self.bridge.shell(serial, "getprop ro.product.model").await {
            Ok(out) if out.success && !out.text().is_empty() => out.text().to_string(),
            _ => device.model.clone().unwrap_or_else(|| "unknown".to_string()),
        };
        Some(DeviceMetadata { resolution, model })
    }
}

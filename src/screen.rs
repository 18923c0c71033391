//! Screen frame source backed by the `xcap` recorder (capture feature)

#[cfg(feature = "capture")]
use crate::media::{DeviceError, EncodedFrame, FrameSource};
#[cfg(feature = "capture")]
use std::sync::mpsc::Receiver;
#[cfg(feature = "capture")]
use std::time::Duration;
#[cfg(feature = "capture")]
use tracing::info;
#[cfg(feature = "capture")]
use xcap::{Frame, Monitor, VideoRecorder};

#[cfg(feature = "capture")]
const JPEG_QUALITY: u8 = 75;
#[cfg(feature = "capture")]
const FRAME_WAIT: Duration = Duration::from_millis(500);

/// Grabs frames from the primary monitor and encodes them as JPEG.
#[cfg(feature = "capture")]
pub struct ScreenGrabber {
    _video_recorder: VideoRecorder,
    frame_rx: Receiver<Frame>,
}

#[cfg(feature = "capture")]
impl ScreenGrabber {
    pub fn new() -> Result<Self, DeviceError> {
        let monitors = Monitor::all()
            .map_err(|e| DeviceError::Unavailable(format!("screen: {}", e)))?;
        if monitors.is_empty() {
            return Err(DeviceError::Unavailable("screen: no monitors found".to_string()));
        }

        let monitor = monitors
            .iter()
            .find(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(&monitors[0])
            .clone();

        info!(
            "capturing monitor: {} ({}x{})",
            monitor.name().unwrap_or_else(|_| "unknown".to_string()),
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0),
        );

        let (video_recorder, frame_rx) = monitor
            .video_recorder()
            .map_err(|e| DeviceError::Unavailable(format!("screen: {}", e)))?;
        video_recorder
            .start()
            .map_err(|e| DeviceError::Unavailable(format!("screen: {}", e)))?;

        Ok(Self {
            _video_recorder: video_recorder,
            frame_rx,
        })
    }

    fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, DeviceError> {
        let rgba = image::RgbaImage::from_raw(frame.width, frame.height, frame.raw.clone())
            .ok_or_else(|| DeviceError::Read("screen: bad frame buffer".to_string()))?;
        let rgb = image::DynamicImage::ImageRgba8(rgba).to_rgb8();

        let mut jpeg = Vec::new();
        let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
        encoder
            .encode(
                rgb.as_raw(),
                frame.width,
                frame.height,
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|e| DeviceError::Read(format!("screen: jpeg encode: {}", e)))?;
        Ok(jpeg)
    }
}

#[cfg(feature = "capture")]
impl FrameSource for ScreenGrabber {
    fn capture(&mut self) -> Result<EncodedFrame, DeviceError> {
        let frame = self
            .frame_rx
            .recv_timeout(FRAME_WAIT)
            .map_err(|e| DeviceError::Read(format!("screen: {}", e)))?;
        Ok(EncodedFrame {
            data: Self::encode_jpeg(&frame)?,
            mime_type: "image/jpeg",
        })
    }
}

#[cfg(not(feature = "capture"))]
pub struct ScreenGrabber;

#[cfg(not(feature = "capture"))]
impl ScreenGrabber {
    pub fn new() -> Result<Self, crate::media::DeviceError> {
        Err(crate::media::DeviceError::Unavailable(
            "screen capture feature not enabled".to_string(),
        ))
    }
}

#[cfg(not(feature = "capture"))]
impl crate::media::FrameSource for ScreenGrabber {
    fn capture(&mut self) -> Result<crate::media::EncodedFrame, crate::media::DeviceError> {
        Err(crate::media::DeviceError::Unavailable(
            "screen capture feature not enabled".to_string(),
        ))
    }
}

//! Device trait seams for the pipeline
//!
//! The pipeline only sees blocking byte-stream handles: an audio source
//! it reads fixed-size PCM frames from, an audio sink it writes playback
//! bytes to, and a frame source yielding encoded images. Concrete
//! PulseAudio and screen/camera implementations live in `audio`,
//! `screen` and `camera`; tests substitute mocks at these seams.

use crate::events::VideoMode;

/// Error raised by an audio or video device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device unavailable: {0}")]
    Unavailable(String),

    #[error("device read failed: {0}")]
    Read(String),

    #[error("device write failed: {0}")]
    Write(String),
}

/// Blocking audio input (microphone). `read` fills the whole buffer.
pub trait AudioSource: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError>;
}

/// Blocking audio output (speaker). `write` consumes the whole buffer.
pub trait AudioSink: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError>;
}

/// An encoded image frame ready to forward upstream.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
}

/// Blocking frame producer (camera or screen).
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<EncodedFrame, DeviceError>;
}

/// Factory for the physical devices a session needs. The controller
/// opens devices through this seam so tests can inject mocks.
pub trait MediaDevices: Send + Sync {
    fn open_microphone(&self) -> Result<Box<dyn AudioSource>, DeviceError>;
    fn open_speaker(&self) -> Result<Box<dyn AudioSink>, DeviceError>;
    fn open_frame_source(&self, mode: VideoMode) -> Result<Box<dyn FrameSource>, DeviceError>;
}

/// Default factory backed by PulseAudio and the platform capture stack.
pub struct SystemDevices {
    app_name: String,
}

impl SystemDevices {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }
}

impl MediaDevices for SystemDevices {
    fn open_microphone(&self) -> Result<Box<dyn AudioSource>, DeviceError> {
        Ok(Box::new(crate::audio::Microphone::open(&self.app_name)?))
    }

    fn open_speaker(&self) -> Result<Box<dyn AudioSink>, DeviceError> {
        Ok(Box::new(crate::audio::Speaker::open(&self.app_name)?))
    }

    fn open_frame_source(&self, mode: VideoMode) -> Result<Box<dyn FrameSource>, DeviceError> {
        match mode {
            VideoMode::Screen => Ok(Box::new(crate::screen::ScreenGrabber::new()?)),
            VideoMode::Camera => Ok(Box::new(crate::camera::CameraGrabber::new()?)),
            VideoMode::None => Err(DeviceError::Unavailable(
                "no frame source for video mode 'none'".to_string(),
            )),
        }
    }
}

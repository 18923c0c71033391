//! PulseAudio-backed audio devices
//!
//! Microphone capture is 16-bit little-endian PCM at 16 kHz mono, the
//! format the remote expects for realtime input. Playback runs at 24 kHz
//! mono, the rate the remote synthesizes at. Both use PulseAudio's
//! simple blocking API; the pipeline offloads every read/write to a
//! blocking worker so the scheduler is never stalled.

use crate::events::{RECEIVE_SAMPLE_RATE, SEND_SAMPLE_RATE};
use crate::media::{AudioSink, AudioSource, DeviceError};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use tracing::info;

fn record_spec() -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate: SEND_SAMPLE_RATE,
    }
}

fn playback_spec() -> Spec {
    Spec {
        format: Format::S16le,
        channels: 1,
        rate: RECEIVE_SAMPLE_RATE,
    }
}

/// Captures microphone audio from the default PulseAudio source.
pub struct Microphone {
    simple: Simple,
    device_name: Option<String>,
}

impl Microphone {
    /// Open the default input device.
    pub fn open(app_name: &str) -> Result<Self, DeviceError> {
        Self::connect(app_name, None)
    }

    /// Open a specific input device by PulseAudio source name.
    pub fn open_device(app_name: &str, device_name: &str) -> Result<Self, DeviceError> {
        info!("opening microphone device: {}", device_name);
        Self::connect(app_name, Some(device_name))
    }

    fn connect(app_name: &str, device_name: Option<&str>) -> Result<Self, DeviceError> {
        let simple = Simple::new(
            None, // default server
            app_name,
            Direction::Record,
            device_name,
            "capture",
            &record_spec(),
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| DeviceError::Unavailable(format!("microphone: {}", e)))?;

        Ok(Self {
            simple,
            device_name: device_name.map(|s| s.to_string()),
        })
    }

    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }
}

impl AudioSource for Microphone {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.simple
            .read(buf)
            .map_err(|e| DeviceError::Read(format!("microphone: {}", e)))
    }
}

/// Writes synthesized audio to the default PulseAudio sink.
pub struct Speaker {
    simple: Simple,
}

impl Speaker {
    pub fn open(app_name: &str) -> Result<Self, DeviceError> {
        let simple = Simple::new(
            None,
            app_name,
            Direction::Playback,
            None,
            "playback",
            &playback_spec(),
            None,
            None,
        )
        .map_err(|e| DeviceError::Unavailable(format!("speaker: {}", e)))?;

        Ok(Self { simple })
    }
}

impl AudioSink for Speaker {
    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.simple
            .write(data)
            .map_err(|e| DeviceError::Write(format!("speaker: {}", e)))
    }
}

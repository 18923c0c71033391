//! Shared event and payload types passed between pipeline stages

use std::fmt;

/// Sample rate of microphone input sent upstream (Hz).
pub const SEND_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized audio received from the remote (Hz).
pub const RECEIVE_SAMPLE_RATE: u32 = 24_000;
/// Samples per microphone read (16-bit mono, so 2048 bytes per chunk).
pub const CHUNK_SAMPLES: usize = 1024;

/// A discrete unit of media moving through the pipeline.
///
/// Chunks are moved, never shared: a producer hands the chunk to a queue
/// and the consumer takes ownership out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaChunk {
    /// Raw PCM audio frame (16-bit little-endian mono).
    Audio { pcm: Vec<u8>, sample_rate: u32 },
    /// Encoded image frame (JPEG in practice).
    Image { data: Vec<u8>, mime_type: String },
}

impl MediaChunk {
    pub fn audio(pcm: Vec<u8>) -> Self {
        Self::Audio {
            pcm,
            sample_rate: SEND_SAMPLE_RATE,
        }
    }

    pub fn jpeg(data: Vec<u8>) -> Self {
        Self::Image {
            data,
            mime_type: "image/jpeg".to_string(),
        }
    }
}

/// Video capture mode for a session. Camera and screen are mutually
/// exclusive; the mode is fixed at session start.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    #[default]
    None,
    Camera,
    Screen,
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoMode::None => write!(f, "none"),
            VideoMode::Camera => write!(f, "camera"),
            VideoMode::Screen => write!(f, "screen"),
        }
    }
}

/// Transcription text reported by the remote for the current turn.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub is_final: bool,
}

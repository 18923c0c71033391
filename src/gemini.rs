//! Gemini Live API session
//!
//! Implements the remote seam over a WebSocket: the stream is split so
//! sends and receives run concurrently, a reader task parses server
//! messages into typed events, and the writer half sits behind a lock
//! shared by whoever sends.

use crate::events::{MediaChunk, Transcript};
use crate::remote::{RemoteConnector, RemoteError, RemoteSession, ServerEvent};
use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

type WsSink = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Configuration for the Live API session.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub url: String,
    pub model: String,
    pub system_instruction: Option<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: None,
        }
    }
}

impl GeminiConfig {
    /// Build a config pointing at the BidiGenerateContent endpoint.
    pub fn from_api_key(api_key: &str) -> Self {
        Self {
            url: format!(
                "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
                api_key
            ),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_system_instruction(mut self, instruction: &str) -> Self {
        self.system_instruction = Some(instruction.to_string());
        self
    }
}

/// Generation settings sent in the setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

/// Session setup message payload.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

/// A chunk of realtime input (audio or video frame).
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaBlob>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub data: String,
    pub mime_type: String,
}

/// Server -> client messages.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
}

/// Inbound messages as seen by the reader task. Setup acknowledgment is
/// consumed during connect and never reaches the pipeline.
#[derive(Debug)]
enum RawInbound {
    SetupComplete,
    Event(ServerEvent),
}

fn classify_ws_error(e: &WsError) -> RemoteError {
    match e {
        WsError::Io(io) if matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            RemoteError::Transient(io.to_string())
        }
        WsError::ConnectionClosed | WsError::AlreadyClosed => RemoteError::Closed,
        other => RemoteError::Protocol(other.to_string()),
    }
}

/// Parse one server text frame into the inbound events it carries.
fn parse_server_message(text: &str) -> Result<Vec<RawInbound>, RemoteError> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| RemoteError::Protocol(format!("bad server message: {}", e)))?;

    let mut events = Vec::new();
    match message {
        ServerMessage::SetupComplete { .. } => events.push(RawInbound::SetupComplete),
        ServerMessage::GoAway { .. } => events.push(RawInbound::Event(ServerEvent::GoAway)),
        ServerMessage::ServerContent { server_content } => {
            if let Some(transcription) = server_content.get("outputTranscription") {
                let text = transcription
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default();
                if !text.is_empty() {
                    let is_final = transcription
                        .get("isFinal")
                        .and_then(|f| f.as_bool())
                        .unwrap_or(false);
                    events.push(RawInbound::Event(ServerEvent::Transcription(Transcript {
                        text: text.to_string(),
                        is_final,
                    })));
                }
            }

            if let Some(parts) = server_content
                .get("modelTurn")
                .and_then(|turn| turn.get("parts"))
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    let Some(data) = part
                        .get("inlineData")
                        .and_then(|d| d.get("data"))
                        .and_then(|d| d.as_str())
                    else {
                        continue;
                    };
                    match general_purpose::STANDARD.decode(data) {
                        Ok(pcm) if !pcm.is_empty() => {
                            events.push(RawInbound::Event(ServerEvent::Audio(pcm)));
                        }
                        Ok(_) => {}
                        Err(e) => warn!("undecodable audio payload: {}", e),
                    }
                }
            }

            let turn_done = server_content
                .get("turnComplete")
                .or_else(|| server_content.get("generationComplete"))
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if turn_done {
                events.push(RawInbound::Event(ServerEvent::TurnComplete));
            }
        }
    }
    Ok(events)
}

/// Reader half: pump WebSocket frames into the inbound channel.
async fn run_reader(mut stream: WsSource, tx: mpsc::Sender<Result<RawInbound, RemoteError>>) {
    while let Some(next) = stream.next().await {
        match next {
            Ok(Message::Text(text)) => {
                debug!("server frame: {}", text);
                // Unknown message kinds are skipped, not fatal: the
                // session must survive protocol additions it does not
                // understand.
                match parse_server_message(&text) {
                    Ok(events) => {
                        for event in events {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("skipping unparseable server frame: {}", e),
                }
            }
            // The Live API also delivers JSON payloads as binary frames.
            Ok(Message::Binary(bytes)) => {
                if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                    match parse_server_message(&text) {
                        Ok(events) => {
                            for event in events {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!("skipping unparseable server frame: {}", e),
                    }
                } else {
                    debug!("ignoring non-UTF-8 binary frame ({} bytes)", bytes.len());
                }
            }
            Ok(Message::Close(frame)) => {
                info!("server closed the stream: {:?}", frame);
                let _ = tx.send(Err(RemoteError::Closed)).await;
                return;
            }
            Ok(_) => {} // ping/pong
            Err(e) => {
                let mapped = classify_ws_error(&e);
                error!("websocket receive error: {}", e);
                if tx.send(Err(mapped)).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// A connected Live API session.
pub struct GeminiSession {
    writer: WsSink,
    inbound: Mutex<mpsc::Receiver<Result<RawInbound, RemoteError>>>,
    _reader: JoinHandle<()>,
}

impl GeminiSession {
    async fn send_json(&self, json: serde_json::Value) -> Result<(), RemoteError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(json.to_string().into()))
            .await
            .map_err(|e| classify_ws_error(&e))
    }
}

#[async_trait]
impl RemoteSession for GeminiSession {
    async fn send(&self, chunk: MediaChunk) -> Result<(), RemoteError> {
        let input = match chunk {
            MediaChunk::Audio { pcm, sample_rate } => RealtimeInput {
                audio: Some(MediaBlob {
                    data: general_purpose::STANDARD.encode(&pcm),
                    mime_type: format!("audio/pcm;rate={}", sample_rate),
                }),
                video: None,
            },
            MediaChunk::Image { data, mime_type } => RealtimeInput {
                audio: None,
                video: Some(MediaBlob {
                    data: general_purpose::STANDARD.encode(&data),
                    mime_type,
                }),
            },
        };
        self.send_json(serde_json::json!({ "realtimeInput": input }))
            .await
    }

    async fn receive(&self) -> Option<Result<ServerEvent, RemoteError>> {
        let mut inbound = self.inbound.lock().await;
        loop {
            match inbound.recv().await {
                Some(Ok(RawInbound::Event(event))) => return Some(Ok(event)),
                Some(Ok(RawInbound::SetupComplete)) => continue,
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(Message::Close(None)).await {
            debug!("close frame not delivered: {}", e);
        }
    }
}

/// Connector performing one handshake + setup exchange per call.
pub struct GeminiConnector {
    config: GeminiConfig,
}

impl GeminiConnector {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    fn setup_message(&self) -> serde_json::Value {
        let setup = SessionSetup {
            model: self.config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: None,
            }),
            system_instruction: self.config.system_instruction.as_ref().map(|text| {
                serde_json::json!({ "parts": [{ "text": text }], "role": "user" })
            }),
            output_audio_transcription: Some(serde_json::json!({})),
        };
        serde_json::json!({ "setup": setup })
    }
}

#[async_trait]
impl RemoteConnector for GeminiConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>, RemoteError> {
        info!("connecting to Live API");
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.config.url))
            .await
            .map_err(|_| RemoteError::Connect("handshake timed out".to_string()))?;
        let (ws_stream, response) =
            connected.map_err(|e| RemoteError::Connect(e.to_string()))?;
        debug!("websocket handshake response: {:?}", response);

        let (sink, stream) = ws_stream.split();
        let writer: WsSink = Arc::new(Mutex::new(sink));
        let (tx, rx) = mpsc::channel(100);
        let reader = tokio::spawn(run_reader(stream, tx));

        let session = GeminiSession {
            writer,
            inbound: Mutex::new(rx),
            _reader: reader,
        };

        session
            .send_json(self.setup_message())
            .await
            .map_err(|e| RemoteError::Connect(format!("setup send failed: {}", e)))?;

        // Wait for the acknowledgment before handing the session over.
        let setup = tokio::time::timeout(SETUP_TIMEOUT, async {
            let mut inbound = session.inbound.lock().await;
            loop {
                match inbound.recv().await {
                    Some(Ok(RawInbound::SetupComplete)) => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e),
                    None => return Err(RemoteError::Closed),
                }
            }
        })
        .await;

        match setup {
            Ok(Ok(())) => {
                info!("Live API session established");
                Ok(Arc::new(session))
            }
            Ok(Err(e)) => Err(RemoteError::Connect(format!("setup failed: {}", e))),
            Err(_) => Err(RemoteError::Connect("setup acknowledgment timed out".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_message_shape() {
        let config = GeminiConfig::from_api_key("test-key")
            .with_system_instruction("You are a concise realtime assistant.");
        let connector = GeminiConnector::new(config);
        let json = connector.setup_message();

        assert_eq!(json["setup"]["model"], DEFAULT_MODEL);
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            json["setup"]["systemInstruction"]["parts"][0]["text"],
            "You are a concise realtime assistant."
        );
        assert!(json["setup"]["outputAudioTranscription"].is_object());
    }

    #[test]
    fn realtime_input_serialization() {
        let input = RealtimeInput {
            audio: Some(MediaBlob {
                data: "base64data".to_string(),
                mime_type: "audio/pcm;rate=16000".to_string(),
            }),
            video: None,
        };
        let json = serde_json::json!({ "realtimeInput": input });

        assert_eq!(json["realtimeInput"]["audio"]["data"], "base64data");
        assert_eq!(json["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
        assert!(json["realtimeInput"].get("video").is_none());
    }

    #[test]
    fn parses_audio_and_turn_complete() {
        let pcm = vec![1u8, 2, 3, 4];
        let message = serde_json::json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [{
                        "inlineData": {
                            "mimeType": "audio/pcm;rate=24000",
                            "data": general_purpose::STANDARD.encode(&pcm),
                        }
                    }]
                },
                "turnComplete": true
            }
        })
        .to_string();

        let events = parse_server_message(&message).unwrap();
        assert_eq!(events.len(), 2);
        match &events[0] {
            RawInbound::Event(ServerEvent::Audio(data)) => assert_eq!(data, &pcm),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            events[1],
            RawInbound::Event(ServerEvent::TurnComplete)
        ));
    }

    #[test]
    fn parses_transcription() {
        let message = serde_json::json!({
            "serverContent": {
                "outputTranscription": { "text": "hello there", "isFinal": true }
            }
        })
        .to_string();

        let events = parse_server_message(&message).unwrap();
        match &events[0] {
            RawInbound::Event(ServerEvent::Transcription(t)) => {
                assert_eq!(t.text, "hello there");
                assert!(t.is_final);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_setup_complete_and_go_away() {
        let events = parse_server_message(&serde_json::json!({"setupComplete": {}}).to_string())
            .unwrap();
        assert!(matches!(events[0], RawInbound::SetupComplete));

        let events = parse_server_message(
            &serde_json::json!({"goAway": {"timeLeft": "10s"}}).to_string(),
        )
        .unwrap();
        assert!(matches!(events[0], RawInbound::Event(ServerEvent::GoAway)));
    }

    #[test]
    fn timeout_io_errors_classify_as_transient() {
        let e = WsError::Io(std::io::Error::new(ErrorKind::TimedOut, "read timed out"));
        assert!(classify_ws_error(&e).is_transient());

        let e = WsError::ConnectionClosed;
        assert!(matches!(classify_ws_error(&e), RemoteError::Closed));
    }
}

//! Session link — WebSocket client for the remote voice model.
//!
//! [`LiveLink`] maintains one bidirectional streaming session: outbound
//! microphone audio is encoded to the link's wire format and sent through a
//! latest-wins slot (live audio favors low latency over completeness), and
//! inbound frames are decoded into [`LinkEvent`]s for the engine loop.
//!
//! There is no reconnection in this layer: a failure during `open` is a
//! single terminal error, and a failure after establishment surfaces once as
//! an `Error` event, after which the link is dead and the caller must open a
//! new one.

use crate::config::LinkConfig;
use crate::error::{Result, SessionError};
use crate::session::messages::InboundAudio;
use crate::tools::{ToolDeclaration, ToolInvocation};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Audio format advertised at setup and attached to inbound chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub encoding: String,
    pub channels: u16,
}

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Setup {
        session_id: String,
        system_instruction: String,
        tools: Vec<ToolDeclaration>,
        audio: AudioFormat,
        #[serde(skip_serializing_if = "Option::is_none")]
        voice: Option<String>,
    },
    Audio {
        data: String,
        mime_type: String,
    },
    ToolResult {
        id: String,
        name: String,
        result: String,
    },
}

fn default_inbound_rate() -> u32 {
    24_000
}

fn default_inbound_channels() -> u16 {
    1
}

/// Messages received from the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Ready {
        #[serde(default)]
        session_id: String,
    },
    Audio {
        data: String,
        #[serde(default = "default_inbound_rate")]
        sample_rate: u32,
        #[serde(default = "default_inbound_channels")]
        channels: u16,
    },
    ToolCall {
        calls: Vec<ToolInvocation>,
    },
    Transcript {
        text: String,
    },
    Interrupted {},
    Error {
        #[serde(default)]
        message: String,
    },
}

/// Inbound events surfaced to the engine loop.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The remote acknowledged the setup; the session is live.
    Ready,
    /// Decoded audio ready for playback scheduling.
    Audio(InboundAudio),
    /// One or more invocations, each requiring exactly one result back.
    ToolCalls(Vec<ToolInvocation>),
    /// Text fragment for display.
    Transcript(String),
    /// The remote detected the user cutting off its speech.
    Interrupted,
    /// The remote closed the session.
    Closed,
    /// Mid-session failure; the link is dead.
    Error(String),
}

// ---------------------------------------------------------------------------
// Outbound audio slot
// ---------------------------------------------------------------------------

/// Latest-wins slot for outbound audio frames.
///
/// The capture tick must never block on the network; when the writer falls
/// behind, the newest frame replaces the unsent older one.
#[derive(Default)]
struct OutboundSlot {
    frame: Mutex<Option<String>>,
    notify: Notify,
}

impl OutboundSlot {
    fn offer(&self, json: String) {
        match self.frame.lock() {
            Ok(mut slot) => *slot = Some(json),
            Err(p) => *p.into_inner() = Some(json),
        }
        self.notify.notify_one();
    }

    fn take(&self) -> Option<String> {
        match self.frame.lock() {
            Ok(mut slot) => slot.take(),
            Err(p) => p.into_inner().take(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tool result bookkeeping
// ---------------------------------------------------------------------------

/// Tracks outstanding tool-call ids so each receives at most one result.
#[derive(Debug, Default)]
struct ToolResultLedger {
    outstanding: HashSet<String>,
}

impl ToolResultLedger {
    fn register(&mut self, id: &str) {
        self.outstanding.insert(id.to_owned());
    }

    /// Claim an id for a result send. Returns false when the id is not
    /// outstanding (already answered, or never issued).
    fn claim(&mut self, id: &str) -> bool {
        self.outstanding.remove(id)
    }
}

// ---------------------------------------------------------------------------
// LiveLink
// ---------------------------------------------------------------------------

/// Options assembled by the caller at open time.
///
/// The system instruction is an opaque string owned by the prompt/voice
/// calibration layer; the link does not interpret it.
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    pub system_instruction: String,
    pub tools: Vec<ToolDeclaration>,
}

/// One bidirectional streaming session with the remote voice model.
pub struct LiveLink {
    sample_rate: u32,
    mime_type: String,
    outbound: Arc<OutboundSlot>,
    ctl_tx: mpsc::UnboundedSender<String>,
    ledger: Arc<Mutex<ToolResultLedger>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl LiveLink {
    /// Establish the session and send the setup message.
    ///
    /// Inbound events are delivered on `event_tx`. Connection failures are a
    /// single terminal error; retrying is the caller's policy.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ConnectionFailed`] if the URL is invalid or
    /// the connection/setup handshake fails.
    pub async fn open(
        config: &LinkConfig,
        options: LinkOptions,
        event_tx: mpsc::Sender<LinkEvent>,
    ) -> Result<Self> {
        use futures_util::SinkExt;
        use tokio_tungstenite::{connect_async, tungstenite::Message};

        let url = url::Url::parse(&config.url)
            .map_err(|e| SessionError::ConnectionFailed(format!("invalid link url: {e}")))?;

        let (mut ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::ConnectionFailed(format!("connect: {e}")))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let setup = ClientMessage::Setup {
            session_id: session_id.clone(),
            system_instruction: options.system_instruction,
            tools: options.tools,
            audio: AudioFormat {
                sample_rate: config.sample_rate,
                encoding: "pcm16le".into(),
                channels: 1,
            },
            voice: config.voice.clone(),
        };
        let json = serde_json::to_string(&setup)
            .map_err(|e| SessionError::ConnectionFailed(format!("encode setup: {e}")))?;
        ws_stream
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::ConnectionFailed(format!("send setup: {e}")))?;

        info!("link established (session {session_id})");

        let outbound = Arc::new(OutboundSlot::default());
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel::<String>();
        let ledger = Arc::new(Mutex::new(ToolResultLedger::default()));
        let cancel = CancellationToken::new();

        {
            let outbound = Arc::clone(&outbound);
            let ledger = Arc::clone(&ledger);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                socket_loop(ws_stream, outbound, ctl_rx, ledger, event_tx, cancel).await;
            });
        }

        Ok(Self {
            sample_rate: config.sample_rate,
            mime_type: config.mime_type.clone(),
            outbound,
            ctl_tx,
            ledger,
            cancel,
            closed: AtomicBool::new(false),
        })
    }

    /// Encode a frame to the wire format and offer it for transmission.
    ///
    /// Resamples from `src_rate` to the link rate, converts to PCM16LE, and
    /// places the packet in the latest-wins slot. Never blocks.
    pub fn send_audio(&self, samples: &[f32], src_rate: u32) {
        use crate::audio::dsp;

        let resampled = dsp::resample(samples, src_rate, self.sample_rate);
        let pcm = dsp::encode_pcm16le(&resampled);
        let msg = ClientMessage::Audio {
            data: BASE64.encode(pcm),
            mime_type: self.mime_type.clone(),
        };
        if let Ok(json) = serde_json::to_string(&msg) {
            self.outbound.offer(json);
        }
    }

    /// Relay one tool result back to the remote.
    ///
    /// Each outstanding invocation id accepts exactly one result; a result
    /// for an unknown id is logged and dropped rather than raised.
    pub fn send_tool_result(&self, id: &str, name: &str, result: &str) {
        let claimed = match self.ledger.lock() {
            Ok(mut ledger) => ledger.claim(id),
            Err(p) => p.into_inner().claim(id),
        };
        if !claimed {
            warn!("{}", SessionError::UnknownToolResultTarget(id.to_owned()));
            return;
        }

        let msg = ClientMessage::ToolResult {
            id: id.to_owned(),
            name: name.to_owned(),
            result: result.to_owned(),
        };
        if let Ok(json) = serde_json::to_string(&msg) {
            // If the socket task is gone the link is dead — ignore.
            let _ = self.ctl_tx.send(json);
        }
    }

    /// Terminate the session and release transport resources.
    ///
    /// Safe to call multiple times.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            info!("link closed");
        }
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn socket_loop(
    ws_stream: WsStream,
    outbound: Arc<OutboundSlot>,
    mut ctl_rx: mpsc::UnboundedReceiver<String>,
    ledger: Arc<Mutex<ToolResultLedger>>,
    event_tx: mpsc::Sender<LinkEvent>,
    cancel: CancellationToken,
) {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            // Inbound from the remote model.
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = map_server_message(&text, &ledger) {
                            let terminal = matches!(event, LinkEvent::Closed | LinkEvent::Error(_));
                            if event_tx.send(event).await.is_err() || terminal {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = event_tx.send(LinkEvent::Closed).await;
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = event_tx.send(LinkEvent::Error(format!("read error: {e}"))).await;
                        break;
                    }
                    _ => {} // Binary, Ping/Pong frames handled by tungstenite.
                }
            }
            // Latest outbound audio frame.
            () = outbound.notify.notified() => {
                while let Some(json) = outbound.take() {
                    if let Err(e) = write.send(Message::Text(json)).await {
                        let _ = event_tx.send(LinkEvent::Error(format!("send error: {e}"))).await;
                        return;
                    }
                }
            }
            // Reliable control messages (tool results).
            ctl = ctl_rx.recv() => {
                match ctl {
                    Some(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            let _ = event_tx.send(LinkEvent::Error(format!("send error: {e}"))).await;
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

/// Parse one server message into a link event.
///
/// Malformed audio payloads are dropped (the session continues); wholly
/// unparseable messages are ignored with a debug log.
fn map_server_message(
    text: &str,
    ledger: &Arc<Mutex<ToolResultLedger>>,
) -> Option<LinkEvent> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("ignoring unparseable server message: {e}");
            return None;
        }
    };

    match msg {
        ServerMessage::Ready { session_id } => {
            info!("remote session ready: {session_id}");
            Some(LinkEvent::Ready)
        }
        ServerMessage::Audio {
            data,
            sample_rate,
            channels,
        } => match decode_audio_payload(&data, sample_rate, channels) {
            Ok(audio) => Some(LinkEvent::Audio(audio)),
            Err(e) => {
                // Losing one chunk is less harmful than killing the session.
                warn!("dropping inbound audio chunk: {e}");
                None
            }
        },
        ServerMessage::ToolCall { calls } => {
            if calls.is_empty() {
                return None;
            }
            match ledger.lock() {
                Ok(mut ledger) => {
                    for call in &calls {
                        ledger.register(&call.id);
                    }
                }
                Err(p) => {
                    let mut ledger = p.into_inner();
                    for call in &calls {
                        ledger.register(&call.id);
                    }
                }
            }
            Some(LinkEvent::ToolCalls(calls))
        }
        ServerMessage::Transcript { text } => Some(LinkEvent::Transcript(text)),
        ServerMessage::Interrupted {} => Some(LinkEvent::Interrupted),
        ServerMessage::Error { message } => Some(LinkEvent::Error(message)),
    }
}

/// Decode a base64 PCM16 payload into playable samples.
fn decode_audio_payload(data: &str, sample_rate: u32, channels: u16) -> Result<InboundAudio> {
    let bytes = BASE64
        .decode(data)
        .map_err(|e| SessionError::Decode(format!("bad base64 audio payload: {e}")))?;
    let samples = crate::audio::dsp::decode_pcm16le(&bytes)?;
    if sample_rate == 0 {
        return Err(SessionError::Decode("audio chunk declares 0Hz".into()));
    }
    Ok(InboundAudio {
        samples,
        sample_rate,
        channels: channels.max(1),
    })
}

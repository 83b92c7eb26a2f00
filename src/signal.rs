use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Shared topic carrying availability announcements to every client.
pub const AVAILABILITY: &str = "campus/availability";

/// Personal topic for signaling addressed to a single user.
pub fn personal(user: &str) -> String {
    format!("user/{user}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sdp {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// A connectivity candidate relayed between the two ends of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvailabilityAction {
    Start,
    Stop,
}

/// Signaling envelope, decoded once at the transport boundary and
/// dispatched by exhaustive match everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Envelope {
    Join {
        student_id: String,
        instructor_id: String,
    },
    Offer {
        offer: Sdp,
    },
    Answer {
        student_id: String,
        answer: Sdp,
    },
    Ice {
        from: String,
        to: String,
        candidate: IceCandidate,
    },
    Leave {
        student_id: String,
        instructor_id: String,
    },
    Availability {
        action: AvailabilityAction,
        instructor_id: String,
    },
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signaling relay offline")]
    Offline,
    #[error("websocket: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound half of the signaling relay. Sends are fire-and-forget: a
/// failed publish is skipped by callers, never queued for retry.
#[async_trait]
pub trait Signaling: Send + Sync + 'static {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), SignalError>;

    /// Whether the relay connection is currently up.
    fn is_online(&self) -> bool;
}

/// Wire frame understood by the relay.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Frame {
    Subscribe { topic: String },
    Publish { topic: String, payload: Envelope },
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Websocket client for the publish/subscribe signaling relay.
pub struct RelayClient {
    writer: Mutex<WsSink>,
    online: AtomicBool,
}

impl RelayClient {
    /// Connect to the relay and subscribe to `topics`. Envelopes published
    /// to those topics arrive on the returned channel until the connection
    /// drops, at which point `is_online` turns false.
    pub async fn connect(
        url: &str,
        topics: &[String],
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Envelope>), SignalError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (writer, reader) = ws_stream.split();

        let client = Arc::new(Self {
            writer: Mutex::new(writer),
            online: AtomicBool::new(true),
        });
        for topic in topics {
            client
                .send_frame(&Frame::Subscribe {
                    topic: topic.clone(),
                })
                .await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(&client).pump(reader, tx));
        Ok((client, rx))
    }

    async fn pump(self: Arc<Self>, mut reader: WsSource, tx: mpsc::UnboundedSender<Envelope>) {
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                    Ok(Frame::Publish { topic, payload }) => {
                        log::trace!("<- {topic}");
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Subscribe { .. }) => {}
                    Err(e) => log::warn!("Malformed relay frame: {e}"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::error!("Relay connection error: {e}");
                    break;
                }
            }
        }
        self.online.store(false, Ordering::SeqCst);
        log::info!("Relay connection closed");
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), SignalError> {
        let text = serde_json::to_string(frame)?;
        let mut writer = self.writer.lock().await;
        writer.send(Message::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl Signaling for RelayClient {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), SignalError> {
        if !self.is_online() {
            return Err(SignalError::Offline);
        }
        log::trace!("-> {topic}");
        self.send_frame(&Frame::Publish {
            topic: topic.to_owned(),
            payload: envelope.clone(),
        })
        .await
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

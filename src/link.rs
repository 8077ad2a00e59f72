//! One resilient connection to one relay.
//!
//! A [`RelayLink`] owns a background task that connects, issues the active
//! subscription, forwards events and reconnects with jittered exponential
//! backoff until it is closed. Consumers only see a [`RelayStream`].

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures_util::{SinkExt, Stream, StreamExt};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{Error, Result},
    event::{verify_event, Event},
    filter::{close_message, subscription_id, Subscription},
};

/// Sessions that lived longer than this reset the backoff counter.
const STABLE_SESSION: Duration = Duration::from_secs(60);

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Upper bound of the delay before reconnect attempt `attempt` (0-indexed).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// A uniformly random delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}

/// Connection parameters shared by every link of a pool.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Drop events whose id or Schnorr signature does not verify.
    pub verify_sig: bool,
    /// SOCKS5 proxy address, e.g. a local Tor daemon.
    pub tor_socks: Option<String>,
    pub backoff: Backoff,
    pub connect_timeout: Duration,
    /// Bound of the per-link event buffer.
    pub channel_capacity: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            verify_sig: false,
            tor_socks: None,
            backoff: Backoff::default(),
            connect_timeout: Duration::from_secs(10),
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Connected,
    /// Stored events replayed; receiving live events.
    Live,
    Backoff,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event(Event),
    /// The relay finished replaying stored events. Sent at most once.
    CaughtUp,
}

/// Frames a relay sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event { sub_id: String, event: Event },
    Eose(String),
    Notice(String),
    Closed { sub_id: String, reason: String },
    /// Recognized but irrelevant here (`OK`, `AUTH`, ...).
    Other(String),
}

/// Decode one relay frame. `None` means the frame is malformed.
pub fn parse_frame(text: &str) -> Option<RelayFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let arr = value.as_array()?;
    let label = arr.first()?.as_str()?;
    let string_at = |i: usize| arr.get(i).and_then(Value::as_str).map(String::from);
    let frame = match label {
        "EVENT" => RelayFrame::Event {
            sub_id: string_at(1)?,
            event: serde_json::from_value(arr.get(2)?.clone()).ok()?,
        },
        "EOSE" => RelayFrame::Eose(string_at(1)?),
        "NOTICE" => RelayFrame::Notice(string_at(1).unwrap_or_default()),
        "CLOSED" => RelayFrame::Closed {
            sub_id: string_at(1)?,
            reason: string_at(2).unwrap_or_default(),
        },
        other => RelayFrame::Other(other.to_string()),
    };
    Some(frame)
}

/// Events from one link. Ends only after the link is closed or dropped.
pub struct RelayStream {
    rx: mpsc::Receiver<RelayMessage>,
}

impl Stream for RelayStream {
    type Item = RelayMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub struct RelayLink {
    /// The endpoint as configured; identifies the relay in status and pool items.
    endpoint: String,
    url: Url,
    settings: LinkSettings,
    state: Arc<watch::Sender<LinkState>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl RelayLink {
    /// Validate the endpoint. No I/O happens until [`RelayLink::subscribe`].
    pub fn connect(endpoint: &str, settings: LinkSettings) -> Result<Self> {
        let url = Url::parse(endpoint)
            .map_err(|e| Error::InvalidArgument(format!("relay url {endpoint}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") || url.host_str().is_none() {
            return Err(Error::InvalidArgument(format!(
                "relay url {endpoint}: expected ws:// or wss://"
            )));
        }
        let (state, _) = watch::channel(LinkState::Connecting);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            endpoint: endpoint.trim().to_string(),
            url,
            settings,
            state: Arc::new(state),
            shutdown,
            task: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Start delivering `subscription`, replacing any previous one.
    pub fn subscribe(&mut self, subscription: Subscription) -> RelayStream {
        if let Some(previous) = self.task.take() {
            previous.abort();
        }
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let worker = Worker {
            url: self.url.clone(),
            settings: self.settings.clone(),
            subscription,
            tx,
            state: self.state.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        self.task = Some(tokio::spawn(worker.run()));
        RelayStream { rx }
    }

    /// Stop reconnecting, close the socket and end the stream.
    pub async fn close(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.state.send_replace(LinkState::Closed);
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

struct Worker {
    url: Url,
    settings: LinkSettings,
    subscription: Subscription,
    tx: mpsc::Sender<RelayMessage>,
    state: Arc<watch::Sender<LinkState>>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let sub_id = subscription_id(self.url.as_str());
        let req = self.subscription.to_req(&sub_id).to_string();
        let mut attempt: u32 = 0;
        let mut caught_up = false;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.state.send_replace(LinkState::Connecting);
            let started = Instant::now();
            match self.session(&sub_id, &req, &mut caught_up).await {
                Ok(()) => break,
                Err(e) => {
                    if started.elapsed() > STABLE_SESSION {
                        attempt = 0;
                    }
                    let delay = self.settings.backoff.delay(attempt);
                    warn!(relay = %self.url, error = %e, attempt, ?delay, "relay link down, retrying");
                    self.state.send_replace(LinkState::Backoff);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => break,
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
        self.state.send_replace(LinkState::Closed);
        debug!(relay = %self.url, "relay link stopped");
    }

    /// One connection lifetime. `Ok` means the link is shutting down; any
    /// error is transient and leads to a reconnect.
    async fn session(&mut self, sub_id: &str, req: &str, caught_up: &mut bool) -> Result<()> {
        let connect = tokio::time::timeout(self.settings.connect_timeout, open_socket(&self.url, &self.settings));
        let mut ws = tokio::select! {
            res = connect => res.map_err(|_| Error::TransientNetwork("connect timed out".into()))??,
            _ = self.shutdown.changed() => return Ok(()),
        };
        self.state.send_replace(LinkState::Connected);
        debug!(relay = %self.url, sub_id, "connected, subscribing");
        ws.send(Message::Text(req.to_string())).await?;

        loop {
            let msg = tokio::select! {
                msg = ws.next() => msg,
                _ = self.shutdown.changed() => {
                    let _ = ws.send(Message::Text(close_message(sub_id).to_string())).await;
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            };
            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::TransientNetwork("connection closed by relay".into()))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            };
            let Some(frame) = parse_frame(&text) else {
                debug!(relay = %self.url, "dropping malformed frame");
                continue;
            };
            match frame {
                RelayFrame::Event { sub_id: sid, event } if sid == sub_id => {
                    if self.settings.verify_sig {
                        if let Err(e) = verify_event(&event) {
                            debug!(relay = %self.url, id = %event.id, error = %e, "dropping unverified event");
                            continue;
                        }
                    }
                    if self.tx.send(RelayMessage::Event(event)).await.is_err() {
                        return Ok(());
                    }
                }
                RelayFrame::Eose(sid) if sid == sub_id => {
                    self.state.send_replace(LinkState::Live);
                    if !*caught_up {
                        *caught_up = true;
                        info!(relay = %self.url, "caught up");
                        if self.tx.send(RelayMessage::CaughtUp).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                RelayFrame::Closed { sub_id: sid, reason } if sid == sub_id => {
                    return Err(Error::TransientNetwork(format!("subscription closed: {reason}")));
                }
                RelayFrame::Notice(notice) => {
                    info!(relay = %self.url, %notice, "relay notice");
                }
                other => debug!(relay = %self.url, ?other, "ignoring frame"),
            }
        }
    }
}

/// Open a WebSocket, optionally through a SOCKS5 proxy.
async fn open_socket(url: &Url, settings: &LinkSettings) -> Result<WsStream> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::TransientNetwork(format!("{url}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::TransientNetwork(format!("{url}: missing port")))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = match &settings.tor_socks {
        Some(proxy) => Box::new(Socks5Stream::connect(proxy.as_str(), (host, port)).await?),
        None => Box::new(TcpStream::connect((host, port)).await?),
    };
    let (ws, _) = client_async_tls(url.as_str(), stream).await?;
    Ok(ws)
}

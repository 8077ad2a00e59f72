//! Helpers shared by the unit tests: job events and an in-process relay.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::event::{Event, Tag};

/// Serializes tests that touch process environment variables.
pub static ENV_MUTEX: Mutex<()> = Mutex::new(());

fn tag(fields: &[&str]) -> Tag {
    Tag(fields.iter().map(|s| s.to_string()).collect())
}

/// Unsigned job-listing event addressed by a `d` tag.
pub fn job_event(id: &str, pubkey: &str, slot: &str, created_at: u64, skills: &[&str]) -> Event {
    let mut tags = vec![tag(&["d", slot]), tag(&["title", &format!("Job {slot}")])];
    tags.extend(skills.iter().map(|s| tag(&["skill", s])));
    Event {
        id: id.into(),
        pubkey: pubkey.into(),
        kind: 9993,
        created_at,
        tags,
        content: format!("Listing {id}"),
        sig: String::new(),
    }
}

/// Unsigned NIP-09 deletion of `slot`.
pub fn deletion_event(id: &str, pubkey: &str, slot: &str, created_at: u64) -> Event {
    Event {
        id: id.into(),
        pubkey: pubkey.into(),
        kind: 5,
        created_at,
        tags: vec![tag(&["a", &format!("9993:{pubkey}:{slot}")]), tag(&["k", "9993"])],
        content: String::new(),
        sig: String::new(),
    }
}

/// A relay that answers every `REQ` with canned events followed by `EOSE`.
pub struct MockRelay {
    pub url: String,
    /// Every text frame received from clients, in arrival order.
    pub frames: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<()>,
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn mock_relay(events: Vec<Event>) -> MockRelay {
    spawn_relay(events, false, None).await
}

/// Like [`mock_relay`], but the first connection hangs up before `EOSE`.
pub async fn flaky_relay(events: Vec<Event>) -> MockRelay {
    spawn_relay(events, true, None).await
}

/// Like [`mock_relay`], but `EOSE` is withheld until the returned handle is
/// notified.
pub async fn gated_relay(events: Vec<Event>) -> (MockRelay, Arc<Notify>) {
    let gate = Arc::new(Notify::new());
    let relay = spawn_relay(events, false, Some(gate.clone())).await;
    (relay, gate)
}

async fn spawn_relay(
    events: Vec<Event>,
    hang_up_first: bool,
    eose_gate: Option<Arc<Notify>>,
) -> MockRelay {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (frame_tx, frames) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut connections = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            let events = events.clone();
            let frame_tx = frame_tx.clone();
            let hang_up = hang_up_first && connections == 0;
            let eose_gate = eose_gate.clone();
            connections += 1;
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                let Some(Ok(Message::Text(req))) = ws.next().await else {
                    return;
                };
                let sub_id = serde_json::from_str::<Value>(&req)
                    .ok()
                    .and_then(|v| v[1].as_str().map(String::from))
                    .unwrap_or_default();
                let _ = frame_tx.send(req);
                for ev in &events {
                    let frame = json!(["EVENT", sub_id, ev]).to_string();
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                if hang_up {
                    let _ = ws.close(None).await;
                    return;
                }
                if let Some(gate) = eose_gate {
                    gate.notified().await;
                }
                let eose = json!(["EOSE", sub_id]).to_string();
                if ws.send(Message::Text(eose)).await.is_err() {
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(txt) = msg {
                        let _ = frame_tx.send(txt);
                    }
                }
            });
        }
    });
    MockRelay { url, frames, task }
}

//! Fan-out/fan-in over several relay links.

use std::{
    collections::{HashSet, VecDeque},
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures_util::{Stream, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    event::Event,
    filter::Subscription,
    link::{LinkSettings, LinkState, RelayLink, RelayMessage},
};

/// Sliding window of recently seen event ids.
#[derive(Debug)]
pub struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; returns false when it is already inside the window.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolItem {
    Event { relay: String, event: Event },
    /// Every link has replayed its stored events.
    CaughtUp,
}

/// Live connection state of one pool member.
#[derive(Debug, Clone)]
pub struct RelayStatus {
    pub url: String,
    pub state: watch::Receiver<LinkState>,
}

pub struct RelayPool {
    links: Vec<RelayLink>,
    dedup_window: usize,
    channel_capacity: usize,
    forwarders: Vec<JoinHandle<()>>,
}

impl RelayPool {
    /// Build links for `urls`. Invalid URLs are skipped with a warning.
    pub fn new(urls: &[String], settings: &LinkSettings, dedup_window: usize) -> Self {
        let mut links = Vec::with_capacity(urls.len());
        for url in urls {
            match RelayLink::connect(url, settings.clone()) {
                Ok(link) => links.push(link),
                Err(e) => warn!(relay = %url, error = %e, "skipping relay"),
            }
        }
        Self {
            links,
            dedup_window,
            channel_capacity: settings.channel_capacity.max(1),
            forwarders: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn statuses(&self) -> Vec<RelayStatus> {
        self.links
            .iter()
            .map(|link| RelayStatus {
                url: link.url().to_string(),
                state: link.state(),
            })
            .collect()
    }

    /// Issue `subscription` on every link and merge their streams.
    pub fn subscribe(&mut self, subscription: Subscription) -> PoolStream {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        for link in &mut self.links {
            let relay = link.url().to_string();
            let mut stream = link.subscribe(subscription.clone());
            let tx = tx.clone();
            self.forwarders.push(tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    if tx.send((relay.clone(), msg)).await.is_err() {
                        break;
                    }
                }
                debug!(%relay, "forwarder finished");
            }));
        }
        info!(relays = self.links.len(), "pool subscribed");
        PoolStream {
            rx,
            dedup: DedupWindow::new(self.dedup_window),
            pending: self.links.len(),
            announced: false,
            duplicates: 0,
        }
    }

    /// Close every link and wait for their forwarders.
    pub async fn close(&mut self) {
        for link in &mut self.links {
            link.close().await;
        }
        for forwarder in self.forwarders.drain(..) {
            let _ = forwarder.await;
        }
    }
}

/// Deduplicated events from every link of a pool.
pub struct PoolStream {
    rx: mpsc::Receiver<(String, RelayMessage)>,
    dedup: DedupWindow,
    pending: usize,
    announced: bool,
    duplicates: u64,
}

impl PoolStream {
    /// Events dropped as already seen.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    fn announce(&mut self) -> bool {
        if self.pending == 0 && !self.announced {
            self.announced = true;
            return true;
        }
        false
    }
}

impl Stream for PoolStream {
    type Item = PoolItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.announce() {
            return Poll::Ready(Some(PoolItem::CaughtUp));
        }
        loop {
            match ready!(this.rx.poll_recv(cx)) {
                None => return Poll::Ready(None),
                Some((relay, RelayMessage::Event(event))) => {
                    if this.dedup.insert(&event.id) {
                        return Poll::Ready(Some(PoolItem::Event { relay, event }));
                    }
                    this.duplicates += 1;
                }
                Some((relay, RelayMessage::CaughtUp)) => {
                    this.pending = this.pending.saturating_sub(1);
                    debug!(%relay, pending = this.pending, "link caught up");
                    if this.announce() {
                        return Poll::Ready(Some(PoolItem::CaughtUp));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{gated_relay, job_event, mock_relay};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(stream: &mut PoolStream) -> Option<PoolItem> {
        timeout(Duration::from_secs(5), stream.next()).await.unwrap()
    }

    #[test]
    fn window_evicts_oldest() {
        let mut w = DedupWindow::new(2);
        assert!(w.insert("a"));
        assert!(!w.insert("a"));
        assert!(w.insert("b"));
        assert!(w.insert("c"));
        assert_eq!(w.len(), 2);
        assert!(w.insert("a"));
        assert!(!w.insert("c"));
    }

    #[test]
    fn invalid_urls_are_skipped() {
        let urls = vec![
            "https://relay.example.com".to_string(),
            "wss://relay.example.com".to_string(),
            "garbage".to_string(),
        ];
        let pool = RelayPool::new(&urls, &LinkSettings::default(), 16);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.statuses()[0].url, "wss://relay.example.com");
    }

    #[tokio::test]
    async fn empty_pool_is_caught_up_immediately() {
        let mut pool = RelayPool::new(&[], &LinkSettings::default(), 16);
        let mut stream = pool.subscribe(Subscription::job_listings(9993, &[], None));
        assert_eq!(next(&mut stream).await, Some(PoolItem::CaughtUp));
        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn same_event_from_two_relays_is_delivered_once() {
        let ev = job_event("aa", "p1", "s1", 1, &["rust"]);
        let other = job_event("bb", "p1", "s2", 2, &["go"]);
        let r1 = mock_relay(vec![ev.clone()]).await;
        let r2 = mock_relay(vec![ev.clone(), other.clone()]).await;
        let urls = vec![r1.url.clone(), r2.url.clone()];
        let mut pool = RelayPool::new(&urls, &LinkSettings::default(), 16);
        let mut stream = pool.subscribe(Subscription::job_listings(9993, &[], None));

        let mut ids = vec![];
        loop {
            match next(&mut stream).await.unwrap() {
                PoolItem::Event { event, .. } => ids.push(event.id),
                PoolItem::CaughtUp => break,
            }
        }
        ids.sort();
        assert_eq!(ids, vec!["aa", "bb"]);
        assert_eq!(stream.duplicates(), 1);

        let reported: Vec<String> = pool.statuses().into_iter().map(|s| s.url).collect();
        assert_eq!(reported, urls);
        for status in pool.statuses() {
            assert_eq!(*status.state.borrow(), LinkState::Live);
        }
        pool.close().await;
        assert_eq!(next(&mut stream).await, None);
        for status in pool.statuses() {
            assert_eq!(*status.state.borrow(), LinkState::Closed);
        }
    }

    #[tokio::test]
    async fn caught_up_waits_for_every_relay() {
        let fast = mock_relay(vec![job_event("aa", "p1", "s1", 1, &["rust"])]).await;
        let (slow, eose) = gated_relay(vec![job_event("bb", "p2", "s2", 2, &["go"])]).await;
        let urls = vec![fast.url.clone(), slow.url.clone()];
        let mut pool = RelayPool::new(&urls, &LinkSettings::default(), 16);
        let mut stream = pool.subscribe(Subscription::job_listings(9993, &[], None));

        let mut ids = vec![];
        while ids.len() < 2 {
            match next(&mut stream).await.unwrap() {
                PoolItem::Event { event, .. } => ids.push(event.id),
                PoolItem::CaughtUp => panic!("caught up before every relay sent EOSE"),
            }
        }
        ids.sort();
        assert_eq!(ids, vec!["aa", "bb"]);
        assert!(timeout(Duration::from_millis(300), stream.next()).await.is_err());

        eose.notify_one();
        assert_eq!(next(&mut stream).await, Some(PoolItem::CaughtUp));
        pool.close().await;
    }
}

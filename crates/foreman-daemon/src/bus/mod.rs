//! In-process publish/subscribe with replay.
//!
//! Every channel keeps an ordered backlog plus a broadcast sender. Publishing
//! appends and broadcasts under one write lock; subscribing snapshots the
//! backlog and takes a receiver under the same lock, so a subscriber sees
//! every event exactly once whether it arrived before or after it joined.
//! Events on run and thread channels are mirrored onto the aggregate feed.
//!
//! Channels come into existence on their first publish. Subscribing to a
//! channel that does not exist yet waits for it without allocating one, and
//! closed channels are dropped entirely once their retention expires.

mod event;

pub use event::{BusEvent, ChannelId, EventPayload, NewEvent};

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::Stream;
use tracing::{debug, info};

use foreman_core::config::BusConfig;
use foreman_core::db::unix_timestamp_ms;

/// Stream of events handed to subscribers. Ends after a close event.
pub type EventStream = Pin<Box<dyn Stream<Item = BusEvent> + Send>>;

struct Channel {
    backlog: VecDeque<BusEvent>,
    next_id: u64,
    tx: broadcast::Sender<BusEvent>,
    closed_at: Option<Instant>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            backlog: VecDeque::new(),
            next_id: 1,
            tx,
            closed_at: None,
        }
    }

    fn trim(&mut self, limit: usize) {
        while self.backlog.len() > limit.max(1) {
            self.backlog.pop_front();
        }
    }

    /// Snapshot for a new subscriber. A cursor past the last id belongs to an
    /// earlier channel under the same name and replays everything.
    fn attach(&self, last_seen: u64) -> Attached {
        let after = if last_seen >= self.next_id { 0 } else { last_seen };
        Attached {
            after,
            backlog: self.after(after),
            closed: self.closed_at.is_some(),
            rx: self.tx.subscribe(),
        }
    }

    fn push(&mut self, name: String, origin: Option<String>, event: &NewEvent) -> BusEvent {
        let published = BusEvent {
            id: self.next_id,
            channel: name,
            origin,
            timestamp_ms: unix_timestamp_ms(),
            session_id: event.session_id.clone(),
            thread_id: event.thread_id.clone(),
            payload: event.payload.clone(),
        };
        self.next_id += 1;
        self.backlog.push_back(published.clone());
        // No receivers is fine; the backlog serves late subscribers.
        let _ = self.tx.send(published.clone());
        published
    }

    fn after(&self, last_seen: u64) -> Vec<BusEvent> {
        self.backlog
            .iter()
            .filter(|e| e.id > last_seen)
            .cloned()
            .collect()
    }
}

struct Attached {
    after: u64,
    backlog: Vec<BusEvent>,
    closed: bool,
    rx: broadcast::Receiver<BusEvent>,
}

/// Fan-out of events to live and reconnecting observers.
pub struct StreamBus {
    channels: Arc<RwLock<HashMap<ChannelId, Channel>>>,
    /// Announces channel creation to subscribers waiting for it.
    created: broadcast::Sender<ChannelId>,
    config: BusConfig,
}

impl StreamBus {
    pub fn new(config: BusConfig) -> Self {
        let (created, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            created,
            config,
        }
    }

    /// Publish on a channel (and the feed). Returns the id assigned on
    /// `channel`, or `None` if the channel is already closed.
    pub async fn publish(&self, channel: &ChannelId, event: NewEvent) -> Option<u64> {
        let mut channels = self.channels.write().await;
        self.append(&mut channels, channel, &event)
    }

    /// Close a channel with a terminal [`EventPayload::Close`] event.
    ///
    /// Idempotent; the feed cannot be closed.
    pub async fn close(&self, channel: &ChannelId, reason: &str) {
        if *channel == ChannelId::Feed {
            return;
        }
        let event = NewEvent::new(EventPayload::Close {
            reason: reason.to_string(),
        });
        let mut channels = self.channels.write().await;
        if self.append(&mut channels, channel, &event).is_none() {
            return;
        }
        if let Some(ch) = channels.get_mut(channel) {
            ch.closed_at = Some(Instant::now());
        }
        drop(channels);
        info!(channel = %channel, reason, "Channel closed");
    }

    /// Accept events on a closed channel again, keeping its ids monotonic.
    ///
    /// Used when a new session continues an existing thread. The old close
    /// marker leaves the backlog so replays run past it.
    pub async fn reopen(&self, channel: &ChannelId) {
        let mut channels = self.channels.write().await;
        if let Some(ch) = channels.get_mut(channel)
            && ch.closed_at.take().is_some()
        {
            ch.backlog.retain(|e| !e.is_close());
            debug!(channel = %channel, "Channel reopened");
        }
    }

    fn append(
        &self,
        channels: &mut HashMap<ChannelId, Channel>,
        channel: &ChannelId,
        event: &NewEvent,
    ) -> Option<u64> {
        let ch = self.channel_mut(channels, channel);
        if ch.closed_at.is_some() {
            debug!(channel = %channel, "Dropping event for closed channel");
            return None;
        }
        let id = ch.push(channel.to_string(), None, event).id;
        ch.trim(self.config.channel_backlog);

        if *channel != ChannelId::Feed {
            let feed = self.channel_mut(channels, &ChannelId::Feed);
            feed.push(ChannelId::Feed.to_string(), Some(channel.to_string()), event);
            feed.trim(self.config.feed_backlog);
        }
        Some(id)
    }

    /// Look up a channel, creating it and waking its waiting subscribers
    /// if needed. Callers hold the write lock.
    fn channel_mut<'a>(
        &self,
        channels: &'a mut HashMap<ChannelId, Channel>,
        channel: &ChannelId,
    ) -> &'a mut Channel {
        let capacity = self.config.broadcast_capacity;
        let created = &self.created;
        channels.entry(channel.clone()).or_insert_with(|| {
            // Nobody waiting is fine.
            let _ = created.send(channel.clone());
            Channel::new(capacity)
        })
    }

    /// Whether a channel currently exists.
    pub async fn exists(&self, channel: &ChannelId) -> bool {
        self.channels.read().await.contains_key(channel)
    }

    /// Subscribe to a channel, replaying events with id greater than
    /// `last_seen` (all events when `None`) before live ones.
    ///
    /// A channel that does not exist yet is waited for; replay starts once
    /// its first event is published.
    pub async fn subscribe(&self, channel: &ChannelId, last_seen: Option<u64>) -> EventStream {
        let last_seen = last_seen.unwrap_or(0);

        // Either attach now or start listening for creation, under one lock
        // so a creation in between cannot be missed.
        let (attached, mut created) = {
            let channels = self.channels.read().await;
            match channels.get(channel) {
                Some(ch) => (Some(ch.attach(last_seen)), None),
                None => (None, Some(self.created.subscribe())),
            }
        };

        let channels = Arc::clone(&self.channels);
        let key = channel.clone();

        Box::pin(async_stream::stream! {
            let attached = match attached {
                Some(attached) => attached,
                None => loop {
                    let Some(waiting) = created.as_mut() else { return };
                    match waiting.recv().await {
                        Ok(id) if id != key => continue,
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return,
                    }
                    let found = channels.read().await.get(&key).map(|ch| ch.attach(last_seen));
                    if let Some(attached) = found {
                        break attached;
                    }
                },
            };
            let Attached { after, backlog, closed, mut rx } = attached;

            let mut last = after;
            for event in backlog {
                last = event.id;
                let done = event.is_close();
                yield event;
                if done {
                    return;
                }
            }
            // Already past the close marker.
            if closed {
                return;
            }

            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.id <= last {
                            continue;
                        }
                        last = event.id;
                        let done = event.is_close();
                        yield event;
                        if done {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(channel = %key, skipped, "Subscriber lagged, refilling from backlog");
                        let missed = channels
                            .read()
                            .await
                            .get(&key)
                            .map(|ch| ch.after(last))
                            .unwrap_or_default();
                        for event in missed {
                            last = event.id;
                            let done = event.is_close();
                            yield event;
                            if done {
                                return;
                            }
                        }
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    /// A stream holding only a close marker (id 0), for a channel that
    /// finished and has since been pruned.
    pub fn closed_stream(channel: &ChannelId, reason: &str) -> EventStream {
        let event = BusEvent {
            id: 0,
            channel: channel.to_string(),
            origin: None,
            timestamp_ms: unix_timestamp_ms(),
            session_id: None,
            thread_id: None,
            payload: EventPayload::Close {
                reason: reason.to_string(),
            },
        };
        Box::pin(tokio_stream::once(event))
    }

    /// Highest id published on a channel (0 if none).
    pub async fn last_id(&self, channel: &ChannelId) -> u64 {
        self.channels
            .read()
            .await
            .get(channel)
            .map_or(0, |ch| ch.next_id - 1)
    }

    pub async fn is_closed(&self, channel: &ChannelId) -> bool {
        self.channels
            .read()
            .await
            .get(channel)
            .is_some_and(|ch| ch.closed_at.is_some())
    }

    /// Remove channels closed longer than `retention` ago. Returns how many
    /// were removed.
    pub async fn prune_closed(&self, retention: Duration) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, ch| {
            !ch.closed_at
                .is_some_and(|closed| closed.elapsed() >= retention)
        });
        let pruned = before - channels.len();
        drop(channels);
        if pruned > 0 {
            debug!(pruned, "Pruned closed channels");
        }
        pruned
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

//! Stream fan-out fabric.
//!
//! One `StreamPublisher` per stream kind multiplexes updates to every SSE
//! subscriber whose credential topic matches. Topics are registered when an
//! environment is created and removed when it closes; subscribers come and
//! go with downstream connections.

use crate::metrics_defs::SUBSCRIBERS_DROPPED;
use bytes::Bytes;
use parking_lot::Mutex;
use shared::sse::SseEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Per-subscriber queue depth. A subscriber that falls this far behind is
/// dropped and must reconnect for a fresh snapshot.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// The stream surfaces the relay republishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Server-side `/all`: flags and segments.
    ServerSideAll,
    /// Server-side `/flags`: flags only.
    ServerSideFlagsOnly,
    /// Mobile ping streams (`/mping`, `/meval`).
    MobilePing,
    /// Browser ping streams (`/ping/{envId}`, `/eval/{envId}`).
    JsPing,
}

impl StreamKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamKind::ServerSideAll => "server-all",
            StreamKind::ServerSideFlagsOnly => "server-flags",
            StreamKind::MobilePing => "mobile-ping",
            StreamKind::JsPing => "js-ping",
        }
    }

    /// Ping streams carry no data; every mutation degenerates to a ping
    /// telling the client to re-poll.
    pub const fn is_ping(&self) -> bool {
        matches!(self, StreamKind::MobilePing | StreamKind::JsPing)
    }
}

/// Produces the full-state event a new subscriber sees first.
pub type SnapshotFn = Arc<dyn Fn() -> SseEvent + Send + Sync>;

pub fn ping_event() -> SseEvent {
    SseEvent::new("ping", "")
}

/// An accepted stream subscription: the initial frame (already reflecting a
/// consistent snapshot) plus the live feed.
pub struct Subscription {
    pub initial: Bytes,
    pub receiver: mpsc::Receiver<Bytes>,
}

struct Subscriber {
    tx: mpsc::Sender<Bytes>,
}

struct Topic {
    /// Identifies the `EnvStreams` that registered the topic, so that a
    /// rotated-out environment closing late cannot tear down the topic its
    /// replacement re-registered under the same credential.
    owner: u64,
    snapshot: SnapshotFn,
    subscribers: Vec<Subscriber>,
}

/// Topic-keyed SSE fan-out for one stream kind.
pub struct StreamPublisher {
    kind: StreamKind,
    topics: Mutex<HashMap<String, Topic>>,
}

impl StreamPublisher {
    fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Binds a credential topic to its snapshot source. Replaces any
    /// previous binding for the credential.
    pub fn register(&self, credential: &str, owner: u64, snapshot: SnapshotFn) {
        let mut topics = self.topics.lock();
        topics.insert(
            credential.to_string(),
            Topic {
                owner,
                snapshot,
                subscribers: Vec::new(),
            },
        );
    }

    /// Removes a topic if it is still owned by the caller; all of its
    /// subscriber channels close, ending the downstream responses.
    pub fn unregister(&self, credential: &str, owner: u64) {
        let mut topics = self.topics.lock();
        if topics.get(credential).is_some_and(|t| t.owner == owner) {
            topics.remove(credential);
        }
    }

    /// Adds a subscriber. The snapshot is captured and the subscriber
    /// registered inside one critical section, so the initial event reflects
    /// a consistent point in time and every published event after it is
    /// strictly later.
    pub fn subscribe(&self, credential: &str) -> Option<Subscription> {
        let mut topics = self.topics.lock();
        let topic = topics.get_mut(credential)?;

        let initial = (topic.snapshot)().encode();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        topic.subscribers.push(Subscriber { tx });

        Some(Subscription {
            initial,
            receiver: rx,
        })
    }

    /// Broadcasts an event to every subscriber of the topic. A subscriber
    /// whose queue is full or whose connection has gone away is dropped;
    /// nobody else is affected.
    pub fn publish(&self, credential: &str, event: &SseEvent) {
        let mut topics = self.topics.lock();
        let Some(topic) = topics.get_mut(credential) else {
            return;
        };

        let frame = event.encode();
        let kind = self.kind;
        topic.subscribers.retain(|sub| {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(stream = kind.as_str(), "Dropping subscriber that cannot keep up");
                    metrics::counter!(SUBSCRIBERS_DROPPED.name, "stream" => kind.as_str()).increment(1);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Re-broadcasts the current snapshot to every subscriber, used after a
    /// full data refresh.
    pub fn publish_snapshot(&self, credential: &str) {
        let event = {
            let topics = self.topics.lock();
            match topics.get(credential) {
                Some(topic) => (topic.snapshot)(),
                None => return,
            }
        };
        self.publish(credential, &event);
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, credential: &str) -> usize {
        self.topics
            .lock()
            .get(credential)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }
}

/// The full set of publishers shared by all environments, plus the heartbeat
/// cadence streamed connections use.
pub struct Publishers {
    pub server_side_all: StreamPublisher,
    pub server_side_flags: StreamPublisher,
    pub mobile_ping: StreamPublisher,
    pub js_ping: StreamPublisher,
    heartbeat_interval: Duration,
}

impl Publishers {
    pub fn new(heartbeat_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            server_side_all: StreamPublisher::new(StreamKind::ServerSideAll),
            server_side_flags: StreamPublisher::new(StreamKind::ServerSideFlagsOnly),
            mobile_ping: StreamPublisher::new(StreamKind::MobilePing),
            js_ping: StreamPublisher::new(StreamKind::JsPing),
            heartbeat_interval,
        })
    }

    pub fn get(&self, kind: StreamKind) -> &StreamPublisher {
        match kind {
            StreamKind::ServerSideAll => &self.server_side_all,
            StreamKind::ServerSideFlagsOnly => &self.server_side_flags,
            StreamKind::MobilePing => &self.mobile_ping,
            StreamKind::JsPing => &self.js_ping,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }
}

/// One environment's bindings into the shared publisher set: which topics it
/// registered, and how its store mutations translate to stream events.
pub struct EnvStreams {
    publishers: Arc<Publishers>,
    owner: u64,
    registrations: Mutex<Vec<(StreamKind, String)>>,
    closed: std::sync::atomic::AtomicBool,
}

static NEXT_OWNER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

impl EnvStreams {
    pub fn new(publishers: Arc<Publishers>) -> Arc<Self> {
        Arc::new(Self {
            publishers,
            owner: NEXT_OWNER.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            registrations: Mutex::new(Vec::new()),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn register(&self, kind: StreamKind, credential: String, snapshot: SnapshotFn) {
        self.publishers
            .get(kind)
            .register(&credential, self.owner, snapshot);
        self.registrations.lock().push((kind, credential));
    }

    /// Fans one applied mutation out to every stream it affects.
    pub fn publish_update(
        &self,
        kind: crate::store::DataKind,
        key: &str,
        item: &crate::store::ItemDescriptor,
    ) {
        use crate::store::DataKind;

        for (stream_kind, credential) in self.registrations.lock().iter() {
            let publisher = self.publishers.get(*stream_kind);
            match stream_kind {
                StreamKind::ServerSideAll => {
                    let path = format!("{}{}", kind.patch_path_prefix(), key);
                    publisher.publish(credential, &change_event(&path, item));
                }
                StreamKind::ServerSideFlagsOnly => {
                    if kind == DataKind::Features {
                        let path = format!("/{key}");
                        publisher.publish(credential, &change_event(&path, item));
                    }
                }
                StreamKind::MobilePing | StreamKind::JsPing => {
                    publisher.publish(credential, &ping_event());
                }
            }
        }
    }

    /// Re-broadcasts full state after the dataset was replaced wholesale.
    pub fn publish_full_refresh(&self) {
        for (stream_kind, credential) in self.registrations.lock().iter() {
            let publisher = self.publishers.get(*stream_kind);
            if stream_kind.is_ping() {
                publisher.publish(credential, &ping_event());
            } else {
                publisher.publish_snapshot(credential);
            }
        }
    }

    /// Unregisters every topic this environment owns. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        for (kind, credential) in self.registrations.lock().drain(..) {
            self.publishers.get(kind).unregister(&credential, self.owner);
        }
    }
}

fn change_event(path: &str, item: &crate::store::ItemDescriptor) -> SseEvent {
    match &item.item {
        Some(data) => SseEvent::new(
            "patch",
            serde_json::json!({ "path": path, "data": data }).to_string(),
        ),
        None => SseEvent::new(
            "delete",
            serde_json::json!({ "path": path, "version": item.version }).to_string(),
        ),
    }
}

//! The poll-then-stream reconciliation loop.
//!
//! Cycle: poll the updates endpoint until it returns an empty page (applying
//! patches in order, stopping a page at the first broken version chain),
//! record the synchronized timestamp, then hold the SSE stream open and
//! apply each incoming patch the same way. A broken chain on the stream
//! restarts the whole cycle from polling; an I/O failure backs off first.

use crate::patch::BigSegmentPatch;
use crate::store::{BigSegmentStore, unix_millis_now};
use futures::StreamExt;
use shared::sse::SseParser;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const POLL_PATH: &str = "/sdk/big-segments/updates";
const STREAM_PATH: &str = "/sdk/big-segments/stream";

const DEFAULT_STREAM_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned HTTP {0}")]
    HttpStatus(u16),

    #[error("stream ended unexpectedly")]
    StreamEnded,

    #[error("big-segment store error: {0}")]
    Store(String),

    #[error("malformed patch payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct BigSegmentSynchronizer {
    inner: Arc<SyncInner>,
    stream_retry_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

struct SyncInner {
    client: reqwest::Client,
    store: Arc<dyn BigSegmentStore>,
    poll_uri: String,
    stream_uri: String,
    sdk_key: String,
    environment_id: String,
}

impl BigSegmentSynchronizer {
    pub fn new(
        client: reqwest::Client,
        store: Arc<dyn BigSegmentStore>,
        poll_base_uri: &str,
        stream_base_uri: &str,
        environment_id: &str,
        sdk_key: &str,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SyncInner {
                client,
                store,
                poll_uri: format!("{}{POLL_PATH}", poll_base_uri.trim_end_matches('/')),
                stream_uri: format!("{}{STREAM_PATH}", stream_base_uri.trim_end_matches('/')),
                sdk_key: sdk_key.to_string(),
                environment_id: environment_id.to_string(),
            }),
            stream_retry_interval: DEFAULT_STREAM_RETRY_INTERVAL,
            shutdown_tx,
            handle: parking_lot::Mutex::new(None),
        }
    }

    /// Overrides the delay before reconnecting a failed stream. Tests set
    /// this to a millisecond.
    pub fn with_stream_retry_interval(mut self, interval: Duration) -> Self {
        self.stream_retry_interval = interval;
        self
    }

    /// Starts the worker. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let retry = self.stream_retry_interval;
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(run(inner, retry, shutdown_rx)));
    }

    /// Cancels the poll timer and the stream connection and waits for the
    /// worker to exit. Idempotent.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.store.close();
    }
}

enum PhaseOutcome {
    Done,
    Shutdown,
    Error(SyncError),
}

enum StreamOutcome {
    Restart,
    Shutdown,
    Error(SyncError),
}

async fn run(inner: Arc<SyncInner>, retry: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    tracing::info!(env = %inner.environment_id, "Starting big-segment synchronization");
    loop {
        match inner.poll_until_caught_up(&mut shutdown_rx).await {
            PhaseOutcome::Shutdown => return,
            PhaseOutcome::Error(e) => {
                tracing::warn!(env = %inner.environment_id, error = %e, "Big-segment poll failed");
                if !sleep_unless_shutdown(retry, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
            PhaseOutcome::Done => {}
        }

        match inner.consume_stream(&mut shutdown_rx).await {
            StreamOutcome::Shutdown => return,
            // A broken version chain on the stream means we missed
            // something; restart the full cycle from polling immediately
            StreamOutcome::Restart => continue,
            StreamOutcome::Error(e) => {
                tracing::warn!(env = %inner.environment_id, error = %e, "Big-segment stream failed");
                if !sleep_unless_shutdown(retry, &mut shutdown_rx).await {
                    return;
                }
            }
        }
    }
}

async fn sleep_unless_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx.changed() => false,
    }
}

impl SyncInner {
    async fn poll_until_caught_up(&self, shutdown_rx: &mut watch::Receiver<bool>) -> PhaseOutcome {
        loop {
            let cursor = match self.store.cursor() {
                Ok(cursor) => cursor,
                Err(e) => return PhaseOutcome::Error(e),
            };

            let mut request = self
                .client
                .get(&self.poll_uri)
                .header(reqwest::header::AUTHORIZATION, &self.sdk_key);
            if !cursor.is_empty() {
                request = request.query(&[("after", cursor.as_str())]);
            }

            let response = tokio::select! {
                response = request.send() => response,
                _ = shutdown_rx.changed() => return PhaseOutcome::Shutdown,
            };

            let patches: Vec<BigSegmentPatch> = match response {
                Ok(response) if response.status().is_success() => {
                    match response.json().await {
                        Ok(patches) => patches,
                        Err(e) => return PhaseOutcome::Error(e.into()),
                    }
                }
                Ok(response) => {
                    return PhaseOutcome::Error(SyncError::HttpStatus(response.status().as_u16()));
                }
                Err(e) => return PhaseOutcome::Error(e.into()),
            };

            if patches.is_empty() {
                // Caught up; only now is the dataset known synchronized
                if let Err(e) = self.store.set_synchronized_on(unix_millis_now()) {
                    return PhaseOutcome::Error(e);
                }
                return PhaseOutcome::Done;
            }

            match self.apply_patches(&patches) {
                Ok(_) => {}
                Err(e) => return PhaseOutcome::Error(e),
            }
        }
    }

    /// Applies patches in order, stopping at the first whose previous
    /// version does not chain; the remainder of the list is discarded.
    fn apply_patches(&self, patches: &[BigSegmentPatch]) -> Result<usize, SyncError> {
        let mut applied = 0;
        for patch in patches {
            if self.store.apply_patch(patch)? {
                applied += 1;
            } else {
                tracing::warn!(
                    env = %self.environment_id,
                    version = %patch.version,
                    previous_version = %patch.previous_version,
                    "Received an update whose previousVersion was not the latest; skipping remaining updates"
                );
                break;
            }
        }
        if applied > 0 {
            tracing::info!(env = %self.environment_id, "Applied {} update{}", applied, if applied == 1 { "" } else { "s" });
        }
        Ok(applied)
    }

    async fn consume_stream(&self, shutdown_rx: &mut watch::Receiver<bool>) -> StreamOutcome {
        let request = self
            .client
            .get(&self.stream_uri)
            .header(reqwest::header::AUTHORIZATION, &self.sdk_key)
            .header(reqwest::header::ACCEPT, "text/event-stream");

        let response = tokio::select! {
            response = request.send() => response,
            _ = shutdown_rx.changed() => return StreamOutcome::Shutdown,
        };

        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                return StreamOutcome::Error(SyncError::HttpStatus(response.status().as_u16()));
            }
            Err(e) => return StreamOutcome::Error(e.into()),
        };

        let mut parser = SseParser::new();
        let mut byte_stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                chunk = byte_stream.next() => chunk,
                _ = shutdown_rx.changed() => return StreamOutcome::Shutdown,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return StreamOutcome::Error(e.into()),
                None => return StreamOutcome::Error(SyncError::StreamEnded),
            };

            for event in parser.feed(&bytes) {
                if event.event_type.as_deref() != Some("patch") {
                    continue;
                }
                let patch: BigSegmentPatch = match serde_json::from_str(&event.data) {
                    Ok(patch) => patch,
                    Err(e) => return StreamOutcome::Error(e.into()),
                };

                match self.store.apply_patch(&patch) {
                    Ok(true) => {
                        tracing::info!(env = %self.environment_id, "Applied 1 update");
                        if let Err(e) = self.store.set_synchronized_on(unix_millis_now()) {
                            return StreamOutcome::Error(e);
                        }
                    }
                    Ok(false) => {
                        tracing::warn!(
                            env = %self.environment_id,
                            version = %patch.version,
                            previous_version = %patch.previous_version,
                            "Received an update whose previousVersion was not the latest; restarting synchronization"
                        );
                        return StreamOutcome::Restart;
                    }
                    Err(e) => return StreamOutcome::Error(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchBuilder;
    use crate::store::InMemoryBigSegmentStore;
    use bytes::Bytes;
    use futures::stream;
    use http_body_util::combinators::BoxBody;
    use http_body_util::{BodyExt, Full, StreamBody};
    use hyper::body::Frame;
    use hyper::header::AUTHORIZATION;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const TEST_SDK_KEY: &str = "sdk-99999999-9999-9999-9999-999999e42d0f";

    struct Recorded {
        path: String,
        query: Option<String>,
        authorization: Option<String>,
    }

    /// Serves one canned body per request (the last repeats) and records
    /// each request. With `streaming`, bodies are SSE frames on a
    /// connection held open forever.
    struct TestUpstream {
        port: u16,
        requests: tokio::sync::Mutex<mpsc::Receiver<Recorded>>,
    }

    impl TestUpstream {
        async fn start(bodies: Vec<String>, streaming: bool) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let (tx, rx) = mpsc::channel(64);
            let bodies = Arc::new(Mutex::new(VecDeque::from(bodies)));

            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    let tx = tx.clone();
                    let bodies = bodies.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                            let tx = tx.clone();
                            let bodies = bodies.clone();
                            async move {
                                let _ = tx
                                    .send(Recorded {
                                        path: req.uri().path().to_string(),
                                        query: req.uri().query().map(String::from),
                                        authorization: req
                                            .headers()
                                            .get(AUTHORIZATION)
                                            .and_then(|v| v.to_str().ok())
                                            .map(String::from),
                                    })
                                    .await;

                                let body = {
                                    let mut bodies = bodies.lock();
                                    match bodies.len() {
                                        0 => String::new(),
                                        1 => bodies.front().cloned().unwrap(),
                                        _ => bodies.pop_front().unwrap(),
                                    }
                                };

                                let body: BoxBody<Bytes, Infallible> = if streaming {
                                    let frames = stream::iter(vec![Ok::<_, Infallible>(
                                        Frame::data(Bytes::from(body)),
                                    )])
                                    .chain(stream::pending());
                                    BodyExt::boxed(StreamBody::new(frames))
                                } else {
                                    Full::new(Bytes::from(body))
                                        .map_err(|e| match e {})
                                        .boxed()
                                };
                                Ok::<_, Infallible>(Response::new(body))
                            }
                        });

                        let _ = hyper_util::server::conn::auto::Builder::new(
                            TokioExecutor::new(),
                        )
                        .serve_connection(TokioIo::new(socket), service)
                        .await;
                    });
                }
            });

            Self {
                port,
                requests: tokio::sync::Mutex::new(rx),
            }
        }

        fn url(&self) -> String {
            format!("http://127.0.0.1:{}", self.port)
        }

        async fn next_request(&self) -> Recorded {
            tokio::time::timeout(Duration::from_secs(5), async {
                self.requests.lock().await.recv().await
            })
            .await
            .expect("timed out waiting for upstream request")
            .expect("server channel closed")
        }
    }

    fn patch_json(patches: &[BigSegmentPatch]) -> String {
        serde_json::to_string(patches).unwrap()
    }

    fn patch_sse(patch: &BigSegmentPatch) -> String {
        let frame = shared::sse::SseEvent::new("patch", serde_json::to_string(patch).unwrap());
        String::from_utf8(frame.encode().to_vec()).unwrap()
    }

    fn synchronizer(
        poll: &TestUpstream,
        stream: &TestUpstream,
        store: Arc<InMemoryBigSegmentStore>,
    ) -> BigSegmentSynchronizer {
        BigSegmentSynchronizer::new(
            reqwest::Client::new(),
            store,
            &poll.url(),
            &stream.url(),
            "env-xyz",
            TEST_SDK_KEY,
        )
        .with_stream_retry_interval(Duration::from_millis(1))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    fn assert_poll_request(req: &Recorded, after: &str) {
        assert_eq!(req.path, POLL_PATH);
        assert_eq!(req.authorization.as_deref(), Some(TEST_SDK_KEY));
        if after.is_empty() {
            assert_eq!(req.query, None);
        } else {
            assert_eq!(req.query.as_deref(), Some(format!("after={after}").as_str()));
        }
    }

    #[tokio::test]
    async fn basic_sync_poll_then_stream() {
        let patch1 = PatchBuilder::new("segment.g1", "1", "")
            .add_includes(["included1", "included2"])
            .add_excludes(["excluded1", "excluded2"])
            .build();
        let patch2 = PatchBuilder::new("segment.g1", "2", "1")
            .remove_includes(["included1"])
            .remove_excludes(["excluded1"])
            .build();

        let poll_server = TestUpstream::start(
            vec![patch_json(&[patch1.clone()]), patch_json(&[])],
            false,
        )
        .await;
        let stream_server = TestUpstream::start(vec![patch_sse(&patch2)], true).await;

        let start_time = unix_millis_now();
        let store = Arc::new(InMemoryBigSegmentStore::new());
        let sync = synchronizer(&poll_server, &stream_server, store.clone());
        sync.start();

        // first poll has no cursor; the second carries the applied version
        assert_poll_request(&poll_server.next_request().await, "");
        assert_poll_request(&poll_server.next_request().await, "1");

        // synchronized only after the empty page
        wait_for(
            || store.synchronized_on().unwrap().is_some(),
            "synchronizedOn",
        )
        .await;
        assert!(store.synchronized_on().unwrap().unwrap() >= start_time);
        assert!(store.is_included("segment.g1", "included1"));

        // then the stream connects and delivers the next patch
        let stream_req = stream_server.next_request().await;
        assert_eq!(stream_req.path, STREAM_PATH);
        assert_eq!(stream_req.authorization.as_deref(), Some(TEST_SDK_KEY));

        wait_for(|| store.cursor().unwrap() == "2", "stream patch").await;
        assert!(!store.is_included("segment.g1", "included1"));
        assert!(store.is_included("segment.g1", "included2"));

        sync.close().await;
    }

    #[tokio::test]
    async fn out_of_order_poll_patch_discards_remainder() {
        let patch1 = PatchBuilder::new("segment.g1", "1", "")
            .add_includes(["included1"])
            .build();
        let patch1x = PatchBuilder::new("segment.g1", "1x", "non-matching-previous-version")
            .add_includes(["includedx"])
            .build();
        // chains from 1, but arrives after the broken patch so it must be
        // discarded with the rest of the page
        let patch1y = PatchBuilder::new("segment.g1", "2", "1")
            .add_includes(["includedy"])
            .build();
        let patch2 = PatchBuilder::new("segment.g1", "2", "1")
            .remove_includes(["included1"])
            .build();

        let poll_server = TestUpstream::start(
            vec![
                patch_json(&[patch1, patch1x, patch1y]),
                patch_json(&[]),
            ],
            false,
        )
        .await;
        let stream_server = TestUpstream::start(vec![patch_sse(&patch2)], true).await;

        let store = Arc::new(InMemoryBigSegmentStore::new());
        let sync = synchronizer(&poll_server, &stream_server, store.clone());
        sync.start();

        assert_poll_request(&poll_server.next_request().await, "");
        // only patch1 was applied; the next cycle polls from cursor "1"
        assert_poll_request(&poll_server.next_request().await, "1");

        wait_for(|| store.cursor().unwrap() == "2", "stream patch").await;
        // the discarded patches never touched the store
        assert!(!store.is_included("segment.g1", "includedx"));
        assert!(!store.is_included("segment.g1", "includedy"));
        assert!(!store.is_included("segment.g1", "included1"));

        sync.close().await;
    }

    #[tokio::test]
    async fn out_of_order_stream_patch_restarts_cycle() {
        let patch1 = PatchBuilder::new("segment.g1", "1", "")
            .add_includes(["included1"])
            .build();
        let patch2x = PatchBuilder::new("segment.g1", "2", "non-matching-previous-version")
            .remove_includes(["included1"])
            .build();
        let patch2 = PatchBuilder::new("segment.g1", "2", "1")
            .remove_includes(["included1"])
            .build();

        let poll_server = TestUpstream::start(
            vec![patch_json(&[patch1]), patch_json(&[])],
            false,
        )
        .await;
        // first connection delivers the broken patch; the reconnect
        // delivers the one that chains
        let stream_server =
            TestUpstream::start(vec![patch_sse(&patch2x), patch_sse(&patch2)], true).await;

        let store = Arc::new(InMemoryBigSegmentStore::new());
        let sync = synchronizer(&poll_server, &stream_server, store.clone());
        sync.start();

        assert_poll_request(&poll_server.next_request().await, "");
        assert_poll_request(&poll_server.next_request().await, "1");

        // first stream connection; its patch does not chain
        let _ = stream_server.next_request().await;

        // the cycle restarts: a poll that still observes cursor "1",
        // then a second stream connection
        assert_poll_request(&poll_server.next_request().await, "1");
        let _ = stream_server.next_request().await;

        wait_for(|| store.cursor().unwrap() == "2", "second stream patch").await;
        assert!(!store.is_included("segment.g1", "included1"));

        sync.close().await;
    }

    #[tokio::test]
    async fn close_stops_the_worker() {
        let poll_server = TestUpstream::start(vec![patch_json(&[])], false).await;
        let stream_server = TestUpstream::start(vec![String::new()], true).await;

        let store = Arc::new(InMemoryBigSegmentStore::new());
        let sync = synchronizer(&poll_server, &stream_server, store.clone());
        sync.start();

        wait_for(
            || store.synchronized_on().unwrap().is_some(),
            "initial sync",
        )
        .await;

        // returns only once the worker has exited; twice is fine
        sync.close().await;
        sync.close().await;
    }
}

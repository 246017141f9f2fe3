//! Default upstream SDK client.
//!
//! The real vendor SDK library is an external collaborator; this built-in
//! client implements just enough of the upstream streaming protocol to keep
//! the store adapter populated: one long-lived SSE subscription per
//! environment, `put`/`patch`/`delete` events applied in order, reconnect
//! with backoff.

use crate::errors::RelayError;
use crate::relayenv::{ClientConfig, ClientFactory, LdClient};
use crate::store::{AllData, DataKind, ItemDescriptor, StoreAdapter};
use futures::StreamExt;
use serde_json::Value;
use shared::sse::{SseEvent, SseParser};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

const INIT_WAIT: Duration = Duration::from_secs(15);
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

pub fn streaming_client_factory() -> ClientFactory {
    type ClientResult = Result<Arc<dyn LdClient>, RelayError>;
    ClientFactory {
        sdk_version: env!("CARGO_PKG_VERSION"),
        create: Arc::new(
            |sdk_key, config| -> futures::future::BoxFuture<'static, ClientResult> {
                Box::pin(async move {
                    let client = StreamingClient::start(sdk_key, config)?;
                    client.wait_initialized(INIT_WAIT).await?;
                    Ok(Arc::new(client) as Arc<dyn LdClient>)
                })
            },
        ),
    }
}

enum ConnState {
    Connecting,
    Connected,
    Failed(String),
}

pub struct StreamingClient {
    initialized: Arc<AtomicBool>,
    state_rx: watch::Receiver<ConnState>,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamingClient {
    fn start(sdk_key: String, config: ClientConfig) -> Result<Self, RelayError> {
        let http_client = config.http.streaming_client()?;
        let initialized = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_stream(StreamParams {
            uri: format!("{}/all", config.stream_uri.trim_end_matches('/')),
            sdk_key,
            http_client,
            store: config.store,
            initialized: initialized.clone(),
            state_tx,
            shutdown_rx,
        }));

        Ok(Self {
            initialized,
            state_rx,
            shutdown_tx,
        })
    }

    /// Waits for the first full dataset. A fatal upstream rejection is an
    /// error; a slow upstream is not (the background task keeps retrying and
    /// the environment reports disconnected until data arrives).
    async fn wait_initialized(&self, timeout: Duration) -> Result<(), RelayError> {
        let mut state_rx = self.state_rx.clone();
        let wait = async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnState::Connected => return Ok(()),
                    ConnState::Failed(message) => {
                        return Err(RelayError::UpstreamTransient(message.clone()));
                    }
                    ConnState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(RelayError::Internal("stream task exited".into()));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Timed out waiting for initial data; continuing to retry");
                Ok(())
            }
        }
    }
}

impl LdClient for StreamingClient {
    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct StreamParams {
    uri: String,
    sdk_key: String,
    http_client: reqwest::Client,
    store: Arc<StoreAdapter>,
    initialized: Arc<AtomicBool>,
    state_tx: watch::Sender<ConnState>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn run_stream(params: StreamParams) {
    let StreamParams {
        uri,
        sdk_key,
        http_client,
        store,
        initialized,
        state_tx,
        mut shutdown_rx,
    } = params;

    let mut delay = RECONNECT_BASE_DELAY;
    loop {
        let outcome = tokio::select! {
            outcome = connect_and_read(&uri, &sdk_key, &http_client, &store, &initialized, &state_tx) => outcome,
            _ = shutdown_rx.changed() => return,
        };

        match outcome {
            StreamOutcome::Fatal(message) => {
                let _ = state_tx.send(ConnState::Failed(message));
                return;
            }
            StreamOutcome::Reconnect(reason) => {
                tracing::warn!(error = %reason, delay_ms = delay.as_millis() as u64, "Upstream stream interrupted; reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => return,
                }
                delay = std::cmp::min(delay * 2, RECONNECT_MAX_DELAY);
            }
        }
    }
}

enum StreamOutcome {
    Reconnect(String),
    Fatal(String),
}

async fn connect_and_read(
    uri: &str,
    sdk_key: &str,
    http_client: &reqwest::Client,
    store: &Arc<StoreAdapter>,
    initialized: &AtomicBool,
    state_tx: &watch::Sender<ConnState>,
) -> StreamOutcome {
    let response = match http_client
        .get(uri)
        .header(reqwest::header::AUTHORIZATION, sdk_key)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => return StreamOutcome::Reconnect(e.to_string()),
    };

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return StreamOutcome::Fatal(format!("upstream rejected SDK key (HTTP {status})"));
    }
    if !status.is_success() {
        return StreamOutcome::Reconnect(format!("HTTP {status}"));
    }

    let mut parser = SseParser::new();
    let mut byte_stream = response.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(e) => return StreamOutcome::Reconnect(e.to_string()),
        };
        for event in parser.feed(&bytes) {
            if let Err(e) = apply_event(store, &event) {
                tracing::warn!(error = %e, "Ignoring malformed stream event");
                continue;
            }
            if event.event_type.as_deref() == Some("put") {
                initialized.store(true, Ordering::SeqCst);
                let _ = state_tx.send(ConnState::Connected);
            }
        }
    }

    StreamOutcome::Reconnect("stream ended".into())
}

fn apply_event(store: &Arc<StoreAdapter>, event: &SseEvent) -> Result<(), RelayError> {
    let parse = |data: &str| {
        serde_json::from_str::<Value>(data)
            .map_err(|e| RelayError::BadRequest(format!("bad event payload: {e}")))
    };

    match event.event_type.as_deref() {
        Some("put") => {
            let payload = parse(&event.data)?;
            // the payload nests the dataset under "data" when a path is present
            let dataset = if payload.get("data").is_some() {
                &payload["data"]
            } else {
                &payload
            };
            store.init(parse_all_data(dataset));
            Ok(())
        }
        Some("patch") => {
            let payload = parse(&event.data)?;
            let (kind, key) = parse_data_path(payload["path"].as_str().unwrap_or(""))?;
            let item = payload["data"].clone();
            let version = item["version"].as_u64().unwrap_or(0);
            store.upsert(kind, &key, ItemDescriptor::new(version, item));
            Ok(())
        }
        Some("delete") => {
            let payload = parse(&event.data)?;
            let (kind, key) = parse_data_path(payload["path"].as_str().unwrap_or(""))?;
            let version = payload["version"].as_u64().unwrap_or(0);
            store.upsert(kind, &key, ItemDescriptor::deleted(version));
            Ok(())
        }
        // comments and unknown events are ignored
        _ => Ok(()),
    }
}

fn parse_all_data(dataset: &Value) -> AllData {
    let mut all_data: AllData = HashMap::new();
    for (field, kind) in [("flags", DataKind::Features), ("segments", DataKind::Segments)] {
        let mut items = HashMap::new();
        if let Some(object) = dataset[field].as_object() {
            for (key, item) in object {
                let version = item["version"].as_u64().unwrap_or(0);
                items.insert(key.clone(), ItemDescriptor::new(version, item.clone()));
            }
        }
        all_data.insert(kind, items);
    }
    all_data
}

fn parse_data_path(path: &str) -> Result<(DataKind, String), RelayError> {
    for kind in [DataKind::Features, DataKind::Segments] {
        if let Some(key) = path.strip_prefix(kind.patch_path_prefix()) {
            if !key.is_empty() {
                return Ok((kind, key.to_string()));
            }
        }
    }
    Err(RelayError::BadRequest(format!("bad data path: {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryDataStore, StoreAdapter};
    use crate::streams::{EnvStreams, Publishers};
    use serde_json::json;

    fn adapter() -> Arc<StoreAdapter> {
        let publishers = Publishers::new(Duration::from_secs(180));
        StoreAdapter::new(
            Arc::new(InMemoryDataStore::new()),
            EnvStreams::new(publishers),
        )
    }

    #[test]
    fn put_initializes_the_store() {
        let store = adapter();
        let event = SseEvent::new(
            "put",
            json!({
                "path": "/",
                "data": {
                    "flags": {"f1": {"key": "f1", "version": 3}},
                    "segments": {"s1": {"key": "s1", "version": 1}},
                }
            })
            .to_string(),
        );
        apply_event(&store, &event).unwrap();

        assert!(store.is_initialized());
        assert_eq!(store.get(DataKind::Features, "f1").unwrap().version, 3);
        assert_eq!(store.get(DataKind::Segments, "s1").unwrap().version, 1);
    }

    #[test]
    fn patch_and_delete_apply_in_order() {
        let store = adapter();
        apply_event(
            &store,
            &SseEvent::new(
                "patch",
                json!({"path": "/flags/f1", "data": {"key": "f1", "version": 1}}).to_string(),
            ),
        )
        .unwrap();
        apply_event(
            &store,
            &SseEvent::new(
                "delete",
                json!({"path": "/flags/f1", "version": 2}).to_string(),
            ),
        )
        .unwrap();

        let descriptor = store.get(DataKind::Features, "f1").unwrap();
        assert_eq!(descriptor.version, 2);
        assert!(descriptor.item.is_none());
    }

    #[test]
    fn bad_paths_are_rejected() {
        assert!(parse_data_path("/flags/f1").is_ok());
        assert!(parse_data_path("/segments/s1").is_ok());
        assert!(parse_data_path("/other/x").is_err());
        assert!(parse_data_path("/flags/").is_err());
        assert!(parse_data_path("").is_err());
    }
}

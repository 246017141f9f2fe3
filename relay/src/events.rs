//! Event-forwarding pipeline.
//!
//! Downstream SDKs hand their analytics payloads to the relay, which queues,
//! coalesces, and POSTs them to the upstream events service under the
//! environment's SDK key. Each environment gets one dispatcher; each
//! endpoint kind gets its own bounded queue and forwarder task.

use crate::config::EventsConfig;
use crate::errors::RelayError;
use crate::httpconfig::HttpConfig;
use crate::metrics_defs::{EVENT_POST_DURATION, EVENT_POSTS, EVENTS_DROPPED, EVENTS_RECEIVED};
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

pub const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";
pub const EVENT_USER_AGENT_HEADER: &str = "X-LaunchDarkly-User-Agent";

/// Schema version attached to payloads the relay synthesizes itself (the
/// tracking pixel path).
pub const SUMMARY_EVENTS_SCHEMA_VERSION: u32 = 3;

const POST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_POST_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
const DROP_WARN_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventEndpoint {
    ServerEvents,
    ServerDiagnostic,
    MobileEvents,
    MobileDiagnostic,
    JsEvents,
    JsDiagnostic,
}

impl EventEndpoint {
    pub const ALL: [EventEndpoint; 6] = [
        EventEndpoint::ServerEvents,
        EventEndpoint::ServerDiagnostic,
        EventEndpoint::MobileEvents,
        EventEndpoint::MobileDiagnostic,
        EventEndpoint::JsEvents,
        EventEndpoint::JsDiagnostic,
    ];

    pub const fn metric_label(&self) -> &'static str {
        match self {
            EventEndpoint::ServerEvents => "server",
            EventEndpoint::ServerDiagnostic => "server-diagnostic",
            EventEndpoint::MobileEvents => "mobile",
            EventEndpoint::MobileDiagnostic => "mobile-diagnostic",
            EventEndpoint::JsEvents => "js",
            EventEndpoint::JsDiagnostic => "js-diagnostic",
        }
    }

    /// Path on the upstream events host. Browser endpoints embed the
    /// environment ID and exist only when the environment has one.
    fn upstream_path(&self, env_id: Option<&str>) -> Option<String> {
        match self {
            EventEndpoint::ServerEvents => Some("/bulk".to_string()),
            EventEndpoint::ServerDiagnostic => Some("/diagnostic".to_string()),
            EventEndpoint::MobileEvents => Some("/mobile".to_string()),
            EventEndpoint::MobileDiagnostic => Some("/mobile/events/diagnostic".to_string()),
            EventEndpoint::JsEvents => env_id.map(|id| format!("/events/bulk/{id}")),
            EventEndpoint::JsDiagnostic => env_id.map(|id| format!("/events/diagnostic/{id}")),
        }
    }
}

/// A payload received from a downstream SDK, with the headers that must be
/// preserved when it goes upstream.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub body: Bytes,
    pub schema_version: Option<String>,
    pub user_agent: Option<String>,
}

struct BatchMeta {
    schema_version: Option<String>,
    user_agent: Option<String>,
}

pub struct EventDispatcher {
    senders: HashMap<EventEndpoint, mpsc::Sender<EventEnvelope>>,
    disabled: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    last_drop_warn: Mutex<Option<Instant>>,
}

impl EventDispatcher {
    pub fn new(
        sdk_key: String,
        env_id: Option<String>,
        events_config: &EventsConfig,
        http_config: &HttpConfig,
    ) -> Result<Arc<Self>, RelayError> {
        let client = http_config.client(POST_TIMEOUT)?;
        let base_uri = events_config.events_uri.trim_end_matches('/').to_string();
        let capacity = events_config.capacity.max(1);
        let disabled = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, _) = watch::channel(false);

        let mut senders = HashMap::new();
        for endpoint in EventEndpoint::ALL {
            let Some(path) = endpoint.upstream_path(env_id.as_deref()) else {
                continue;
            };
            let (tx, rx) = mpsc::channel(capacity);
            senders.insert(endpoint, tx);

            tokio::spawn(run_forwarder(ForwarderParams {
                endpoint,
                uri: format!("{base_uri}{path}"),
                sdk_key: sdk_key.clone(),
                client: client.clone(),
                flush_interval: events_config.flush_interval(),
                batch_limit: capacity,
                disabled: disabled.clone(),
                rx,
                shutdown_rx: shutdown_tx.subscribe(),
            }));
        }

        Ok(Arc::new(Self {
            senders,
            disabled,
            shutdown_tx,
            last_drop_warn: Mutex::new(None),
        }))
    }

    pub fn has_endpoint(&self, endpoint: EventEndpoint) -> bool {
        self.senders.contains_key(&endpoint)
    }

    /// True after the upstream rejected our credential; cleared only by
    /// credential rotation (which replaces the dispatcher).
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue. Overflow drops the payload and counts it; a
    /// warning is logged at most once per window.
    pub fn submit(&self, endpoint: EventEndpoint, envelope: EventEnvelope) -> Result<(), RelayError> {
        let sender = self.senders.get(&endpoint).ok_or_else(|| {
            RelayError::ServiceUnavailable(
                "Event proxy for browser clients is not enabled for this environment".into(),
            )
        })?;

        if self.is_disabled() {
            metrics::counter!(EVENTS_DROPPED.name, "endpoint" => endpoint.metric_label(), "reason" => "disabled")
                .increment(1);
            return Ok(());
        }

        metrics::counter!(EVENTS_RECEIVED.name, "endpoint" => endpoint.metric_label()).increment(1);

        if sender.try_send(envelope).is_err() {
            metrics::counter!(EVENTS_DROPPED.name, "endpoint" => endpoint.metric_label(), "reason" => "queue_full")
                .increment(1);
            let mut last = self.last_drop_warn.lock();
            if last.is_none_or(|t| t.elapsed() >= DROP_WARN_INTERVAL) {
                tracing::warn!(
                    endpoint = endpoint.metric_label(),
                    "Event queue is full; dropping events"
                );
                *last = Some(Instant::now());
            }
        }
        Ok(())
    }

    /// Stops the forwarder tasks after a final flush. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct ForwarderParams {
    endpoint: EventEndpoint,
    uri: String,
    sdk_key: String,
    client: reqwest::Client,
    flush_interval: Duration,
    batch_limit: usize,
    disabled: Arc<AtomicBool>,
    rx: mpsc::Receiver<EventEnvelope>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn run_forwarder(params: ForwarderParams) {
    let ForwarderParams {
        endpoint,
        uri,
        sdk_key,
        client,
        flush_interval,
        batch_limit,
        disabled,
        mut rx,
        mut shutdown_rx,
    } = params;

    let mut batch: Vec<Value> = Vec::new();
    let mut meta = BatchMeta {
        schema_version: None,
        user_agent: None,
    };
    let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                flush(&client, &uri, &sdk_key, endpoint, &disabled, &mut batch, &mut meta).await;
                return;
            }
            envelope = rx.recv() => match envelope {
                Some(envelope) => {
                    accept_payload(endpoint, envelope, &mut batch, &mut meta);
                    if batch.len() >= batch_limit {
                        flush(&client, &uri, &sdk_key, endpoint, &disabled, &mut batch, &mut meta).await;
                    }
                }
                None => {
                    flush(&client, &uri, &sdk_key, endpoint, &disabled, &mut batch, &mut meta).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&client, &uri, &sdk_key, endpoint, &disabled, &mut batch, &mut meta).await;
                }
            }
        }
    }
}

/// Coalesces one payload into the pending batch. Payloads are JSON arrays
/// from the SDKs; a bare object is treated as a single event.
fn accept_payload(
    endpoint: EventEndpoint,
    envelope: EventEnvelope,
    batch: &mut Vec<Value>,
    meta: &mut BatchMeta,
) {
    match serde_json::from_slice::<Value>(&envelope.body) {
        Ok(Value::Array(items)) => batch.extend(items),
        Ok(single) => batch.push(single),
        Err(e) => {
            tracing::warn!(endpoint = endpoint.metric_label(), error = %e, "Discarding unparseable event payload");
            metrics::counter!(EVENTS_DROPPED.name, "endpoint" => endpoint.metric_label(), "reason" => "unparseable")
                .increment(1);
            return;
        }
    }
    if envelope.schema_version.is_some() {
        meta.schema_version = envelope.schema_version;
    }
    if envelope.user_agent.is_some() {
        meta.user_agent = envelope.user_agent;
    }
}

async fn flush(
    client: &reqwest::Client,
    uri: &str,
    sdk_key: &str,
    endpoint: EventEndpoint,
    disabled: &AtomicBool,
    batch: &mut Vec<Value>,
    meta: &mut BatchMeta,
) {
    if batch.is_empty() || disabled.load(Ordering::SeqCst) {
        batch.clear();
        return;
    }
    let payload = Value::Array(std::mem::take(batch));
    let meta = std::mem::replace(
        meta,
        BatchMeta {
            schema_version: None,
            user_agent: None,
        },
    );

    let mut delay = RETRY_BASE_DELAY;
    for attempt in 0..MAX_POST_ATTEMPTS {
        let mut request = client
            .post(uri)
            .header(reqwest::header::AUTHORIZATION, sdk_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&payload);
        if let Some(schema) = &meta.schema_version {
            request = request.header(EVENT_SCHEMA_HEADER, schema);
        }
        if let Some(user_agent) = &meta.user_agent {
            request = request.header(EVENT_USER_AGENT_HEADER, user_agent);
        }

        let start = Instant::now();
        let result = request.send().await;
        metrics::histogram!(EVENT_POST_DURATION.name, "endpoint" => endpoint.metric_label())
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(response) => {
                let status = response.status();
                metrics::counter!(EVENT_POSTS.name,
                    "endpoint" => endpoint.metric_label(),
                    "status" => status.as_u16().to_string())
                .increment(1);

                if status.is_success() {
                    return;
                }
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    tracing::error!(
                        endpoint = endpoint.metric_label(),
                        status = status.as_u16(),
                        "Upstream rejected our credential; disabling event forwarding until rotation"
                    );
                    disabled.store(true, Ordering::SeqCst);
                    return;
                }
                let retriable = status.is_server_error()
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
                if !retriable {
                    tracing::warn!(
                        endpoint = endpoint.metric_label(),
                        status = status.as_u16(),
                        "Upstream rejected event batch; dropping it"
                    );
                    return;
                }
            }
            Err(e) => {
                metrics::counter!(EVENT_POSTS.name,
                    "endpoint" => endpoint.metric_label(), "status" => "error")
                .increment(1);
                tracing::warn!(endpoint = endpoint.metric_label(), error = %e, "Event POST failed");
            }
        }

        if attempt + 1 < MAX_POST_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay = std::cmp::min(delay * 2, RETRY_MAX_DELAY);
        }
    }
    tracing::warn!(
        endpoint = endpoint.metric_label(),
        "Event batch dropped after retries were exhausted"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventsConfig;
    use crate::testutils::RecordingServer;

    fn dispatcher_for(server: &RecordingServer, capacity: usize) -> Arc<EventDispatcher> {
        // a long flush interval makes the batch-size threshold the only
        // trigger, keeping the tests deterministic
        dispatcher_with(server, capacity, 60)
    }

    fn dispatcher_with(
        server: &RecordingServer,
        capacity: usize,
        flush_interval_secs: u64,
    ) -> Arc<EventDispatcher> {
        let events_config = EventsConfig {
            send_events: true,
            events_uri: server.url(),
            flush_interval_secs,
            capacity,
        };
        let http_config = HttpConfig::new(&Default::default()).unwrap();
        EventDispatcher::new(
            "sdk-key".into(),
            Some("env-id".into()),
            &events_config,
            &http_config,
        )
        .unwrap()
    }

    fn envelope(body: &str) -> EventEnvelope {
        EventEnvelope {
            body: Bytes::from(body.to_string()),
            schema_version: Some("4".into()),
            user_agent: Some("TestSDK/1.0".into()),
        }
    }

    #[tokio::test]
    async fn payloads_are_coalesced_and_forwarded_with_credential() {
        let server = RecordingServer::start(vec![(200, "".into())]).await;
        // batch limit of two: the second submission triggers the flush
        let dispatcher = dispatcher_for(&server, 2);

        dispatcher
            .submit(EventEndpoint::ServerEvents, envelope(r#"[{"kind":"identify"}]"#))
            .unwrap();
        dispatcher
            .submit(EventEndpoint::ServerEvents, envelope(r#"[{"kind":"custom"}]"#))
            .unwrap();

        let request = server.next_request().await;
        assert_eq!(request.path, "/bulk");
        assert_eq!(request.authorization.as_deref(), Some("sdk-key"));
        assert_eq!(request.headers.get(EVENT_SCHEMA_HEADER).unwrap(), "4");
        assert_eq!(
            request.headers.get(EVENT_USER_AGENT_HEADER).unwrap(),
            "TestSDK/1.0"
        );

        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["kind"], "identify");
        assert_eq!(items[1]["kind"], "custom");

        dispatcher.close();
    }

    #[tokio::test]
    async fn js_endpoint_uses_environment_id_path() {
        let server = RecordingServer::start(vec![(202, "".into())]).await;
        let dispatcher = dispatcher_for(&server, 1);

        dispatcher
            .submit(EventEndpoint::JsEvents, envelope(r#"[{"kind":"page"}]"#))
            .unwrap();

        let request = server.next_request().await;
        assert_eq!(request.path, "/events/bulk/env-id");
        dispatcher.close();
    }

    #[tokio::test]
    async fn unauthorized_response_disables_dispatcher() {
        let server = RecordingServer::start(vec![(401, "".into())]).await;
        let dispatcher = dispatcher_for(&server, 1);

        dispatcher
            .submit(EventEndpoint::ServerEvents, envelope(r#"[{"kind":"identify"}]"#))
            .unwrap();
        let _ = server.next_request().await;

        // the disable flag is set by the forwarder task after the response
        tokio::time::timeout(Duration::from_secs(2), async {
            while !dispatcher.is_disabled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dispatcher should disable itself on 401");

        // subsequent submissions are silently dropped
        dispatcher
            .submit(EventEndpoint::ServerEvents, envelope(r#"[{"kind":"more"}]"#))
            .unwrap();
        dispatcher.close();
    }

    #[tokio::test]
    async fn missing_js_endpoint_without_env_id() {
        let server = RecordingServer::start(vec![]).await;
        let events_config = EventsConfig {
            send_events: true,
            events_uri: server.url(),
            flush_interval_secs: 1,
            capacity: 10,
        };
        let http_config = HttpConfig::new(&Default::default()).unwrap();
        let dispatcher =
            EventDispatcher::new("sdk-key".into(), None, &events_config, &http_config).unwrap();

        assert!(!dispatcher.has_endpoint(EventEndpoint::JsEvents));
        let result = dispatcher.submit(
            EventEndpoint::JsEvents,
            envelope(r#"[{"kind":"identify"}]"#),
        );
        assert!(matches!(result, Err(RelayError::ServiceUnavailable(_))));
        dispatcher.close();
    }

    #[tokio::test]
    async fn unparseable_payload_is_dropped_not_forwarded() {
        let server = RecordingServer::start(vec![(200, "".into())]).await;
        // short flush interval: the surviving single event goes out on a tick
        let dispatcher = dispatcher_with(&server, 100, 1);

        dispatcher
            .submit(EventEndpoint::ServerEvents, envelope("this is not json"))
            .unwrap();
        dispatcher
            .submit(EventEndpoint::ServerEvents, envelope(r#"[{"kind":"ok"}]"#))
            .unwrap();

        let request = server.next_request().await;
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
        dispatcher.close();
    }
}

//! SSE stream endpoints.
//!
//! A handler subscribes to the environment's topic on the right publisher,
//! writes the snapshot event, then relays published events until the client
//! disconnects, interleaving comment heartbeats so intermediaries keep the
//! connection alive.

use crate::credentials::SdkKind;
use crate::dispatch::{RelayBody, RequestContext};
use crate::errors::RelayError;
use crate::metrics_defs::STREAM_CONNECTIONS;
use crate::relayenv::RelayCore;
use crate::routes::{Action, RouteSpec};
use crate::streams::{StreamKind, Subscription};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use shared::sse::heartbeat_frame;
use std::convert::Infallible;
use std::time::Duration;

pub fn stream_handler(
    core: &RelayCore,
    ctx: &RequestContext,
    spec: RouteSpec,
) -> Result<Response<RelayBody>, RelayError> {
    let stream_kind = match (spec.action, ctx.kind) {
        (Action::StreamAll, _) => StreamKind::ServerSideAll,
        (Action::StreamFlags, _) => StreamKind::ServerSideFlagsOnly,
        (Action::StreamPing, SdkKind::Mobile) => StreamKind::MobilePing,
        (Action::StreamPing, SdkKind::Js) => StreamKind::JsPing,
        _ => return Err(RelayError::Internal("not a stream route".into())),
    };
    tracing::debug!(
        env = ctx.env.name(),
        stream = stream_kind.as_str(),
        "Application requested stream"
    );

    let credential = ctx
        .env
        .stream_credential(stream_kind)
        .ok_or(RelayError::UnknownEnvironment)?;

    let publishers = core.publishers();
    let subscription = publishers
        .get(stream_kind)
        .subscribe(credential)
        .ok_or(RelayError::Closed)?;

    let guard = ConnectionGuard::new(ctx.kind, ctx.env.name());
    let body = sse_body(subscription, publishers.heartbeat_interval(), guard);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    // Defeat buffering in reverse proxies; SSE needs every frame flushed
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    Ok(response)
}

fn sse_body(subscription: Subscription, heartbeat: Duration, guard: ConnectionGuard) -> RelayBody {
    let Subscription { initial, receiver } = subscription;

    let start = tokio::time::Instant::now() + heartbeat;
    let ticker = tokio::time::interval_at(start, heartbeat);

    let live = stream::unfold(
        (receiver, ticker, guard),
        |(mut receiver, mut ticker, guard)| async move {
            tokio::select! {
                frame = receiver.recv() => {
                    // None: the publisher tore the topic down
                    frame.map(|frame| (frame, (receiver, ticker, guard)))
                }
                _ = ticker.tick() => Some((heartbeat_frame(), (receiver, ticker, guard))),
            }
        },
    );

    let frames = stream::iter([initial])
        .chain(live)
        .map(|bytes: Bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    BodyExt::boxed(StreamBody::new(frames))
}

/// Keeps the per-kind connection gauge accurate: up on subscribe, down when
/// the body stream is dropped (client disconnect or teardown).
struct ConnectionGuard {
    kind: &'static str,
    env: String,
}

impl ConnectionGuard {
    fn new(kind: SdkKind, env: &str) -> Self {
        let kind = kind.metric_label();
        metrics::gauge!(STREAM_CONNECTIONS.name, "kind" => kind, "env" => env.to_string())
            .increment(1.0);
        Self {
            kind,
            env: env.to_string(),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::gauge!(STREAM_CONNECTIONS.name, "kind" => self.kind, "env" => self.env.clone())
            .decrement(1.0);
    }
}

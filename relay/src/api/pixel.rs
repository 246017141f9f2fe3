//! Browser tracking pixel.
//!
//! Browsers that cannot POST cross-origin load a 1×1 GIF whose `d` query
//! parameter carries the base64-encoded event payload. The payload is
//! submitted to the JS events dispatcher asynchronously; the image is
//! returned regardless of what happens to the submission.

use crate::dispatch::{RelayBody, RequestContext};
use crate::errors::RelayError;
use crate::events::{EventEndpoint, EventEnvelope, SUMMARY_EVENTS_SCHEMA_VERSION};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use hyper::Response;
use hyper::header::{CONTENT_TYPE, HeaderValue};

use super::utils::full_body;

/// A transparent 1×1 GIF, all 43 bytes of it.
pub static TRANSPARENT_1X1_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub fn events_image_handler(ctx: &RequestContext) -> Result<Response<RelayBody>, RelayError> {
    let dispatcher = ctx.env.event_dispatcher().ok_or_else(|| {
        RelayError::ServiceUnavailable("Event proxy is not enabled for this environment".into())
    })?;
    if !dispatcher.has_endpoint(EventEndpoint::JsEvents) {
        return Err(RelayError::ServiceUnavailable(
            "Event proxy for browser clients is not enabled for this environment".into(),
        ));
    }

    if let Some(d) = ctx.query.get("d").filter(|d| !d.is_empty()) {
        match STANDARD.decode(d) {
            Ok(event_data) => {
                let envelope = EventEnvelope {
                    body: Bytes::from(event_data),
                    schema_version: Some(SUMMARY_EVENTS_SCHEMA_VERSION.to_string()),
                    user_agent: ctx
                        .headers
                        .get(crate::events::EVENT_USER_AGENT_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from),
                };
                // Fire and forget: the image response never waits on the
                // submission outcome
                let _ = dispatcher.submit(EventEndpoint::JsEvents, envelope);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring undecodable tracking-pixel payload");
            }
        }
    }

    let mut response = Response::new(full_body(Bytes::from_static(TRANSPARENT_1X1_GIF)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("image/gif"));
    Ok(response)
}

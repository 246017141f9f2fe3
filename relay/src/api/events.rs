//! Downstream event ingestion endpoints.

use crate::dispatch::{RelayBody, RequestContext};
use crate::errors::RelayError;
use crate::events::{EVENT_SCHEMA_HEADER, EVENT_USER_AGENT_HEADER, EventEndpoint, EventEnvelope};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};

use super::utils::full_body;

pub fn bulk_event_handler(
    ctx: &RequestContext,
    endpoint: EventEndpoint,
) -> Result<Response<RelayBody>, RelayError> {
    let dispatcher = ctx.env.event_dispatcher().ok_or_else(|| {
        RelayError::ServiceUnavailable("Event proxy is not enabled for this environment".into())
    })?;

    let content_type = ctx
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Err(RelayError::UnsupportedContentType);
    }

    let header_value = |name: &str| {
        ctx.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };

    dispatcher.submit(
        endpoint,
        EventEnvelope {
            body: ctx.body.clone(),
            schema_version: header_value(EVENT_SCHEMA_HEADER),
            user_agent: header_value(EVENT_USER_AGENT_HEADER),
        },
    )?;

    let mut response = Response::new(full_body(bytes::Bytes::new()));
    *response.status_mut() = StatusCode::ACCEPTED;
    Ok(response)
}

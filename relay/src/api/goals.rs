//! Passthrough proxy for the upstream goals API, which browser SDKs fetch
//! for click/pageview experiment definitions.

use crate::dispatch::{RelayBody, RequestContext};
use crate::errors::RelayError;
use bytes::Bytes;
use hyper::{Response, StatusCode};
use shared::http::normalize_proxied_headers;

use super::utils::full_body;

pub async fn goals_handler(ctx: &RequestContext) -> Result<Response<RelayBody>, RelayError> {
    let env_id = ctx
        .params
        .get("envId")
        .ok_or(RelayError::UnknownEnvironment)?;
    let uri = format!(
        "{}/sdk/goals/{env_id}",
        ctx.env.base_uri().trim_end_matches('/')
    );

    let upstream = ctx
        .env
        .http_client()
        .get(&uri)
        .send()
        .await
        .map_err(|e| RelayError::UpstreamTransient(e.to_string()))?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let version = upstream.version();
    let mut headers = upstream.headers().clone();
    normalize_proxied_headers(&mut headers, version);

    let body = upstream
        .bytes()
        .await
        .map_err(|e| RelayError::UpstreamTransient(e.to_string()))?;

    let mut response = Response::new(full_body(Bytes::from(body)));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

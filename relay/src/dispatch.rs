//! Request dispatch: route resolution, CORS, credential resolution,
//! environment lookup, request counting, and handler invocation.

use crate::api;
use crate::credentials::SdkKind;
use crate::errors::RelayError;
use crate::metrics_defs::REQUESTS;
use crate::relayenv::{EnvironmentContext, RelayCore};
use crate::routes::{Action, RouteSpec};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ALLOW, CACHE_CONTROL, HeaderMap,
    HeaderValue, ORIGIN,
};
use hyper::{Method, Response, StatusCode};
use routing::{Resolution, RouteSet};
use shared::http::make_boxed_error_response;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

pub type RelayBody = BoxBody<Bytes, Infallible>;

const ALLOWED_REQUEST_HEADERS: &str = "Cache-Control, Content-Type, Content-Length, \
     Accept-Encoding, X-LaunchDarkly-User-Agent, X-LaunchDarkly-Payload-ID, \
     X-LaunchDarkly-Wrapper, X-LaunchDarkly-Event-Schema";
const EXPOSED_RESPONSE_HEADERS: &str = "Date";
const PREFLIGHT_MAX_AGE: &str = "300";

/// Everything a handler needs about the request, with the environment
/// already resolved. Handlers never see an unresolved request.
pub struct RequestContext {
    pub env: Arc<EnvironmentContext>,
    pub kind: SdkKind,
    pub params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub method: Method,
    pub body: Bytes,
}

pub async fn handle_request(
    core: &RelayCore,
    routes: &RouteSet<RouteSpec>,
    parts: http::request::Parts,
    body: Bytes,
) -> Response<RelayBody> {
    let path = parts.uri.path().to_string();
    tracing::debug!(method = %parts.method, path = %path, "Incoming request");

    let (spec, params) = match routes.resolve(&parts.method, &path) {
        Resolution::Matched(m) => (*m.action, m.params),
        Resolution::MethodNotAllowed { allowed, any_action } => {
            if parts.method == Method::OPTIONS && any_action.is_cors() {
                return preflight_response(&parts.headers, &allowed);
            }
            let mut response =
                make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
            if let Ok(value) = HeaderValue::from_str(&allow_header_value(&allowed)) {
                response.headers_mut().insert(ALLOW, value);
            }
            return response;
        }
        Resolution::NotFound => {
            return make_boxed_error_response(StatusCode::NOT_FOUND, "not found");
        }
    };

    let query = parse_query(parts.uri.query());

    let result = match spec.kind {
        None => match spec.action {
            Action::Status => Ok(api::status::status_handler(core)),
            _ => Err(RelayError::Internal("route without an SDK kind".into())),
        },
        Some(kind) => {
            match resolve_environment(core, kind, &parts.headers, &params) {
                Ok(env) => {
                    metrics::counter!(REQUESTS.name,
                        "kind" => kind.metric_label(),
                        "env" => env.name().to_string())
                    .increment(1);

                    let ctx = RequestContext {
                        env,
                        kind,
                        params,
                        query,
                        headers: parts.headers.clone(),
                        method: parts.method.clone(),
                        body,
                    };
                    dispatch_action(core, spec, ctx).await
                }
                Err(e) => Err(e),
            }
        }
    };

    let mut response = match result {
        Ok(response) => response,
        Err(e) => make_boxed_error_response(e.status_code(), &e.to_string()),
    };

    if spec.is_cors() {
        apply_cors_headers(response.headers_mut(), &parts.headers);
    }
    response
}

async fn dispatch_action(
    core: &RelayCore,
    spec: RouteSpec,
    ctx: RequestContext,
) -> Result<Response<RelayBody>, RelayError> {
    let mut response = match spec.action {
        Action::Status => unreachable!("status carries no SDK kind"),
        Action::Evaluate { full } => api::evaluate::evaluate_handler(&ctx, full)?,
        Action::PollAllFlags => api::poll::all_flags_handler(&ctx)?,
        Action::PollFlag => api::poll::flag_handler(&ctx)?,
        Action::PollSegment => api::poll::segment_handler(&ctx)?,
        Action::StreamAll | Action::StreamFlags | Action::StreamPing => {
            api::stream::stream_handler(core, &ctx, spec)?
        }
        Action::Events(endpoint) => api::events::bulk_event_handler(&ctx, endpoint)?,
        Action::EventsImage => api::pixel::events_image_handler(&ctx)?,
        Action::Goals => api::goals::goals_handler(&ctx).await?,
    };

    // Advertise poll cacheability when the environment has a TTL
    if matches!(
        spec.action,
        Action::Evaluate { .. } | Action::PollAllFlags | Action::PollFlag | Action::PollSegment
    ) {
        let ttl = ctx.env.ttl();
        if !ttl.is_zero() {
            if let Ok(value) =
                HeaderValue::from_str(&format!("private, max-age={}", ttl.as_secs()))
            {
                response.headers_mut().insert(CACHE_CONTROL, value);
            }
        }
    }

    Ok(response)
}

fn resolve_environment(
    core: &RelayCore,
    kind: SdkKind,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<Arc<EnvironmentContext>, RelayError> {
    let credential = kind.credential(headers, params)?;
    let env = core
        .env_by_credential(&credential)
        .ok_or(RelayError::UnknownEnvironment)?;
    if env.is_closed() {
        return Err(RelayError::UnknownEnvironment);
    }
    Ok(env)
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    match query {
        Some(query) => url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        None => HashMap::new(),
    }
}

fn allow_header_value(allowed: &[Method]) -> String {
    allowed
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Echo the request origin when one is present, else allow any.
fn origin_value(request_headers: &HeaderMap) -> HeaderValue {
    request_headers
        .get(ORIGIN)
        .cloned()
        .unwrap_or(HeaderValue::from_static("*"))
}

pub fn apply_cors_headers(response_headers: &mut HeaderMap, request_headers: &HeaderMap) {
    response_headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin_value(request_headers));
    response_headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_REQUEST_HEADERS),
    );
    response_headers.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_RESPONSE_HEADERS),
    );
}

fn preflight_response(request_headers: &HeaderMap, allowed: &[Method]) -> Response<RelayBody> {
    let mut methods = allow_header_value(allowed);
    if !allowed.contains(&Method::OPTIONS) {
        methods.push_str(", OPTIONS");
    }

    let mut response = Response::new(http_body_util::Full::new(Bytes::new()));
    apply_cors_headers(response.headers_mut(), request_headers);
    if let Ok(value) = HeaderValue::from_str(&methods) {
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    response.headers_mut().insert(
        ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(PREFLIGHT_MAX_AGE),
    );
    response.map(|body| {
        use http_body_util::BodyExt;
        body.map_err(|e| match e {}).boxed()
    })
}

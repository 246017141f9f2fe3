use crate::dispatch::RelayBody;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Response;
use hyper::header::CONTENT_TYPE;
use serde_json::Value;

pub fn full_body(bytes: Bytes) -> RelayBody {
    Full::new(bytes).map_err(|e| match e {}).boxed()
}

/// 200 response with a JSON body.
pub fn json_response(value: &Value) -> Response<RelayBody> {
    let mut response = Response::new(full_body(Bytes::from(value.to_string())));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

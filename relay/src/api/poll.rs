//! Server-side JSON poll endpoints: all flags, one flag, one segment.

use crate::dispatch::{RelayBody, RequestContext};
use crate::errors::RelayError;
use crate::store::{DataKind, items_to_object};
use hyper::Response;
use shared::http::make_boxed_error_response;

use super::utils::json_response;

pub fn all_flags_handler(ctx: &RequestContext) -> Result<Response<RelayBody>, RelayError> {
    let store = ctx.env.store()?;
    Ok(json_response(&items_to_object(
        store.get_all(DataKind::Features),
    )))
}

pub fn flag_handler(ctx: &RequestContext) -> Result<Response<RelayBody>, RelayError> {
    single_item(ctx, DataKind::Features)
}

pub fn segment_handler(ctx: &RequestContext) -> Result<Response<RelayBody>, RelayError> {
    single_item(ctx, DataKind::Segments)
}

fn single_item(ctx: &RequestContext, kind: DataKind) -> Result<Response<RelayBody>, RelayError> {
    let key = ctx
        .params
        .get("key")
        .ok_or_else(|| RelayError::BadRequest("missing key".into()))?;

    let store = ctx.env.store()?;
    match store.get(kind, key).and_then(|descriptor| descriptor.item) {
        Some(item) => Ok(json_response(&item)),
        None => Ok(make_boxed_error_response(
            hyper::StatusCode::NOT_FOUND,
            &format!("{} not found", kind.as_str()),
        )),
    }
}

//! Flag evaluation seam.
//!
//! Real evaluation (targeting rules, rollouts, prerequisites) belongs to an
//! external evaluator capability; the relay only defines the seam and ships
//! a basic implementation that understands the on/off switch and fixed
//! variation indices, which is enough for the poll endpoints to serve
//! coherent results from a cached dataset.

use crate::store::{DataKind, StoreAdapter};
use serde_json::{Value, json};
use std::sync::Arc;

/// Result of evaluating one flag for one user.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalResult {
    pub value: Value,
    pub variation: Option<u64>,
    pub version: u64,
    pub track_events: bool,
    pub reason: Value,
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, flag: &Value, user: &Value) -> EvalResult;
}

/// On/off evaluation: fallthrough variation when the flag is on, off
/// variation otherwise.
pub struct BasicEvaluator;

impl Evaluator for BasicEvaluator {
    fn evaluate(&self, flag: &Value, _user: &Value) -> EvalResult {
        let version = flag["version"].as_u64().unwrap_or(0);
        let track_events = flag["trackEvents"].as_bool().unwrap_or(false);

        let (variation, reason) = if flag["on"].as_bool().unwrap_or(false) {
            (
                flag["fallthrough"]["variation"].as_u64(),
                json!({"kind": "FALLTHROUGH"}),
            )
        } else {
            (flag["offVariation"].as_u64(), json!({"kind": "OFF"}))
        };

        let value = variation
            .and_then(|i| flag["variations"].get(i as usize))
            .cloned()
            .unwrap_or(Value::Null);

        EvalResult {
            value,
            variation,
            version,
            track_events,
            reason,
        }
    }
}

/// Evaluates every flag in the store for one user.
///
/// `values_only` produces the legacy `{key: value}` map; otherwise each
/// entry carries value, variation, version, and trackEvents, plus the
/// evaluation reason when `with_reasons` is set.
pub fn evaluate_all(
    evaluator: &dyn Evaluator,
    store: &Arc<StoreAdapter>,
    user: &Value,
    values_only: bool,
    with_reasons: bool,
) -> Value {
    let mut response = serde_json::Map::new();
    for (key, descriptor) in store.get_all(DataKind::Features) {
        let Some(flag) = descriptor.item else {
            continue;
        };
        let result = evaluator.evaluate(&flag, user);
        if values_only {
            response.insert(key, result.value);
        } else {
            let mut detail = serde_json::Map::new();
            detail.insert("value".into(), result.value);
            if let Some(variation) = result.variation {
                detail.insert("variation".into(), json!(variation));
            }
            detail.insert("version".into(), json!(result.version));
            detail.insert("trackEvents".into(), json!(result.track_events));
            if with_reasons {
                detail.insert("reason".into(), result.reason);
            }
            response.insert(key, Value::Object(detail));
        }
    }
    Value::Object(response)
}

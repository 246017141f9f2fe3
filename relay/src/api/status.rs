//! The `/status` health document.

use crate::dispatch::RelayBody;
use crate::relayenv::{ConnectionStatus, RelayCore};
use hyper::Response;
use serde_json::{Value, json};

pub fn status_handler(core: &RelayCore) -> Response<RelayBody> {
    super::utils::json_response(&status_document(core))
}

fn status_document(core: &RelayCore) -> Value {
    let mut environments = serde_json::Map::new();
    let mut healthy = true;

    for env in core.environments() {
        let status = env.connection_status();
        if status == ConnectionStatus::Disconnected {
            healthy = false;
        }

        let credentials = env.credentials();
        let mut doc = serde_json::Map::new();
        doc.insert(
            "sdkKey".into(),
            json!(crate::credentials::obscure_key(&credentials.sdk_key)),
        );
        if let Some(mobile_key) = &credentials.mobile_key {
            doc.insert(
                "mobileKey".into(),
                json!(crate::credentials::obscure_key(mobile_key)),
            );
        }
        if let Some(env_id) = &credentials.env_id {
            doc.insert("envId".into(), json!(env_id));
        }
        doc.insert("status".into(), json!(status.as_str()));

        environments.insert(env.name().to_string(), Value::Object(doc));
    }

    json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "clientVersion": core.sdk_version(),
        "environments": environments,
    })
}

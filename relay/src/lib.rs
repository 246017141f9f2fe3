pub mod api;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod errors;
pub mod evaluator;
pub mod events;
pub mod httpconfig;
pub mod metrics_defs;
pub mod relayenv;
pub mod routes;
pub mod sdksource;
pub mod store;
pub mod streams;

#[cfg(test)]
pub mod testutils;

use crate::config::Config;
use crate::dispatch::RelayBody;
use crate::errors::RelayError;
use crate::relayenv::RelayCore;
use crate::routes::{RouteSpec, relay_routes};
use http_body_util::BodyExt;
use hyper::StatusCode;
use hyper::body::Bytes;
use hyper::service::Service;
use hyper::{Request, Response};
use routing::RouteSet;
use shared::http::{make_boxed_error_response, run_http_service};
use std::pin::Pin;
use std::sync::Arc;

/// Builds the relay core from a parsed configuration, waits for every
/// environment's first initialization outcome, starts big-segment
/// synchronization where configured, and serves the relay until the
/// process ends.
pub async fn run(config: Config) -> Result<(), RelayError> {
    let listener = config.main.listener.clone();
    let env_count = config.environments.len();

    let (core, mut ready_rx) = RelayCore::new(
        config,
        sdksource::streaming_client_factory(),
        store::in_memory_store_factory(),
    )?;

    for _ in 0..env_count {
        match ready_rx.recv().await {
            Some(env) => match env.init_error() {
                None => tracing::info!(env = env.name(), "Environment ready"),
                Some(error) => {
                    tracing::warn!(env = env.name(), %error, "Environment failed to initialize")
                }
            },
            None => break,
        }
    }

    let _synchronizers = start_big_segment_synchronizers(&core)?;

    let service = RelayService::new(core);
    tracing::info!(host = %listener.host, port = listener.port, "Relay listening");
    run_http_service(&listener.host, listener.port, service).await
}

/// One synchronizer per environment that opts into big segments. The
/// returned handles own the workers; dropping them does not stop the tasks,
/// but `run` holds them for its lifetime anyway.
fn start_big_segment_synchronizers(
    core: &RelayCore,
) -> Result<Vec<bigsegments::BigSegmentSynchronizer>, RelayError> {
    let config = core.config();
    let Some(big_segments) = &config.big_segments else {
        return Ok(Vec::new());
    };

    let mut synchronizers = Vec::new();
    for env in core.environments() {
        let env_config = &config.environments[env.name()];
        if !env_config.big_segments {
            continue;
        }
        let Some(env_id) = &env_config.env_id else {
            tracing::warn!(
                env = env.name(),
                "Big segments enabled but the environment has no environment ID; skipping"
            );
            continue;
        };

        let synchronizer = bigsegments::BigSegmentSynchronizer::new(
            env.http_config().streaming_client()?,
            std::sync::Arc::new(bigsegments::InMemoryBigSegmentStore::new()),
            &big_segments.poll_uri,
            &big_segments.stream_uri,
            env_id,
            &env_config.sdk_key,
        );
        let synchronizer = match big_segments.stream_retry_secs {
            Some(secs) => synchronizer
                .with_stream_retry_interval(std::time::Duration::from_secs(secs)),
            None => synchronizer,
        };
        synchronizer.start();
        synchronizers.push(synchronizer);
    }
    Ok(synchronizers)
}

pub struct RelayService {
    core: RelayCore,
    routes: Arc<RouteSet<RouteSpec>>,
}

impl RelayService {
    pub fn new(core: RelayCore) -> Self {
        Self {
            core,
            routes: Arc::new(relay_routes()),
        }
    }
}

impl<B> Service<Request<B>> for RelayService
where
    B: BodyExt<Data = Bytes> + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B: Unpin,
{
    type Response = Response<RelayBody>;
    type Error = RelayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let core = self.core.clone();
        let routes = self.routes.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(make_boxed_error_response(
                        StatusCode::BAD_REQUEST,
                        "could not read request body",
                    ));
                }
            };
            Ok(dispatch::handle_request(&core, &routes, parts, body_bytes).await)
        })
    }
}

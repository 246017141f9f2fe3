//! Shared helpers for the crate's tests.

use crate::config::{Config, EnvConfig};
use crate::errors::RelayError;
use crate::relayenv::{ClientFactory, LdClient};
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const TEST_SDK_KEY: &str = "sdk-99999999-9999-9999-9999-999999e42d0f";
pub const TEST_MOBILE_KEY: &str = "mob-99999999-9999-9999-9999-999999e42d0f";
pub const TEST_ENV_ID: &str = "507f1f77bcf86cd799439011";

pub fn test_env_config() -> EnvConfig {
    EnvConfig {
        sdk_key: TEST_SDK_KEY.into(),
        mobile_key: Some(TEST_MOBILE_KEY.into()),
        env_id: Some(TEST_ENV_ID.into()),
        secure_mode: false,
        cache_ttl_secs: 0,
        big_segments: false,
    }
}

pub fn test_config() -> Config {
    Config {
        main: Default::default(),
        events: Default::default(),
        proxy: Default::default(),
        big_segments: None,
        environments: HashMap::from([("production".to_string(), test_env_config())]),
    }
}

struct TestClient {
    initialized: bool,
}

impl LdClient for TestClient {
    fn initialized(&self) -> bool {
        self.initialized
    }
}

type ClientResult = Result<Arc<dyn LdClient>, RelayError>;

/// A client factory whose clients are connected immediately.
pub fn test_client_factory() -> ClientFactory {
    ClientFactory {
        sdk_version: "5.5.0-test",
        create: Arc::new(|_sdk_key, _config| -> BoxFuture<'static, ClientResult> {
            Box::pin(async { Ok(Arc::new(TestClient { initialized: true }) as Arc<dyn LdClient>) })
        }),
    }
}

/// A client factory whose initialization always fails with the given message.
pub fn failing_client_factory(message: &'static str) -> ClientFactory {
    ClientFactory {
        sdk_version: "5.5.0-test",
        create: Arc::new(move |_sdk_key, _config| -> BoxFuture<'static, ClientResult> {
            Box::pin(async move { Err(RelayError::UpstreamTransient(message.to_string())) })
        }),
    }
}

/// What a `RecordingServer` saw in one request.
pub struct RecordedRequest {
    pub method: hyper::Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A local HTTP server that records every request and answers from a canned
/// response list (the last response repeats once the list is exhausted).
pub struct RecordingServer {
    port: u16,
    requests: tokio::sync::Mutex<mpsc::Receiver<RecordedRequest>>,
}

impl RecordingServer {
    pub async fn start(responses: Vec<(u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let port = listener.local_addr().unwrap().port();

        let (tx, rx) = mpsc::channel(64);
        let responses = Arc::new(Mutex::new(VecDeque::from(responses)));

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let io = TokioIo::new(stream);
                let tx = tx.clone();
                let responses = responses.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let tx = tx.clone();
                        let responses = responses.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();

                            let _ = tx
                                .send(RecordedRequest {
                                    method: parts.method,
                                    path: parts.uri.path().to_string(),
                                    query: parts.uri.query().map(String::from),
                                    authorization: parts
                                        .headers
                                        .get(AUTHORIZATION)
                                        .and_then(|v| v.to_str().ok())
                                        .map(String::from),
                                    headers: parts.headers,
                                    body,
                                })
                                .await;

                            let (status, body) = {
                                let mut responses = responses.lock();
                                match responses.len() {
                                    0 => (200, String::new()),
                                    1 => responses.front().cloned().unwrap(),
                                    _ => responses.pop_front().unwrap(),
                                }
                            };
                            let mut response = Response::new(Full::new(Bytes::from(body)));
                            *response.status_mut() =
                                hyper::StatusCode::from_u16(status).unwrap();
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        Self {
            port,
            requests: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub async fn next_request(&self) -> RecordedRequest {
        tokio::time::timeout(Duration::from_secs(5), async {
            self.requests.lock().await.recv().await
        })
        .await
        .expect("timed out waiting for a request")
        .expect("server channel closed")
    }
}

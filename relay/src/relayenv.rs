//! Per-environment runtime state and the credential-indexed registry.
//!
//! An `EnvironmentContext` is created synchronously with valid credentials
//! and becomes ready asynchronously once its upstream SDK client either
//! connects or fails. The `RelayCore` registry owns all contexts and the
//! credential-to-environment index the request path resolves through.

use crate::config::{Config, EnvConfig};
use crate::credentials::{Credential, Credentials};
use crate::errors::RelayError;
use crate::events::EventDispatcher;
use crate::httpconfig::HttpConfig;
use crate::store::{DataStoreFactory, StoreAdapter};
use crate::streams::{EnvStreams, Publishers, StreamKind, ping_event};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use shared::sse::SseEvent;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Contract of the upstream SDK client, which speaks the vendor streaming
/// protocol and writes through the store adapter. The library itself is an
/// external collaborator.
pub trait LdClient: Send + Sync {
    /// Whether the client has received a full dataset from upstream.
    fn initialized(&self) -> bool;
    /// Releases the upstream connection. Idempotent.
    fn close(&self) {}
}

/// Everything a client factory needs besides the SDK key.
pub struct ClientConfig {
    pub stream_uri: String,
    pub store: Arc<StoreAdapter>,
    pub http: HttpConfig,
}

pub type ClientFactoryFn = Arc<
    dyn Fn(String, ClientConfig) -> BoxFuture<'static, Result<Arc<dyn LdClient>, RelayError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct ClientFactory {
    /// Version of the client library, reported by `/status`.
    pub sdk_version: &'static str,
    pub create: ClientFactoryFn,
}

/// Runs pending cleanup actions unless disarmed. Tracks partially
/// constructed resources so every early-exit path releases them.
struct CleanupTasks {
    tasks: Vec<Box<dyn FnOnce() + Send>>,
}

impl CleanupTasks {
    fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    fn add(&mut self, task: impl FnOnce() + Send + 'static) {
        self.tasks.push(Box::new(task));
    }

    fn clear(&mut self) {
        self.tasks.clear();
    }
}

impl Drop for CleanupTasks {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task();
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Initializing,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Initializing => "initializing",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

struct MutableState {
    client: Option<Arc<dyn LdClient>>,
    init_error: Option<String>,
    ttl: Duration,
    secure_mode: bool,
}

pub struct EnvironmentContext {
    name: String,
    credentials: Credentials,
    state: RwLock<MutableState>,
    adapter: Arc<StoreAdapter>,
    env_streams: Arc<EnvStreams>,
    event_dispatcher: Option<Arc<EventDispatcher>>,
    http_config: HttpConfig,
    http_client: reqwest::Client,
    base_uri: String,
    closed: AtomicBool,
}

const UPSTREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl EnvironmentContext {
    /// Creates the context and starts initializing its SDK client in the
    /// background. The context is returned immediately in an uninitialized
    /// state; once initialization succeeds or fails, the context is pushed
    /// to `ready_tx` (exactly once).
    pub fn new(
        name: &str,
        env_config: &EnvConfig,
        config: &Config,
        client_factory: &ClientFactory,
        store_factory: &DataStoreFactory,
        publishers: Arc<Publishers>,
        ready_tx: Option<mpsc::Sender<Arc<EnvironmentContext>>>,
    ) -> Result<Arc<Self>, RelayError> {
        if env_config.sdk_key.is_empty() {
            return Err(RelayError::Config(format!(
                "environment {name} has no SDK key"
            )));
        }

        let http_config = HttpConfig::new(&config.proxy)?;

        let mut cleanup = CleanupTasks::new();

        let env_streams = EnvStreams::new(publishers);
        {
            let env_streams = env_streams.clone();
            cleanup.add(move || env_streams.close());
        }

        let store = store_factory();
        let adapter = StoreAdapter::new(store, env_streams.clone());

        register_stream_topics(&env_streams, env_config, &adapter);

        let event_dispatcher = if config.events.send_events {
            tracing::info!(env = name, "Proxying events for this environment");
            let dispatcher = EventDispatcher::new(
                env_config.sdk_key.clone(),
                env_config.env_id.clone(),
                &config.events,
                &http_config,
            )?;
            {
                let dispatcher = dispatcher.clone();
                cleanup.add(move || dispatcher.close());
            }
            Some(dispatcher)
        } else {
            None
        };

        let context = Arc::new(Self {
            name: name.to_string(),
            credentials: Credentials {
                sdk_key: env_config.sdk_key.clone(),
                mobile_key: env_config.mobile_key.clone(),
                env_id: env_config.env_id.clone(),
            },
            state: RwLock::new(MutableState {
                client: None,
                init_error: None,
                ttl: env_config.ttl(),
                secure_mode: env_config.secure_mode,
            }),
            adapter: adapter.clone(),
            env_streams,
            event_dispatcher,
            http_client: http_config.client(UPSTREAM_REQUEST_TIMEOUT)?,
            http_config: http_config.clone(),
            base_uri: config.main.base_uri.clone(),
            closed: AtomicBool::new(false),
        });

        // Connecting may take a while, so it happens on its own task
        let client_config = ClientConfig {
            stream_uri: config.main.stream_uri.clone(),
            store: adapter,
            http: http_config,
        };
        let factory = client_factory.create.clone();
        let sdk_key = env_config.sdk_key.clone();
        let ignore_connection_errors = config.main.ignore_connection_errors;
        let exit_on_error = config.main.exit_on_error;
        let ctx = context.clone();
        tokio::spawn(async move {
            let result = factory(sdk_key, client_config).await;
            match result {
                Ok(client) => {
                    ctx.set_client(client);
                    tracing::info!(env = %ctx.name, "Initialized SDK client");
                }
                Err(e) => {
                    ctx.state.write().init_error = Some(e.to_string());
                    if ignore_connection_errors {
                        tracing::error!(env = %ctx.name, error = %e, "Ignoring error initializing SDK client");
                    } else {
                        tracing::error!(env = %ctx.name, error = %e, "Error initializing SDK client");
                        if exit_on_error {
                            std::process::exit(1);
                        }
                    }
                }
            }
            if let Some(tx) = ready_tx {
                let _ = tx.send(ctx).await;
            }
        });

        cleanup.clear();

        Ok(context)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The credential value that keys this environment's topic on the given
    /// stream kind, when the environment carries one.
    pub fn stream_credential(&self, kind: StreamKind) -> Option<&str> {
        match kind {
            StreamKind::ServerSideAll | StreamKind::ServerSideFlagsOnly => {
                Some(&self.credentials.sdk_key)
            }
            StreamKind::MobilePing => self.credentials.mobile_key.as_deref(),
            StreamKind::JsPing => self.credentials.env_id.as_deref(),
        }
    }

    pub fn client(&self) -> Result<Option<Arc<dyn LdClient>>, RelayError> {
        self.check_open()?;
        Ok(self.state.read().client.clone())
    }

    pub fn set_client(&self, client: Arc<dyn LdClient>) {
        self.state.write().client = Some(client);
    }

    pub fn store(&self) -> Result<Arc<StoreAdapter>, RelayError> {
        self.check_open()?;
        Ok(self.adapter.clone())
    }

    pub fn event_dispatcher(&self) -> Option<Arc<EventDispatcher>> {
        self.event_dispatcher.clone()
    }

    pub fn http_config(&self) -> &HttpConfig {
        &self.http_config
    }

    /// Client for ordinary request/response upstream calls on behalf of
    /// this environment.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    pub fn ttl(&self) -> Duration {
        self.state.read().ttl
    }

    pub fn is_secure_mode(&self) -> bool {
        self.state.read().secure_mode
    }

    pub fn init_error(&self) -> Option<String> {
        self.state.read().init_error.clone()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        let state = self.state.read();
        if state.init_error.is_some() {
            return ConnectionStatus::Disconnected;
        }
        match &state.client {
            None => ConnectionStatus::Initializing,
            Some(client) if client.initialized() => ConnectionStatus::Connected,
            Some(_) => ConnectionStatus::Disconnected,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), RelayError> {
        if self.is_closed() {
            Err(RelayError::Closed)
        } else {
            Ok(())
        }
    }

    /// Releases stream topics, the event dispatcher, and the SDK client.
    /// Idempotent; returns success both times.
    pub fn close(&self) -> Result<(), RelayError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.env_streams.close();
        if let Some(dispatcher) = &self.event_dispatcher {
            dispatcher.close();
        }
        if let Some(client) = self.state.read().client.as_ref() {
            client.close();
        }
        Ok(())
    }
}

fn register_stream_topics(
    env_streams: &Arc<EnvStreams>,
    env_config: &EnvConfig,
    adapter: &Arc<StoreAdapter>,
) {
    let all_adapter = adapter.clone();
    env_streams.register(
        StreamKind::ServerSideAll,
        env_config.sdk_key.clone(),
        Arc::new(move || SseEvent::new("put", all_adapter.all_data_snapshot().to_string())),
    );

    let flags_adapter = adapter.clone();
    env_streams.register(
        StreamKind::ServerSideFlagsOnly,
        env_config.sdk_key.clone(),
        Arc::new(move || SseEvent::new("put", flags_adapter.flags_snapshot().to_string())),
    );

    if let Some(mobile_key) = &env_config.mobile_key {
        env_streams.register(StreamKind::MobilePing, mobile_key.clone(), Arc::new(ping_event));
    }
    if let Some(env_id) = &env_config.env_id {
        env_streams.register(StreamKind::JsPing, env_id.clone(), Arc::new(ping_event));
    }
}

struct Registry {
    by_name: HashMap<String, Arc<EnvironmentContext>>,
    by_credential: HashMap<Credential, String>,
}

struct CoreInner {
    config: Config,
    publishers: Arc<Publishers>,
    client_factory: ClientFactory,
    store_factory: DataStoreFactory,
    envs: RwLock<Registry>,
}

/// The environment registry plus everything needed to build new contexts.
#[derive(Clone)]
pub struct RelayCore {
    inner: Arc<CoreInner>,
}

impl RelayCore {
    /// Builds the core and creates a context for every configured
    /// environment. Each context is pushed to the returned channel when its
    /// initialization finishes.
    pub fn new(
        config: Config,
        client_factory: ClientFactory,
        store_factory: DataStoreFactory,
    ) -> Result<(Self, mpsc::Receiver<Arc<EnvironmentContext>>), RelayError> {
        if config.environments.is_empty() {
            return Err(RelayError::Config("no environments configured".into()));
        }

        let publishers = Publishers::new(config.main.heartbeat_interval());
        let (ready_tx, ready_rx) = mpsc::channel(config.environments.len());

        let core = Self {
            inner: Arc::new(CoreInner {
                publishers,
                client_factory,
                store_factory,
                envs: RwLock::new(Registry {
                    by_name: HashMap::new(),
                    by_credential: HashMap::new(),
                }),
                config,
            }),
        };

        let mut names: Vec<String> = core.inner.config.environments.keys().cloned().collect();
        names.sort();
        for name in names {
            let env_config = core.inner.config.environments[&name].clone();
            core.add_environment(&name, &env_config, Some(ready_tx.clone()))?;
        }

        Ok((core, ready_rx))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn publishers(&self) -> Arc<Publishers> {
        self.inner.publishers.clone()
    }

    pub fn sdk_version(&self) -> &'static str {
        self.inner.client_factory.sdk_version
    }

    pub fn add_environment(
        &self,
        name: &str,
        env_config: &EnvConfig,
        ready_tx: Option<mpsc::Sender<Arc<EnvironmentContext>>>,
    ) -> Result<Arc<EnvironmentContext>, RelayError> {
        let mut registry = self.inner.envs.write();

        if registry.by_name.contains_key(name) {
            return Err(RelayError::Config(format!(
                "environment {name} already exists"
            )));
        }
        let credentials = Credentials {
            sdk_key: env_config.sdk_key.clone(),
            mobile_key: env_config.mobile_key.clone(),
            env_id: env_config.env_id.clone(),
        };
        for credential in credentials.iter() {
            if registry.by_credential.contains_key(&credential) {
                return Err(RelayError::Config(format!(
                    "credential {} is already assigned to environment {}",
                    credential.masked(),
                    registry.by_credential[&credential]
                )));
            }
        }

        let context = EnvironmentContext::new(
            name,
            env_config,
            &self.inner.config,
            &self.inner.client_factory,
            &self.inner.store_factory,
            self.inner.publishers.clone(),
            ready_tx,
        )?;

        for credential in credentials.iter() {
            registry.by_credential.insert(credential, name.to_string());
        }
        registry.by_name.insert(name.to_string(), context.clone());

        Ok(context)
    }

    pub fn remove_environment(&self, name: &str) -> Result<(), RelayError> {
        let context = {
            let mut registry = self.inner.envs.write();
            let context = registry
                .by_name
                .remove(name)
                .ok_or(RelayError::UnknownEnvironment)?;
            registry.by_credential.retain(|_, env| env != name);
            context
        };
        context.close()
    }

    /// Replaces an environment's context with one built from new
    /// credentials. The old credentials stop resolving in the same critical
    /// section that activates the new ones; the old context is closed after
    /// the swap.
    pub fn rotate_environment(
        &self,
        name: &str,
        env_config: &EnvConfig,
        ready_tx: Option<mpsc::Sender<Arc<EnvironmentContext>>>,
    ) -> Result<Arc<EnvironmentContext>, RelayError> {
        let context = EnvironmentContext::new(
            name,
            env_config,
            &self.inner.config,
            &self.inner.client_factory,
            &self.inner.store_factory,
            self.inner.publishers.clone(),
            ready_tx,
        )?;

        let old = {
            let mut registry = self.inner.envs.write();
            let old = registry
                .by_name
                .insert(name.to_string(), context.clone())
                .ok_or(RelayError::UnknownEnvironment)?;
            registry.by_credential.retain(|_, env| env != name);
            for credential in context.credentials().iter() {
                registry.by_credential.insert(credential, name.to_string());
            }
            old
        };
        let _ = old.close();

        Ok(context)
    }

    pub fn env_by_credential(&self, credential: &Credential) -> Option<Arc<EnvironmentContext>> {
        let registry = self.inner.envs.read();
        let name = registry.by_credential.get(credential)?;
        registry.by_name.get(name).cloned()
    }

    /// All environments, sorted by name for deterministic status output.
    pub fn environments(&self) -> Vec<Arc<EnvironmentContext>> {
        let registry = self.inner.envs.read();
        let mut envs: Vec<_> = registry.by_name.values().cloned().collect();
        envs.sort_by(|a, b| a.name().cmp(b.name()));
        envs
    }

    /// Closes every environment. Used at shutdown.
    pub fn close(&self) {
        for env in self.environments() {
            let _ = env.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{failing_client_factory, test_client_factory, test_config};
    use crate::store::in_memory_store_factory;

    fn make_core(config: Config, factory: ClientFactory) -> (RelayCore, mpsc::Receiver<Arc<EnvironmentContext>>) {
        RelayCore::new(config, factory, in_memory_store_factory()).unwrap()
    }

    #[tokio::test]
    async fn environment_becomes_ready_and_connected() {
        let (core, mut ready) = make_core(test_config(), test_client_factory());

        let env = ready.recv().await.unwrap();
        assert_eq!(env.connection_status(), ConnectionStatus::Connected);
        assert!(env.init_error().is_none());

        let by_cred = core
            .env_by_credential(&Credential::SdkKey(env.credentials().sdk_key.clone()))
            .unwrap();
        assert_eq!(by_cred.name(), env.name());
    }

    #[tokio::test]
    async fn failed_init_still_signals_ready_once() {
        let mut config = test_config();
        config.main.ignore_connection_errors = true;
        let (_core, mut ready) = make_core(config, failing_client_factory("connection refused"));

        let env = ready.recv().await.unwrap();
        assert_eq!(env.init_error().as_deref(), Some("upstream request failed: connection refused"));
        assert_eq!(env.connection_status(), ConnectionStatus::Disconnected);

        // exactly one ready signal per environment
        assert!(ready.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_credentials_are_rejected() {
        let mut config = test_config();
        let duplicate = config.environments["production"].clone();
        config.environments.insert("staging".into(), duplicate);

        let result = RelayCore::new(config, test_client_factory(), in_memory_store_factory());
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_poisons_accessors() {
        let (_core, mut ready) = make_core(test_config(), test_client_factory());
        let env = ready.recv().await.unwrap();

        assert!(env.close().is_ok());
        assert!(env.close().is_ok());

        assert!(matches!(env.store(), Err(RelayError::Closed)));
        assert!(matches!(env.client(), Err(RelayError::Closed)));
    }

    #[tokio::test]
    async fn rotation_swaps_credentials_atomically() {
        let (core, mut ready) = make_core(test_config(), test_client_factory());
        let env = ready.recv().await.unwrap();
        let old_key = env.credentials().sdk_key.clone();

        let mut new_config = core.config().environments["production"].clone();
        new_config.sdk_key = "sdk-00000000-0000-0000-0000-00000000e42d".into();
        core.rotate_environment("production", &new_config, None)
            .unwrap();

        assert!(core
            .env_by_credential(&Credential::SdkKey(old_key))
            .is_none());
        let rotated = core
            .env_by_credential(&Credential::SdkKey(new_config.sdk_key.clone()))
            .unwrap();
        assert_eq!(rotated.name(), "production");
        // the replaced context was closed
        assert!(env.is_closed());
    }

    #[tokio::test]
    async fn remove_environment_clears_lookup() {
        let (core, mut ready) = make_core(test_config(), test_client_factory());
        let env = ready.recv().await.unwrap();

        core.remove_environment("production").unwrap();
        assert!(core
            .env_by_credential(&Credential::SdkKey(env.credentials().sdk_key.clone()))
            .is_none());
        assert!(env.is_closed());
        assert!(matches!(
            core.remove_environment("production"),
            Err(RelayError::UnknownEnvironment)
        ));
    }

    #[tokio::test]
    async fn missing_sdk_key_fails_fast() {
        let mut config = test_config();
        config
            .environments
            .insert("bad".into(), EnvConfig::new(""));
        let result = RelayCore::new(config, test_client_factory(), in_memory_store_factory());
        assert!(matches!(result, Err(RelayError::Config(_))));
    }
}

// ── Dashboard facade ──
//
// Owns the pieces every hook shares (executor, token store, auth state,
// notifier) and hands out hook instances. Asking twice for the same
// resource while a handle is alive returns the same task; once every
// handle is gone the task stops and the next request starts a fresh one.

use std::any::Any;
use std::sync::Arc;

use chrono::Utc;
use clusterdash_api::{
    Endpoints, Error, RequestExecutor, TokenStore, TransportConfig, auth as api_auth,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::auth::{AuthState, AuthStatus, renewal_task};
use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::feed::{DeltaFeed, FeedTarget, WeakDeltaFeed};
use crate::logs::LogTail;
use crate::model::cluster::{decode_cluster_age, decode_deployment_mode, decode_scheduling_policy};
use crate::model::kernel::decode_kernel_specs;
use crate::model::{
    ClusterAge, ClusterNode, DeploymentMode, Entity, JupyterAddress, Kernel, KernelSpec, SchedulingPolicy,
    Workload, WorkloadPreset,
};
use crate::notice::{Notice, Notifier};
use crate::poll::{Decoder, HttpSource, PollOptions, Resource, WeakResource, decode_json};
use crate::resources::PolledResource;

/// Wire name of the workload stream.
pub const WORKLOADS: &str = "workloads";

type ErasedHandle = Box<dyn Any + Send + Sync>;

/// Every URL the dashboard talks to, resolved once against the base path.
#[derive(Debug, Clone)]
struct Routes {
    nodes: Url,
    kernels: Url,
    kernel_specs: Url,
    deployment_mode: Url,
    scheduling_policy: Url,
    cluster_age: Url,
    jupyter_address: Url,
    workload_presets: Url,
    workload_templates: Url,
    authenticate: Url,
    refresh_token: Url,
    workload_ws: Url,
    logs_ws: Url,
}

impl Routes {
    fn new(endpoints: &Endpoints) -> Result<Self, Error> {
        let http = |r: PolledResource| endpoints.http(r.path());
        Ok(Self {
            nodes: http(PolledResource::Nodes)?,
            kernels: http(PolledResource::Kernels)?,
            kernel_specs: http(PolledResource::KernelSpecs)?,
            deployment_mode: http(PolledResource::DeploymentMode)?,
            scheduling_policy: http(PolledResource::SchedulingPolicy)?,
            cluster_age: http(PolledResource::ClusterAge)?,
            jupyter_address: http(PolledResource::JupyterAddress)?,
            workload_presets: http(PolledResource::WorkloadPresets)?,
            workload_templates: http(PolledResource::WorkloadTemplates)?,
            authenticate: endpoints.http("authenticate")?,
            refresh_token: endpoints.http("refresh_token")?,
            workload_ws: endpoints.ws("websocket/workload")?,
            logs_ws: endpoints.ws("logs")?,
        })
    }

    fn polled(&self, resource: PolledResource) -> &Url {
        match resource {
            PolledResource::Nodes => &self.nodes,
            PolledResource::Kernels => &self.kernels,
            PolledResource::KernelSpecs => &self.kernel_specs,
            PolledResource::DeploymentMode => &self.deployment_mode,
            PolledResource::SchedulingPolicy => &self.scheduling_policy,
            PolledResource::ClusterAge => &self.cluster_age,
            PolledResource::JupyterAddress => &self.jupyter_address,
            PolledResource::WorkloadPresets => &self.workload_presets,
            PolledResource::WorkloadTemplates => &self.workload_templates,
        }
    }
}

/// Entry point for everything the dashboard shows. Cheaply cloneable.
#[derive(Clone)]
pub struct Dashboard {
    inner: Arc<DashboardInner>,
}

struct DashboardInner {
    config: ClientConfig,
    endpoints: Endpoints,
    routes: Routes,
    executor: RequestExecutor,
    auth: AuthState,
    notifier: Notifier,
    cancel: CancellationToken,
    polled: DashMap<PolledResource, ErasedHandle>,
    feeds: DashMap<String, ErasedHandle>,
}

impl Drop for DashboardInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Dashboard {
    /// Build the HTTP client and token store from `config`.
    ///
    /// Must be called within a Tokio runtime: the token renewal task is
    /// spawned immediately.
    pub fn new(config: ClientConfig) -> Result<Self, CoreError> {
        let tokens = match &config.token_file {
            Some(path) => TokenStore::persistent(path)?,
            None => TokenStore::in_memory(),
        };
        let transport = TransportConfig {
            tls: config.tls.clone(),
            ..TransportConfig::default()
        };
        let executor = RequestExecutor::from_transport(&transport, tokens)?;
        Self::with_executor(config, executor)
    }

    /// Use an existing executor (and its token store).
    pub fn with_executor(config: ClientConfig, executor: RequestExecutor) -> Result<Self, CoreError> {
        let endpoints = Endpoints::new(config.server.clone(), &config.base_path);
        let routes = Routes::new(&endpoints)?;

        // A stored, unexpired token resumes the previous session.
        let resumed = executor
            .tokens()
            .get()
            .is_some_and(|t| t.remaining(Utc::now()).is_none_or(|left| left > chrono::Duration::zero()));
        let initial = if resumed {
            AuthStatus::Authenticated
        } else {
            AuthStatus::Unauthenticated
        };

        let notifier = Notifier::new();
        let auth = AuthState::new(initial).with_notifier(notifier.clone());
        let cancel = CancellationToken::new();

        tokio::spawn(renewal_task(
            auth.clone(),
            executor.clone(),
            routes.refresh_token.clone(),
            cancel.child_token(),
        ));
        debug!(server = %config.server, base_path = %endpoints.base_path(), status = %initial, "dashboard ready");

        Ok(Self {
            inner: Arc::new(DashboardInner {
                config,
                endpoints,
                routes,
                executor,
                auth,
                notifier,
                cancel,
                polled: DashMap::new(),
                feeds: DashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.inner.endpoints
    }

    pub fn tokens(&self) -> &TokenStore {
        self.inner.executor.tokens()
    }

    pub fn auth(&self) -> &AuthState {
        &self.inner.auth
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.auth.is_authenticated()
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn notifications(&self) -> broadcast::Receiver<Arc<Notice>> {
        self.inner.notifier.subscribe()
    }

    // ── Session ──────────────────────────────────────────────────────

    /// Exchange credentials for a bearer token and resume every hook.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<(), CoreError> {
        api_auth::login(
            &self.inner.executor,
            self.inner.routes.authenticate.clone(),
            username,
            password,
            &self.inner.cancel,
        )
        .await
        .map_err(|e| match e {
            Error::Unauthorized => CoreError::Rejected {
                message: "invalid username or password".into(),
                description: None,
            },
            other => other.into(),
        })?;
        self.inner.auth.login();
        self.inner.notifier.info("Logged in", format!("Signed in as {username}."));
        Ok(())
    }

    /// Forget the token and pause every hook.
    pub fn logout(&self) -> Result<(), CoreError> {
        self.inner.executor.tokens().clear()?;
        if self.inner.auth.logout() {
            info!("logged out");
        }
        Ok(())
    }

    // ── Polled resources ─────────────────────────────────────────────

    pub fn nodes(&self) -> Resource<Vec<ClusterNode>> {
        self.polled(PolledResource::Nodes, decode_json, None)
    }

    pub fn kernels(&self) -> Resource<Vec<Kernel>> {
        self.polled(PolledResource::Kernels, decode_json, None)
    }

    /// Clusters without a Jupyter server answer 404; that is not retried.
    pub fn kernel_specs(&self) -> Resource<Vec<KernelSpec>> {
        self.polled(PolledResource::KernelSpecs, decode_kernel_specs, Some(not_found_is_final))
    }

    pub fn deployment_mode(&self) -> Resource<DeploymentMode> {
        self.polled(PolledResource::DeploymentMode, decode_deployment_mode, None)
    }

    pub fn scheduling_policy(&self) -> Resource<SchedulingPolicy> {
        self.polled(PolledResource::SchedulingPolicy, decode_scheduling_policy, None)
    }

    pub fn cluster_age(&self) -> Resource<ClusterAge> {
        self.polled(PolledResource::ClusterAge, decode_cluster_age, None)
    }

    pub fn jupyter_address(&self) -> Resource<JupyterAddress> {
        self.polled(PolledResource::JupyterAddress, decode_json, Some(not_found_is_final))
    }

    pub fn workload_presets(&self) -> Resource<Vec<WorkloadPreset>> {
        self.polled(PolledResource::WorkloadPresets, decode_json, None)
    }

    /// Templates are opaque to the dashboard.
    pub fn workload_templates(&self) -> Resource<Vec<Value>> {
        self.polled(PolledResource::WorkloadTemplates, decode_json, None)
    }

    /// Fetch `resource` once through its shared hook, as JSON.
    pub async fn fetch_json(&self, resource: PolledResource) -> Result<Value, CoreError> {
        match resource {
            PolledResource::Nodes => to_json(&self.nodes()).await,
            PolledResource::Kernels => to_json(&self.kernels()).await,
            PolledResource::KernelSpecs => to_json(&self.kernel_specs()).await,
            PolledResource::DeploymentMode => to_json(&self.deployment_mode()).await,
            PolledResource::SchedulingPolicy => to_json(&self.scheduling_policy()).await,
            PolledResource::ClusterAge => to_json(&self.cluster_age()).await,
            PolledResource::JupyterAddress => to_json(&self.jupyter_address()).await,
            PolledResource::WorkloadPresets => to_json(&self.workload_presets()).await,
            PolledResource::WorkloadTemplates => to_json(&self.workload_templates()).await,
        }
    }

    // ── Streams ──────────────────────────────────────────────────────

    /// The reconciled workload collection, kept live over a WebSocket.
    pub fn workloads(&self) -> DeltaFeed<Workload> {
        self.feed(FeedTarget {
            resource: WORKLOADS.into(),
            url: self.inner.routes.workload_ws.clone(),
            reconnect: self.inner.config.reconnect.clone(),
        })
    }

    /// Follow one container's log. Each call opens its own stream.
    pub fn logs(&self, container: &str) -> LogTail {
        LogTail::open(
            self.inner.routes.logs_ws.clone(),
            container,
            self.inner.config.log_history,
            self.inner.config.reconnect.clone(),
            self.inner.executor.tokens().clone(),
            &self.inner.cancel,
        )
    }

    /// Stop every hook, feed, and background task.
    pub fn shutdown(&self) {
        debug!("dashboard shutting down");
        self.inner.cancel.cancel();
        self.inner.polled.clear();
        self.inner.feeds.clear();
    }

    // ── Private helpers ──────────────────────────────────────────────

    fn polled<T: Send + Sync + 'static>(
        &self,
        resource: PolledResource,
        decode: Decoder<T>,
        retry: Option<fn(&Error) -> bool>,
    ) -> Resource<T> {
        let spawn = || {
            let inner = &self.inner;
            let source = HttpSource::new(
                inner.executor.clone(),
                inner.routes.polled(resource).clone(),
                inner.config.timeout(resource),
                decode,
            )
            .with_cache_bust(inner.config.cache_bust);
            let mut options = PollOptions::with_schedule(inner.config.schedule(resource));
            if let Some(retry) = retry {
                options = options.with_retry(retry);
            }
            debug!(resource = %resource, "starting polled resource");
            Resource::spawn(
                resource.to_string(),
                source,
                inner.auth.clone(),
                options,
                inner.notifier.clone(),
                &inner.cancel,
            )
        };

        match self.inner.polled.entry(resource) {
            Entry::Occupied(mut slot) => {
                let live = slot
                    .get()
                    .downcast_ref::<WeakResource<T>>()
                    .and_then(WeakResource::upgrade);
                if let Some(handle) = live {
                    return handle;
                }
                let handle = spawn();
                slot.insert(Box::new(handle.downgrade()));
                handle
            }
            Entry::Vacant(slot) => {
                let handle = spawn();
                slot.insert(Box::new(handle.downgrade()));
                handle
            }
        }
    }

    fn feed<T: Entity>(&self, target: FeedTarget) -> DeltaFeed<T> {
        let spawn = |target: FeedTarget| {
            debug!(resource = %target.resource, url = %target.url, "starting delta feed");
            DeltaFeed::spawn(
                target,
                self.inner.executor.tokens().clone(),
                self.inner.auth.clone(),
                self.inner.notifier.clone(),
                &self.inner.cancel,
            )
        };

        match self.inner.feeds.entry(target.resource.clone()) {
            Entry::Occupied(mut slot) => {
                let live = slot
                    .get()
                    .downcast_ref::<WeakDeltaFeed<T>>()
                    .and_then(WeakDeltaFeed::upgrade);
                if let Some(handle) = live {
                    return handle;
                }
                let handle = spawn(target);
                slot.insert(Box::new(handle.downgrade()));
                handle
            }
            Entry::Vacant(slot) => {
                let handle = spawn(target);
                slot.insert(Box::new(handle.downgrade()));
                handle
            }
        }
    }
}

impl std::fmt::Debug for Dashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dashboard")
            .field("server", &self.inner.config.server.as_str())
            .field("base_path", &self.inner.endpoints.base_path())
            .field("auth", &self.inner.auth.status())
            .finish_non_exhaustive()
    }
}

fn not_found_is_final(err: &Error) -> bool {
    err.status() != Some(404)
}

async fn to_json<T: Serialize + Send + Sync + 'static>(resource: &Resource<T>) -> Result<Value, CoreError> {
    let value = resource.refresh().await?;
    serde_json::to_value(value.as_ref()).map_err(|e| CoreError::Api {
        message: format!("cannot encode {}: {e}", resource.name()),
        status: None,
    })
}

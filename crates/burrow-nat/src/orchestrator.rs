//! NAT Traversal Orchestrator
//!
//! Tries traversal methods one at a time, in priority order, until one
//! yields a connection. The method that last worked for a peer is moved to
//! the front of the order, and the whole sequence is bounded by the
//! request's overall timeout. Dropping the sequence at the deadline drops
//! the in-flight attempt, which releases its sockets and gateway mappings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::time::timeout as with_timeout;
use tracing::{debug, info, warn};

use crate::adapters::{
    DirectAdapter, IceAdapter, MethodAdapter, PortMappingAdapter, SimultaneousOpenAdapter,
    StunAssistedAdapter, TcpHolePunchAdapter, TurnAdapter, UdpHolePunchAdapter,
};
use crate::config::TraversalConfig;
use crate::connection::{Connection, ConnectionResult};
use crate::error::TraversalError;
use crate::gateway::natpmp::NatPmpClient;
use crate::gateway::upnp::UpnpClient;
use crate::method::{ConnectionMethod, promote};
use crate::registry::{JsonFileRegistry, MemoryRegistry, MethodRegistry, RegistryPolicy};
use crate::request::ConnectionRequest;
use crate::signaling::Signaling;

/// Method order for one `connect` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPlan {
    /// Methods in the order they will be tried
    pub order: Vec<ConnectionMethod>,
    /// Method promoted from the registry, if any
    pub preferred: Option<ConnectionMethod>,
}

/// NAT traversal orchestrator
pub struct Orchestrator {
    adapters: HashMap<ConnectionMethod, Arc<dyn MethodAdapter>>,
    registry: Arc<dyn MethodRegistry>,
    policy: RegistryPolicy,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.adapters.keys().copied().collect();
        methods.sort();
        f.debug_struct("Orchestrator")
            .field("methods", &methods)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Orchestrator with no adapters, backed by `registry`
    #[must_use]
    pub fn new(registry: Arc<dyn MethodRegistry>) -> Self {
        Self {
            adapters: HashMap::new(),
            registry,
            policy: RegistryPolicy::default(),
        }
    }

    /// Orchestrator with every adapter wired from configuration
    ///
    /// Methods that need signaling still get an adapter without it; their
    /// attempts fail fast so the next method is tried. NAT-PMP is only
    /// registered when a default gateway can be found.
    #[must_use]
    pub fn from_config(config: &TraversalConfig, signaling: Option<Signaling>) -> Self {
        let registry: Arc<dyn MethodRegistry> = match &config.registry.path {
            Some(path) => Arc::new(JsonFileRegistry::new(path.clone())),
            None => Arc::new(MemoryRegistry::new()),
        };
        let signaling = signaling.map(|s| s.with_recency(config.signaling.recency));

        let port_mapping = |adapter: PortMappingAdapter| {
            let adapter = adapter.with_lifetime(config.gateway.lifetime);
            match &signaling {
                Some(signaling) => adapter.with_signaling(signaling.clone()),
                None => adapter,
            }
        };

        let mut orchestrator = Self::new(registry)
            .with_policy(config.registry.policy)
            .with_adapter(Arc::new(DirectAdapter::ipv6()))
            .with_adapter(Arc::new(DirectAdapter::tcp()))
            .with_adapter(Arc::new(DirectAdapter::udp()))
            .with_adapter(Arc::new(port_mapping(PortMappingAdapter::upnp(
                UpnpClient::new(config.gateway.description.clone()),
            ))));

        match NatPmpClient::discover() {
            Ok(client) => {
                debug!(gateway = %client.gateway(), "NAT-PMP gateway found");
                orchestrator.register(Arc::new(port_mapping(PortMappingAdapter::nat_pmp(client))));
            }
            Err(e) => debug!(error = %e, "NAT-PMP disabled"),
        }

        orchestrator
            .with_adapter(Arc::new(StunAssistedAdapter::new(signaling.clone())))
            .with_adapter(Arc::new(UdpHolePunchAdapter::new(signaling.clone())))
            .with_adapter(Arc::new(TcpHolePunchAdapter::new(signaling.clone())))
            .with_adapter(Arc::new(SimultaneousOpenAdapter::new(signaling.clone())))
            .with_adapter(Arc::new(IceAdapter::new(signaling.clone())))
            .with_adapter(Arc::new(
                TurnAdapter::new(signaling).with_options(config.turn.options()),
            ))
    }

    /// Set the registry staleness policy
    #[must_use]
    pub fn with_policy(mut self, policy: RegistryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Add an adapter, replacing any adapter for the same method
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn MethodAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Add an adapter, replacing any adapter for the same method
    pub fn register(&mut self, adapter: Arc<dyn MethodAdapter>) {
        self.adapters.insert(adapter.method(), adapter);
    }

    /// Adapter registered for `method`
    #[must_use]
    pub fn adapter(&self, method: ConnectionMethod) -> Option<&Arc<dyn MethodAdapter>> {
        self.adapters.get(&method)
    }

    /// Backing registry
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn MethodRegistry> {
        &self.registry
    }

    /// Registry staleness policy
    #[must_use]
    pub fn policy(&self) -> RegistryPolicy {
        self.policy
    }

    /// Method order for `request`, consulting the registry
    ///
    /// A cached method the policy no longer trusts is removed from the
    /// registry and not promoted. Registry errors are logged and ignored.
    pub async fn plan(&self, request: &ConnectionRequest) -> AttemptPlan {
        let peer = request.peer_id.as_str();
        let cached = match self.registry.get(peer).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(peer, error = %e, "Registry read failed");
                None
            }
        };

        let preferred = match cached {
            Some(entry) if self.policy.is_trusted(&entry, SystemTime::now()) => Some(entry.method),
            Some(entry) => {
                info!(
                    peer,
                    method = %entry.method,
                    failures = entry.consecutive_failures,
                    "Distrusting cached method"
                );
                if let Err(e) = self.registry.remove(peer).await {
                    warn!(peer, error = %e, "Registry remove failed");
                }
                None
            }
            None => None,
        };

        let preferred = preferred.filter(|m| request.methods.contains(m));
        AttemptPlan {
            order: promote(&request.methods, preferred),
            preferred,
        }
    }

    /// Connect to the request's peer
    ///
    /// # Errors
    ///
    /// - `TraversalError::Validation` if the request is malformed; nothing is
    ///   sent in that case
    /// - `TraversalError::Timeout` with no method when the overall deadline
    ///   elapses
    /// - the failing method's error when fail-fast is set
    /// - `TraversalError::AllMethodsFailed` once every method failed
    pub async fn connect(&self, request: &ConnectionRequest) -> ConnectionResult {
        request.validate()?;

        match with_timeout(request.overall_timeout, self.run(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(peer = %request.peer_id, after = ?request.overall_timeout, "Connection attempt timed out");
                Err(TraversalError::Timeout {
                    method: None,
                    after: request.overall_timeout,
                })
            }
        }
    }

    async fn run(&self, request: &ConnectionRequest) -> ConnectionResult {
        let plan = self.plan(request).await;
        debug!(peer = %request.peer_id, order = ?plan.order, preferred = ?plan.preferred, "Method order");

        let mut failures = Vec::new();
        for method in plan.order {
            match self.attempt(method, request).await {
                Ok(mut connection) => {
                    connection.method = method;
                    info!(
                        peer = %request.peer_id,
                        %method,
                        transport = connection.transport.kind(),
                        remote = ?connection.remote,
                        "Connected"
                    );
                    self.remember(request, &connection).await;
                    return Ok(connection);
                }
                Err(err) => {
                    warn!(peer = %request.peer_id, %method, error = %err, "Method failed");
                    if plan.preferred == Some(method) {
                        self.forget_once(request, method).await;
                    }
                    if request.fail_fast {
                        return Err(err);
                    }
                    failures.push(err.to_failure(method));
                }
            }
        }

        Err(TraversalError::AllMethodsFailed { failures })
    }

    async fn attempt(
        &self,
        method: ConnectionMethod,
        request: &ConnectionRequest,
    ) -> ConnectionResult {
        let Some(adapter) = self.adapters.get(&method) else {
            return Err(TraversalError::method_failed(method, "no adapter registered"));
        };

        debug!(peer = %request.peer_id, %method, timeout = ?request.method_timeout, "Trying method");
        match with_timeout(
            request.method_timeout,
            adapter.attempt(request, request.method_timeout),
        )
        .await
        {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(e.into_traversal(method)),
            Err(_) => Err(TraversalError::Timeout {
                method: Some(method),
                after: request.method_timeout,
            }),
        }
    }

    async fn remember(&self, request: &ConnectionRequest, connection: &Connection) {
        if let Err(e) = self
            .registry
            .put(&request.peer_id, connection.method, connection.remote)
            .await
        {
            warn!(peer = %request.peer_id, error = %e, "Registry write failed");
        }
    }

    async fn forget_once(&self, request: &ConnectionRequest, method: ConnectionMethod) {
        match self.registry.record_failure(&request.peer_id, method).await {
            Ok(failures) => debug!(peer = %request.peer_id, %method, failures, "Cached method failed"),
            Err(e) => warn!(peer = %request.peer_id, error = %e, "Registry update failed"),
        }
    }
}

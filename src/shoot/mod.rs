//! Shoot resource mutation
//!
//! Routes objects from the shoot cluster to the rewriter responsible for them:
//!
//! | Kind      | Name                       | Rewriter                                   |
//! |-----------|----------------------------|--------------------------------------------|
//! | ConfigMap | `node-local-dns-*`         | [`NodeLocalDnsMutator::mutate_config_map`] |
//! | ConfigMap | `apiserver-proxy-config-*` | [`mutate_apiserver_proxy_envoy_config`]    |
//! | DaemonSet | `node-local-dns`           | [`NodeLocalDnsMutator::mutate_daemon_set`] |
//! | DaemonSet | `apiserver-proxy`          | [`mutate_apiserver_proxy_daemon_set`]      |
//!
//! Everything else, and anything carrying a deletion timestamp, passes through
//! untouched.

pub mod apiserver_proxy;
pub mod node_local_dns;

use std::sync::{Arc, LazyLock};

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use regex::Regex;
use tracing::info;

pub use apiserver_proxy::{
    mutate_apiserver_proxy_daemon_set, mutate_apiserver_proxy_envoy_config,
    rewrite_envoy_addresses, ENVOY_CONFIG_KEY,
};
pub use node_local_dns::{NodeLocalDnsMutator, PassthroughNodeLocalDns};

use crate::error::UNKNOWN_CONTEXT;
use crate::{Error, Result};

/// Name of the apiserver-proxy DaemonSet
pub const APISERVER_PROXY_DAEMON_SET: &str = "apiserver-proxy";

static NODE_LOCAL_DNS_CONFIG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^node-local-dns-.*").expect("node-local-dns regex is valid")
});

static APISERVER_PROXY_CONFIG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^apiserver-proxy-config-.*").expect("apiserver-proxy config regex is valid")
});

// =============================================================================
// Objects
// =============================================================================

/// An object submitted for mutation
#[derive(Clone, Debug, PartialEq)]
pub enum ShootObject {
    /// A core/v1 ConfigMap
    ConfigMap(ConfigMap),
    /// An apps/v1 DaemonSet
    DaemonSet(DaemonSet),
    /// Any other kind; never mutated
    Other(DynamicObject),
}

impl ShootObject {
    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ShootObject::ConfigMap(cm) => &cm.metadata,
            ShootObject::DaemonSet(ds) => &ds.metadata,
            ShootObject::Other(obj) => &obj.metadata,
        }
    }

    /// Object kind, e.g. `ConfigMap`
    pub fn kind(&self) -> &str {
        match self {
            ShootObject::ConfigMap(_) => <ConfigMap as k8s_openapi::Resource>::KIND,
            ShootObject::DaemonSet(_) => <DaemonSet as k8s_openapi::Resource>::KIND,
            ShootObject::Other(obj) => obj
                .types
                .as_ref()
                .map(|t| t.kind.as_str())
                .unwrap_or(UNKNOWN_CONTEXT),
        }
    }

    /// Object name, empty if unset
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace, empty if unset
    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    /// Whether the object is being deleted
    pub fn is_terminating(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Serialize the object in its current state
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let value = match self {
            ShootObject::ConfigMap(cm) => serde_json::to_value(cm)?,
            ShootObject::DaemonSet(ds) => serde_json::to_value(ds)?,
            ShootObject::Other(obj) => serde_json::to_value(obj)?,
        };
        Ok(value)
    }
}

impl TryFrom<DynamicObject> for ShootObject {
    type Error = Error;

    /// Classify an untyped object by its `apiVersion` and `kind`.
    ///
    /// Fails if the object carries no type information or its payload does not
    /// decode into the kind it claims to be.
    fn try_from(obj: DynamicObject) -> Result<Self> {
        let types = obj
            .types
            .clone()
            .ok_or_else(|| Error::accessor("object has no apiVersion/kind"))?;

        if is::<ConfigMap>(&types) {
            let cm = obj.try_parse::<ConfigMap>().map_err(|e| {
                Error::accessor(format!("object is not a valid ConfigMap: {e}"))
            })?;
            Ok(ShootObject::ConfigMap(cm))
        } else if is::<DaemonSet>(&types) {
            let ds = obj.try_parse::<DaemonSet>().map_err(|e| {
                Error::accessor(format!("object is not a valid DaemonSet: {e}"))
            })?;
            Ok(ShootObject::DaemonSet(ds))
        } else {
            Ok(ShootObject::Other(obj))
        }
    }
}

impl From<ConfigMap> for ShootObject {
    fn from(cm: ConfigMap) -> Self {
        ShootObject::ConfigMap(cm)
    }
}

impl From<DaemonSet> for ShootObject {
    fn from(ds: DaemonSet) -> Self {
        ShootObject::DaemonSet(ds)
    }
}

fn is<K: k8s_openapi::Resource>(types: &TypeMeta) -> bool {
    types.api_version == K::API_VERSION && types.kind == K::KIND
}

// =============================================================================
// Mutation recording
// =============================================================================

/// Receives one event per object handed to a rewriter
#[cfg_attr(test, mockall::automock)]
pub trait MutationRecorder: Send + Sync {
    /// Record that the object is about to be mutated
    fn record(&self, kind: &str, namespace: &str, name: &str);
}

/// Records mutations as structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl MutationRecorder for TracingRecorder {
    fn record(&self, kind: &str, namespace: &str, name: &str) {
        info!(kind = %kind, namespace = %namespace, name = %name, "Mutating resource");
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Mutates resources in the shoot cluster.
///
/// Holds no per-request state; one instance serves concurrent requests.
#[derive(Clone)]
pub struct ShootMutator {
    node_local_dns: Arc<dyn NodeLocalDnsMutator>,
    recorder: Arc<dyn MutationRecorder>,
}

impl Default for ShootMutator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShootMutator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShootMutator").finish_non_exhaustive()
    }
}

impl ShootMutator {
    /// Create a mutator that passes node-local-dns objects through and records
    /// mutations via `tracing`
    pub fn new() -> Self {
        Self {
            node_local_dns: Arc::new(PassthroughNodeLocalDns),
            recorder: Arc::new(TracingRecorder),
        }
    }

    /// Use the given node-local-dns rewrites
    pub fn with_node_local_dns(mut self, node_local_dns: Arc<dyn NodeLocalDnsMutator>) -> Self {
        self.node_local_dns = node_local_dns;
        self
    }

    /// Use the given mutation recorder
    pub fn with_recorder(mut self, recorder: Arc<dyn MutationRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Mutate the object in place if a rewriter is responsible for it.
    ///
    /// Rewriter errors are wrapped in [`Error::Mutation`]. Fields already
    /// changed before a failure are not rolled back.
    pub fn mutate(&self, object: &mut ShootObject) -> Result<()> {
        // If the object does have a deletion timestamp then we don't want to mutate anything.
        if object.is_terminating() {
            return Ok(());
        }

        let kind = object.kind().to_string();
        let namespace = object.namespace().to_string();
        let name = object.name().to_string();

        let result = match object {
            ShootObject::ConfigMap(cm) => {
                if NODE_LOCAL_DNS_CONFIG_REGEX.is_match(&name) {
                    self.recorder.record(&kind, &namespace, &name);
                    self.node_local_dns.mutate_config_map(cm)
                } else if APISERVER_PROXY_CONFIG_REGEX.is_match(&name) {
                    self.recorder.record(&kind, &namespace, &name);
                    mutate_apiserver_proxy_envoy_config(cm)
                } else {
                    Ok(())
                }
            }
            ShootObject::DaemonSet(ds) => match name.as_str() {
                node_local_dns::NODE_LOCAL_DNS_DAEMON_SET => {
                    self.recorder.record(&kind, &namespace, &name);
                    self.node_local_dns.mutate_daemon_set(ds)
                }
                APISERVER_PROXY_DAEMON_SET => {
                    self.recorder.record(&kind, &namespace, &name);
                    mutate_apiserver_proxy_daemon_set(ds)
                }
                _ => Ok(()),
            },
            ShootObject::Other(_) => Ok(()),
        };

        result.map_err(|e| Error::mutation(kind, namespace, name, e))
    }
}

//! node-local-dns collaborator
//!
//! The node-local-dns rewrites are owned elsewhere; the dispatcher only routes
//! to them. [`PassthroughNodeLocalDns`] is used when nothing is plugged in.

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::ConfigMap;
use tracing::debug;

use crate::Result;

/// Name of the node-local-dns DaemonSet
pub const NODE_LOCAL_DNS_DAEMON_SET: &str = "node-local-dns";

/// Rewrites for the node-local-dns ConfigMaps and DaemonSet.
///
/// Implementations must be safe to call concurrently for independent objects.
#[cfg_attr(test, mockall::automock)]
pub trait NodeLocalDnsMutator: Send + Sync {
    /// Mutate a `node-local-dns-*` ConfigMap in place
    fn mutate_config_map(&self, config_map: &mut ConfigMap) -> Result<()>;

    /// Mutate the `node-local-dns` DaemonSet in place
    fn mutate_daemon_set(&self, daemon_set: &mut DaemonSet) -> Result<()>;
}

/// Leaves node-local-dns objects as they are
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughNodeLocalDns;

impl NodeLocalDnsMutator for PassthroughNodeLocalDns {
    fn mutate_config_map(&self, config_map: &mut ConfigMap) -> Result<()> {
        debug!(
            name = ?config_map.metadata.name,
            "No node-local-dns mutator configured, leaving ConfigMap unchanged"
        );
        Ok(())
    }

    fn mutate_daemon_set(&self, daemon_set: &mut DaemonSet) -> Result<()> {
        debug!(
            name = ?daemon_set.metadata.name,
            "No node-local-dns mutator configured, leaving DaemonSet unchanged"
        );
        Ok(())
    }
}

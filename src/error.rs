//! Error types for the shoot mutator
//!
//! Errors carry enough context (object kind, namespace, name, missing key) for
//! an operator to diagnose a denied admission request from the message alone.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for shoot mutation
#[derive(Debug, Error)]
pub enum Error {
    /// The object does not expose the metadata needed to classify it
    #[error("could not create accessor during webhook: {message}")]
    Accessor {
        /// Why the metadata could not be read
        message: String,
    },

    /// A ConfigMap targeted for rewriting lacks the expected data key
    #[error("apiserver-proxy envoy configmap does not have '{key}' key")]
    MissingKey {
        /// The data key that was expected
        key: String,
    },

    /// The node-local-dns collaborator rejected the object
    #[error("node-local-dns mutation failed: {message}")]
    NodeLocalDns {
        /// Description of what failed
        message: String,
    },

    /// A delegated rewriter failed for a specific object
    #[error("failed to mutate {kind} {namespace}/{name}: {source}")]
    Mutation {
        /// Kind of the object being mutated
        kind: String,
        /// Namespace of the object being mutated
        namespace: String,
        /// Name of the object being mutated
        name: String,
        /// The rewriter's error
        source: Box<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying serde_json error
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create an accessor error with the given message
    pub fn accessor(msg: impl Into<String>) -> Self {
        Self::Accessor {
            message: msg.into(),
        }
    }

    /// Create a missing-key error for the given data key
    pub fn missing_key(key: impl Into<String>) -> Self {
        Self::MissingKey { key: key.into() }
    }

    /// Create a node-local-dns error with the given message
    pub fn node_local_dns(msg: impl Into<String>) -> Self {
        Self::NodeLocalDns {
            message: msg.into(),
        }
    }

    /// Wrap a rewriter error with the identity of the object it failed on
    pub fn mutation(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::Mutation {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Innermost error, unwrapping any `Mutation` context
    pub fn root(&self) -> &Error {
        match self {
            Error::Mutation { source, .. } => source.root(),
            other => other,
        }
    }
}

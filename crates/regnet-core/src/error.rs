//! Error types for regnet.

use thiserror::Error;

use crate::LightningImplementation;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in regnet.
///
/// Wrapping variants always render the wrapped error's message unchanged so
/// the text reported by a node survives all the way up to the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// Network not found.
    #[error("network not found: {0}")]
    NetworkNotFound(String),

    /// Node not found.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// A Lightning node references a Bitcoin backend that is not in its network,
    /// or a Lightning node was requested before any Bitcoin node exists.
    #[error("missing bitcoin backend: {0}")]
    MissingBackend(String),

    /// A node descriptor has no port for the role an adapter needs.
    #[error("node '{node}' has no {role} port")]
    MissingPort {
        /// Node name.
        node: String,
        /// Port role.
        role: String,
    },

    /// No free port could be found at or above the requested one.
    #[error("no open port available at or above {0}")]
    NoOpenPort(u16),

    /// Docker error.
    #[error("docker error: {0}")]
    Docker(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// A polling probe never succeeded within its time budget.
    #[error("timed out: {0}")]
    Timeout(Box<Error>),

    /// A Lightning adapter was handed a node of another implementation.
    #[error("{required} adapter cannot be used for '{actual}' nodes")]
    WrongAdapterForNode {
        /// Implementation the adapter serves.
        required: LightningImplementation,
        /// Implementation declared by the node.
        actual: LightningImplementation,
    },

    /// The node accepted the payment request but reported a payment failure.
    #[error("{0}")]
    PaymentFailed(String),

    /// Blocks were mined to cover a shortfall but the send still failed.
    #[error("unable to send funds after mining: {0}")]
    InsufficientFundsRecoveryFailed(Box<Error>),

    /// The node process could not be reached.
    #[error("{0}")]
    Transport(String),

    /// The node process answered with an error status.
    #[error("{message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message reported by the node.
        message: String,
    },

    /// A peer identifier was not of the form `pubkey@host:port`.
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),

    /// A node answered with a payload that could not be interpreted.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

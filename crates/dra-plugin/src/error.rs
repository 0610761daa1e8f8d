//! Error types shared by the preparation engine and its collaborators

use core::error::Error;

use error_stack::Report;

/// Result type for engine operations.
pub type PluginResult<T> = Result<T, Report<PluginError>>;

/// Errors surfaced by the preparation engine.
///
/// Every variant except [`PluginError::ChecksumMismatch`] is recoverable:
/// the caller may retry the whole call, or the operator has to fix the claim.
#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    /// Checkpoint could not be read or written
    #[display("Checkpoint I/O failed: {message}")]
    CheckpointIo { message: String },
    /// Stored checkpoint does not match its checksum
    #[display("Checkpoint checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },
    /// Claim cannot be prepared as given
    #[display("Invalid claim {claim_uid}: {message}")]
    InvalidClaim { claim_uid: String, message: String },
    /// Opaque config failed to decode, normalize or validate
    #[display("Invalid device config: {message}")]
    InvalidConfig { message: String },
    /// Device source not reachable or not populated yet
    #[display("Device discovery unavailable: {message}")]
    DiscoveryUnavailable { message: String },
    /// CDI spec file could not be written or removed
    #[display("CDI descriptor I/O failed: {message}")]
    DescriptorIo { message: String },
    /// The caller's context was cancelled
    #[display("Operation cancelled")]
    Cancelled,
}

impl Error for PluginError {}

impl PluginError {
    pub(crate) fn invalid_claim(claim_uid: &str, message: impl Into<String>) -> Self {
        Self::InvalidClaim {
            claim_uid: claim_uid.to_string(),
            message: message.into(),
        }
    }

    /// Whether the process may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ChecksumMismatch { .. })
    }
}

/// Errors raised while enumerating devices from a discovery source.
#[derive(Debug, derive_more::Display)]
pub enum DiscoveryError {
    #[display("Topology for node {node_name} not found: {message}")]
    NotFound { node_name: String, message: String },
    #[display("Topology for node {node_name} contains no devices")]
    Empty { node_name: String },
    #[display("Malformed topology: {message}")]
    Malformed { message: String },
    #[display("Device source unreachable: {message}")]
    Unreachable { message: String },
}

impl Error for DiscoveryError {}

impl DiscoveryError {
    /// Errors worth waiting out while the node is being set up.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Malformed { .. })
    }
}

//! Error taxonomy for device operations
//!
//! Every public operation reports a [`DeviceError`]. Bonding completions
//! arrive from the management layer as a [`BondingStatus`] and are mapped to
//! the error taxonomy before reaching a caller. Link loss is reported with a
//! [`DisconnectReason`].

/// Errors surfaced to callers of device operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum DeviceError {
    /// Another browse/bonding/connect request is already active
    InProgress,
    /// Adapter is not powered or the service is not ready
    NotReady,
    /// The requested bearer is already bonded
    AlreadyExists,
    /// Operation requires an active link
    NotConnected,
    /// No such device, service or stored bonding
    DoesNotExist,
    /// Services resolved but nothing matched a connectable profile
    ProfileUnavailable,
    /// Malformed UUID, address or property value
    InvalidArguments,
    /// Pairing failed at the authentication stage
    AuthenticationFailed,
    /// Pairing rejected by the remote side
    AuthenticationRejected,
    /// Pairing canceled locally or by the remote side
    AuthenticationCanceled,
    /// Pairing timed out
    AuthenticationTimeout,
    /// Link key or LTK is missing for the requested operation
    KeyMissing,
    /// Page timeout, host unreachable or aborted connection attempt
    ConnectionAttemptFailed,
    /// The kernel/controller lacks the required capability
    NotSupported,
    /// Operation is illegal in the current device state
    Unsupported,
    /// The request was canceled before completion
    Canceled,
}

impl DeviceError {
    /// Short stable error name, usable as a wire identifier
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InProgress => "InProgress",
            Self::NotReady => "NotReady",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotConnected => "NotConnected",
            Self::DoesNotExist => "DoesNotExist",
            Self::ProfileUnavailable => "ProfileUnavailable",
            Self::InvalidArguments => "InvalidArguments",
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::AuthenticationRejected => "AuthenticationRejected",
            Self::AuthenticationCanceled => "AuthenticationCanceled",
            Self::AuthenticationTimeout => "AuthenticationTimeout",
            Self::KeyMissing => "KeyMissing",
            Self::ConnectionAttemptFailed => "ConnectionAttemptFailed",
            Self::NotSupported => "NotSupported",
            Self::Unsupported => "Unsupported",
            Self::Canceled => "Canceled",
        }
    }

    /// Human readable message for the error
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::InProgress => "Operation already in progress",
            Self::NotReady => "Resource not ready",
            Self::AlreadyExists => "Already exists",
            Self::NotConnected => "Not connected",
            Self::DoesNotExist => "Does not exist",
            Self::ProfileUnavailable => "No connectable profile available",
            Self::InvalidArguments => "Invalid arguments",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AuthenticationRejected => "Authentication rejected",
            Self::AuthenticationCanceled => "Authentication canceled",
            Self::AuthenticationTimeout => "Authentication timeout",
            Self::KeyMissing => "Encryption key missing",
            Self::ConnectionAttemptFailed => "Connection attempt failed",
            Self::NotSupported => "Not supported",
            Self::Unsupported => "Operation not permitted in this state",
            Self::Canceled => "Canceled",
        }
    }
}

/// Pairing outcome delivered by the management layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum BondingStatus {
    /// Pairing succeeded
    Success,
    /// Page timeout while creating the link
    ConnectFailed,
    /// Credentials rejected during key exchange
    AuthFailed,
    /// The remote side stopped responding
    Timeout,
    /// The controller is busy with another operation
    Busy,
    /// The remote side rejected the request
    Rejected,
    /// The request was canceled
    Canceled,
    /// The controller is out of resources
    NoResources,
    /// The link dropped mid-exchange
    Disconnected,
    /// A bonding for this bearer already exists
    AlreadyPaired,
    /// Any other failure
    Failed,
}

impl BondingStatus {
    /// Whether a retry may be scheduled for this status
    ///
    /// Only controller-side congestion is worth retrying; authentication
    /// verdicts and remote rejections are terminal.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::NoResources)
    }

    /// Map a terminal status to the error reported to the caller
    ///
    /// # Errors
    ///
    /// Returns the caller-facing [`DeviceError`] for every non-success
    /// status.
    pub const fn to_result(self) -> Result<(), DeviceError> {
        match self {
            Self::Success => Ok(()),
            Self::ConnectFailed => Err(DeviceError::ConnectionAttemptFailed),
            Self::Timeout => Err(DeviceError::AuthenticationTimeout),
            Self::Busy | Self::Rejected => Err(DeviceError::AuthenticationRejected),
            Self::Canceled | Self::NoResources | Self::Disconnected => {
                Err(DeviceError::AuthenticationCanceled)
            }
            Self::AlreadyPaired => Err(DeviceError::AlreadyExists),
            Self::AuthFailed | Self::Failed => Err(DeviceError::AuthenticationFailed),
        }
    }
}

/// Reason attached to a "Disconnected" notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum DisconnectReason {
    /// Unspecified
    Unknown,
    /// Supervision/connection timeout
    Timeout,
    /// Terminated by the local host
    Local,
    /// Terminated by the remote user
    Remote,
    /// Terminated due to an authentication failure
    Authentication,
    /// Terminated by the local host to suspend
    Suspend,
}

impl DisconnectReason {
    /// Short stable reason name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Timeout => "Timeout",
            Self::Local => "Local",
            Self::Remote => "Remote",
            Self::Authentication => "Authentication",
            Self::Suspend => "Suspend",
        }
    }

    /// Human readable message for the reason
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::Unknown => "Unspecified",
            Self::Timeout => "Connection timeout",
            Self::Local => "Connection terminated by local host",
            Self::Remote => "Connection terminated by remote user",
            Self::Authentication => "Connection terminated due to authentication failure",
            Self::Suspend => "Connection terminated by local host for suspend",
        }
    }
}

//! Error types and the uplink failure taxonomy

/// Failure of an external collaborator (device store, cloud queue, telemetry sink)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend did not answer in time
    #[error("backend call timed out")]
    Timeout,
    /// The backend could not be reached or failed internally
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend refused the operation
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

/// Frame codec error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than the smallest frame of that type
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    /// MType this server does not accept on the uplink path
    #[error("unsupported message type 0x{0:02X}")]
    UnsupportedMType(u8),
    /// Major version other than LoRaWAN R1
    #[error("unsupported major version {0}")]
    UnsupportedMajor(u8),
    /// FOpts length exceeds the frame
    #[error("invalid FOpts length {0}")]
    InvalidFOptsLength(u8),
    /// MAC commands in both FOpts and a port 0 payload
    #[error("MAC commands present in FOpts and FRMPayload")]
    DuplicateMacCommands,
    /// Encoded frame would not fit the buffer
    #[error("buffer too small")]
    BufferTooSmall,
    /// FRMPayload without an FPort
    #[error("payload without FPort")]
    MissingFPort,
    /// Join accept MIC did not verify
    #[error("invalid MIC")]
    InvalidMic,
}

/// MAC command decode error
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MacCommandError {
    /// CID not valid in this direction
    #[error("unknown MAC command 0x{0:02X}")]
    UnknownCommand(u8),
    /// Command payload cut short
    #[error("truncated MAC command 0x{cid:02X}")]
    Truncated {
        /// Command identifier
        cid: u8,
    },
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Source could not be read or deserialised
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    /// Value out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Why an uplink request failed.
///
/// Every failure reaches the caller as one of these values on the request
/// outcome; nothing is raised past the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum FailureReason {
    /// MIC did not verify against the session (or join) key
    #[error("MIC check failed")]
    AuthenticationFailed,
    /// Frame counter replayed, out of range, or not a valid reset
    #[error("invalid frame counter")]
    InvalidFrameCounter,
    /// No device with this DevAddr authenticated the frame
    #[error("no matching device by address")]
    NotMatchingDeviceByAddress,
    /// Device is owned by another gateway
    #[error("device belongs to another gateway")]
    BelongsToAnotherGateway,
    /// DevAddr is not part of this network
    #[error("invalid network id")]
    InvalidNetworkId,
    /// Both receive windows were missed
    #[error("receive window missed")]
    ReceiveWindowMissed,
    /// Too many resubmits of the same confirmed uplink
    #[error("resubmit threshold exceeded")]
    ConfirmationResubmitThresholdExceeded,
    /// Device store failed while this request depended on it
    #[error("backend unavailable")]
    BackendUnavailable,
    /// The PHY payload could not be decoded
    #[error("invalid frame")]
    InvalidFrame,
    /// MAC commands could not be decoded; the frame is discarded
    #[error("malformed MAC commands")]
    MalformedMacCommands,
    /// Join request from a DevEUI the device store does not know
    #[error("unknown device")]
    UnknownDevice,
    /// Join request repeated a DevNonce
    #[error("join DevNonce already used")]
    JoinDevNonceReused,
    /// Another gateway is answering this uplink
    #[error("handled by another gateway")]
    HandledByAnotherGateway,
}

impl FailureReason {
    /// Stable kebab-case code for logs and metrics
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::AuthenticationFailed => "authentication-failed",
            FailureReason::InvalidFrameCounter => "invalid-frame-counter",
            FailureReason::NotMatchingDeviceByAddress => "not-matching-device-by-address",
            FailureReason::BelongsToAnotherGateway => "belongs-to-another-gateway",
            FailureReason::InvalidNetworkId => "invalid-network-id",
            FailureReason::ReceiveWindowMissed => "receive-window-missed",
            FailureReason::ConfirmationResubmitThresholdExceeded => {
                "confirmation-resubmit-threshold-exceeded"
            }
            FailureReason::BackendUnavailable => "backend-unavailable",
            FailureReason::InvalidFrame => "invalid-frame",
            FailureReason::MalformedMacCommands => "malformed-mac-commands",
            FailureReason::UnknownDevice => "unknown-device",
            FailureReason::JoinDevNonceReused => "join-dev-nonce-reused",
            FailureReason::HandledByAnotherGateway => "handled-by-another-gateway",
        }
    }
}

impl From<FrameError> for FailureReason {
    fn from(_: FrameError) -> Self {
        FailureReason::InvalidFrame
    }
}

impl From<MacCommandError> for FailureReason {
    fn from(_: MacCommandError) -> Self {
        FailureReason::MalformedMacCommands
    }
}

impl From<StoreError> for FailureReason {
    fn from(_: StoreError) -> Self {
        FailureReason::BackendUnavailable
    }
}

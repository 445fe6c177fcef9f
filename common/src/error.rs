use thiserror::Error;

/// Why a channel refused an activation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DenyReason {
    #[error("channel is disabled")]
    ChannelDisabled,
    #[error("password required")]
    PasswordRequired,
    #[error("password incorrect")]
    PasswordIncorrect,
    #[error("confirmation required")]
    ConfirmationRequired,
    #[error("outside the allowed time window")]
    OutsideTimeWindow,
    #[error("channel is not configured as momentary")]
    NotMomentary,
    #[error("channel was shut off by the safety monitor; a new command is required")]
    SafetyLockout,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelDisabled => "channel_disabled",
            Self::PasswordRequired => "password_required",
            Self::PasswordIncorrect => "password_incorrect",
            Self::ConfirmationRequired => "confirmation_required",
            Self::OutsideTimeWindow => "outside_time_window",
            Self::NotMomentary => "not_momentary",
            Self::SafetyLockout => "safety_lockout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("invalid channel {0}")]
    InvalidChannel(u8),
    #[error("command denied: {0}")]
    Denied(#[from] DenyReason),
    #[error("emergency stop is active")]
    EmergencyStopActive,
    #[error("momentary operation requires a single channel")]
    MomentaryRequiresChannel,
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidChannel(_) => "invalid_channel",
            Self::Denied(reason) => reason.as_str(),
            Self::EmergencyStopActive => "emergency_stop_active",
            Self::MomentaryRequiresChannel => "momentary_requires_channel",
        }
    }
}

/// Structural problems with an inbound message. Nothing is applied when one
/// of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is not a valid JSON object")]
    InvalidPayload,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("channel must be an integer in range or \"all\"")]
    InvalidChannel,
    #[error("unknown action `{0}`")]
    InvalidAction(String),
    #[error("invalid value for field `{0}`")]
    InvalidField(&'static str),
    #[error("no command handler for topic `{0}`")]
    UnknownTopic(String),
    #[error("payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
}

impl ValidationError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::MissingField(_) => "missing_field",
            Self::InvalidChannel => "invalid_channel",
            Self::InvalidAction(_) => "invalid_action",
            Self::InvalidField(_) => "invalid_field",
            Self::UnknownTopic(_) => "unknown_topic",
            Self::PayloadTooLarge(_) => "payload_too_large",
        }
    }
}

/// Error surfaced by [`CommandProcessor::handle`](crate::CommandProcessor::handle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl CommandError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(err) => err.kind(),
            Self::Relay(err) => err.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at most {max} channels are supported, got {count}")]
    TooManyChannels { count: usize, max: usize },
    #[error("channel ids must run contiguously from 1: expected {expected}, found {found}")]
    NonContiguous { expected: u8, found: u8 },
    #[error("channel count changed from {current} to {requested}; a restart is required")]
    ChannelCountChanged { current: usize, requested: usize },
}

/// A failed write to a physical output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hardware fault on output {output}: {message}")]
pub struct HardwareFault {
    pub output: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("publish to `{topic}` failed: {message}")]
pub struct PublishError {
    pub topic: String,
    pub message: String,
}

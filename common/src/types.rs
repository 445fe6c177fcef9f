use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelector {
    Id(u8),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    On,
    Off,
    Toggle,
}

impl RelayAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "toggle" => Some(Self::Toggle),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Toggle => "toggle",
        }
    }
}

/// Who is asking for a state change, and the credentials they supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationRequest {
    pub user: String,
    pub source: String,
    pub password: Option<String>,
    pub confirmed: bool,
}

impl ActivationRequest {
    pub fn new(user: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            source: source.into(),
            password: None,
            confirmed: false,
        }
    }

    /// Request originating from the firmware itself (boot restore, shutdown).
    pub fn system(trigger: &str) -> Self {
        Self::new(trigger, "system")
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutoffReason {
    HeartbeatTimeout,
    MaxOnTimeExceeded,
    TimeWindowViolation,
    EmergencyStop,
}

impl ShutoffReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::MaxOnTimeExceeded => "max_on_time_exceeded",
            Self::TimeWindowViolation => "time_window_violation",
            Self::EmergencyStop => "emergency_stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RelayChange,
    SafetyShutoff,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelayChange => "relay_change",
            Self::SafetyShutoff => "safety_shutoff",
        }
    }
}

/// Typed state-change or safety event, produced under the channel lock and
/// published once the lock is released. Channel 0 denotes every channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub kind: EventKind,
    pub channel: u8,
    pub state: Option<bool>,
    pub reason: Option<String>,
    pub trigger: String,
    pub source: String,
    pub at_ms: u64,
}

impl RelayEvent {
    pub fn relay_change(
        channel: u8,
        state: bool,
        reason: Option<&str>,
        request: &ActivationRequest,
        at_ms: u64,
    ) -> Self {
        Self {
            kind: EventKind::RelayChange,
            channel,
            state: Some(state),
            reason: reason.map(str::to_string),
            trigger: request.user.clone(),
            source: request.source.clone(),
            at_ms,
        }
    }

    pub fn safety_shutoff(
        channel: u8,
        reason: ShutoffReason,
        trigger: &str,
        source: &str,
        at_ms: u64,
    ) -> Self {
        Self {
            kind: EventKind::SafetyShutoff,
            channel,
            state: Some(false),
            reason: Some(reason.as_str().to_string()),
            trigger: trigger.to_string(),
            source: source.to_string(),
            at_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub channel: u8,
    pub name: String,
    pub enabled: bool,
    pub function: &'static str,
    pub on: bool,
    #[serde(rename = "outputLevel")]
    pub output_level: bool,
    #[serde(rename = "awaitingHeartbeat")]
    pub awaiting_heartbeat: bool,
    #[serde(rename = "heartbeatSource", skip_serializing_if = "Option::is_none")]
    pub heartbeat_source: Option<String>,
    #[serde(rename = "heartbeatSequence", skip_serializing_if = "Option::is_none")]
    pub heartbeat_sequence: Option<u32>,
    #[serde(rename = "heartbeatGaps", skip_serializing_if = "Option::is_none")]
    pub heartbeat_gaps: Option<u32>,
    #[serde(rename = "heartbeatAgeMs", skip_serializing_if = "Option::is_none")]
    pub heartbeat_age_ms: Option<u64>,
    #[serde(rename = "onDurationMs")]
    pub on_duration_ms: u64,
    #[serde(rename = "maxOnTimeMs")]
    pub max_on_time_ms: u64,
    #[serde(rename = "safetyShutoff")]
    pub safety_shutoff: bool,
    #[serde(rename = "lastStateChangeMs")]
    pub last_state_change_ms: u64,
    #[serde(rename = "hardwareFaults")]
    pub hardware_faults: u32,
    #[serde(rename = "pendingConfig")]
    pub pending_config: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    #[serde(rename = "emergencyStop")]
    pub emergency_stop: bool,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "lastTickMs")]
    pub last_tick_ms: u64,
    pub channels: Vec<ChannelStatus>,
}

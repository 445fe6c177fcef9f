pub mod channel;
pub mod clock;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod heartbeat;
pub mod output;
pub mod telemetry;
pub mod time_window;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use channel::{ChannelState, ConfigureOutcome, RelayChannel};
pub use clock::{Clock, ManualClock, Moment};
pub use command::{
    Command, CommandProcessor, Dispatched, GeneralCommand, Heartbeat, Inbound, PlatformRequest,
    RelayCommand, ResetScope, MAX_PAYLOAD_BYTES,
};
pub use config::{
    hash_password, ChannelConfig, FunctionType, NetworkConfig, RuntimeConfig, SafetyConfig,
    MAX_CHANNELS,
};
pub use controller::{BatchOutcome, RelayController, TickReport};
pub use error::{
    CommandError, ConfigError, DenyReason, HardwareFault, PublishError, RelayError,
    ValidationError,
};
pub use heartbeat::{HeartbeatEntry, HeartbeatOutcome, HeartbeatRegistry, SequenceGap};
pub use output::{OutputDriver, OutputRef};
pub use telemetry::{ErrorReport, Qos, TelemetryEvent, TelemetryPublisher};
pub use time_window::{minute_of_day, TimeWindow};
pub use topics::{TopicKind, Topics};
pub use types::{
    ActivationRequest, ChannelSelector, ChannelStatus, ControllerStatus, EventKind, RelayAction,
    RelayEvent, ShutoffReason,
};

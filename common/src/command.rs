use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    controller::{BatchOutcome, RelayController},
    error::{CommandError, RelayError, ValidationError},
    heartbeat::HeartbeatOutcome,
    topics::TopicKind,
    types::{ActivationRequest, ChannelSelector, RelayAction},
};

/// Inbound payloads above this size are dropped unparsed.
pub const MAX_PAYLOAD_BYTES: usize = 512;

pub const DEFAULT_USER: &str = "anonymous";
pub const DEFAULT_SOURCE: &str = "mqtt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub channel: ChannelSelector,
    pub action: RelayAction,
    pub momentary: bool,
    pub source: String,
    pub user: String,
    pub password: Option<String>,
    pub confirm: bool,
}

impl RelayCommand {
    pub fn request(&self) -> ActivationRequest {
        ActivationRequest {
            user: self.user.clone(),
            source: self.source.clone(),
            password: self.password.clone(),
            confirmed: self.confirm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    All,
    Relays,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneralCommand {
    Reset { scope: ResetScope },
    Status,
    Reboot { delay_s: u32 },
    Ota { url: String },
    EmergencyStop,
    EmergencyReset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Relay(RelayCommand),
    General {
        command: GeneralCommand,
        origin: ActivationRequest,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub channel: u8,
    pub source_uuid: String,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Command(Command),
    Heartbeat(Heartbeat),
}

impl Inbound {
    fn channel(&self) -> Option<u8> {
        match self {
            Self::Heartbeat(heartbeat) => Some(heartbeat.channel),
            Self::Command(Command::Relay(RelayCommand {
                channel: ChannelSelector::Id(id),
                ..
            })) => Some(*id),
            Self::Command(_) => None,
        }
    }
}

/// Work the core cannot do itself and hands back to the platform layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformRequest {
    Reboot { delay_s: u32 },
    Ota { url: String },
    ResetConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Relay(BatchOutcome),
    Heartbeat(HeartbeatOutcome),
    Status,
    EmergencyStop { switched_off: usize },
    EmergencyReset { was_active: bool },
    RelaysReset,
    Platform(PlatformRequest),
}

/// Turns inbound protocol messages into controller calls. Validation fails
/// closed: nothing reaches the controller unless the whole payload parsed.
pub struct CommandProcessor {
    controller: Arc<RelayController>,
}

impl CommandProcessor {
    pub fn new(controller: Arc<RelayController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<RelayController> {
        &self.controller
    }

    /// Parses, dispatches and reports. Rejections are logged and published on
    /// the error topic before being returned.
    pub fn handle(&self, topic: &str, payload: &[u8]) -> Result<Dispatched, CommandError> {
        let inbound = match self.parse(topic, payload) {
            Ok(inbound) => inbound,
            Err(err) => return Err(self.reject(topic, None, err.into())),
        };
        let channel = inbound.channel();

        let result = match inbound {
            Inbound::Heartbeat(heartbeat) => self
                .controller
                .record_heartbeat(heartbeat.channel, &heartbeat.source_uuid, heartbeat.sequence)
                .map(Dispatched::Heartbeat),
            Inbound::Command(command) => self.dispatch(command),
        };
        result.map_err(|err| self.reject(topic, channel, err.into()))
    }

    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<Inbound, ValidationError> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge(payload.len()));
        }
        let kind = self
            .controller
            .topics()
            .classify(topic)
            .ok_or_else(|| ValidationError::UnknownTopic(topic.to_string()))?;
        let fields = parse_object(payload)?;
        let channel_count = self.controller.channel_count();

        match kind {
            TopicKind::Relay => {
                parse_relay(&fields, channel_count).map(|cmd| Inbound::Command(Command::Relay(cmd)))
            }
            TopicKind::Heartbeat => parse_heartbeat(&fields, channel_count).map(Inbound::Heartbeat),
            TopicKind::General => parse_general(&fields).map(Inbound::Command),
        }
    }

    /// Relay command that arrived already decoded, e.g. assembled by an HTTP
    /// handler from path and body. `origin` names the route in error reports.
    pub fn handle_relay(&self, origin: &str, payload: Value) -> Result<Dispatched, CommandError> {
        let command = match payload {
            Value::Object(fields) => parse_relay(&fields, self.controller.channel_count()),
            _ => Err(ValidationError::InvalidPayload),
        };
        let command = command.map_err(|err| self.reject(origin, None, err.into()))?;
        let channel = match command.channel {
            ChannelSelector::Id(id) => Some(id),
            ChannelSelector::All => None,
        };
        self.dispatch_relay(command)
            .map_err(|err| self.reject(origin, channel, err.into()))
    }

    pub fn dispatch(&self, command: Command) -> Result<Dispatched, RelayError> {
        match command {
            Command::Relay(relay) => self.dispatch_relay(relay),
            Command::General { command, origin } => Ok(self.dispatch_general(command, &origin)),
        }
    }

    fn dispatch_relay(&self, command: RelayCommand) -> Result<Dispatched, RelayError> {
        let request = command.request();
        if !command.momentary {
            return self
                .controller
                .set_state(command.channel, command.action, &request)
                .map(Dispatched::Relay);
        }

        let ChannelSelector::Id(id) = command.channel else {
            return Err(RelayError::MomentaryRequiresChannel);
        };
        match command.action {
            RelayAction::On => self.controller.start_momentary(id, &request)?,
            RelayAction::Off => self.controller.stop_momentary(id, &request)?,
            RelayAction::Toggle => self.controller.toggle_momentary(id, &request)?,
        }
        Ok(Dispatched::Relay(BatchOutcome::single(id)))
    }

    fn dispatch_general(&self, command: GeneralCommand, origin: &ActivationRequest) -> Dispatched {
        debug!(?command, user = origin.user.as_str(), "general command");
        match command {
            GeneralCommand::Reset {
                scope: ResetScope::Relays,
            } => {
                self.controller.reset_channels(origin);
                Dispatched::RelaysReset
            }
            GeneralCommand::Reset {
                scope: ResetScope::Config,
            } => Dispatched::Platform(PlatformRequest::ResetConfig),
            GeneralCommand::Reset {
                scope: ResetScope::All,
            } => {
                self.controller.reset_channels(origin);
                Dispatched::Platform(PlatformRequest::ResetConfig)
            }
            GeneralCommand::Status => {
                self.controller.publish_status();
                Dispatched::Status
            }
            GeneralCommand::Reboot { delay_s } => {
                Dispatched::Platform(PlatformRequest::Reboot { delay_s })
            }
            GeneralCommand::Ota { url } => Dispatched::Platform(PlatformRequest::Ota { url }),
            GeneralCommand::EmergencyStop => Dispatched::EmergencyStop {
                switched_off: self.controller.emergency_stop(origin),
            },
            GeneralCommand::EmergencyReset => Dispatched::EmergencyReset {
                was_active: self.controller.reset_emergency_stop(origin),
            },
        }
    }

    fn reject(&self, topic: &str, channel: Option<u8>, err: CommandError) -> CommandError {
        warn!(topic, channel = ?channel, kind = err.kind(), "command rejected: {err}");
        self.controller
            .report_error(topic, channel, err.kind(), err.to_string());
        err
    }
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, ValidationError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(fields)) => Ok(fields),
        _ => Err(ValidationError::InvalidPayload),
    }
}

fn parse_relay(
    fields: &Map<String, Value>,
    channel_count: usize,
) -> Result<RelayCommand, ValidationError> {
    let channel = parse_selector(fields, channel_count)?;
    let action = required_str(fields, "command")?;
    let action = RelayAction::parse(action)
        .ok_or_else(|| ValidationError::InvalidAction(action.to_string()))?;

    Ok(RelayCommand {
        channel,
        action,
        momentary: optional_bool(fields, "momentary")?.unwrap_or(false),
        source: optional_str(fields, "source")?.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
        user: optional_str(fields, "user")?.unwrap_or_else(|| DEFAULT_USER.to_string()),
        password: optional_str(fields, "password")?,
        confirm: optional_bool(fields, "confirm")?.unwrap_or(false),
    })
}

fn parse_heartbeat(
    fields: &Map<String, Value>,
    channel_count: usize,
) -> Result<Heartbeat, ValidationError> {
    let ChannelSelector::Id(channel) = parse_selector(fields, channel_count)? else {
        return Err(ValidationError::InvalidChannel);
    };
    let source_uuid = required_str(fields, "source_uuid")?;
    if source_uuid.is_empty() {
        return Err(ValidationError::InvalidField("source_uuid"));
    }
    let sequence = fields
        .get("sequence")
        .ok_or(ValidationError::MissingField("sequence"))?
        .as_u64()
        .and_then(|value| u32::try_from(value).ok())
        .ok_or(ValidationError::InvalidField("sequence"))?;

    Ok(Heartbeat {
        channel,
        source_uuid: source_uuid.to_string(),
        sequence,
    })
}

fn parse_general(fields: &Map<String, Value>) -> Result<Command, ValidationError> {
    let name = required_str(fields, "command")?;
    let command = match name {
        "reset" => {
            let scope = match optional_str(fields, "type")?.as_deref() {
                None | Some("relays") => ResetScope::Relays,
                Some("all") => ResetScope::All,
                Some("config") => ResetScope::Config,
                Some(_) => return Err(ValidationError::InvalidField("type")),
            };
            GeneralCommand::Reset { scope }
        }
        "status" => GeneralCommand::Status,
        "reboot" => {
            let delay_s = match fields.get("delay") {
                None | Some(Value::Null) => 0,
                Some(value) => value
                    .as_u64()
                    .and_then(|delay| u32::try_from(delay).ok())
                    .ok_or(ValidationError::InvalidField("delay"))?,
            };
            GeneralCommand::Reboot { delay_s }
        }
        "ota" => {
            let url = required_str(fields, "url")?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ValidationError::InvalidField("url"));
            }
            GeneralCommand::Ota {
                url: url.to_string(),
            }
        }
        "emergency_stop" => GeneralCommand::EmergencyStop,
        "emergency_reset" => GeneralCommand::EmergencyReset,
        _ => return Err(ValidationError::InvalidAction(name.to_string())),
    };

    let origin = ActivationRequest::new(
        optional_str(fields, "user")?.unwrap_or_else(|| DEFAULT_USER.to_string()),
        optional_str(fields, "source")?.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
    );
    Ok(Command::General { command, origin })
}

/// Accepts an integer in `1..=channel_count` or the literal `"all"`.
fn parse_selector(
    fields: &Map<String, Value>,
    channel_count: usize,
) -> Result<ChannelSelector, ValidationError> {
    match fields.get("channel") {
        None => Err(ValidationError::MissingField("channel")),
        Some(Value::String(value)) if value == "all" => Ok(ChannelSelector::All),
        Some(Value::Number(number)) => number
            .as_u64()
            .filter(|id| (1..=channel_count as u64).contains(id))
            .and_then(|id| u8::try_from(id).ok())
            .map(ChannelSelector::Id)
            .ok_or(ValidationError::InvalidChannel),
        Some(_) => Err(ValidationError::InvalidChannel),
    }
}

fn required_str<'a>(
    fields: &'a Map<String, Value>,
    key: &'static str,
) -> Result<&'a str, ValidationError> {
    fields
        .get(key)
        .ok_or(ValidationError::MissingField(key))?
        .as_str()
        .ok_or(ValidationError::InvalidField(key))
}

fn optional_str(
    fields: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<String>, ValidationError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(ValidationError::InvalidField(key)),
    }
}

fn optional_bool(
    fields: &Map<String, Value>,
    key: &'static str,
) -> Result<Option<bool>, ValidationError> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(_) => Err(ValidationError::InvalidField(key)),
    }
}

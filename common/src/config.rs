use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::ConfigError, output::OutputRef, time_window::TimeWindow};

pub const MAX_CHANNELS: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionType {
    #[default]
    Toggle,
    Momentary,
}

impl FunctionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Toggle => "toggle",
            Self::Momentary => "momentary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: u8,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub output_ref: OutputRef,
    #[serde(default)]
    pub function_type: FunctionType,
    #[serde(default)]
    pub requires_password: bool,
    /// Lowercase hex SHA-256 of the channel password.
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub dual_action_channel: Option<u8>,
    /// 0 disables the limit.
    #[serde(default)]
    pub max_on_time_ms: u64,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default = "default_true")]
    pub allow_in_batch: bool,
    #[serde(default)]
    pub inverted_logic: bool,
}

fn default_true() -> bool {
    true
}

impl ChannelConfig {
    pub fn new(channel_id: u8, output_ref: OutputRef) -> Self {
        Self {
            channel_id,
            name: format!("Relay {channel_id}"),
            enabled: true,
            output_ref,
            function_type: FunctionType::Toggle,
            requires_password: false,
            password_hash: String::new(),
            requires_confirmation: false,
            dual_action_channel: None,
            max_on_time_ms: 0,
            time_window: None,
            allow_in_batch: true,
            inverted_logic: false,
        }
    }

    pub fn set_password(&mut self, password: &str) {
        self.requires_password = true;
        self.password_hash = hash_password(password);
    }

    pub fn password_matches(&self, candidate: &str) -> bool {
        !self.password_hash.is_empty()
            && hash_password(candidate).eq_ignore_ascii_case(self.password_hash.trim())
    }

    /// True when any activation guard is configured.
    pub fn is_guarded(&self) -> bool {
        self.requires_password || self.requires_confirmation || self.time_window.is_some()
    }

    pub fn sanitize(&mut self) {
        self.password_hash = self.password_hash.trim().to_ascii_lowercase();
        if let Some(window) = self.time_window.as_mut() {
            window.sanitize();
        }
        if self.dual_action_channel == Some(self.channel_id) {
            self.dual_action_channel = None;
        }
    }
}

pub fn hash_password(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Channel ids must be exactly `1..=len`, in order.
pub fn validate_channels(channels: &[ChannelConfig]) -> Result<(), ConfigError> {
    if channels.len() > MAX_CHANNELS {
        return Err(ConfigError::TooManyChannels {
            count: channels.len(),
            max: MAX_CHANNELS,
        });
    }

    for (index, channel) in channels.iter().enumerate() {
        let expected = (index + 1) as u8;
        if channel.channel_id != expected {
            return Err(ConfigError::NonContiguous {
                expected,
                found: channel.channel_id,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub heartbeat_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub status_publish_interval_ms: u64,
    pub state_save_debounce_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 1_000,
            sweep_interval_ms: 100,
            status_publish_interval_ms: 10_000,
            state_save_debounce_ms: 5_000,
        }
    }
}

impl SafetyConfig {
    pub fn sanitize(&mut self) {
        self.heartbeat_timeout_ms = self.heartbeat_timeout_ms.clamp(200, 60_000);
        self.sweep_interval_ms = self.sweep_interval_ms.clamp(10, 1_000);
        self.status_publish_interval_ms = self.status_publish_interval_ms.clamp(1_000, 3_600_000);
        self.state_save_debounce_ms = self.state_save_debounce_ms.clamp(500, 600_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub device_id: String,
    pub topic_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            device_id: "relaynode-01".to_string(),
            topic_prefix: "relaynode".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub restore_states_on_boot: bool,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            channels: (1..=4).map(|id| ChannelConfig::new(id, OutputRef(id))).collect(),
            safety: SafetyConfig::default(),
            network: NetworkConfig::default(),
            timezone: default_timezone(),
            restore_states_on_boot: false,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.channels
            .retain(|channel| (1..=MAX_CHANNELS as u8).contains(&channel.channel_id));
        self.channels.sort_by_key(|channel| channel.channel_id);
        self.channels.dedup_by_key(|channel| channel.channel_id);

        let ids: Vec<u8> = self.channels.iter().map(|channel| channel.channel_id).collect();
        for channel in &mut self.channels {
            channel.sanitize();
            if let Some(pair) = channel.dual_action_channel {
                if !ids.contains(&pair) {
                    channel.dual_action_channel = None;
                }
            }
        }

        self.safety.sanitize();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_channels(&self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn password_hash_round_trips() {
        let mut config = ChannelConfig::new(7, OutputRef(7));
        config.set_password("hunter2");

        assert!(config.requires_password);
        assert_eq!(config.password_hash.len(), 64);
        assert!(config.password_matches("hunter2"));
        assert!(!config.password_matches("hunter3"));
    }

    #[test]
    fn uppercase_stored_hash_still_matches() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.requires_password = true;
        config.password_hash = hash_password("secret").to_ascii_uppercase();

        assert!(config.password_matches("secret"));
    }

    #[test]
    fn empty_hash_never_matches() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.requires_password = true;
        assert!(!config.password_matches(""));
    }

    #[test]
    fn sanitize_sorts_dedups_and_drops_out_of_range_channels() {
        let mut runtime = RuntimeConfig {
            channels: vec![
                ChannelConfig::new(2, OutputRef(12)),
                ChannelConfig::new(0, OutputRef(10)),
                ChannelConfig::new(1, OutputRef(11)),
                ChannelConfig::new(2, OutputRef(13)),
                ChannelConfig::new(17, OutputRef(14)),
            ],
            ..RuntimeConfig::default()
        };
        runtime.sanitize();

        let ids: Vec<(u8, OutputRef)> = runtime
            .channels
            .iter()
            .map(|channel| (channel.channel_id, channel.output_ref))
            .collect();
        assert_eq!(ids, vec![(1, OutputRef(11)), (2, OutputRef(12))]);
        assert!(runtime.validate().is_ok());
    }

    #[test]
    fn sanitize_clears_dangling_dual_action_pairs() {
        let mut first = ChannelConfig::new(1, OutputRef(1));
        first.dual_action_channel = Some(9);
        let mut second = ChannelConfig::new(2, OutputRef(2));
        second.dual_action_channel = Some(2);
        let mut third = ChannelConfig::new(3, OutputRef(3));
        third.dual_action_channel = Some(1);

        let mut runtime = RuntimeConfig {
            channels: vec![first, second, third],
            ..RuntimeConfig::default()
        };
        runtime.sanitize();

        assert_eq!(runtime.channels[0].dual_action_channel, None);
        assert_eq!(runtime.channels[1].dual_action_channel, None);
        assert_eq!(runtime.channels[2].dual_action_channel, Some(1));
    }

    #[test]
    fn validate_rejects_gaps() {
        let channels = vec![
            ChannelConfig::new(1, OutputRef(1)),
            ChannelConfig::new(3, OutputRef(3)),
        ];
        assert_eq!(
            validate_channels(&channels),
            Err(ConfigError::NonContiguous {
                expected: 2,
                found: 3
            })
        );
    }

    #[test]
    fn safety_sanitize_clamps_timings() {
        let mut safety = SafetyConfig {
            heartbeat_timeout_ms: 5,
            sweep_interval_ms: 0,
            status_publish_interval_ms: 10_000,
            state_save_debounce_ms: 5_000,
        };
        safety.sanitize();
        assert_eq!(safety.heartbeat_timeout_ms, 200);
        assert_eq!(safety.sweep_interval_ms, 10);
    }

    #[test]
    fn channel_config_defaults_from_minimal_json() {
        let raw = r#"{"channel_id": 3, "output_ref": 21, "function_type": "momentary"}"#;
        let config: ChannelConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.channel_id, 3);
        assert_eq!(config.output_ref, OutputRef(21));
        assert_eq!(config.function_type, FunctionType::Momentary);
        assert!(config.enabled);
        assert!(config.allow_in_batch);
        assert!(!config.inverted_logic);
        assert_eq!(config.max_on_time_ms, 0);
    }
}

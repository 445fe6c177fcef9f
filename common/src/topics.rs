#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Relay,
    Heartbeat,
    General,
}

/// Per-device topic set, `{prefix}/{device_id}/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub relay_command: String,
    pub heartbeat: String,
    pub general_command: String,
    pub event: String,
    pub state: String,
    pub error: String,
}

impl Topics {
    pub fn new(prefix: &str, device_id: &str) -> Self {
        let base = format!(
            "{}/{}",
            prefix.trim_matches('/'),
            device_id.trim_matches('/')
        );
        Self {
            relay_command: format!("{base}/cmnd/relay"),
            heartbeat: format!("{base}/cmnd/heartbeat"),
            general_command: format!("{base}/cmnd/system"),
            event: format!("{base}/tele/event"),
            state: format!("{base}/tele/state"),
            error: format!("{base}/tele/error"),
        }
    }

    pub fn subscriptions(&self) -> [&str; 3] {
        [
            self.relay_command.as_str(),
            self.heartbeat.as_str(),
            self.general_command.as_str(),
        ]
    }

    pub fn classify(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.relay_command {
            Some(TopicKind::Relay)
        } else if topic == self.heartbeat {
            Some(TopicKind::Heartbeat)
        } else if topic == self.general_command {
            Some(TopicKind::General)
        } else {
            None
        }
    }
}

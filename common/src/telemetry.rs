use serde::Serialize;

use crate::{error::PublishError, types::RelayEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Outbound message sink. Implementations must not wait for delivery.
pub trait TelemetryPublisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    pub event: &'static str,
    pub channel: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub trigger: String,
    pub source: String,
    pub timestamp: String,
}

impl TelemetryEvent {
    pub fn from_event(event: &RelayEvent, timestamp: String) -> Self {
        Self {
            event: event.kind.as_str(),
            channel: event.channel,
            state: event.state,
            reason: event.reason.clone(),
            trigger: event.trigger.clone(),
            source: event.source.clone(),
            timestamp,
        }
    }
}

/// Published on the error topic when an inbound command is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub error: String,
    pub kind: &'static str,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivationRequest, ShutoffReason};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn relay_change_omits_missing_reason() {
        let request = ActivationRequest::new("alice", "app");
        let event = RelayEvent::relay_change(2, true, None, &request, 10);
        let wire = TelemetryEvent::from_event(&event, "2026-01-01T00:00:00.000Z".to_string());

        assert_eq!(
            serde_json::to_value(&wire).unwrap(),
            json!({
                "event": "relay_change",
                "channel": 2,
                "state": true,
                "trigger": "alice",
                "source": "app",
                "timestamp": "2026-01-01T00:00:00.000Z",
            })
        );
    }

    #[test]
    fn safety_shutoff_carries_reason() {
        let event = RelayEvent::safety_shutoff(
            3,
            ShutoffReason::HeartbeatTimeout,
            "safety_monitor",
            "phone-1",
            1_200,
        );
        let wire = TelemetryEvent::from_event(&event, String::new());
        let value = serde_json::to_value(&wire).unwrap();

        assert_eq!(value["event"], "safety_shutoff");
        assert_eq!(value["state"], false);
        assert_eq!(value["reason"], "heartbeat_timeout");
        assert_eq!(value["source"], "phone-1");
    }
}

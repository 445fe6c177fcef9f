use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use serde_json::Value;

use crate::{
    error::{HardwareFault, PublishError},
    output::{OutputDriver, OutputRef},
    telemetry::{Qos, TelemetryPublisher},
};

#[derive(Debug, Default)]
pub(crate) struct RecordingDriver {
    levels: Mutex<HashMap<OutputRef, bool>>,
    writes: Mutex<Vec<(OutputRef, bool)>>,
    failing: AtomicBool,
}

impl RecordingDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn level(&self, output: OutputRef) -> Option<bool> {
        self.levels.lock().unwrap().get(&output).copied()
    }

    pub(crate) fn writes(&self) -> Vec<(OutputRef, bool)> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl OutputDriver for RecordingDriver {
    fn set_output(&self, output: OutputRef, level: bool) -> Result<(), HardwareFault> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HardwareFault {
                output: output.0,
                message: "injected failure".to_string(),
            });
        }
        self.levels.lock().unwrap().insert(output, level);
        self.writes.lock().unwrap().push((output, level));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Published {
    pub topic: String,
    pub payload: Value,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RecordingPublisher {
    messages: Mutex<Vec<Published>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn on_topic(&self, topic: &str) -> Vec<Published> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    pub(crate) fn payloads(&self, topic: &str) -> Vec<Value> {
        self.on_topic(topic)
            .into_iter()
            .map(|message| message.payload)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.messages.lock().unwrap().clear();
    }

    pub(crate) fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl TelemetryPublisher for RecordingPublisher {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError {
                topic: topic.to_string(),
                message: "broker unavailable".to_string(),
            });
        }
        let payload = serde_json::from_slice(&payload).unwrap_or(Value::Null);
        self.messages.lock().unwrap().push(Published {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }
}

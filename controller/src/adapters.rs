use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};

use chrono::{Datelike, SecondsFormat, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, QoS};
use tracing::{debug, warn};

use relaynode_common::{
    minute_of_day, Clock, HardwareFault, Moment, OutputDriver, OutputRef, PublishError, Qos,
    TelemetryPublisher,
};

/// Wall-clock readings before this year mean the RTC was never set.
const MIN_SYNCED_YEAR: i32 = 2020;

/// Output driver for host builds: remembers levels and logs every write.
#[derive(Debug, Default)]
pub struct SimulatedOutputs {
    levels: Mutex<HashMap<OutputRef, bool>>,
}

#[cfg(test)]
impl SimulatedOutputs {
    fn level(&self, output: OutputRef) -> Option<bool> {
        self.levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&output)
            .copied()
    }
}

impl OutputDriver for SimulatedOutputs {
    fn set_output(&self, output: OutputRef, level: bool) -> Result<(), HardwareFault> {
        let previous = self
            .levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(output, level);
        if previous != Some(level) {
            debug!(output = output.0, level, "simulated output changed");
        }
        Ok(())
    }
}

/// Queues telemetry on the MQTT client without waiting for the broker.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

impl TelemetryPublisher for MqttPublisher {
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, to_mqtt_qos(qos), retain, payload)
            .map_err(|err| PublishError {
                topic: topic.to_string(),
                message: err.to_string(),
            })
    }
}

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Monotonic milliseconds since process start, plus local time of day in the
/// configured timezone once the wall clock looks synchronized.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    timezone: Tz,
}

impl SystemClock {
    pub fn new(timezone: &str) -> Self {
        let timezone = timezone.parse::<Tz>().unwrap_or_else(|err| {
            warn!("unknown timezone {timezone:?} ({err}); using UTC");
            chrono_tz::UTC
        });
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    fn local_minute(&self) -> Option<u16> {
        let now = Utc::now().with_timezone(&self.timezone);
        (now.year() >= MIN_SYNCED_YEAR).then(|| minute_of_day(&now))
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Moment {
        Moment {
            ms: monotonic_ms(),
            minute_of_day: self.local_minute(),
        }
    }

    fn timestamp(&self) -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_outputs_remember_levels() {
        let outputs = SimulatedOutputs::default();
        assert_eq!(outputs.level(OutputRef(4)), None);

        outputs.set_output(OutputRef(4), true).unwrap();
        outputs.set_output(OutputRef(4), false).unwrap();

        assert_eq!(outputs.level(OutputRef(4)), Some(false));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(SystemClock::new("Mars/Olympus").timezone(), chrono_tz::UTC);
        assert_eq!(
            SystemClock::new("Europe/Berlin").timezone(),
            chrono_tz::Europe::Berlin
        );
    }

    #[test]
    fn system_clock_is_monotonic_and_reports_time_of_day() {
        let clock = SystemClock::new("UTC");
        let first = clock.now();
        let second = clock.now();

        assert!(second.ms >= first.ms);
        let minute = second.minute_of_day.expect("host clock should be synchronized");
        assert!(minute < 1440);
        assert!(clock.timestamp().ends_with('Z'));
    }

    #[test]
    fn qos_levels_map_one_to_one() {
        assert_eq!(to_mqtt_qos(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_mqtt_qos(Qos::ExactlyOnce), QoS::ExactlyOnce);
    }
}

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use tracing::{info, warn};

use crate::{
    channel::{lock_channel, ConfigureOutcome, RelayChannel},
    clock::{Clock, Moment},
    config::{validate_channels, ChannelConfig, FunctionType, SafetyConfig},
    error::{ConfigError, DenyReason, RelayError},
    heartbeat::{HeartbeatOutcome, HeartbeatRegistry},
    output::OutputDriver,
    telemetry::{ErrorReport, Qos, TelemetryEvent, TelemetryPublisher},
    topics::Topics,
    types::{
        ActivationRequest, ChannelSelector, ControllerStatus, EventKind, RelayAction, RelayEvent,
        ShutoffReason,
    },
};

/// Per-channel results of a state change. A single-channel command that
/// fails is returned as an error instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub skipped: Vec<u8>,
    pub results: Vec<(u8, Result<(), RelayError>)>,
}

impl BatchOutcome {
    pub fn single(channel: u8) -> Self {
        Self {
            succeeded: 1,
            skipped: Vec::new(),
            results: vec![(channel, Ok(()))],
        }
    }

    pub fn first_error(&self) -> Option<&RelayError> {
        self.results
            .iter()
            .find_map(|(_, result)| result.as_ref().err())
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded
    }

    fn record(&mut self, channel: u8, result: Result<(), RelayError>) {
        if result.is_ok() {
            self.succeeded += 1;
        }
        self.results.push((channel, result));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub shutoffs: usize,
}

/// Sole owner of the channel table. Every mutation takes the lock of the
/// channel it touches; telemetry goes out after the lock is released.
pub struct RelayController {
    channels: Vec<Mutex<RelayChannel>>,
    heartbeats: HeartbeatRegistry,
    emergency_stop_active: AtomicBool,
    states_dirty: AtomicBool,
    started_ms: u64,
    last_tick_ms: AtomicU64,
    topics: Topics,
    publisher: Arc<dyn TelemetryPublisher>,
    clock: Arc<dyn Clock>,
}

impl RelayController {
    pub fn new(
        configs: Vec<ChannelConfig>,
        safety: &SafetyConfig,
        topics: Topics,
        driver: Arc<dyn OutputDriver>,
        publisher: Arc<dyn TelemetryPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        validate_channels(&configs)?;

        let now = clock.now();
        let channels = configs
            .into_iter()
            .map(|config| {
                let mut channel = RelayChannel::new(config, driver.clone());
                channel.initialize(now);
                Mutex::new(channel)
            })
            .collect::<Vec<_>>();
        info!(channels = channels.len(), "relay controller initialized");

        Ok(Self {
            channels,
            heartbeats: HeartbeatRegistry::new(safety.heartbeat_timeout_ms),
            emergency_stop_active: AtomicBool::new(false),
            states_dirty: AtomicBool::new(false),
            started_ms: now.ms,
            last_tick_ms: AtomicU64::new(now.ms),
            topics,
            publisher,
            clock,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeats.timeout_ms()
    }

    pub fn is_emergency_stop_active(&self) -> bool {
        self.emergency_stop_active.load(Ordering::SeqCst)
    }

    pub fn is_on(&self, channel_id: u8) -> Result<bool, RelayError> {
        Ok(lock_channel(self.slot(channel_id)?).is_on())
    }

    pub fn set_state(
        &self,
        selector: ChannelSelector,
        action: RelayAction,
        request: &ActivationRequest,
    ) -> Result<BatchOutcome, RelayError> {
        self.ensure_not_stopped()?;
        let now = self.clock.now();
        let mut events = Vec::new();

        let result = match selector {
            ChannelSelector::Id(id) => {
                let slot = self.slot(id)?;
                let mut channel = lock_channel(slot);
                self.apply_action(&mut channel, action, request, now, &mut events)
                    .map(|()| BatchOutcome::single(id))
            }
            ChannelSelector::All => Ok(self.apply_to_all(action, request, now, &mut events)),
        };

        self.emit(events);
        result
    }

    pub fn start_momentary(
        &self,
        channel_id: u8,
        request: &ActivationRequest,
    ) -> Result<(), RelayError> {
        self.with_channel(channel_id, |channel, now, events| {
            channel.start_momentary(request, now, events)
        })
    }

    pub fn stop_momentary(
        &self,
        channel_id: u8,
        request: &ActivationRequest,
    ) -> Result<(), RelayError> {
        self.with_channel(channel_id, |channel, now, events| {
            channel.stop_momentary(request, now, events)
        })
    }

    /// Starts or stops the momentary cycle depending on the current state,
    /// decided under the channel lock.
    pub fn toggle_momentary(
        &self,
        channel_id: u8,
        request: &ActivationRequest,
    ) -> Result<(), RelayError> {
        self.with_channel(channel_id, |channel, now, events| {
            if channel.is_on() {
                channel.stop_momentary(request, now, events)
            } else {
                channel.start_momentary(request, now, events)
            }
        })
    }

    pub fn record_heartbeat(
        &self,
        channel_id: u8,
        source_id: &str,
        sequence: u32,
    ) -> Result<HeartbeatOutcome, RelayError> {
        self.ensure_not_stopped()?;
        let slot = self.slot(channel_id)?;
        let now = self.clock.now();
        let mut events = Vec::new();

        let result = {
            let mut channel = lock_channel(slot);
            self.ensure_not_stopped()?;
            self.heartbeats
                .record(&mut channel, source_id, sequence, now, &mut events)
                .map_err(RelayError::from)
        };

        self.emit(events);
        result
    }

    /// Forces every enabled channel off and blocks further commands until
    /// [`RelayController::reset_emergency_stop`]. Returns how many channels
    /// were on.
    pub fn emergency_stop(&self, request: &ActivationRequest) -> usize {
        // Raised before any channel lock is taken so a command that acquires
        // a lock after this point observes it.
        self.emergency_stop_active.store(true, Ordering::SeqCst);
        let now = self.clock.now();

        let mut switched_off = 0;
        for slot in &self.channels {
            let mut channel = lock_channel(slot);
            if channel.config().enabled && channel.force_off(ShutoffReason::EmergencyStop, now) {
                switched_off += 1;
            }
        }

        warn!(
            user = request.user.as_str(),
            source = request.source.as_str(),
            switched_off,
            "emergency stop engaged"
        );
        self.emit(vec![RelayEvent::safety_shutoff(
            0,
            ShutoffReason::EmergencyStop,
            &request.user,
            &request.source,
            now.ms,
        )]);
        switched_off
    }

    /// Returns whether an emergency stop was active. Channels stay off.
    pub fn reset_emergency_stop(&self, request: &ActivationRequest) -> bool {
        let was_active = self.emergency_stop_active.swap(false, Ordering::SeqCst);
        if was_active {
            info!(
                user = request.user.as_str(),
                source = request.source.as_str(),
                "emergency stop cleared"
            );
        }
        was_active
    }

    /// Periodic safety pass: heartbeat sweep, then the full per-channel
    /// safety check.
    pub fn tick(&self, now: Moment) -> TickReport {
        let mut events = Vec::new();
        let mut shutoffs = self.heartbeats.sweep(&self.channels, now, &mut events);

        let timeout_ms = self.heartbeats.timeout_ms();
        for slot in &self.channels {
            let mut channel = lock_channel(slot);
            if channel.check_safety(now, timeout_ms, &mut events) {
                shutoffs += 1;
            }
        }

        self.last_tick_ms.store(now.ms, Ordering::SeqCst);
        self.emit(events);
        TickReport { shutoffs }
    }

    /// Turns every channel off, releases safety latches and applies parked
    /// configurations. Does not clear an emergency stop.
    pub fn reset_channels(&self, request: &ActivationRequest) {
        let now = self.clock.now();
        let mut events = Vec::new();
        for slot in &self.channels {
            lock_channel(slot).reset(request, now, &mut events);
        }
        info!(user = request.user.as_str(), "channels reset");
        self.emit(events);
    }

    pub fn reconfigure(
        &self,
        configs: Vec<ChannelConfig>,
    ) -> Result<Vec<ConfigureOutcome>, ConfigError> {
        validate_channels(&configs)?;
        if configs.len() != self.channels.len() {
            return Err(ConfigError::ChannelCountChanged {
                current: self.channels.len(),
                requested: configs.len(),
            });
        }

        let now = self.clock.now();
        let outcomes = self
            .channels
            .iter()
            .zip(configs)
            .map(|(slot, config)| lock_channel(slot).configure(config, now))
            .collect::<Vec<_>>();
        self.states_dirty.store(true, Ordering::SeqCst);
        Ok(outcomes)
    }

    /// Re-energizes unguarded toggle channels that were on before a restart.
    /// Momentary channels are never restored.
    pub fn restore_states(&self, states: &[bool]) -> usize {
        let request = ActivationRequest::system("boot_restore");
        let now = self.clock.now();
        let mut events = Vec::new();
        let mut restored = 0;

        for (slot, &was_on) in self.channels.iter().zip(states) {
            if !was_on {
                continue;
            }
            let mut channel = lock_channel(slot);
            let config = channel.config();
            if config.function_type != FunctionType::Toggle || config.is_guarded() {
                continue;
            }
            if channel.turn_on(&request, now, &mut events).is_ok() {
                restored += 1;
            }
        }

        self.emit(events);
        restored
    }

    pub fn channel_states(&self) -> Vec<bool> {
        self.channels
            .iter()
            .map(|slot| lock_channel(slot).is_on())
            .collect()
    }

    /// True once per batch of state changes since the previous call.
    pub fn take_states_dirty(&self) -> bool {
        self.states_dirty.swap(false, Ordering::SeqCst)
    }

    pub fn status(&self) -> ControllerStatus {
        let now = self.clock.now();
        ControllerStatus {
            emergency_stop: self.is_emergency_stop_active(),
            uptime_ms: now.ms.saturating_sub(self.started_ms),
            last_tick_ms: self.last_tick_ms.load(Ordering::SeqCst),
            channels: self
                .channels
                .iter()
                .map(|slot| lock_channel(slot).status(now))
                .collect(),
        }
    }

    pub fn publish_status(&self) {
        let status = self.status();
        match serde_json::to_vec(&status) {
            Ok(body) => {
                if let Err(err) = self
                    .publisher
                    .publish(&self.topics.state, body, Qos::AtLeastOnce, true)
                {
                    warn!("status publish failed: {err}");
                }
            }
            Err(err) => warn!("status serialization failed: {err}"),
        }
    }

    pub fn report_error(
        &self,
        topic: &str,
        channel: Option<u8>,
        kind: &'static str,
        error: String,
    ) {
        let report = ErrorReport {
            error,
            kind,
            topic: topic.to_string(),
            channel,
            timestamp: self.clock.timestamp(),
        };
        match serde_json::to_vec(&report) {
            Ok(body) => {
                if let Err(err) =
                    self.publisher
                        .publish(&self.topics.error, body, Qos::AtMostOnce, false)
                {
                    warn!("error report publish failed: {err}");
                }
            }
            Err(err) => warn!("error report serialization failed: {err}"),
        }
    }

    fn slot(&self, channel_id: u8) -> Result<&Mutex<RelayChannel>, RelayError> {
        usize::from(channel_id)
            .checked_sub(1)
            .and_then(|index| self.channels.get(index))
            .ok_or(RelayError::InvalidChannel(channel_id))
    }

    fn ensure_not_stopped(&self) -> Result<(), RelayError> {
        if self.is_emergency_stop_active() {
            Err(RelayError::EmergencyStopActive)
        } else {
            Ok(())
        }
    }

    fn with_channel<F>(&self, channel_id: u8, operation: F) -> Result<(), RelayError>
    where
        F: FnOnce(&mut RelayChannel, Moment, &mut Vec<RelayEvent>) -> Result<(), DenyReason>,
    {
        self.ensure_not_stopped()?;
        let slot = self.slot(channel_id)?;
        let now = self.clock.now();
        let mut events = Vec::new();

        let result = {
            let mut channel = lock_channel(slot);
            self.ensure_not_stopped()?;
            operation(&mut channel, now, &mut events).map_err(RelayError::from)
        };

        self.emit(events);
        result
    }

    fn apply_action(
        &self,
        channel: &mut RelayChannel,
        action: RelayAction,
        request: &ActivationRequest,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> Result<(), RelayError> {
        // Checked again under the lock: an emergency stop raised after the
        // entry check must win over this command.
        self.ensure_not_stopped()?;
        let result = match action {
            RelayAction::On => channel.turn_on(request, now, events),
            RelayAction::Off => channel.turn_off("command", request, now, events),
            RelayAction::Toggle => channel.toggle(request, now, events),
        };
        result.map_err(RelayError::from)
    }

    fn apply_to_all(
        &self,
        action: RelayAction,
        request: &ActivationRequest,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for slot in &self.channels {
            let mut channel = lock_channel(slot);
            let id = channel.id();
            let config = channel.config();
            if !config.enabled || (action != RelayAction::Off && !config.allow_in_batch) {
                outcome.skipped.push(id);
                continue;
            }
            let result = self.apply_action(&mut channel, action, request, now, events);
            outcome.record(id, result);
        }
        outcome
    }

    fn emit(&self, events: Vec<RelayEvent>) {
        if events.is_empty() {
            return;
        }
        self.states_dirty.store(true, Ordering::SeqCst);

        for event in events {
            if event.kind == EventKind::SafetyShutoff {
                info!(
                    channel = event.channel,
                    reason = event.reason.as_deref().unwrap_or_default(),
                    "publishing safety event"
                );
            }
            let wire = TelemetryEvent::from_event(&event, self.clock.timestamp());
            let body = match serde_json::to_vec(&wire) {
                Ok(body) => body,
                Err(err) => {
                    warn!("event serialization failed: {err}");
                    continue;
                }
            };
            if let Err(err) = self
                .publisher
                .publish(&self.topics.event, body, Qos::AtLeastOnce, false)
            {
                warn!("event publish failed: {err}");
            }
        }
    }
}

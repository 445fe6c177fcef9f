use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::{
    clock::Moment,
    config::{ChannelConfig, FunctionType},
    error::DenyReason,
    heartbeat::HeartbeatEntry,
    output::OutputDriver,
    types::{ActivationRequest, ChannelStatus, RelayEvent, ShutoffReason},
};

pub(crate) const SAFETY_TRIGGER: &str = "safety_monitor";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelState {
    pub logical_on: bool,
    pub last_state_change_ms: u64,
    /// Set only while the channel is on.
    pub turned_on_at_ms: Option<u64>,
    pub safety_shutoff_triggered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    Applied,
    /// The channel is on; the config waits for the next explicit reset.
    Deferred,
}

/// One physical relay: its configuration, runtime state and heartbeat entry.
///
/// `awaiting_heartbeat` is the heartbeat entry's `active` flag, so the two
/// cannot disagree. Every transition writes the output level
/// `logical_on ^ inverted_logic` before returning.
pub struct RelayChannel {
    config: ChannelConfig,
    pending_config: Option<ChannelConfig>,
    state: ChannelState,
    heartbeat: HeartbeatEntry,
    output_level: bool,
    hardware_faults: u32,
    driver: Arc<dyn OutputDriver>,
}

impl RelayChannel {
    pub fn new(config: ChannelConfig, driver: Arc<dyn OutputDriver>) -> Self {
        let output_level = config.inverted_logic;
        Self {
            config,
            pending_config: None,
            state: ChannelState::default(),
            heartbeat: HeartbeatEntry::default(),
            output_level,
            hardware_faults: 0,
            driver,
        }
    }

    /// Drives the output to the level matching the current (off) state.
    pub fn initialize(&mut self, now: Moment) {
        self.state.last_state_change_ms = now.ms;
        self.apply_output();
    }

    pub fn id(&self) -> u8 {
        self.config.channel_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    pub fn heartbeat(&self) -> &HeartbeatEntry {
        &self.heartbeat
    }

    pub fn is_on(&self) -> bool {
        self.state.logical_on
    }

    pub fn awaiting_heartbeat(&self) -> bool {
        self.heartbeat.is_active()
    }

    /// Level last written to the driver.
    pub fn output_level(&self) -> bool {
        self.output_level
    }

    pub fn hardware_faults(&self) -> u32 {
        self.hardware_faults
    }

    pub fn has_pending_config(&self) -> bool {
        self.pending_config.is_some()
    }

    pub fn turn_on(
        &mut self,
        request: &ActivationRequest,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> Result<(), DenyReason> {
        self.ensure_enabled()?;
        self.authorize(request, now)?;
        if self.state.logical_on {
            return Ok(());
        }

        self.state.logical_on = true;
        self.state.turned_on_at_ms = Some(now.ms);
        self.state.last_state_change_ms = now.ms;
        self.state.safety_shutoff_triggered = false;
        self.apply_output();
        events.push(RelayEvent::relay_change(
            self.id(),
            true,
            None,
            request,
            now.ms,
        ));
        Ok(())
    }

    /// Never gated by password, confirmation or time window.
    pub fn turn_off(
        &mut self,
        reason: &str,
        request: &ActivationRequest,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> Result<(), DenyReason> {
        self.ensure_enabled()?;
        self.heartbeat.clear();
        if !self.state.logical_on {
            return Ok(());
        }

        self.de_energize(now);
        events.push(RelayEvent::relay_change(
            self.id(),
            false,
            Some(reason),
            request,
            now.ms,
        ));
        Ok(())
    }

    /// Switching off is never gated; switching on goes through the guards.
    pub fn toggle(
        &mut self,
        request: &ActivationRequest,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> Result<(), DenyReason> {
        if self.state.logical_on {
            self.turn_off("toggle", request, now, events)
        } else {
            self.turn_on(request, now, events)
        }
    }

    pub fn start_momentary(
        &mut self,
        request: &ActivationRequest,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> Result<(), DenyReason> {
        self.ensure_momentary()?;
        self.turn_on(request, now, events)?;
        self.heartbeat.arm(&request.source, 0, now.ms);
        Ok(())
    }

    pub fn stop_momentary(
        &mut self,
        request: &ActivationRequest,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> Result<(), DenyReason> {
        self.ensure_enabled()?;
        self.heartbeat.clear();
        self.turn_off("momentary_stop", request, now, events)
    }

    /// Evaluates heartbeat timeout, max on-time and time window, in that
    /// order. Returns true when a shutoff was triggered by this call.
    pub fn check_safety(
        &mut self,
        now: Moment,
        heartbeat_timeout_ms: u64,
        events: &mut Vec<RelayEvent>,
    ) -> bool {
        if !self.state.logical_on {
            return false;
        }

        let Some(reason) = self.violated_condition(now, heartbeat_timeout_ms) else {
            return false;
        };

        let source = if self.heartbeat.is_active() {
            self.heartbeat.source_id().to_string()
        } else {
            "system".to_string()
        };
        self.force_off(reason, now);
        warn!(
            channel = self.id(),
            reason = reason.as_str(),
            "safety shutoff triggered"
        );
        events.push(RelayEvent::safety_shutoff(
            self.id(),
            reason,
            SAFETY_TRIGGER,
            &source,
            now.ms,
        ));
        true
    }

    /// Replaces the configuration. A channel that is on keeps its hardware
    /// state and parks the new config until [`RelayChannel::reset`].
    pub fn configure(&mut self, config: ChannelConfig, now: Moment) -> ConfigureOutcome {
        if self.state.logical_on {
            info!(
                channel = self.id(),
                "channel is on; configuration deferred until reset"
            );
            self.pending_config = Some(config);
            return ConfigureOutcome::Deferred;
        }
        self.apply_config(config, now);
        ConfigureOutcome::Applied
    }

    /// Explicit return to a known-off state: output off, heartbeat cleared,
    /// safety latch released, parked configuration applied.
    pub fn reset(
        &mut self,
        request: &ActivationRequest,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) {
        self.heartbeat.clear();
        if self.state.logical_on {
            self.de_energize(now);
            events.push(RelayEvent::relay_change(
                self.id(),
                false,
                Some("reset"),
                request,
                now.ms,
            ));
        }
        self.state.safety_shutoff_triggered = false;
        if let Some(config) = self.pending_config.take() {
            self.apply_config(config, now);
        }
    }

    pub fn status(&self, now: Moment) -> ChannelStatus {
        let awaiting = self.heartbeat.is_active();
        ChannelStatus {
            channel: self.id(),
            name: self.config.name.clone(),
            enabled: self.config.enabled,
            function: self.config.function_type.as_str(),
            on: self.state.logical_on,
            output_level: self.output_level,
            awaiting_heartbeat: awaiting,
            heartbeat_source: awaiting.then(|| self.heartbeat.source_id().to_string()),
            heartbeat_sequence: awaiting.then(|| self.heartbeat.sequence()),
            heartbeat_gaps: awaiting.then(|| self.heartbeat.gaps()),
            heartbeat_age_ms: awaiting.then(|| self.heartbeat.elapsed_ms(now.ms)),
            on_duration_ms: self.on_duration_ms(now.ms),
            max_on_time_ms: self.config.max_on_time_ms,
            safety_shutoff: self.state.safety_shutoff_triggered,
            last_state_change_ms: self.state.last_state_change_ms,
            hardware_faults: self.hardware_faults,
            pending_config: self.pending_config.is_some(),
        }
    }

    pub fn on_duration_ms(&self, now_ms: u64) -> u64 {
        match self.state.turned_on_at_ms {
            Some(start) if self.state.logical_on => now_ms.saturating_sub(start),
            _ => 0,
        }
    }

    /// Unconditional shutoff used by the safety monitor and emergency stop.
    /// Returns whether the channel was on.
    pub(crate) fn force_off(&mut self, reason: ShutoffReason, now: Moment) -> bool {
        self.heartbeat.clear();
        let was_on = self.state.logical_on;
        if was_on {
            self.de_energize(now);
            // Only an interrupted activation cycle is latched.
            self.state.safety_shutoff_triggered = true;
            info!(channel = self.id(), reason = reason.as_str(), "channel forced off");
        }
        was_on
    }

    pub(crate) fn heartbeat_mut(&mut self) -> &mut HeartbeatEntry {
        &mut self.heartbeat
    }

    pub(crate) fn ensure_momentary(&self) -> Result<(), DenyReason> {
        self.ensure_enabled()?;
        if self.config.function_type != FunctionType::Momentary {
            return Err(DenyReason::NotMomentary);
        }
        Ok(())
    }

    fn ensure_enabled(&self) -> Result<(), DenyReason> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(DenyReason::ChannelDisabled)
        }
    }

    fn authorize(&self, request: &ActivationRequest, now: Moment) -> Result<(), DenyReason> {
        if self.config.requires_password {
            match request.password.as_deref() {
                None | Some("") => return Err(DenyReason::PasswordRequired),
                Some(password) if !self.config.password_matches(password) => {
                    return Err(DenyReason::PasswordIncorrect)
                }
                Some(_) => {}
            }
        }

        if self.config.requires_confirmation && !request.confirmed {
            return Err(DenyReason::ConfirmationRequired);
        }

        if let Some(window) = self.config.time_window {
            if !window.permits(now.minute_of_day) {
                return Err(DenyReason::OutsideTimeWindow);
            }
        }

        Ok(())
    }

    fn violated_condition(&self, now: Moment, heartbeat_timeout_ms: u64) -> Option<ShutoffReason> {
        if self.heartbeat.is_expired(now.ms, heartbeat_timeout_ms) {
            return Some(ShutoffReason::HeartbeatTimeout);
        }

        let max_on = self.config.max_on_time_ms;
        if max_on > 0 && self.on_duration_ms(now.ms) >= max_on {
            return Some(ShutoffReason::MaxOnTimeExceeded);
        }

        if self
            .config
            .time_window
            .is_some_and(|window| window.is_violated(now.minute_of_day))
        {
            return Some(ShutoffReason::TimeWindowViolation);
        }

        None
    }

    fn de_energize(&mut self, now: Moment) {
        self.state.logical_on = false;
        self.state.turned_on_at_ms = None;
        self.state.last_state_change_ms = now.ms;
        self.apply_output();
    }

    fn apply_config(&mut self, config: ChannelConfig, now: Moment) {
        self.config = config;
        self.pending_config = None;
        self.heartbeat.clear();
        self.state = ChannelState {
            last_state_change_ms: now.ms,
            ..ChannelState::default()
        };
        self.apply_output();
    }

    fn apply_output(&mut self) {
        let level = self.state.logical_on ^ self.config.inverted_logic;
        self.output_level = level;
        if let Err(fault) = self.driver.set_output(self.config.output_ref, level) {
            self.hardware_faults = self.hardware_faults.saturating_add(1);
            warn!(channel = self.id(), "{fault}");
        }
    }
}

pub(crate) fn lock_channel(slot: &Mutex<RelayChannel>) -> MutexGuard<'_, RelayChannel> {
    // Poison is ignored; state and output are only written together.
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::hash_password, output::OutputRef, testing::RecordingDriver,
        time_window::TimeWindow, types::EventKind,
    };
    use pretty_assertions::assert_eq;

    const TIMEOUT: u64 = 1_000;

    fn channel_with(config: ChannelConfig) -> (RelayChannel, Arc<RecordingDriver>) {
        let driver = RecordingDriver::new();
        let mut channel = RelayChannel::new(config, driver.clone());
        channel.initialize(Moment::at(0));
        (channel, driver)
    }

    fn user() -> ActivationRequest {
        ActivationRequest::new("alice", "app")
    }

    fn assert_output_consistent(channel: &RelayChannel, driver: &RecordingDriver) {
        let expected = channel.is_on() ^ channel.config().inverted_logic;
        assert_eq!(driver.level(channel.config().output_ref), Some(expected));
        assert_eq!(channel.output_level(), expected);
    }

    #[test]
    fn initialize_drives_off_level() {
        let mut config = ChannelConfig::new(1, OutputRef(5));
        config.inverted_logic = true;
        let (channel, driver) = channel_with(config);

        assert!(!channel.is_on());
        assert_eq!(driver.level(OutputRef(5)), Some(true));
    }

    #[test]
    fn turn_on_and_off_keep_output_in_sync() {
        let (mut channel, driver) = channel_with(ChannelConfig::new(1, OutputRef(1)));
        let mut events = Vec::new();

        channel.turn_on(&user(), Moment::at(10), &mut events).unwrap();
        assert!(channel.is_on());
        assert_eq!(channel.state().turned_on_at_ms, Some(10));
        assert_output_consistent(&channel, &driver);

        channel
            .turn_off("command", &user(), Moment::at(20), &mut events)
            .unwrap();
        assert!(!channel.is_on());
        assert_eq!(channel.state().turned_on_at_ms, None);
        assert_output_consistent(&channel, &driver);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::RelayChange);
        assert_eq!(events[0].trigger, "alice");
        assert_eq!(events[1].reason.as_deref(), Some("command"));
    }

    #[test]
    fn inverted_logic_flips_physical_level() {
        let mut config = ChannelConfig::new(2, OutputRef(2));
        config.inverted_logic = true;
        let (mut channel, driver) = channel_with(config);
        let mut events = Vec::new();

        channel.turn_on(&user(), Moment::at(1), &mut events).unwrap();
        assert_eq!(driver.level(OutputRef(2)), Some(false));
        assert_output_consistent(&channel, &driver);
    }

    #[test]
    fn repeated_on_and_off_are_silent_noops() {
        let (mut channel, driver) = channel_with(ChannelConfig::new(1, OutputRef(1)));
        let mut events = Vec::new();

        channel.turn_on(&user(), Moment::at(1), &mut events).unwrap();
        channel.turn_on(&user(), Moment::at(2), &mut events).unwrap();
        assert_eq!(channel.state().turned_on_at_ms, Some(1));
        assert_eq!(events.len(), 1);

        channel.turn_off("a", &user(), Moment::at(3), &mut events).unwrap();
        channel.turn_off("b", &user(), Moment::at(4), &mut events).unwrap();
        assert_eq!(events.len(), 2);
        // initialize + on + off
        assert_eq!(driver.writes().len(), 3);
    }

    #[test]
    fn wrong_password_leaves_output_untouched() {
        let mut config = ChannelConfig::new(7, OutputRef(7));
        config.requires_password = true;
        config.password_hash = hash_password("X");
        let (mut channel, driver) = channel_with(config);
        let mut events = Vec::new();
        let writes_before = driver.writes().len();

        let result = channel.turn_on(&user().with_password("Y"), Moment::at(1), &mut events);

        assert_eq!(result, Err(DenyReason::PasswordIncorrect));
        assert!(!channel.is_on());
        assert_eq!(driver.writes().len(), writes_before);
        assert!(events.is_empty());

        let result = channel.turn_on(&user(), Moment::at(1), &mut events);
        assert_eq!(result, Err(DenyReason::PasswordRequired));

        channel
            .turn_on(&user().with_password("X"), Moment::at(2), &mut events)
            .unwrap();
        assert!(channel.is_on());
    }

    #[test]
    fn confirmation_guard() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.requires_confirmation = true;
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        assert_eq!(
            channel.turn_on(&user(), Moment::at(1), &mut events),
            Err(DenyReason::ConfirmationRequired)
        );
        channel
            .turn_on(&user().confirmed(), Moment::at(1), &mut events)
            .unwrap();
        assert!(channel.is_on());
    }

    #[test]
    fn guards_never_block_turn_off() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.set_password("pw");
        config.requires_confirmation = true;
        config.time_window = Some(TimeWindow::new(8 * 60, 9 * 60));
        let (mut channel, driver) = channel_with(config);
        let mut events = Vec::new();

        let now = Moment::at(5).with_minute_of_day(8 * 60 + 30);
        channel
            .turn_on(&user().with_password("pw").confirmed(), now, &mut events)
            .unwrap();

        let late = Moment::at(6).with_minute_of_day(23 * 60);
        channel.turn_off("command", &user(), late, &mut events).unwrap();
        assert!(!channel.is_on());
        assert_output_consistent(&channel, &driver);
    }

    #[test]
    fn time_window_denies_activation_outside_and_when_time_unknown() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.time_window = Some(TimeWindow::new(8 * 60, 18 * 60));
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        let evening = Moment::at(1).with_minute_of_day(20 * 60);
        assert_eq!(
            channel.turn_on(&user(), evening, &mut events),
            Err(DenyReason::OutsideTimeWindow)
        );
        assert_eq!(
            channel.turn_on(&user(), Moment::at(1), &mut events),
            Err(DenyReason::OutsideTimeWindow)
        );

        let noon = Moment::at(2).with_minute_of_day(12 * 60);
        channel.turn_on(&user(), noon, &mut events).unwrap();
        assert!(channel.is_on());
    }

    #[test]
    fn toggle_switches_off_without_guards() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.set_password("pw");
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        assert_eq!(
            channel.toggle(&user(), Moment::at(1), &mut events),
            Err(DenyReason::PasswordRequired)
        );
        channel
            .toggle(&user().with_password("pw"), Moment::at(2), &mut events)
            .unwrap();
        assert!(channel.is_on());

        channel.toggle(&user(), Moment::at(3), &mut events).unwrap();
        assert!(!channel.is_on());
        assert_eq!(events[1].reason.as_deref(), Some("toggle"));
    }

    #[test]
    fn disabled_channel_rejects_every_operation() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.enabled = false;
        config.function_type = FunctionType::Momentary;
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();
        let now = Moment::at(1);

        assert_eq!(
            channel.turn_on(&user(), now, &mut events),
            Err(DenyReason::ChannelDisabled)
        );
        assert_eq!(
            channel.turn_off("x", &user(), now, &mut events),
            Err(DenyReason::ChannelDisabled)
        );
        assert_eq!(
            channel.toggle(&user(), now, &mut events),
            Err(DenyReason::ChannelDisabled)
        );
        assert_eq!(
            channel.start_momentary(&user(), now, &mut events),
            Err(DenyReason::ChannelDisabled)
        );
        assert_eq!(
            channel.stop_momentary(&user(), now, &mut events),
            Err(DenyReason::ChannelDisabled)
        );
    }

    #[test]
    fn start_momentary_requires_momentary_function() {
        let (mut channel, _driver) = channel_with(ChannelConfig::new(1, OutputRef(1)));
        let mut events = Vec::new();

        assert_eq!(
            channel.start_momentary(&user(), Moment::at(1), &mut events),
            Err(DenyReason::NotMomentary)
        );
        assert!(!channel.is_on());
    }

    #[test]
    fn start_momentary_arms_heartbeat() {
        let mut config = ChannelConfig::new(3, OutputRef(3));
        config.function_type = FunctionType::Momentary;
        let (mut channel, driver) = channel_with(config);
        let mut events = Vec::new();

        channel
            .start_momentary(&user(), Moment::at(100), &mut events)
            .unwrap();

        assert!(channel.is_on());
        assert!(channel.awaiting_heartbeat());
        assert_eq!(channel.heartbeat().source_id(), "app");
        assert_eq!(channel.heartbeat().sequence(), 0);
        assert_eq!(channel.heartbeat().last_received_ms(), 100);
        assert_output_consistent(&channel, &driver);

        channel
            .stop_momentary(&user(), Moment::at(200), &mut events)
            .unwrap();
        assert!(!channel.is_on());
        assert!(!channel.awaiting_heartbeat());
        assert_eq!(events[1].reason.as_deref(), Some("momentary_stop"));
    }

    #[test]
    fn generic_turn_off_clears_heartbeat() {
        let mut config = ChannelConfig::new(3, OutputRef(3));
        config.function_type = FunctionType::Momentary;
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        channel
            .start_momentary(&user(), Moment::at(0), &mut events)
            .unwrap();
        channel
            .turn_off("command", &user(), Moment::at(10), &mut events)
            .unwrap();

        assert!(!channel.awaiting_heartbeat());
        assert!(!channel.check_safety(Moment::at(5_000), TIMEOUT, &mut events));
    }

    #[test]
    fn heartbeat_timeout_wins_over_max_on_time() {
        let mut config = ChannelConfig::new(3, OutputRef(3));
        config.function_type = FunctionType::Momentary;
        config.max_on_time_ms = 500;
        let (mut channel, driver) = channel_with(config);
        let mut events = Vec::new();

        channel
            .start_momentary(&user(), Moment::at(0), &mut events)
            .unwrap();
        events.clear();

        assert!(channel.check_safety(Moment::at(1_001), TIMEOUT, &mut events));
        assert!(!channel.is_on());
        assert!(!channel.awaiting_heartbeat());
        assert!(channel.state().safety_shutoff_triggered);
        assert_output_consistent(&channel, &driver);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SafetyShutoff);
        assert_eq!(events[0].reason.as_deref(), Some("heartbeat_timeout"));
        assert_eq!(events[0].source, "app");
    }

    #[test]
    fn heartbeat_timeout_is_strictly_greater_than_limit() {
        let mut config = ChannelConfig::new(3, OutputRef(3));
        config.function_type = FunctionType::Momentary;
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        channel
            .start_momentary(&user(), Moment::at(0), &mut events)
            .unwrap();
        assert!(!channel.check_safety(Moment::at(1_000), TIMEOUT, &mut events));
        assert!(channel.check_safety(Moment::at(1_001), TIMEOUT, &mut events));
    }

    #[test]
    fn max_on_time_shutoff() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.max_on_time_ms = 5_000;
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        channel.turn_on(&user(), Moment::at(0), &mut events).unwrap();
        assert!(!channel.check_safety(Moment::at(4_999), TIMEOUT, &mut events));
        assert!(channel.check_safety(Moment::at(5_000), TIMEOUT, &mut events));
        assert_eq!(
            events.last().and_then(|event| event.reason.as_deref()),
            Some("max_on_time_exceeded")
        );
        // Already off: nothing further to report.
        assert!(!channel.check_safety(Moment::at(6_000), TIMEOUT, &mut events));
    }

    #[test]
    fn time_window_violation_while_on() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.time_window = Some(TimeWindow::new(8 * 60, 18 * 60));
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        let inside = Moment::at(0).with_minute_of_day(17 * 60 + 59);
        channel.turn_on(&user(), inside, &mut events).unwrap();
        assert!(!channel.check_safety(Moment::at(10), TIMEOUT, &mut events));

        let outside = Moment::at(60_000).with_minute_of_day(18 * 60);
        assert!(channel.check_safety(outside, TIMEOUT, &mut events));
        assert_eq!(
            events.last().and_then(|event| event.reason.as_deref()),
            Some("time_window_violation")
        );
    }

    #[test]
    fn explicit_turn_on_clears_safety_latch() {
        let mut config = ChannelConfig::new(1, OutputRef(1));
        config.max_on_time_ms = 100;
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        channel.turn_on(&user(), Moment::at(0), &mut events).unwrap();
        channel.check_safety(Moment::at(100), TIMEOUT, &mut events);
        assert!(channel.state().safety_shutoff_triggered);

        channel.turn_on(&user(), Moment::at(200), &mut events).unwrap();
        assert!(!channel.state().safety_shutoff_triggered);
        assert!(channel.is_on());
    }

    #[test]
    fn force_off_latches_only_running_channels() {
        let mut config = ChannelConfig::new(2, OutputRef(2));
        config.function_type = FunctionType::Momentary;
        let (mut idle, _driver) = channel_with(config.clone());
        let (mut running, _driver) = channel_with(config);
        let mut events = Vec::new();
        idle.start_momentary(&user(), Moment::at(0), &mut events).unwrap();
        idle.stop_momentary(&user(), Moment::at(10), &mut events).unwrap();
        running.start_momentary(&user(), Moment::at(0), &mut events).unwrap();

        assert!(!idle.force_off(ShutoffReason::EmergencyStop, Moment::at(20)));
        assert!(running.force_off(ShutoffReason::EmergencyStop, Moment::at(20)));

        assert!(!idle.state().safety_shutoff_triggered);
        assert!(running.state().safety_shutoff_triggered);
        assert!(!running.is_on());
    }

    #[test]
    fn hardware_fault_still_updates_state() {
        let (mut channel, driver) = channel_with(ChannelConfig::new(1, OutputRef(1)));
        let mut events = Vec::new();
        driver.fail_writes(true);

        channel.turn_on(&user(), Moment::at(1), &mut events).unwrap();

        assert!(channel.is_on());
        assert!(channel.output_level());
        assert_eq!(channel.hardware_faults(), 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn configure_while_on_is_deferred_until_reset() {
        let (mut channel, driver) = channel_with(ChannelConfig::new(1, OutputRef(1)));
        let mut events = Vec::new();
        channel.turn_on(&user(), Moment::at(1), &mut events).unwrap();

        let mut inverted = ChannelConfig::new(1, OutputRef(1));
        inverted.inverted_logic = true;
        assert_eq!(
            channel.configure(inverted, Moment::at(2)),
            ConfigureOutcome::Deferred
        );
        assert!(channel.is_on());
        assert!(channel.has_pending_config());
        assert!(!channel.config().inverted_logic);
        assert_eq!(driver.level(OutputRef(1)), Some(true));

        channel.reset(&ActivationRequest::system("reset"), Moment::at(3), &mut events);

        assert!(!channel.is_on());
        assert!(!channel.has_pending_config());
        assert!(channel.config().inverted_logic);
        assert_output_consistent(&channel, &driver);
    }

    #[test]
    fn configure_while_off_applies_and_redrives_output() {
        let (mut channel, driver) = channel_with(ChannelConfig::new(1, OutputRef(1)));
        let mut moved = ChannelConfig::new(1, OutputRef(9));
        moved.inverted_logic = true;

        assert_eq!(
            channel.configure(moved, Moment::at(5)),
            ConfigureOutcome::Applied
        );
        assert_eq!(driver.level(OutputRef(9)), Some(true));
        assert_output_consistent(&channel, &driver);
    }

    #[test]
    fn status_reports_heartbeat_details_only_while_awaiting() {
        let mut config = ChannelConfig::new(4, OutputRef(4));
        config.function_type = FunctionType::Momentary;
        let (mut channel, _driver) = channel_with(config);
        let mut events = Vec::new();

        let idle = channel.status(Moment::at(0));
        assert_eq!(idle.heartbeat_source, None);
        assert_eq!(idle.function, "momentary");

        channel
            .start_momentary(&user(), Moment::at(100), &mut events)
            .unwrap();
        let status = channel.status(Moment::at(350));
        assert!(status.on);
        assert_eq!(status.heartbeat_source.as_deref(), Some("app"));
        assert_eq!(status.heartbeat_age_ms, Some(250));
        assert_eq!(status.on_duration_ms, 250);
    }
}

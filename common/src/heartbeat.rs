use std::sync::Mutex;

use tracing::{debug, warn};

use crate::{
    channel::{lock_channel, RelayChannel},
    clock::Moment,
    error::DenyReason,
    types::{ActivationRequest, RelayEvent},
};

/// Liveness record for one channel. Meaningful only while `active`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatEntry {
    active: bool,
    source_id: String,
    sequence: u32,
    last_received_ms: u64,
    gaps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub expected: u32,
    pub received: u32,
}

impl HeartbeatEntry {
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Source of the current monitor, or of the last one once cleared.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn last_received_ms(&self) -> u64 {
        self.last_received_ms
    }

    pub fn gaps(&self) -> u32 {
        self.gaps
    }

    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_received_ms)
    }

    pub fn is_expired(&self, now_ms: u64, timeout_ms: u64) -> bool {
        self.active && self.elapsed_ms(now_ms) > timeout_ms
    }

    pub(crate) fn arm(&mut self, source_id: &str, sequence: u32, now_ms: u64) {
        self.active = true;
        self.source_id = source_id.to_string();
        self.sequence = sequence;
        self.last_received_ms = now_ms;
        self.gaps = 0;
    }

    pub(crate) fn refresh(&mut self, sequence: u32, now_ms: u64) -> Option<SequenceGap> {
        let expected = self.sequence.wrapping_add(1);
        self.sequence = sequence;
        self.last_received_ms = now_ms;
        if sequence == expected {
            return None;
        }
        self.gaps = self.gaps.saturating_add(1);
        Some(SequenceGap {
            expected,
            received: sequence,
        })
    }

    pub(crate) fn clear(&mut self) {
        self.active = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Same source, monitor refreshed.
    Refreshed { gap: Option<SequenceGap> },
    /// A fresh monitor was started, possibly displacing another source.
    Armed {
        previous_source: Option<String>,
        energized: bool,
    },
}

/// Records liveness signals and sweeps for expired monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRegistry {
    timeout_ms: u64,
}

impl HeartbeatRegistry {
    pub fn new(timeout_ms: u64) -> Self {
        Self { timeout_ms }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// A heartbeat both proves liveness and keeps the relay energized. A new
    /// source re-arms the monitor of a running channel without re-checking
    /// its guards; a heartbeat for an idle channel switches it on through
    /// the normal guards.
    pub fn record(
        &self,
        channel: &mut RelayChannel,
        source_id: &str,
        sequence: u32,
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> Result<HeartbeatOutcome, DenyReason> {
        channel.ensure_momentary()?;

        let entry = channel.heartbeat();
        if entry.is_active() && entry.source_id() == source_id {
            let gap = channel.heartbeat_mut().refresh(sequence, now.ms);
            if let Some(gap) = gap {
                warn!(
                    channel = channel.id(),
                    source = source_id,
                    expected = gap.expected,
                    received = gap.received,
                    "heartbeat sequence gap"
                );
            }
            return Ok(HeartbeatOutcome::Refreshed { gap });
        }

        if channel.state().safety_shutoff_triggered && entry.source_id() == source_id {
            return Err(DenyReason::SafetyLockout);
        }

        let previous_source = entry
            .is_active()
            .then(|| entry.source_id().to_string());
        if let Some(previous) = previous_source.as_deref() {
            warn!(
                channel = channel.id(),
                previous,
                source = source_id,
                "heartbeat source took over channel"
            );
        }

        // A channel that is already on was authorized when it was started.
        let energized = !channel.is_on();
        if energized {
            let request = ActivationRequest::new("heartbeat", source_id);
            channel.turn_on(&request, now, events)?;
        }
        channel.heartbeat_mut().arm(source_id, sequence, now.ms);
        debug!(channel = channel.id(), source = source_id, sequence, "heartbeat monitor armed");

        Ok(HeartbeatOutcome::Armed {
            previous_source,
            energized,
        })
    }

    /// Shuts off every channel whose monitor has expired. Returns the number
    /// of shutoffs.
    pub fn sweep(
        &self,
        channels: &[Mutex<RelayChannel>],
        now: Moment,
        events: &mut Vec<RelayEvent>,
    ) -> usize {
        let mut shutoffs = 0;
        for slot in channels {
            let mut channel = lock_channel(slot);
            if !channel.heartbeat().is_expired(now.ms, self.timeout_ms) {
                continue;
            }
            if channel.check_safety(now, self.timeout_ms, events) {
                shutoffs += 1;
            } else {
                channel.heartbeat_mut().clear();
            }
        }
        shutoffs
    }
}

use serde::{Deserialize, Serialize};

use crate::error::HardwareFault;

/// Opaque handle to a physical output (a GPIO number on the boards we ship).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputRef(pub u8);

/// Drives physical relay outputs.
///
/// Calls happen while the owning channel is locked, so implementations must
/// return promptly. A failed write is reported back but never retried by the
/// core; channel state is updated regardless.
pub trait OutputDriver: Send + Sync {
    fn set_output(&self, output: OutputRef, level: bool) -> Result<(), HardwareFault>;
}

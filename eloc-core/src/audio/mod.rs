//! Audio peripheral seam.
//!
//! The capture path talks to hardware only through [`SamplePeripheral`]. The
//! host firmware provides the real I2S/PDM driver; tests provide scripted
//! fakes. The trait deliberately exposes the raw hardware word (`i32`): gain
//! shifting into the 16-bit output range is the [`source::SampleSource`]'s
//! job, not the driver's.
//!
//! # Threading note
//!
//! A peripheral is driven from exactly one capture loop at a time, but the
//! orchestrator keeps the handle across sessions, so access is serialised
//! through [`PeripheralHandle`]'s `parking_lot::Mutex`.

pub mod source;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{PinMapping, RecorderConfig};
use crate::error::Result;

/// Number of raw words the hardware delivers per native read. Larger
/// requests loop internally in [`source::SampleSource::read`].
pub const NATIVE_READ_WORDS: usize = 1000;

/// Wiring and clock settings handed to the peripheral at session start.
#[derive(Debug, Clone, Copy)]
pub struct PeripheralConfig {
    pub pins: PinMapping,
    /// Requested sample rate (Hz). The driver answers with the rate the
    /// clock actually negotiated.
    pub sample_rate: u32,
    /// Apply the alternate clock-divisor workaround some microphone
    /// revisions need.
    pub fix_timing_quirk: bool,
}

impl PeripheralConfig {
    pub fn from_recorder(config: &RecorderConfig) -> Self {
        Self {
            pins: config.pins,
            sample_rate: config.sample_rate,
            fix_timing_quirk: config.fix_timing_quirk,
        }
    }
}

/// Contract for audio peripheral drivers.
pub trait SamplePeripheral: Send + 'static {
    /// Validate and apply wiring/clock settings.
    ///
    /// # Returns
    /// The sample rate the hardware clock actually negotiated — this is the
    /// rate WAV headers are written with, not the nominal request.
    ///
    /// # Errors
    /// `ElocError::HardwareConfig` when the peripheral rejects the settings.
    fn configure(&mut self, config: &PeripheralConfig) -> Result<u32>;

    /// Begin hardware sampling.
    fn start(&mut self) -> Result<()>;

    /// End hardware sampling. Idempotent: stopping a peripheral that is not
    /// running is a no-op, not an error.
    fn stop(&mut self);

    /// Blocking read of up to `out.len()` raw words (callers never request
    /// more than [`NATIVE_READ_WORDS`] at once).
    ///
    /// # Returns
    /// The number of words delivered. Fewer than requested is a short read;
    /// zero means the hardware timed out.
    fn read_words(&mut self, out: &mut [i32]) -> Result<usize>;
}

/// Thread-safe reference-counted handle to any `SamplePeripheral` driver.
#[derive(Clone)]
pub struct PeripheralHandle(pub Arc<Mutex<dyn SamplePeripheral>>);

impl PeripheralHandle {
    pub fn new<P: SamplePeripheral>(peripheral: P) -> Self {
        Self(Arc::new(Mutex::new(peripheral)))
    }
}

impl std::fmt::Debug for PeripheralHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralHandle").finish_non_exhaustive()
    }
}

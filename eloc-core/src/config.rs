//! Recorder configuration snapshot.
//!
//! A `RecorderConfig` is captured once at session start and persisted as JSON
//! into the session folder, so every recording carries the exact settings it
//! was made with. The struct is plain data — validation happens explicitly
//! through [`RecorderConfig::validate`] before a session may begin.

use serde::{Deserialize, Serialize};

use crate::error::{ElocError, Result};

/// Which microcontroller pins the audio peripheral is wired to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinMapping {
    /// Bit clock.
    pub bclk: u8,
    /// Word select (L/R clock).
    pub ws: u8,
    /// Serial data in from the microphone.
    pub data_in: u8,
}

impl Default for PinMapping {
    fn default() -> Self {
        Self {
            bclk: 18,
            ws: 19,
            data_in: 21,
        }
    }
}

/// Configuration for one recording/detection session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Stable device name, first component of every session identifier.
    pub device_name: String,
    /// Requested hardware sample rate (Hz). The peripheral may negotiate a
    /// slightly different clock; the negotiated rate is what ends up in WAV
    /// headers. Default: 16000.
    pub sample_rate: u32,
    /// Channel count. The pipeline supports exactly one channel.
    pub channel_count: u16,
    /// Right-shift applied to each raw hardware word to scale it into the
    /// 16-bit output range. Valid range 0..=16. Default: 11.
    pub gain_shift: u8,
    /// Pin wiring for the audio peripheral.
    pub pins: PinMapping,
    /// Apply the alternate clock-divisor workaround some microphone revisions
    /// need to produce a stable bit clock.
    pub fix_timing_quirk: bool,
    /// File-writer buffer length in samples. One block of this size is handed
    /// to the writer per swap. Default: 16000 (1 s at 16 kHz).
    pub block_len_samples: usize,
    /// Duration of each WAV file before rotation (seconds). Default: 3600.
    pub seconds_per_file: u32,
    /// Effective sample rate the classifier consumes (Hz). Must divide
    /// `sample_rate` evenly. Default: 16000.
    pub detector_sample_rate: u32,
    /// Classifier window length in samples (at `detector_sample_rate`).
    pub detector_window_samples: usize,
    /// Minimum classifier score counted as a detection, in [0, 1].
    pub detection_threshold: f32,
    /// Sessions refuse to open files when free space is below this floor (GB).
    /// Default: 0.1 (≈ 100 MB).
    pub free_space_floor_gb: f32,
    /// Re-verify storage free space every this many written blocks.
    pub storage_check_blocks: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            device_name: "eloc".into(),
            sample_rate: 16_000,
            channel_count: 1,
            gain_shift: 11,
            pins: PinMapping::default(),
            fix_timing_quirk: false,
            block_len_samples: 16_000,
            seconds_per_file: 3_600,
            detector_sample_rate: 16_000,
            detector_window_samples: 16_000,
            detection_threshold: 0.5,
            free_space_floor_gb: 0.1,
            storage_check_blocks: 64,
        }
    }
}

impl RecorderConfig {
    /// Check the snapshot before a session may begin.
    ///
    /// # Errors
    /// Returns `ElocError::HardwareConfig` naming the offending field. A
    /// hardware rate that is not an exact integer multiple of the detector
    /// rate is rejected here rather than silently truncated.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.is_empty() {
            return Err(ElocError::HardwareConfig("device_name is empty".into()));
        }
        if self.sample_rate == 0 {
            return Err(ElocError::HardwareConfig("sample_rate must be > 0".into()));
        }
        if self.channel_count != 1 {
            return Err(ElocError::HardwareConfig(format!(
                "channel_count must be 1, got {}",
                self.channel_count
            )));
        }
        if self.gain_shift > 16 {
            return Err(ElocError::HardwareConfig(format!(
                "gain_shift must be in 0..=16, got {}",
                self.gain_shift
            )));
        }
        if self.block_len_samples == 0 {
            return Err(ElocError::HardwareConfig(
                "block_len_samples must be > 0".into(),
            ));
        }
        if self.seconds_per_file == 0 {
            return Err(ElocError::HardwareConfig(
                "seconds_per_file must be > 0".into(),
            ));
        }
        if self.detector_sample_rate == 0 || self.detector_window_samples == 0 {
            return Err(ElocError::HardwareConfig(
                "detector rate and window must be > 0".into(),
            ));
        }
        if self.sample_rate % self.detector_sample_rate != 0 {
            return Err(ElocError::HardwareConfig(format!(
                "sample_rate {} is not an integer multiple of detector_sample_rate {}",
                self.sample_rate, self.detector_sample_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(ElocError::HardwareConfig(format!(
                "detection_threshold must be in [0, 1], got {}",
                self.detection_threshold
            )));
        }
        if self.storage_check_blocks == 0 {
            return Err(ElocError::HardwareConfig(
                "storage_check_blocks must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Forward every Nth sample to the detector, N = hardware / detector rate.
    pub fn detector_skip(&self) -> u32 {
        self.sample_rate / self.detector_sample_rate
    }
}

//! Recording modes, mode requests and session identity.
//!
//! `RecState` is the closed set of operating modes. It is owned exclusively
//! by the orchestrator; everything else observes it through snapshots. The
//! wire tokens accepted by the command channel map 1:1 onto the variants via
//! `Display`/`FromStr`, defined once here instead of per-variant string
//! tables scattered around the firmware.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use tracing::info;

use crate::config::RecorderConfig;
use crate::error::{ElocError, Result};

/// Timestamp format used in session identifiers and file names.
/// ISO-like but filesystem-safe (no colons).
const TS_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Timestamp format for per-file names; millisecond suffix keeps rotations
/// within the same second from colliding.
const FILE_TS_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3f";

/// The closed set of recording/detection mode combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecState {
    /// Nothing running.
    Idle,
    /// Continuous recording, no classification.
    RecordOnly,
    /// Classification only, nothing written to storage.
    DetectOnly,
    /// Continuous recording with classification running alongside.
    RecordAndDetect,
    /// Classification runs continuously; detections trigger recording.
    EventTriggered,
}

impl RecState {
    pub fn is_idle(self) -> bool {
        self == RecState::Idle
    }

    /// Does this mode register the file writer?
    pub fn records(self) -> bool {
        matches!(
            self,
            RecState::RecordOnly | RecState::RecordAndDetect | RecState::EventTriggered
        )
    }

    /// Does this mode register the inference consumer?
    pub fn detects(self) -> bool {
        matches!(
            self,
            RecState::DetectOnly | RecState::RecordAndDetect | RecState::EventTriggered
        )
    }

    /// Does the writer wait for a detection before opening a file?
    pub fn event_triggered(self) -> bool {
        self == RecState::EventTriggered
    }
}

impl fmt::Display for RecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            RecState::Idle => "recordOff_detectOff",
            RecState::RecordOnly => "recordOn_detectOff",
            RecState::DetectOnly => "recordOff_detectOn",
            RecState::RecordAndDetect => "recordOn_detectOn",
            RecState::EventTriggered => "recordOnEvent",
        };
        f.write_str(token)
    }
}

impl FromStr for RecState {
    type Err = ElocError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recordOff_detectOff" => Ok(RecState::Idle),
            "recordOn_detectOff" => Ok(RecState::RecordOnly),
            "recordOff_detectOn" => Ok(RecState::DetectOnly),
            "recordOn_detectOn" => Ok(RecState::RecordAndDetect),
            "recordOnEvent" | "recordOnEvent_detectOn" => Ok(RecState::EventTriggered),
            other => Err(ElocError::UnknownModeToken(other.to_string())),
        }
    }
}

/// A request placed on the orchestrator's bounded queue by any event source
/// (button ISR, command channel, detector). Ownership transfers to the
/// orchestrator on dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRequest {
    /// Switch to an explicit mode; `RecState::Idle` means stop.
    Mode(RecState),
    /// No explicit mode given: idle starts continuous recording, anything
    /// else stops.
    Toggle,
    /// Raised by the detector in event-triggered mode: open a recording file.
    EventTrigger,
}

/// Fault raised by a capture or drain loop; ends the session when the
/// orchestrator drains it.
#[derive(Debug, Clone)]
pub enum SessionFault {
    Peripheral(String),
    Writer(String),
}

/// One continuous recording/detection activation.
///
/// Identified by device name + start timestamp, folder-scoped, immutable for
/// its lifetime. A session may span multiple WAV files.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    id: String,
    folder: PathBuf,
    config: RecorderConfig,
}

impl RecordingSession {
    /// Derive a session from the device name and the current wall clock.
    /// Layout: `<root>/eloc/<id>` with `<id> = <device>_<timestamp>`.
    pub fn create(storage_root: &Path, config: &RecorderConfig) -> Self {
        let id = format!(
            "{}_{}",
            config.device_name,
            Local::now().format(TS_FORMAT)
        );
        let folder = storage_root.join("eloc").join(&id);
        Self {
            id,
            folder,
            config: config.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Create the session folder on storage.
    pub fn ensure_folder(&self) -> Result<()> {
        std::fs::create_dir_all(&self.folder)?;
        Ok(())
    }

    /// Persist the configuration snapshot alongside the recordings.
    pub fn persist_config_snapshot(&self) -> Result<()> {
        let path = self.folder.join("config.json");
        let file = File::create(&path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.config)
            .map_err(|e| ElocError::Other(e.into()))?;
        info!(path = %path.display(), "session config snapshot written");
        Ok(())
    }

    /// Path for the next WAV file: `<folder>/<id>_<timestamp>.wav`.
    pub fn next_wav_path(&self) -> PathBuf {
        let name = format!("{}_{}.wav", self.id, Local::now().format(FILE_TS_FORMAT));
        self.folder.join(name)
    }
}

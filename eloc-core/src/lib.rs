//! # eloc-core
//!
//! Firmware core for a battery-powered autonomous field audio recorder.
//!
//! ## Architecture
//!
//! ```text
//! SamplePeripheral → SampleSource ─┬─► block pair ─► FileWriter → WAV files
//!   (capture thread, gain shift,   └─► block pair ─► detector loop
//!    per-consumer skip counters)                          │
//!                                                 SoundClassifier
//!                                                         │
//!                                          ModeRequest::EventTrigger
//!                                                         │
//!                              Orchestrator::check_request_queue (main loop)
//! ```
//!
//! The capture loop never blocks on storage or inference: each consumer owns
//! a double-buffered block pair, and a consumer that falls behind loses
//! whole blocks rather than stalling the producer. The orchestrator is the
//! only writer of mode state; buttons, command channels and the detector all
//! talk to it through a bounded request queue.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod detect;
pub mod error;
pub mod orchestrator;
pub mod services;
pub mod session;
pub mod writer;

// Convenience re-exports for the host firmware
pub use audio::{PeripheralConfig, PeripheralHandle, SamplePeripheral};
pub use config::{PinMapping, RecorderConfig};
pub use detect::{ClassifierHandle, Detection, SoundClassifier};
pub use detect::energy::EnergyClassifier;
pub use error::ElocError;
pub use orchestrator::{EndOutcome, Orchestrator, RequestHandle, StatusSnapshot};
pub use services::{PowerService, StorageService};
pub use session::{ModeRequest, RecState, RecordingSession};

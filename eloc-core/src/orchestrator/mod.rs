//! Session orchestrator: the single owner of the recorder's mode state.
//!
//! ```text
//!                 bounded request queue (ISR-safe try_send)
//!   button ISR ──┐
//!   command ch ──┼──► Orchestrator::check_request_queue ──► begin()/end()
//!   detector   ──┘          │
//!                           ├── capture thread  (audio::source::run)
//!                           ├── writer thread   (FileWriter::run)
//!                           └── detector thread (detect::run)
//! ```
//!
//! Event sources never mutate mode state directly — they enqueue a
//! [`ModeRequest`] through a cloned [`RequestHandle`] and the firmware main
//! loop applies it from `check_request_queue`. Mode transitions go through
//! idle: a running session must end before a different one may begin.
//!
//! Faults raised by the capture or writer threads travel back over a second
//! channel and end the session on the next queue check, as do the battery
//! cutoff and periodic storage re-verification.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::audio::source::{self, CaptureContext, SampleSource, SourceStats, SourceStatsSnapshot};
use crate::audio::{PeripheralConfig, PeripheralHandle};
use crate::buffering::block_pair;
use crate::config::RecorderConfig;
use crate::detect::{self, ClassifierHandle, DetectorContext, DetectorStats};
use crate::error::{ElocError, Result};
use crate::services::{PowerService, StorageService};
use crate::session::{ModeRequest, RecState, RecordingSession, SessionFault};
use crate::writer::{FileWriter, WriterMode, WriterShared, WriterStatsSnapshot};

/// Pending mode requests the queue holds before new ones are rejected.
const REQUEST_QUEUE_CAP: usize = 8;

/// Cloneable, non-blocking entry point to the request queue. Safe to call
/// from interrupt context: `request` never blocks and never allocates.
#[derive(Clone)]
pub struct RequestHandle {
    tx: Sender<ModeRequest>,
}

impl RequestHandle {
    /// Enqueue a request. Returns `false` when the queue is full — the
    /// caller may retry or drop the event.
    pub fn request(&self, request: ModeRequest) -> bool {
        self.tx.try_send(request).is_ok()
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle").finish_non_exhaustive()
    }
}

/// Outcome of an explicit stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    Stopped,
    /// There was no session to stop. Not an error: stop must be safe to
    /// request at any time.
    AlreadyStopped,
}

/// Mode and session identity, copied out atomically for telemetry readers.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: RecState,
    pub session_id: Option<String>,
}

/// Everything owned by one running session.
struct ActiveSession {
    session: RecordingSession,
    running: Arc<AtomicBool>,
    capture: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
    detector: Option<JoinHandle<()>>,
    writer_shared: Option<Arc<WriterShared>>,
    detector_stats: Option<Arc<DetectorStats>>,
    source_stats: Arc<SourceStats>,
    started: Instant,
    /// Writer block count at the last storage re-verification.
    last_storage_check_block: u64,
}

/// Owns the mode state machine and the per-session worker threads.
pub struct Orchestrator {
    config: RecorderConfig,
    peripheral: PeripheralHandle,
    classifier: Option<ClassifierHandle>,
    storage: Box<dyn StorageService>,
    power: Box<dyn PowerService>,
    req_tx: Sender<ModeRequest>,
    req_rx: Receiver<ModeRequest>,
    fault_tx: Sender<SessionFault>,
    fault_rx: Receiver<SessionFault>,
    status: Arc<Mutex<StatusSnapshot>>,
    active: Option<ActiveSession>,
    recording_time_total: Duration,
    last_writer_stats: Option<WriterStatsSnapshot>,
    last_source_stats: Option<SourceStatsSnapshot>,
}

impl Orchestrator {
    /// Build an orchestrator in the idle state. No threads run until
    /// [`begin`](Self::begin).
    ///
    /// `classifier` is optional: without one, detection modes are rejected
    /// at `begin` while pure recording still works.
    pub fn new(
        config: RecorderConfig,
        peripheral: PeripheralHandle,
        classifier: Option<ClassifierHandle>,
        storage: Box<dyn StorageService>,
        power: Box<dyn PowerService>,
    ) -> Self {
        let (req_tx, req_rx) = crossbeam_channel::bounded(REQUEST_QUEUE_CAP);
        let (fault_tx, fault_rx) = crossbeam_channel::bounded(REQUEST_QUEUE_CAP);
        Self {
            config,
            peripheral,
            classifier,
            storage,
            power,
            req_tx,
            req_rx,
            fault_tx,
            fault_rx,
            status: Arc::new(Mutex::new(StatusSnapshot {
                state: RecState::Idle,
                session_id: None,
            })),
            active: None,
            recording_time_total: Duration::ZERO,
            last_writer_stats: None,
            last_source_stats: None,
        }
    }

    /// Handle for event sources (button ISR, command channel, detector).
    pub fn request_handle(&self) -> RequestHandle {
        RequestHandle {
            tx: self.req_tx.clone(),
        }
    }

    /// Start a session in the requested mode.
    ///
    /// Storage trouble in a recording mode degrades the writer to
    /// `Disabled` instead of failing: detection continues, nothing is
    /// written.
    ///
    /// # Errors
    /// `ElocError::InvalidTransition` unless currently idle and `requested`
    /// is a non-idle mode; `ElocError::Classifier` when a detection mode is
    /// requested with no classifier installed; configuration and hardware
    /// errors from the peripheral.
    pub fn begin(&mut self, requested: RecState) -> Result<()> {
        if self.active.is_some() || requested.is_idle() {
            return Err(ElocError::InvalidTransition {
                from: self.status.lock().state,
                requested,
            });
        }
        self.config.validate()?;

        let mut storage_ok = {
            let mounted = self.storage.is_mounted();
            let free = self.storage.free_space_gb();
            mounted && free >= self.config.free_space_floor_gb
        };
        if !storage_ok && requested.records() {
            warn!(
                mounted = self.storage.is_mounted(),
                free_gb = self.storage.free_space_gb(),
                "storage preconditions failed — recording disabled, session continues"
            );
        }

        let session = RecordingSession::create(self.storage.root(), &self.config);
        if storage_ok && requested.records() {
            if let Err(e) = session
                .ensure_folder()
                .and_then(|()| session.persist_config_snapshot())
            {
                warn!(error = %e, "could not prepare session folder — recording disabled");
                storage_ok = false;
            }
        }

        // Consumers register before the peripheral starts, so no sample ever
        // arrives without a buffer to land in.
        let mut sample_source = SampleSource::new(self.peripheral.clone());

        let mut writer_parts = None;
        if requested.records() {
            let (producer, consumer) = block_pair(self.config.block_len_samples)?;
            sample_source.register_consumer(producer, 1)?;
            let initial_mode = if !storage_ok {
                WriterMode::Disabled
            } else if requested.event_triggered() {
                // Armed by the detector's first trigger.
                WriterMode::Disabled
            } else {
                WriterMode::Continuous
            };
            writer_parts = Some((consumer, Arc::new(WriterShared::new(initial_mode))));
        }

        let mut detector_parts = None;
        if requested.detects() {
            let classifier = self
                .classifier
                .clone()
                .ok_or_else(|| ElocError::Classifier("no classifier installed".into()))?;
            classifier.0.lock().warm_up()?;
            let (producer, consumer) = block_pair(self.config.detector_window_samples)?;
            sample_source.register_consumer(producer, self.config.detector_skip())?;
            detector_parts = Some((consumer, classifier, Arc::new(DetectorStats::default())));
        }

        let peripheral_cfg = PeripheralConfig::from_recorder(&self.config);
        let actual_rate = sample_source.configure(&peripheral_cfg, self.config.gain_shift)?;
        let source_stats = sample_source.stats();

        // The writer is built only after the negotiated rate is known, so
        // every header carries the rate the hardware actually runs at.
        let mut writer_thread = None;
        let mut writer_shared = None;
        if let Some((consumer, shared)) = writer_parts {
            let mut writer = FileWriter::new(
                consumer,
                session.clone(),
                actual_rate,
                self.config.channel_count,
                self.config.seconds_per_file,
                Arc::clone(&shared),
                self.fault_tx.clone(),
            );
            if shared.mode() == WriterMode::Continuous {
                if let Err(e) = writer.open_session_file() {
                    warn!(error = %e, "could not open first recording file — writer disabled");
                    shared.set_mode(WriterMode::Disabled);
                }
            }
            writer_thread = Some(
                thread::Builder::new()
                    .name("eloc-writer".into())
                    .spawn(move || writer.run())?,
            );
            writer_shared = Some(shared);
        }

        let mut detector_thread = None;
        let mut detector_stats = None;
        if let Some((consumer, classifier, stats)) = detector_parts {
            let ctx = DetectorContext {
                consumer,
                classifier,
                threshold: self.config.detection_threshold,
                event_trigger: requested
                    .event_triggered()
                    .then(|| self.request_handle()),
                stats: Arc::clone(&stats),
            };
            detector_thread = Some(
                thread::Builder::new()
                    .name("eloc-detector".into())
                    .spawn(move || detect::run(ctx))?,
            );
            detector_stats = Some(stats);
        }

        sample_source.start()?;
        let running = Arc::new(AtomicBool::new(true));
        let capture_ctx = CaptureContext {
            source: sample_source,
            block_len: self.config.block_len_samples,
            running: Arc::clone(&running),
            fault_tx: self.fault_tx.clone(),
        };
        let capture = thread::Builder::new()
            .name("eloc-capture".into())
            .spawn(move || source::run(capture_ctx))?;

        {
            let mut status = self.status.lock();
            status.state = requested;
            status.session_id = Some(session.id().to_string());
        }
        info!(mode = %requested, session = session.id(), rate = actual_rate, "session started");

        self.active = Some(ActiveSession {
            session,
            running,
            capture,
            writer: writer_thread,
            detector: detector_thread,
            writer_shared,
            detector_stats,
            source_stats,
            started: Instant::now(),
            last_storage_check_block: 0,
        });
        Ok(())
    }

    /// Stop the running session, if any, and return to idle.
    ///
    /// Teardown order: clear the running flag, join the capture thread (it
    /// stops the peripheral and closes every buffer pair), then join the
    /// drain threads — the writer finalizes its open file on the way out.
    pub fn end(&mut self) -> Result<EndOutcome> {
        let Some(active) = self.active.take() else {
            debug!("stop requested while idle");
            return Ok(EndOutcome::AlreadyStopped);
        };
        info!(session = active.session.id(), "ending session");

        active.running.store(false, Ordering::Relaxed);
        if active.capture.join().is_err() {
            error!("capture thread panicked");
        }
        if let Some(handle) = active.writer {
            if handle.join().is_err() {
                error!("writer thread panicked");
            }
        }
        if let Some(handle) = active.detector {
            if handle.join().is_err() {
                error!("detector thread panicked");
            }
        }

        // The joins above complete all fault sends; anything still queued
        // belongs to this session and must not end the next one.
        while let Ok(fault) = self.fault_rx.try_recv() {
            debug!(?fault, "session fault discarded during teardown");
        }

        self.last_writer_stats = active
            .writer_shared
            .as_ref()
            .map(|shared| shared.stats_snapshot());
        self.last_source_stats = Some(active.source_stats.snapshot());

        self.recording_time_total += active.started.elapsed();
        {
            let mut status = self.status.lock();
            status.state = RecState::Idle;
            status.session_id = None;
        }
        info!(session = active.session.id(), "session ended");
        Ok(EndOutcome::Stopped)
    }

    /// Drain faults, run safety checks, then wait up to `max_wait` for one
    /// mode request and apply it. Returns `true` when a request was handled.
    ///
    /// The firmware main loop calls this continuously; `max_wait` is the
    /// loop's idle sleep.
    pub fn check_request_queue(&mut self, max_wait: Duration) -> bool {
        while let Ok(fault) = self.fault_rx.try_recv() {
            error!(?fault, "session fault — ending session");
            if let Err(e) = self.end() {
                error!(error = %e, "session teardown failed");
            }
        }

        self.run_safety_checks();

        match self.req_rx.recv_timeout(max_wait) {
            Ok(request) => {
                info!(?request, "mode request dequeued");
                if let Err(e) = self.apply(request) {
                    warn!(error = %e, "mode request rejected");
                }
                true
            }
            Err(_) => false,
        }
    }

    fn apply(&mut self, request: ModeRequest) -> Result<()> {
        match request {
            ModeRequest::Mode(mode) if mode.is_idle() => {
                self.end()?;
                Ok(())
            }
            ModeRequest::Mode(mode) => self.begin(mode),
            ModeRequest::Toggle => {
                if self.active.is_some() {
                    self.end()?;
                    Ok(())
                } else {
                    self.begin(RecState::RecordOnly)
                }
            }
            ModeRequest::EventTrigger => {
                self.handle_event_trigger();
                Ok(())
            }
        }
    }

    /// Arm the writer for one file. Only meaningful while an event-triggered
    /// session runs; triggers during an active recording are collapsed.
    fn handle_event_trigger(&mut self) {
        let state = self.status.lock().state;
        if state != RecState::EventTriggered {
            warn!(%state, "event trigger outside event-triggered mode — ignored");
            return;
        }
        let Some(shared) = self
            .active
            .as_ref()
            .and_then(|a| a.writer_shared.as_ref())
        else {
            return;
        };
        if shared.mode() != WriterMode::Disabled {
            debug!("event trigger while already recording — collapsed");
            return;
        }

        let mounted = self.storage.is_mounted();
        let free = self.storage.free_space_gb();
        if !mounted || free < self.config.free_space_floor_gb {
            warn!(mounted, free_gb = free, "event trigger suppressed: storage not usable");
            return;
        }
        shared.set_mode(WriterMode::Single);
        info!("detection armed the writer for one file");
    }

    /// Battery cutoff and periodic storage re-verification.
    fn run_safety_checks(&mut self) {
        if self.active.is_none() {
            return;
        }

        if self.power.is_critically_low() {
            warn!(
                voltage = self.power.voltage(),
                "battery critically low — ending session and requesting sleep"
            );
            if let Err(e) = self.end() {
                error!(error = %e, "session teardown failed");
            }
            self.power.request_low_power_sleep();
            return;
        }

        let mut storage_failed = false;
        if let Some(active) = self.active.as_mut() {
            if let Some(shared) = &active.writer_shared {
                let blocks = shared.stats_snapshot().blocks_written;
                if blocks.saturating_sub(active.last_storage_check_block)
                    >= self.config.storage_check_blocks
                {
                    active.last_storage_check_block = blocks;
                    let mounted = self.storage.is_mounted();
                    let free = self.storage.free_space_gb();
                    if !mounted || free < self.config.free_space_floor_gb {
                        warn!(
                            mounted,
                            free_gb = free,
                            "storage no longer sufficient — ending session"
                        );
                        storage_failed = true;
                    }
                }
            }
        }
        if storage_failed {
            if let Err(e) = self.end() {
                error!(error = %e, "session teardown failed");
            }
        }
    }

    // --- telemetry ----------------------------------------------------------

    pub fn recording_state(&self) -> RecState {
        self.status.lock().state
    }

    pub fn session_identifier(&self) -> Option<String> {
        self.status.lock().session_id.clone()
    }

    /// Mode and session identity in one consistent read.
    pub fn status(&self) -> StatusSnapshot {
        self.status.lock().clone()
    }

    /// Detections counted by the current session (0 while idle).
    pub fn detection_count(&self) -> u64 {
        self.active
            .as_ref()
            .and_then(|a| a.detector_stats.as_ref())
            .map_or(0, |s| s.snapshot().detections)
    }

    /// Accumulated session time across the device's uptime, including the
    /// session currently running.
    pub fn recording_time_total(&self) -> Duration {
        let active = self
            .active
            .as_ref()
            .map_or(Duration::ZERO, |a| a.started.elapsed());
        self.recording_time_total + active
    }

    /// Writer counters for the current session, or the final counters of the
    /// last session that registered a writer.
    pub fn writer_stats(&self) -> Option<WriterStatsSnapshot> {
        self.active
            .as_ref()
            .and_then(|a| a.writer_shared.as_ref())
            .map(|s| s.stats_snapshot())
            .or(self.last_writer_stats)
    }

    /// Capture counters for the current session, or the final counters of
    /// the last one.
    pub fn source_stats(&self) -> Option<SourceStatsSnapshot> {
        self.active
            .as_ref()
            .map(|a| a.source_stats.snapshot())
            .or(self.last_source_stats)
    }
}

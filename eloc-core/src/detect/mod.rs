//! Sound classifier abstraction and detector drain loop.
//!
//! The `SoundClassifier` trait decouples the detector from any specific
//! backend (RMS energy, spectrogram CNN, etc.). `&mut self` on `classify`
//! expresses that backends are stateful; all mutation is serialised through
//! [`ClassifierHandle`]'s `parking_lot::Mutex`.
//!
//! The drain loop owns its buffer pair's consumer half, fed by the sample
//! source at a (possibly lower) skip rate. A classifier runtime error skips
//! that one window and is never fatal to the session.

pub mod energy;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffering::BlockConsumer;
use crate::error::Result;
use crate::orchestrator::RequestHandle;
use crate::session::ModeRequest;

/// One label the classifier recognised in a window.
#[derive(Debug, Clone)]
pub struct Detection {
    pub label: String,
    /// Score in [0, 1].
    pub score: f32,
}

/// Contract for classification backends.
pub trait SoundClassifier: Send + 'static {
    /// One-time warm-up at session start (load weights, prime caches).
    ///
    /// # Errors
    /// Returns an error if the backend cannot become ready; the session
    /// does not start in that case.
    fn warm_up(&mut self) -> Result<()>;

    /// Classify one window of mono f32 samples in [-1.0, 1.0].
    ///
    /// # Returns
    /// Zero or more detections; the caller applies the score threshold.
    fn classify(&mut self, window: &[f32]) -> Result<Vec<Detection>>;

    /// Reset internal state between sessions.
    fn reset(&mut self);
}

/// Thread-safe reference-counted handle to any `SoundClassifier` backend.
#[derive(Clone)]
pub struct ClassifierHandle(pub Arc<Mutex<dyn SoundClassifier>>);

impl ClassifierHandle {
    pub fn new<C: SoundClassifier>(classifier: C) -> Self {
        Self(Arc::new(Mutex::new(classifier)))
    }
}

impl std::fmt::Debug for ClassifierHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierHandle").finish_non_exhaustive()
    }
}

/// Detector-side counters. The detection count is monotonic within a
/// session; a fresh set is allocated per session, so session end is the only
/// reset.
pub struct DetectorStats {
    pub windows_classified: AtomicU64,
    pub detections: AtomicU64,
    pub classifier_errors: AtomicU64,
}

impl Default for DetectorStats {
    fn default() -> Self {
        Self {
            windows_classified: AtomicU64::new(0),
            detections: AtomicU64::new(0),
            classifier_errors: AtomicU64::new(0),
        }
    }
}

impl DetectorStats {
    pub fn snapshot(&self) -> DetectorStatsSnapshot {
        DetectorStatsSnapshot {
            windows_classified: self.windows_classified.load(Ordering::Relaxed),
            detections: self.detections.load(Ordering::Relaxed),
            classifier_errors: self.classifier_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorStatsSnapshot {
    pub windows_classified: u64,
    pub detections: u64,
    pub classifier_errors: u64,
}

/// Everything the detector drain loop needs.
pub struct DetectorContext {
    pub consumer: BlockConsumer,
    pub classifier: ClassifierHandle,
    /// Minimum score counted as a detection.
    pub threshold: f32,
    /// `Some` in event-triggered mode: each detection enqueues a recording
    /// trigger through the bounded request queue.
    pub event_trigger: Option<RequestHandle>,
    pub stats: Arc<DetectorStats>,
}

/// Run the detector drain loop until the producer closes the buffer pair.
pub fn run(ctx: DetectorContext) {
    info!(
        window = ctx.consumer.capacity(),
        threshold = ctx.threshold,
        event_triggered = ctx.event_trigger.is_some(),
        "detector loop started"
    );

    let mut scratch: Vec<i16> = Vec::with_capacity(ctx.consumer.capacity());
    let mut window: Vec<f32> = Vec::with_capacity(ctx.consumer.capacity());

    while ctx.consumer.wait_ready() {
        if ctx.consumer.drain_into(&mut scratch).is_none() {
            continue;
        }

        window.clear();
        window.extend(scratch.iter().map(|&s| s as f32 / 32768.0));

        ctx.stats
            .windows_classified
            .fetch_add(1, Ordering::Relaxed);

        let detections = match ctx.classifier.0.lock().classify(&window) {
            Ok(d) => d,
            Err(e) => {
                // One bad window is not worth the session.
                warn!(error = %e, "classifier error — skipping window");
                ctx.stats
                    .classifier_errors
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        for detection in detections {
            if detection.score < ctx.threshold {
                continue;
            }
            ctx.stats.detections.fetch_add(1, Ordering::Relaxed);
            debug!(
                label = detection.label.as_str(),
                score = detection.score,
                "detection"
            );
            if let Some(handle) = &ctx.event_trigger {
                if !handle.request(ModeRequest::EventTrigger) {
                    warn!("request queue full — event trigger dropped");
                }
            }
        }
    }

    ctx.classifier.0.lock().reset();

    let snap = ctx.stats.snapshot();
    info!(
        windows = snap.windows_classified,
        detections = snap.detections,
        errors = snap.classifier_errors,
        "detector loop stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use crate::buffering::block_pair;
    use crate::error::ElocError;

    struct ScriptedClassifier {
        scores: Vec<Option<f32>>,
        idx: usize,
        resets: Arc<AtomicUsize>,
    }

    impl SoundClassifier for ScriptedClassifier {
        fn warm_up(&mut self) -> Result<()> {
            Ok(())
        }

        fn classify(&mut self, _window: &[f32]) -> Result<Vec<Detection>> {
            let entry = self.scores.get(self.idx).copied().flatten();
            self.idx += 1;
            match entry {
                Some(score) => Ok(vec![Detection {
                    label: "trumpet".into(),
                    score,
                }]),
                None => Err(ElocError::Classifier("intentional test failure".into())),
            }
        }

        fn reset(&mut self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn run_with_scores(scores: Vec<Option<f32>>, threshold: f32) -> DetectorStatsSnapshot {
        let windows = scores.len();
        let (mut tx, rx) = block_pair(4).unwrap();
        let resets = Arc::new(AtomicUsize::new(0));
        let stats = Arc::new(DetectorStats::default());
        let ctx = DetectorContext {
            consumer: rx,
            classifier: ClassifierHandle::new(ScriptedClassifier {
                scores,
                idx: 0,
                resets: Arc::clone(&resets),
            }),
            threshold,
            event_trigger: None,
            stats: Arc::clone(&stats),
        };

        let handle = thread::spawn(move || run(ctx));
        for i in 0..windows {
            for s in 0..4 {
                tx.push(s);
            }
            // Wait until the loop consumed this window before pushing the
            // next one, so no block is dropped as an overrun.
            while stats.snapshot().windows_classified < (i + 1) as u64 {
                thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        drop(tx);
        handle.join().unwrap();
        assert_eq!(resets.load(Ordering::Relaxed), 1);
        stats.snapshot()
    }

    #[test]
    fn detections_above_threshold_are_counted() {
        let snap = run_with_scores(vec![Some(0.9), Some(0.2), Some(0.75)], 0.5);
        assert_eq!(snap.windows_classified, 3);
        assert_eq!(snap.detections, 2);
        assert_eq!(snap.classifier_errors, 0);
    }

    #[test]
    fn classifier_error_skips_one_window_only() {
        let snap = run_with_scores(vec![Some(0.9), None, Some(0.9)], 0.5);
        assert_eq!(snap.windows_classified, 3);
        assert_eq!(snap.detections, 2);
        assert_eq!(snap.classifier_errors, 1);
    }
}

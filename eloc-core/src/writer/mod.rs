//! Asynchronous WAV file writer.
//!
//! Owns the consumer half of one buffer pair and persists completed blocks
//! on its own thread, so storage latency never stalls the capture loop. The
//! WAV header is written provisionally at file open (hound leaves the size
//! fields for later) and rewritten with the true byte counts at finalize, so
//! a cleanly ended session never leaves a corrupt header behind.
//!
//! ## Drain loop (per woken block)
//!
//! ```text
//! 1. Copy the ready half out and clear the flag
//! 2. Disabled mode → discard (finalizing any file left open)
//! 3. Open a file lazily if none is open (first block, after rotation,
//!    or when an event trigger armed Single mode)
//! 4. Append, timing the write; budget overshoot counts as an underrun
//! 5. Rotate when the per-file duration threshold is crossed
//! ```
//!
//! Any write or finalize error marks the writer failed and raises a session
//! fault — a clean stop beats a silently truncated file.

use std::fs::File;
use std::io::BufWriter;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::buffering::BlockConsumer;
use crate::error::{ElocError, Result};
use crate::session::{RecordingSession, SessionFault};

/// What the writer does with completed blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterMode {
    /// Discard blocks (degraded storage, or event mode waiting for a
    /// trigger).
    Disabled,
    /// Rotate files indefinitely until told otherwise.
    Continuous,
    /// Write one file of the configured duration, then disarm back to
    /// `Disabled`. Used for event-triggered recording.
    Single,
}

/// Write-performance counters.
pub struct WriterStats {
    pub blocks_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub files_completed: AtomicU64,
    /// Longest single block write, microseconds.
    pub longest_write_us: AtomicU64,
    /// Worst observed write throughput, bytes/second (`u64::MAX` until the
    /// first write).
    pub worst_throughput_bps: AtomicU64,
    /// Writes that exceeded the inter-buffer time budget. Diagnostic, not
    /// fatal.
    pub underruns: AtomicU64,
    pub failed: AtomicBool,
}

impl Default for WriterStats {
    fn default() -> Self {
        Self {
            blocks_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            files_completed: AtomicU64::new(0),
            longest_write_us: AtomicU64::new(0),
            worst_throughput_bps: AtomicU64::new(u64::MAX),
            underruns: AtomicU64::new(0),
            failed: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriterStatsSnapshot {
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub files_completed: u64,
    pub longest_write_us: u64,
    /// 0 until the first write completes.
    pub worst_throughput_bps: u64,
    pub underruns: u64,
    pub failed: bool,
}

/// State shared between the orchestrator (mode changes, telemetry reads) and
/// the drain loop.
pub struct WriterShared {
    mode: Mutex<WriterMode>,
    stats: WriterStats,
}

impl WriterShared {
    pub fn new(mode: WriterMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            stats: WriterStats::default(),
        }
    }

    pub fn mode(&self) -> WriterMode {
        *self.mode.lock()
    }

    pub fn set_mode(&self, mode: WriterMode) {
        *self.mode.lock() = mode;
    }

    pub fn stats_snapshot(&self) -> WriterStatsSnapshot {
        let worst = self.stats.worst_throughput_bps.load(Ordering::Relaxed);
        WriterStatsSnapshot {
            blocks_written: self.stats.blocks_written.load(Ordering::Relaxed),
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            files_completed: self.stats.files_completed.load(Ordering::Relaxed),
            longest_write_us: self.stats.longest_write_us.load(Ordering::Relaxed),
            worst_throughput_bps: if worst == u64::MAX { 0 } else { worst },
            underruns: self.stats.underruns.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }
}

/// Persists one consumer's sample blocks as WAV files.
pub struct FileWriter {
    consumer: BlockConsumer,
    session: RecordingSession,
    /// Negotiated hardware rate — written into headers, not the nominal one.
    sample_rate: u32,
    channels: u16,
    rotate_bytes: u64,
    shared: Arc<WriterShared>,
    fault_tx: Sender<SessionFault>,
    wav: Option<WavWriter<BufWriter<File>>>,
    bytes_this_file: u64,
    scratch: Vec<i16>,
}

impl FileWriter {
    pub fn new(
        consumer: BlockConsumer,
        session: RecordingSession,
        sample_rate: u32,
        channels: u16,
        seconds_per_file: u32,
        shared: Arc<WriterShared>,
        fault_tx: Sender<SessionFault>,
    ) -> Self {
        let rotate_bytes =
            u64::from(seconds_per_file) * u64::from(sample_rate) * u64::from(channels) * 2;
        Self {
            consumer,
            session,
            sample_rate,
            channels,
            rotate_bytes,
            shared,
            fault_tx,
            wav: None,
            bytes_this_file: 0,
            scratch: Vec::new(),
        }
    }

    /// Open the next file in the session folder with a provisional header.
    ///
    /// Storage preconditions (mount, free space) are the caller's job.
    ///
    /// # Errors
    /// `ElocError::OpenFailed` with the offending path.
    pub fn open_session_file(&mut self) -> Result<()> {
        self.session.ensure_folder()?;
        let path = self.session.next_wav_path();
        let spec = WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let wav = WavWriter::create(&path, spec).map_err(|e| ElocError::OpenFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        info!(path = %path.display(), sample_rate = self.sample_rate, "recording file opened");
        self.wav = Some(wav);
        self.bytes_this_file = 0;
        Ok(())
    }

    /// Rewrite the header with true byte counts and close the file.
    fn finalize_current(&mut self) -> Result<()> {
        if let Some(wav) = self.wav.take() {
            wav.finalize()?;
            self.shared
                .stats
                .files_completed
                .fetch_add(1, Ordering::Relaxed);
            info!(bytes = self.bytes_this_file, "recording file finalized");
        }
        Ok(())
    }

    /// Append the drained block, track timing, rotate when due.
    fn append_block(&mut self, len: usize) -> Result<()> {
        let Some(wav) = self.wav.as_mut() else {
            return Ok(());
        };

        let start = Instant::now();
        for &sample in &self.scratch[..len] {
            wav.write_sample(sample)?;
        }
        wav.flush()?;
        let elapsed = start.elapsed();

        let bytes = (len as u64) * 2;
        self.bytes_this_file += bytes;
        let stats = &self.shared.stats;
        stats.blocks_written.fetch_add(1, Ordering::Relaxed);
        stats.bytes_written.fetch_add(bytes, Ordering::Relaxed);

        let micros = elapsed.as_micros() as u64;
        stats.longest_write_us.fetch_max(micros, Ordering::Relaxed);
        if micros > 0 {
            let bps = bytes.saturating_mul(1_000_000) / micros;
            stats.worst_throughput_bps.fetch_min(bps, Ordering::Relaxed);
        }

        // Time budget: the capture loop refills a buffer of this length in
        // len / sample_rate seconds; slower writes will eventually drop
        // blocks.
        let budget = Duration::from_secs_f64(len as f64 / f64::from(self.sample_rate));
        if elapsed > budget {
            stats.underruns.fetch_add(1, Ordering::Relaxed);
            warn!(
                write_us = micros,
                budget_us = budget.as_micros() as u64,
                "block write exceeded time budget"
            );
        }

        if self.bytes_this_file >= self.rotate_bytes {
            self.finalize_current()?;
            if self.shared.mode() == WriterMode::Single {
                self.shared.set_mode(WriterMode::Disabled);
                info!("event-triggered file complete — writer disarmed");
            }
            // Continuous mode reopens lazily on the next block.
        }
        Ok(())
    }

    fn fail(&mut self, error: &ElocError) {
        error!(error = %error, "write failed — ending session");
        self.shared.stats.failed.store(true, Ordering::Relaxed);
        let _ = self
            .fault_tx
            .send(SessionFault::Writer(error.to_string()));
        // Best effort: a finalized short file beats a corrupt one.
        if let Err(e) = self.finalize_current() {
            error!(error = %e, "could not finalize file after write failure");
        }
    }

    /// Run the drain loop until the producer closes the pair.
    pub fn run(mut self) {
        info!(
            block_len = self.consumer.capacity(),
            rotate_bytes = self.rotate_bytes,
            mode = ?self.shared.mode(),
            "file writer started"
        );

        while self.consumer.wait_ready() {
            let Some(len) = self.consumer.drain_into(&mut self.scratch) else {
                continue;
            };

            match self.shared.mode() {
                WriterMode::Disabled => {
                    // Mode may have been cleared mid-session; close out the
                    // file so its header is valid.
                    if self.wav.is_some() {
                        if let Err(e) = self.finalize_current() {
                            self.fail(&e);
                            break;
                        }
                    }
                    debug!(samples = len, "writer disabled — block discarded");
                    continue;
                }
                WriterMode::Continuous | WriterMode::Single => {}
            }

            if self.wav.is_none() {
                if let Err(e) = self.open_session_file() {
                    warn!(error = %e, "could not open recording file — writer disabled");
                    self.shared.set_mode(WriterMode::Disabled);
                    continue;
                }
            }

            if let Err(e) = self.append_block(len) {
                self.fail(&e);
                break;
            }
        }

        if let Err(e) = self.finalize_current() {
            error!(error = %e, "could not finalize file at session end");
            self.shared.stats.failed.store(true, Ordering::Relaxed);
            let _ = self.fault_tx.send(SessionFault::Writer(e.to_string()));
        }

        let snap = self.shared.stats_snapshot();
        info!(
            blocks = snap.blocks_written,
            bytes = snap.bytes_written,
            files = snap.files_completed,
            longest_write_us = snap.longest_write_us,
            underruns = snap.underruns,
            "file writer stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use crate::buffering::{block_pair, BlockProducer};
    use crate::config::RecorderConfig;

    const RATE: u32 = 100;
    const BLOCK: usize = 50;

    struct Rig {
        tx: BlockProducer,
        shared: Arc<WriterShared>,
        handle: thread::JoinHandle<()>,
        dir: tempfile::TempDir,
        session_folder: std::path::PathBuf,
        fault_rx: crossbeam_channel::Receiver<SessionFault>,
    }

    /// One writer on its own thread: 100 Hz, 50-sample blocks, 1 s files —
    /// every second block rotates.
    fn rig(mode: WriterMode) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecorderConfig {
            device_name: "test".into(),
            ..Default::default()
        };
        let session = RecordingSession::create(dir.path(), &cfg);
        let session_folder = session.folder().to_path_buf();
        let (tx, rx) = block_pair(BLOCK).unwrap();
        let shared = Arc::new(WriterShared::new(mode));
        let (fault_tx, fault_rx) = crossbeam_channel::bounded(4);
        let writer = FileWriter::new(rx, session, RATE, 1, 1, Arc::clone(&shared), fault_tx);
        let handle = thread::spawn(move || writer.run());
        Rig {
            tx,
            shared,
            handle,
            dir,
            session_folder,
            fault_rx,
        }
    }

    fn push_block(rig: &mut Rig, value: i16) {
        for _ in 0..BLOCK {
            rig.tx.push(value);
        }
    }

    fn wait_blocks(rig: &Rig, at_least: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while rig.shared.stats_snapshot().blocks_written < at_least {
            assert!(Instant::now() < deadline, "writer made no progress");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn wav_files(folder: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(folder)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|x| x == "wav"))
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files
    }

    #[test]
    fn continuous_mode_rotates_by_duration() {
        let mut rig = rig(WriterMode::Continuous);

        for block in 0u64..4 {
            push_block(&mut rig, block as i16);
            wait_blocks(&rig, block + 1);
        }
        rig.tx.close();
        let Rig {
            tx,
            shared,
            handle,
            dir: _dir,
            session_folder,
            fault_rx: _fault_rx,
        } = rig;
        drop(tx);
        handle.join().unwrap();

        let files = wav_files(&session_folder);
        assert_eq!(files.len(), 2, "expected two rotated files: {files:?}");

        let mut total = 0u32;
        for path in &files {
            let reader = hound::WavReader::open(path).unwrap();
            assert_eq!(reader.spec().sample_rate, RATE);
            assert_eq!(reader.spec().channels, 1);
            // Finalized header: duration() comes from the data chunk size.
            assert_eq!(reader.duration(), 100);
            total += reader.duration();
        }
        assert_eq!(total as usize, 4 * BLOCK);
        let snap = shared.stats_snapshot();
        assert_eq!(snap.files_completed, 2);
        assert_eq!(snap.bytes_written, (4 * BLOCK * 2) as u64);
        assert!(!snap.failed);
    }

    #[test]
    fn disabled_writer_discards_blocks() {
        let mut rig = rig(WriterMode::Disabled);
        push_block(&mut rig, 1);
        push_block(&mut rig, 2);
        thread::sleep(Duration::from_millis(30));
        rig.tx.close();

        let Rig {
            tx,
            shared,
            handle,
            dir: _dir,
            session_folder,
            fault_rx: _fault_rx,
        } = rig;
        drop(tx);
        handle.join().unwrap();

        assert!(!session_folder.exists(), "no folder expected when disabled");
        let snap = shared.stats_snapshot();
        assert_eq!(snap.blocks_written, 0);
        assert_eq!(snap.bytes_written, 0);
    }

    #[test]
    fn single_mode_disarms_after_one_file() {
        let mut rig = rig(WriterMode::Single);

        push_block(&mut rig, 1);
        wait_blocks(&rig, 1);
        push_block(&mut rig, 2);
        wait_blocks(&rig, 2);

        // 100 samples written at 100 Hz with 1 s per file → rotated and
        // disarmed.
        let deadline = Instant::now() + Duration::from_secs(5);
        while rig.shared.mode() != WriterMode::Disabled {
            assert!(Instant::now() < deadline, "writer never disarmed");
            thread::sleep(Duration::from_millis(1));
        }

        push_block(&mut rig, 3);
        thread::sleep(Duration::from_millis(20));
        rig.tx.close();

        let Rig {
            tx,
            shared,
            handle,
            dir: _dir,
            session_folder,
            fault_rx: _fault_rx,
        } = rig;
        drop(tx);
        handle.join().unwrap();

        let files = wav_files(&session_folder);
        assert_eq!(files.len(), 1, "single mode writes exactly one file");
        let reader = hound::WavReader::open(&files[0]).unwrap();
        assert_eq!(reader.duration(), 100);
        assert_eq!(shared.stats_snapshot().files_completed, 1);
    }
}

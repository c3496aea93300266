//! Sample source: the sole producer for every registered consumer buffer.
//!
//! ## Capture loop (per iteration)
//!
//! ```text
//! 1. Blocking native read from the peripheral (≤ NATIVE_READ_WORDS words)
//! 2. Convert each raw word: (raw >> gain_shift) as i16
//! 3. For every registered consumer, honor its skip counter and push the
//!    sample into its active buffer half; a full half swaps and notifies
//!    that consumer's drain loop
//! 4. Repeat until the requested block length is delivered
//! ```
//!
//! Buffer lengths and skip rates differ per consumer, so swaps happen
//! independently — the file writer and the detector are never synchronised
//! with each other, only with the producer.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::audio::{PeripheralConfig, PeripheralHandle, NATIVE_READ_WORDS};
use crate::buffering::BlockProducer;
use crate::error::{ElocError, Result};
use crate::session::SessionFault;

/// Capture-side counters.
pub struct SourceStats {
    pub blocks_read: AtomicU64,
    pub samples_converted: AtomicU64,
    pub short_reads: AtomicU64,
}

impl Default for SourceStats {
    fn default() -> Self {
        Self {
            blocks_read: AtomicU64::new(0),
            samples_converted: AtomicU64::new(0),
            short_reads: AtomicU64::new(0),
        }
    }
}

impl SourceStats {
    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            blocks_read: self.blocks_read.load(Ordering::Relaxed),
            samples_converted: self.samples_converted.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SourceStatsSnapshot {
    pub blocks_read: u64,
    pub samples_converted: u64,
    pub short_reads: u64,
}

/// One registered consumer: its buffer producer half plus decimation state.
struct ConsumerSlot {
    producer: BlockProducer,
    /// Forward every Nth converted sample. 1 = every sample.
    skip_every: u32,
    /// Persists across `read()` calls so decimation stays phase-continuous.
    skip_phase: u32,
}

/// Owns the audio peripheral and fans converted samples out to zero or more
/// registered consumers.
pub struct SampleSource {
    peripheral: PeripheralHandle,
    gain_shift: u8,
    consumers: Vec<ConsumerSlot>,
    native_buf: Vec<i32>,
    stats: Arc<SourceStats>,
    actual_rate: u32,
}

impl SampleSource {
    pub fn new(peripheral: PeripheralHandle) -> Self {
        Self {
            peripheral,
            gain_shift: 0,
            consumers: Vec::new(),
            native_buf: vec![0i32; NATIVE_READ_WORDS],
            stats: Arc::new(SourceStats::default()),
            actual_rate: 0,
        }
    }

    /// Apply wiring/clock settings and record the gain shift.
    ///
    /// # Returns
    /// The negotiated hardware sample rate.
    pub fn configure(&mut self, config: &PeripheralConfig, gain_shift: u8) -> Result<u32> {
        if gain_shift > 16 {
            return Err(ElocError::HardwareConfig(format!(
                "gain_shift must be in 0..=16, got {gain_shift}"
            )));
        }
        let rate = self.peripheral.0.lock().configure(config)?;
        self.gain_shift = gain_shift;
        self.actual_rate = rate;
        info!(
            requested = config.sample_rate,
            negotiated = rate,
            gain_shift,
            "audio peripheral configured"
        );
        Ok(rate)
    }

    /// The negotiated rate from the last `configure` call (0 before that).
    pub fn actual_rate(&self) -> u32 {
        self.actual_rate
    }

    /// Register a consumer buffer. `skip_every` = N forwards every Nth
    /// converted sample (N = hardware rate / consumer rate).
    ///
    /// Must happen before `start()` so no samples are dropped while buffers
    /// do not exist yet.
    pub fn register_consumer(&mut self, producer: BlockProducer, skip_every: u32) -> Result<()> {
        if skip_every == 0 {
            return Err(ElocError::HardwareConfig(
                "consumer skip factor must be >= 1".into(),
            ));
        }
        debug!(
            skip_every,
            capacity = producer.capacity(),
            "consumer registered with sample source"
        );
        self.consumers.push(ConsumerSlot {
            producer,
            skip_every,
            skip_phase: 0,
        });
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.peripheral.0.lock().start()
    }

    /// Idempotent: stopping a source that never started is a no-op.
    pub fn stop(&mut self) {
        self.peripheral.0.lock().stop();
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }

    /// Blocking read of `block_len` raw words, converted and fanned out.
    ///
    /// # Returns
    /// The number of words actually delivered. A short read is logged and
    /// returns the partial count; it is not fatal.
    ///
    /// # Errors
    /// `ElocError::PeripheralRead` when the hardware times out (delivers
    /// nothing) — fatal to the session.
    pub fn read(&mut self, block_len: usize) -> Result<usize> {
        let mut delivered = 0usize;
        while delivered < block_len {
            let want = (block_len - delivered).min(NATIVE_READ_WORDS);
            let n = self.peripheral.0.lock().read_words(&mut self.native_buf[..want])?;
            if n == 0 {
                return Err(ElocError::PeripheralRead(
                    "peripheral delivered no data before timeout".into(),
                ));
            }

            for &raw in &self.native_buf[..n] {
                // Saturate so a too-small gain shift clips instead of
                // wrapping.
                let sample =
                    (raw >> self.gain_shift).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
                for slot in &mut self.consumers {
                    slot.skip_phase += 1;
                    if slot.skip_phase >= slot.skip_every {
                        slot.skip_phase = 0;
                        slot.producer.push(sample);
                    }
                }
            }
            self.stats
                .samples_converted
                .fetch_add(n as u64, Ordering::Relaxed);
            delivered += n;

            if n < want {
                warn!(requested = want, got = n, "short peripheral read");
                self.stats.short_reads.fetch_add(1, Ordering::Relaxed);
                return Ok(delivered);
            }
        }
        self.stats.blocks_read.fetch_add(1, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Wake all consumer drain loops for shutdown. Dropping the source does
    /// the same through each producer's `Drop`.
    fn close_consumers(&mut self) {
        for slot in &self.consumers {
            slot.producer.close();
        }
    }
}

/// Everything the capture loop needs, bundled so the thread closure stays tidy.
pub struct CaptureContext {
    pub source: SampleSource,
    /// Words requested per loop iteration.
    pub block_len: usize,
    /// Cleared by the orchestrator to stop; honored at iteration boundaries,
    /// never mid-read.
    pub running: Arc<AtomicBool>,
    pub fault_tx: Sender<SessionFault>,
}

/// Run the capture loop until stopped or a fatal peripheral error.
///
/// On exit the peripheral is stopped and every consumer pair is closed, so
/// drain loops finish their current buffer and terminate.
pub fn run(mut ctx: CaptureContext) {
    info!(block_len = ctx.block_len, "capture loop started");

    while ctx.running.load(Ordering::Relaxed) {
        match ctx.source.read(ctx.block_len) {
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "fatal peripheral read error — ending session");
                let _ = ctx.fault_tx.send(SessionFault::Peripheral(e.to_string()));
                break;
            }
        }
    }

    ctx.source.stop();
    ctx.source.close_consumers();

    let snap = ctx.source.stats.snapshot();
    info!(
        blocks_read = snap.blocks_read,
        samples_converted = snap.samples_converted,
        short_reads = snap.short_reads,
        "capture loop stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SamplePeripheral;
    use crate::buffering::block_pair;
    use crate::config::RecorderConfig;

    /// Delivers a scripted sequence of raw words, `words_per_read` at a time.
    struct ScriptedPeripheral {
        words: Vec<i32>,
        pos: usize,
        words_per_read: usize,
        started: bool,
    }

    impl ScriptedPeripheral {
        fn new(words: Vec<i32>, words_per_read: usize) -> Self {
            Self {
                words,
                pos: 0,
                words_per_read,
                started: false,
            }
        }
    }

    impl SamplePeripheral for ScriptedPeripheral {
        fn configure(&mut self, config: &PeripheralConfig) -> Result<u32> {
            Ok(config.sample_rate)
        }

        fn start(&mut self) -> Result<()> {
            self.started = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.started = false;
        }

        fn read_words(&mut self, out: &mut [i32]) -> Result<usize> {
            let n = out
                .len()
                .min(self.words_per_read)
                .min(self.words.len() - self.pos);
            out[..n].copy_from_slice(&self.words[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn configured_source(words: Vec<i32>, words_per_read: usize, gain_shift: u8) -> SampleSource {
        let mut source =
            SampleSource::new(PeripheralHandle::new(ScriptedPeripheral::new(
                words,
                words_per_read,
            )));
        let cfg = PeripheralConfig::from_recorder(&RecorderConfig::default());
        source.configure(&cfg, gain_shift).unwrap();
        source
    }

    #[test]
    fn gain_shift_scales_raw_words() {
        let raw: Vec<i32> = vec![1 << 11, 2 << 11, 3 << 11, -(4 << 11)];
        let mut source = configured_source(raw, 4, 11);

        let (tx, rx) = block_pair(4).unwrap();
        source.register_consumer(tx, 1).unwrap();

        assert_eq!(source.read(4).unwrap(), 4);
        let mut out = Vec::new();
        rx.drain_into(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, -4]);
    }

    #[test]
    fn oversized_words_saturate_instead_of_wrapping() {
        let raw: Vec<i32> = vec![40_000, -40_000, 1_000];
        let mut source = configured_source(raw, 3, 0);

        let (tx, rx) = block_pair(3).unwrap();
        source.register_consumer(tx, 1).unwrap();

        assert_eq!(source.read(3).unwrap(), 3);
        let mut out = Vec::new();
        rx.drain_into(&mut out).unwrap();
        assert_eq!(out, vec![i16::MAX, i16::MIN, 1_000]);
    }

    #[test]
    fn skip_counter_forwards_every_nth_sample() {
        // Hardware 48 kHz feeding a 16 kHz consumer: every 3rd sample.
        let raw: Vec<i32> = (1..=12).collect();
        let mut source = configured_source(raw, 12, 0);

        let (tx, rx) = block_pair(4).unwrap();
        source.register_consumer(tx, 3).unwrap();

        assert_eq!(source.read(12).unwrap(), 12);
        let mut out = Vec::new();
        rx.drain_into(&mut out).unwrap();
        assert_eq!(out, vec![3, 6, 9, 12]);
    }

    #[test]
    fn skip_phase_persists_across_reads() {
        let raw: Vec<i32> = (1..=10).collect();
        // Native unit of 2 words forces five reads for ten samples.
        let mut source = configured_source(raw, 2, 0);

        let (tx, rx) = block_pair(5).unwrap();
        source.register_consumer(tx, 2).unwrap();

        for _ in 0..5 {
            source.read(2).unwrap();
        }
        let mut out = Vec::new();
        rx.drain_into(&mut out).unwrap();
        assert_eq!(out, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn consumers_swap_independently() {
        let raw: Vec<i32> = (0..8).collect();
        let mut source = configured_source(raw, 8, 0);

        let (writer_tx, writer_rx) = block_pair(8).unwrap();
        let (detect_tx, detect_rx) = block_pair(2).unwrap();
        source.register_consumer(writer_tx, 1).unwrap();
        source.register_consumer(detect_tx, 2).unwrap();

        source.read(8).unwrap();

        // Writer half just filled once; the detector's shorter buffer filled
        // twice on its own schedule (the second block overruns because this
        // test never drains).
        assert!(writer_rx.is_ready());
        let detect_stats = detect_rx.stats();
        assert_eq!(detect_stats.samples_pushed, 4);
        assert_eq!(detect_stats.blocks_swapped, 1);
        assert_eq!(detect_stats.overruns, 1);
        let mut out = Vec::new();
        detect_rx.drain_into(&mut out).unwrap();
        assert_eq!(out, vec![1, 3]);
    }

    #[test]
    fn short_read_returns_partial_count() {
        let raw: Vec<i32> = (0..5).collect();
        let mut source = configured_source(raw, 5, 0);
        let (tx, _rx) = block_pair(16).unwrap();
        source.register_consumer(tx, 1).unwrap();

        // Asks for 8, hardware has only 5 left.
        assert_eq!(source.read(8).unwrap(), 5);
        assert_eq!(source.stats().snapshot().short_reads, 1);
    }

    #[test]
    fn exhausted_peripheral_is_a_timeout() {
        let mut source = configured_source(vec![], 4, 0);
        let err = source.read(4).unwrap_err();
        assert!(matches!(err, ElocError::PeripheralRead(_)), "got {err}");
    }

    #[test]
    fn zero_skip_factor_is_rejected() {
        let mut source = configured_source(vec![], 4, 0);
        let (tx, _rx) = block_pair(4).unwrap();
        assert!(source.register_consumer(tx, 0).is_err());
    }
}

//! Simulated recording run.
//!
//! Drives the orchestrator with a synthetic sine-wave peripheral and writes
//! real WAV files to a local directory, so the whole capture → buffer →
//! writer/detector path can be exercised without recorder hardware.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use eloc_core::{
    ClassifierHandle, EnergyClassifier, Orchestrator, PeripheralConfig, PeripheralHandle,
    PowerService, RecState, RecorderConfig, SamplePeripheral, StorageService,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("simrec failed: {e}");
        std::process::exit(1);
    }
}

#[derive(Debug)]
struct Args {
    output: PathBuf,
    seconds: u64,
    mode: RecState,
    freq: f32,
}

fn parse_args() -> Result<Args, String> {
    let mut output = PathBuf::from("simrec-out");
    let mut seconds = 5u64;
    let mut mode = RecState::RecordOnly;
    let mut freq = 440.0f32;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--output" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --output".into());
                };
                output = PathBuf::from(v);
            }
            "--seconds" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --seconds".into());
                };
                seconds = v
                    .parse::<u64>()
                    .map_err(|_| "invalid value for --seconds".to_string())?
                    .clamp(1, 600);
            }
            "--mode" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --mode".into());
                };
                mode = v.parse::<RecState>().map_err(|e| e.to_string())?;
            }
            "--freq" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --freq".into());
                };
                freq = v
                    .parse::<f32>()
                    .map_err(|_| "invalid value for --freq".to_string())?;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p eloc-core --bin simrec -- \\
  [--output <dir>] [--seconds <n>] [--mode <token>] [--freq <hz>]

Mode tokens: recordOn_detectOff, recordOff_detectOn, recordOn_detectOn,
recordOnEvent"
                );
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Args {
        output,
        seconds,
        mode,
        freq,
    })
}

/// Real-time-paced sine generator in place of the microphone driver.
struct SinePeripheral {
    freq: f32,
    rate: u32,
    gain_shift: u8,
    phase: u64,
}

impl SamplePeripheral for SinePeripheral {
    fn configure(&mut self, config: &PeripheralConfig) -> eloc_core::error::Result<u32> {
        self.rate = config.sample_rate;
        Ok(config.sample_rate)
    }

    fn start(&mut self) -> eloc_core::error::Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn read_words(&mut self, out: &mut [i32]) -> eloc_core::error::Result<usize> {
        for word in out.iter_mut() {
            let t = self.phase as f32 / self.rate as f32;
            let sample = (0.5 * (std::f32::consts::TAU * self.freq * t).sin() * 32767.0) as i16;
            *word = i32::from(sample) << self.gain_shift;
            self.phase += 1;
        }
        // Pace the generator at the nominal hardware rate.
        thread::sleep(Duration::from_secs_f64(
            out.len() as f64 / f64::from(self.rate),
        ));
        Ok(out.len())
    }
}

struct DirStorage {
    root: PathBuf,
}

impl StorageService for DirStorage {
    fn is_mounted(&self) -> bool {
        self.root.is_dir()
    }

    fn free_space_gb(&self) -> f32 {
        // Local disk stands in for the SD card; assume ample space.
        64.0
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

struct MainsPower;

impl PowerService for MainsPower {
    fn voltage(&self) -> f32 {
        5.0
    }

    fn is_critically_low(&self) -> bool {
        false
    }

    fn request_low_power_sleep(&self) {}
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    std::fs::create_dir_all(&args.output).map_err(|e| e.to_string())?;

    let config = RecorderConfig {
        device_name: "simrec".into(),
        block_len_samples: 4_000,
        detector_window_samples: 16_000,
        seconds_per_file: args.seconds.max(1) as u32,
        ..Default::default()
    };
    let gain_shift = config.gain_shift;

    let mut orch = Orchestrator::new(
        config,
        PeripheralHandle::new(SinePeripheral {
            freq: args.freq,
            rate: 16_000,
            gain_shift,
            phase: 0,
        }),
        Some(ClassifierHandle::new(EnergyClassifier::default())),
        Box::new(DirStorage {
            root: args.output.clone(),
        }),
        Box::new(MainsPower),
    );

    println!(
        "simrec: {}s of {} at {:.0} Hz into {}",
        args.seconds,
        args.mode,
        args.freq,
        args.output.display()
    );

    orch.begin(args.mode).map_err(|e| e.to_string())?;
    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    while Instant::now() < deadline {
        orch.check_request_queue(Duration::from_millis(100));
    }
    let detections = orch.detection_count();
    let writer = orch.writer_stats();
    orch.end().map_err(|e| e.to_string())?;

    if let Some(stats) = writer {
        println!(
            "writer: {} blocks, {} bytes, {} files, longest write {} µs, {} underruns",
            stats.blocks_written,
            stats.bytes_written,
            stats.files_completed,
            stats.longest_write_us,
            stats.underruns
        );
    }
    println!("detections: {detections}");
    Ok(())
}

//! Microphone capture pipeline.
//!
//! A cpal input stream feeds a shared sample buffer; a worker thread drains
//! that buffer on a fixed window and hands encoded chunks to the caller's
//! channel. Windows quieter than the minimum chunk size are dropped so
//! silence never costs a transcription round trip.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, info, warn};

use crate::error::DeviceError;

/// One encoded capture window, ready to send as a binary frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sequence_index: u64,
    /// 16 kHz mono PCM, 16-bit little-endian.
    pub payload: Vec<u8>,
    pub duration_ms: u64,
    pub captured_at: DateTime<Utc>,
}

impl AudioChunk {
    pub const CONTENT_TYPE: &'static str = "audio/pcm;rate=16000";
}

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// How often the drain loop wakes to check the window and the stop flag.
const DRAIN_TICK: Duration = Duration::from_millis(50);

pub struct CapturePipeline {
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    rms: Arc<AtomicU32>,
    chunks_sent: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Open the default input device and start producing chunks on `sink`.
    /// Blocks until the stream is up or the device open fails.
    pub fn start(
        window: Duration,
        min_chunk_bytes: usize,
        sink: mpsc::Sender<AudioChunk>,
    ) -> Result<CapturePipeline, DeviceError> {
        let stop = Arc::new(AtomicBool::new(false));
        let pause = Arc::new(AtomicBool::new(false));
        let rms = Arc::new(AtomicU32::new(0));
        let chunks_sent = Arc::new(AtomicU64::new(0));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), DeviceError>>();
        let worker = {
            let stop = Arc::clone(&stop);
            let pause = Arc::clone(&pause);
            let rms = Arc::clone(&rms);
            let chunks_sent = Arc::clone(&chunks_sent);
            // cpal streams are not Send, so the stream is built and dropped
            // on the worker thread; only the open result crosses back.
            std::thread::spawn(move || {
                let buffer: Arc<Mutex<Vec<i16>>> = Arc::new(Mutex::new(Vec::new()));
                let stream = match open_mic_stream(
                    Arc::clone(&buffer),
                    Arc::clone(&stop),
                    Arc::clone(&pause),
                    Arc::clone(&rms),
                ) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                drain_loop(&buffer, &stop, &pause, &chunks_sent, window, min_chunk_bytes, sink);
                drop(stream);
                info!("capture pipeline stopped");
            })
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("capture pipeline started ({}ms windows)", window.as_millis());
                Ok(CapturePipeline {
                    stop,
                    pause,
                    rms,
                    chunks_sent,
                    worker: Some(worker),
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(DeviceError::Backend("capture thread died".to_string())),
        }
    }

    /// Keep the device open but discard incoming samples.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    /// Current input level in 0.0..=1.0, for a mic meter.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.rms.load(Ordering::Relaxed))
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    /// Stop the stream and join the worker. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_loop(
    buffer: &Arc<Mutex<Vec<i16>>>,
    stop: &AtomicBool,
    pause: &AtomicBool,
    chunks_sent: &AtomicU64,
    window: Duration,
    min_chunk_bytes: usize,
    sink: mpsc::Sender<AudioChunk>,
) {
    let mut sequence_index: u64 = 0;
    let mut window_start = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(DRAIN_TICK);
        if window_start.elapsed() < window {
            continue;
        }
        window_start = Instant::now();

        let samples: Vec<i16> = {
            let mut buf = match buffer.lock() {
                Ok(b) => b,
                Err(_) => return,
            };
            std::mem::take(&mut *buf)
        };
        if pause.load(Ordering::Relaxed) {
            continue;
        }

        let payload = encode_pcm_le(&samples);
        if payload.len() < min_chunk_bytes {
            debug!("dropping {}-byte window as silence", payload.len());
            continue;
        }
        let chunk = AudioChunk {
            sequence_index,
            duration_ms: samples.len() as u64 * 1000 / TARGET_SAMPLE_RATE as u64,
            captured_at: Utc::now(),
            payload,
        };
        sequence_index += 1;
        if sink.send(chunk).is_err() {
            // Receiver gone; nothing left to capture for.
            return;
        }
        chunks_sent.fetch_add(1, Ordering::Relaxed);
    }
}

fn encode_pcm_le(samples: &[i16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        payload.extend_from_slice(&sample.to_le_bytes());
    }
    payload
}

/// Open the default microphone, downmixed to 16 kHz mono i16.
fn open_mic_stream(
    buffer: Arc<Mutex<Vec<i16>>>,
    stop: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    rms: Arc<AtomicU32>,
) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(DeviceError::NotFound)?;
    let config = device
        .default_input_config()
        .map_err(map_config_error)?;

    let sample_rate = config.sample_rate();
    let channels = config.channels() as usize;
    let resample_ratio = TARGET_SAMPLE_RATE as f64 / sample_rate as f64;
    let err_fn = |err| warn!("audio stream error: {err}");

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _: &_| {
                    if stop.load(Ordering::Relaxed) || pause.load(Ordering::Relaxed) {
                        return;
                    }
                    let mono: Vec<i16> = data
                        .chunks(channels)
                        .map(|frame| {
                            let avg = frame.iter().sum::<f32>() / channels as f32;
                            (avg.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
                        })
                        .collect();
                    let resampled = resample(&mono, resample_ratio);
                    store_rms(&rms, &resampled);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend(resampled);
                    }
                },
                err_fn,
                None,
            )
            .map_err(map_build_error)?,
        cpal::SampleFormat::I16 => device
            .build_input_stream(
                &config.into(),
                move |data: &[i16], _: &_| {
                    if stop.load(Ordering::Relaxed) || pause.load(Ordering::Relaxed) {
                        return;
                    }
                    let mono: Vec<i16> = data
                        .chunks(channels)
                        .map(|frame| {
                            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                            (sum / channels as i32) as i16
                        })
                        .collect();
                    let resampled = resample(&mono, resample_ratio);
                    store_rms(&rms, &resampled);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend(resampled);
                    }
                },
                err_fn,
                None,
            )
            .map_err(map_build_error)?,
        other => {
            return Err(DeviceError::Backend(format!(
                "unsupported sample format {other:?}"
            )))
        }
    };

    stream.play().map_err(|e| DeviceError::Backend(e.to_string()))?;
    Ok(stream)
}

/// Linear-interpolation downsampler; passes through when already at or
/// below the target rate.
fn resample(samples: &[i16], ratio: f64) -> Vec<i16> {
    if ratio >= 1.0 || samples.is_empty() {
        return samples.to_vec();
    }
    let new_len = (samples.len() as f64 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx0 = src_idx as usize;
            let idx1 = (idx0 + 1).min(samples.len() - 1);
            let frac = src_idx - idx0 as f64;
            let s0 = samples[idx0] as f64;
            let s1 = samples[idx1] as f64;
            (s0 + (s1 - s0) * frac) as i16
        })
        .collect()
}

fn store_rms(rms: &AtomicU32, samples: &[i16]) {
    if samples.is_empty() {
        return;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64 / 32768.0).powi(2)).sum();
    let value = (sum_sq / samples.len() as f64).sqrt() as f32;
    rms.store(value.to_bits(), Ordering::Relaxed);
}

fn map_config_error(e: cpal::DefaultStreamConfigError) -> DeviceError {
    match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => DeviceError::Busy,
        cpal::DefaultStreamConfigError::BackendSpecific { err } => classify_backend(&err.description),
        other => DeviceError::Backend(other.to_string()),
    }
}

fn map_build_error(e: cpal::BuildStreamError) -> DeviceError {
    match e {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceError::Busy,
        cpal::BuildStreamError::BackendSpecific { err } => classify_backend(&err.description),
        other => DeviceError::Backend(other.to_string()),
    }
}

fn classify_backend(description: &str) -> DeviceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("access denied") {
        DeviceError::PermissionDenied
    } else if lower.contains("busy") || lower.contains("in use") {
        DeviceError::Busy
    } else {
        DeviceError::Backend(description.to_string())
    }
}

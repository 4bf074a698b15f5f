//! cpal-backed implementation of the platform audio seam.
//!
//! Capture runs at the device's native rate and channel count, gets downmixed
//! to mono, resampled to the wire rate with rubato, and chunked into fixed
//! blocks inside the cpal callback. Playback goes the other way: wire-rate
//! buffers are resampled up to the device rate and drained by the output
//! callback from a shared queue.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{error, info};
use voice_realtime::{
    capture::{AudioDevices, BlockBuffer, CaptureSource},
    codec::SAMPLE_RATE_HZ,
    error::VoiceError,
    playback::AudioSink,
};

/// Fixed input chunk size handed to rubato per call.
const RESAMPLER_CHUNK: usize = 512;

/// Poll interval while waiting for the output queue to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Wrapper to make `cpal::Stream` Send.
///
/// `cpal::Stream` is `!Send` on some platforms due to internal raw pointers,
/// but we only hold it alive; the audio callback runs on cpal's own thread.
struct SendStream(#[allow(dead_code)] cpal::Stream);

// SAFETY: the stream is stored only to keep it alive and is never accessed
// from another thread, only dropped.
unsafe impl Send for SendStream {}

/// Streaming mono resampler that accepts arbitrarily sized input.
///
/// rubato's fixed-input resamplers want exact chunk sizes; device callbacks
/// deliver whatever the hardware felt like. Input is buffered until a full
/// chunk is available, and `flush` drains the remainder.
struct ChunkedResampler {
    inner: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl ChunkedResampler {
    fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let inner = if in_rate == out_rate {
            None
        } else {
            Some(FastFixedIn::<f32>::new(
                out_rate as f64 / in_rate as f64,
                1.0,
                PolynomialDegree::Cubic,
                RESAMPLER_CHUNK,
                1,
            )?)
        };
        Ok(Self {
            inner,
            pending: Vec::new(),
        })
    }

    fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);
        let chunk_size = resampler.input_frames_next();
        let mut out = Vec::new();
        while self.pending.len() >= chunk_size {
            let rest = self.pending.split_off(chunk_size);
            let input = std::mem::replace(&mut self.pending, rest);
            match resampler.process(&[input], None) {
                Ok(frames) => out.extend_from_slice(&frames[0]),
                Err(e) => error!(error = %e, "resampler process failed"),
            }
        }
        out
    }

    /// Resamples whatever partial chunk is still buffered.
    fn flush(&mut self) -> Vec<f32> {
        let Some(resampler) = self.inner.as_mut() else {
            return Vec::new();
        };
        if self.pending.is_empty() {
            return Vec::new();
        }
        let input = std::mem::take(&mut self.pending);
        match resampler.process_partial(Some(&[input]), None) {
            Ok(frames) => frames.into_iter().next().unwrap_or_default(),
            Err(e) => {
                error!(error = %e, "resampler flush failed");
                Vec::new()
            }
        }
    }
}

/// Default-device audio I/O via cpal.
pub struct CpalAudio;

impl CpalAudio {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalAudio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioDevices for CpalAudio {
    async fn open_capture(&self) -> Result<Box<dyn CaptureSource>, VoiceError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or_else(|| {
            VoiceError::PermissionDenied("no input device available".to_string())
        })?;
        let device_config = device.default_input_config().map_err(|e| {
            VoiceError::PermissionDenied(format!("input device unavailable: {}", e))
        })?;

        let native_rate = device_config.sample_rate().0;
        let channels = device_config.channels() as usize;
        let stream_config = cpal::StreamConfig {
            channels: device_config.channels(),
            sample_rate: device_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            native_rate,
            channels,
            "opening capture device"
        );

        let mut resampler = ChunkedResampler::new(native_rate, SAMPLE_RATE_HZ)
            .map_err(|e| VoiceError::PermissionDenied(format!("capture resampler: {}", e)))?;
        let mut blocks = BlockBuffer::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = if channels > 1 {
                        data.chunks_exact(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect::<Vec<f32>>()
                    } else {
                        data.to_vec()
                    };
                    let resampled = resampler.process(&mono);
                    for block in blocks.push(&resampled) {
                        if tx.send(block).is_err() {
                            // Session gone; the stream is about to be dropped.
                            return;
                        }
                    }
                },
                |err| error!(error = %err, "input stream error"),
                None,
            )
            .map_err(|e| VoiceError::PermissionDenied(format!("microphone access: {}", e)))?;
        stream
            .play()
            .map_err(|e| VoiceError::PermissionDenied(format!("microphone start: {}", e)))?;

        Ok(Box::new(CpalCapture {
            rx,
            _stream: SendStream(stream),
        }))
    }

    async fn open_playback(&self) -> Result<Box<dyn AudioSink>, VoiceError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or_else(|| {
            VoiceError::PermissionDenied("no output device available".to_string())
        })?;
        let device_config = device.default_output_config().map_err(|e| {
            VoiceError::PermissionDenied(format!("output device unavailable: {}", e))
        })?;

        let native_rate = device_config.sample_rate().0;
        let channels = device_config.channels() as usize;
        let stream_config = cpal::StreamConfig {
            channels: device_config.channels(),
            sample_rate: device_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            native_rate,
            channels,
            "opening playback device"
        );

        let resampler = ChunkedResampler::new(SAMPLE_RATE_HZ, native_rate)
            .map_err(|e| VoiceError::PermissionDenied(format!("playback resampler: {}", e)))?;
        let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));

        let callback_queue = queue.clone();
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut queue = callback_queue.lock().unwrap();
                    for frame in data.chunks_mut(channels) {
                        let sample = queue.pop_front().unwrap_or(0.0);
                        for out in frame {
                            *out = sample;
                        }
                    }
                },
                |err| error!(error = %err, "output stream error"),
                None,
            )
            .map_err(|e| VoiceError::PermissionDenied(format!("speaker access: {}", e)))?;
        stream
            .play()
            .map_err(|e| VoiceError::PermissionDenied(format!("speaker start: {}", e)))?;

        Ok(Box::new(CpalSink {
            queue,
            resampler,
            _stream: SendStream(stream),
        }))
    }
}

struct CpalCapture {
    rx: mpsc::UnboundedReceiver<Vec<f32>>,
    _stream: SendStream,
}

#[async_trait]
impl CaptureSource for CpalCapture {
    async fn next_block(&mut self) -> Option<Vec<f32>> {
        self.rx.recv().await
    }
}

struct CpalSink {
    queue: Arc<Mutex<VecDeque<f32>>>,
    resampler: ChunkedResampler,
    _stream: SendStream,
}

/// Empties the output queue when dropped while armed. The playback queue
/// implements barge-in by dropping the in-flight `play` future, and the
/// remaining queued samples must fall silent with it.
struct ClearOnDrop {
    queue: Arc<Mutex<VecDeque<f32>>>,
    armed: bool,
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.queue.lock().unwrap().clear();
        }
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&mut self, samples: &[f32]) -> anyhow::Result<()> {
        let mut resampled = self.resampler.process(samples);
        resampled.extend(self.resampler.flush());
        if resampled.is_empty() {
            return Ok(());
        }

        let mut guard = ClearOnDrop {
            queue: self.queue.clone(),
            armed: true,
        };
        self.queue.lock().unwrap().extend(resampled);

        // Resolve only once the device has drained the buffer.
        loop {
            if self.queue.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        guard.armed = false;
        Ok(())
    }
}

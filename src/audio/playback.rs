//! Playback feeding: draining the jitter buffer on a fixed cadence.
//!
//! The feeder runs on its own thread, ticks roughly every 15 ms, asks
//! the jitter buffer how many whole frames the current watermark state
//! allows, concatenates them, and hands the chunk to the playback sink.
//! Partial frames are never delivered. When the buffer is gated or
//! empty the feeder waits out the tick instead of busy-spinning.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use dasp_sample::FromSample;
use tracing::{error, info, warn};

use super::jitter::{JitterConsumer, Pop};

/// Target cadence of the feeder loop.
pub const TICK: Duration = Duration::from_millis(15);

/// How long a pop may block when the quota says frames should be there.
const POP_TIMEOUT: Duration = Duration::from_millis(5);

/// Destination for drained PCM. The production implementation drives a
/// cpal output stream; tests use an in-memory sink.
pub trait PlaybackSink {
    /// (Re)open the sink for the given rate. Called before the first
    /// write and again whenever the codec switches rate families.
    fn configure(&mut self, sample_rate: u32) -> Result<()>;

    /// Deliver one chunk of whole frames.
    fn write(&mut self, samples: &[i16]) -> Result<()>;
}

/// Drains the jitter buffer toward a [`PlaybackSink`] on a fixed cadence.
pub struct PlaybackFeeder<S: PlaybackSink> {
    consumer: JitterConsumer,
    sink: S,
    /// Rate requested by the ingestion path (codec tag or preamble).
    desired_rate: Arc<AtomicU32>,
    current_rate: u32,
    stop: Arc<AtomicBool>,
}

impl<S: PlaybackSink> PlaybackFeeder<S> {
    /// Spawn the feeder thread. The sink is built inside the thread via
    /// `make_sink` because audio streams are not generally `Send`.
    pub fn start<F>(
        consumer: JitterConsumer,
        desired_rate: Arc<AtomicU32>,
        stop: Arc<AtomicBool>,
        make_sink: F,
    ) -> Result<JoinHandle<()>>
    where
        F: FnOnce() -> Result<S> + Send + 'static,
        S: 'static,
    {
        let handle = std::thread::Builder::new()
            .name("playback-feeder".to_string())
            .spawn(move || {
                let sink = match make_sink() {
                    Ok(sink) => sink,
                    Err(e) => {
                        error!("failed to open playback sink: {e:?}");
                        return;
                    }
                };
                let feeder = PlaybackFeeder {
                    consumer,
                    sink,
                    desired_rate,
                    current_rate: 0,
                    stop,
                };
                feeder.run();
            })
            .context("failed to spawn playback feeder thread")?;
        Ok(handle)
    }

    fn run(mut self) {
        info!("playback feeder started");
        let mut next_tick = Instant::now() + TICK;

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }

            if let Err(e) = self.sync_rate() {
                error!("playback sink failure, stopping feeder: {e:?}");
                break;
            }

            let quota = self.consumer.drain_quota(TICK);
            if quota > 0 {
                match self.drain(quota) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!("jitter buffer released, feeder exiting");
                        break;
                    }
                    Err(e) => {
                        error!("playback sink failure, stopping feeder: {e:?}");
                        break;
                    }
                }
            }

            // Hold the cadence regardless of how much the drain did.
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            }
            next_tick += TICK;
        }
        info!("playback feeder stopped");
    }

    /// Pull up to `quota` whole frames and deliver them as one chunk.
    /// Returns false when the producer has disconnected.
    fn drain(&mut self, quota: usize) -> Result<bool> {
        let mut chunk: Vec<i16> = Vec::new();
        for _ in 0..quota {
            match self.consumer.pop(POP_TIMEOUT) {
                Pop::Frame(frame) => chunk.extend_from_slice(&frame.samples),
                Pop::Empty => break,
                Pop::Disconnected => {
                    if !chunk.is_empty() {
                        self.sink.write(&chunk)?;
                    }
                    return Ok(false);
                }
            }
        }
        if !chunk.is_empty() {
            self.sink.write(&chunk)?;
        }
        Ok(true)
    }

    fn sync_rate(&mut self) -> Result<()> {
        let desired = self.desired_rate.load(Ordering::Acquire);
        if desired != 0 && desired != self.current_rate {
            info!(
                from = self.current_rate,
                to = desired,
                "switching playback rate"
            );
            self.sink.configure(desired)?;
            self.current_rate = desired;
        }
        Ok(())
    }
}

/// Chunks of playback audio queued toward the cpal callback.
const SINK_RING_CAPACITY: usize = 64;

/// Playback sink backed by the default cpal output device.
///
/// Written chunks go through an SPSC ring; the device callback drains it
/// and fills with silence when no data is ready.
pub struct CpalSink {
    _stream: Option<Stream>,
    producer: Option<rtrb::Producer<Vec<i16>>>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self {
            _stream: None,
            producer: None,
        }
    }

    fn build_stream<T>(
        device: &Device,
        config: &StreamConfig,
        mut consumer: rtrb::Consumer<Vec<i16>>,
    ) -> Result<Stream>
    where
        T: cpal::Sample + cpal::SizedSample + FromSample<i16>,
    {
        let mut pending: Vec<i16> = Vec::new();
        let mut index = 0;

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for slot in data.iter_mut() {
                        let sample = if index >= pending.len() {
                            match consumer.pop() {
                                Ok(chunk) => {
                                    pending = chunk;
                                    index = 0;
                                    if pending.is_empty() {
                                        0
                                    } else {
                                        index += 1;
                                        pending[0]
                                    }
                                }
                                Err(_) => 0,
                            }
                        } else {
                            let s = pending[index];
                            index += 1;
                            s
                        };
                        *slot = T::from_sample(sample);
                    }
                },
                move |err| {
                    error!("audio output error: {err}");
                },
                None,
            )
            .context("failed to build output stream")?;

        Ok(stream)
    }
}

impl Default for CpalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSink for CpalSink {
    fn configure(&mut self, sample_rate: u32) -> Result<()> {
        // Drop the previous stream before opening at the new rate.
        self._stream = None;
        self.producer = None;

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no output device available")?;
        info!(
            "using output device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let default_config = device
            .default_output_config()
            .context("failed to get default output config")?;

        let config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) = rtrb::RingBuffer::<Vec<i16>>::new(SINK_RING_CAPACITY);

        let stream = match default_config.sample_format() {
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, consumer)?,
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, consumer)?,
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, consumer)?,
            format => anyhow::bail!("unsupported sample format: {format:?}"),
        };

        stream.play().context("failed to start output stream")?;
        info!(sample_rate, "audio output ready");

        self._stream = Some(stream);
        self.producer = Some(producer);
        Ok(())
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        let producer = self
            .producer
            .as_mut()
            .context("playback sink not configured")?;
        if producer.push(samples.to_vec()).is_err() {
            warn!("playback ring full, dropping chunk");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::PcmFrame;
    use crate::audio::jitter::{JitterConfig, Push, jitter_buffer};
    use std::sync::Mutex;

    /// Sink that records everything written to it.
    struct MemorySink {
        written: Arc<Mutex<Vec<i16>>>,
        configured_rate: Arc<AtomicU32>,
    }

    impl PlaybackSink for MemorySink {
        fn configure(&mut self, sample_rate: u32) -> Result<()> {
            self.configured_rate.store(sample_rate, Ordering::Release);
            Ok(())
        }

        fn write(&mut self, samples: &[i16]) -> Result<()> {
            self.written.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }
    }

    // Watermarks disabled so every queued frame drains.
    fn open_config() -> JitterConfig {
        JitterConfig {
            prebuffer_ms: 0,
            min_buffer_ms: 0,
            max_buffer_ms: 10_000,
            capacity: 64,
        }
    }

    #[test]
    fn test_feeder_round_trip_preserves_order() {
        let (producer, consumer) = jitter_buffer(open_config());

        let mut expected: Vec<i16> = Vec::new();
        for seq in 0..8u32 {
            let samples: Vec<i16> = (0..60).map(|i| (seq as i16) * 100 + i as i16).collect();
            expected.extend_from_slice(&samples);
            assert_eq!(
                producer.push(PcmFrame::new(seq, samples), 8000),
                Push::Queued
            );
        }

        let written = Arc::new(Mutex::new(Vec::new()));
        let configured_rate = Arc::new(AtomicU32::new(0));
        let desired_rate = Arc::new(AtomicU32::new(8000));
        let stop = Arc::new(AtomicBool::new(false));

        let sink_written = written.clone();
        let sink_rate = configured_rate.clone();
        let handle = PlaybackFeeder::start(
            consumer,
            desired_rate,
            stop.clone(),
            move || {
                Ok(MemorySink {
                    written: sink_written,
                    configured_rate: sink_rate,
                })
            },
        )
        .unwrap();

        // Dropping the producer ends the session once the queue drains.
        drop(producer);
        handle.join().unwrap();

        assert_eq!(configured_rate.load(Ordering::Acquire), 8000);
        assert_eq!(*written.lock().unwrap(), expected);
    }

    #[test]
    fn test_feeder_stops_on_flag() {
        let (_producer, consumer) = jitter_buffer(open_config());
        let stop = Arc::new(AtomicBool::new(true));
        let handle = PlaybackFeeder::start(
            consumer,
            Arc::new(AtomicU32::new(8000)),
            stop,
            || {
                Ok(MemorySink {
                    written: Arc::new(Mutex::new(Vec::new())),
                    configured_rate: Arc::new(AtomicU32::new(0)),
                })
            },
        )
        .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_gated_buffer_writes_nothing() {
        let (producer, consumer) = jitter_buffer(JitterConfig {
            prebuffer_ms: 10_000,
            ..open_config()
        });
        for seq in 0..4u32 {
            producer.push(PcmFrame::new(seq, vec![1; 60]), 8000);
        }

        let written = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let sink_written = written.clone();
        let handle = PlaybackFeeder::start(
            consumer,
            Arc::new(AtomicU32::new(8000)),
            stop.clone(),
            move || {
                Ok(MemorySink {
                    written: sink_written,
                    configured_rate: Arc::new(AtomicU32::new(0)),
                })
            },
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(80));
        stop.store(true, Ordering::Release);
        handle.join().unwrap();

        assert!(written.lock().unwrap().is_empty());
    }
}

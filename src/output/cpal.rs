//! CPAL audio device output

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SupportedStreamConfig};
use rtrb::{Consumer, Producer, RingBuffer};

use super::AudioOutput;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("failed to build output stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("failed to start output stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
    #[error("unsupported sample format {0:?}")]
    UnsupportedFormat(SampleFormat),
    #[error("output stream thread exited before starting")]
    ThreadExited,
}

/// Streams blocks to a CPAL device.
///
/// The CPAL stream runs on its own thread; pushed blocks go through a ring
/// buffer that the stream's callback drains. Channels of the incoming
/// blocks are mapped onto the device's channels, duplicating the last
/// source channel when the device has more.
pub struct CpalOutput {
    buffer: Producer<f32>,
    source_channels: usize,
    device_channels: usize,
    samples_consumed: Arc<AtomicUsize>,
    had_underrun: Arc<AtomicBool>,
}

impl CpalOutput {
    /// Open `device` with `config`, expecting blocks with `source_channels`.
    pub fn new(
        device: &cpal::Device,
        config: &SupportedStreamConfig,
        source_channels: usize,
    ) -> Result<Self, OutputError> {
        let device_channels = config.channels() as usize;
        let sample_format = config.sample_format();
        let stream_config = config.config();
        let sample_rate = stream_config.sample_rate.0;

        // ~100ms of audio to absorb scheduling jitter
        let buffer_samples = ((sample_rate as f32 * 0.1) as usize) * device_channels;
        let buffer_size = buffer_samples.next_power_of_two().max(8192);
        let (producer, consumer) = RingBuffer::<f32>::new(buffer_size);

        let samples_consumed = Arc::new(AtomicUsize::new(0));
        let had_underrun = Arc::new(AtomicBool::new(false));

        let (started_tx, started_rx) = mpsc::sync_channel(1);
        let device = device.clone();
        let consumed = samples_consumed.clone();
        let underrun = had_underrun.clone();
        std::thread::spawn(move || {
            let stream = build_stream(&device, sample_format, &stream_config, consumer, consumed, underrun)
                .and_then(|stream| stream.play().map(|_| stream).map_err(OutputError::from));
            match stream {
                Ok(stream) => {
                    let _stream = stream;
                    let _ = started_tx.send(Ok(()));
                    // the stream lives as long as this thread
                    loop {
                        std::thread::park();
                    }
                }
                Err(e) => {
                    let _ = started_tx.send(Err(e));
                }
            }
        });

        started_rx.recv().map_err(|_| OutputError::ThreadExited)??;
        tracing::debug!(sample_rate, device_channels, source_channels, "cpal output started");

        Ok(Self {
            buffer: producer,
            source_channels: source_channels.max(1),
            device_channels,
            samples_consumed,
            had_underrun,
        })
    }

    /// Returns how many samples have been played
    #[inline]
    pub fn samples_consumed(&self) -> usize {
        self.samples_consumed.load(Ordering::Relaxed)
    }

    /// Returns available space in the buffer (in samples)
    #[inline]
    pub fn buffer_available(&self) -> usize {
        self.buffer.slots()
    }

    /// Check and clear the underrun flag
    pub fn check_underrun(&self) -> bool {
        self.had_underrun.swap(false, Ordering::Relaxed)
    }
}

impl AudioOutput for CpalOutput {
    fn push(&mut self, block: &[f32]) -> bool {
        let frames = block.len() / self.source_channels;
        let needed = frames * self.device_channels;
        if self.buffer.slots() < needed {
            // skip the whole block rather than write part of it
            return false;
        }

        for frame in block.chunks_exact(self.source_channels) {
            for ch in 0..self.device_channels {
                let _ = self.buffer.push(frame[ch.min(self.source_channels - 1)]);
            }
        }
        true
    }
}

fn build_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    stream_config: &cpal::StreamConfig,
    mut consumer: Consumer<f32>,
    samples_consumed: Arc<AtomicUsize>,
    had_underrun: Arc<AtomicBool>,
) -> Result<cpal::Stream, OutputError> {
    let on_error = |err: cpal::StreamError| tracing::error!(error = %err, "cpal stream error");
    let mut next = move || {
        consumer.pop().unwrap_or_else(|_| {
            had_underrun.store(true, Ordering::Relaxed);
            0.0
        })
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            stream_config,
            move |data: &mut [f32], _| {
                data.iter_mut().for_each(|s| *s = next());
                samples_consumed.fetch_add(data.len(), Ordering::Relaxed);
            },
            on_error,
            None,
        )?,
        SampleFormat::I16 => device.build_output_stream(
            stream_config,
            move |data: &mut [i16], _| {
                data.iter_mut()
                    .for_each(|s| *s = (next().clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
                samples_consumed.fetch_add(data.len(), Ordering::Relaxed);
            },
            on_error,
            None,
        )?,
        SampleFormat::U16 => device.build_output_stream(
            stream_config,
            move |data: &mut [u16], _| {
                data.iter_mut().for_each(|s| {
                    *s = ((next().clamp(-1.0, 1.0) + 1.0) * 0.5 * u16::MAX as f32) as u16
                });
                samples_consumed.fetch_add(data.len(), Ordering::Relaxed);
            },
            on_error,
            None,
        )?,
        other => return Err(OutputError::UnsupportedFormat(other)),
    };
    Ok(stream)
}

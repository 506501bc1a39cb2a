//! Microphone capture and framing
//!
//! Capture devices deliver blocks of whatever size the driver likes.
//! [`FrameCapture`] turns them into exact 960-sample frames, carrying the
//! remainder over to the next block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, Stream, StreamConfig};
use parlor_common::voice::{AudioFrame, FRAME_LEN, VOICE_SAMPLE_RATE, VoiceTarget};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::VoiceError;

use super::platform::{find_input_device, pick_stream_format};

// =============================================================================
// Frame Capture
// =============================================================================

/// Re-blocks arbitrary sample blocks into [`AudioFrame`]s
#[derive(Debug)]
pub struct FrameCapture {
    carry: Vec<f32>,
    next_position: u64,
    target: VoiceTarget,
}

impl Default for FrameCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCapture {
    pub fn new() -> Self {
        Self {
            carry: Vec::with_capacity(FRAME_LEN),
            next_position: 0,
            target: VoiceTarget::default(),
        }
    }

    /// Append a block and return every frame it completes, oldest first
    ///
    /// Positions increase by one per emitted frame. An empty block changes
    /// nothing.
    pub fn push(&mut self, block: &[f32]) -> Vec<AudioFrame> {
        if block.is_empty() {
            return Vec::new();
        }

        let mut frames = Vec::with_capacity((self.carry.len() + block.len()) / FRAME_LEN);
        let mut rest = block;

        if !self.carry.is_empty() {
            let needed = FRAME_LEN - self.carry.len();
            if rest.len() < needed {
                self.carry.extend_from_slice(rest);
                return frames;
            }
            let (head, tail) = rest.split_at(needed);
            self.carry.extend_from_slice(head);
            let samples = std::mem::replace(&mut self.carry, Vec::with_capacity(FRAME_LEN));
            frames.push(self.frame(samples));
            rest = tail;
        }

        let mut chunks = rest.chunks_exact(FRAME_LEN);
        for chunk in &mut chunks {
            frames.push(self.frame(chunk.to_vec()));
        }
        self.carry.extend_from_slice(chunks.remainder());
        frames
    }

    fn frame(&mut self, samples: Vec<f32>) -> AudioFrame {
        let position = self.next_position;
        self.next_position += 1;
        match AudioFrame::new(samples, self.target, position) {
            Ok(frame) => frame,
            // Every caller hands over exactly FRAME_LEN samples
            Err(_) => AudioFrame::silence(self.target, position),
        }
    }

    /// Samples carried over, always fewer than one frame
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Drop the carry-over; positions keep counting
    pub fn reset(&mut self) {
        self.carry.clear();
    }

    /// Target stamped on frames emitted from now on
    pub fn set_target(&mut self, target: VoiceTarget) {
        self.target = target;
    }

    pub fn next_position(&self) -> u64 {
        self.next_position
    }
}

// =============================================================================
// Microphone
// =============================================================================

/// Receivers fed by a [`MicrophoneSource`]
pub struct CaptureChannels {
    /// Mono f32 blocks as the driver delivers them
    pub blocks: mpsc::UnboundedReceiver<Vec<f32>>,
    /// Stream failures; the source is unusable after one
    pub errors: mpsc::UnboundedReceiver<String>,
}

/// Microphone capture through cpal, downmixed to mono at 48kHz
///
/// Not `Send`: create and keep it on the thread that runs the voice session.
pub struct MicrophoneSource {
    stream: Stream,
    active: Arc<AtomicBool>,
}

impl MicrophoneSource {
    /// Open an input device
    ///
    /// # Arguments
    /// * `device_name` - Device name, or empty string for system default
    pub fn open(device_name: &str) -> Result<(Self, CaptureChannels), VoiceError> {
        let device = find_input_device(device_name)
            .ok_or_else(|| VoiceError::Device("input device not found".into()))?;

        let configs: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| VoiceError::Device(format!("failed to get supported configs: {}", e)))?
            .collect();
        let (channels, format) = pick_stream_format(&configs, VOICE_SAMPLE_RATE).ok_or_else(|| {
            VoiceError::Device(
                "input device doesn't support 48kHz (required for voice chat)".into(),
            )
        })?;

        let config = StreamConfig {
            channels,
            sample_rate: VOICE_SAMPLE_RATE,
            buffer_size: cpal::BufferSize::Default,
        };

        let active = Arc::new(AtomicBool::new(false));
        let (block_tx, blocks) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let sinks = InputSinks {
            active: active.clone(),
            blocks: block_tx,
            errors: error_tx,
        };

        let stream = match format {
            SampleFormat::F32 => build_input_stream::<f32>(&device, &config, sinks),
            SampleFormat::I16 => build_input_stream::<i16>(&device, &config, sinks),
            SampleFormat::U16 => build_input_stream::<u16>(&device, &config, sinks),
            other => Err(VoiceError::Device(format!(
                "unsupported sample format: {:?}",
                other
            ))),
        }?;
        info!(channels, ?format, "microphone opened");

        Ok((Self { stream, active }, CaptureChannels { blocks, errors }))
    }

    pub fn start(&self) -> Result<(), VoiceError> {
        self.active.store(true, Ordering::SeqCst);
        self.stream
            .play()
            .map_err(|e| VoiceError::Device(format!("failed to start capture: {}", e)))
    }

    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.stream.pause();
        debug!("microphone stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

struct InputSinks {
    active: Arc<AtomicBool>,
    blocks: mpsc::UnboundedSender<Vec<f32>>,
    errors: mpsc::UnboundedSender<String>,
}

/// Input stream that downmixes interleaved channels to mono
fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    sinks: InputSinks,
) -> Result<Stream, VoiceError>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let InputSinks {
        active,
        blocks,
        errors,
    } = sinks;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::SeqCst) {
                    return;
                }
                let block: Vec<f32> = data
                    .chunks_exact(channels)
                    .map(|frame| {
                        frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / channels as f32
                    })
                    .collect();
                let _ = blocks.send(block);
            },
            move |err| {
                let _ = errors.send(format!("audio capture error: {}", err));
            },
            None,
        )
        .map_err(|e| VoiceError::Device(format!("failed to build input stream: {}", e)))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_reframed_with_carry() {
        let mut capture = FrameCapture::new();
        let input: Vec<f32> = (0..1100).map(|i| i as f32).collect();

        assert!(capture.push(&input[..500]).is_empty());
        assert_eq!(capture.pending(), 500);

        let frames = capture.push(&input[500..1000]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].position, 0);
        assert_eq!(frames[0].samples(), &input[..960]);
        assert_eq!(capture.pending(), 40);

        assert!(capture.push(&input[1000..1100]).is_empty());
        assert_eq!(capture.pending(), 140);
    }

    #[test]
    fn test_frames_concatenate_to_truncated_input() {
        let mut capture = FrameCapture::new();
        let sizes = [1, 959, 2000, 0, 37, 960, 3, 1500];
        let total: usize = sizes.iter().sum();
        let input: Vec<f32> = (0..total).map(|i| i as f32).collect();

        let mut frames = Vec::new();
        let mut offset = 0;
        for size in sizes {
            frames.extend(capture.push(&input[offset..offset + size]));
            offset += size;
        }

        let positions: Vec<u64> = frames.iter().map(|f| f.position).collect();
        let expected: Vec<u64> = (0..frames.len() as u64).collect();
        assert_eq!(positions, expected);

        let joined: Vec<f32> = frames.iter().flat_map(|f| f.samples().to_vec()).collect();
        let whole = total / FRAME_LEN * FRAME_LEN;
        assert_eq!(joined, input[..whole]);
        assert_eq!(capture.pending(), total - whole);
    }

    #[test]
    fn test_reset_discards_carry() {
        let mut capture = FrameCapture::new();
        capture.push(&[0.5; 700]);
        capture.reset();
        assert_eq!(capture.pending(), 0);

        capture.set_target(VoiceTarget::Shout);
        let frames = capture.push(&[0.25; FRAME_LEN]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].target, VoiceTarget::Shout);
        assert!(frames[0].samples().iter().all(|&s| s == 0.25));
        assert_eq!(capture.next_position(), 1);
    }
}

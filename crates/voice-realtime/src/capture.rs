//! Platform audio seam: capture source, playback sink factory, and the
//! fixed-size block accumulator for the outbound pipeline.

use crate::{codec::CAPTURE_BLOCK_SAMPLES, error::VoiceError, playback::AudioSink};
use async_trait::async_trait;

/// A stream of captured microphone audio in fixed-size blocks.
#[async_trait]
pub trait CaptureSource: Send {
    /// Waits for the next block of `CAPTURE_BLOCK_SAMPLES` float samples at
    /// 16 kHz mono, or `None` once the device has stopped.
    async fn next_block(&mut self) -> Option<Vec<f32>>;
}

/// Platform audio I/O, implemented by the host with whatever capture and
/// playback facility its platform provides.
#[async_trait]
pub trait AudioDevices: Send + Sync {
    /// Acquires the microphone. May suspend on an OS permission prompt;
    /// fails with [`VoiceError::PermissionDenied`] when access is refused.
    async fn open_capture(&self) -> Result<Box<dyn CaptureSource>, VoiceError>;

    /// Opens the playback sink used to render agent speech.
    async fn open_playback(&self) -> Result<Box<dyn AudioSink>, VoiceError>;
}

/// Accumulates arbitrarily sized device callbacks into exact
/// `CAPTURE_BLOCK_SAMPLES` blocks.
///
/// Device layers rarely deliver audio in the wire block size; hosts push
/// whatever the hardware hands them and forward each completed block.
#[derive(Default)]
pub struct BlockBuffer {
    pending: Vec<f32>,
}

impl BlockBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `samples` and returns every completed block, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut blocks = Vec::new();
        while self.pending.len() >= CAPTURE_BLOCK_SAMPLES {
            let rest = self.pending.split_off(CAPTURE_BLOCK_SAMPLES);
            blocks.push(std::mem::replace(&mut self.pending, rest));
        }
        blocks
    }

    /// Samples held back waiting for a full block.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_buffer_holds_partial_input() {
        let mut buffer = BlockBuffer::new();
        assert!(buffer.push(&vec![0.0; 1000]).is_empty());
        assert_eq!(buffer.pending_len(), 1000);
    }

    #[test]
    fn test_block_buffer_emits_exact_blocks() {
        let mut buffer = BlockBuffer::new();
        let blocks = buffer.push(&vec![0.25; CAPTURE_BLOCK_SAMPLES * 2 + 100]);
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.len() == CAPTURE_BLOCK_SAMPLES));
        assert_eq!(buffer.pending_len(), 100);
    }

    #[test]
    fn test_block_buffer_preserves_sample_order() {
        let mut buffer = BlockBuffer::new();
        let input: Vec<f32> = (0..CAPTURE_BLOCK_SAMPLES + 10).map(|i| i as f32).collect();
        let first_half = &input[..2000];
        let second_half = &input[2000..];

        assert!(buffer.push(first_half).is_empty());
        let blocks = buffer.push(second_half);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0][0], 0.0);
        assert_eq!(blocks[0][CAPTURE_BLOCK_SAMPLES - 1], (CAPTURE_BLOCK_SAMPLES - 1) as f32);
        assert_eq!(buffer.pending_len(), 10);
    }
}

//! Ordered, gapless playback of decoded agent audio.
//!
//! Chunks are queued in arrival order and rendered strictly one at a time
//! through a single [`AudioSink`]. An interruption flushes the queue and
//! aborts whatever is mid-render.

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

/// Renders one decoded buffer of 16 kHz mono samples.
///
/// `play` resolves when the buffer has finished rendering. Dropping the
/// returned future must stop the sound; that cancellation is how the queue
/// implements barge-in flushes.
#[async_trait]
pub trait AudioSink: Send {
    async fn play(&mut self, samples: &[f32]) -> anyhow::Result<()>;
}

/// One decoded audio buffer awaiting playback.
pub struct PlaybackItem {
    pub samples: Vec<f32>,
    /// Opaque id of the originating server event.
    pub event_id: serde_json::Value,
}

enum Command {
    Enqueue(PlaybackItem),
    Flush,
}

/// FIFO playback queue driven by a single background task.
pub struct PlaybackQueue {
    cmd_tx: mpsc::UnboundedSender<Command>,
    playing: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PlaybackQueue {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let playing = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(sink, cmd_rx, playing.clone()));
        Self {
            cmd_tx,
            playing,
            task,
        }
    }

    /// Appends an item; draining begins immediately if the queue was idle.
    pub fn enqueue(&self, item: PlaybackItem) {
        let _ = self.cmd_tx.send(Command::Enqueue(item));
    }

    /// Clears all queued items and aborts in-flight playback.
    pub fn flush(&self) {
        let _ = self.cmd_tx.send(Command::Flush);
    }

    /// Whether a buffer is currently rendering or queued for render.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

impl Drop for PlaybackQueue {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut sink: Box<dyn AudioSink>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    playing: Arc<AtomicBool>,
) {
    let mut queue: VecDeque<PlaybackItem> = VecDeque::new();
    'outer: loop {
        // Idle until something arrives.
        while queue.is_empty() {
            playing.store(false, Ordering::SeqCst);
            match cmd_rx.recv().await {
                Some(Command::Enqueue(item)) => queue.push_back(item),
                Some(Command::Flush) => {}
                None => break 'outer,
            }
        }

        playing.store(true, Ordering::SeqCst);
        let Some(item) = queue.pop_front() else {
            continue;
        };
        let play = sink.play(&item.samples);
        tokio::pin!(play);
        loop {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Enqueue(next)) => queue.push_back(next),
                    Some(Command::Flush) => {
                        // Dropping `play` aborts the in-flight buffer.
                        queue.clear();
                        break;
                    }
                    None => break 'outer,
                },
                result = &mut play => {
                    if let Err(e) = result {
                        // One bad chunk must not wedge playback.
                        warn!(error = %e, event_id = %item.event_id, "skipping unplayable audio item");
                    }
                    break;
                }
            }
        }
    }
    playing.store(false, Ordering::SeqCst);
}

//! Image publication: memory-pressure guarding and ready-made sinks.
//!
//! The executor hands every finished image to [`publish_guarded`], which
//! consults a [`MemoryProbe`] first: while available memory sits below the
//! configured floor the publish is stalled with a bounded number of delays,
//! so a slow downstream consumer applies backpressure to the hardware loop
//! instead of exhausting memory. After the stall budget the image is
//! published regardless; dropping data is worse than overshooting the floor.
//!
//! Two sink implementations cover the common cases: [`BufferSink`] collects
//! into memory (tests, demos, small runs) and [`ChannelSink`] forwards into
//! an `mpsc` channel owned by the caller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::core::{ImageSink, TaggedImage};

// =============================================================================
// Memory Probes
// =============================================================================

/// Reports the memory headroom available for buffering images.
pub trait MemoryProbe: Send + Sync {
    /// Bytes of memory currently available to the process.
    fn available_bytes(&self) -> u64;
}

/// [`MemoryProbe`] backed by the operating system's memory accounting.
pub struct SystemMemoryProbe {
    system: std::sync::Mutex<sysinfo::System>,
}

impl SystemMemoryProbe {
    /// A probe over a fresh system handle.
    pub fn new() -> Self {
        Self {
            system: std::sync::Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_bytes(&self) -> u64 {
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.available_memory()
            }
            // A poisoned probe stops guarding rather than stalling forever.
            Err(_) => u64::MAX,
        }
    }
}

/// A probe that never reports pressure. Used by tests and demos where the
/// guard should stay out of the way.
pub fn unconstrained_probe() -> Arc<dyn MemoryProbe> {
    struct Unconstrained;
    impl MemoryProbe for Unconstrained {
        fn available_bytes(&self) -> u64 {
            u64::MAX
        }
    }
    Arc::new(Unconstrained)
}

// =============================================================================
// Guarded Publication
// =============================================================================

/// Stall policy applied before each publish.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PublishGuard {
    /// Floor below which publication stalls; 0 disables the guard.
    pub low_memory_floor_bytes: u64,
    /// Stalls tolerated before publishing regardless.
    pub max_stalls: u32,
    /// Delay per stall.
    pub stall_backoff: Duration,
}

/// Publishes one image, stalling first while memory is below the floor.
///
/// Publish failures are returned to the caller; they mark the image failed
/// but never end the run.
pub(crate) async fn publish_guarded(
    sink: &dyn ImageSink,
    memory: &dyn MemoryProbe,
    guard: &PublishGuard,
    image: TaggedImage,
) -> Result<()> {
    let mut stalls = 0u32;
    while guard.low_memory_floor_bytes > 0
        && memory.available_bytes() < guard.low_memory_floor_bytes
    {
        if stalls >= guard.max_stalls {
            warn!(
                stalls,
                floor = guard.low_memory_floor_bytes,
                "memory still low after stalling; publishing anyway"
            );
            break;
        }
        stalls += 1;
        debug!(stalls, "available memory below floor; delaying publication");
        tokio::time::sleep(guard.stall_backoff).await;
    }
    sink.publish(image).await
}

// =============================================================================
// Sinks
// =============================================================================

/// Collects published images in memory, in publication order.
///
/// Clones share the same buffer.
#[derive(Clone, Default)]
pub struct BufferSink {
    images: Arc<RwLock<Vec<TaggedImage>>>,
}

impl BufferSink {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub async fn images(&self) -> Vec<TaggedImage> {
        self.images.read().await.clone()
    }

    /// Number of images published so far.
    pub async fn len(&self) -> usize {
        self.images.read().await.len()
    }

    /// True while nothing has been published.
    pub async fn is_empty(&self) -> bool {
        self.images.read().await.is_empty()
    }
}

#[async_trait]
impl ImageSink for BufferSink {
    fn name(&self) -> &str {
        "buffer"
    }

    async fn publish(&self, image: TaggedImage) -> Result<()> {
        self.images.write().await.push(image);
        Ok(())
    }
}

/// Forwards published images into an `mpsc` channel.
///
/// Publishing waits for queue space, so the channel capacity bounds how far
/// the acquisition can run ahead of the consumer. A dropped receiver fails
/// the publish.
pub struct ChannelSink {
    tx: mpsc::Sender<TaggedImage>,
}

impl ChannelSink {
    /// A sink feeding the given channel.
    pub fn new(tx: mpsc::Sender<TaggedImage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ImageSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn publish(&self, image: TaggedImage) -> Result<()> {
        self.tx
            .send(image)
            .await
            .map_err(|_| anyhow!("image consumer disconnected"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PixelBuffer;
    use crate::metadata::ImageTags;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_image(marker: u8) -> TaggedImage {
        let mut tags = ImageTags::new();
        tags.put("marker", marker);
        TaggedImage::new(PixelBuffer::U8(vec![marker]), tags)
    }

    /// Reports low memory for the first `low_reads` calls, plenty afterwards.
    struct FlakyProbe {
        low_reads: u32,
        reads: AtomicU32,
    }

    impl MemoryProbe for FlakyProbe {
        fn available_bytes(&self) -> u64 {
            if self.reads.fetch_add(1, Ordering::SeqCst) < self.low_reads {
                1
            } else {
                u64::MAX
            }
        }
    }

    fn guard(max_stalls: u32) -> PublishGuard {
        PublishGuard {
            low_memory_floor_bytes: 1024,
            max_stalls,
            stall_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_buffer_sink_collects_in_order() {
        let sink = BufferSink::new();
        for marker in 0..3u8 {
            let published = sink.publish(test_image(marker)).await;
            assert!(published.is_ok());
        }
        let images = sink.images().await;
        assert_eq!(images.len(), 3);
        let markers: Vec<Option<&str>> = images.iter().map(|i| i.tags.get("marker")).collect();
        assert_eq!(markers, vec![Some("0"), Some("1"), Some("2")]);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_and_fails_when_closed() {
        let (tx, mut rx) = mpsc::channel(2);
        let sink = ChannelSink::new(tx);
        assert!(sink.publish(test_image(7)).await.is_ok());
        let received = rx.recv().await;
        assert!(received.is_some());

        drop(rx);
        assert!(sink.publish(test_image(8)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_stalls_until_memory_recovers() {
        let sink = BufferSink::new();
        let probe = FlakyProbe {
            low_reads: 3,
            reads: AtomicU32::new(0),
        };
        let outcome = publish_guarded(&sink, &probe, &guard(100), test_image(1)).await;
        assert!(outcome.is_ok());
        assert_eq!(sink.len().await, 1);
        assert_eq!(probe.reads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_proceeds_after_stall_budget() {
        let sink = BufferSink::new();
        let probe = FlakyProbe {
            low_reads: u32::MAX,
            reads: AtomicU32::new(0),
        };
        let outcome = publish_guarded(&sink, &probe, &guard(5), test_image(1)).await;
        assert!(outcome.is_ok(), "the image must be published regardless");
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn test_zero_floor_disables_guard() {
        let sink = BufferSink::new();
        let probe = FlakyProbe {
            low_reads: u32::MAX,
            reads: AtomicU32::new(0),
        };
        let guard = PublishGuard {
            low_memory_floor_bytes: 0,
            max_stalls: 5,
            stall_backoff: Duration::from_millis(10),
        };
        let outcome = publish_guarded(&sink, &probe, &guard, test_image(1)).await;
        assert!(outcome.is_ok());
        assert_eq!(
            probe.reads.load(Ordering::SeqCst),
            0,
            "a zero floor must not consult the probe"
        );
    }

    #[test]
    fn test_system_probe_reports_memory() {
        let probe = SystemMemoryProbe::new();
        assert!(probe.available_bytes() > 0);
    }
}

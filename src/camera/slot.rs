//! Single-slot "latest frame" exchange between the callback and consumers.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::frame::Frame;

/// Holds the most recently completed frame.
///
/// The lock only guards a pointer swap or an `Arc`-backed clone, so neither
/// side holds it for longer than a few instructions. The displaced frame is
/// dropped after the lock is released.
#[derive(Debug, Default)]
pub struct LatestFrameSlot {
    frame: Mutex<Option<Frame>>,
    published: AtomicU64,
}

impl LatestFrameSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame.
    pub fn publish(&self, frame: Frame) {
        let previous = self.frame.lock().replace(frame);
        self.published.fetch_add(1, Ordering::Relaxed);
        drop(previous);
    }

    /// Copy of the held frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.frame.lock().clone()
    }

    /// Drop the held frame.
    pub fn clear(&self) {
        let previous = self.frame.lock().take();
        drop(previous);
    }

    /// Frames published since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{FrameBuffer, FrameGeometry, PixelFormat};
    use std::sync::Arc;

    fn frame(id: u64, fill: u8) -> Frame {
        let geometry = FrameGeometry::new(4, 4, PixelFormat::Mono8).unwrap();
        let mut buffer = FrameBuffer::new(0, 16);
        buffer.fill(16, id).fill(fill);
        Frame::snapshot(&buffer, &geometry, id).unwrap()
    }

    #[test]
    fn empty_until_published() {
        let slot = LatestFrameSlot::new();
        assert!(slot.latest().is_none());
        slot.publish(frame(1, 1));
        assert_eq!(slot.latest().unwrap().frame_id, 1);
    }

    #[test]
    fn newest_frame_wins() {
        let slot = LatestFrameSlot::new();
        slot.publish(frame(1, 1));
        slot.publish(frame(2, 2));
        let latest = slot.latest().unwrap();
        assert_eq!(latest.frame_id, 2);
        assert!(latest.pixel_data.iter().all(|&b| b == 2));
        assert_eq!(slot.published(), 2);
    }

    #[test]
    fn clear_empties() {
        let slot = LatestFrameSlot::new();
        slot.publish(frame(1, 1));
        slot.clear();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn concurrent_reads_never_tear() {
        let slot = Arc::new(LatestFrameSlot::new());
        let writer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                for i in 0..500u64 {
                    slot.publish(frame(i, (i % 251) as u8));
                }
            })
        };
        for _ in 0..500 {
            if let Some(f) = slot.latest() {
                let first = f.pixel_data[0];
                assert!(f.pixel_data.iter().all(|&b| b == first));
                assert_eq!(f.pixel_data.len(), 16);
            }
        }
        writer.join().unwrap();
    }
}

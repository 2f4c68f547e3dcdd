//! Shared debug visualization slot.

use std::sync::Mutex;

use depthcv_core::DebugView;

/// Grayscale visualization of the latest cycle's disparity or confidence.
#[derive(Debug, Clone)]
pub struct DebugTexture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub view: DebugView,
}

/// Single-slot sink guarded by its own lock so debug readers never contend
/// with the frame exchange.
#[derive(Default)]
pub struct DebugSink {
    slot: Mutex<Option<DebugTexture>>,
}

impl DebugSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, texture: DebugTexture) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(texture);
    }

    /// Take the latest texture, leaving the slot empty.
    pub fn take(&self) -> Option<DebugTexture> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        slot.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_drains_the_slot() {
        let sink = DebugSink::new();
        assert!(sink.take().is_none());
        sink.publish(DebugTexture {
            data: vec![1, 2, 3],
            width: 3,
            height: 1,
            view: DebugView::Disparity,
        });
        assert!(sink.take().is_some());
        assert!(sink.take().is_none());
    }
}

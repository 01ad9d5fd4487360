//! Unsaved-data tracking hooks.
//!
//! Each operation channel reports how much local work the server has not yet
//! acknowledged or committed, so the application can warn before closing.

use crate::id::DocumentId;

/// Point-in-time view of a channel's unsaved local work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnsavedDataInfo {
    /// Ops submitted and awaiting an ack.
    pub in_flight_size: usize,
    /// Ops not yet acknowledged, in flight or queued.
    pub unacknowledged_size: usize,
    /// Ops not yet committed, acknowledged or not.
    pub uncommitted_size: usize,
    pub last_ack_version: u64,
    pub last_commit_version: u64,
}

impl UnsavedDataInfo {
    pub fn everything_committed(&self) -> bool {
        self.uncommitted_size == 0
    }
}

/// Receives unsaved-data reports for one document.
pub trait UnsavedDataListener {
    /// Called on every version advance.
    fn on_update(&mut self, info: &UnsavedDataInfo);

    /// Called once when the channel closes.
    fn on_close(&mut self, everything_committed: bool);
}

/// Creates one listener per document channel.
pub trait UnsavedDataListenerFactory {
    fn create(&mut self, document: &DocumentId) -> Box<dyn UnsavedDataListener>;

    /// The document's channel is gone; release anything held for it.
    fn destroy(&mut self, document: &DocumentId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_everything_committed() {
        let mut info = UnsavedDataInfo::default();
        assert!(info.everything_committed());
        info.uncommitted_size = 2;
        assert!(!info.everything_committed());
    }
}

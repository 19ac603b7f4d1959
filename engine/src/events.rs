use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use memory::MemorySnapshot;

/// Progress notifications published by the engine.
///
/// Each event is sent after the state change it describes is complete, so an
/// observer never sees a half-applied chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A run was appended to the history and its worker scheduled.
    Started { history_len: usize },
    /// A chunk was committed and the active run's peak persisted.
    ChunkCommitted {
        chunk_bytes: u64,
        total_bytes: u64,
        allocations: usize,
        snapshot: MemorySnapshot,
    },
    /// The host refused down to the floor; the run is over.
    Finalized { total_bytes: u64 },
    /// The run was stopped before the host refused.
    Cancelled { total_bytes: u64 },
    /// Stored history was wiped.
    HistoryCleared,
}

/// Receiving end of an engine subscription.
pub struct EngineEvents {
    receiver: Receiver<EngineEvent>,
}

impl EngineEvents {
    /// Returns the latest event if one is available, discarding older ones.
    pub fn drain_latest(&self) -> Option<EngineEvent> {
        let mut latest = None;
        while let Ok(event) = self.receiver.try_recv() {
            latest = Some(event);
        }
        latest
    }

    /// Returns every pending event without blocking.
    pub fn drain(&self) -> Vec<EngineEvent> {
        self.receiver.try_iter().collect()
    }

    /// Blocks up to `timeout` for the next event.
    ///
    /// `None` means the timeout elapsed or the engine was dropped.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<EngineEvent> {
        match self.receiver.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Vec<Sender<EngineEvent>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&mut self) -> EngineEvents {
        let (sender, receiver) = mpsc::channel();
        self.senders.push(sender);
        EngineEvents { receiver }
    }

    /// Sends to every live subscriber, dropping those that hung up.
    pub(crate) fn publish(&mut self, event: &EngineEvent) {
        self.senders.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_latest_keeps_newest() {
        let mut subscribers = Subscribers::default();
        let events = subscribers.subscribe();
        subscribers.publish(&EngineEvent::Started { history_len: 1 });
        subscribers.publish(&EngineEvent::Finalized { total_bytes: 7 });

        assert_eq!(events.drain_latest(), Some(EngineEvent::Finalized { total_bytes: 7 }));
        assert_eq!(events.drain_latest(), None);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut subscribers = Subscribers::default();
        let kept = subscribers.subscribe();
        drop(subscribers.subscribe());
        subscribers.publish(&EngineEvent::HistoryCleared);

        assert_eq!(subscribers.senders.len(), 1);
        assert_eq!(kept.drain(), vec![EngineEvent::HistoryCleared]);
    }
}

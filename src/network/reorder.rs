use std::collections::BTreeMap;

use crate::{AppError, AppResult};

/// Puts completed responses back into request order.
///
/// Slots are keyed by request sequence number. A slot holding `None` is a
/// request whose response was dropped; it is skipped when the cursor reaches
/// it so one failing request can never stall the connection.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next_sequence: u64,
    pending: BTreeMap<u64, Option<T>>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        ReorderBuffer {
            next_sequence: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Fills the slot for `sequence`. Filling a slot that was already filled or
    /// already released is an illegal state.
    pub fn complete(&mut self, sequence: u64, item: Option<T>) -> AppResult<()> {
        if sequence < self.next_sequence || self.pending.contains_key(&sequence) {
            return Err(AppError::IllegalStateError(format!(
                "response slot {} completed twice (next expected {})",
                sequence, self.next_sequence
            )));
        }
        self.pending.insert(sequence, item);
        Ok(())
    }

    /// Takes every item that is now in order, advancing past dropped slots.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(slot) = self.pending.remove(&self.next_sequence) {
            self.next_sequence += 1;
            if let Some(item) = slot {
                ready.push(item);
            }
        }
        ready
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Completed slots still waiting for an earlier one.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_releases_in_sequence_order() {
        let mut buffer = ReorderBuffer::new();
        buffer.complete(2, Some("c")).unwrap();
        buffer.complete(1, Some("b")).unwrap();
        assert!(buffer.drain_ready().is_empty());
        assert_eq!(buffer.pending_len(), 2);

        buffer.complete(0, Some("a")).unwrap();
        assert_eq!(buffer.drain_ready(), vec!["a", "b", "c"]);
        assert_eq!(buffer.next_sequence(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_dropped_slot_advances_cursor() {
        let mut buffer = ReorderBuffer::new();
        buffer.complete(0, Some(0)).unwrap();
        buffer.complete(2, Some(2)).unwrap();
        assert_eq!(buffer.drain_ready(), vec![0]);

        buffer.complete(1, None).unwrap();
        assert_eq!(buffer.drain_ready(), vec![2]);
        assert_eq!(buffer.next_sequence(), 3);
    }

    #[test]
    fn test_trailing_dropped_slots() {
        let mut buffer: ReorderBuffer<u32> = ReorderBuffer::new();
        buffer.complete(1, None).unwrap();
        buffer.complete(0, None).unwrap();
        assert!(buffer.drain_ready().is_empty());
        assert_eq!(buffer.next_sequence(), 2);
    }

    #[test]
    fn test_duplicate_and_stale_slots_are_rejected() {
        let mut buffer = ReorderBuffer::new();
        buffer.complete(1, Some('b')).unwrap();
        assert!(buffer.complete(1, Some('x')).is_err());

        buffer.complete(0, Some('a')).unwrap();
        buffer.drain_ready();
        assert!(matches!(
            buffer.complete(0, Some('y')),
            Err(AppError::IllegalStateError(_))
        ));
    }
}

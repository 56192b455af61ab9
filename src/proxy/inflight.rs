//! Broker-side message identifier allocation.
//!
//! Every acknowledgable message a client sends is forwarded under a fresh
//! broker identifier. The table remembers which client channel and which
//! client identifier it stood for until the broker's acknowledgment comes back.

use std::collections::HashMap;

use crate::channel::ChannelId;

/// Where a broker acknowledgment has to be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub client_message_id: u16,
    pub channel: ChannelId,
}

/// Broker identifiers in use, bounded by the session's in-flight limit
#[derive(Debug)]
pub struct PendingAckTable {
    entries: HashMap<u16, PendingAck>,
    max: u16,
    last: u16,
}

impl PendingAckTable {
    /// `max` is clamped to at least 1
    pub fn new(max: u16) -> Self {
        Self {
            entries: HashMap::new(),
            max: max.max(1),
            last: 0,
        }
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    /// Next free identifier after the last one handed out, cycling through
    /// `1..=max`. `None` when every identifier is in use.
    pub fn allocate(&mut self) -> Option<u16> {
        for _ in 0..self.max {
            self.last = if self.last >= self.max { 1 } else { self.last + 1 };
            if !self.entries.contains_key(&self.last) {
                return Some(self.last);
            }
        }
        None
    }

    pub fn insert(&mut self, broker_message_id: u16, pending: PendingAck) {
        self.entries.insert(broker_message_id, pending);
    }

    pub fn remove(&mut self, broker_message_id: u16) -> Option<PendingAck> {
        self.entries.remove(&broker_message_id)
    }

    /// Forget every entry that belongs to `channel`, returning how many there were
    pub fn remove_for_channel(&mut self, channel: ChannelId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, pending| pending.channel != channel);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(client_message_id: u16, channel: ChannelId) -> PendingAck {
        PendingAck {
            client_message_id,
            channel,
        }
    }

    #[test]
    fn test_allocation_cycles_and_skips_live_ids() {
        let channel = ChannelId::next();
        let mut table = PendingAckTable::new(3);

        for expected in 1..=3 {
            let id = table.allocate().expect("free id");
            assert_eq!(id, expected);
            table.insert(id, pending(100 + id, channel));
        }
        assert!(table.is_full());
        assert_eq!(table.allocate(), None);

        table.remove(2);
        assert_eq!(table.allocate(), Some(2));
        table.insert(2, pending(7, channel));

        table.remove(1);
        assert_eq!(table.allocate(), Some(1));
    }

    #[test]
    fn test_never_reuses_live_id() {
        let channel = ChannelId::next();
        let mut table = PendingAckTable::new(5);
        table.insert(2, pending(1, channel));
        table.insert(3, pending(1, channel));

        assert_eq!(table.allocate(), Some(1));
        table.insert(1, pending(1, channel));
        assert_eq!(table.allocate(), Some(4));
    }

    #[test]
    fn test_remove_for_channel() {
        let first = ChannelId::next();
        let second = ChannelId::next();
        let mut table = PendingAckTable::new(10);
        table.insert(1, pending(11, first));
        table.insert(2, pending(12, second));
        table.insert(3, pending(13, first));

        assert_eq!(table.remove_for_channel(first), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(2), Some(pending(12, second)));
        assert!(table.is_empty());
    }
}

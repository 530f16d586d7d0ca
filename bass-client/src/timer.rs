//! Delayed self-messages of a state machine.

use tokio::time::Instant;

use crate::message::Message;

/// What a delayed message is for. Cancelling uses this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    GattTxn,
    Connect,
    CancelSourceOperation(u32),
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    seq: u64,
    key: TimerKey,
    message: Message,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: Vec<Entry>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: TimerKey, deadline: Instant, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Entry {
            deadline,
            seq,
            key,
            message,
        });
    }

    /// Drop every timer with `key`. Returns how many were dropped.
    pub fn cancel(&mut self, key: TimerKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.key != key);
        before - self.entries.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Remove and return the messages due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Vec<Message> {
        let (mut due, pending): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.deadline <= now);
        self.entries = pending;
        due.sort_by_key(|e| (e.deadline, e.seq));
        due.into_iter().map(|e| e.message).collect()
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(TimerKey::Connect, now + Duration::from_secs(2), Message::Connect);
        timers.schedule(
            TimerKey::GattTxn,
            now + Duration::from_secs(1),
            Message::GattTxnTimeout { token: 1 },
        );
        timers.schedule(
            TimerKey::CancelSourceOperation(7),
            now + Duration::from_secs(5),
            Message::CancelPendingSourceOperation { broadcast_id: 7 },
        );

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(timers.pop_due(now).is_empty());

        let due = timers.pop_due(now + Duration::from_secs(2));
        assert_eq!(due, vec![Message::GattTxnTimeout { token: 1 }, Message::Connect]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel_by_key() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        let cancel = |broadcast_id| Message::CancelPendingSourceOperation { broadcast_id };
        timers.schedule(TimerKey::CancelSourceOperation(1), now, cancel(1));
        timers.schedule(TimerKey::CancelSourceOperation(2), now, cancel(2));

        assert_eq!(timers.cancel(TimerKey::CancelSourceOperation(1)), 1);
        assert_eq!(timers.cancel(TimerKey::GattTxn), 0);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.pop_due(now), vec![cancel(2)]);

        timers.schedule(TimerKey::Connect, now, Message::Connect);
        timers.clear();
        assert!(timers.is_empty());
    }
}

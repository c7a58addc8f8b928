//! Bounded stack of received control packets

use crate::protocol::ControlPacket;

/// Most packets held before new arrivals are dropped
pub const CONTROL_QUEUE_CAPACITY: usize = 256;

/// Outcome of [`ControlQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued, and the queue is now full
    Filled,
    /// Queue was already full, packet dropped
    Dropped,
}

/// Last-in-first-out queue; the newest control input is served first
#[derive(Debug, Default)]
pub struct ControlQueue {
    packets: Vec<ControlPacket>,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self {
            packets: Vec::with_capacity(CONTROL_QUEUE_CAPACITY),
        }
    }

    pub fn push(&mut self, packet: ControlPacket) -> PushOutcome {
        if self.packets.len() >= CONTROL_QUEUE_CAPACITY {
            return PushOutcome::Dropped;
        }
        self.packets.push(packet);
        if self.packets.len() >= CONTROL_QUEUE_CAPACITY {
            PushOutcome::Filled
        } else {
            PushOutcome::Queued
        }
    }

    pub fn pop(&mut self) -> Option<ControlPacket> {
        self.packets.pop()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(throttle: i16) -> ControlPacket {
        ControlPacket {
            throttle,
            ..Default::default()
        }
    }

    #[test]
    fn test_lifo_order() {
        let mut queue = ControlQueue::new();
        queue.push(packet(1));
        queue.push(packet(2));
        queue.push(packet(3));

        assert_eq!(queue.pop().map(|p| p.throttle), Some(3));
        assert_eq!(queue.pop().map(|p| p.throttle), Some(2));
        assert_eq!(queue.pop().map(|p| p.throttle), Some(1));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_bounded() {
        let mut queue = ControlQueue::new();
        for i in 0..CONTROL_QUEUE_CAPACITY - 1 {
            assert_eq!(queue.push(packet(i as i16)), PushOutcome::Queued);
        }
        assert_eq!(queue.push(packet(0)), PushOutcome::Filled);
        assert_eq!(queue.push(packet(0)), PushOutcome::Dropped);
        assert_eq!(queue.len(), CONTROL_QUEUE_CAPACITY);

        queue.clear();
        assert!(queue.is_empty());
    }
}

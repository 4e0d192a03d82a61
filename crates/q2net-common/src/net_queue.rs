// net_queue.rs -- hand-off queue between the socket thread and the frame loop

use crate::net::NetAdr;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};

/// A received datagram with its source and arrival time.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub from: NetAdr,
    pub data: Vec<u8>,
    /// sys_milliseconds() at arrival
    pub timestamp: i32,
}

impl QueuedPacket {
    pub fn new(from: NetAdr, data: Vec<u8>, timestamp: i32) -> Self {
        Self { from, data, timestamp }
    }
}

/// Bounded packet queue. When full, new packets are dropped so the
/// receiving thread never blocks.
pub struct PacketQueue {
    sender: Sender<QueuedPacket>,
    receiver: Receiver<QueuedPacket>,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.clamp(1, MAX_QUEUE_CAPACITY));
        Self { sender, receiver }
    }

    pub fn sender(&self) -> PacketQueueSender {
        PacketQueueSender {
            sender: self.sender.clone(),
        }
    }

    pub fn try_recv(&self) -> Option<QueuedPacket> {
        self.receiver.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }
}

#[derive(Clone)]
pub struct PacketQueueSender {
    sender: Sender<QueuedPacket>,
}

impl PacketQueueSender {
    /// Returns false if the packet was dropped.
    pub fn try_send(&self, packet: QueuedPacket) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const MAX_QUEUE_CAPACITY: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_packet(id: u8) -> QueuedPacket {
        QueuedPacket::new(NetAdr::Ip("127.0.0.1:27910".parse().unwrap()), vec![id], 1000)
    }

    #[test]
    fn test_queue_basic_operations() {
        let queue = PacketQueue::new(10);
        let sender = queue.sender();

        assert!(queue.is_empty());
        assert!(sender.try_send(make_test_packet(1)));
        assert_eq!(queue.len(), 1);

        let packet = queue.try_recv().unwrap();
        assert_eq!(packet.data, vec![1]);
        assert_eq!(packet.timestamp, 1000);
        assert!(queue.is_empty());
        assert!(queue.try_recv().is_none());
    }

    #[test]
    fn test_queue_full_drops_packets() {
        let queue = PacketQueue::new(2);
        let sender = queue.sender();

        assert!(sender.try_send(make_test_packet(1)));
        assert!(sender.try_send(make_test_packet(2)));
        assert!(!sender.try_send(make_test_packet(3)));

        assert_eq!(queue.try_recv().unwrap().data, vec![1]);
        assert_eq!(queue.try_recv().unwrap().data, vec![2]);
    }

    #[test]
    fn test_sender_from_thread() {
        let queue = PacketQueue::new(10);
        let sender = queue.sender();
        std::thread::spawn(move || {
            assert!(sender.try_send(make_test_packet(7)));
        })
        .join()
        .unwrap();
        assert_eq!(queue.try_recv().unwrap().data, vec![7]);
    }
}

use console::style;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Interconnect is a general interconnect
///
/// Device ids start with the clusters, followed by the memory sub partitions.
///
/// Functions are not mutable because the interface should
/// implement locking internally
pub trait Interconnect<P>: std::fmt::Debug {
    fn busy(&self) -> bool;

    fn push(&self, src_device: usize, dest_device: usize, packet: P, size: u32);

    fn pop(&self, device: usize) -> Option<P>;

    fn has_buffer(&self, src_device: usize, size: u32) -> bool;

    fn transfer(&self);
}

#[derive(Debug)]
struct InFlight<P> {
    dest_device: usize,
    packet: P,
}

/// Interconnect with one bounded injection queue per device.
///
/// Every `transfer` moves at most one packet from each injection queue to the
/// ejection queue of its destination.
#[derive(Debug)]
pub struct ToyInterconnect<P> {
    pub num_clusters: usize,
    pub num_mems: usize,
    /// injection queue capacity in packets
    pub capacity: Option<usize>,
    input_queue: Vec<Mutex<VecDeque<InFlight<P>>>>,
    output_queue: Vec<Mutex<VecDeque<P>>>,
}

impl<P> ToyInterconnect<P> {
    #[must_use]
    pub fn new(num_clusters: usize, num_mems: usize, capacity: Option<usize>) -> Self {
        let num_nodes = num_clusters + num_mems;
        Self {
            num_clusters,
            num_mems,
            capacity,
            input_queue: (0..num_nodes).map(|_| Mutex::new(VecDeque::new())).collect(),
            output_queue: (0..num_nodes).map(|_| Mutex::new(VecDeque::new())).collect(),
        }
    }

    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_clusters + self.num_mems
    }

    /// Number of packets currently held.
    #[must_use]
    pub fn num_packets(&self) -> usize {
        let injected: usize = self.input_queue.iter().map(|queue| queue.lock().len()).sum();
        let ejected: usize = self.output_queue.iter().map(|queue| queue.lock().len()).sum();
        injected + ejected
    }
}

impl<P> Interconnect<P> for ToyInterconnect<P>
where
    P: std::fmt::Display + std::fmt::Debug,
{
    fn busy(&self) -> bool {
        self.input_queue.iter().any(|queue| !queue.lock().is_empty())
            || self.output_queue.iter().any(|queue| !queue.lock().is_empty())
    }

    fn push(&self, src_device: usize, dest_device: usize, packet: P, size: u32) {
        assert!(self.has_buffer(src_device, size));
        assert!(dest_device < self.num_nodes());
        log::debug!(
            "{}: {size} bytes from device {src_device} to {dest_device}",
            style(format!("INTERCONN PUSH {packet}")).bold(),
        );
        self.input_queue[src_device].lock().push_back(InFlight {
            dest_device,
            packet,
        });
    }

    fn pop(&self, device: usize) -> Option<P> {
        let packet = self.output_queue[device].lock().pop_front();
        if let Some(ref packet) = packet {
            log::debug!(
                "{}: {packet} to device {device}",
                style("INTERCONN POP").bold()
            );
        }
        packet
    }

    fn has_buffer(&self, src_device: usize, _size: u32) -> bool {
        let Some(capacity) = self.capacity else {
            return true;
        };
        self.input_queue[src_device].lock().len() < capacity
    }

    fn transfer(&self) {
        for queue in &self.input_queue {
            let Some(InFlight {
                dest_device,
                packet,
            }) = queue.lock().pop_front()
            else {
                continue;
            };
            self.output_queue[dest_device].lock().push_back(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Interconnect, ToyInterconnect};
    use pretty_assertions_sorted as diff;

    #[test]
    fn test_packets_arrive_after_transfer() {
        let interconn: ToyInterconnect<u32> = ToyInterconnect::new(2, 2, Some(1));
        assert!(!interconn.busy());
        interconn.push(0, 3, 42, 8);
        assert!(interconn.busy());
        assert!(!interconn.has_buffer(0, 8));
        assert!(interconn.has_buffer(1, 8));
        diff::assert_eq!(interconn.pop(3), None);

        interconn.transfer();
        assert!(interconn.has_buffer(0, 8));
        diff::assert_eq!(interconn.pop(3), Some(42));
        assert!(!interconn.busy());
    }

    #[test]
    fn test_one_packet_per_source_per_transfer() {
        let interconn: ToyInterconnect<u32> = ToyInterconnect::new(1, 1, None);
        interconn.push(0, 1, 1, 8);
        interconn.push(0, 1, 2, 8);
        interconn.transfer();
        diff::assert_eq!(interconn.num_packets(), 2);
        diff::assert_eq!(interconn.pop(1), Some(1));
        diff::assert_eq!(interconn.pop(1), None);
        interconn.transfer();
        diff::assert_eq!(interconn.pop(1), Some(2));
    }
}

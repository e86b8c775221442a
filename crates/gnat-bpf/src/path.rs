//! The path-controller contract: a reliable, rate-adaptive transport to one
//! neighbor. Concrete SLIQ (negotiated Copa/Cubic congestion control) and
//! SOND (plain rate-paced UDP, no retransmission) variants sit outside this
//! crate's scope — the forwarding algorithm only ever sees this trait.

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use gnat_common::BinIndex;

/// The fixed set of logical streams a path controller multiplexes. Each has
/// its own priority and retransmission budget, independent of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Qlam,
    EfData,
    Control,
    NonEfData,
    CapacityEstimate,
}

/// Reliability semantics requested for one `send` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityMode {
    /// Retransmit on loss up to the stream's configured retry budget.
    Reliable,
    /// Best-effort, no retransmission (SOND's native mode; also used by
    /// SLIQ streams carrying already-expired EF traffic).
    BestEffort,
}

/// Time-to-go associated with a send, in microseconds, or `None` if the
/// packet carries no deadline (matches [`gnat_queue::TTG_UNSET`] at the
/// queue layer; this is the decoded, optional form used at the transport
/// seam).
pub type Ttg = Option<i64>;

/// A reliable, rate-adaptive transport to exactly one neighbor. Implemented
/// by both SLIQ- and SOND-flavored controllers; the forwarding algorithm
/// only depends on this contract.
pub trait PathController {
    /// The remote neighbor this controller reaches.
    fn neighbor(&self) -> BinIndex;

    /// Queue `pkt` for transmission on `stream`. Returns `Ok(bytes sent)` or
    /// an error if the controller's send buffer is full.
    fn send(
        &mut self,
        pkt: Bytes,
        stream: StreamKind,
        reliability: ReliabilityMode,
        ttg: Ttg,
    ) -> Result<usize, gnat_common::GnatError>;

    /// Receive the next available packet from this controller, if any.
    fn recv(&mut self) -> Option<(StreamKind, Bytes)>;

    /// Current estimated sustainable send capacity, bits/s.
    fn capacity_estimate_bps(&self) -> f64;

    /// Expected packet-delivery delay distribution over this path: the
    /// controller's current `(mean, variance)` estimate, microseconds.
    fn packet_delivery_delay(&self) -> (f64, f64);

    /// Bytes currently queued in this controller's own transmit buffer
    /// (distinct from the BPF's own `BinQueueMgr` backlog).
    fn transmit_buffer_depth_bytes(&self) -> usize;

    /// Downcast support for test/sim harnesses that need a concrete
    /// controller (e.g. `MockPathController::drain_outbox`) rather than
    /// just this contract.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// An in-memory stand-in for SLIQ/SOND, used by `gnat-sim` and unit tests.
/// Capacity and delay are caller-set rather than measured; sends are
/// accepted up to `capacity_bytes` and recv returns whatever was injected
/// via [`MockPathController::deliver`].
pub struct MockPathController {
    neighbor: BinIndex,
    capacity_bps: f64,
    delay_mean_us: f64,
    delay_variance_us2: f64,
    send_buffer_capacity_bytes: usize,
    send_buffer_used_bytes: usize,
    inbox_tx: Sender<(StreamKind, Bytes)>,
    inbox_rx: Receiver<(StreamKind, Bytes)>,
    pub sent_log: Vec<(StreamKind, usize)>,
    /// The actual bytes handed to `send`, queued for a test/sim harness to
    /// ferry across to the peer's `deliver` — modeling the wire itself,
    /// which (unlike `sent_log`) a harness needs the payload for.
    outbox_tx: Sender<(StreamKind, Bytes)>,
    outbox_rx: Receiver<(StreamKind, Bytes)>,
}

impl MockPathController {
    pub fn new(neighbor: BinIndex, capacity_bps: f64, send_buffer_capacity_bytes: usize) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        let (outbox_tx, outbox_rx) = unbounded();
        MockPathController {
            neighbor,
            capacity_bps,
            delay_mean_us: 1000.0,
            delay_variance_us2: 100.0,
            send_buffer_capacity_bytes,
            send_buffer_used_bytes: 0,
            inbox_tx,
            inbox_rx,
            sent_log: Vec::new(),
            outbox_tx,
            outbox_rx,
        }
    }

    /// Drain everything handed to `send` since the last drain — a sim
    /// harness's "cable" step uses this to ferry packets to the peer's
    /// `deliver`, modeling propagation the mock otherwise skips.
    pub fn drain_outbox(&mut self) -> Vec<(StreamKind, Bytes)> {
        self.outbox_rx.try_iter().collect()
    }

    pub fn set_delay(&mut self, mean_us: f64, variance_us2: f64) {
        self.delay_mean_us = mean_us;
        self.delay_variance_us2 = variance_us2;
    }

    /// Test/sim hook: inject a packet as if received from the peer.
    pub fn deliver(&mut self, stream: StreamKind, pkt: Bytes) {
        let _ = self.inbox_tx.send((stream, pkt));
    }

    /// Test/sim hook: drain the transmit buffer as if the link serviced it.
    pub fn drain_send_buffer(&mut self) {
        self.send_buffer_used_bytes = 0;
    }
}

impl PathController for MockPathController {
    fn neighbor(&self) -> BinIndex {
        self.neighbor
    }

    fn send(
        &mut self,
        pkt: Bytes,
        stream: StreamKind,
        _reliability: ReliabilityMode,
        _ttg: Ttg,
    ) -> Result<usize, gnat_common::GnatError> {
        let len = pkt.len();
        if self.send_buffer_used_bytes + len > self.send_buffer_capacity_bytes {
            return Err(gnat_common::GnatError::transient(format!(
                "send buffer full on path to {}",
                self.neighbor
            )));
        }
        self.send_buffer_used_bytes += len;
        self.sent_log.push((stream, len));
        let _ = self.outbox_tx.send((stream, pkt));
        Ok(len)
    }

    fn recv(&mut self) -> Option<(StreamKind, Bytes)> {
        self.inbox_rx.try_recv().ok()
    }

    fn capacity_estimate_bps(&self) -> f64 {
        self.capacity_bps
    }

    fn packet_delivery_delay(&self) -> (f64, f64) {
        (self.delay_mean_us, self.delay_variance_us2)
    }

    fn transmit_buffer_depth_bytes(&self) -> usize {
        self.send_buffer_used_bytes
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_accumulates_buffer_depth() {
        let mut pc = MockPathController::new(BinIndex(1), 1e7, 1000);
        pc.send(Bytes::from(vec![0u8; 200]), StreamKind::NonEfData, ReliabilityMode::Reliable, None)
            .unwrap();
        assert_eq!(pc.transmit_buffer_depth_bytes(), 200);
    }

    #[test]
    fn send_over_capacity_is_transient_error() {
        let mut pc = MockPathController::new(BinIndex(1), 1e7, 100);
        let err = pc
            .send(Bytes::from(vec![0u8; 200]), StreamKind::NonEfData, ReliabilityMode::Reliable, None)
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn deliver_then_recv_round_trips() {
        let mut pc = MockPathController::new(BinIndex(2), 1e7, 1000);
        pc.deliver(StreamKind::Qlam, Bytes::from_static(b"qlam"));
        let (stream, data) = pc.recv().unwrap();
        assert_eq!(stream, StreamKind::Qlam);
        assert_eq!(&data[..], b"qlam");
        assert!(pc.recv().is_none());
    }

    #[test]
    fn drain_resets_buffer_depth() {
        let mut pc = MockPathController::new(BinIndex(1), 1e7, 1000);
        pc.send(Bytes::from(vec![0u8; 500]), StreamKind::EfData, ReliabilityMode::BestEffort, Some(5000))
            .unwrap();
        pc.drain_send_buffer();
        assert_eq!(pc.transmit_buffer_depth_bytes(), 0);
    }
}

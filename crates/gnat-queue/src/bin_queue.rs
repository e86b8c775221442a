//! `BinQueueMgr`: the queue set for one local destination-index.

use bytes::Bytes;
use gnat_common::{BinIndex, DstVec};
use std::collections::VecDeque;

/// Time-to-go sentinel: "unset," distinguished from `i64::MAX` to dodge the
/// `ttg − ttr` overflow the original's comments call out (§9).
pub const TTG_UNSET: i64 = i64::MIN;

/// The seven latency classes a physical bin queue partitions packets into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencyClass {
    Ef,
    LowLatency,
    HighLatencyNormal,
    HighLatencyNplb,
    HighLatencyZlr,
    HighLatencyReceived,
    HighLatencyExpired,
}

impl LatencyClass {
    pub const ALL: [LatencyClass; 7] = [
        LatencyClass::Ef,
        LatencyClass::LowLatency,
        LatencyClass::HighLatencyNormal,
        LatencyClass::HighLatencyNplb,
        LatencyClass::HighLatencyZlr,
        LatencyClass::HighLatencyReceived,
        LatencyClass::HighLatencyExpired,
    ];

    fn idx(self) -> usize {
        match self {
            LatencyClass::Ef => 0,
            LatencyClass::LowLatency => 1,
            LatencyClass::HighLatencyNormal => 2,
            LatencyClass::HighLatencyNplb => 3,
            LatencyClass::HighLatencyZlr => 4,
            LatencyClass::HighLatencyReceived => 5,
            LatencyClass::HighLatencyExpired => 6,
        }
    }

    /// Bit position within a `class_mask` passed to [`BinQueueMgr::dequeue`].
    pub fn mask_bit(self) -> u8 {
        1 << self.idx()
    }

    /// Latency-sensitive classes contribute to `ls_depth_bytes`.
    pub fn is_latency_sensitive(self) -> bool {
        matches!(self, LatencyClass::Ef | LatencyClass::LowLatency)
    }
}

pub const ALL_CLASSES_MASK: u8 = 0b0111_1111;

/// FIFO/LIFO ordering for a sub-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Fifo,
    Lifo,
}

/// What happens when a sub-queue's depth limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    DropHead,
    DropTail,
    NoDrop,
}

/// How EF packets are ordered within their sub-queue — a configured,
/// process-wide invariant (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfOrderPolicy {
    /// Order by `ttg − ttr` ("delivery margin"), smallest first. Default.
    DeliveryMargin,
    /// Order by `ttg` alone, smallest (most urgent) first.
    Ttg,
    /// Order by receive time, oldest first.
    ReceiveTime,
}

impl Default for EfOrderPolicy {
    fn default() -> Self {
        EfOrderPolicy::DeliveryMargin
    }
}

/// A queued packet. Converted in place to a zombie (`is_zombie = true`,
/// payload dropped, size preserved) when it expires and drop is disabled.
#[derive(Debug, Clone)]
pub struct Packet {
    pub payload: Bytes,
    pub size_bytes: u32,
    pub enqueue_time_us: u64,
    /// Time-to-go: a signed delta from enqueue time, or [`TTG_UNSET`].
    pub ttg_us: i64,
    /// Expected time-to-reach the destination over the selected path, used
    /// for EF feasibility (`avg(ttr) + σ·stddev(ttr) ≤ ttg`). Filled in by
    /// the forwarding algorithm at selection time, not at enqueue.
    pub ttr_us: Option<i64>,
    pub is_zombie: bool,
    /// Bin indices this packet has already traversed, oldest first — the
    /// history vector anti-circulation checks against (§4.5 step 2).
    pub visited: Vec<BinIndex>,
    /// `Some(remaining destinations)` for a multicast packet; `None` for
    /// unicast. Forwarding subtracts delivered destinations from this as
    /// the packet is replicated along shared segments.
    pub dst_vec: Option<DstVec>,
}

impl Packet {
    pub fn new(payload: Bytes, enqueue_time_us: u64, ttg_us: i64) -> Self {
        let size_bytes = payload.len() as u32;
        Packet {
            payload,
            size_bytes,
            enqueue_time_us,
            ttg_us,
            ttr_us: None,
            is_zombie: false,
            visited: Vec::new(),
            dst_vec: None,
        }
    }

    pub fn with_dst_vec(mut self, dst_vec: DstVec) -> Self {
        self.dst_vec = Some(dst_vec);
        self
    }

    pub fn is_multicast(&self) -> bool {
        self.dst_vec.is_some()
    }

    pub fn mark_visited(&mut self, bin: BinIndex) {
        self.visited.push(bin);
    }

    pub fn has_ttg(&self) -> bool {
        self.ttg_us != TTG_UNSET
    }

    /// True once `now` has passed the packet's deadline.
    pub fn is_expired(&self, now_us: u64) -> bool {
        self.has_ttg() && (now_us as i64) > self.enqueue_time_us as i64 + self.ttg_us
    }

    /// Turn this packet into a zombie: header-only, size-preserving so its
    /// bytes still count toward the gradient, payload dropped.
    pub fn zombify(&mut self) {
        self.payload = Bytes::new();
        self.is_zombie = true;
    }
}

struct SubQueue {
    packets: VecDeque<Packet>,
    order: Order,
    drop_policy: DropPolicy,
    capacity_bytes: u32,
    depth_bytes: u32,
}

impl SubQueue {
    fn new(order: Order, drop_policy: DropPolicy, capacity_bytes: u32) -> Self {
        SubQueue {
            packets: VecDeque::new(),
            order,
            drop_policy,
            capacity_bytes,
            depth_bytes: 0,
        }
    }

    fn push(&mut self, pkt: Packet) -> u32 {
        let mut dropped = 0u32;
        if self.depth_bytes + pkt.size_bytes > self.capacity_bytes {
            match self.drop_policy {
                DropPolicy::DropTail => return pkt.size_bytes, // drop the incoming packet
                DropPolicy::DropHead => {
                    while self.depth_bytes + pkt.size_bytes > self.capacity_bytes {
                        match self.packets.pop_front() {
                            Some(old) => {
                                dropped += old.size_bytes;
                                self.depth_bytes -= old.size_bytes;
                            }
                            None => break,
                        }
                    }
                }
                DropPolicy::NoDrop => {} // accept over capacity
            }
        }
        self.depth_bytes += pkt.size_bytes;
        match self.order {
            Order::Fifo => self.packets.push_back(pkt),
            Order::Lifo => self.packets.push_front(pkt),
        }
        dropped
    }

    fn peek_mut(&mut self) -> Option<&mut Packet> {
        self.packets.front_mut()
    }

    fn pop(&mut self) -> Option<Packet> {
        let pkt = self.packets.pop_front()?;
        self.depth_bytes -= pkt.size_bytes;
        Some(pkt)
    }
}

/// Outcome of a [`BinQueueMgr::dequeue`] call.
#[derive(Debug, Default)]
pub struct DequeueOutcome {
    pub packet: Option<Packet>,
    pub bytes_dropped: u32,
}

/// The queue set for one local destination-index.
pub struct BinQueueMgr {
    sub_queues: [SubQueue; 7],
    ef_order_policy: EfOrderPolicy,
    zombie_bytes: u64,
    virt_depth: std::collections::HashMap<usize, i64>,
    ewma_depth_bytes: f64,
    ewma_alpha: f64,
    max_observed_depth_bytes: u32,
    oldest_arrival_us: Option<u64>,
}

impl BinQueueMgr {
    /// `capacity_bytes_per_class` sizes every sub-queue identically; callers
    /// needing per-class capacities can follow up with `set_capacity`.
    pub fn new(capacity_bytes_per_class: u32) -> Self {
        let mk = |order, drop| SubQueue::new(order, drop, capacity_bytes_per_class);
        BinQueueMgr {
            sub_queues: [
                mk(Order::Fifo, DropPolicy::NoDrop),   // Ef
                mk(Order::Fifo, DropPolicy::DropTail),  // LowLatency
                mk(Order::Fifo, DropPolicy::DropTail),  // HighLatencyNormal
                mk(Order::Fifo, DropPolicy::DropHead),  // HighLatencyNplb
                mk(Order::Fifo, DropPolicy::DropHead),  // HighLatencyZlr
                mk(Order::Fifo, DropPolicy::DropTail),  // HighLatencyReceived
                mk(Order::Fifo, DropPolicy::DropTail),  // HighLatencyExpired
            ],
            ef_order_policy: EfOrderPolicy::default(),
            zombie_bytes: 0,
            virt_depth: std::collections::HashMap::new(),
            ewma_depth_bytes: 0.0,
            ewma_alpha: 0.125,
            max_observed_depth_bytes: 0,
            oldest_arrival_us: None,
        }
    }

    pub fn set_ef_order_policy(&mut self, policy: EfOrderPolicy) {
        self.ef_order_policy = policy;
    }

    pub fn set_class_drop_policy(&mut self, class: LatencyClass, policy: DropPolicy) {
        self.sub_queues[class.idx()].drop_policy = policy;
    }

    pub fn set_class_order(&mut self, class: LatencyClass, order: Order) {
        self.sub_queues[class.idx()].order = order;
    }

    pub fn set_class_capacity(&mut self, class: LatencyClass, capacity_bytes: u32) {
        self.sub_queues[class.idx()].capacity_bytes = capacity_bytes;
    }

    /// Append `pkt` to `class`'s sub-queue, honoring its drop policy.
    /// Returns the number of bytes dropped to make room (0 if none).
    pub fn enqueue(&mut self, mut pkt: Packet, class: LatencyClass, now_us: u64) -> u32 {
        if self.oldest_arrival_us.is_none() {
            self.oldest_arrival_us = Some(now_us);
        }
        pkt.enqueue_time_us = now_us;
        let queue = &mut self.sub_queues[class.idx()];

        if class == LatencyClass::Ef {
            let dropped = queue.push(pkt);
            Self::reorder_ef(queue, self.ef_order_policy);
            self.after_mutation();
            if dropped > 0 {
                tracing::debug!(class = ?class, dropped, "ef sub-queue dropped bytes over capacity");
            }
            return dropped;
        }

        let dropped = queue.push(pkt);
        self.after_mutation();
        if dropped > 0 {
            tracing::debug!(class = ?class, dropped, "sub-queue dropped bytes over capacity");
        }
        dropped
    }

    fn reorder_ef(queue: &mut SubQueue, policy: EfOrderPolicy) {
        match policy {
            EfOrderPolicy::DeliveryMargin => {
                queue.packets.make_contiguous().sort_by_key(|p| {
                    let ttr = p.ttr_us.unwrap_or(0);
                    p.ttg_us.saturating_sub(ttr)
                });
            }
            EfOrderPolicy::Ttg => {
                queue.packets.make_contiguous().sort_by_key(|p| p.ttg_us);
            }
            EfOrderPolicy::ReceiveTime => {
                queue
                    .packets
                    .make_contiguous()
                    .sort_by_key(|p| p.enqueue_time_us);
            }
        }
    }

    /// Select the head packet among the classes set in `class_mask`,
    /// honoring each class's FIFO/LIFO order. If `drop_expired` is true,
    /// packets whose `ttg` has passed are discarded (counted) rather than
    /// returned.
    pub fn dequeue(&mut self, class_mask: u8, drop_expired: bool, now_us: u64) -> DequeueOutcome {
        let mut bytes_dropped = 0u32;
        for class in LatencyClass::ALL {
            if class_mask & class.mask_bit() == 0 {
                continue;
            }
            let queue = &mut self.sub_queues[class.idx()];
            loop {
                match queue.peek_mut() {
                    None => break,
                    Some(pkt) => {
                        if drop_expired && pkt.is_expired(now_us) {
                            let dropped = queue.pop().expect("just peeked");
                            bytes_dropped += dropped.size_bytes;
                            continue;
                        }
                        let pkt = queue.pop().expect("just peeked");
                        self.after_mutation();
                        return DequeueOutcome {
                            packet: Some(pkt),
                            bytes_dropped,
                        };
                    }
                }
            }
        }
        self.after_mutation();
        DequeueOutcome {
            packet: None,
            bytes_dropped,
        }
    }

    /// Walk up to `max_bytes_walked` bytes of the classes in `class_mask`,
    /// front to back within each class, looking for a packet `accept`
    /// approves. Rejected packets are returned to the front of their
    /// sub-queue in their original order; the accepted packet (if any) is
    /// removed and its bytes debited from the queue's depth. Used by the
    /// forwarding algorithm to find a packet matching anti-circulation and
    /// EF-feasibility constraints without disturbing queue order otherwise
    /// (§4.5 step 3).
    pub fn search_and_take(
        &mut self,
        class_mask: u8,
        max_bytes_walked: u32,
        mut accept: impl FnMut(LatencyClass, &Packet) -> bool,
    ) -> Option<Packet> {
        let mut bytes_walked = 0u32;
        for class in LatencyClass::ALL {
            if class_mask & class.mask_bit() == 0 {
                continue;
            }
            let queue = &mut self.sub_queues[class.idx()];
            let len = queue.packets.len();
            let mut rejected = Vec::new();
            let mut found = None;
            for _ in 0..len {
                if bytes_walked >= max_bytes_walked {
                    break;
                }
                let pkt = queue.packets.pop_front().expect("within observed len");
                bytes_walked += pkt.size_bytes;
                if accept(class, &pkt) {
                    found = Some(pkt);
                    break;
                }
                rejected.push(pkt);
            }
            for pkt in rejected.into_iter().rev() {
                queue.packets.push_front(pkt);
            }
            if let Some(pkt) = found {
                queue.depth_bytes -= pkt.size_bytes;
                self.after_mutation();
                return Some(pkt);
            }
        }
        None
    }

    /// Convert the head of `class` into a zombie in place: when dropping is
    /// disabled for an expired packet, its bytes still count toward the
    /// gradient but its payload is released.
    pub fn zombify_expired(&mut self, class: LatencyClass, now_us: u64) -> bool {
        let queue = &mut self.sub_queues[class.idx()];
        if let Some(pkt) = queue.peek_mut() {
            if pkt.is_expired(now_us) && !pkt.is_zombie {
                let size = pkt.size_bytes;
                pkt.zombify();
                self.zombie_bytes += size as u64;
                return true;
            }
        }
        false
    }

    pub fn set_virt_depth(&mut self, neighbor_index: usize, value: i64) {
        self.virt_depth.insert(neighbor_index, value);
    }

    pub fn get_virt_depth(&self, neighbor_index: usize) -> i64 {
        self.virt_depth.get(&neighbor_index).copied().unwrap_or(0)
    }

    pub fn depth_bytes(&self) -> u64 {
        self.sub_queues.iter().map(|q| q.depth_bytes as u64).sum::<u64>() + self.zombie_bytes
    }

    pub fn depth_bytes_for_class(&self, class: LatencyClass) -> u32 {
        self.sub_queues[class.idx()].depth_bytes
    }

    pub fn ls_depth_bytes(&self) -> u64 {
        LatencyClass::ALL
            .iter()
            .filter(|c| c.is_latency_sensitive())
            .map(|c| self.sub_queues[c.idx()].depth_bytes as u64)
            .sum()
    }

    pub fn zombie_depth_bytes(&self) -> u64 {
        self.zombie_bytes
    }

    pub fn ewma_depth_bytes(&self) -> f64 {
        self.ewma_depth_bytes
    }

    pub fn max_observed_depth_bytes(&self) -> u32 {
        self.max_observed_depth_bytes
    }

    fn after_mutation(&mut self) {
        let depth: u64 = self.sub_queues.iter().map(|q| q.depth_bytes as u64).sum();
        self.ewma_depth_bytes =
            self.ewma_alpha * depth as f64 + (1.0 - self.ewma_alpha) * self.ewma_depth_bytes;
        if depth > self.max_observed_depth_bytes as u64 {
            self.max_observed_depth_bytes = depth as u32;
        }
    }
}

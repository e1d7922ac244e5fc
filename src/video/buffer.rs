//! Capture buffer pool
//!
//! Tracks every buffer of a video node together with its backing memory and
//! ownership state. Buffers are grouped in per-session slices and addressed by
//! their index inside that slice. Ownership moves strictly along
//! `Free -> Queued -> InFlight -> Done -> Free`; any other transition is an
//! error so double completions are caught instead of silently ignored.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bridge::session::SessionId;
use crate::error::{BridgeError, Result};

/// Buffer index within a session's slice
pub type BufferId = u32;

/// Buffer ownership state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferState {
    /// Owned by the consumer, not queued
    Free,
    /// Queued by the consumer, not yet handed to the pipeline
    Queued,
    /// Handed to the pipeline, waiting for data
    InFlight,
    /// Completed, waiting to be dequeued by the consumer
    Done,
}

/// Outcome of a completed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferStatus {
    Ok,
    /// Flushed by a stream stop or pipeline failure
    Error,
}

/// Opaque external memory handle (e.g. an imported dma-buf fd)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalHandle(pub i32);

/// Memory backing a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backing {
    /// Carved out of the device's reserved memory region
    Reserved { addr: u64, len: usize },
    /// Imported from outside the bridge
    Imported { handle: ExternalHandle, len: usize },
}

impl Backing {
    pub fn len(&self) -> usize {
        match self {
            Backing::Reserved { len, .. } | Backing::Imported { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Device address, if the memory is device-addressable
    pub fn addr(&self) -> Option<u64> {
        match self {
            Backing::Reserved { addr, .. } => Some(*addr),
            Backing::Imported { .. } => None,
        }
    }
}

/// A capture buffer
#[derive(Debug, Clone)]
pub struct Buffer {
    pub index: BufferId,
    pub backing: Backing,
    pub state: BufferState,
    pub status: BufferStatus,
    /// Assigned when the buffer transitions to `Done`
    pub sequence: Option<u64>,
    pub bytes_used: usize,
    pub completed_at: Option<Instant>,
}

impl Buffer {
    fn new(index: BufferId, backing: Backing) -> Self {
        Self {
            index,
            backing,
            state: BufferState::Free,
            status: BufferStatus::Ok,
            sequence: None,
            bytes_used: 0,
            completed_at: None,
        }
    }
}

/// Result of a buffer request
///
/// `granted` may be lower than `requested` when the reserved memory could not
/// hold every buffer (clamp-to-fit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCount {
    pub requested: u32,
    pub granted: u32,
}

impl BufferCount {
    pub fn is_partial(&self) -> bool {
        self.granted < self.requested
    }
}

/// Number of buffers per ownership state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCounts {
    pub free: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub done: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.free + self.queued + self.in_flight + self.done
    }
}

/// First-fit allocator over the device's reserved memory
#[derive(Debug)]
struct ReservedRegion {
    base: u64,
    size: u64,
    /// Allocated ranges as (offset, len), sorted by offset
    used: Vec<(u64, u64)>,
}

impl ReservedRegion {
    fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size,
            used: Vec::new(),
        }
    }

    fn used_bytes(&self) -> u64 {
        self.used.iter().map(|(_, len)| len).sum()
    }

    fn alloc(&mut self, len: u64) -> Option<u64> {
        let mut cursor = 0u64;
        let mut slot = self.used.len();
        for (i, (offset, used_len)) in self.used.iter().enumerate() {
            if offset - cursor >= len {
                slot = i;
                break;
            }
            cursor = offset + used_len;
        }
        if slot == self.used.len() && self.size - cursor < len {
            return None;
        }
        self.used.insert(slot, (cursor, len));
        Some(self.base + cursor)
    }

    fn free(&mut self, addr: u64) -> bool {
        let offset = addr.wrapping_sub(self.base);
        match self.used.iter().position(|(o, _)| *o == offset) {
            Some(pos) => {
                self.used.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Buffers and auxiliary allocations of one session
#[derive(Debug, Default)]
struct PoolSlice {
    buffers: Vec<Buffer>,
    /// Completion order of `Done` buffers
    done: VecDeque<BufferId>,
    extra: Vec<Backing>,
}

impl PoolSlice {
    fn reserved_bytes(&self) -> u64 {
        self.buffers
            .iter()
            .map(|b| &b.backing)
            .chain(self.extra.iter())
            .filter(|b| matches!(b, Backing::Reserved { .. }))
            .map(|b| b.len() as u64)
            .sum()
    }
}

/// Fixed-capacity buffer pool of one video node
#[derive(Debug)]
pub struct BufferPool {
    region: ReservedRegion,
    slices: HashMap<SessionId, PoolSlice>,
}

impl BufferPool {
    /// Create a pool over the reserved memory `[base, base + capacity)`
    pub fn new(base: u64, capacity: u64) -> Self {
        Self {
            region: ReservedRegion::new(base, capacity),
            slices: HashMap::new(),
        }
    }

    /// Reserved memory ceiling in bytes
    pub fn capacity(&self) -> u64 {
        self.region.size
    }

    /// Reserved memory as (base, size)
    pub fn reserved_memory(&self) -> (u64, u64) {
        (self.region.base, self.region.size)
    }

    /// Bytes currently carved out of the reserved memory
    pub fn used_bytes(&self) -> u64 {
        self.region.used_bytes()
    }

    /// Allocate `count` buffers of `size` bytes for `owner`
    ///
    /// Existing buffers of `owner` are released first. The count is reduced
    /// while `count * size` exceeds the memory not held by other sessions.
    pub fn allocate(&mut self, owner: SessionId, count: u32, size: usize) -> Result<BufferCount> {
        if size == 0 {
            return Err(BridgeError::InvalidArgument("buffer size is zero".into()));
        }
        self.release_all(owner)?;

        let held_by_others: u64 = self
            .slices
            .iter()
            .filter(|(id, _)| **id != owner)
            .map(|(_, slice)| slice.reserved_bytes())
            .sum();
        let own_extra: u64 = self
            .slices
            .get(&owner)
            .map(|s| s.reserved_bytes())
            .unwrap_or(0);
        let available = self
            .capacity()
            .saturating_sub(held_by_others)
            .saturating_sub(own_extra);

        let mut granted = count;
        while granted > 0 && granted as u64 * size as u64 > available {
            granted -= 1;
        }
        if granted == 0 {
            return Err(BridgeError::OutOfResources(format!(
                "{} bytes per buffer, {} bytes available",
                size, available
            )));
        }

        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            match self.region.alloc(size as u64) {
                Some(addr) => buffers.push(Buffer::new(
                    index,
                    Backing::Reserved { addr, len: size },
                )),
                None => {
                    warn!(
                        "Reserved memory fragmented, granting {} of {} buffers",
                        index, granted
                    );
                    break;
                }
            }
        }
        if buffers.is_empty() {
            return Err(BridgeError::OutOfResources(format!(
                "no contiguous {} byte range left",
                size
            )));
        }

        let granted = buffers.len() as u32;
        if granted < count {
            debug!(
                "Clamped buffer request for {}: {} -> {} ({} bytes each)",
                owner, count, granted, size
            );
        }
        self.slices.entry(owner).or_default().buffers = buffers;
        Ok(BufferCount {
            requested: count,
            granted,
        })
    }

    /// Register externally allocated buffers for `owner`
    pub fn import(
        &mut self,
        owner: SessionId,
        handles: &[(ExternalHandle, usize)],
    ) -> Result<BufferCount> {
        if handles.is_empty() {
            return Err(BridgeError::InvalidArgument("no handles to import".into()));
        }
        self.release_all(owner)?;
        let buffers = handles
            .iter()
            .enumerate()
            .map(|(i, (handle, len))| {
                Buffer::new(
                    i as BufferId,
                    Backing::Imported {
                        handle: *handle,
                        len: *len,
                    },
                )
            })
            .collect::<Vec<_>>();
        let granted = buffers.len() as u32;
        self.slices.entry(owner).or_default().buffers = buffers;
        Ok(BufferCount {
            requested: granted,
            granted,
        })
    }

    /// Release every buffer of `owner`
    ///
    /// Refused while any buffer is still in flight at the pipeline.
    pub fn release_all(&mut self, owner: SessionId) -> Result<()> {
        let Some(slice) = self.slices.get_mut(&owner) else {
            return Ok(());
        };
        if let Some(b) = slice
            .buffers
            .iter()
            .find(|b| b.state == BufferState::InFlight)
        {
            return Err(BridgeError::InvalidState(format!(
                "buffer {} still in flight",
                b.index
            )));
        }
        for buffer in slice.buffers.drain(..) {
            if let Backing::Reserved { addr, .. } = buffer.backing {
                self.region.free(addr);
            }
        }
        slice.done.clear();
        Ok(())
    }

    /// Drop the slice of `owner` including auxiliary allocations
    pub fn remove_owner(&mut self, owner: SessionId) -> Result<()> {
        self.release_all(owner)?;
        if let Some(slice) = self.slices.remove(&owner) {
            for backing in slice.extra {
                if let Backing::Reserved { addr, .. } = backing {
                    self.region.free(addr);
                }
            }
        }
        Ok(())
    }

    /// Allocate auxiliary memory for `owner` outside the buffer queue
    pub fn alloc_extra(&mut self, owner: SessionId, size: usize) -> Result<Backing> {
        if size == 0 {
            return Err(BridgeError::InvalidArgument("allocation size is zero".into()));
        }
        let addr = self.region.alloc(size as u64).ok_or_else(|| {
            BridgeError::OutOfResources(format!("no {} byte range left", size))
        })?;
        let backing = Backing::Reserved { addr, len: size };
        self.slices.entry(owner).or_default().extra.push(backing);
        Ok(backing)
    }

    /// Free an auxiliary allocation by address
    pub fn free_extra(&mut self, owner: SessionId, addr: u64) -> Result<()> {
        let slice = self
            .slices
            .get_mut(&owner)
            .ok_or_else(|| BridgeError::NotFound(format!("allocation {:#x}", addr)))?;
        let pos = slice
            .extra
            .iter()
            .position(|b| b.addr() == Some(addr))
            .ok_or_else(|| BridgeError::NotFound(format!("allocation {:#x}", addr)))?;
        slice.extra.remove(pos);
        self.region.free(addr);
        Ok(())
    }

    /// Number of buffers held by `owner`
    pub fn len(&self, owner: SessionId) -> usize {
        self.slices.get(&owner).map(|s| s.buffers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, owner: SessionId) -> bool {
        self.len(owner) == 0
    }

    pub fn buffer(&self, owner: SessionId, index: BufferId) -> Result<&Buffer> {
        self.slices
            .get(&owner)
            .and_then(|s| s.buffers.get(index as usize))
            .ok_or_else(|| BridgeError::InvalidArgument(format!("no buffer {}", index)))
    }

    fn buffer_mut(&mut self, owner: SessionId, index: BufferId) -> Result<&mut Buffer> {
        self.slices
            .get_mut(&owner)
            .and_then(|s| s.buffers.get_mut(index as usize))
            .ok_or_else(|| BridgeError::InvalidArgument(format!("no buffer {}", index)))
    }

    fn transition(
        &mut self,
        owner: SessionId,
        index: BufferId,
        from: BufferState,
        to: BufferState,
    ) -> Result<&mut Buffer> {
        let buffer = self.buffer_mut(owner, index)?;
        if buffer.state != from {
            return Err(BridgeError::InvalidState(format!(
                "buffer {} is {:?}, expected {:?}",
                index, buffer.state, from
            )));
        }
        buffer.state = to;
        Ok(buffer)
    }

    pub fn mark_queued(&mut self, owner: SessionId, index: BufferId) -> Result<()> {
        let buffer = self.transition(owner, index, BufferState::Free, BufferState::Queued)?;
        buffer.sequence = None;
        buffer.status = BufferStatus::Ok;
        buffer.bytes_used = 0;
        Ok(())
    }

    pub fn mark_in_flight(&mut self, owner: SessionId, index: BufferId) -> Result<()> {
        self.transition(owner, index, BufferState::Queued, BufferState::InFlight)?;
        Ok(())
    }

    /// Complete an in-flight buffer
    pub fn mark_done(
        &mut self,
        owner: SessionId,
        index: BufferId,
        sequence: u64,
        status: BufferStatus,
        bytes_used: usize,
    ) -> Result<()> {
        let buffer = self.transition(owner, index, BufferState::InFlight, BufferState::Done)?;
        buffer.sequence = Some(sequence);
        buffer.status = status;
        buffer.bytes_used = bytes_used.min(buffer.backing.len());
        buffer.completed_at = Some(Instant::now());
        if let Some(slice) = self.slices.get_mut(&owner) {
            slice.done.push_back(index);
        }
        Ok(())
    }

    pub fn mark_free(&mut self, owner: SessionId, index: BufferId) -> Result<()> {
        self.transition(owner, index, BufferState::Done, BufferState::Free)?;
        if let Some(slice) = self.slices.get_mut(&owner) {
            slice.done.retain(|i| *i != index);
        }
        Ok(())
    }

    /// Fail every queued or in-flight buffer of `owner`
    ///
    /// `next_sequence` supplies the sequence number for each flushed buffer.
    /// Returns the flushed indices in order.
    pub fn flush(
        &mut self,
        owner: SessionId,
        mut next_sequence: impl FnMut() -> u64,
    ) -> Vec<BufferId> {
        let Some(slice) = self.slices.get_mut(&owner) else {
            return Vec::new();
        };
        let mut flushed = Vec::new();
        for buffer in slice.buffers.iter_mut() {
            if matches!(buffer.state, BufferState::Queued | BufferState::InFlight) {
                buffer.state = BufferState::Done;
                buffer.status = BufferStatus::Error;
                buffer.sequence = Some(next_sequence());
                buffer.bytes_used = 0;
                buffer.completed_at = Some(Instant::now());
                slice.done.push_back(buffer.index);
                flushed.push(buffer.index);
            }
        }
        flushed
    }

    /// Oldest completed buffer of `owner`, moved back to `Free`
    pub fn take_done(&mut self, owner: SessionId) -> Option<Buffer> {
        let slice = self.slices.get_mut(&owner)?;
        let index = slice.done.pop_front()?;
        let buffer = slice.buffers.get_mut(index as usize)?;
        buffer.state = BufferState::Free;
        Some(buffer.clone())
    }

    pub fn has_done(&self, owner: SessionId) -> bool {
        self.slices
            .get(&owner)
            .map(|s| !s.done.is_empty())
            .unwrap_or(false)
    }

    /// Buffers of `owner` currently in `state`
    pub fn indices_in(&self, owner: SessionId, state: BufferState) -> Vec<BufferId> {
        self.slices
            .get(&owner)
            .map(|s| {
                s.buffers
                    .iter()
                    .filter(|b| b.state == state)
                    .map(|b| b.index)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn counts(&self, owner: SessionId) -> StateCounts {
        let mut counts = StateCounts::default();
        if let Some(slice) = self.slices.get(&owner) {
            for buffer in &slice.buffers {
                match buffer.state {
                    BufferState::Free => counts.free += 1,
                    BufferState::Queued => counts.queued += 1,
                    BufferState::InFlight => counts.in_flight += 1,
                    BufferState::Done => counts.done += 1,
                }
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: SessionId = SessionId(1);
    const B: SessionId = SessionId(2);

    #[test]
    fn test_clamp_to_fit_is_maximal() {
        let size = 4_147_200usize;
        let capacity = 64 * 1024 * 1024u64;
        let mut pool = BufferPool::new(0x8000_0000, capacity);
        let count = pool.allocate(A, 100, size).unwrap();

        let expected = (capacity / size as u64) as u32;
        assert_eq!(count.granted, expected);
        assert!(count.is_partial());
        assert!(count.granted as u64 * size as u64 <= capacity);
        assert!((count.granted + 1) as u64 * size as u64 > capacity);
    }

    #[test]
    fn test_exact_fit_not_partial() {
        let mut pool = BufferPool::new(0, 4096 * 4);
        let count = pool.allocate(A, 4, 4096).unwrap();
        assert_eq!(count.granted, 4);
        assert!(!count.is_partial());
        assert_eq!(pool.used_bytes(), 4096 * 4);
    }

    #[test]
    fn test_out_of_resources() {
        let mut pool = BufferPool::new(0, 1000);
        assert!(matches!(
            pool.allocate(A, 3, 2000),
            Err(BridgeError::OutOfResources(_))
        ));
        assert!(pool.is_empty(A));
    }

    #[test]
    fn test_arbitration_between_sessions() {
        let mut pool = BufferPool::new(0, 10_000);
        assert_eq!(pool.allocate(A, 6, 1000).unwrap().granted, 6);
        assert_eq!(pool.allocate(B, 6, 1000).unwrap().granted, 4);

        // Reallocating A reuses its own share
        assert_eq!(pool.allocate(A, 6, 1000).unwrap().granted, 6);

        pool.release_all(B).unwrap();
        assert_eq!(pool.allocate(A, 10, 1000).unwrap().granted, 10);
    }

    #[test]
    fn test_addresses_are_distinct() {
        let mut pool = BufferPool::new(0x1000, 10_000);
        pool.allocate(A, 3, 1000).unwrap();
        pool.allocate(B, 3, 1000).unwrap();
        let mut addrs: Vec<u64> = (0..3)
            .flat_map(|i| {
                [
                    pool.buffer(A, i).unwrap().backing.addr().unwrap(),
                    pool.buffer(B, i).unwrap().backing.addr().unwrap(),
                ]
            })
            .collect();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 6);
        assert!(addrs.iter().all(|a| *a >= 0x1000 && *a < 0x1000 + 10_000));
    }

    #[test]
    fn test_strict_transitions() {
        let mut pool = BufferPool::new(0, 10_000);
        pool.allocate(A, 2, 1000).unwrap();

        assert!(pool.mark_in_flight(A, 0).is_err());
        pool.mark_queued(A, 0).unwrap();
        assert!(pool.mark_queued(A, 0).is_err());
        pool.mark_in_flight(A, 0).unwrap();
        pool.mark_done(A, 0, 0, BufferStatus::Ok, 1000).unwrap();

        // Double completion is rejected
        assert!(matches!(
            pool.mark_done(A, 0, 1, BufferStatus::Ok, 1000),
            Err(BridgeError::InvalidState(_))
        ));
        pool.mark_free(A, 0).unwrap();
        assert!(pool.mark_free(A, 0).is_err());
        assert!(pool.mark_queued(A, 7).is_err());
    }

    #[test]
    fn test_conservation_through_lifecycle() {
        let mut pool = BufferPool::new(0, 100_000);
        pool.allocate(A, 5, 1000).unwrap();
        let total = pool.counts(A).total();
        let mut seq = 0;

        for i in 0..5 {
            pool.mark_queued(A, i).unwrap();
            assert_eq!(pool.counts(A).total(), total);
        }
        for i in 0..4 {
            pool.mark_in_flight(A, i).unwrap();
        }
        pool.mark_done(A, 2, seq, BufferStatus::Ok, 1000).unwrap();
        seq += 1;
        assert_eq!(pool.counts(A).total(), total);

        let flushed = pool.flush(A, || {
            seq += 1;
            seq
        });
        assert_eq!(flushed, vec![0, 1, 3, 4]);
        let counts = pool.counts(A);
        assert_eq!(counts.done, 5);
        assert_eq!(counts.in_flight, 0);
        assert_eq!(counts.total(), total);

        let first = pool.take_done(A).unwrap();
        assert_eq!(first.index, 2);
        assert_eq!(first.status, BufferStatus::Ok);
        let second = pool.take_done(A).unwrap();
        assert_eq!(second.status, BufferStatus::Error);
        assert_eq!(pool.counts(A).free, 2);
        assert_eq!(pool.counts(A).total(), total);
    }

    #[test]
    fn test_random_transitions_conserve_buffers() {
        const COUNT: u32 = 6;
        let mut pool = BufferPool::new(0, 100_000);
        pool.allocate(A, COUNT, 1000).unwrap();
        let mut model = vec![BufferState::Free; COUNT as usize];
        let mut completions = vec![0u32; COUNT as usize];
        let mut taken = vec![0u32; COUNT as usize];
        let mut seq = 0;
        let mut rng = 0x2545_f491_4f6c_dd1du64;

        for _ in 0..2000 {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            let index = (rng % COUNT as u64) as BufferId;
            let slot = index as usize;
            match (rng >> 8) % 6 {
                0 => {
                    let ok = pool.mark_queued(A, index).is_ok();
                    assert_eq!(ok, model[slot] == BufferState::Free);
                    if ok {
                        model[slot] = BufferState::Queued;
                    }
                }
                1 => {
                    let ok = pool.mark_in_flight(A, index).is_ok();
                    assert_eq!(ok, model[slot] == BufferState::Queued);
                    if ok {
                        model[slot] = BufferState::InFlight;
                    }
                }
                2 => {
                    let ok = pool.mark_done(A, index, seq, BufferStatus::Ok, 1000).is_ok();
                    assert_eq!(ok, model[slot] == BufferState::InFlight);
                    if ok {
                        seq += 1;
                        model[slot] = BufferState::Done;
                        completions[slot] += 1;
                        // A completed buffer cannot complete again
                        assert!(pool.mark_done(A, index, seq, BufferStatus::Ok, 1000).is_err());
                    }
                }
                3 => {
                    if let Some(buffer) = pool.take_done(A) {
                        let slot = buffer.index as usize;
                        assert_eq!(model[slot], BufferState::Done);
                        model[slot] = BufferState::Free;
                        taken[slot] += 1;
                    } else {
                        assert!(!model.contains(&BufferState::Done));
                    }
                }
                4 => {
                    let flushed = pool.flush(A, || {
                        seq += 1;
                        seq
                    });
                    for index in flushed {
                        let slot = index as usize;
                        assert!(matches!(
                            model[slot],
                            BufferState::Queued | BufferState::InFlight
                        ));
                        model[slot] = BufferState::Done;
                        completions[slot] += 1;
                    }
                }
                _ => {
                    let ok = pool.mark_free(A, index).is_ok();
                    assert_eq!(ok, model[slot] == BufferState::Done);
                    if ok {
                        model[slot] = BufferState::Free;
                        taken[slot] += 1;
                    }
                }
            }

            assert_eq!(pool.counts(A).total(), COUNT as usize);
            for (i, state) in model.iter().enumerate() {
                assert_eq!(pool.buffer(A, i as BufferId).unwrap().state, *state);
            }
        }

        // Every completion was handed back exactly once
        for (i, state) in model.iter().enumerate() {
            let outstanding = u32::from(*state == BufferState::Done);
            assert_eq!(completions[i], taken[i] + outstanding);
        }
    }

    #[test]
    fn test_release_refused_while_in_flight() {
        let mut pool = BufferPool::new(0, 10_000);
        pool.allocate(A, 2, 1000).unwrap();
        pool.mark_queued(A, 1).unwrap();
        pool.mark_in_flight(A, 1).unwrap();
        assert!(matches!(
            pool.release_all(A),
            Err(BridgeError::InvalidState(_))
        ));
        pool.flush(A, || 0);
        pool.release_all(A).unwrap();
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn test_import_and_extra_allocations() {
        let mut pool = BufferPool::new(0, 10_000);
        let count = pool
            .import(A, &[(ExternalHandle(7), 4096), (ExternalHandle(8), 4096)])
            .unwrap();
        assert_eq!(count.granted, 2);
        assert_eq!(pool.used_bytes(), 0);
        assert_eq!(pool.buffer(A, 1).unwrap().backing.addr(), None);

        let extra = pool.alloc_extra(A, 3000).unwrap();
        assert_eq!(pool.used_bytes(), 3000);
        // Extra memory counts against the owner's share
        assert_eq!(pool.allocate(A, 10, 1000).unwrap().granted, 7);

        pool.free_extra(A, extra.addr().unwrap()).unwrap();
        assert!(pool.free_extra(A, extra.addr().unwrap()).is_err());
        pool.remove_owner(A).unwrap();
        assert_eq!(pool.used_bytes(), 0);
    }
}

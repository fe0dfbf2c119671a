//! The series heap
//!
//! A series is a typed, resizable, head-biased array and the unit of garbage
//! collection. Headers live in a slab of nodes addressed by stable 32-bit
//! ids; cells store ids, never pointers, so cyclic value graphs cost nothing
//! and the collector can walk everything by index. Payload buffers come from
//! the size-class pools.
//!
//! Lifecycle: every series is born **manual** and sits on the manuals list,
//! where a trap unwind will free it; `manage` transfers it to the collector
//! (and off the list) at the moment it becomes reachable from a root. Once
//! managed, never unmanaged.
//!
//! Invariants maintained here:
//! - `bias + tail <= capacity`; growth slides within the buffer or
//!   reallocates.
//! - A cell-array series with tail `k` always has an end marker at slot `k`
//!   (the trailing slot is reserved at every size).
//! - A `LOCKED` series never reallocates its buffer; a `PROTECTED` one
//!   rejects mutation.
//! - An `EXTERNAL` series borrows its payload; only the header is ever
//!   reclaimed.

use crate::pool::{MemError, Pools};
use crate::value::Cell;
use bitflags::bitflags;
use std::num::NonZeroU32;

/// Stable handle to a series node. Ids are slab indices; a freed node may be
/// reused, which is safe because only reachable ids survive a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesId(NonZeroU32);

impl SeriesId {
    fn new(index: usize) -> SeriesId {
        SeriesId(NonZeroU32::new(index as u32).expect("node index 0 is reserved"))
    }

    pub fn index(self) -> usize {
        self.0.get() as usize
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SeriesFlags: u16 {
        /// Owned by the garbage collector; no longer on the manuals list.
        const MANAGED = 1 << 0;
        /// Reached during the current mark phase.
        const MARKED = 1 << 1;
        /// Capacity frozen; the data buffer will never move.
        const LOCKED = 1 << 2;
        /// Writes rejected.
        const PROTECTED = 1 << 3;
        /// Payload is caller-owned; never freed by the pools.
        const EXTERNAL = 1 << 4;
        /// Held alive by the keep list regardless of reachability.
        const KEEP = 1 << 5;
        /// Buffer capacity is a power of two.
        const POW2 = 1 << 6;
    }
}

/// Element class of a payload; fixes the element width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesClass {
    /// Array of value cells; the GC recurses into these.
    Cells,
    /// Byte scalars: Latin-1 strings and binaries.
    Bytes,
    /// Wide scalars: UCS-2 strings.
    Wide,
    /// Other width: hash indices and raw records.
    Ints,
}

pub enum SeriesData {
    Cells(Box<[Cell]>),
    Bytes(Box<[u8]>),
    Wide(Box<[u16]>),
    Ints(Box<[i32]>),
    /// Borrowed payload (embedded boot text and the like).
    External(&'static [u8]),
    /// Node is on the free list.
    Free { next: Option<SeriesId> },
}

impl SeriesData {
    fn capacity(&self) -> usize {
        match self {
            SeriesData::Cells(b) => b.len(),
            SeriesData::Bytes(b) => b.len(),
            SeriesData::Wide(b) => b.len(),
            SeriesData::Ints(b) => b.len(),
            SeriesData::External(b) => b.len(),
            SeriesData::Free { .. } => 0,
        }
    }
}

pub struct SeriesNode {
    pub flags: SeriesFlags,
    /// Unused prefix capacity (head bias) in elements.
    pub bias: u32,
    /// Current length in elements.
    pub tail: u32,
    pub data: SeriesData,
}

impl SeriesNode {
    /// Reserved capacity ("rest") in elements.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn len(&self) -> usize {
        self.tail as usize
    }

    pub fn is_empty(&self) -> bool {
        self.tail == 0
    }

    pub fn is_free(&self) -> bool {
        matches!(self.data, SeriesData::Free { .. })
    }

    pub fn is_managed(&self) -> bool {
        self.flags.contains(SeriesFlags::MANAGED)
    }

    pub fn class(&self) -> Option<SeriesClass> {
        match self.data {
            SeriesData::Cells(_) => Some(SeriesClass::Cells),
            SeriesData::Bytes(_) => Some(SeriesClass::Bytes),
            SeriesData::Wide(_) => Some(SeriesClass::Wide),
            SeriesData::Ints(_) => Some(SeriesClass::Ints),
            SeriesData::External(_) => Some(SeriesClass::Bytes),
            SeriesData::Free { .. } => None,
        }
    }

    pub fn is_cell_array(&self) -> bool {
        matches!(self.data, SeriesData::Cells(_))
    }
}

/// Failures surfaced by series operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesError {
    Mem(MemError),
    /// Capacity change on a locked series.
    Locked,
    /// Mutation of a protected series.
    Protected,
}

impl From<MemError> for SeriesError {
    fn from(e: MemError) -> SeriesError {
        SeriesError::Mem(e)
    }
}

/// Recently-expanded ring: consecutive expansions of the same series double
/// its capacity instead of growing incrementally.
const EXPAND_LRU: usize = 8;

/// Extra slack appended on a non-doubling reallocation.
const EXPAND_SLACK: usize = 4;

pub struct Arena {
    /// Node slab; index 0 is a permanently-free sentinel.
    nodes: Vec<SeriesNode>,
    free_head: Option<SeriesId>,
    pub pools: Pools,
    /// Unmanaged series, freed on trap unwind unless transferred.
    manuals: Vec<SeriesId>,
    /// Explicit GC guards for series held only in host locals.
    keep: Vec<SeriesId>,
    expand_lru: [Option<SeriesId>; EXPAND_LRU],
    lru_at: usize,
    live: usize,
}

impl Arena {
    pub fn new(pools: Pools) -> Arena {
        Arena {
            nodes: vec![SeriesNode {
                flags: SeriesFlags::empty(),
                bias: 0,
                tail: 0,
                data: SeriesData::Free { next: None },
            }],
            free_head: None,
            pools,
            manuals: Vec::new(),
            keep: Vec::new(),
            expand_lru: [None; EXPAND_LRU],
            lru_at: 0,
            live: 0,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    // ----- node plumbing -------------------------------------------------

    fn pop_node(&mut self) -> SeriesId {
        if let Some(id) = self.free_head {
            let next = match self.nodes[id.index()].data {
                SeriesData::Free { next } => next,
                _ => unreachable!("free list points at a live node"),
            };
            self.free_head = next;
            id
        } else {
            let id = SeriesId::new(self.nodes.len());
            self.nodes.push(SeriesNode {
                flags: SeriesFlags::empty(),
                bias: 0,
                tail: 0,
                data: SeriesData::Free { next: None },
            });
            id
        }
    }

    fn push_node(&mut self, id: SeriesId) {
        let node = &mut self.nodes[id.index()];
        node.flags = SeriesFlags::empty();
        node.bias = 0;
        node.tail = 0;
        node.data = SeriesData::Free { next: self.free_head };
        self.free_head = Some(id);
    }

    pub fn get(&self, id: SeriesId) -> &SeriesNode {
        let node = &self.nodes[id.index()];
        debug_assert!(!node.is_free(), "access to freed series {id:?}");
        node
    }

    pub fn get_mut(&mut self, id: SeriesId) -> &mut SeriesNode {
        let node = &mut self.nodes[id.index()];
        debug_assert!(!node.is_free(), "access to freed series {id:?}");
        node
    }

    /// Iterate live node ids (the sweep walk).
    pub fn live_ids(&self) -> impl Iterator<Item = SeriesId> + '_ {
        (1..self.nodes.len())
            .filter(|&i| !self.nodes[i].is_free())
            .map(SeriesId::new)
    }

    // ----- creation and lifecycle ---------------------------------------

    /// Allocate a series with room for `len` elements (plus the reserved end
    /// slot for cell arrays). Born manual.
    pub fn make(&mut self, class: SeriesClass, len: usize) -> Result<SeriesId, MemError> {
        let id = self.pop_node();
        let data = match class {
            SeriesClass::Cells => {
                // Cell arrays reserve a trailing end slot at every size.
                match self.pools.alloc_cells(len + 1) {
                    Ok(mut buf) => {
                        buf[0] = Cell::END;
                        SeriesData::Cells(buf)
                    }
                    Err(e) => {
                        // Payload refused: the header goes straight back.
                        self.push_node(id);
                        return Err(e);
                    }
                }
            }
            SeriesClass::Bytes => match self.pools.alloc_bytes(len.max(1)) {
                Ok(buf) => SeriesData::Bytes(buf),
                Err(e) => {
                    self.push_node(id);
                    return Err(e);
                }
            },
            SeriesClass::Wide => match self.pools.alloc_wides(len.max(1)) {
                Ok(buf) => SeriesData::Wide(buf),
                Err(e) => {
                    self.push_node(id);
                    return Err(e);
                }
            },
            SeriesClass::Ints => match self.pools.alloc_ints(len.max(1)) {
                Ok(buf) => SeriesData::Ints(buf),
                Err(e) => {
                    self.push_node(id);
                    return Err(e);
                }
            },
        };
        let mut flags = SeriesFlags::empty();
        if data.capacity().is_power_of_two() {
            flags |= SeriesFlags::POW2;
        }
        let node = &mut self.nodes[id.index()];
        node.flags = flags;
        node.bias = 0;
        node.tail = 0;
        node.data = data;
        self.live += 1;
        self.manuals.push(id);
        Ok(id)
    }

    /// Wrap a caller-owned byte payload. The pools never free it.
    pub fn make_external(&mut self, bytes: &'static [u8]) -> SeriesId {
        let id = self.pop_node();
        let node = &mut self.nodes[id.index()];
        node.flags = SeriesFlags::EXTERNAL;
        node.bias = 0;
        node.tail = bytes.len() as u32;
        node.data = SeriesData::External(bytes);
        self.live += 1;
        self.manuals.push(id);
        id
    }

    /// Transfer a manual series to the collector. Idempotent; a managed
    /// series is never unmanaged again.
    pub fn manage(&mut self, id: SeriesId) {
        let node = &mut self.nodes[id.index()];
        if node.is_managed() {
            return;
        }
        node.flags |= SeriesFlags::MANAGED;
        // Manuals behave as a stack; search from the most recent.
        if let Some(pos) = self.manuals.iter().rposition(|m| *m == id) {
            self.manuals.remove(pos);
        } else {
            debug_assert!(false, "manual series missing from manuals list");
        }
    }

    /// Free a manual series now. Loud failure on a managed one: only the
    /// collector may free those.
    pub fn free(&mut self, id: SeriesId) {
        let node = &self.nodes[id.index()];
        assert!(!node.is_managed(), "free of a managed series {id:?}");
        if let Some(pos) = self.manuals.iter().rposition(|m| *m == id) {
            self.manuals.remove(pos);
        }
        self.kill(id);
    }

    /// The kill path: reclaim payload and header without touching the
    /// manuals list. Used by the sweep (managed series are not on the list).
    pub(crate) fn kill(&mut self, id: SeriesId) {
        let node = &mut self.nodes[id.index()];
        debug_assert!(!node.is_free(), "double free of series {id:?}");
        let data = std::mem::replace(&mut node.data, SeriesData::Free { next: None });
        match data {
            SeriesData::Cells(buf) => self.pools.free_cells(buf),
            SeriesData::Bytes(buf) => self.pools.free_bytes(buf),
            SeriesData::Wide(buf) => self.pools.free_wides(buf),
            SeriesData::Ints(buf) => self.pools.free_ints(buf),
            // Caller-owned payload: header-only reclaim.
            SeriesData::External(_) => {}
            SeriesData::Free { .. } => unreachable!(),
        }
        self.live -= 1;
        for slot in self.expand_lru.iter_mut() {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        self.push_node(id);
    }

    // ----- manuals and keep marks ----------------------------------------

    pub fn manuals_mark(&self) -> usize {
        self.manuals.len()
    }

    /// Free every manual series pushed since `mark` (trap unwind).
    pub fn manuals_unwind(&mut self, mark: usize) {
        while self.manuals.len() > mark {
            let id = self.manuals[self.manuals.len() - 1];
            self.free(id);
        }
    }

    pub fn manuals(&self) -> &[SeriesId] {
        &self.manuals
    }

    pub fn keep_mark(&self) -> usize {
        self.keep.len()
    }

    pub fn keep_push(&mut self, id: SeriesId) {
        self.keep.push(id);
    }

    pub fn keep_truncate(&mut self, mark: usize) {
        self.keep.truncate(mark);
    }

    pub fn kept(&self) -> &[SeriesId] {
        &self.keep
    }

    // ----- element access -------------------------------------------------

    /// Cell at `index`, or the end marker past the tail. Cells are copied
    /// out; series storage is never borrowed across evaluation.
    pub fn cell_at(&self, id: SeriesId, index: usize) -> Cell {
        let node = self.get(id);
        if index >= node.len() {
            return Cell::END;
        }
        match &node.data {
            SeriesData::Cells(buf) => buf[node.bias as usize + index],
            _ => panic!("cell access on non-array series"),
        }
    }

    /// The live window of a cell-array series.
    pub fn cells(&self, id: SeriesId) -> &[Cell] {
        let node = self.get(id);
        match &node.data {
            SeriesData::Cells(buf) => {
                &buf[node.bias as usize..node.bias as usize + node.tail as usize]
            }
            _ => panic!("cell access on non-array series"),
        }
    }

    pub fn set_cell(&mut self, id: SeriesId, index: usize, cell: Cell) -> Result<(), SeriesError> {
        let node = self.get_mut(id);
        if node.flags.contains(SeriesFlags::PROTECTED) {
            return Err(SeriesError::Protected);
        }
        debug_assert!(!cell.is_end(), "end marker stored mid-series");
        let at = node.bias as usize + index;
        match &mut node.data {
            SeriesData::Cells(buf) => {
                debug_assert!(index < node.tail as usize);
                buf[at] = cell.stored();
                Ok(())
            }
            _ => panic!("cell store on non-array series"),
        }
    }

    /// Append one cell, growing as needed. The end marker follows the tail.
    pub fn push_cell(&mut self, id: SeriesId, cell: Cell) -> Result<(), SeriesError> {
        let tail = self.get(id).len();
        self.expand(id, tail, 1)?;
        let node = self.get_mut(id);
        let at = node.bias as usize + tail;
        match &mut node.data {
            SeriesData::Cells(buf) => buf[at] = cell.stored(),
            _ => panic!("cell store on non-array series"),
        }
        Ok(())
    }

    pub fn insert_cells(
        &mut self,
        id: SeriesId,
        at: usize,
        cells: &[Cell],
    ) -> Result<(), SeriesError> {
        self.expand(id, at, cells.len())?;
        let node = self.get_mut(id);
        let start = node.bias as usize + at;
        match &mut node.data {
            SeriesData::Cells(buf) => {
                for (i, c) in cells.iter().enumerate() {
                    buf[start + i] = c.stored();
                }
            }
            _ => panic!("cell store on non-array series"),
        }
        Ok(())
    }

    /// Drop everything at and past `len`, keeping the end marker honest.
    pub fn truncate_at(&mut self, id: SeriesId, len: usize) -> Result<(), SeriesError> {
        let node = self.get_mut(id);
        if node.flags.contains(SeriesFlags::PROTECTED) {
            return Err(SeriesError::Protected);
        }
        if len >= node.tail as usize {
            return Ok(());
        }
        node.tail = len as u32;
        let end_at = node.bias as usize + len;
        if let SeriesData::Cells(buf) = &mut node.data {
            buf[end_at] = Cell::END;
        }
        Ok(())
    }

    /// Remove `count` cells at `at`, compacting the tail.
    pub fn remove_cells(&mut self, id: SeriesId, at: usize, count: usize) -> Result<(), SeriesError> {
        let node = self.get_mut(id);
        if node.flags.contains(SeriesFlags::PROTECTED) {
            return Err(SeriesError::Protected);
        }
        let tail = node.tail as usize;
        if at >= tail || count == 0 {
            return Ok(());
        }
        let count = count.min(tail - at);
        let bias = node.bias as usize;
        match &mut node.data {
            SeriesData::Cells(buf) => {
                buf.copy_within(bias + at + count..bias + tail, bias + at);
                node.tail = (tail - count) as u32;
                buf[bias + tail - count] = Cell::END;
            }
            _ => panic!("cell removal on non-array series"),
        }
        Ok(())
    }

    pub fn bytes(&self, id: SeriesId) -> &[u8] {
        let node = self.get(id);
        let (bias, tail) = (node.bias as usize, node.tail as usize);
        match &node.data {
            SeriesData::Bytes(buf) => &buf[bias..bias + tail],
            SeriesData::External(buf) => &buf[bias..bias + tail],
            _ => panic!("byte access on non-byte series"),
        }
    }

    pub fn wides(&self, id: SeriesId) -> &[u16] {
        let node = self.get(id);
        match &node.data {
            SeriesData::Wide(buf) => {
                &buf[node.bias as usize..node.bias as usize + node.tail as usize]
            }
            _ => panic!("wide access on non-wide series"),
        }
    }

    pub fn ints(&self, id: SeriesId) -> &[i32] {
        let node = self.get(id);
        match &node.data {
            SeriesData::Ints(buf) => {
                &buf[node.bias as usize..node.bias as usize + node.tail as usize]
            }
            _ => panic!("int access on non-int series"),
        }
    }

    /// Character at `index` of a string series, whatever its width.
    pub fn char_at(&self, id: SeriesId, index: usize) -> Option<char> {
        let node = self.get(id);
        if index >= node.len() {
            return None;
        }
        let at = node.bias as usize + index;
        match &node.data {
            SeriesData::Bytes(buf) => Some(buf[at] as char),
            SeriesData::External(buf) => Some(buf[at] as char),
            SeriesData::Wide(buf) => char::from_u32(buf[at] as u32),
            _ => None,
        }
    }

    /// Decode a string series to owned text.
    pub fn text(&self, id: SeriesId) -> String {
        let node = self.get(id);
        match &node.data {
            SeriesData::Bytes(_) | SeriesData::External(_) => {
                self.bytes(id).iter().map(|b| *b as char).collect()
            }
            SeriesData::Wide(_) => self
                .wides(id)
                .iter()
                .filter_map(|w| char::from_u32(*w as u32))
                .collect(),
            _ => panic!("text access on non-string series"),
        }
    }

    /// Append one codepoint, widening a byte string when it first sees a
    /// codepoint past Latin-1.
    pub fn push_char(&mut self, id: SeriesId, ch: char) -> Result<(), SeriesError> {
        if (ch as u32) > 0xFF && matches!(self.get(id).data, SeriesData::Bytes(_)) {
            self.widen_string(id)?;
        }
        let tail = self.get(id).len();
        self.expand(id, tail, 1)?;
        let node = self.get_mut(id);
        let at = node.bias as usize + tail;
        match &mut node.data {
            SeriesData::Bytes(buf) => buf[at] = ch as u8,
            SeriesData::Wide(buf) => buf[at] = ch as u32 as u16,
            _ => panic!("char store on non-string series"),
        }
        Ok(())
    }

    /// Overwrite one codepoint in place, widening first when required.
    pub fn set_char(&mut self, id: SeriesId, index: usize, ch: char) -> Result<(), SeriesError> {
        if self.get(id).flags.contains(SeriesFlags::PROTECTED) {
            return Err(SeriesError::Protected);
        }
        if (ch as u32) > 0xFF && matches!(self.get(id).data, SeriesData::Bytes(_)) {
            self.widen_string(id)?;
        }
        let node = self.get_mut(id);
        debug_assert!(index < node.tail as usize);
        let at = node.bias as usize + index;
        match &mut node.data {
            SeriesData::Bytes(buf) => buf[at] = ch as u8,
            SeriesData::Wide(buf) => buf[at] = ch as u32 as u16,
            _ => panic!("char store on non-string series"),
        }
        Ok(())
    }

    pub fn set_byte(&mut self, id: SeriesId, index: usize, byte: u8) -> Result<(), SeriesError> {
        if self.get(id).flags.contains(SeriesFlags::PROTECTED) {
            return Err(SeriesError::Protected);
        }
        let node = self.get_mut(id);
        debug_assert!(index < node.tail as usize);
        let at = node.bias as usize + index;
        match &mut node.data {
            SeriesData::Bytes(buf) => buf[at] = byte,
            _ => panic!("byte store on non-byte series"),
        }
        Ok(())
    }

    pub fn push_byte(&mut self, id: SeriesId, byte: u8) -> Result<(), SeriesError> {
        let tail = self.get(id).len();
        self.expand(id, tail, 1)?;
        let node = self.get_mut(id);
        let at = node.bias as usize + tail;
        match &mut node.data {
            SeriesData::Bytes(buf) => buf[at] = byte,
            _ => panic!("byte store on non-byte series"),
        }
        Ok(())
    }

    // ----- growth ---------------------------------------------------------

    /// Insert `delta` uninitialized slots at `index`.
    ///
    /// Fast path: inserting at the head with enough bias just slides the
    /// window. Otherwise the tail portion moves up, reallocating when
    /// `tail + delta` (plus the end slot for cell arrays) outgrows the
    /// buffer. Consecutive expansions of the same series double its size.
    pub fn expand(&mut self, id: SeriesId, index: usize, delta: usize) -> Result<(), SeriesError> {
        if delta == 0 {
            return Ok(());
        }
        let (bias, tail, is_cells, capacity, flags) = {
            let node = self.get(id);
            (
                node.bias as usize,
                node.tail as usize,
                node.is_cell_array(),
                node.capacity(),
                node.flags,
            )
        };
        if flags.contains(SeriesFlags::PROTECTED) {
            return Err(SeriesError::Protected);
        }
        debug_assert!(index <= tail, "expansion past the tail");
        let end_slot = if is_cells { 1 } else { 0 };

        if index == 0 && bias >= delta {
            // Head-bias fast path.
            let node = self.get_mut(id);
            node.bias -= delta as u32;
            node.tail += delta as u32;
            return Ok(());
        }

        let needed = bias + tail + delta + end_slot;
        if needed > capacity {
            if flags.contains(SeriesFlags::LOCKED) {
                return Err(SeriesError::Locked);
            }
            let doubling = self.expand_lru.contains(&Some(id));
            let grown = if doubling { needed.max(capacity * 2) } else { needed + EXPAND_SLACK };
            self.reallocate(id, grown, index, delta)?;
            self.note_expanded(id);
            return Ok(());
        }

        // Slide the tail portion up within the existing buffer.
        let node = self.get_mut(id);
        match &mut node.data {
            SeriesData::Cells(buf) => {
                buf.copy_within(bias + index..bias + tail, bias + index + delta);
                node.tail += delta as u32;
                buf[bias + node.tail as usize] = Cell::END;
            }
            SeriesData::Bytes(buf) => {
                buf.copy_within(bias + index..bias + tail, bias + index + delta);
                node.tail += delta as u32;
            }
            SeriesData::Wide(buf) => {
                buf.copy_within(bias + index..bias + tail, bias + index + delta);
                node.tail += delta as u32;
            }
            SeriesData::Ints(buf) => {
                buf.copy_within(bias + index..bias + tail, bias + index + delta);
                node.tail += delta as u32;
            }
            SeriesData::External(_) => return Err(SeriesError::Locked),
            SeriesData::Free { .. } => unreachable!(),
        }
        self.note_expanded(id);
        Ok(())
    }

    fn note_expanded(&mut self, id: SeriesId) {
        if self.expand_lru.contains(&Some(id)) {
            return;
        }
        self.expand_lru[self.lru_at] = Some(id);
        self.lru_at = (self.lru_at + 1) % EXPAND_LRU;
    }

    /// Move to a fresh buffer of `capacity` elements, opening `delta` slots
    /// at `index`. Head bias is dropped in the process.
    fn reallocate(
        &mut self,
        id: SeriesId,
        capacity: usize,
        index: usize,
        delta: usize,
    ) -> Result<(), SeriesError> {
        let (bias, tail, class, external) = {
            let node = self.get(id);
            (
                node.bias as usize,
                node.tail as usize,
                node.class(),
                node.flags.contains(SeriesFlags::EXTERNAL),
            )
        };
        if external {
            return Err(SeriesError::Locked);
        }
        tracing::trace!(?id, capacity, "series reallocation");

        match class {
            Some(SeriesClass::Cells) => {
                let mut buf = self.pools.alloc_cells(capacity)?;
                let node = self.get_mut(id);
                if let SeriesData::Cells(old) = &node.data {
                    buf[..index].copy_from_slice(&old[bias..bias + index]);
                    buf[index + delta..tail + delta]
                        .copy_from_slice(&old[bias + index..bias + tail]);
                }
                buf[tail + delta] = Cell::END;
                let old = std::mem::replace(&mut node.data, SeriesData::Cells(buf));
                node.bias = 0;
                node.tail = (tail + delta) as u32;
                let pow2 = node.capacity().is_power_of_two();
                node.flags.set(SeriesFlags::POW2, pow2);
                if let SeriesData::Cells(old) = old {
                    self.pools.free_cells(old);
                }
            }
            Some(SeriesClass::Bytes) => {
                let mut buf = self.pools.alloc_bytes(capacity)?;
                let node = self.get_mut(id);
                if let SeriesData::Bytes(old) = &node.data {
                    buf[..index].copy_from_slice(&old[bias..bias + index]);
                    buf[index + delta..tail + delta]
                        .copy_from_slice(&old[bias + index..bias + tail]);
                }
                let old = std::mem::replace(&mut node.data, SeriesData::Bytes(buf));
                node.bias = 0;
                node.tail = (tail + delta) as u32;
                let pow2 = node.capacity().is_power_of_two();
                node.flags.set(SeriesFlags::POW2, pow2);
                if let SeriesData::Bytes(old) = old {
                    self.pools.free_bytes(old);
                }
            }
            Some(SeriesClass::Wide) => {
                let mut buf = self.pools.alloc_wides(capacity)?;
                let node = self.get_mut(id);
                if let SeriesData::Wide(old) = &node.data {
                    buf[..index].copy_from_slice(&old[bias..bias + index]);
                    buf[index + delta..tail + delta]
                        .copy_from_slice(&old[bias + index..bias + tail]);
                }
                let old = std::mem::replace(&mut node.data, SeriesData::Wide(buf));
                node.bias = 0;
                node.tail = (tail + delta) as u32;
                let pow2 = node.capacity().is_power_of_two();
                node.flags.set(SeriesFlags::POW2, pow2);
                if let SeriesData::Wide(old) = old {
                    self.pools.free_wides(old);
                }
            }
            Some(SeriesClass::Ints) => {
                let mut buf = self.pools.alloc_ints(capacity)?;
                let node = self.get_mut(id);
                if let SeriesData::Ints(old) = &node.data {
                    buf[..index].copy_from_slice(&old[bias..bias + index]);
                    buf[index + delta..tail + delta]
                        .copy_from_slice(&old[bias + index..bias + tail]);
                }
                let old = std::mem::replace(&mut node.data, SeriesData::Ints(buf));
                node.bias = 0;
                node.tail = (tail + delta) as u32;
                let pow2 = node.capacity().is_power_of_two();
                node.flags.set(SeriesFlags::POW2, pow2);
                if let SeriesData::Ints(old) = old {
                    self.pools.free_ints(old);
                }
            }
            Option::None => unreachable!("reallocation of a freed node"),
        }
        Ok(())
    }

    /// Reallocate to `units` elements, optionally preserving the head.
    /// A class change is permitted only when nothing is preserved.
    pub fn remake(
        &mut self,
        id: SeriesId,
        units: usize,
        class: SeriesClass,
        preserve: bool,
    ) -> Result<(), SeriesError> {
        let node = self.get(id);
        if node.flags.contains(SeriesFlags::LOCKED) {
            return Err(SeriesError::Locked);
        }
        if node.flags.contains(SeriesFlags::PROTECTED) {
            return Err(SeriesError::Protected);
        }
        debug_assert!(
            !preserve || node.class() == Some(class),
            "width change with preservation requested"
        );
        if preserve {
            let keep = node.len().min(units);
            let tail = node.len();
            let is_cells = node.is_cell_array();
            if keep < tail {
                let node = self.get_mut(id);
                node.tail = keep as u32;
                let end_at = node.bias as usize + keep;
                if let SeriesData::Cells(buf) = &mut node.data {
                    buf[end_at] = Cell::END;
                }
            }
            return self.reallocate(id, units + if is_cells { 1 } else { 0 }, 0, 0);
        }

        // Build the fresh payload first so a refused allocation leaves the
        // series intact; then retire the old buffer to its pool.
        let data = match class {
            SeriesClass::Cells => {
                let mut buf = self.pools.alloc_cells(units + 1)?;
                buf[0] = Cell::END;
                SeriesData::Cells(buf)
            }
            SeriesClass::Bytes => SeriesData::Bytes(self.pools.alloc_bytes(units.max(1))?),
            SeriesClass::Wide => SeriesData::Wide(self.pools.alloc_wides(units.max(1))?),
            SeriesClass::Ints => SeriesData::Ints(self.pools.alloc_ints(units.max(1))?),
        };
        let old = {
            let node = self.get_mut(id);
            node.bias = 0;
            node.tail = 0;
            let old = std::mem::replace(&mut node.data, data);
            let pow2 = node.capacity().is_power_of_two();
            node.flags.set(SeriesFlags::POW2, pow2);
            old
        };
        match old {
            SeriesData::Cells(buf) => self.pools.free_cells(buf),
            SeriesData::Bytes(buf) => self.pools.free_bytes(buf),
            SeriesData::Wide(buf) => self.pools.free_wides(buf),
            SeriesData::Ints(buf) => self.pools.free_ints(buf),
            SeriesData::External(_) => {}
            SeriesData::Free { .. } => unreachable!(),
        }
        Ok(())
    }

    /// Reallocate a byte string as a wide string, copying codepoints.
    pub fn widen_string(&mut self, id: SeriesId) -> Result<(), SeriesError> {
        let node = self.get(id);
        if node.flags.contains(SeriesFlags::LOCKED) {
            return Err(SeriesError::Locked);
        }
        let bias = node.bias as usize;
        let tail = node.tail as usize;
        let buf = self.pools.alloc_wides((tail + 8).next_power_of_two())?;
        let node = self.get_mut(id);
        let old = match std::mem::replace(&mut node.data, SeriesData::Wide(buf)) {
            SeriesData::Bytes(old) => old,
            other => {
                node.data = other;
                panic!("widen on non-byte series");
            }
        };
        if let SeriesData::Wide(buf) = &mut node.data {
            for (i, b) in old[bias..bias + tail].iter().enumerate() {
                buf[i] = *b as u16;
            }
        }
        node.bias = 0;
        let pow2 = node.capacity().is_power_of_two();
        node.flags.set(SeriesFlags::POW2, pow2);
        self.pools.free_bytes(old);
        Ok(())
    }

    // ----- structured copies ---------------------------------------------

    /// Copy a cell-array series from `from` to its tail. `deep` recurses
    /// into nested blocks, parens, and paths. The copy is manual.
    pub fn copy_block(
        &mut self,
        id: SeriesId,
        from: usize,
        deep: bool,
    ) -> Result<SeriesId, SeriesError> {
        let len = self.get(id).len().saturating_sub(from);
        let copy = self.make(SeriesClass::Cells, len)?;
        for i in 0..len {
            let mut cell = self.cell_at(id, from + i);
            if deep {
                if let Some(r) = cell.value.series_ref() {
                    if self.get(r.series).is_cell_array()
                        && cell.value.is_block_like()
                    {
                        let nested = self.copy_block(r.series, 0, true)?;
                        if let Some(nr) = cell.value.series_ref_mut() {
                            nr.series = nested;
                        }
                    }
                }
            }
            self.push_cell(copy, cell)?;
        }
        Ok(copy)
    }

    /// Manage a block and every nested block a deep copy just produced.
    pub fn manage_deep(&mut self, id: SeriesId) {
        self.manage(id);
        if !self.get(id).is_cell_array() {
            return;
        }
        for i in 0..self.get(id).len() {
            let cell = self.cell_at(id, i);
            if let Some(r) = cell.value.series_ref() {
                if !self.get(r.series).is_managed() {
                    self.manage_deep(r.series);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalFlags;
    use crate::value::Value;

    fn arena() -> Arena {
        Arena::new(Pools::new(false, 1 << 20, SignalFlags::new()))
    }

    fn int(n: i64) -> Cell {
        Cell::new(Value::Integer(n))
    }

    #[test]
    fn test_new_series_is_manual_with_end_marker() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 4).unwrap();
        assert!(!a.get(id).is_managed());
        assert_eq!(a.manuals(), &[id]);
        assert_eq!(a.get(id).len(), 0);
        assert!(a.cell_at(id, 0).is_end());
    }

    #[test]
    fn test_push_keeps_end_marker_in_place() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 1).unwrap();
        for n in 0..20 {
            a.push_cell(id, int(n)).unwrap();
        }
        assert_eq!(a.get(id).len(), 20);
        for n in 0..20 {
            assert_eq!(a.cell_at(id, n as usize), int(n));
        }
        // The slot at the tail is the end marker even across reallocations.
        let node = a.get(id);
        if let SeriesData::Cells(buf) = &node.data {
            assert!(buf[node.bias as usize + 20].is_end());
        }
    }

    #[test]
    fn test_expand_preserves_prefix_and_terminator() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 2).unwrap();
        for n in 0..5 {
            a.push_cell(id, int(n)).unwrap();
        }
        a.expand(id, 2, 3).unwrap();
        assert_eq!(a.get(id).len(), 8);
        assert_eq!(a.cell_at(id, 0), int(0));
        assert_eq!(a.cell_at(id, 1), int(1));
        assert_eq!(a.cell_at(id, 5), int(2));
        assert_eq!(a.cell_at(id, 7), int(4));
        assert!(a.cell_at(id, 8).is_end());
    }

    #[test]
    fn test_head_bias_fast_path() {
        let mut a = arena();
        let id = a.make(SeriesClass::Bytes, 8).unwrap();
        for b in b"tail" {
            a.push_byte(id, *b).unwrap();
        }
        // Remove from the head by sliding the bias up.
        let node = a.get_mut(id);
        node.bias += 1;
        node.tail -= 1;
        assert_eq!(a.bytes(id), b"ail");
        // Inserting at the head reuses the bias without moving data.
        a.expand(id, 0, 1).unwrap();
        let node = a.get(id);
        assert_eq!(node.bias, 0);
        assert_eq!(node.len(), 4);
    }

    #[test]
    fn test_consecutive_expansion_doubles() {
        let mut a = arena();
        let id = a.make(SeriesClass::Bytes, 16).unwrap();
        for _ in 0..17 {
            a.push_byte(id, 1).unwrap();
        }
        let cap_first = a.get(id).capacity();
        let mut grown_at = a.get(id).len();
        while a.get(id).capacity() == cap_first {
            a.push_byte(id, 1).unwrap();
            grown_at += 1;
        }
        let _ = grown_at;
        // The second growth of a recently-expanded series is a doubling.
        assert!(a.get(id).capacity() >= cap_first * 2);
    }

    #[test]
    fn test_free_requires_manual() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 2).unwrap();
        a.free(id);
        assert_eq!(a.manuals_mark(), 0);
        assert_eq!(a.live_count(), 0);
    }

    #[test]
    #[should_panic(expected = "free of a managed series")]
    fn test_free_of_managed_fails_loudly() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 2).unwrap();
        a.manage(id);
        a.free(id);
    }

    #[test]
    fn test_manuals_unwind_frees_in_reverse() {
        let mut a = arena();
        let keep = a.make(SeriesClass::Cells, 1).unwrap();
        let mark = a.manuals_mark();
        let _x = a.make(SeriesClass::Cells, 1).unwrap();
        let _y = a.make(SeriesClass::Bytes, 8).unwrap();
        assert_eq!(a.live_count(), 3);
        a.manuals_unwind(mark);
        assert_eq!(a.live_count(), 1);
        assert_eq!(a.manuals(), &[keep]);
    }

    #[test]
    fn test_manage_unlinks_from_manuals() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 1).unwrap();
        a.manage(id);
        assert!(a.get(id).is_managed());
        assert!(a.manuals().is_empty());
        // Unwinding past it must not free it now.
        a.manuals_unwind(0);
        assert_eq!(a.live_count(), 1);
    }

    #[test]
    fn test_protected_rejects_mutation() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 2).unwrap();
        a.push_cell(id, int(1)).unwrap();
        a.get_mut(id).flags |= SeriesFlags::PROTECTED;
        assert_eq!(a.set_cell(id, 0, int(2)), Err(SeriesError::Protected));
        assert_eq!(a.push_cell(id, int(3)), Err(SeriesError::Protected));
    }

    #[test]
    fn test_locked_rejects_reallocation_but_not_writes() {
        let mut a = arena();
        let id = a.make(SeriesClass::Bytes, 4).unwrap();
        a.push_byte(id, 1).unwrap();
        a.get_mut(id).flags |= SeriesFlags::LOCKED;
        // In-place writes are fine while capacity remains.
        a.push_byte(id, 2).unwrap();
        // Exceeding capacity would move the buffer: refused.
        let mut res = Ok(());
        for _ in 0..64 {
            res = a.push_byte(id, 3);
            if res.is_err() {
                break;
            }
        }
        assert_eq!(res, Err(SeriesError::Locked));
    }

    #[test]
    fn test_widen_string_preserves_codepoints() {
        let mut a = arena();
        let id = a.make(SeriesClass::Bytes, 4).unwrap();
        for ch in "abc".chars() {
            a.push_char(id, ch).unwrap();
        }
        a.push_char(id, 'é').unwrap(); // still Latin-1
        a.push_char(id, '∆').unwrap(); // forces the widening
        assert!(matches!(a.get(id).data, SeriesData::Wide(_)));
        assert_eq!(a.text(id), "abcé∆");
    }

    #[test]
    fn test_remake_preserving_head() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 4).unwrap();
        for n in 0..4 {
            a.push_cell(id, int(n)).unwrap();
        }
        a.remake(id, 2, SeriesClass::Cells, true).unwrap();
        assert_eq!(a.get(id).len(), 2);
        assert_eq!(a.cell_at(id, 0), int(0));
        assert_eq!(a.cell_at(id, 1), int(1));
        assert!(a.cell_at(id, 2).is_end());
    }

    #[test]
    fn test_copy_block_deep() {
        let mut a = arena();
        let inner = a.make(SeriesClass::Cells, 1).unwrap();
        a.push_cell(inner, int(9)).unwrap();
        let outer = a.make(SeriesClass::Cells, 2).unwrap();
        a.push_cell(outer, int(1)).unwrap();
        a.push_cell(outer, Cell::new(Value::Block(crate::value::SeriesRef::head(inner))))
            .unwrap();

        let copy = a.copy_block(outer, 0, true).unwrap();
        let copied_inner = match a.cell_at(copy, 1).value {
            Value::Block(r) => r.series,
            other => panic!("expected block, got {other:?}"),
        };
        assert_ne!(copied_inner, inner, "deep copy must not share nested series");
        // Mutating the copy leaves the original alone.
        a.set_cell(copied_inner, 0, int(42)).unwrap();
        assert_eq!(a.cell_at(inner, 0), int(9));
    }

    #[test]
    fn test_external_series_borrow_their_payload() {
        static PAYLOAD: &[u8] = b"embedded";
        let mut a = arena();
        let id = a.make_external(PAYLOAD);
        assert!(a.get(id).flags.contains(SeriesFlags::EXTERNAL));
        assert_eq!(a.bytes(id), b"embedded");
        assert_eq!(a.char_at(id, 0), Some('e'));
        // Freeing reclaims the header only; the payload is borrowed.
        a.free(id);
        assert_eq!(a.live_count(), 0);
        assert_eq!(PAYLOAD, b"embedded");
    }

    #[test]
    fn test_node_ids_are_reused_after_free() {
        let mut a = arena();
        let id = a.make(SeriesClass::Cells, 1).unwrap();
        a.free(id);
        let id2 = a.make(SeriesClass::Bytes, 8).unwrap();
        assert_eq!(id, id2, "freed header goes back to the node pool");
    }
}

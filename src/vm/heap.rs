use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use serde::Serialize;

use super::error::{VmError, VmResult};
use super::value::{Value, ValueKind};

/// Longest array `NEWARRAY` may create.
pub const MAX_ARRAY_LEN: usize = 1 << 26;

/// A heap block: slot 0 is the header `INT(count)`, elements follow.
///
/// The arena holds one share; hosts may clone more with [`Heap::share`].
pub type Block = Rc<RefCell<Vec<Value>>>;

// =============================================================================
// Statistics
// =============================================================================

/// Per-heap collection statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    pub cycles: usize,
    pub freed_blocks: usize,
    pub total_pause_us: u64,
    pub max_pause_us: u64,
}

// =============================================================================
// Heap
// =============================================================================

/// Index arena of array blocks with a stop-the-world mark-sweep collector.
///
/// Blocks never move; an `OBJECT` value stores the arena index. Vacated
/// indices go on a free list and are reused by later allocations.
pub struct Heap {
    slots: Vec<Option<Block>>,
    free_list: Vec<u32>,
    live: usize,
    /// Live-block count that triggers the next collection.
    watermark: usize,
    /// Lower bound for the watermark after a collection.
    min_watermark: usize,
    gc_enabled: bool,
    stats: GcStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::new_with_config(1024, true)
    }

    pub fn new_with_config(gc_threshold: usize, gc_enabled: bool) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
            watermark: gc_threshold,
            min_watermark: gc_threshold,
            gc_enabled,
            stats: GcStats::default(),
        }
    }

    /// Allocate an array of `len` nil elements and return its heap index.
    pub fn alloc_array(&mut self, len: usize) -> VmResult<u32> {
        if len > MAX_ARRAY_LEN {
            return Err(VmError::ArrayTooLarge { len });
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(len + 1)
            .map_err(|_| VmError::ArrayTooLarge { len })?;
        slots.push(Value::int(len as i32));
        slots.resize(len + 1, Value::NIL);
        let block = Rc::new(RefCell::new(slots));

        self.live += 1;
        match self.free_list.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(block);
                Ok(index)
            }
            None => {
                self.slots.push(Some(block));
                Ok((self.slots.len() - 1) as u32)
            }
        }
    }

    fn block(&self, index: u32) -> VmResult<&Block> {
        self.slots
            .get(index as usize)
            .and_then(Option::as_ref)
            .ok_or(VmError::InvalidHeapIndex { index })
    }

    /// Clone the arena's `Rc` share of a block.
    pub fn share(&self, index: u32) -> VmResult<Block> {
        self.block(index).map(Rc::clone)
    }

    pub fn len(&self, index: u32) -> VmResult<usize> {
        Ok(self.block(index)?.borrow().len() - 1)
    }

    pub fn get(&self, index: u32, elem: i32) -> VmResult<Value> {
        let block = self.block(index)?.borrow();
        let len = block.len() - 1;
        if elem < 0 || elem as usize >= len {
            return Err(VmError::IndexOutOfBounds {
                index: elem as i64,
                len,
            });
        }
        Ok(block[elem as usize + 1])
    }

    pub fn set(&mut self, index: u32, elem: i32, value: Value) -> VmResult<()> {
        let mut block = self.block(index)?.borrow_mut();
        let len = block.len() - 1;
        if elem < 0 || elem as usize >= len {
            return Err(VmError::IndexOutOfBounds {
                index: elem as i64,
                len,
            });
        }
        block[elem as usize + 1] = value;
        Ok(())
    }

    /// Elements of a block, copied out.
    pub fn elements(&self, index: u32) -> VmResult<Vec<Value>> {
        Ok(self.block(index)?.borrow()[1..].to_vec())
    }

    pub fn contains(&self, index: u32) -> bool {
        self.block(index).is_ok()
    }

    /// Number of occupied arena slots.
    pub fn live_blocks(&self) -> usize {
        self.live
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Check if a collection is due.
    pub fn should_gc(&self) -> bool {
        self.gc_enabled && self.live >= self.watermark
    }

    fn is_marked(block: &Block) -> bool {
        block.borrow()[0].is_marked()
    }

    fn set_marked(block: &Block, marked: bool) {
        let mut slots = block.borrow_mut();
        slots[0] = slots[0].with_mark(marked);
    }

    /// Clear the mark bit on every occupied block.
    fn reset_marks(&mut self) {
        for block in self.slots.iter().flatten() {
            Self::set_marked(block, false);
        }
    }

    /// Mark phase: mark every block reachable from `roots`.
    pub fn mark(&mut self, roots: &[Value]) {
        let mut worklist: Vec<u32> = roots.iter().filter_map(|v| v.as_object()).collect();

        while let Some(index) = worklist.pop() {
            // Stale indices in dead registers are not references.
            let Ok(block) = self.block(index) else {
                continue;
            };
            if Self::is_marked(block) {
                continue;
            }
            Self::set_marked(block, true);

            let slots = block.borrow();
            worklist.extend(slots[1..].iter().filter_map(|v| match v.kind() {
                ValueKind::Object(child) => Some(child),
                _ => None,
            }));
        }
    }

    /// Sweep phase: vacate every unmarked slot. Returns the number freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let dead = matches!(slot, Some(block) if !Self::is_marked(block));
            if dead {
                *slot = None;
                self.free_list.push(index as u32);
                freed += 1;
            }
        }
        self.live -= freed;
        freed
    }

    /// Perform a full collection cycle and record its statistics.
    pub fn collect(&mut self, roots: &[Value]) -> usize {
        let start = Instant::now();

        self.reset_marks();
        self.mark(roots);
        let freed = self.sweep();
        self.watermark = (self.live * 2).max(self.min_watermark);

        let pause_us = start.elapsed().as_micros() as u64;
        self.stats.cycles += 1;
        self.stats.freed_blocks += freed;
        self.stats.total_pause_us += pause_us;
        self.stats.max_pause_us = self.stats.max_pause_us.max(pause_us);

        tracing::debug!(
            freed,
            live = self.live,
            watermark = self.watermark,
            pause_us,
            "gc cycle"
        );
        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_access() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(3).unwrap();
        assert_eq!(heap.len(a).unwrap(), 3);
        assert_eq!(heap.get(a, 0).unwrap(), Value::NIL);

        heap.set(a, 2, Value::int(7)).unwrap();
        assert_eq!(heap.get(a, 2).unwrap(), Value::int(7));
        assert_eq!(heap.share(a).unwrap().borrow()[0], Value::int(3));
    }

    #[test]
    fn test_bounds() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(2).unwrap();
        assert_eq!(
            heap.get(a, 2),
            Err(VmError::IndexOutOfBounds { index: 2, len: 2 })
        );
        assert!(heap.set(a, -1, Value::NIL).is_err());
        assert_eq!(heap.len(99), Err(VmError::InvalidHeapIndex { index: 99 }));
    }

    #[test]
    fn test_collect_frees_unreachable() {
        let mut heap = Heap::new();
        let live = heap.alloc_array(1).unwrap();
        let dead = heap.alloc_array(1).unwrap();
        let weak = Rc::downgrade(&heap.share(dead).unwrap());

        let freed = heap.collect(&[Value::object(live)]);
        assert_eq!(freed, 1);
        assert_eq!(heap.live_blocks(), 1);
        assert!(heap.contains(live));
        assert!(!heap.contains(dead));
        assert_eq!(weak.strong_count(), 0);
    }

    #[test]
    fn test_collect_traces_nested_arrays() {
        let mut heap = Heap::new();
        let outer = heap.alloc_array(1).unwrap();
        let inner = heap.alloc_array(2).unwrap();
        heap.set(inner, 1, Value::int(42)).unwrap();
        heap.set(outer, 0, Value::object(inner)).unwrap();

        heap.collect(&[Value::object(outer)]);
        assert_eq!(heap.live_blocks(), 2);
        assert_eq!(heap.get(inner, 1).unwrap(), Value::int(42));

        // Marks are reset between cycles.
        heap.collect(&[Value::NIL]);
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(1).unwrap();
        let b = heap.alloc_array(1).unwrap();
        heap.set(a, 0, Value::object(b)).unwrap();
        heap.set(b, 0, Value::object(a)).unwrap();

        heap.collect(&[Value::object(a)]);
        assert_eq!(heap.live_blocks(), 2);
        heap.collect(&[]);
        assert_eq!(heap.live_blocks(), 0);
    }

    #[test]
    fn test_host_share_survives_sweep() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(1).unwrap();
        heap.set(a, 0, Value::int(5)).unwrap();
        let held = heap.share(a).unwrap();

        heap.collect(&[]);
        assert!(!heap.contains(a));
        assert_eq!(held.borrow()[1], Value::int(5));
    }

    #[test]
    fn test_oversized_array_is_an_error() {
        let mut heap = Heap::new();
        assert_eq!(
            heap.alloc_array(i32::MAX as usize),
            Err(VmError::ArrayTooLarge {
                len: i32::MAX as usize
            })
        );
        assert!(heap.alloc_array(MAX_ARRAY_LEN + 1).is_err());
        assert_eq!(heap.live_blocks(), 0);
        let a = heap.alloc_array(16).unwrap();
        assert_eq!(heap.len(a).unwrap(), 16);
    }

    #[test]
    fn test_free_list_reuse() {
        let mut heap = Heap::new();
        let a = heap.alloc_array(0).unwrap();
        heap.collect(&[]);
        let b = heap.alloc_array(4).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.len(b).unwrap(), 4);
    }

    #[test]
    fn test_watermark_policy() {
        let mut heap = Heap::new_with_config(2, true);
        let a = heap.alloc_array(0).unwrap();
        assert!(!heap.should_gc());
        let b = heap.alloc_array(0).unwrap();
        assert!(heap.should_gc());

        heap.collect(&[Value::object(a), Value::object(b)]);
        assert_eq!(heap.watermark(), 4);
        assert_eq!(heap.stats().cycles, 1);

        let disabled = Heap::new_with_config(0, false);
        assert!(!disabled.should_gc());
    }
}

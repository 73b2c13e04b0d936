//! The managed heap as seen by the runtime.
//!
//! Objects live in an arena indexed by [`ObjRef`]; each also owns an address
//! in a simulated address space so that TLAB bump allocation, card marking
//! and emitted code agree on where objects are. Space is handed out in two
//! ways:
//! - thread-local buffers (`alloc_tlab`), refilled when a thread overflows
//! - a shared bump pointer for objects too large for a TLAB

mod object;

pub use object::{
    array_size, instance_size, ArrayData, HeapObject, LockWord, ObjectBody, PrimitiveType,
    ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET, CLASS_OFFSET, HEADER_SIZE, LOCK_WORD_MARK_BIT_SHIFT,
    LOCK_WORD_OFFSET, LOCK_WORD_READ_BARRIER_SHIFT, REFERENCE_SIZE, WIDE_ARRAY_DATA_OFFSET,
};

use crate::barrier::CardTable;
use crate::config::GcConfig;
use crate::stats::GcStats;
use crate::tlab::Tlab;

use ember_core::{ClassId, EmberError, EmberResult, ObjRef};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

/// First address handed out by the heap. Address 0 stays unmapped.
pub const HEAP_BASE: usize = 0x10_0000;

/// The object arena plus its address-space bookkeeping.
pub struct Heap {
    config: GcConfig,
    objects: RwLock<Vec<HeapObject>>,
    /// Next free address in the shared space.
    top: Mutex<usize>,
    card_table: CardTable,
    stats: GcStats,
}

impl Heap {
    /// Create a heap with the given configuration.
    pub fn new(config: GcConfig) -> EmberResult<Self> {
        config
            .validate()
            .map_err(|e| EmberError::invalid_state(format!("gc config: {e}")))?;
        let card_table = CardTable::new(HEAP_BASE, config.heap_capacity, config.card_shift);
        debug!(
            capacity = config.heap_capacity,
            tlab_size = config.tlab_size,
            read_barrier = %config.read_barrier,
            "heap created"
        );
        Ok(Self {
            config,
            objects: RwLock::new(Vec::new()),
            top: Mutex::new(HEAP_BASE),
            card_table,
            stats: GcStats::new(),
        })
    }

    /// Heap configuration.
    #[inline]
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Allocation and barrier counters.
    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// The write-barrier card table.
    #[inline]
    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// Number of live objects in the arena.
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Bytes of address space consumed so far.
    pub fn bytes_reserved(&self) -> usize {
        *self.top.lock() - HEAP_BASE
    }

    // =========================================================================
    // Address space
    // =========================================================================

    fn reserve(&self, bytes: usize) -> EmberResult<usize> {
        let mut top = self.top.lock();
        let end = top
            .checked_add(bytes)
            .filter(|&end| end <= HEAP_BASE + self.config.heap_capacity)
            .ok_or(EmberError::OutOfMemory { bytes })?;
        let start = *top;
        *top = end;
        Ok(start)
    }

    /// Register a new thread-local buffer able to hold at least `min_bytes`.
    ///
    /// The buffer's allocation end is `tlab_size` past its start; a reserved
    /// tail of the same size up to `limit` lets the owner `expand` in place.
    pub fn alloc_tlab(&self, min_bytes: usize) -> EmberResult<Tlab> {
        let size = ember_core::bits::align_up(
            min_bytes.max(self.config.tlab_size),
            self.config.object_alignment,
        );
        let start = self.reserve(size * 2)?;
        trace!(start, size, "tlab registered");
        Ok(Tlab::new(start, start + size, start + size * 2))
    }

    /// Find `size` bytes for a new object, preferring `tlab`.
    ///
    /// Returns the address and whether it came from the thread's buffer.
    fn allocate_address(&self, tlab: &mut Tlab, size: usize) -> EmberResult<(usize, bool)> {
        if !self.config.use_tlab || size > self.config.tlab_size / 2 {
            return Ok((self.reserve(size)?, false));
        }
        if let Some(addr) = tlab.alloc(size) {
            return Ok((addr, true));
        }
        let shortfall = size - tlab.remaining();
        if !tlab.is_empty() && tlab.expand(shortfall) {
            trace!(bytes = shortfall, "tlab expanded");
        } else {
            let wasted = if tlab.is_empty() { 0 } else { tlab.limit() - tlab.pos() };
            *tlab = self.alloc_tlab(size)?;
            self.stats.record_tlab_refill(wasted);
        }
        match tlab.alloc(size) {
            Some(addr) => Ok((addr, true)),
            None => ember_core::fatal!("fresh tlab cannot hold {} bytes", size),
        }
    }

    fn install(&self, tlab: &mut Tlab, class: ClassId, size: usize, body: ObjectBody) -> EmberResult<ObjRef> {
        let (address, from_tlab) = self.allocate_address(tlab, size)?;
        if self.config.verify_heap {
            tlab.check_invariant();
        }
        self.stats.record_allocation(size, from_tlab);
        let mut objects = self.objects.write();
        let obj = ObjRef::from_index(objects.len());
        objects.push(HeapObject {
            class,
            address,
            size,
            lock_word: LockWord::default(),
            body,
        });
        Ok(obj)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a zeroed instance.
    pub fn alloc_object(
        &self,
        tlab: &mut Tlab,
        class: ClassId,
        prim_slots: usize,
        ref_slots: usize,
    ) -> EmberResult<ObjRef> {
        let size = instance_size(prim_slots, ref_slots, self.config.object_alignment);
        let body = ObjectBody::Instance {
            prims: vec![0; prim_slots],
            refs: vec![None; ref_slots],
        };
        self.install(tlab, class, size, body)
    }

    /// Allocate a zero-filled array.
    pub fn alloc_array(
        &self,
        tlab: &mut Tlab,
        class: ClassId,
        component: PrimitiveType,
        length: usize,
    ) -> EmberResult<ObjRef> {
        let data = ArrayData::zeroed(component, length);
        self.alloc_array_from(tlab, class, data)
    }

    /// Allocate an array holding `data`.
    pub fn alloc_array_from(&self, tlab: &mut Tlab, class: ClassId, data: ArrayData) -> EmberResult<ObjRef> {
        let size = array_size(&data, self.config.object_alignment);
        self.install(tlab, class, size, ObjectBody::Array(data))
    }

    /// Allocate a string from Rust text.
    pub fn alloc_string(&self, tlab: &mut Tlab, class: ClassId, value: &str) -> EmberResult<ObjRef> {
        let chars: Vec<u16> = value.encode_utf16().collect();
        let size = ember_core::bits::align_up(
            ARRAY_DATA_OFFSET as usize + chars.len() * 2,
            self.config.object_alignment,
        );
        self.install(tlab, class, size, ObjectBody::String(chars))
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Run `f` against an object.
    pub fn with<R>(&self, obj: ObjRef, f: impl FnOnce(&HeapObject) -> R) -> R {
        let objects = self.objects.read();
        match objects.get(obj.index()) {
            Some(o) => f(o),
            None => ember_core::fatal!("dangling reference {:?}", obj),
        }
    }

    /// Run `f` against an object mutably.
    pub fn with_mut<R>(&self, obj: ObjRef, f: impl FnOnce(&mut HeapObject) -> R) -> R {
        let mut objects = self.objects.write();
        match objects.get_mut(obj.index()) {
            Some(o) => f(o),
            None => ember_core::fatal!("dangling reference {:?}", obj),
        }
    }

    /// Copy of an object.
    pub fn get(&self, obj: ObjRef) -> HeapObject {
        self.with(obj, HeapObject::clone)
    }

    /// Class of an object.
    #[inline]
    pub fn class_of(&self, obj: ObjRef) -> ClassId {
        self.with(obj, |o| o.class)
    }

    /// Address of an object.
    #[inline]
    pub fn address_of(&self, obj: ObjRef) -> usize {
        self.with(obj, |o| o.address)
    }

    /// Allocated size of an object.
    pub fn object_size(&self, obj: ObjRef) -> usize {
        self.with(obj, |o| o.size)
    }

    /// Read a primitive instance slot.
    pub fn get_field_prim(&self, obj: ObjRef, slot: usize) -> u64 {
        self.with(obj, |o| match &o.body {
            ObjectBody::Instance { prims, .. } if slot < prims.len() => prims[slot],
            _ => ember_core::fatal!("bad primitive slot {} on {:?}", slot, obj),
        })
    }

    /// Write a primitive instance slot.
    pub fn set_field_prim(&self, obj: ObjRef, slot: usize, value: u64) {
        self.with_mut(obj, |o| match &mut o.body {
            ObjectBody::Instance { prims, .. } if slot < prims.len() => prims[slot] = value,
            _ => ember_core::fatal!("bad primitive slot {} on {:?}", slot, obj),
        })
    }

    /// Read a reference instance slot.
    pub fn get_field_ref(&self, obj: ObjRef, slot: usize) -> Option<ObjRef> {
        self.with(obj, |o| match &o.body {
            ObjectBody::Instance { refs, .. } if slot < refs.len() => refs[slot],
            _ => ember_core::fatal!("bad reference slot {} on {:?}", slot, obj),
        })
    }

    /// Write a reference instance slot and dirty the holder's card.
    pub fn set_field_ref(&self, obj: ObjRef, slot: usize, value: Option<ObjRef>) {
        self.with_mut(obj, |o| match &mut o.body {
            ObjectBody::Instance { refs, .. } if slot < refs.len() => refs[slot] = value,
            _ => ember_core::fatal!("bad reference slot {} on {:?}", slot, obj),
        });
        if value.is_some() {
            self.mark_gc_card(obj);
        }
    }

    /// Array length, or `None` if `obj` is not an array.
    pub fn array_length(&self, obj: ObjRef) -> Option<usize> {
        self.with(obj, |o| o.as_array().map(ArrayData::len))
    }

    /// Element of an array as raw bits. `None` if out of bounds or not an array.
    pub fn array_get(&self, obj: ObjRef, index: usize) -> Option<u64> {
        self.with(obj, |o| o.as_array().and_then(|a| a.get_raw(index)))
    }

    /// Store raw bits into an array element. Returns `false` if out of bounds.
    pub fn array_set(&self, obj: ObjRef, index: usize, bits: u64) -> bool {
        let (stored, is_ref) = self.with_mut(obj, |o| match o.as_array_mut() {
            Some(a) => (a.set_raw(index, bits), a.component() == PrimitiveType::Reference),
            None => (false, false),
        });
        if stored && is_ref && bits != 0 {
            self.mark_gc_card(obj);
        }
        stored
    }

    /// Rust text of a string object, or `None` if `obj` is not a string.
    pub fn string_value(&self, obj: ObjRef) -> Option<String> {
        self.with(obj, |o| o.as_string().map(String::from_utf16_lossy))
    }

    /// Lock word of an object.
    #[inline]
    pub fn lock_word(&self, obj: ObjRef) -> LockWord {
        self.with(obj, |o| o.lock_word)
    }

    /// Replace the lock word of an object.
    pub fn set_lock_word(&self, obj: ObjRef, word: LockWord) {
        self.with_mut(obj, |o| o.lock_word = word);
    }

    /// Identity hash, assigned on first request.
    pub fn identity_hash(&self, obj: ObjRef) -> u32 {
        self.with_mut(obj, |o| {
            if o.lock_word.hash() == 0 {
                let seed = (o.address as u32 >> 3).wrapping_mul(0x9e37_79b9) >> 4;
                o.lock_word = o.lock_word.with_hash(seed.max(1));
            }
            o.lock_word.hash()
        })
    }

    // =========================================================================
    // Barriers
    // =========================================================================

    /// Dirty the card covering `holder`.
    #[inline]
    pub fn mark_gc_card(&self, holder: ObjRef) {
        let addr = self.address_of(holder);
        if self.card_table.mark(addr) {
            self.stats.record_card_mark();
        }
    }

    /// Read-barrier slow path: mark `obj` and return its current location.
    ///
    /// The arena never moves objects, so the returned reference is `obj`
    /// itself; the gray bit is cleared and the mark bit set.
    pub fn read_barrier_mark(&self, obj: ObjRef) -> ObjRef {
        let was_gray = self.with_mut(obj, |o| {
            let gray = o.lock_word.is_gray();
            o.lock_word = o.lock_word.with_gray(false).marked();
            gray
        });
        self.stats.record_read_barrier(was_gray);
        obj
    }

    /// Set or clear the gray bit, as a concurrent copier would.
    pub fn set_gray(&self, obj: ObjRef, gray: bool) {
        self.with_mut(obj, |o| o.lock_word = o.lock_word.with_gray(gray));
    }

    /// Call `f` for every object in allocation order.
    pub fn visit_objects<F: FnMut(ObjRef, &HeapObject)>(&self, mut f: F) {
        for (i, o) in self.objects.read().iter().enumerate() {
            f(ObjRef::from_index(i), o);
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.object_count())
            .field("reserved", &self.bytes_reserved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(GcConfig::testing()).unwrap()
    }

    #[test]
    fn test_alloc_object_from_tlab() {
        let heap = heap();
        let mut tlab = Tlab::EMPTY;
        let a = heap.alloc_object(&mut tlab, ClassId(1), 2, 1).unwrap();
        let b = heap.alloc_object(&mut tlab, ClassId(1), 0, 0).unwrap();

        assert!(!tlab.is_empty());
        assert_eq!(heap.address_of(a), tlab.start());
        assert_eq!(heap.address_of(b), tlab.start() + heap.object_size(a));
        assert_eq!(heap.stats().snapshot().tlab_allocations, 2);
        assert_eq!(heap.stats().snapshot().tlab_refills, 1);
    }

    #[test]
    fn test_tlab_expands_before_refill() {
        let heap = heap();
        let mut tlab = heap.alloc_tlab(0).unwrap();
        let start = tlab.start();
        let end = tlab.end();
        // Fill all but 8 bytes of the buffer.
        tlab.alloc(end - start - 8).unwrap();

        heap.alloc_object(&mut tlab, ClassId(1), 1, 0).unwrap();
        assert_eq!(tlab.start(), start);
        assert!(tlab.end() > end);
        assert_eq!(heap.stats().snapshot().tlab_refills, 0);
    }

    #[test]
    fn test_large_objects_bypass_tlab() {
        let heap = heap();
        let mut tlab = Tlab::EMPTY;
        let big = heap
            .alloc_array(&mut tlab, ClassId(2), PrimitiveType::Long, 4096)
            .unwrap();
        assert!(tlab.is_empty());
        assert_eq!(heap.array_length(big), Some(4096));
    }

    #[test]
    fn test_out_of_memory() {
        let heap = heap();
        let mut tlab = Tlab::EMPTY;
        let err = heap
            .alloc_array(&mut tlab, ClassId(2), PrimitiveType::Byte, 64 * 1024 * 1024)
            .unwrap_err();
        assert!(matches!(err, EmberError::OutOfMemory { .. }));
    }

    #[test]
    fn test_fields_and_card_marking() {
        let heap = heap();
        let mut tlab = Tlab::EMPTY;
        let holder = heap.alloc_object(&mut tlab, ClassId(1), 1, 1).unwrap();
        let value = heap.alloc_object(&mut tlab, ClassId(1), 0, 0).unwrap();

        heap.set_field_prim(holder, 0, 42);
        assert_eq!(heap.get_field_prim(holder, 0), 42);
        assert!(!heap.card_table().is_dirty(heap.address_of(holder)));

        heap.set_field_ref(holder, 0, Some(value));
        assert_eq!(heap.get_field_ref(holder, 0), Some(value));
        assert!(heap.card_table().is_dirty(heap.address_of(holder)));
    }

    #[test]
    fn test_arrays() {
        let heap = heap();
        let mut tlab = Tlab::EMPTY;
        let arr = heap
            .alloc_array(&mut tlab, ClassId(3), PrimitiveType::Int, 3)
            .unwrap();
        assert!(heap.array_set(arr, 2, (-5i32) as u32 as u64));
        assert_eq!(heap.array_get(arr, 2), Some((-5i64) as u64));
        assert!(!heap.array_set(arr, 3, 0));
        assert_eq!(heap.array_get(arr, 3), None);
    }

    #[test]
    fn test_strings() {
        let heap = heap();
        let mut tlab = Tlab::EMPTY;
        let s = heap.alloc_string(&mut tlab, ClassId(4), "héllo").unwrap();
        assert_eq!(heap.string_value(s).as_deref(), Some("héllo"));
        assert_eq!(heap.array_length(s), None);
    }

    #[test]
    fn test_read_barrier_mark() {
        let heap = heap();
        let mut tlab = Tlab::EMPTY;
        let obj = heap.alloc_object(&mut tlab, ClassId(1), 0, 0).unwrap();
        heap.set_gray(obj, true);
        assert!(heap.lock_word(obj).is_gray());

        assert_eq!(heap.read_barrier_mark(obj), obj);
        let word = heap.lock_word(obj);
        assert!(!word.is_gray());
        assert!(word.is_marked());
        assert_eq!(heap.stats().snapshot().gray_hits, 1);
    }

    #[test]
    fn test_identity_hash_is_stable() {
        let heap = heap();
        let mut tlab = Tlab::EMPTY;
        let obj = heap.alloc_object(&mut tlab, ClassId(1), 0, 0).unwrap();
        let h = heap.identity_hash(obj);
        assert_ne!(h, 0);
        assert_eq!(heap.identity_hash(obj), h);
    }
}

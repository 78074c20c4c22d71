use crate::util::ObjectReference;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

const CHUNK_CAPACITY: usize = 32;

struct Chunk {
    slots: [AtomicUsize; CHUNK_CAPACITY],
    /// Number of published slots. Slots below this are readable without the add lock.
    size: AtomicUsize,
}

impl Chunk {
    fn new() -> Box<Self> {
        Box::new(Chunk {
            slots: std::array::from_fn(|_| AtomicUsize::new(0)),
            size: AtomicUsize::new(0),
        })
    }
}

/// A handle to one slot of a [`ChunkedHandleList`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OopHandle {
    chunk: usize,
    slot: usize,
}

/// Extra GC roots owned by a class loader data, stored in fixed-size chunks.
///
/// Adding is serialized; walking is not. A walker reads each chunk's size with acquire
/// ordering and only looks at slots below it, so it never sees a half-written slot.
#[derive(Default)]
pub struct ChunkedHandleList {
    chunks: RwLock<Vec<Box<Chunk>>>,
    add_lock: Mutex<()>,
}

impl ChunkedHandleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, obj: ObjectReference) -> OopHandle {
        let _guard = self.add_lock.lock().unwrap_or_else(|e| e.into_inner());
        {
            let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = chunks.last() {
                let size = last.size.load(Ordering::Relaxed);
                if size < CHUNK_CAPACITY {
                    last.slots[size].store(obj.value(), Ordering::Relaxed);
                    last.size.store(size + 1, Ordering::Release);
                    return OopHandle {
                        chunk: chunks.len() - 1,
                        slot: size,
                    };
                }
            }
        }
        let mut chunks = self.chunks.write().unwrap_or_else(|e| e.into_inner());
        let chunk = Chunk::new();
        chunk.slots[0].store(obj.value(), Ordering::Relaxed);
        chunk.size.store(1, Ordering::Release);
        chunks.push(chunk);
        OopHandle {
            chunk: chunks.len() - 1,
            slot: 0,
        }
    }

    pub fn load(&self, handle: OopHandle) -> ObjectReference {
        let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        let value = chunks[handle.chunk].slots[handle.slot].load(Ordering::Acquire);
        ObjectReference::from_raw_address(unsafe { crate::util::Address::from_usize(value) })
    }

    /// Clear the slot of `handle`. The slot is not reused.
    pub fn release(&self, handle: OopHandle) {
        let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        chunks[handle.chunk].slots[handle.slot].store(0, Ordering::Release);
    }

    /// Visit every non-null handle.
    pub fn oops_do(&self, f: &mut dyn FnMut(ObjectReference)) {
        let chunks = self.chunks.read().unwrap_or_else(|e| e.into_inner());
        for chunk in chunks.iter() {
            let size = chunk.size.load(Ordering::Acquire);
            for slot in &chunk.slots[..size] {
                let value = slot.load(Ordering::Relaxed);
                if value != 0 {
                    f(ObjectReference::from_raw_address(unsafe {
                        crate::util::Address::from_usize(value)
                    }));
                }
            }
        }
    }

    pub fn contains(&self, obj: ObjectReference) -> bool {
        let mut found = false;
        self.oops_do(&mut |o| found |= o == obj);
        found
    }

    pub fn count(&self) -> usize {
        let mut n = 0;
        self.oops_do(&mut |_| n += 1);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;
    use std::sync::Arc;

    fn obj(v: usize) -> ObjectReference {
        ObjectReference::from_raw_address(unsafe { Address::from_usize(v) })
    }

    #[test]
    fn add_across_chunks() {
        let list = ChunkedHandleList::new();
        let handles: Vec<_> = (1..=70).map(|i| list.add(obj(i * 8))).collect();
        assert_eq!(list.count(), 70);
        assert_eq!(list.load(handles[40]), obj(41 * 8));
        list.release(handles[40]);
        assert_eq!(list.count(), 69);
        assert!(!list.contains(obj(41 * 8)));
        assert!(list.contains(obj(70 * 8)));
    }

    #[test]
    fn concurrent_walk_sees_only_published_slots() {
        let list = Arc::new(ChunkedHandleList::new());
        let writer = {
            let list = list.clone();
            std::thread::spawn(move || {
                for i in 1..=1000 {
                    list.add(obj(i * 8));
                }
            })
        };
        for _ in 0..100 {
            list.oops_do(&mut |o| assert!(!o.is_null() && o.value() % 8 == 0));
        }
        writer.join().unwrap();
        assert_eq!(list.count(), 1000);
    }
}

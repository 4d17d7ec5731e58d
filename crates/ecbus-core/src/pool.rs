//! Fixed-capacity buffer pool for the real-time path.
//!
//! All buffers are allocated once when the pool is opened and recycled from
//! then on. Each [`PoolEntry`] keeps a stable index for its whole lifetime;
//! the free list and every owner queue are [`EntryList`]s that link entries
//! by that index, so splicing is O(1) and never copies buffer contents.
//!
//! An entry is owned by exactly one place at a time: the pool's free list,
//! some owner's [`EntryList`], or a caller holding it by value. Moving the
//! entry is what moves it between lists.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use crate::error::{ErrorKind, Resource, Result};

const NIL: usize = usize::MAX;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// One-shot completion callback attached to an entry.
pub type EntryCallback = Box<dyn FnOnce(&PoolEntry) + Send>;

/// A reusable fixed-size buffer drawn from a [`Pool`].
pub struct PoolEntry {
    index: usize,
    pool_id: u64,
    data: Box<[u8]>,
    len: usize,
    callback: Option<EntryCallback>,
}

impl PoolEntry {
    fn new(index: usize, pool_id: u64, size: usize) -> Self {
        Self { index, pool_id, data: vec![0u8; size].into_boxed_slice(), len: 0, callback: None }
    }

    /// Position of this entry within its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identifier of the owning pool.
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no bytes are valid.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks the first `len` bytes as valid. Clamped to capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole buffer regardless of the valid length.
    pub fn buffer(&self) -> &[u8] {
        &self.data
    }

    /// The whole buffer for writing.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copies `bytes` to the start of the buffer and sets the length.
    pub fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.data.len() {
            return Err(ErrorKind::CapacityExceeded {
                required: bytes.len(),
                available: self.data.len(),
            });
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    /// Zeroes the buffer, resets the length and drops any callback.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.len = 0;
        self.callback = None;
    }

    /// Attaches a completion callback, replacing any previous one.
    pub fn set_callback(&mut self, callback: EntryCallback) {
        self.callback = Some(callback);
    }

    /// Returns true if a callback is attached.
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Invokes and clears the callback, if any.
    pub fn fire_callback(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }
}

impl fmt::Debug for PoolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("index", &self.index)
            .field("pool_id", &self.pool_id)
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Copy, Clone, Debug)]
struct Link {
    prev: usize,
    next: usize,
}

const UNLINKED: Link = Link { prev: NIL, next: NIL };

/// Doubly-linked list of pool entries threaded through index arrays.
///
/// Sized to the capacity of the pool whose entries it holds; an entry with
/// index `i` always occupies slot `i`.
pub struct EntryList {
    slots: Vec<Option<PoolEntry>>,
    links: Vec<Link>,
    head: usize,
    tail: usize,
    len: usize,
}

impl EntryList {
    /// Creates an empty list able to hold entries with indices below `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            links: vec![UNLINKED; capacity],
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Number of linked entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no entry is linked.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest number of entries the list can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the entry with `index` is linked here.
    pub fn contains(&self, index: usize) -> bool {
        self.slots.get(index).map_or(false, Option::is_some)
    }

    /// Appends an entry. Hands the entry back if its index does not fit or
    /// is already linked.
    pub fn push_back(&mut self, entry: PoolEntry) -> std::result::Result<(), PoolEntry> {
        let index = self.claim_slot(entry)?;
        self.links[index] = Link { prev: self.tail, next: NIL };
        if self.tail == NIL {
            self.head = index;
        } else {
            self.links[self.tail].next = index;
        }
        self.tail = index;
        Ok(())
    }

    /// Prepends an entry. Hands the entry back if its index does not fit or
    /// is already linked.
    pub fn push_front(&mut self, entry: PoolEntry) -> std::result::Result<(), PoolEntry> {
        let index = self.claim_slot(entry)?;
        self.links[index] = Link { prev: NIL, next: self.head };
        if self.head == NIL {
            self.tail = index;
        } else {
            self.links[self.head].prev = index;
        }
        self.head = index;
        Ok(())
    }

    /// Removes and returns the first entry.
    pub fn pop_front(&mut self) -> Option<PoolEntry> {
        match self.head {
            NIL => None,
            index => self.remove(index),
        }
    }

    /// Removes and returns the last entry.
    pub fn pop_back(&mut self) -> Option<PoolEntry> {
        match self.tail {
            NIL => None,
            index => self.remove(index),
        }
    }

    /// The first entry, if any.
    pub fn front(&self) -> Option<&PoolEntry> {
        self.slots.get(self.head).and_then(Option::as_ref)
    }

    /// Detaches the entry with `index` from wherever it sits in the list.
    pub fn remove(&mut self, index: usize) -> Option<PoolEntry> {
        let entry = self.slots.get_mut(index)?.take()?;
        let Link { prev, next } = self.links[index];
        if prev == NIL {
            self.head = next;
        } else {
            self.links[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.links[next].prev = prev;
        }
        self.links[index] = UNLINKED;
        self.len -= 1;
        Some(entry)
    }

    /// Iterates over the linked entries from front to back.
    pub fn iter(&self) -> impl Iterator<Item = &PoolEntry> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let entry = self.slots[cursor].as_ref();
            cursor = self.links[cursor].next;
            entry
        })
    }

    /// Removes every entry from front to back.
    pub fn drain(&mut self) -> impl Iterator<Item = PoolEntry> + '_ {
        std::iter::from_fn(move || self.pop_front())
    }

    fn claim_slot(&mut self, entry: PoolEntry) -> std::result::Result<usize, PoolEntry> {
        let index = entry.index;
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(entry);
                self.len += 1;
                Ok(index)
            }
            _ => Err(entry),
        }
    }
}

impl fmt::Debug for EntryList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter().map(PoolEntry::index)).finish()
    }
}

#[derive(Debug)]
struct PoolState {
    free: EntryList,
    closed: bool,
}

/// A fixed set of pre-allocated, reusable buffers.
pub struct Pool {
    id: u64,
    capacity: usize,
    entry_size: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Pool {
    /// Pre-allocates `capacity` entries of `entry_size` bytes onto the free list.
    pub fn open(capacity: usize, entry_size: usize) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut free = EntryList::with_capacity(capacity);
        for index in 0..capacity {
            // a fresh list of matching capacity accepts every index exactly once
            let _ = free.push_back(PoolEntry::new(index, id, entry_size));
        }
        tracing::debug!("opened pool {} with {} entries of {} bytes", id, capacity, entry_size);
        Self {
            id,
            capacity,
            entry_size,
            state: Mutex::new(PoolState { free, closed: false }),
            available: Condvar::new(),
        }
    }

    /// Identifier stamped into every entry of this pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Total number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffer size of each entry.
    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Number of entries on the free list.
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    /// Returns true if `entry` was allocated by this pool.
    pub fn owns(&self, entry: &PoolEntry) -> bool {
        entry.pool_id == self.id
    }

    /// Creates an empty owner queue able to hold entries of this pool.
    pub fn new_queue(&self) -> EntryList {
        EntryList::with_capacity(self.capacity)
    }

    /// Takes the head of the free list, waiting up to `timeout` for an entry
    /// to be returned. A zero timeout never blocks.
    pub fn get(&self, timeout: Duration) -> Result<PoolEntry> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ErrorKind::ResourceExhausted(Resource::PoolEntries));
            }
            if let Some(entry) = state.free.pop_front() {
                return Ok(entry);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorKind::ResourceExhausted(Resource::PoolEntries));
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Takes the head of the free list without waiting.
    pub fn try_get(&self) -> Result<PoolEntry> {
        self.get(Duration::ZERO)
    }

    /// Index of the entry `get` would return next.
    pub fn peek(&self) -> Result<usize> {
        self.lock().free.front().map(PoolEntry::index).ok_or(ErrorKind::Empty)
    }

    /// Returns an entry to the tail of the free list, so buffers are reused
    /// round-robin. An entry of another pool is logged and dropped; use
    /// [`try_put`](Pool::try_put) to get it back instead.
    pub fn put(&self, entry: PoolEntry) {
        if let Err(entry) = self.give_back(entry, false) {
            self.drop_foreign(entry);
        }
    }

    /// Returns an entry to the head of the free list, so it is the next one
    /// handed out.
    pub fn put_head(&self, entry: PoolEntry) {
        if let Err(entry) = self.give_back(entry, true) {
            self.drop_foreign(entry);
        }
    }

    /// Like [`put`](Pool::put), but hands an entry that belongs to another
    /// pool back to the caller, so it can be returned to its owner.
    pub fn try_put(&self, entry: PoolEntry) -> std::result::Result<(), PoolEntry> {
        self.give_back(entry, false)
    }

    /// Detaches a specific entry from the free list.
    pub fn remove(&self, index: usize) -> Option<PoolEntry> {
        self.lock().free.remove(index)
    }

    /// Shuts the pool down. Returns how many entries were still on loan.
    pub fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let outstanding = self.capacity - state.free.len();
        state.free.drain().for_each(drop);
        drop(state);
        self.available.notify_all();
        if outstanding > 0 {
            tracing::warn!("pool {} closed with {} entries still in use", self.id, outstanding);
        } else {
            tracing::debug!("closed pool {}", self.id);
        }
        outstanding
    }

    fn give_back(&self, mut entry: PoolEntry, at_head: bool) -> std::result::Result<(), PoolEntry> {
        if !self.owns(&entry) {
            return Err(entry);
        }
        entry.callback = None;
        entry.len = 0;

        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        let pushed = if at_head { state.free.push_front(entry) } else { state.free.push_back(entry) };
        if let Err(entry) = pushed {
            tracing::error!("entry {} returned to pool {} twice", entry.index, self.id);
            return Ok(());
        }
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn drop_foreign(&self, entry: PoolEntry) {
        tracing::error!(
            "entry {} of pool {} returned to pool {}, dropping it",
            entry.index,
            entry.pool_id,
            self.id
        );
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("entry_size", &self.entry_size)
            .field("available", &self.available())
            .finish()
    }
}

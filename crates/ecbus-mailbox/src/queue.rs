use ecbus_core::{
    pool::{EntryList, PoolEntry},
    protocols::MailboxType,
};

/// One queue of pooled buffers per mailbox type.
///
/// Each queue keeps its own order; [`next_by_priority`](TagQueues::next_by_priority)
/// decides between queues.
#[derive(Debug)]
pub struct TagQueues {
    queues: [EntryList; 7],
}

impl TagQueues {
    /// Creates empty queues for entries of a pool with `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self { queues: std::array::from_fn(|_| EntryList::with_capacity(capacity)) }
    }

    /// Appends an entry behind the pending entries of `tag`. Hands the entry
    /// back if it is already queued.
    pub fn enqueue_tail(
        &mut self,
        tag: MailboxType,
        entry: PoolEntry,
    ) -> Result<(), PoolEntry> {
        self.queues[tag.slot()].push_back(entry)
    }

    /// Puts an entry ahead of the pending entries of `tag`. Hands the entry
    /// back if it is already queued.
    pub fn enqueue_head(
        &mut self,
        tag: MailboxType,
        entry: PoolEntry,
    ) -> Result<(), PoolEntry> {
        self.queues[tag.slot()].push_front(entry)
    }

    /// Takes the oldest entry of `tag`.
    pub fn pop(&mut self, tag: MailboxType) -> Option<PoolEntry> {
        self.queues[tag.slot()].pop_front()
    }

    /// The first non-empty tag in `order`.
    pub fn peek_by_priority(&self, order: &[MailboxType]) -> Option<MailboxType> {
        order.iter().copied().find(|tag| !self.queues[tag.slot()].is_empty())
    }

    /// Takes the head of the first non-empty queue in `order`.
    pub fn next_by_priority(&mut self, order: &[MailboxType]) -> Option<(MailboxType, PoolEntry)> {
        let tag = self.peek_by_priority(order)?;
        self.pop(tag).map(|entry| (tag, entry))
    }

    /// Detaches the entry with `index` from whichever queue holds it.
    pub fn remove(&mut self, index: usize) -> Option<(MailboxType, PoolEntry)> {
        MailboxType::ALL.iter().copied().find_map(|tag| {
            let queue = &mut self.queues[tag.slot()];
            if queue.contains(index) {
                queue.remove(index).map(|entry| (tag, entry))
            } else {
                None
            }
        })
    }

    /// Returns true if the entry with `index` is queued.
    pub fn contains(&self, index: usize) -> bool {
        self.queues.iter().any(|queue| queue.contains(index))
    }

    /// Number of entries pending for `tag`.
    pub fn len(&self, tag: MailboxType) -> usize {
        self.queues[tag.slot()].len()
    }

    /// Number of entries pending over all tags.
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(EntryList::len).sum()
    }

    /// Returns true if every queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(EntryList::is_empty)
    }

    /// Empties every queue.
    pub fn drain(&mut self) -> Vec<(MailboxType, PoolEntry)> {
        let mut drained = Vec::with_capacity(self.total_len());
        for tag in MailboxType::ALL {
            drained.extend(self.queues[tag.slot()].drain().map(|entry| (tag, entry)));
        }
        drained
    }
}

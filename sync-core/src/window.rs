//! Message window cache for chatsync.
//!
//! A channel's locally held history is a sparse, index-ordered map of
//! confirmed messages plus a set of coverage intervals. An interval
//! `[lo, hi]` means every backend message with an index in that range is in
//! the cache. The interval that reaches "now" is open-ended (`hi` is
//! [`OPEN_END`]) for as long as realtime events keep it current.
//!
//! Range queries are answered from the cache only when coverage proves the
//! answer complete; otherwise the caller fetches from the backend and merges
//! the batch with [`MessageWindow::merge_fetch`].
//!
//! Removed indices are remembered, so a fetch whose backend snapshot predates
//! a removal cannot bring the message back.

use std::collections::{BTreeMap, BTreeSet};

use chatsync_types::{Anchor, Message};

/// Upper bound of an interval that extends to the newest message.
pub const OPEN_END: u64 = u64::MAX;

/// Closed index intervals known to be complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage {
    /// start -> inclusive end; intervals never overlap or touch.
    intervals: BTreeMap<u64, u64>,
}

impl Coverage {
    /// Create empty coverage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `[lo, hi]` as complete, merging overlapping and adjacent intervals.
    pub fn insert(&mut self, lo: u64, hi: u64) {
        if hi < lo {
            return;
        }
        let touching: Vec<(u64, u64)> = self
            .intervals
            .range(..=hi.saturating_add(1))
            .filter(|(_, end)| end.saturating_add(1) >= lo)
            .map(|(start, end)| (*start, *end))
            .collect();

        let mut lo = lo;
        let mut hi = hi;
        for (start, end) in touching {
            self.intervals.remove(&start);
            lo = lo.min(start);
            hi = hi.max(end);
        }
        self.intervals.insert(lo, hi);
    }

    /// The interval containing `index`, if any.
    pub fn interval_containing(&self, index: u64) -> Option<(u64, u64)> {
        self.intervals
            .range(..=index)
            .next_back()
            .filter(|(_, end)| **end >= index)
            .map(|(start, end)| (*start, *end))
    }

    /// The open-ended interval, if any.
    pub fn open_interval(&self) -> Option<(u64, u64)> {
        self.intervals
            .iter()
            .next_back()
            .filter(|(_, end)| **end == OPEN_END)
            .map(|(start, end)| (*start, *end))
    }

    /// Close the open-ended interval at `max`, or drop it if `max` is below its start.
    pub fn seal(&mut self, max: Option<u64>) {
        if let Some((start, _)) = self.open_interval() {
            self.intervals.remove(&start);
            if let Some(max) = max.filter(|max| *max >= start) {
                self.intervals.insert(start, max);
            }
        }
    }

    /// All intervals, ascending.
    pub fn intervals(&self) -> Vec<(u64, u64)> {
        self.intervals.iter().map(|(s, e)| (*s, *e)).collect()
    }
}

/// The cached subset of one channel's message history.
#[derive(Debug, Clone, Default)]
pub struct MessageWindow {
    messages: BTreeMap<u64, Message>,
    coverage: Coverage,
    /// Indices removed on the backend; fetched copies of them are dropped.
    removed: BTreeSet<u64>,
    last_consumed: Option<u64>,
}

impl MessageWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the window with previously persisted messages.
    ///
    /// Restored messages carry no coverage: range queries still go to the
    /// backend until a fetch proves them complete.
    pub fn restore(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.messages.insert(message.index, message);
        }
    }

    /// Answer a range query from cache, or `None` when coverage does not prove completeness.
    pub fn lookup(&self, anchor: Anchor, count: usize) -> Option<Vec<Message>> {
        if count == 0 {
            return Some(Vec::new());
        }
        match anchor {
            Anchor::Last => {
                let (start, _) = self.coverage.open_interval()?;
                let found = self.tail(start, u64::MAX, count);
                (found.len() >= count || start == 0).then_some(found)
            }
            Anchor::Before(index) => {
                let (lo, _) = self.coverage.interval_containing(index)?;
                let found = self.tail(lo, index, count);
                (found.len() >= count || lo == 0).then_some(found)
            }
            Anchor::After(index) => {
                let (_, hi) = self.coverage.interval_containing(index)?;
                let found: Vec<Message> = self
                    .messages
                    .range(index..=hi)
                    .take(count)
                    .map(|(_, m)| m.clone())
                    .collect();
                (found.len() >= count || hi == OPEN_END).then_some(found)
            }
        }
    }

    /// Merge a backend range fetch and extend coverage.
    ///
    /// `live` says whether realtime events are currently flowing, which is
    /// what allows a range reaching the newest message to stay open-ended.
    /// Merging the same batch twice leaves the window unchanged. Returns the
    /// messages that were stored; removed indices are skipped.
    pub fn merge_fetch(
        &mut self,
        anchor: Anchor,
        count: usize,
        batch: Vec<Message>,
        live: bool,
    ) -> Vec<Message> {
        let short = batch.len() < count;
        let min = batch.iter().map(|m| m.index).min();
        let max = batch.iter().map(|m| m.index).max();
        let mut stored = Vec::with_capacity(batch.len());
        for message in batch {
            if self.removed.contains(&message.index) {
                continue;
            }
            self.messages.insert(message.index, message.clone());
            stored.push(message);
        }

        let newest = |fallback: Option<u64>| if live { Some(OPEN_END) } else { fallback };
        let (lo, hi) = match anchor {
            Anchor::Last => {
                let lo = if short { Some(0) } else { min };
                (lo, newest(max))
            }
            Anchor::Before(index) => {
                let lo = if short { Some(0) } else { min };
                (lo, Some(index))
            }
            Anchor::After(index) => {
                let hi = if short { newest(max) } else { max };
                (Some(index), hi)
            }
        };
        if let (Some(lo), Some(hi)) = (lo, hi) {
            self.coverage.insert(lo, hi);
        }
        stored
    }

    /// Read a range from the cache after a merge, without a coverage check.
    pub fn answer(&self, anchor: Anchor, count: usize) -> Vec<Message> {
        match anchor {
            Anchor::Last => self.tail(0, u64::MAX, count),
            Anchor::Before(index) => self.tail(0, index, count),
            Anchor::After(index) => self
                .messages
                .range(index..)
                .take(count)
                .map(|(_, m)| m.clone())
                .collect(),
        }
    }

    fn tail(&self, lo: u64, hi: u64, count: usize) -> Vec<Message> {
        let mut found: Vec<Message> = self
            .messages
            .range(lo..=hi)
            .rev()
            .take(count)
            .map(|(_, m)| m.clone())
            .collect();
        found.reverse();
        found
    }

    /// Insert a message delivered by a realtime event or a send confirmation.
    ///
    /// Returns false if a message with this index was already cached (an
    /// echo of something we already hold); the cached copy is refreshed.
    /// A live add for a removed index supersedes the removal.
    pub fn insert_live(&mut self, message: Message) -> bool {
        let index = message.index;
        self.removed.remove(&index);
        let is_new = self.messages.insert(index, message).is_none();
        let inside_open = self
            .coverage
            .open_interval()
            .is_some_and(|(start, _)| index >= start);
        if !inside_open {
            self.coverage.insert(index, index);
        }
        is_new
    }

    /// Replace a cached message. Returns false if it is not cached.
    pub fn update(&mut self, message: Message) -> bool {
        match self.messages.get_mut(&message.index) {
            Some(slot) => {
                *slot = message;
                true
            }
            None => false,
        }
    }

    /// Evict a message and remember the removal, cached or not.
    ///
    /// Coverage is kept: the index is known to be empty now.
    pub fn remove(&mut self, index: u64) -> Option<Message> {
        self.removed.insert(index);
        self.messages.remove(&index)
    }


    /// Cache-only point lookup.
    pub fn message_with_index(&self, index: u64) -> Option<&Message> {
        self.messages.get(&index)
    }

    /// The message at `index`, else the first cached message after it.
    pub fn message_for_consumption_index(&self, index: u64) -> Option<&Message> {
        self.messages.range(index..).next().map(|(_, m)| m)
    }

    /// Highest cached index.
    pub fn max_index(&self) -> Option<u64> {
        self.messages.keys().next_back().copied()
    }

    /// Close open coverage after realtime events may have been missed.
    pub fn seal(&mut self) {
        let max = self.max_index();
        self.coverage.seal(max);
    }

    /// Coverage intervals, ascending.
    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }

    /// Cached messages, ascending.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Number of cached messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// The user's consumption horizon in this channel.
    pub fn last_consumed(&self) -> Option<u64> {
        self.last_consumed
    }

    /// Overwrite the consumption horizon.
    pub fn set_last_consumed(&mut self, index: u64) {
        self.last_consumed = Some(index);
    }

    /// Move the horizon forward only. Returns true if it moved.
    pub fn advance_last_consumed(&mut self, index: u64) -> bool {
        match self.last_consumed {
            Some(current) if current >= index => false,
            _ => {
                self.last_consumed = Some(index);
                true
            }
        }
    }

    /// Mark everything consumed, up to the highest index held locally.
    ///
    /// Messages the backend has that were never fetched are not counted.
    pub fn set_all_consumed(&mut self) -> Option<u64> {
        if let Some(max) = self.max_index() {
            self.last_consumed = Some(max);
        }
        self.last_consumed
    }

    /// Clear the consumption horizon.
    pub fn set_none_consumed(&mut self) {
        self.last_consumed = None;
    }
}

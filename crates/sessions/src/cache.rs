//! Bounded LRU cache of terminal surfaces.
//!
//! Rendering lives outside this crate; a [`TerminalSurface`] is the part
//! the session core owns: recent output and the grid size. Evicting a
//! surface is coupled to tearing down its session's shell, which the
//! orchestrator does with the entries returned from [`TerminalCache::insert`].

use std::collections::VecDeque;

use bytes::Bytes;
use transport::PtySize;

use crate::model::SessionId;

/// Default number of cached surfaces.
pub const DEFAULT_CACHE_CAPACITY: usize = 20;

/// Default scrollback kept per surface.
pub const DEFAULT_SCROLLBACK_BYTES: usize = 256 * 1024;

/// Session-side state of one terminal view.
#[derive(Debug, Clone)]
pub struct TerminalSurface {
    size: PtySize,
    scrollback: VecDeque<u8>,
    limit: usize,
}

impl TerminalSurface {
    pub fn new(size: PtySize) -> Self {
        Self::with_scrollback(size, DEFAULT_SCROLLBACK_BYTES)
    }

    pub fn with_scrollback(size: PtySize, limit: usize) -> Self {
        Self {
            size,
            scrollback: VecDeque::new(),
            limit,
        }
    }

    /// Appends shell output, dropping the oldest bytes past the limit.
    pub fn feed(&mut self, data: &[u8]) {
        if data.len() >= self.limit {
            self.scrollback.clear();
            self.scrollback
                .extend(&data[data.len() - self.limit..]);
            return;
        }
        let overflow = (self.scrollback.len() + data.len()).saturating_sub(self.limit);
        self.scrollback.drain(..overflow);
        self.scrollback.extend(data);
    }

    pub fn resize(&mut self, size: PtySize) {
        self.size = size;
    }

    pub fn size(&self) -> PtySize {
        self.size
    }

    /// Copy of the buffered output, oldest first.
    pub fn contents(&self) -> Bytes {
        let (front, back) = self.scrollback.as_slices();
        let mut out = Vec::with_capacity(front.len() + back.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        Bytes::from(out)
    }
}

/// LRU cache keyed by session. The back of the queue is most recent.
#[derive(Debug)]
pub struct TerminalCache<S> {
    capacity: usize,
    entries: VecDeque<(SessionId, S)>,
}

impl<S> TerminalCache<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.position(session).is_some()
    }

    fn position(&self, session: SessionId) -> Option<usize> {
        self.entries.iter().position(|(id, _)| *id == session)
    }

    /// Marks `session` most recently used. Returns false if absent.
    pub fn touch(&mut self, session: SessionId) -> bool {
        match self.position(session) {
            Some(index) => {
                if let Some(entry) = self.entries.remove(index) {
                    self.entries.push_back(entry);
                }
                true
            }
            None => false,
        }
    }

    /// Looks up a surface and marks it most recently used.
    pub fn get_mut(&mut self, session: SessionId) -> Option<&mut S> {
        if !self.touch(session) {
            return None;
        }
        self.entries.back_mut().map(|(_, surface)| surface)
    }

    /// Looks up a surface without changing recency.
    pub fn peek_mut(&mut self, session: SessionId) -> Option<&mut S> {
        self.entries
            .iter_mut()
            .find(|(id, _)| *id == session)
            .map(|(_, surface)| surface)
    }

    /// Inserts or replaces a surface as most recently used.
    ///
    /// Returns the entries evicted to get back under capacity. `pinned`
    /// (the current selection) and the inserted session are never evicted,
    /// so the cache may stay one over capacity when both are protected.
    pub fn insert(
        &mut self,
        session: SessionId,
        surface: S,
        pinned: Option<SessionId>,
    ) -> Vec<(SessionId, S)> {
        if let Some(index) = self.position(session) {
            self.entries.remove(index);
        }
        self.entries.push_back((session, surface));

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .position(|(id, _)| *id != session && Some(*id) != pinned);
            match victim.and_then(|index| self.entries.remove(index)) {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&mut self, session: SessionId) -> Option<S> {
        let index = self.position(session)?;
        self.entries.remove(index).map(|(_, surface)| surface)
    }

    /// Session ids, least recently used first.
    pub fn ids(&self) -> Vec<SessionId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    pub fn clear(&mut self) -> Vec<(SessionId, S)> {
        self.entries.drain(..).collect()
    }
}

impl<S> Default for TerminalCache<S> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

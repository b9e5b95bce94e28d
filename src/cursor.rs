//! Saturating position within an ordered text or slide sequence

/// Index into a sequence of `len` items, clamped to `[0, len - 1]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    index: usize,
    len: usize,
}

impl Cursor {
    /// Cursor at index 0. An empty sequence yields `None`.
    pub fn new(len: usize) -> Option<Self> {
        (len > 0).then_some(Self { index: 0, len })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Step by `delta`; returns the new index, or `None` at a boundary
    pub fn step(&mut self, delta: isize) -> Option<usize> {
        let target = self.index.checked_add_signed(delta)?;
        if target >= self.len || target == self.index {
            return None;
        }
        self.index = target;
        Some(target)
    }

    /// Put the index back after a failed move
    pub fn restore(&mut self, index: usize) {
        self.index = index.min(self.len - 1);
    }
}

// Generation-indexed arena for surface-dependent GPU resources
//
// Everything created against one swapchain extent lives in one generation.
// Teardown drains the whole generation newest-first, then bumps the
// generation so handles from the old surface stop resolving.

/// Handle into a GenArena, valid only for the generation that issued it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArenaHandle {
    generation: u64,
    index: usize,
}

impl ArenaHandle {
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
pub struct GenArena<T> {
    generation: u64,
    entries: Vec<T>,
}

impl<T> Default for GenArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GenArena<T> {
    pub fn new() -> Self {
        Self {
            generation: 0,
            entries: Vec::new(),
        }
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, value: T) -> ArenaHandle {
        self.entries.push(value);
        ArenaHandle {
            generation: self.generation,
            index: self.entries.len() - 1,
        }
    }

    pub fn get(&self, handle: ArenaHandle) -> Option<&T> {
        if handle.generation != self.generation {
            return None;
        }
        self.entries.get(handle.index)
    }

    /// Entries in creation order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Remove every entry, newest first, and start a new generation
    pub fn drain_reverse(&mut self) -> impl Iterator<Item = T> + '_ {
        self.generation += 1;
        self.entries.drain(..).rev()
    }
}

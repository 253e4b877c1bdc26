//! The diagram registry: a name-keyed arena of diagrams, a global memory budget with
//! LRU-driven spilling, and scoped acquisition that guarantees named temporaries never leak past
//! the block of code that created them.

use crate::block::{IrrepKey, StorageMode};
use crate::diagram::AnyDiagram;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::path::PathBuf;

/// Owns every live diagram of a run, by name.
pub struct Registry {
    diagrams: rustc_hash::FxHashMap<String, AnyDiagram>,
    /// Insertion order, used so `flush_all`/iteration is deterministic.
    creation_order: Vec<String>,
    tracker: MemoryTracker,
    spill_dir: Option<PathBuf>,
}

impl Registry {
    /// An empty registry with the given memory budget (bytes). A `spill_dir` is required if any
    /// diagram will ever be created with [`StorageMode::Disk`].
    #[must_use]
    pub fn new(memory_budget: usize, spill_dir: Option<PathBuf>) -> Self {
        Self {
            diagrams: rustc_hash::FxHashMap::default(),
            creation_order: Vec::new(),
            tracker: MemoryTracker::new(memory_budget),
            spill_dir,
        }
    }

    /// Registers a freshly built diagram under its own name. Errors if the name is already taken
    /// (names are unique within a registry's lifetime).
    pub fn insert(&mut self, diagram: AnyDiagram) -> Result<()> {
        let name = diagram.name().to_string();
        if self.diagrams.contains_key(&name) {
            return Err(Error::AlreadyExists(name));
        }
        self.creation_order.push(name.clone());
        self.diagrams.insert(name, diagram);
        Ok(())
    }

    /// Looks up a diagram by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AnyDiagram> {
        self.diagrams.get(name)
    }

    /// Mutable lookup by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut AnyDiagram> {
        self.diagrams.get_mut(name)
    }

    /// Looks up a diagram, or returns [`Error::NotFound`].
    pub fn require(&self, name: &str) -> Result<&AnyDiagram> {
        self.get(name).ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    /// Mutable variant of [`Self::require`].
    pub fn require_mut(&mut self, name: &str) -> Result<&mut AnyDiagram> {
        self.get_mut(name).ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    /// Permanently removes a diagram and its backing file, if any.
    pub fn erase(&mut self, name: &str) {
        if let Some(diagram) = self.diagrams.remove(name) {
            match diagram {
                AnyDiagram::Real(mut d) => d.blocks.clear(),
                AnyDiagram::Complex(mut d) => d.blocks.clear(),
            }
            self.creation_order.retain(|n| n != name);
        }
        self.tracker.forget(name);
    }

    /// Names of every currently-registered diagram, creation order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.creation_order
    }

    /// Path new on-disk blocks for `name` should spill to.
    #[must_use]
    pub fn spill_path(&self, name: &str) -> Option<PathBuf> {
        self.spill_dir.as_ref().map(|dir| dir.join(format!("{name}.blk")))
    }

    /// Records a touch on `(diagram, block)` for LRU purposes and, if the registry is over
    /// budget, evicts least-recently-used blocks from disk-mode diagrams until it is back under
    /// budget or nothing more can be evicted.
    pub fn touch_and_reclaim(&mut self, name: &str, key: &IrrepKey, block_bytes: usize) -> Result<()> {
        self.tracker.touch(name, key, block_bytes);
        while self.tracker.used > self.tracker.budget {
            let Some((victim_name, victim_key)) = self.tracker.pop_lru() else { break };
            if let Some(diagram) = self.diagrams.get_mut(&victim_name) {
                let evicted = match diagram {
                    AnyDiagram::Real(d) if d.blocks.mode() == StorageMode::Disk => {
                        let before = d.blocks.resident_bytes();
                        d.blocks.unload(&victim_key)?;
                        before - d.blocks.resident_bytes()
                    }
                    AnyDiagram::Complex(d) if d.blocks.mode() == StorageMode::Disk => {
                        let before = d.blocks.resident_bytes();
                        d.blocks.unload(&victim_key)?;
                        before - d.blocks.resident_bytes()
                    }
                    _ => 0,
                };
                self.tracker.used = self.tracker.used.saturating_sub(evicted);
            }
        }
        Ok(())
    }

    /// Total resident bytes the tracker believes are in use.
    #[must_use]
    pub fn resident_bytes(&self) -> usize {
        self.tracker.used
    }

    /// Opens a scoped acquisition: any diagram created between this call and the guard's `Drop`
    /// (including on an error unwind) is erased automatically unless explicitly adopted via
    /// [`ScopeGuard::keep`]. This replaces manual `erase` bookkeeping at every early-return site.
    pub fn scope(&mut self) -> ScopeGuard<'_> {
        let checkpoint = self.creation_order.len();
        ScopeGuard { registry: self, checkpoint, keep: Vec::new() }
    }
}

/// Tracks per-diagram-block access recency and a global resident-byte budget.
struct MemoryTracker {
    budget: usize,
    used: usize,
    /// Most-recently-used at the back.
    lru: VecDeque<(String, IrrepKey)>,
}

impl MemoryTracker {
    const fn new(budget: usize) -> Self {
        Self { budget, used: 0, lru: VecDeque::new() }
    }

    fn touch(&mut self, name: &str, key: &IrrepKey, block_bytes: usize) {
        if let Some(pos) = self.lru.iter().position(|(n, k)| n == name && k == key) {
            self.lru.remove(pos);
        } else {
            self.used += block_bytes;
        }
        self.lru.push_back((name.to_owned(), key.clone()));
    }

    fn pop_lru(&mut self) -> Option<(String, IrrepKey)> {
        self.lru.pop_front()
    }

    fn forget(&mut self, name: &str) {
        self.lru.retain(|(n, _)| n != name);
    }
}

/// RAII guard returned by [`Registry::scope`]. On drop, every diagram created since the guard was
/// opened is erased unless its name was passed to [`Self::keep`] first. Mirrors the "finish:"
/// cleanup label used for manual diagram-stack unwinding, but runs on every exit path including
/// early returns and `?`-propagated errors.
pub struct ScopeGuard<'a> {
    registry: &'a mut Registry,
    checkpoint: usize,
    keep: Vec<String>,
}

impl ScopeGuard<'_> {
    /// Marks `name` as surviving this scope: it will not be erased when the guard drops.
    pub fn keep(&mut self, name: &str) {
        self.keep.push(name.to_owned());
    }

    /// The registry this guard borrows, for creating/looking up diagrams within the scope.
    pub fn registry(&mut self) -> &mut Registry {
        self.registry
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        let created: Vec<String> =
            self.registry.creation_order[self.checkpoint.min(self.registry.creation_order.len())..]
                .to_vec();
        for name in created {
            if !self.keep.contains(&name) {
                self.registry.erase(&name);
            }
        }
    }
}

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::context::Context;

/// A participant in the mainloop.
pub trait Source {
    /// Register fds of interest and optionally shrink the timeout.
    fn update(&mut self, ctx: &mut Context);

    /// React to readiness after `select()` returned. Only inspect fds this
    /// source registered itself.
    fn process(&mut self, ctx: &Context);
}

/// Handle returned by [`Manager::add`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

/// Ordered registry of mainloop sources.
///
/// The manager holds weak handles only; owners keep their sources alive. A source
/// whose owner dropped it is skipped and pruned on the next pass.
#[derive(Default)]
pub struct Manager {
    sources: Vec<(SourceId, Weak<RefCell<dyn Source>>)>,
    next_id: u64,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source` at the end of the visiting order.
    pub fn add<S: Source + 'static>(&mut self, source: &Rc<RefCell<S>>) -> SourceId {
        let source: Rc<RefCell<dyn Source>> = source.clone();
        let id = SourceId(self.next_id);
        self.next_id += 1;
        self.sources.push((id, Rc::downgrade(&source)));
        debug!(id = id.0, count = self.sources.len(), "mainloop source added");
        id
    }

    /// Unregister a source. Returns false if it was not registered.
    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|(existing, _)| *existing != id);
        let removed = self.sources.len() != before;
        if removed {
            debug!(id = id.0, count = self.sources.len(), "mainloop source removed");
        }
        removed
    }

    /// Number of registered sources, including ones whose owner already dropped them.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Let every source register its interest, in registration order.
    pub fn update(&mut self, ctx: &mut Context) {
        self.prune();
        for (_, source) in &self.sources {
            if let Some(source) = source.upgrade() {
                source.borrow_mut().update(ctx);
            }
        }
    }

    /// Let every source react to readiness, in registration order.
    pub fn process(&mut self, ctx: &Context) {
        for (_, source) in &self.sources {
            if let Some(source) = source.upgrade() {
                source.borrow_mut().process(ctx);
            }
        }
    }

    fn prune(&mut self) {
        self.sources.retain(|(_, source)| source.strong_count() > 0);
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("sources", &self.sources.len())
            .finish()
    }
}

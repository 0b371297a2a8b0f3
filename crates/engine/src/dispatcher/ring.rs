use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::invoker::JobInvoker;

/// Handle of a registered invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InvokerId(u64);

impl std::fmt::Display for InvokerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invoker-{}", self.0)
    }
}

struct RingEntry {
    id: InvokerId,
    invoker: Arc<dyn JobInvoker>,
    available: bool,
    /// Refusals in a row while the invoker claimed to be available.
    refusals: u32,
}

/// Registered invokers in registration order with a round-robin cursor.
#[derive(Default)]
pub(crate) struct InvokerRing {
    entries: Vec<RingEntry>,
    cursor: usize,
    next_id: u64,
}

impl InvokerRing {
    pub fn register(&mut self, invoker: Arc<dyn JobInvoker>) -> InvokerId {
        let id = InvokerId(self.next_id);
        self.next_id += 1;
        self.entries.push(RingEntry {
            id,
            invoker,
            available: true,
            refusals: 0,
        });
        id
    }

    pub fn remove(&mut self, id: InvokerId) -> Option<Arc<dyn JobInvoker>> {
        let pos = self.position(id)?;
        let entry = self.entries.remove(pos);
        if pos < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.entries.len() {
            self.cursor = 0;
        }
        Some(entry.invoker)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Available invokers starting at the cursor. Excluded invokers come
    /// after all others.
    pub fn candidates(&self, excluded: &HashSet<InvokerId>) -> Vec<(InvokerId, Arc<dyn JobInvoker>)> {
        let n = self.entries.len();
        let rotated = (0..n)
            .map(|offset| &self.entries[(self.cursor + offset) % n])
            .filter(|e| e.available);
        let (preferred, rest): (Vec<&RingEntry>, Vec<&RingEntry>) =
            rotated.partition(|e| !excluded.contains(&e.id));
        preferred
            .into_iter()
            .chain(rest)
            .map(|e| (e.id, Arc::clone(&e.invoker)))
            .collect()
    }

    /// The invoker accepted a job; the next dispatch starts after it.
    pub fn accepted(&mut self, id: InvokerId) {
        if let Some(pos) = self.position(id) {
            self.entries[pos].refusals = 0;
            self.cursor = (pos + 1) % self.entries.len();
        }
    }

    pub fn mark_busy(&mut self, id: InvokerId) {
        if let Some(pos) = self.position(id) {
            self.entries[pos].available = false;
        }
    }

    /// Count a refusal from an invoker that still reports free capacity.
    pub fn note_refusal(&mut self, id: InvokerId) -> u32 {
        match self.position(id) {
            Some(pos) => {
                self.entries[pos].refusals += 1;
                self.entries[pos].refusals
            }
            None => 0,
        }
    }

    /// The invoker freed capacity. It is offered the next job.
    pub fn mark_available(&mut self, id: InvokerId) -> bool {
        let Some(pos) = self.position(id) else {
            return false;
        };
        if !self.entries[pos].available {
            self.entries[pos].available = true;
            self.cursor = pos;
        }
        true
    }

    pub fn any_available(&self) -> bool {
        self.entries.iter().any(|e| e.available)
    }

    fn position(&self, id: InvokerId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

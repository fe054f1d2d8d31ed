use crate::hook::HookRef;
use crate::hook::invocation::{Args, CallInfo};
use crate::types::CpuContext;

/// A hook callback in one of the supported shapes.
///
/// Every shape returns a verdict: `false` asks for the displaced original
/// instruction to be skipped. Every live callback is dispatched regardless
/// of earlier verdicts; the skip requests are folded.
pub enum Callback {
    /// No context at all.
    Empty(Box<dyn FnMut() -> bool + Send>),
    /// Live argument words.
    Args(Box<dyn FnMut(&mut Args<'_>) -> bool + Send>),
    /// The full register snapshot plus arguments.
    Cpu(Box<dyn FnMut(&mut CpuContext, &mut Args<'_>) -> bool + Send>),
    /// Mutable call metadata (return address, skip flag) plus arguments.
    Info(Box<dyn FnMut(&mut CallInfo<'_>, &mut Args<'_>) -> bool + Send>),
    /// A handle to the owning hook plus arguments.
    Hook(Box<dyn FnMut(&HookRef<'_>, &mut Args<'_>) -> bool + Send>),
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = match self {
            Callback::Empty(_) => "Empty",
            Callback::Args(_) => "Args",
            Callback::Cpu(_) => "Cpu",
            Callback::Info(_) => "Info",
            Callback::Hook(_) => "Hook",
        };
        f.write_str(shape)
    }
}

#[derive(Debug)]
enum Slot {
    Live(Callback),
    Tombstone,
}

/// Ordered callback list with stable identifiers.
///
/// Identifiers are slot indexes. Unregistering the last slot pops it;
/// unregistering any other slot leaves a tombstone so later identifiers
/// stay valid, and the next registration reuses the lowest tombstone.
/// Dispatch order is always slot order, which preserves registration order
/// among surviving callbacks.
#[derive(Debug, Default)]
pub struct CallbackList {
    slots: Vec<Slot>,
}

impl CallbackList {
    pub fn register(&mut self, callback: Callback) -> usize {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|s| matches!(s, Slot::Tombstone))
        {
            self.slots[idx] = Slot::Live(callback);
            return idx;
        }
        self.slots.push(Slot::Live(callback));
        self.slots.len() - 1
    }

    /// Remove a callback by identifier. Unknown or already-removed
    /// identifiers are ignored.
    pub fn unregister(&mut self, id: usize) {
        if id >= self.slots.len() {
            return;
        }
        if id == self.slots.len() - 1 {
            self.slots.pop();
            // Drop any tombstones that are now trailing.
            while matches!(self.slots.last(), Some(Slot::Tombstone)) {
                self.slots.pop();
            }
        } else {
            self.slots[id] = Slot::Tombstone;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| matches!(s, Slot::Tombstone))
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Live(_)))
            .count()
    }

    /// Live callbacks in dispatch order.
    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut Callback> {
        self.slots.iter_mut().filter_map(|s| match s {
            Slot::Live(cb) => Some(cb),
            Slot::Tombstone => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Callback {
        let log = Arc::clone(log);
        Callback::Empty(Box::new(move || {
            log.lock().unwrap().push(tag);
            true
        }))
    }

    fn dispatch_order(list: &mut CallbackList, log: &Arc<Mutex<Vec<&'static str>>>) -> Vec<&'static str> {
        log.lock().unwrap().clear();
        for cb in list.iter_live_mut() {
            if let Callback::Empty(f) = cb {
                f();
            }
        }
        log.lock().unwrap().clone()
    }

    #[test]
    fn register_returns_sequential_ids() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        assert_eq!(list.register(recorder(&log, "a")), 0);
        assert_eq!(list.register(recorder(&log, "b")), 1);
        assert_eq!(list.register(recorder(&log, "c")), 2);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn unregister_middle_reuses_lowest_tombstone() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        list.register(recorder(&log, "a"));
        let b = list.register(recorder(&log, "b"));
        list.register(recorder(&log, "c"));

        list.unregister(b);
        assert_eq!(dispatch_order(&mut list, &log), ["a", "c"]);

        // The replacement lands in the vacated slot, so it dispatches
        // between its neighbors.
        assert_eq!(list.register(recorder(&log, "d")), b);
        assert_eq!(dispatch_order(&mut list, &log), ["a", "d", "c"]);
    }

    #[test]
    fn unregister_last_pops() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        list.register(recorder(&log, "a"));
        let b = list.register(recorder(&log, "b"));
        list.unregister(b);
        // The slot is gone, so the next registration takes index 1 again.
        assert_eq!(list.register(recorder(&log, "c")), 1);
        assert_eq!(dispatch_order(&mut list, &log), ["a", "c"]);
    }

    #[test]
    fn popping_last_drops_trailing_tombstones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        list.register(recorder(&log, "a"));
        let b = list.register(recorder(&log, "b"));
        let c = list.register(recorder(&log, "c"));
        list.unregister(b);
        list.unregister(c);
        // b's tombstone trailed after c popped; both slots are reusable.
        assert_eq!(list.register(recorder(&log, "d")), 1);
        assert_eq!(dispatch_order(&mut list, &log), ["a", "d"]);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut list = CallbackList::default();
        list.unregister(0);
        list.unregister(7);
        let a = list.register(recorder(&log, "a"));
        list.unregister(a);
        list.unregister(a); // double-remove
        assert!(list.is_empty());
    }
}

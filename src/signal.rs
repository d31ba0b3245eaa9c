//! Point-to-point event callbacks.
//!
//! A [`Signal`] is a table of registered handlers keyed by [`SlotId`]. Sockets
//! and streams expose one signal per event kind ("became readable", "closed",
//! ...). Emission runs over a snapshot of the table, so a handler may
//! disconnect itself, or any other slot, while the signal is being emitted.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Handle returned by [`Signal::connect`], used to disconnect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

type Handler<A, B> = Rc<dyn Fn(&A, B)>;

/// A set of handlers invoked with a borrowed emitter `A` and a value `B`.
pub struct Signal<A: ?Sized, B = ()> {
    slots: RefCell<Vec<(SlotId, Handler<A, B>)>>,
    next_id: Cell<u64>,
}

impl<A: ?Sized, B: Clone> Signal<A, B> {
    pub fn new() -> Self {
        Signal {
            slots: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    /// Register a handler. Handlers run in connection order.
    pub fn connect<F>(&self, handler: F) -> SlotId
    where
        F: Fn(&A, B) + 'static,
    {
        let id = SlotId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.slots.borrow_mut().push((id, Rc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if the slot was not connected.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|(slot, _)| *slot != id);
        slots.len() != before
    }

    pub fn disconnect_all(&self) {
        self.slots.borrow_mut().clear();
    }

    pub fn is_connected(&self, id: SlotId) -> bool {
        self.slots.borrow().iter().any(|(slot, _)| *slot == id)
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Invoke every handler connected at the time of the call.
    ///
    /// A handler that is disconnected by an earlier handler of the same
    /// emission is skipped.
    pub fn emit(&self, emitter: &A, value: B) {
        let snapshot: Vec<(SlotId, Handler<A, B>)> = self
            .slots
            .borrow()
            .iter()
            .map(|(id, h)| (*id, Rc::clone(h)))
            .collect();

        for (id, handler) in snapshot {
            if !self.is_connected(id) {
                continue;
            }
            handler(emitter, value.clone());
        }
    }
}

impl<A: ?Sized, B: Clone> Default for Signal<A, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: ?Sized, B> fmt::Debug for Signal<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slots.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_in_connection_order() {
        let signal: Signal<str, u32> = Signal::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        signal.connect(move |name: &str, n| s.borrow_mut().push(format!("a:{name}:{n}")));
        let s = seen.clone();
        signal.connect(move |name: &str, n| s.borrow_mut().push(format!("b:{name}:{n}")));

        signal.emit("x", 7);

        assert_eq!(*seen.borrow(), vec!["a:x:7", "b:x:7"]);
    }

    #[test]
    fn handler_can_disconnect_itself() {
        let signal: Rc<Signal<str>> = Rc::new(Signal::new());
        let count = Rc::new(Cell::new(0));
        let slot = Rc::new(Cell::new(None));

        let (sig, c, sl) = (Rc::downgrade(&signal), count.clone(), slot.clone());
        let id = signal.connect(move |_: &str, ()| {
            c.set(c.get() + 1);
            if let (Some(sig), Some(id)) = (sig.upgrade(), sl.get()) {
                sig.disconnect(id);
            }
        });
        slot.set(Some(id));

        signal.emit("x", ());
        signal.emit("x", ());

        assert_eq!(count.get(), 1);
        assert!(signal.is_empty());
    }

    #[test]
    fn disconnected_during_emit_is_skipped() {
        let signal: Rc<Signal<str>> = Rc::new(Signal::new());
        let second_ran = Rc::new(Cell::new(false));
        let victim = Rc::new(Cell::new(None));

        let (sig, v) = (Rc::downgrade(&signal), victim.clone());
        signal.connect(move |_: &str, ()| {
            if let (Some(sig), Some(id)) = (sig.upgrade(), v.get()) {
                sig.disconnect(id);
            }
        });
        let ran = second_ran.clone();
        let id = signal.connect(move |_: &str, ()| ran.set(true));
        victim.set(Some(id));

        signal.emit("x", ());

        assert!(!second_ran.get());
        assert_eq!(signal.len(), 1);
    }

    #[test]
    fn connected_during_emit_waits_for_next_emit() {
        let signal: Rc<Signal<str>> = Rc::new(Signal::new());
        let late = Rc::new(Cell::new(0));

        let (sig, l) = (Rc::downgrade(&signal), late.clone());
        signal.connect(move |_: &str, ()| {
            if let Some(sig) = sig.upgrade() {
                if sig.len() == 1 {
                    let l = l.clone();
                    sig.connect(move |_: &str, ()| l.set(l.get() + 1));
                }
            }
        });

        signal.emit("x", ());
        assert_eq!(late.get(), 0);

        signal.emit("x", ());
        assert_eq!(late.get(), 1);
    }
}

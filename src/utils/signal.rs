//! Typed event signals
//!
//! Components of this crate announce state changes through [`Signal`]s.
//! Interested parties subscribe with [`Signal::observe`] and keep the
//! returned [`Observer`] handle alive for as long as they want to receive
//! events; dropping the handle removes the subscription.
//!
//! Emission is synchronous and single-threaded. Observing or emitting from
//! within an observer callback is supported: observers added during an
//! emission are only invoked starting with the next event, and a nested
//! emission is queued and delivered once the current one has been handed to
//! every observer.

use std::{
    any::Any,
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

/// An event source that delivers values of type `E` to its observers
pub struct Signal<E> {
    inner: Rc<SignalInner<E>>,
}

impl<E> Signal<E> {
    /// Create a new signal with no observers
    pub fn new() -> Signal<E> {
        Signal {
            inner: Rc::new(SignalInner::new()),
        }
    }

    /// Register a new observer on this signal
    ///
    /// The callback stays subscribed until the returned [`Observer`] is
    /// dropped. An observer registered while an event is being delivered
    /// does not see that event.
    #[must_use]
    pub fn observe<F: FnMut(&E) + 'static>(&self, callback: F) -> Observer {
        let rc = Rc::new(RefCell::new(callback));
        let weak = Rc::downgrade(&rc) as Weak<RefCell<dyn FnMut(&E)>>;
        self.inner.insert(weak);
        Observer { callback: rc }
    }

    /// Deliver an event to every current observer
    pub fn emit(&self, event: E) {
        self.inner.send(event);
    }

    /// Number of live observers, for diagnostics
    pub fn observer_count(&self) -> usize {
        self.inner
            .callbacks
            .borrow()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl<E> Clone for Signal<E> {
    fn clone(&self) -> Signal<E> {
        Signal {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for Signal<E> {
    fn default() -> Self {
        Signal::new()
    }
}

impl<E> fmt::Debug for Signal<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("observers", &self.inner.callbacks.borrow().len())
            .finish()
    }
}

/// Subscription handle returned by [`Signal::observe`]
///
/// Dropping it removes the associated callback from the signal.
pub struct Observer {
    #[allow(dead_code)]
    callback: Rc<dyn Any>,
}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Observer { .. }")
    }
}

type WeakCallback<E> = Weak<RefCell<dyn FnMut(&E)>>;

struct SignalInner<E> {
    callbacks: RefCell<Vec<WeakCallback<E>>>,
    pending_callbacks: RefCell<Vec<WeakCallback<E>>>,
    pending_events: RefCell<VecDeque<E>>,
}

impl<E> SignalInner<E> {
    fn new() -> SignalInner<E> {
        SignalInner {
            callbacks: RefCell::new(Vec::new()),
            pending_callbacks: RefCell::new(Vec::new()),
            pending_events: RefCell::new(VecDeque::new()),
        }
    }

    fn insert(&self, weak: WeakCallback<E>) {
        if let Ok(mut guard) = self.callbacks.try_borrow_mut() {
            guard.push(weak);
        } else {
            // registration from within a callback of this same signal;
            // deferred until the current event is fully delivered
            self.pending_callbacks.borrow_mut().push(weak);
        }
    }

    fn send(&self, event: E) {
        self.pending_events.borrow_mut().push_back(event);
        // If the borrow fails another delivery is already running further up
        // the stack and will drain the queue we just pushed to.
        if let Ok(mut guard) = self.callbacks.try_borrow_mut() {
            loop {
                let next_event = self.pending_events.borrow_mut().pop_front();
                let Some(event) = next_event else { break };
                guard.retain(|weak| {
                    if let Some(callback) = Weak::upgrade(weak) {
                        (callback.borrow_mut())(&event);
                        true
                    } else {
                        false
                    }
                });
                guard.extend(self.pending_callbacks.borrow_mut().drain(..));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn emit_reaches_observer() {
        let signal = Signal::<u32>::new();
        let seen = Rc::new(Cell::new(0u32));

        let seen2 = seen.clone();
        let _observer = signal.observe(move |&value| seen2.set(value));

        signal.emit(42);
        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn dropping_observer_unsubscribes() {
        let signal = Signal::<u32>::new();

        let observer = signal.observe(|&value| assert_eq!(value, 1));
        signal.emit(1);
        drop(observer);
        signal.emit(2);
    }

    #[test]
    fn observer_added_during_emission_skips_current_event() {
        let signal = Signal::<u32>::new();
        let late_calls = Rc::new(Cell::new(0u32));

        let signal2 = signal.clone();
        let late_calls2 = late_calls.clone();
        let late_slot: Rc<RefCell<Option<Observer>>> = Rc::new(RefCell::new(None));
        let late_slot2 = late_slot.clone();
        let _observer = signal.observe(move |_| {
            if late_slot2.borrow().is_none() {
                let late_calls3 = late_calls2.clone();
                *late_slot2.borrow_mut() =
                    Some(signal2.observe(move |_| late_calls3.set(late_calls3.get() + 1)));
            }
        });

        signal.emit(0);
        assert_eq!(late_calls.get(), 0);
        signal.emit(1);
        assert_eq!(late_calls.get(), 1);
    }

    #[test]
    fn nested_emission_is_deferred_not_lost() {
        let signal = Signal::<u32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let signal2 = signal.clone();
        let log2 = log.clone();
        let _observer = signal.observe(move |&value| {
            log2.borrow_mut().push(value);
            if value == 0 {
                signal2.emit(7);
            }
        });

        signal.emit(0);
        assert_eq!(&*log.borrow(), &[0, 7]);
    }
}

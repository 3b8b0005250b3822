//! The versioned broadcast core: value cell, version counter, activity gate
//! and the reentrant dispatch loop.
//!
//! Everything in here is lane-confined by [`crate::Broadcaster`]'s
//! [`Confined`](`cambium::Confined`) wrapper; plain [`Cell`]s and
//! [`RefCell`]s are sufficient.

use core::cell::{Cell, RefCell};
use std::rc::Rc;

use scopeguard::guard;

use crate::{
	host::Host,
	observer::{Observer, ObserverId},
	registry::{LinkedMap, SnapshotIter},
};

/// The closed set of activity sources for a registration.
pub(crate) enum Binding {
	/// Considered active for as long as it is registered.
	Always,
	/// Active while the host's state meets the activity threshold.
	Bound(Host),
}

impl Binding {
	fn should_be_active(&self) -> bool {
		match self {
			Binding::Always => true,
			Binding::Bound(host) => host.state().is_active(),
		}
	}
}

/// Per-registration wrapper state. The `active` flag is a cache of the
/// binding predicate and is authoritative for dispatch decisions; the
/// predicate is re-checked lazily during delivery.
pub(crate) struct Entry<T: ?Sized> {
	pub(crate) observer: Observer<T>,
	pub(crate) binding: Binding,
	active: Cell<bool>,
	last_version: Cell<u64>,
	pub(crate) host_listener: Cell<Option<u64>>,
}

impl<T: ?Sized> Entry<T> {
	pub(crate) fn new(observer: Observer<T>, binding: Binding) -> Rc<Self> {
		Rc::new(Self {
			observer,
			binding,
			active: Cell::new(false),
			last_version: Cell::new(0),
			host_listener: Cell::new(None),
		})
	}

	pub(crate) fn is_bound_to(&self, host: &Host) -> bool {
		matches!(&self.binding, Binding::Bound(bound) if bound.ptr_eq(host))
	}
}

pub(crate) struct RawBroadcaster<T> {
	/// Bumped exactly once per successful write, never reset. Starts at 0,
	/// which doubles as the "nothing seen yet" sentinel in `last_version`.
	version: Cell<u64>,
	value: RefCell<Option<T>>,
	observers: LinkedMap<ObserverId, Rc<Entry<T>>>,
	active_count: Cell<usize>,
	changing_active_state: Cell<bool>,
	dispatching: Cell<bool>,
	dispatch_invalidated: Cell<bool>,
	activity_listeners: RefCell<Vec<Box<dyn FnMut(bool)>>>,
}

impl<T: 'static + Clone> RawBroadcaster<T> {
	pub(crate) fn new(initial: Option<T>) -> Self {
		Self {
			version: Cell::new(u64::from(initial.is_some())),
			value: RefCell::new(initial),
			observers: LinkedMap::new(),
			active_count: Cell::new(0),
			changing_active_state: Cell::new(false),
			dispatching: Cell::new(false),
			dispatch_invalidated: Cell::new(false),
			activity_listeners: RefCell::new(Vec::new()),
		}
	}

	pub(crate) fn version(&self) -> u64 {
		self.version.get()
	}

	pub(crate) fn latest(&self) -> Option<T> {
		self.value.borrow().clone()
	}

	pub(crate) fn observer_count(&self) -> usize {
		self.observers.len()
	}

	pub(crate) fn active_count(&self) -> usize {
		self.active_count.get()
	}

	pub(crate) fn entry(&self, id: ObserverId) -> Option<Rc<Entry<T>>> {
		self.observers.get(id)
	}

	pub(crate) fn register(&self, entry: Rc<Entry<T>>) {
		let existing = self
			.observers
			.put_if_absent(entry.observer.id(), entry);
		debug_assert!(existing.is_none(), "conflicts are checked by the caller");
	}

	/// Unregisters without touching activity state; the caller detaches the
	/// host listener and then deactivates the returned entry.
	pub(crate) fn take(&self, id: ObserverId) -> Option<Rc<Entry<T>>> {
		self.observers.remove(id)
	}

	pub(crate) fn iter_snapshot(&self) -> SnapshotIter<'_, ObserverId, Rc<Entry<T>>> {
		self.observers.iter()
	}

	/// Stores `value` under a bumped version and runs the dispatch loop.
	pub(crate) fn set(&self, value: T) {
		self.version.set(self.version.get() + 1);
		*self.value.borrow_mut() = Some(value);
		tracing::trace!(version = self.version.get(), "value written");
		self.dispatch(None);
	}

	/// Flips the wrapper's cached activity flag, aggregates the active count
	/// and, on the inactive→active edge, performs catch-up delivery for just
	/// this wrapper.
	pub(crate) fn active_state_changed(&self, entry: &Rc<Entry<T>>, active: bool) {
		if entry.active.get() == active {
			return;
		}
		entry.active.set(active);
		self.change_active_counter(if active { 1 } else { -1 });
		if active {
			self.dispatch(Some(entry));
		}
	}

	/// Saturating previous-vs-current loop: activation hooks may recursively
	/// change the count, but each distinct 0↔N edge fires exactly once and
	/// stack depth stays bounded.
	fn change_active_counter(&self, change: isize) {
		let mut previous = self.active_count.get();
		self.active_count.set(
			previous
				.checked_add_signed(change)
				.expect("active-observer count out of balance"),
		);
		if self.changing_active_state.get() {
			return;
		}
		self.changing_active_state.set(true);
		let _reset = guard((), |()| self.changing_active_state.set(false));
		while previous != self.active_count.get() {
			let needs_active = previous == 0 && self.active_count.get() > 0;
			let needs_inactive = previous > 0 && self.active_count.get() == 0;
			previous = self.active_count.get();
			if needs_active {
				self.notify_activity(true);
			} else if needs_inactive {
				self.notify_activity(false);
			}
		}
	}

	fn notify_activity(&self, active: bool) {
		// Lifted out so a listener body can't conflict with the borrow.
		let mut listeners = self.activity_listeners.take();
		for listener in &mut listeners {
			listener(active);
		}
		let mut current = self.activity_listeners.borrow_mut();
		listeners.append(&mut current);
		*current = listeners;
	}

	pub(crate) fn add_activity_listener(&self, listener: Box<dyn FnMut(bool)>) {
		self.activity_listeners.borrow_mut().push(listener);
	}

	/// The dispatch loop. A nested call while a pass is in progress marks the
	/// pass invalidated and returns; the outer loop then restarts its walk,
	/// since version and membership may have changed.
	pub(crate) fn dispatch(&self, initiator: Option<&Rc<Entry<T>>>) {
		if self.dispatching.get() {
			self.dispatch_invalidated.set(true);
			return;
		}
		self.dispatching.set(true);
		// Observer panics propagate to the caller that triggered the
		// dispatch; the flags still have to be restored on the way out.
		let _reset = guard((), |()| self.dispatching.set(false));
		let mut initiator = initiator;
		loop {
			self.dispatch_invalidated.set(false);
			if let Some(entry) = initiator.take() {
				self.consider_notify(entry);
			} else {
				for (_, entry) in self.observers.iter_with_additions() {
					self.consider_notify(&entry);
					if self.dispatch_invalidated.get() {
						break;
					}
				}
			}
			if !self.dispatch_invalidated.get() {
				break;
			}
		}
	}

	fn consider_notify(&self, entry: &Rc<Entry<T>>) {
		if !entry.active.get() {
			return;
		}
		// The cached flag may be stale; deactivate lazily rather than
		// deliver on its basis.
		if !entry.binding.should_be_active() {
			self.active_state_changed(entry, false);
			return;
		}
		if entry.last_version.get() >= self.version.get() {
			return;
		}
		entry.last_version.set(self.version.get());
		let value = self.value.borrow().clone();
		if let Some(value) = value {
			entry.observer.call(&value);
		}
	}
}

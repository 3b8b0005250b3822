//! [`Broadcaster`]: the public handle around the versioned broadcast core.

use core::num::NonZeroU64;
use std::{
	rc::Rc,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
};

use cambium::{Confined, Lane};
use parking_lot::Mutex;

use crate::{
	host::{Host, HostState},
	observer::{Observer, ObserverId},
	raw::{Binding, Entry, RawBroadcaster},
};

static BROADCASTER_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) struct Shared<T> {
	id: NonZeroU64,
	lane: Lane,
	raw: Confined<RawBroadcaster<T>>,
	/// `post` coalescing slot: only the most recent value survives a burst,
	/// and at most one flush is scheduled at a time.
	pending: Mutex<Option<T>>,
}

/// A mutable "latest value" cell that notifies registered observers on every
/// write, honouring each observer's activity state.
///
/// Handles are cheap to clone and shareable across threads. All operations
/// except [`Broadcaster::post`] are confined to the broadcaster's [`Lane`]
/// and panic off-lane.
pub struct Broadcaster<T> {
	pub(crate) shared: Arc<Shared<T>>,
}

impl<T> Clone for Broadcaster<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<T> core::fmt::Debug for Broadcaster<T> {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Broadcaster")
			.field("id", &self.shared.id)
			.finish_non_exhaustive()
	}
}

impl<T: 'static + Clone> Broadcaster<T> {
	/// Creates an unset broadcaster on `lane`: observers receive nothing
	/// until the first write.
	///
	/// # Panics
	///
	/// Iff called off `lane`.
	#[must_use]
	pub fn new(lane: &Lane) -> Self {
		Self::construct(lane, None)
	}

	/// Creates a broadcaster whose value is already present; observers
	/// attaching later receive it as catch-up delivery.
	///
	/// # Panics
	///
	/// Iff called off `lane`.
	#[must_use]
	pub fn with_initial(lane: &Lane, initial: T) -> Self {
		Self::construct(lane, Some(initial))
	}

	fn construct(lane: &Lane, initial: Option<T>) -> Self {
		Self {
			shared: Arc::new(Shared {
				id: (BROADCASTER_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
					.try_into()
					.expect("unreachable within a reasonable program lifetime"),
				lane: lane.clone(),
				raw: Confined::new(lane, RawBroadcaster::new(initial)),
				pending: Mutex::new(None),
			}),
		}
	}

	/// The coordinating lane. Callable from any thread.
	#[must_use]
	pub fn lane(&self) -> &Lane {
		self.shared.raw.lane()
	}

	pub(crate) fn id(&self) -> NonZeroU64 {
		self.shared.id
	}

	/// Registers `observer` bound to `host`: it receives values only while
	/// the host is active, and auto-deregisters when the host is destroyed.
	///
	/// Silently does nothing iff the host is already destroyed. Registering
	/// the same observer under the same host again is a no-op.
	///
	/// # Panics
	///
	/// Iff called off the lane, or iff `observer` is already registered
	/// under a *different* host or as always-active.
	pub fn observe(&self, host: &Host, observer: &Observer<T>) {
		let raw = self.shared.raw.get();
		if host.state().is_destroyed() {
			return;
		}
		if let Some(existing) = raw.entry(observer.id()) {
			match &existing.binding {
				Binding::Bound(bound) if bound.ptr_eq(host) => return,
				Binding::Bound(_) => {
					panic!("observer is already registered under a different host")
				}
				Binding::Always => panic!("observer is already registered as always-active"),
			}
		}
		let entry = Entry::new(observer.clone(), Binding::Bound(host.clone()));
		raw.register(Rc::clone(&entry));
		let weak = Arc::downgrade(&self.shared);
		let id = observer.id();
		let listener = host.add_listener(move |state| {
			if let Some(shared) = weak.upgrade() {
				host_state_changed(&shared, id, state);
			}
		});
		// The listener id is recorded first: the replay below performs
		// catch-up activation (and delivery) for an active host, and that
		// delivery may already remove the observer again.
		entry.host_listener.set(Some(listener));
		host.replay(listener);
	}

	/// Registers `observer` as always-active. Idempotent for an observer
	/// already registered this way.
	///
	/// The latest value (if any) is delivered immediately as catch-up.
	///
	/// # Panics
	///
	/// Iff called off the lane, or iff `observer` is already registered
	/// bound to a host.
	pub fn observe_always(&self, observer: &Observer<T>) {
		let raw = self.shared.raw.get();
		if let Some(existing) = raw.entry(observer.id()) {
			match &existing.binding {
				Binding::Always => return,
				Binding::Bound(_) => {
					panic!("observer is already registered under a host")
				}
			}
		}
		let entry = Entry::new(observer.clone(), Binding::Always);
		raw.register(Rc::clone(&entry));
		raw.active_state_changed(&entry, true);
	}

	/// Unregisters `observer`. A second call for the same identity is a
	/// no-op.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	pub fn remove_observer(&self, observer: &Observer<T>) {
		remove_entry(&self.shared, observer.id());
	}

	/// Unregisters every observer bound to `host`.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	pub fn remove_observers_for(&self, host: &Host) {
		let raw = self.shared.raw.get();
		let bound: Vec<ObserverId> = raw
			.iter_snapshot()
			.filter(|(_, entry)| entry.is_bound_to(host))
			.map(|(id, _)| id)
			.collect();
		for id in bound {
			remove_entry(&self.shared, id);
		}
	}

	/// Synchronously stores `value`, bumps the version and notifies active
	/// observers in registration order.
	///
	/// A nested call from within an observer callback is coalesced into the
	/// in-progress dispatch rather than stacked.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	pub fn set(&self, value: T) {
		self.shared.raw.get().set(value);
	}

	/// The current value, or [`None`] while unset.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	#[must_use]
	pub fn latest(&self) -> Option<T> {
		self.shared.raw.get().latest()
	}

	pub(crate) fn version(&self) -> u64 {
		self.shared.raw.get().version()
	}

	/// Whether any observer is registered.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	#[must_use]
	pub fn has_observers(&self) -> bool {
		self.shared.raw.get().observer_count() > 0
	}

	/// Whether any registered observer is currently active.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	#[must_use]
	pub fn has_active_observers(&self) -> bool {
		self.shared.raw.get().active_count() > 0
	}

	pub(crate) fn add_activity_listener(&self, listener: Box<dyn FnMut(bool)>) {
		self.shared.raw.get().add_activity_listener(listener);
	}

	/// Creates a non-owning handle.
	#[must_use]
	pub fn downgrade(&self) -> WeakBroadcaster<T> {
		WeakBroadcaster {
			shared: Arc::downgrade(&self.shared),
		}
	}
}

impl<T: 'static + Clone + Send> Broadcaster<T> {
	/// Stores `value` from any thread.
	///
	/// Concurrent posts coalesce: only the most recent value in a burst is
	/// delivered, through exactly one [`Broadcaster::set`] scheduled on the
	/// lane. Intermediate values are silently dropped (most-recent-wins).
	pub fn post(&self, value: T) {
		let flush = {
			let mut pending = self.shared.pending.lock();
			let flush = pending.is_none();
			*pending = Some(value);
			flush
		};
		if flush {
			let weak = Arc::downgrade(&self.shared);
			self.shared.lane.schedule(move || {
				let Some(shared) = weak.upgrade() else { return };
				let Some(value) = shared.pending.lock().take() else {
					return;
				};
				shared.raw.get().set(value);
			});
		}
	}
}

fn host_state_changed<T: 'static + Clone>(
	shared: &Arc<Shared<T>>,
	id: ObserverId,
	state: HostState,
) {
	let raw = shared.raw.get();
	let Some(entry) = raw.entry(id) else { return };
	if state.is_destroyed() {
		remove_entry(shared, id);
	} else {
		raw.active_state_changed(&entry, state.is_active());
	}
}

fn remove_entry<T: 'static + Clone>(shared: &Arc<Shared<T>>, id: ObserverId) {
	let raw = shared.raw.get();
	let Some(entry) = raw.take(id) else { return };
	if let Binding::Bound(host) = &entry.binding {
		if let Some(listener) = entry.host_listener.take() {
			host.remove_listener(listener);
		}
	}
	raw.active_state_changed(&entry, false);
}

/// Non-owning counterpart of [`Broadcaster`]; used by mediators so upstream
/// lifetimes aren't extended by downstream bookkeeping.
pub struct WeakBroadcaster<T> {
	shared: Weak<Shared<T>>,
}

impl<T> Clone for WeakBroadcaster<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Weak::clone(&self.shared),
		}
	}
}

impl<T> WeakBroadcaster<T> {
	#[must_use]
	pub fn upgrade(&self) -> Option<Broadcaster<T>> {
		self.shared
			.upgrade()
			.map(|shared| Broadcaster { shared })
	}
}

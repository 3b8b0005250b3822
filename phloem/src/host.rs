//! The host-activity boundary: a lifecycle-bearing entity whose discrete
//! state gates observer activity.
//!
//! [`Host`] is the integration point for an external lifecycle system: the
//! embedder drives [`Host::set_state`] on the lane, and broadcasters bind
//! observers to the host through [`Broadcaster::observe`](`crate::Broadcaster::observe`).

use core::cell::Cell;
use std::{rc::Rc, sync::Arc};

use cambium::{Confined, Lane};

use crate::registry::LinkedMap;

/// Discrete host state, ordered from terminal to fully active.
///
/// An observer bound to a host is *active* while the host's state is at
/// least [`HostState::Active`]. [`HostState::Destroyed`] is terminal: bound
/// observers auto-deregister and the host accepts no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostState {
	/// Terminal. Observers bound to the host are removed.
	Destroyed,
	/// Alive but not active; bound observers don't receive values.
	Inactive,
	/// Bound observers receive values.
	Active,
}

impl HostState {
	/// Whether the state meets the minimum "active" threshold.
	#[must_use]
	pub fn is_active(self) -> bool {
		self >= HostState::Active
	}

	/// Whether the state is terminal.
	#[must_use]
	pub fn is_destroyed(self) -> bool {
		self == HostState::Destroyed
	}
}

type ListenerFn = dyn Fn(HostState);

struct HostCore {
	state: Cell<HostState>,
	listeners: LinkedMap<u64, Rc<ListenerFn>>,
	counter: Cell<u64>,
}

/// A lifecycle-bearing entity. Starts [`Inactive`](`HostState::Inactive`).
///
/// Handles are cheap to clone and share identity; state transitions are
/// lane-confined.
#[derive(Clone)]
pub struct Host {
	core: Arc<Confined<HostCore>>,
}

impl core::fmt::Debug for Host {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		let mut s = f.debug_struct("Host");
		if self.lane().is_on() {
			s.field("state", &self.state());
		}
		s.finish_non_exhaustive()
	}
}

impl Host {
	/// Creates a host confined to `lane`.
	///
	/// # Panics
	///
	/// Iff called off `lane`.
	#[must_use]
	pub fn new(lane: &Lane) -> Self {
		Self {
			core: Arc::new(Confined::new(
				lane,
				HostCore {
					state: Cell::new(HostState::Inactive),
					listeners: LinkedMap::new(),
					counter: Cell::new(0),
				},
			)),
		}
	}

	/// The lane this host lives on.
	#[must_use]
	pub fn lane(&self) -> &Lane {
		self.core.lane()
	}

	/// The current state.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	#[must_use]
	pub fn state(&self) -> HostState {
		self.core.get().state.get()
	}

	/// Moves the host to `state`, notifying listeners in registration order.
	///
	/// Transitioning to [`HostState::Destroyed`] delivers a final
	/// notification and then discards all listeners.
	///
	/// # Panics
	///
	/// Iff called off the lane, or iff the host is already destroyed and
	/// `state` isn't [`HostState::Destroyed`].
	pub fn set_state(&self, state: HostState) {
		let core = self.core.get();
		let previous = core.state.get();
		if previous == state {
			return;
		}
		assert!(
			!previous.is_destroyed(),
			"attempted to revive a destroyed host"
		);
		core.state.set(state);
		// Snapshot iteration: a listener may deregister itself (or others)
		// while being notified, and listeners attached mid-notification hear
		// the new state through their replay, not a second time here.
		for (_, listener) in core.listeners.iter() {
			listener(state);
		}
		if state.is_destroyed() {
			let ids: Vec<u64> = core.listeners.iter().map(|(id, _)| id).collect();
			for id in ids {
				core.listeners.remove(id);
			}
		}
	}

	/// Registers `listener` without calling it. The caller records the
	/// **returned** id before it triggers [`Host::replay`], so the listener
	/// can already be deregistered from within its first invocation.
	pub(crate) fn add_listener(&self, listener: impl 'static + Fn(HostState)) -> u64 {
		let core = self.core.get();
		let id = core.counter.get() + 1;
		core.counter.set(id);
		let existing = core.listeners.put_if_absent(id, Rc::new(listener));
		debug_assert!(existing.is_none());
		id
	}

	/// Replays the current state to `listener`, so a binding to an
	/// already-active host activates without waiting for the next transition.
	pub(crate) fn replay(&self, listener: u64) {
		let core = self.core.get();
		if let Some(listener) = core.listeners.get(listener) {
			listener(core.state.get());
		}
	}

	pub(crate) fn remove_listener(&self, id: u64) {
		self.core.get().listeners.remove(id);
	}

	pub(crate) fn ptr_eq(&self, other: &Host) -> bool {
		Arc::ptr_eq(&self.core, &other.core)
	}

	#[cfg(test)]
	pub(crate) fn listener_count(&self) -> usize {
		self.core.get().listeners.len()
	}
}

//! [`Mediator`]: a broadcaster that is itself an observer of one or more
//! upstream broadcasters.

use core::{cell::Cell, num::NonZeroU64, ops::Deref};
use std::{cell::RefCell, collections::BTreeMap, rc::Rc, sync::Arc};

use cambium::{Confined, Lane};
use tap::Pipe;

use crate::{
	broadcaster::{Broadcaster, WeakBroadcaster},
	error::SourceConflict,
	observer::{Observer, ObserverId},
};

pub(crate) struct MediatorShared<T> {
	broadcaster: Broadcaster<T>,
	sources: Confined<RefCell<BTreeMap<NonZeroU64, Rc<SourceRecord>>>>,
}

struct SourceRecord {
	/// The caller's observer identity, for conflict decisions.
	observer_id: ObserverId,
	plugged: Cell<bool>,
	link: Box<dyn SourceLink>,
}

impl SourceRecord {
	fn plug_in(&self) {
		if !self.plugged.replace(true) {
			self.link.attach();
		}
	}

	fn unplug(&self) {
		if self.plugged.replace(false) {
			self.link.detach();
		}
	}
}

/// Type-erased connection to one upstream of some value type.
trait SourceLink {
	fn attach(&self);
	fn detach(&self);
}

struct TypedLink<U: 'static + Clone> {
	upstream: WeakBroadcaster<U>,
	forward: Observer<U>,
}

impl<U: 'static + Clone> SourceLink for TypedLink<U> {
	fn attach(&self) {
		// Non-owning: a dropped upstream simply stops forwarding.
		if let Some(upstream) = self.upstream.upgrade() {
			upstream.observe_always(&self.forward);
		}
	}

	fn detach(&self) {
		if let Some(upstream) = self.upstream.upgrade() {
			upstream.remove_observer(&self.forward);
		}
	}
}

/// A broadcast core that composes upstream broadcasters into one downstream
/// value.
///
/// Upstream changes are forwarded only while the mediator itself has at
/// least one active observer: it subscribes to every recorded source on its
/// own inactive→active edge and unsubscribes on the reverse edge.
///
/// Derefs to [`Broadcaster`] for observation and writes.
pub struct Mediator<T> {
	pub(crate) shared: Arc<MediatorShared<T>>,
}

impl<T> Clone for Mediator<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<T> core::fmt::Debug for Mediator<T> {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Mediator")
			.field("broadcaster", &self.shared.broadcaster)
			.finish_non_exhaustive()
	}
}

impl<T> Deref for Mediator<T> {
	type Target = Broadcaster<T>;

	fn deref(&self) -> &Broadcaster<T> {
		&self.shared.broadcaster
	}
}

impl<T: 'static + Clone> Mediator<T> {
	/// Creates an unset mediator on `lane`.
	///
	/// # Panics
	///
	/// Iff called off `lane`.
	#[must_use]
	pub fn new(lane: &Lane) -> Self {
		let shared = Arc::new(MediatorShared {
			broadcaster: Broadcaster::new(lane),
			sources: Confined::new(lane, RefCell::new(BTreeMap::new())),
		});
		let weak = Arc::downgrade(&shared);
		shared
			.broadcaster
			.add_activity_listener(Box::new(move |active| {
				let Some(shared) = weak.upgrade() else { return };
				// Snapshot first: plugging in performs catch-up delivery,
				// which may re-enter the mediator.
				let records: Vec<Rc<SourceRecord>> =
					shared.sources.get().borrow().values().cloned().collect();
				for record in records {
					if active {
						record.plug_in();
					} else {
						record.unplug();
					}
				}
			}));
		Self { shared }
	}

	/// Records `upstream` as a source, forwarding its notifications to
	/// `observer` while the mediator is active. Subscribes immediately iff
	/// the mediator currently has active observers.
	///
	/// Re-adding the identical (upstream, observer) pair is a no-op.
	///
	/// # Errors
	///
	/// [`SourceConflict`] iff `upstream` is already recorded with a
	/// different observer.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	pub fn add_source<U: 'static + Clone>(
		&self,
		upstream: &Broadcaster<U>,
		observer: &Observer<U>,
	) -> Result<(), SourceConflict> {
		let sources = self.shared.sources.get();
		let key = upstream.id();
		if let Some(existing) = sources.borrow().get(&key) {
			return if existing.observer_id == observer.id() {
				Ok(())
			} else {
				Err(SourceConflict(()))
			};
		}
		let forward = {
			let upstream = upstream.downgrade();
			let user = observer.clone();
			let last_forwarded = Cell::new(0_u64);
			Observer::new(move |value: &U| {
				// Suppress notifications that carry no new upstream version.
				if let Some(upstream) = upstream.upgrade() {
					let version = upstream.version();
					if last_forwarded.get() >= version {
						return;
					}
					last_forwarded.set(version);
				}
				user.call(value);
			})
		};
		let record = SourceRecord {
			observer_id: observer.id(),
			plugged: Cell::new(false),
			link: Box::new(TypedLink {
				upstream: upstream.downgrade(),
				forward,
			}),
		}
		.pipe(Rc::new);
		sources.borrow_mut().insert(key, Rc::clone(&record));
		if self.shared.broadcaster.has_active_observers() {
			record.plug_in();
		}
		Ok(())
	}

	/// Unsubscribes from `upstream` (if subscribed) and discards its record.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	pub fn remove_source<U: 'static + Clone>(&self, upstream: &Broadcaster<U>) {
		self.remove_source_by_id(upstream.id());
	}

	pub(crate) fn remove_source_by_id(&self, key: NonZeroU64) {
		let record = self.shared.sources.get().borrow_mut().remove(&key);
		if let Some(record) = record {
			record.unplug();
		}
	}

	/// Cheaply clones a plain [`Broadcaster`] handle to the same cell.
	#[must_use]
	pub fn to_broadcaster(&self) -> Broadcaster<T> {
		self.shared.broadcaster.clone()
	}
}

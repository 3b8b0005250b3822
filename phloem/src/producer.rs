//! [`Producer`]: exactly one cancellable background task per broadcaster,
//! restarted or finalised based on a grace-period timeout tied to observer
//! activity.

use core::{cell::RefCell, future::Future, ops::Deref, pin::Pin, time::Duration};
use std::sync::{Arc, Weak};

use cambium::{Confined, Lane, TaskHandle, TimerHandle};

use crate::{broadcaster::Broadcaster, mediator::Mediator, observer::Observer};

type BlockFuture = Pin<Box<dyn 'static + Future<Output = ()>>>;
type BlockFactory<T> = Box<dyn Fn(Emitter<T>) -> BlockFuture>;

pub(crate) struct ProducerShared<T: 'static + Clone + Send> {
	mediator: Mediator<T>,
	runner: Confined<RefCell<Runner<T>>>,
}

struct Runner<T: 'static + Clone + Send> {
	factory: BlockFactory<T>,
	grace: Duration,
	task: Option<TaskHandle>,
	cancellation: Option<TimerHandle>,
	/// Set on natural completion of the block; bars further restarts.
	completed: bool,
	emitted_source: Option<core::num::NonZeroU64>,
}

/// A broadcaster fed by a restartable asynchronous block.
///
/// The block starts on the broadcaster's inactive→active edge and may call
/// [`Emitter::emit`] any number of times, or [`Emitter::emit_source`] to
/// forward from another broadcaster. Deactivation schedules cancellation
/// only after a grace period, so the task survives short activity gaps
/// without restarting.
///
/// Derefs to [`Broadcaster`] for observation.
pub struct Producer<T: 'static + Clone + Send> {
	shared: Arc<ProducerShared<T>>,
}

impl<T: 'static + Clone + Send> Clone for Producer<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<T: 'static + Clone + Send> Deref for Producer<T> {
	type Target = Broadcaster<T>;

	fn deref(&self) -> &Broadcaster<T> {
		&self.shared.mediator
	}
}

impl<T: 'static + Clone + Send> core::fmt::Debug for Producer<T> {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Producer")
			.field("mediator", &self.shared.mediator)
			.finish_non_exhaustive()
	}
}

impl<T: 'static + Clone + Send> Producer<T> {
	/// Creates a producer-backed broadcaster on `lane`.
	///
	/// `block` is invoked afresh for each task start. A panic escaping it
	/// propagates to whoever pumps the lane; the broadcaster stays usable
	/// and the next activation starts a fresh task.
	///
	/// # Panics
	///
	/// Iff called off `lane`.
	#[must_use]
	pub fn new<F, Fut>(lane: &Lane, grace: Duration, block: F) -> Self
	where
		F: 'static + Fn(Emitter<T>) -> Fut,
		Fut: 'static + Future<Output = ()>,
	{
		let shared = Arc::new(ProducerShared {
			mediator: Mediator::new(lane),
			runner: Confined::new(
				lane,
				RefCell::new(Runner {
					factory: Box::new(move |emitter| Box::pin(block(emitter))),
					grace,
					task: None,
					cancellation: None,
					completed: false,
					emitted_source: None,
				}),
			),
		});
		let weak = Arc::downgrade(&shared);
		shared
			.mediator
			.add_activity_listener(Box::new(move |active| {
				let Some(shared) = weak.upgrade() else { return };
				if active {
					maybe_run(&shared);
				} else {
					schedule_cancellation(&shared);
				}
			}));
		if shared.mediator.has_active_observers() {
			maybe_run(&shared);
		}
		Self { shared }
	}

	/// Cheaply clones a plain [`Broadcaster`] handle to the same cell.
	#[must_use]
	pub fn to_broadcaster(&self) -> Broadcaster<T> {
		self.shared.mediator.to_broadcaster()
	}
}

/// Cancels any pending grace timer, then starts the block unless a task is
/// still running or a previous run completed naturally.
fn maybe_run<T: 'static + Clone + Send>(shared: &Arc<ProducerShared<T>>) {
	let lane = shared.runner.lane().clone();
	let mut runner = shared.runner.get().borrow_mut();
	if let Some(timer) = runner.cancellation.take() {
		timer.cancel();
	}
	if let Some(task) = &runner.task {
		if task.is_finished() {
			// A panicking block clears its slot this way.
			runner.task = None;
		} else {
			return;
		}
	}
	if runner.completed {
		return;
	}
	tracing::debug!("starting producer block");
	let future = (runner.factory)(Emitter {
		shared: Arc::downgrade(shared),
	});
	let weak = Arc::downgrade(shared);
	runner.task = Some(lane.spawn(async move {
		future.await;
		if let Some(shared) = weak.upgrade() {
			let mut runner = shared.runner.get().borrow_mut();
			runner.task = None;
			runner.completed = true;
			tracing::debug!("producer block completed");
		}
	}));
}

/// Schedules the grace-period timer. The task is cancelled only if the owner
/// is still inactive when the timer fires.
///
/// # Panics
///
/// Iff a cancellation is already pending (caller logic error: the activity
/// edges alternate, so this can't happen through the activity gate).
fn schedule_cancellation<T: 'static + Clone + Send>(shared: &Arc<ProducerShared<T>>) {
	let lane = shared.runner.lane().clone();
	let mut runner = shared.runner.get().borrow_mut();
	assert!(
		runner.cancellation.is_none(),
		"a producer cancellation is already pending"
	);
	let weak = Arc::downgrade(shared);
	runner.cancellation = Some(lane.schedule_after(runner.grace, move || {
		let Some(shared) = weak.upgrade() else { return };
		let task = {
			let mut runner = shared.runner.get().borrow_mut();
			runner.cancellation = None;
			// Final check, closing the race between reactivation and
			// cancellation.
			if shared.mediator.has_active_observers() {
				None
			} else {
				runner.task.take()
			}
		};
		if let Some(task) = task {
			tracing::debug!("cancelling producer block after grace period");
			task.cancel();
		}
	}));
}

/// Write access handed to a producer block.
///
/// Weakly tied to its producer: emitting after the producer is gone is a
/// no-op.
pub struct Emitter<T: 'static + Clone + Send> {
	shared: Weak<ProducerShared<T>>,
}

impl<T: 'static + Clone + Send> Clone for Emitter<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Weak::clone(&self.shared),
		}
	}
}

impl<T: 'static + Clone + Send> Emitter<T> {
	/// Synchronously sets the produced value, detaching any source
	/// previously attached with [`Emitter::emit_source`].
	pub fn emit(&self, value: T) {
		let Some(shared) = self.shared.upgrade() else { return };
		clear_emitted(&shared);
		shared.mediator.set(value);
	}

	/// Forwards every value of `upstream` into this broadcaster, replacing
	/// any previously emitted source.
	pub fn emit_source(&self, upstream: &Broadcaster<T>) {
		let Some(shared) = self.shared.upgrade() else { return };
		clear_emitted(&shared);
		let downstream = shared.mediator.to_broadcaster();
		let forward = Observer::new(move |value: &T| downstream.set(value.clone()));
		shared
			.mediator
			.add_source(upstream, &forward)
			.expect("unreachable");
		shared.runner.get().borrow_mut().emitted_source = Some(upstream.id());
	}
}

fn clear_emitted<T: 'static + Clone + Send>(shared: &Arc<ProducerShared<T>>) {
	let key = shared.runner.get().borrow_mut().emitted_source.take();
	if let Some(key) = key {
		shared.mediator.remove_source_by_id(key);
	}
}

//! The coordinating [`Lane`]: a thread-affine scheduler with queued
//! callbacks, cancellable timers and a local task executor.
//!
//! A lane is bound to exactly one thread for its whole life. Work can be
//! *submitted* from any thread, but it only ever *runs* on the owning thread,
//! when that thread pumps the lane ([`Lane::run`], [`Lane::run_until_idle`],
//! [`Lane::run_for`]). This is what makes "on the lane" a meaningful,
//! checkable property ([`Lane::is_on`]).

use core::{
	future::Future,
	num::NonZeroU64,
	pin::Pin,
	task::{Context, Poll, Waker},
	time::Duration,
};
use std::{
	collections::{BTreeMap, VecDeque},
	mem,
	panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Weak,
	},
	task::Wake,
	thread::{self, ThreadId},
	time::Instant,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// A handle to a coordinating lane.
///
/// Handles are cheap to clone and may be shared freely across threads.
/// Operations that mutate lane-confined state ([`Lane::spawn`],
/// [`TaskHandle::cancel`], the pumping methods) **must** be called on the
/// owning thread and panic otherwise.
#[derive(Clone)]
pub struct Lane {
	inner: Arc<LaneInner>,
}

impl core::fmt::Debug for Lane {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("Lane")
			.field("owner", &self.inner.owner)
			.finish_non_exhaustive()
	}
}

struct LaneInner {
	owner: ThreadId,
	state: Mutex<LaneState>,
	condvar: Condvar,
	counter: AtomicU64,
}

/// Safety: `LaneState::tasks` holds non-`Send` futures, but those are only
/// ever created, polled and dropped on the owner thread (`spawn`,
/// `poll_task` and `TaskHandle::cancel` all check the calling thread first).
/// Every other field is `Send`. Dropping the last handle off the owner
/// thread leaks remaining futures instead of dropping them there (see
/// `impl Drop for LaneInner`).
unsafe impl Send for LaneInner {}
unsafe impl Sync for LaneInner {}

impl Drop for LaneInner {
	fn drop(&mut self) {
		let state = self.state.get_mut();
		if !state.tasks.is_empty() && thread::current().id() != self.owner {
			tracing::error!(
				tasks = state.tasks.len(),
				"lane dropped off its owning thread; leaking its live tasks"
			);
			for (_, task) in mem::take(&mut state.tasks) {
				mem::forget(task);
			}
		}
	}
}

struct LaneState {
	queue: VecDeque<Box<dyn 'static + Send + FnOnce()>>,
	timers: BTreeMap<(Instant, NonZeroU64), Box<dyn 'static + Send + FnOnce()>>,
	tasks: BTreeMap<NonZeroU64, Task>,
	ready: VecDeque<NonZeroU64>,
	/// Task currently lifted out of `tasks` for polling, plus whether it was
	/// cancelled while out.
	polling: Option<(NonZeroU64, bool)>,
	stopped: bool,
}

struct Task {
	future: Pin<Box<dyn 'static + Future<Output = ()>>>,
}

enum Work {
	Run(Box<dyn 'static + Send + FnOnce()>),
	Poll(NonZeroU64),
}

impl Default for Lane {
	fn default() -> Self {
		Self::new()
	}
}

impl Lane {
	/// Creates a lane bound to the calling thread.
	#[must_use]
	pub fn new() -> Self {
		Self {
			inner: Arc::new(LaneInner {
				owner: thread::current().id(),
				state: Mutex::new(LaneState {
					queue: VecDeque::new(),
					timers: BTreeMap::new(),
					tasks: BTreeMap::new(),
					ready: VecDeque::new(),
					polling: None,
					stopped: false,
				}),
				condvar: Condvar::new(),
				counter: AtomicU64::new(0),
			}),
		}
	}

	/// Spawns a dedicated thread that owns and pumps a fresh lane until
	/// [`Lane::shutdown`] is called.
	///
	/// # Panics
	///
	/// Iff the thread can't be spawned.
	#[must_use]
	pub fn spawn_thread() -> Self {
		let (send, recv) = std::sync::mpsc::channel();
		thread::Builder::new()
			.name("cambium-lane".into())
			.spawn(move || {
				let lane = Lane::new();
				send.send(lane.clone()).expect("unreachable");
				lane.run();
			})
			.expect("couldn't spawn the lane thread");
		recv.recv().expect("unreachable")
	}

	/// Whether the calling thread owns this lane.
	#[must_use]
	pub fn is_on(&self) -> bool {
		thread::current().id() == self.inner.owner
	}

	/// Panics with a uniform message iff called off the owning thread.
	pub fn assert_on(&self) {
		assert!(
			self.is_on(),
			"called a lane-confined operation off its coordinating lane"
		);
	}

	fn next_id(&self) -> NonZeroU64 {
		(self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1)
			.try_into()
			.expect("unreachable within a reasonable program lifetime")
	}

	/// Queues `f` to run on the lane soon. Callable from any thread.
	pub fn schedule(&self, f: impl 'static + Send + FnOnce()) {
		{
			let mut state = self.inner.state.lock();
			state.queue.push_back(Box::new(f));
		}
		self.inner.condvar.notify_all();
	}

	/// Runs `f` immediately iff already on the lane, otherwise queues it.
	pub fn call(&self, f: impl 'static + Send + FnOnce()) {
		if self.is_on() {
			f();
		} else {
			self.schedule(f);
		}
	}

	/// Queues `f` to run on the lane once `delay` has elapsed.
	///
	/// The returned [`TimerHandle`] can cancel the timer as long as it hasn't
	/// fired.
	pub fn schedule_after(&self, delay: Duration, f: impl 'static + Send + FnOnce()) -> TimerHandle {
		let key = (Instant::now() + delay, self.next_id());
		{
			let mut state = self.inner.state.lock();
			state.timers.insert(key, Box::new(f));
		}
		tracing::trace!(?delay, "timer scheduled");
		self.inner.condvar.notify_all();
		TimerHandle {
			lane: Arc::downgrade(&self.inner),
			key,
		}
	}

	/// Spawns `future` onto the lane's local executor.
	///
	/// The future doesn't have to be `Send`; it is polled and dropped only on
	/// the owning thread.
	///
	/// # Panics
	///
	/// Iff called off the owning thread.
	pub fn spawn(&self, future: impl 'static + Future<Output = ()>) -> TaskHandle {
		self.assert_on();
		let id = self.next_id();
		{
			let mut state = self.inner.state.lock();
			state.tasks.insert(
				id,
				Task {
					future: Box::pin(future),
				},
			);
			state.ready.push_back(id);
		}
		tracing::trace!(id = id.get(), "task spawned");
		TaskHandle {
			lane: Arc::downgrade(&self.inner),
			id,
		}
	}

	/// A future that completes on this lane once `duration` has elapsed.
	pub fn sleep(&self, duration: Duration) -> Sleep {
		Sleep {
			lane: self.clone(),
			duration,
			shared: Arc::new(Mutex::new(SleepShared {
				elapsed: false,
				waker: None,
			})),
			timer: None,
		}
	}

	/// Performs one unit of work, if any is due. **Returns** whether it did.
	fn turn(&self) -> bool {
		let work = {
			let mut state = self.inner.state.lock();
			if let Some(f) = state.queue.pop_front() {
				Some(Work::Run(f))
			} else if let Some(key) = state
				.timers
				.keys()
				.next()
				.copied()
				.filter(|(at, _)| *at <= Instant::now())
			{
				Some(Work::Run(
					state.timers.remove(&key).expect("unreachable"),
				))
			} else if let Some(id) = state.ready.pop_front() {
				Some(Work::Poll(id))
			} else {
				None
			}
		};
		match work {
			None => false,
			Some(Work::Run(f)) => {
				f();
				true
			}
			Some(Work::Poll(id)) => {
				self.poll_task(id);
				true
			}
		}
	}

	fn poll_task(&self, id: NonZeroU64) {
		let mut task = {
			let mut state = self.inner.state.lock();
			let Some(task) = state.tasks.remove(&id) else {
				// Cancelled between wake-up and here.
				return;
			};
			state.polling = Some((id, false));
			task
		};

		let waker = Waker::from(Arc::new(LaneWaker {
			lane: Arc::downgrade(&self.inner),
			id,
		}));
		let poll = catch_unwind(AssertUnwindSafe(|| {
			task.future.as_mut().poll(&mut Context::from_waker(&waker))
		}));

		let mut state = self.inner.state.lock();
		let cancelled = matches!(state.polling, Some((_, true)));
		state.polling = None;
		match poll {
			Err(panic) => {
				drop(state);
				drop(task);
				resume_unwind(panic);
			}
			Ok(Poll::Ready(())) | Ok(Poll::Pending) if cancelled => {
				tracing::trace!(id = id.get(), "task cancelled during poll");
			}
			Ok(Poll::Ready(())) => {
				tracing::trace!(id = id.get(), "task completed");
			}
			Ok(Poll::Pending) => {
				state.tasks.insert(id, task);
			}
		}
	}

	/// Pumps the lane until no queued callback, due timer or ready task
	/// remains. Doesn't wait for timers that are still in the future.
	///
	/// # Panics
	///
	/// Iff called off the owning thread.
	pub fn run_until_idle(&self) {
		self.assert_on();
		while self.turn() {}
	}

	/// Pumps the lane for (at least) `duration`, sleeping between units of
	/// work and firing timers as they come due.
	///
	/// # Panics
	///
	/// Iff called off the owning thread.
	pub fn run_for(&self, duration: Duration) {
		self.assert_on();
		let deadline = Instant::now() + duration;
		loop {
			self.run_until_idle();
			let now = Instant::now();
			if now >= deadline {
				break;
			}
			let mut state = self.inner.state.lock();
			if Self::has_immediate_work(&state) {
				continue;
			}
			let until = state
				.timers
				.keys()
				.next()
				.map_or(deadline, |(at, _)| deadline.min(*at));
			self.inner.condvar.wait_until(&mut state, until);
		}
	}

	/// Pumps the lane until [`Lane::shutdown`] is called, sleeping while
	/// there's nothing to do.
	///
	/// # Panics
	///
	/// Iff called off the owning thread.
	pub fn run(&self) {
		self.assert_on();
		loop {
			if self.turn() {
				continue;
			}
			let mut state = self.inner.state.lock();
			if state.stopped {
				break;
			}
			if Self::has_immediate_work(&state) {
				continue;
			}
			match state.timers.keys().next().copied() {
				Some((at, _)) => {
					self.inner.condvar.wait_until(&mut state, at);
				}
				None => self.inner.condvar.wait(&mut state),
			}
		}
	}

	fn has_immediate_work(state: &MutexGuard<'_, LaneState>) -> bool {
		!state.queue.is_empty()
			|| !state.ready.is_empty()
			|| state
				.timers
				.keys()
				.next()
				.is_some_and(|(at, _)| *at <= Instant::now())
	}

	/// Makes [`Lane::run`] return after it finishes its current unit of work.
	/// Callable from any thread.
	pub fn shutdown(&self) {
		self.inner.state.lock().stopped = true;
		self.inner.condvar.notify_all();
	}
}

struct LaneWaker {
	lane: Weak<LaneInner>,
	id: NonZeroU64,
}

impl Wake for LaneWaker {
	fn wake(self: Arc<Self>) {
		let Some(lane) = self.lane.upgrade() else {
			return;
		};
		{
			let mut state = lane.state.lock();
			let live = state.tasks.contains_key(&self.id)
				|| matches!(state.polling, Some((id, false)) if id == self.id);
			if live && !state.ready.contains(&self.id) {
				state.ready.push_back(self.id);
			}
		}
		lane.condvar.notify_all();
	}
}

/// Cancellation handle for a task spawned with [`Lane::spawn`].
///
/// Dropping the handle does *not* cancel the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
	lane: Weak<LaneInner>,
	id: NonZeroU64,
}

impl TaskHandle {
	/// Drops the task's future, preventing any further progress. Idempotent.
	///
	/// # Panics
	///
	/// Iff called off the owning thread (the future **must** be dropped
	/// there).
	pub fn cancel(&self) {
		let Some(lane) = self.lane.upgrade() else {
			return;
		};
		assert!(
			thread::current().id() == lane.owner,
			"called a lane-confined operation off its coordinating lane"
		);
		let task = {
			let mut state = lane.state.lock();
			if let Some((id, cancelled)) = &mut state.polling {
				if *id == self.id {
					*cancelled = true;
					return;
				}
			}
			state.tasks.remove(&self.id)
		};
		if task.is_some() {
			tracing::trace!(id = self.id.get(), "task cancelled");
		}
		drop(task);
	}

	/// Whether the task has completed, panicked or been cancelled.
	/// Callable from any thread.
	#[must_use]
	pub fn is_finished(&self) -> bool {
		let Some(lane) = self.lane.upgrade() else {
			return true;
		};
		let state = lane.state.lock();
		!(state.tasks.contains_key(&self.id)
			|| matches!(state.polling, Some((id, _)) if id == self.id))
	}
}

/// Cancellation handle for a timer scheduled with [`Lane::schedule_after`].
#[derive(Debug)]
pub struct TimerHandle {
	lane: Weak<LaneInner>,
	key: (Instant, NonZeroU64),
}

impl TimerHandle {
	/// Cancels the timer. **Returns** whether it hadn't already fired.
	pub fn cancel(self) -> bool {
		let Some(lane) = self.lane.upgrade() else {
			return false;
		};
		let mut state = lane.state.lock();
		state.timers.remove(&self.key).is_some()
	}

	/// Whether the timer is still waiting to fire.
	#[must_use]
	pub fn is_pending(&self) -> bool {
		self.lane
			.upgrade()
			.is_some_and(|lane| lane.state.lock().timers.contains_key(&self.key))
	}
}

struct SleepShared {
	elapsed: bool,
	waker: Option<Waker>,
}

/// Timer future created by [`Lane::sleep`].
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
	lane: Lane,
	duration: Duration,
	shared: Arc<Mutex<SleepShared>>,
	timer: Option<TimerHandle>,
}

impl Future for Sleep {
	type Output = ();

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let this = &mut *self;
		let mut shared = this.shared.lock();
		if shared.elapsed {
			return Poll::Ready(());
		}
		shared.waker = Some(cx.waker().clone());
		if this.timer.is_none() {
			let weak = Arc::downgrade(&this.shared);
			this.timer = Some(this.lane.schedule_after(this.duration, move || {
				if let Some(shared) = weak.upgrade() {
					let mut shared = shared.lock();
					shared.elapsed = true;
					if let Some(waker) = shared.waker.take() {
						waker.wake();
					}
				}
			}));
		}
		Poll::Pending
	}
}

impl Drop for Sleep {
	fn drop(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.cancel();
		}
	}
}

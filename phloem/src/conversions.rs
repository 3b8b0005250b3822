//! Conversions between broadcasters and push-streams.
//!
//! Both directions are activity-aware: [`Broadcaster::to_stream`] holds an
//! always-active registration for as long as the stream is being collected,
//! and [`Broadcaster::from_stream`] collects its stream only while the
//! resulting broadcaster is observed (with the producer's grace period
//! bridging short gaps).

use core::{
	cell::RefCell,
	pin::Pin,
	task::{Context, Poll, Waker},
	time::Duration,
};
use std::rc::Rc;

use cambium::Lane;
use futures_lite::{Stream, StreamExt};

use crate::{broadcaster::Broadcaster, observer::Observer, producer::Producer};

struct StreamSlot<T> {
	value: Option<T>,
	waker: Option<Waker>,
}

/// Conflated view of a broadcaster as a [`Stream`].
///
/// Values written faster than they're polled collapse to the most recent one
/// (most-recent-wins, per the broadcaster's delivery model). The stream
/// never ends.
///
/// Not [`Send`]: create, poll and drop it on the broadcaster's lane (for
/// example inside a task spawned there).
#[must_use = "streams do nothing unless polled"]
pub struct BroadcasterStream<T: 'static + Clone> {
	broadcaster: Broadcaster<T>,
	observer: Option<Observer<T>>,
	slot: Rc<RefCell<StreamSlot<T>>>,
}

impl<T: 'static + Clone> Stream for BroadcasterStream<T> {
	type Item = T;

	fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
		let this = &mut *self;
		if this.observer.is_none() {
			// Collection begins: start the broadcaster's activity. Catch-up
			// delivery lands in the slot synchronously.
			let slot = Rc::clone(&this.slot);
			let observer = Observer::new(move |value: &T| {
				let mut slot = slot.borrow_mut();
				slot.value = Some(value.clone());
				if let Some(waker) = slot.waker.take() {
					waker.wake();
				}
			});
			this.broadcaster.observe_always(&observer);
			this.observer = Some(observer);
		}
		let mut slot = this.slot.borrow_mut();
		match slot.value.take() {
			Some(value) => Poll::Ready(Some(value)),
			None => {
				slot.waker = Some(cx.waker().clone());
				Poll::Pending
			}
		}
	}
}

impl<T: 'static + Clone> Drop for BroadcasterStream<T> {
	fn drop(&mut self) {
		// Collection ends: stop the broadcaster's activity. `Self` isn't
		// `Send`, so this runs on the lane.
		if let Some(observer) = self.observer.take() {
			self.broadcaster.remove_observer(&observer);
		}
	}
}

impl<T: 'static + Clone> Broadcaster<T> {
	/// Views this broadcaster as a conflated [`Stream`] of its values.
	///
	/// The underlying registration is created on first poll and removed when
	/// the stream is dropped.
	pub fn to_stream(&self) -> BroadcasterStream<T> {
		BroadcasterStream {
			broadcaster: self.clone(),
			observer: None,
			slot: Rc::new(RefCell::new(StreamSlot {
				value: None,
				waker: None,
			})),
		}
	}
}

impl<T: 'static + Clone + Send> Broadcaster<T> {
	/// Builds a broadcaster that collects a stream while observed.
	///
	/// `make` is called afresh on every (re)start, so it should return a
	/// cold stream.
	///
	/// # Panics
	///
	/// Iff called off `lane`.
	pub fn from_stream<S>(
		lane: &Lane,
		grace: Duration,
		make: impl 'static + Fn() -> S,
	) -> Producer<T>
	where
		S: 'static + Stream<Item = T>,
	{
		Producer::new(lane, grace, move |emitter| {
			let stream = make();
			async move {
				let mut stream = core::pin::pin!(stream);
				while let Some(value) = stream.next().await {
					emitter.emit(value);
				}
			}
		})
	}
}

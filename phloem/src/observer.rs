//! [`Observer`]: an identity-bearing value callback.

use core::{
	cell::RefCell,
	fmt::{self, Debug, Formatter},
	num::NonZeroU64,
};
use std::{
	rc::Rc,
	sync::atomic::{AtomicU64, Ordering},
};

static OBSERVER_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ObserverId(NonZeroU64);

impl ObserverId {
	fn next() -> Self {
		Self(
			(OBSERVER_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
				.try_into()
				.expect("unreachable within a reasonable program lifetime"),
		)
	}
}

/// A callback with identity.
///
/// Clones share the identity, so a clone can be used to
/// [`remove`](`crate::Broadcaster::remove_observer`) the original
/// registration. Registration conflict checks ("same observer under two
/// different hosts") compare this identity, not the callback.
///
/// Observers are lane-confined: create, register and invoke them only on the
/// broadcaster's lane.
pub struct Observer<T: ?Sized>(Rc<ObserverInner<T>>);

struct ObserverInner<T: ?Sized> {
	id: ObserverId,
	callback: RefCell<Box<dyn FnMut(&T)>>,
}

impl<T: ?Sized> Clone for Observer<T> {
	fn clone(&self) -> Self {
		Self(Rc::clone(&self.0))
	}
}

impl<T: ?Sized> Debug for Observer<T> {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.debug_tuple("Observer").field(&self.0.id).finish()
	}
}

impl<T: ?Sized> Observer<T> {
	/// Wraps `callback` with a fresh identity.
	#[must_use]
	pub fn new(callback: impl 'static + FnMut(&T)) -> Self {
		Self(Rc::new(ObserverInner {
			id: ObserverId::next(),
			callback: RefCell::new(Box::new(callback)),
		}))
	}

	pub(crate) fn id(&self) -> ObserverId {
		self.0.id
	}

	/// # Panics
	///
	/// Iff the callback is re-entered. The dispatch loop coalesces nested
	/// writes instead of nesting deliveries, so this doesn't happen through
	/// broadcaster entry points.
	pub(crate) fn call(&self, value: &T) {
		(self.0.callback.borrow_mut())(value);
	}
}

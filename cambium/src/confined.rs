//! [`Confined`] pins a value to a [`Lane`] and turns off-lane access into a
//! detectable usage error.

use core::mem::ManuallyDrop;

use crate::lane::Lane;

/// A cell confining `value` to its lane's owning thread.
///
/// `Confined<T>` is unconditionally [`Send`] and [`Sync`] so that handles
/// containing it can cross threads, but the contained value is only reachable
/// through [`Confined::get`], which panics off the lane. This trades a
/// runtime check for the structural guarantee the single-lane discipline
/// needs: `Cell`s, `RefCell`s and `Rc`s behind it are never touched
/// concurrently.
///
/// # Logic
///
/// Iff the *last* reference is dropped off the lane, the value is leaked
/// rather than dropped on the wrong thread. Lanes that shut down cleanly
/// don't hit this path.
pub struct Confined<T> {
	lane: Lane,
	value: ManuallyDrop<T>,
}

/// Safety: `value` is only ever reached through [`Confined::get`] and
/// [`Confined::drop`], both of which verify the calling thread owns the lane
/// first (the drop path leaks instead of touching the value off-lane).
unsafe impl<T> Send for Confined<T> {}
unsafe impl<T> Sync for Confined<T> {}

impl<T> Confined<T> {
	/// Confines `value` to `lane`.
	///
	/// # Panics
	///
	/// Iff called off `lane`.
	pub fn new(lane: &Lane, value: T) -> Self {
		lane.assert_on();
		Self {
			lane: lane.clone(),
			value: ManuallyDrop::new(value),
		}
	}

	/// Borrows the confined value.
	///
	/// # Panics
	///
	/// Iff called off the lane.
	pub fn get(&self) -> &T {
		self.lane.assert_on();
		&self.value
	}

	/// The lane this value is confined to. Callable from any thread.
	pub fn lane(&self) -> &Lane {
		&self.lane
	}
}

impl<T> Drop for Confined<T> {
	fn drop(&mut self) {
		if self.lane.is_on() {
			unsafe { ManuallyDrop::drop(&mut self.value) }
		} else if core::mem::needs_drop::<T>() {
			tracing::error!("confined value dropped off its lane; leaking it");
		}
	}
}

impl<T: core::fmt::Debug> core::fmt::Debug for Confined<T> {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		let mut s = f.debug_tuple("Confined");
		if self.lane.is_on() {
			s.field(&&*self.value);
		} else {
			s.field(&"(off-lane)");
		}
		s.finish()
	}
}

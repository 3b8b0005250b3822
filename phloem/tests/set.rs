use std::{
	cell::Cell,
	panic::{catch_unwind, AssertUnwindSafe},
	rc::Rc,
};

use phloem::{Broadcaster, Lane, Observer};

use _validator::Validator;

#[test]
fn delivers_in_registration_order() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let first = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("first", *value))
	});
	let second = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("second", *value))
	});
	b.observe_always(&first);
	b.observe_always(&second);
	// Unset: registration delivers nothing.
	v.expect([]);

	b.set(1);
	v.expect([("first", 1), ("second", 1)]);

	b.set(2);
	v.expect([("first", 2), ("second", 2)]);
}

#[test]
fn late_observer_catches_up_with_latest_only() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	b.set(1);
	b.set(2);

	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe_always(&observer);
	v.expect([2]);

	assert_eq!(b.latest(), Some(2));
}

#[test]
fn initial_value_is_catch_up_delivered() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::with_initial(&lane, "start");
	let observer = Observer::new({
		let v = v.clone();
		move |value: &&str| v.push(*value)
	});
	b.observe_always(&observer);
	v.expect(["start"]);
}

#[test]
fn removed_observer_skips_to_latest_on_readd() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe_always(&observer);
	b.set(1);
	v.expect([1]);

	b.remove_observer(&observer);
	b.set(2);
	b.set(3);
	v.expect([]);

	// Registration is fresh, so only the latest value is replayed.
	b.observe_always(&observer);
	v.expect([3]);
}

#[test]
fn every_write_notifies_even_if_equal() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe_always(&observer);
	b.set(7);
	b.set(7);
	v.expect([7, 7]);
}

#[test]
fn nested_set_supersedes_the_running_pass() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let b2 = b.clone();
	let bumped = Rc::new(Cell::new(false));
	let a = Observer::new({
		let v = v.clone();
		move |value: &i32| {
			v.push(("a", *value));
			if !bumped.replace(true) {
				b2.set(2);
			}
		}
	});
	let b_obs = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("b", *value))
	});
	b.observe_always(&a);
	b.observe_always(&b_obs);

	b.set(1);
	// The nested write invalidates the pass; "b" never sees the
	// superseded value.
	v.expect([("a", 1), ("a", 2), ("b", 2)]);
	assert_eq!(b.latest(), Some(2));
}

#[test]
fn observer_added_during_dispatch_is_reached() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let c = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("c", *value))
	});
	let b2 = b.clone();
	let added = Rc::new(Cell::new(false));
	let a = Observer::new({
		let v = v.clone();
		move |value: &i32| {
			v.push(("a", *value));
			if !added.replace(true) {
				b2.observe_always(&c);
			}
		}
	});
	let b_obs = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("b", *value))
	});
	b.observe_always(&a);
	b.observe_always(&b_obs);

	b.set(1);
	v.expect([("a", 1), ("b", 1), ("c", 1)]);
}

#[test]
fn observer_removed_during_dispatch_is_skipped() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let b_obs = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("b", *value))
	});
	let b2 = b.clone();
	let a = Observer::new({
		let v = v.clone();
		let b_obs = b_obs.clone();
		move |value: &i32| {
			v.push(("a", *value));
			b2.remove_observer(&b_obs);
		}
	});
	b.observe_always(&a);
	b.observe_always(&b_obs);

	b.set(1);
	v.expect([("a", 1)]);
	assert!(b.has_observers());
}

#[test]
fn a_panicking_observer_stops_the_pass_but_not_the_broadcaster() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let before = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("before", *value))
	});
	let failing = Observer::new(|value: &i32| {
		assert_ne!(*value, 1, "rigged");
	});
	let after = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("after", *value))
	});
	b.observe_always(&before);
	b.observe_always(&failing);
	b.observe_always(&after);

	// The panic propagates to the writer; observers later in the pass
	// aren't notified.
	let outcome = catch_unwind(AssertUnwindSafe(|| b.set(1)));
	assert!(outcome.is_err());
	v.expect([("before", 1)]);
	assert_eq!(b.latest(), Some(1));

	// The broadcaster stays usable and the next pass reaches everyone.
	b.set(2);
	v.expect([("before", 2), ("after", 2)]);
}

#[test]
fn observer_counts() {
	let lane = Lane::new();
	let b = Broadcaster::new(&lane);
	assert!(!b.has_observers());
	assert!(!b.has_active_observers());

	let observer = Observer::new(|_: &i32| ());
	b.observe_always(&observer);
	assert!(b.has_observers());
	assert!(b.has_active_observers());

	b.remove_observer(&observer);
	assert!(!b.has_observers());
	assert!(!b.has_active_observers());
}

#[test]
fn weak_handle_does_not_keep_the_cell_alive() {
	let lane = Lane::new();
	let b = Broadcaster::with_initial(&lane, 1);
	let weak = b.downgrade();
	assert_eq!(weak.upgrade().map(|b| b.latest()), Some(Some(1)));

	drop(b);
	assert!(weak.upgrade().is_none());
}

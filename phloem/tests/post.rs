use std::{thread, time::Duration};

use phloem::{Broadcaster, Lane, Observer};

use _validator::Validator;

#[test]
fn post_is_deferred_even_on_the_lane() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe_always(&observer);

	b.post(1);
	v.expect([]);
	assert_eq!(b.latest(), None);

	lane.run_until_idle();
	v.expect([1]);
	assert_eq!(b.latest(), Some(1));
}

#[test]
fn post_marshals_writes_from_other_threads() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe_always(&observer);

	thread::spawn({
		let b = b.clone();
		move || b.post(7)
	})
	.join()
	.unwrap();

	lane.run_until_idle();
	v.expect([7]);
}

#[test]
fn a_burst_of_posts_coalesces_to_the_most_recent() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe_always(&observer);

	// The lane isn't pumped while the burst runs, so exactly one flush is
	// scheduled and intermediate values are dropped.
	thread::spawn({
		let b = b.clone();
		move || {
			for n in 1..=100 {
				b.post(n);
			}
		}
	})
	.join()
	.unwrap();

	lane.run_until_idle();
	v.expect([100]);
}

#[test]
fn set_after_a_flushed_post_wins() {
	let lane = Lane::new();
	let b = Broadcaster::new(&lane);

	b.post(1);
	lane.run_until_idle();
	b.set(2);
	assert_eq!(b.latest(), Some(2));

	// A later burst still goes through.
	b.post(3);
	lane.run_for(Duration::from_millis(10));
	assert_eq!(b.latest(), Some(3));
}

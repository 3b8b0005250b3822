use phloem::{Broadcaster, Host, HostState, Lane, Observer};

use _validator::Validator;

#[test]
fn bound_observer_only_fires_while_active() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let host = Host::new(&lane);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe(&host, &observer);

	// Hosts start inactive.
	b.set(1);
	v.expect([]);

	// Activation catches up with the latest value exactly once.
	host.set_state(HostState::Active);
	v.expect([1]);

	b.set(2);
	v.expect([2]);

	host.set_state(HostState::Inactive);
	b.set(3);
	b.set(4);
	v.expect([]);

	host.set_state(HostState::Active);
	v.expect([4]);
}

#[test]
fn binding_to_an_already_active_host_delivers_immediately() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::with_initial(&lane, 1);
	let host = Host::new(&lane);
	host.set_state(HostState::Active);

	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe(&host, &observer);
	v.expect([1]);
}

#[test]
fn destroying_the_host_deregisters_its_observers() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let host = Host::new(&lane);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe(&host, &observer);
	assert!(b.has_observers());

	host.set_state(HostState::Destroyed);
	assert!(!b.has_observers());

	b.set(1);
	v.expect([]);
}

#[test]
fn observing_under_a_destroyed_host_is_ignored() {
	let lane = Lane::new();
	let b = Broadcaster::new(&lane);
	let host = Host::new(&lane);
	host.set_state(HostState::Destroyed);

	let observer = Observer::new(|_: &i32| ());
	b.observe(&host, &observer);
	assert!(!b.has_observers());
}

#[test]
fn reobserving_under_the_same_host_is_a_noop() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let host = Host::new(&lane);
	host.set_state(HostState::Active);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe(&host, &observer);
	b.observe(&host, &observer);

	b.set(1);
	v.expect([1]);
}

#[test]
#[should_panic(expected = "observer is already registered under a different host")]
fn rebinding_to_a_different_host_panics() {
	let lane = Lane::new();
	let b = Broadcaster::new(&lane);
	let observer = Observer::new(|_: &i32| ());
	b.observe(&Host::new(&lane), &observer);
	b.observe(&Host::new(&lane), &observer);
}

#[test]
#[should_panic(expected = "observer is already registered as always-active")]
fn binding_an_always_active_observer_panics() {
	let lane = Lane::new();
	let b = Broadcaster::new(&lane);
	let observer = Observer::new(|_: &i32| ());
	b.observe_always(&observer);
	b.observe(&Host::new(&lane), &observer);
}

#[test]
#[should_panic(expected = "observer is already registered under a host")]
fn unbinding_a_bound_observer_panics() {
	let lane = Lane::new();
	let b = Broadcaster::new(&lane);
	let observer = Observer::new(|_: &i32| ());
	b.observe(&Host::new(&lane), &observer);
	b.observe_always(&observer);
}

#[test]
#[should_panic(expected = "attempted to revive a destroyed host")]
fn reviving_a_destroyed_host_panics() {
	let lane = Lane::new();
	let host = Host::new(&lane);
	host.set_state(HostState::Destroyed);
	host.set_state(HostState::Active);
}

#[test]
fn remove_observers_for_only_touches_that_host() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let doomed = Host::new(&lane);
	let kept = Host::new(&lane);
	doomed.set_state(HostState::Active);
	kept.set_state(HostState::Active);

	let on_doomed = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("doomed", *value))
	});
	let on_kept = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(("kept", *value))
	});
	b.observe(&doomed, &on_doomed);
	b.observe(&kept, &on_kept);

	b.remove_observers_for(&doomed);
	b.set(1);
	v.expect([("kept", 1)]);
}

#[test]
fn a_clone_shares_the_registration_identity() {
	let lane = Lane::new();
	let v = Validator::new();

	let b = Broadcaster::new(&lane);
	let observer = Observer::new({
		let v = v.clone();
		move |value: &i32| v.push(*value)
	});
	b.observe_always(&observer);

	b.remove_observer(&observer.clone());
	b.set(1);
	v.expect([]);
}

#[test]
fn host_state_ordering() {
	assert!(HostState::Destroyed < HostState::Inactive);
	assert!(HostState::Inactive < HostState::Active);
	assert!(HostState::Active.is_active());
	assert!(!HostState::Inactive.is_active());
	assert!(HostState::Destroyed.is_destroyed());
}

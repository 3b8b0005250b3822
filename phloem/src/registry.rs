//! Insertion-ordered map with mutation-safe iteration.
//!
//! The broadcast loop iterates observers while the very callbacks it invokes
//! may add or remove observers. [`LinkedMap`] supports that with two cursor
//! kinds that are fixed up on removal: a snapshot-bounded cursor that never
//! sees additions, and a growing cursor that does. Cursors are registered
//! with the map and deregistered when their iterator is dropped, so
//! abandoned iterators don't accumulate bookkeeping.
//!
//! Everything here is lane-confined by its owners; no interior
//! synchronisation beyond [`RefCell`] is needed.

use core::num::NonZeroU64;
use std::{cell::RefCell, collections::BTreeMap};

type NodeId = NonZeroU64;

pub(crate) struct LinkedMap<K, V> {
	inner: RefCell<Inner<K, V>>,
}

struct Inner<K, V> {
	nodes: BTreeMap<NodeId, Node<K, V>>,
	by_key: BTreeMap<K, NodeId>,
	head: Option<NodeId>,
	tail: Option<NodeId>,
	cursors: BTreeMap<u64, Cursor>,
	next_node: u64,
	next_cursor: u64,
}

struct Node<K, V> {
	key: K,
	value: V,
	prev: Option<NodeId>,
	next: Option<NodeId>,
}

enum Cursor {
	/// Bounded by head/tail at creation; doesn't see later additions.
	Snapshot {
		next: Option<NodeId>,
		end: Option<NodeId>,
	},
	/// Starts before the original head but observes appends made while
	/// iterating.
	Growing {
		current: Option<NodeId>,
		before_start: bool,
	},
}

impl<K: Copy + Ord, V: Clone> LinkedMap<K, V> {
	pub(crate) fn new() -> Self {
		Self {
			inner: RefCell::new(Inner {
				nodes: BTreeMap::new(),
				by_key: BTreeMap::new(),
				head: None,
				tail: None,
				cursors: BTreeMap::new(),
				next_node: 0,
				next_cursor: 0,
			}),
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.inner.borrow().by_key.len()
	}

	pub(crate) fn get(&self, key: K) -> Option<V> {
		let inner = self.inner.borrow();
		let id = inner.by_key.get(&key)?;
		Some(inner.nodes[id].value.clone())
	}

	/// Inserts at the tail unless `key` is present. **Returns** the existing
	/// value in that case, leaving the map unchanged.
	pub(crate) fn put_if_absent(&self, key: K, value: V) -> Option<V> {
		let mut inner = self.inner.borrow_mut();
		if let Some(id) = inner.by_key.get(&key) {
			return Some(inner.nodes[id].value.clone());
		}
		inner.next_node += 1;
		let id = NodeId::new(inner.next_node).expect("unreachable");
		let prev = inner.tail;
		inner.nodes.insert(
			id,
			Node {
				key,
				value,
				prev,
				next: None,
			},
		);
		if let Some(prev) = prev {
			inner
				.nodes
				.get_mut(&prev)
				.expect("unreachable")
				.next = Some(id);
		} else {
			inner.head = Some(id);
		}
		inner.tail = Some(id);
		inner.by_key.insert(key, id);
		None
	}

	/// Removes `key`, fixing up all live cursors so in-progress iterations
	/// transparently skip the removed node.
	pub(crate) fn remove(&self, key: K) -> Option<V> {
		let mut inner = self.inner.borrow_mut();
		let id = inner.by_key.remove(&key)?;
		let (prev, next) = {
			let node = &inner.nodes[&id];
			(node.prev, node.next)
		};

		// Cursors are adjusted while the node is still linked.
		for cursor in inner.cursors.values_mut() {
			match cursor {
				Cursor::Snapshot {
					next: cursor_next,
					end,
				} => {
					if *end == Some(id) && *cursor_next == Some(id) {
						*end = None;
						*cursor_next = None;
					}
					if *end == Some(id) {
						*end = prev;
					}
					if *cursor_next == Some(id) {
						*cursor_next = next;
					}
				}
				Cursor::Growing {
					current,
					before_start,
				} => {
					if *current == Some(id) {
						*current = prev;
						*before_start = current.is_none();
					}
				}
			}
		}

		let node = inner.nodes.remove(&id).expect("unreachable");
		match node.prev {
			Some(prev) => {
				inner.nodes.get_mut(&prev).expect("unreachable").next = node.next;
			}
			None => inner.head = node.next,
		}
		match node.next {
			Some(next) => {
				inner.nodes.get_mut(&next).expect("unreachable").prev = node.prev;
			}
			None => inner.tail = node.prev,
		}
		Some(node.value)
	}

	/// Snapshot-bounded iteration: entries added after creation aren't
	/// yielded.
	pub(crate) fn iter(&self) -> SnapshotIter<'_, K, V> {
		let mut inner = self.inner.borrow_mut();
		inner.next_cursor += 1;
		let cursor = inner.next_cursor;
		let (head, tail) = (inner.head, inner.tail);
		inner
			.cursors
			.insert(cursor, Cursor::Snapshot { next: head, end: tail });
		SnapshotIter { map: self, cursor }
	}

	/// Growing iteration: entries appended mid-iteration *are* yielded. Used
	/// by the broadcast loop, where notifying one observer can legally
	/// register new ones.
	pub(crate) fn iter_with_additions(&self) -> GrowingIter<'_, K, V> {
		let mut inner = self.inner.borrow_mut();
		inner.next_cursor += 1;
		let cursor = inner.next_cursor;
		inner.cursors.insert(
			cursor,
			Cursor::Growing {
				current: None,
				before_start: true,
			},
		);
		GrowingIter { map: self, cursor }
	}

	#[cfg(test)]
	fn cursor_count(&self) -> usize {
		self.inner.borrow().cursors.len()
	}
}

pub(crate) struct SnapshotIter<'a, K: Copy + Ord, V: Clone> {
	map: &'a LinkedMap<K, V>,
	cursor: u64,
}

impl<K: Copy + Ord, V: Clone> Iterator for SnapshotIter<'_, K, V> {
	type Item = (K, V);

	fn next(&mut self) -> Option<Self::Item> {
		let mut inner = self.map.inner.borrow_mut();
		let (current, end) = match inner.cursors.get(&self.cursor) {
			Some(Cursor::Snapshot { next, end }) => (*next, *end),
			_ => unreachable!(),
		};
		let id = current?;
		let node = &inner.nodes[&id];
		let item = (node.key, node.value.clone());
		let advanced = if Some(id) == end { None } else { node.next };
		match inner.cursors.get_mut(&self.cursor) {
			Some(Cursor::Snapshot { next, .. }) => *next = advanced,
			_ => unreachable!(),
		}
		Some(item)
	}
}

impl<K: Copy + Ord, V: Clone> Drop for SnapshotIter<'_, K, V> {
	fn drop(&mut self) {
		self.map.inner.borrow_mut().cursors.remove(&self.cursor);
	}
}

pub(crate) struct GrowingIter<'a, K: Copy + Ord, V: Clone> {
	map: &'a LinkedMap<K, V>,
	cursor: u64,
}

impl<K: Copy + Ord, V: Clone> Iterator for GrowingIter<'_, K, V> {
	type Item = (K, V);

	fn next(&mut self) -> Option<Self::Item> {
		let mut inner = self.map.inner.borrow_mut();
		let (current, before_start) = match inner.cursors.get(&self.cursor) {
			Some(Cursor::Growing {
				current,
				before_start,
			}) => (*current, *before_start),
			_ => unreachable!(),
		};
		let advanced = if before_start {
			inner.head
		} else {
			current.and_then(|id| inner.nodes[&id].next)
		};
		match inner.cursors.get_mut(&self.cursor) {
			Some(Cursor::Growing {
				current,
				before_start,
			}) => {
				*current = advanced;
				*before_start = false;
			}
			_ => unreachable!(),
		}
		advanced.map(|id| {
			let node = &inner.nodes[&id];
			(node.key, node.value.clone())
		})
	}
}

impl<K: Copy + Ord, V: Clone> Drop for GrowingIter<'_, K, V> {
	fn drop(&mut self) {
		self.map.inner.borrow_mut().cursors.remove(&self.cursor);
	}
}

#[cfg(test)]
mod tests {
	use super::LinkedMap;

	fn seeded(keys: &[u32]) -> LinkedMap<u32, String> {
		let map = LinkedMap::new();
		for &k in keys {
			assert!(map.put_if_absent(k, format!("v{k}")).is_none());
		}
		map
	}

	#[test]
	fn insertion_order_and_put_if_absent() {
		let map = seeded(&[3, 1, 2]);
		assert_eq!(
			map.iter().map(|(k, _)| k).collect::<Vec<_>>(),
			vec![3, 1, 2]
		);
		assert_eq!(map.put_if_absent(1, "other".into()).as_deref(), Some("v1"));
		assert_eq!(map.len(), 3);
		assert_eq!(map.get(1).as_deref(), Some("v1"));
	}

	#[test]
	fn remove_is_idempotent() {
		let map = seeded(&[1, 2]);
		assert_eq!(map.remove(1).as_deref(), Some("v1"));
		assert_eq!(map.remove(1), None);
		assert_eq!(map.len(), 1);
	}

	#[test]
	fn snapshot_skips_node_removed_mid_iteration() {
		let map = seeded(&[1, 2, 3]);
		let mut iter = map.iter();
		assert_eq!(iter.next().map(|(k, _)| k), Some(1));
		map.remove(2);
		assert_eq!(iter.next().map(|(k, _)| k), Some(3));
		assert_eq!(iter.next(), None);
	}

	#[test]
	fn snapshot_retargets_removed_bound() {
		let map = seeded(&[1, 2, 3]);
		let mut iter = map.iter();
		map.remove(3);
		assert_eq!(iter.next().map(|(k, _)| k), Some(1));
		assert_eq!(iter.next().map(|(k, _)| k), Some(2));
		assert_eq!(iter.next(), None);
	}

	#[test]
	fn snapshot_ignores_additions() {
		let map = seeded(&[1]);
		let mut iter = map.iter();
		map.put_if_absent(2, "v2".into());
		assert_eq!(iter.next().map(|(k, _)| k), Some(1));
		assert_eq!(iter.next(), None);
	}

	#[test]
	fn growing_sees_additions() {
		let map = seeded(&[1]);
		let mut iter = map.iter_with_additions();
		assert_eq!(iter.next().map(|(k, _)| k), Some(1));
		map.put_if_absent(2, "v2".into());
		assert_eq!(iter.next().map(|(k, _)| k), Some(2));
		assert_eq!(iter.next(), None);
	}

	#[test]
	fn growing_steps_back_when_current_is_removed() {
		let map = seeded(&[1, 2, 3]);
		let mut iter = map.iter_with_additions();
		assert_eq!(iter.next().map(|(k, _)| k), Some(1));
		assert_eq!(iter.next().map(|(k, _)| k), Some(2));
		map.remove(2);
		assert_eq!(iter.next().map(|(k, _)| k), Some(3));
		assert_eq!(iter.next(), None);
	}

	#[test]
	fn growing_restarts_from_new_head_when_emptied_before_it() {
		let map = seeded(&[1, 2]);
		let mut iter = map.iter_with_additions();
		assert_eq!(iter.next().map(|(k, _)| k), Some(1));
		map.remove(1);
		// Stepped back before the (new) start; continues with the new head.
		assert_eq!(iter.next().map(|(k, _)| k), Some(2));
		map.remove(2);
		assert_eq!(iter.next(), None);
	}

	#[test]
	fn cursors_deregister_on_drop() {
		let map = seeded(&[1]);
		{
			let _a = map.iter();
			let _b = map.iter_with_additions();
			assert_eq!(map.cursor_count(), 2);
		}
		assert_eq!(map.cursor_count(), 0);
	}
}

use std::net::SocketAddr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use ringstore_util::error::Error;
use ringstore_util::key::Key;

/// A contiguous interval of the key space owned by one node.
/// The interval is closed: both `start` and `end` belong to it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct HashRange {
	pub start: Key,
	pub end: Key,
	pub node_addr: SocketAddr,
}

impl HashRange {
	pub fn new(start: Key, end: Key, node_addr: SocketAddr) -> Self {
		Self {
			start,
			end,
			node_addr,
		}
	}

	pub fn contains(&self, key: Key) -> bool {
		self.start <= key && key <= self.end
	}

	/// `end - start`, i.e. the range length minus one. Lengths themselves
	/// do not fit in a `Key` when the range is the whole ring, so ranges
	/// are always compared by their span.
	pub fn span(&self) -> Key {
		self.end.checked_sub(self.start).unwrap_or(Key::MIN)
	}

	pub fn to_str(&self) -> String {
		format!("{{{}-{}}}-{}", self.start, self.end, self.node_addr)
	}
}

#[derive(Serialize, Deserialize)]
struct TableDump {
	ranges: Vec<HashRange>,
	mod_index: u64,
}

struct Inner {
	ranges: Vec<HashRange>,
	mod_index: u64,
	blocked: bool,
}

impl Inner {
	fn find_idx(&self, key: Key) -> Option<usize> {
		let idx = self.ranges.partition_point(|r| r.start <= key);
		if idx == 0 {
			return None;
		}
		if self.ranges[idx - 1].contains(key) {
			Some(idx - 1)
		} else {
			None
		}
	}

	fn append(&mut self, range: HashRange) -> Result<bool, Error> {
		for probe in [range.start, range.end] {
			if let Some(idx) = self.find_idx(probe) {
				let existing = self.ranges[idx];
				if existing == range {
					// range is already in the table
					return Ok(false);
				}
				return Err(Error::RangeConflict(format!(
					"Cannot append range {}, it is crossed by existing {} range",
					range.to_str(),
					existing.to_str()
				)));
			}
		}
		let idx = self.ranges.partition_point(|r| r.start < range.start);
		self.ranges.insert(idx, range);
		self.mod_index += 1;
		Ok(true)
	}

	fn remove(&mut self, key: Key) -> Option<HashRange> {
		let idx = self.find_idx(key)?;
		let removed = self.ranges.remove(idx);
		self.mod_index += 1;
		Some(removed)
	}

	fn check_not_blocked(&self) -> Result<(), Error> {
		if self.blocked {
			return Err(Error::RangeConflict(
				"Ranges table is blocked for write, waiting for neighbour arbitration".into(),
			));
		}
		Ok(())
	}
}

/// Thread-safe sorted table of the ranges known to this node, with a
/// monotonic modification counter used by the gossip convergence protocol
pub struct RangesTable {
	inner: Mutex<Inner>,
}

impl Default for RangesTable {
	fn default() -> Self {
		Self::new()
	}
}

impl RangesTable {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Inner {
				ranges: Vec::new(),
				mod_index: 0,
				blocked: false,
			}),
		}
	}

	pub fn count(&self) -> usize {
		self.inner.lock().unwrap().ranges.len()
	}

	pub fn is_empty(&self) -> bool {
		self.count() == 0
	}

	pub fn mod_index(&self) -> u64 {
		self.inner.lock().unwrap().mod_index
	}

	pub fn is_blocked(&self) -> bool {
		self.inner.lock().unwrap().blocked
	}

	/// Suspend mutation while a superior node arbitrates a conflict
	pub fn block(&self) {
		self.inner.lock().unwrap().blocked = true;
	}

	pub fn unblock(&self) {
		self.inner.lock().unwrap().blocked = false;
	}

	/// Insert a new range. Idempotent when the identical tuple is already
	/// present; fails with `RangeConflict` when either endpoint falls inside
	/// a different existing range.
	pub fn append(&self, start: Key, end: Key, node_addr: SocketAddr) -> Result<(), Error> {
		let mut inner = self.inner.lock().unwrap();
		inner.check_not_blocked()?;
		inner.append(HashRange::new(start, end, node_addr))?;
		Ok(())
	}

	/// Remove the range containing `key`; no-op if absent
	pub fn remove(&self, key: Key) -> Result<Option<HashRange>, Error> {
		let mut inner = self.inner.lock().unwrap();
		inner.check_not_blocked()?;
		Ok(inner.remove(key))
	}

	pub fn find(&self, key: Key) -> Option<HashRange> {
		let inner = self.inner.lock().unwrap();
		inner.find_idx(key).map(|idx| inner.ranges[idx])
	}

	/// The range immediately after the one containing `key`
	pub fn find_next(&self, key: Key) -> Option<HashRange> {
		let inner = self.inner.lock().unwrap();
		let idx = inner.find_idx(key)?;
		inner.ranges.get(idx + 1).copied()
	}

	pub fn get_first(&self) -> Option<HashRange> {
		self.inner.lock().unwrap().ranges.first().copied()
	}

	pub fn get_end(&self) -> Option<HashRange> {
		self.inner.lock().unwrap().ranges.last().copied()
	}

	pub fn snapshot(&self) -> Vec<HashRange> {
		self.inner.lock().unwrap().ranges.clone()
	}

	/// Atomically remove `rm_list` and insert `append_list`.
	/// The removals must form a contiguous cover of the area they describe
	/// and each must exactly match an existing entry; the appends may not
	/// intersect anything outside the removed span. On any validation
	/// failure the table is left unchanged.
	pub fn apply_changes(
		&self,
		rm_list: &[HashRange],
		append_list: &[HashRange],
	) -> Result<(), Error> {
		let mut inner = self.inner.lock().unwrap();
		inner.check_not_blocked()?;

		let mut rm_sorted = rm_list.to_vec();
		rm_sorted.sort_by_key(|r| r.start);
		for pair in rm_sorted.windows(2) {
			if pair[0].end.succ() != Some(pair[1].start) {
				return Err(Error::RangeConflict(format!(
					"Removed ranges are not adjacent: end={}, next start={}",
					pair[0].end, pair[1].start
				)));
			}
		}

		// Work on a scratch table and commit only if everything applies
		let mut scratch = Inner {
			ranges: inner.ranges.clone(),
			mod_index: inner.mod_index,
			blocked: false,
		};

		for rm in rm_sorted.iter() {
			match scratch.find_idx(rm.start) {
				Some(idx)
					if scratch.ranges[idx].start == rm.start
						&& scratch.ranges[idx].end == rm.end =>
				{
					let _ = scratch.remove(rm.start);
				}
				_ => {
					return Err(Error::RangeConflict(format!(
						"Removed range {} is not found in ranges table",
						rm.to_str()
					)));
				}
			}
		}

		for ap in append_list.iter() {
			scratch.append(*ap).map_err(|_| {
				Error::RangeConflict(format!(
					"Appended range {} is intersected by an existing range",
					ap.to_str()
				))
			})?;
		}

		inner.ranges = scratch.ranges;
		inner.mod_index = scratch.mod_index;
		Ok(())
	}

	/// Serialize the whole table for a full-table transfer
	pub fn dump(&self) -> Result<Vec<u8>, Error> {
		let inner = self.inner.lock().unwrap();
		let dump = TableDump {
			ranges: inner.ranges.clone(),
			mod_index: inner.mod_index,
		};
		Ok(rmp_serde::encode::to_vec_named(&dump)?)
	}

	/// Replace the table content with a received dump.
	/// Returns the number of ranges known before the load.
	pub fn load(&self, dump: &[u8]) -> Result<usize, Error> {
		let parsed: TableDump = rmp_serde::decode::from_read_ref(dump)?;
		let mut inner = self.inner.lock().unwrap();

		let old_ranges = std::mem::take(&mut inner.ranges);
		if old_ranges.len() > 1 {
			let mut log_s = String::from("OLD(-)/NEW(+) ranges in table:\n");
			for r in parsed.ranges.iter() {
				if !old_ranges.contains(r) {
					log_s += &format!("+ {}\n", r.to_str());
				}
			}
			for r in old_ranges.iter() {
				if !parsed.ranges.contains(r) {
					log_s += &format!("- {}\n", r.to_str());
				}
			}
			info!("{}", log_s);
		}

		inner.ranges = parsed.ranges;
		inner.mod_index = parsed.mod_index;
		inner.blocked = false;
		Ok(old_ranges.len())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(port: u16) -> SocketAddr {
		format!("127.0.0.1:{}", port).parse().unwrap()
	}

	fn k(v: u64) -> Key {
		Key::from_u64(v)
	}

	#[test]
	fn test_find_covers_whole_range() {
		let table = RangesTable::new();
		table.append(k(100), k(199), addr(1986)).unwrap();
		table.append(k(200), k(299), addr(1987)).unwrap();

		for v in [100, 150, 199] {
			let r = table.find(k(v)).unwrap();
			assert_eq!((r.start, r.end), (k(100), k(199)));
		}
		assert_eq!(table.find(k(99)), None);
		assert_eq!(table.find(k(300)), None);
		assert_eq!(table.find(k(250)).unwrap().node_addr, addr(1987));
	}

	#[test]
	fn test_append_conflicts() {
		let table = RangesTable::new();
		table.append(k(100), k(199), addr(1986)).unwrap();

		// identical append is idempotent
		let before = table.mod_index();
		table.append(k(100), k(199), addr(1986)).unwrap();
		assert_eq!(table.mod_index(), before);

		assert!(table.append(k(150), k(250), addr(1987)).is_err());
		assert!(table.append(k(50), k(100), addr(1987)).is_err());
		assert_eq!(table.count(), 1);
	}

	#[test]
	fn test_append_remove_append_fixed_point() {
		let table = RangesTable::new();
		table.append(k(0), k(99), addr(1986)).unwrap();
		let snap = table.snapshot();
		table.remove(k(0)).unwrap();
		table.append(k(0), k(99), addr(1986)).unwrap();
		assert_eq!(table.snapshot(), snap);
	}

	#[test]
	fn test_remove_absent_is_noop() {
		let table = RangesTable::new();
		table.append(k(0), k(99), addr(1986)).unwrap();
		assert!(table.remove(k(500)).unwrap().is_none());
		assert_eq!(table.count(), 1);
	}

	#[test]
	fn test_find_next_and_ends() {
		let table = RangesTable::new();
		table.append(k(200), k(299), addr(1987)).unwrap();
		table.append(k(0), k(99), addr(1986)).unwrap();

		assert_eq!(table.get_first().unwrap().start, k(0));
		assert_eq!(table.get_end().unwrap().end, k(299));
		assert_eq!(table.find_next(k(50)).unwrap().start, k(200));
		assert_eq!(table.find_next(k(250)), None);
	}

	#[test]
	fn test_apply_changes_atomic() {
		let table = RangesTable::new();
		table.append(k(0), k(99), addr(1986)).unwrap();
		table.append(k(100), k(199), addr(1987)).unwrap();
		let before = table.snapshot();
		let mod_before = table.mod_index();

		// non-adjacent removals are rejected
		let err = table.apply_changes(
			&[
				HashRange::new(k(0), k(99), addr(1986)),
				HashRange::new(k(150), k(199), addr(1987)),
			],
			&[],
		);
		assert!(err.is_err());
		assert_eq!(table.snapshot(), before);

		// removal that does not match both endpoints is rejected
		let err = table.apply_changes(&[HashRange::new(k(0), k(50), addr(1986))], &[]);
		assert!(err.is_err());
		assert_eq!(table.snapshot(), before);

		// append intersecting a surviving entry is rejected, and the
		// removals already applied to the scratch table are rolled back
		let err = table.apply_changes(
			&[HashRange::new(k(0), k(99), addr(1986))],
			&[HashRange::new(k(50), k(199), addr(1988))],
		);
		assert!(err.is_err());
		assert_eq!(table.snapshot(), before);
		assert_eq!(table.mod_index(), mod_before);
	}

	#[test]
	fn test_apply_changes_split() {
		let table = RangesTable::new();
		table.append(Key::MIN, Key::MAX, addr(1986)).unwrap();

		let mid = Key::MAX.half();
		table
			.apply_changes(
				&[HashRange::new(Key::MIN, Key::MAX, addr(1986))],
				&[
					HashRange::new(Key::MIN, mid, addr(1986)),
					HashRange::new(mid.succ().unwrap(), Key::MAX, addr(1987)),
				],
			)
			.unwrap();

		assert_eq!(table.count(), 2);
		assert_eq!(table.find(Key::MIN).unwrap().node_addr, addr(1986));
		assert_eq!(table.find(Key::MAX).unwrap().node_addr, addr(1987));
	}

	#[test]
	fn test_blocked_table_rejects_mutation() {
		let table = RangesTable::new();
		table.append(k(0), k(99), addr(1986)).unwrap();
		table.block();
		assert!(table.append(k(100), k(199), addr(1987)).is_err());
		assert!(table.remove(k(0)).is_err());
		table.unblock();
		table.append(k(100), k(199), addr(1987)).unwrap();
	}

	#[test]
	fn test_dump_load_round_trip() {
		let table = RangesTable::new();
		table.append(k(0), k(99), addr(1986)).unwrap();
		table.append(k(100), k(199), addr(1987)).unwrap();

		let dump = table.dump().unwrap();
		let other = RangesTable::new();
		other.block();
		let old_count = other.load(&dump).unwrap();
		assert_eq!(old_count, 0);
		assert_eq!(other.snapshot(), table.snapshot());
		assert_eq!(other.mod_index(), table.mod_index());
		// loading a dump clears the arbitration block
		assert!(!other.is_blocked());
	}
}

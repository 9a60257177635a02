use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use ringstore_util::error::Error;
use ringstore_util::key::Key;

use crate::data_block::DataBlock;
use crate::locks::BlockLocks;

/// Storage bucket a data block belongs to, selecting its subdirectory
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
pub enum ContentClass {
	/// Master data block
	#[serde(rename = "mdb")]
	Master,
	/// Replica data block
	#[serde(rename = "rdb")]
	Replica,
	/// Master user-metadata store
	#[serde(rename = "mmd")]
	MdMaster,
	/// Replica user-metadata store
	#[serde(rename = "rmd")]
	MdReplica,
	/// Staging area for atomic creation
	#[serde(rename = "tmp")]
	Tmp,
}

impl ContentClass {
	/// Classes whose entries are ring keys (everything but the staging area)
	pub const KEYED: [ContentClass; 4] = [
		ContentClass::Master,
		ContentClass::Replica,
		ContentClass::MdMaster,
		ContentClass::MdReplica,
	];

	pub const ALL: [ContentClass; 5] = [
		ContentClass::Master,
		ContentClass::Replica,
		ContentClass::MdMaster,
		ContentClass::MdReplica,
		ContentClass::Tmp,
	];

	pub fn dir_name(self) -> &'static str {
		match self {
			ContentClass::Master => "mdb",
			ContentClass::Replica => "rdb",
			ContentClass::MdMaster => "mmd",
			ContentClass::MdReplica => "rmd",
			ContentClass::Tmp => "tmp",
		}
	}

	pub fn is_metadata(self) -> bool {
		matches!(self, ContentClass::MdMaster | ContentClass::MdReplica)
	}
}

impl std::fmt::Display for ContentClass {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.dir_name())
	}
}

const RANGE_INFO_FILE: &str = "range_info";

#[derive(Serialize, Deserialize, Default)]
struct RangeInfoFile {
	#[serde(skip_serializing_if = "Option::is_none")]
	range_start: Option<serde_json::Number>,
	#[serde(skip_serializing_if = "Option::is_none")]
	range_end: Option<serde_json::Number>,
	#[serde(skip_serializing_if = "Option::is_none")]
	old_range_start: Option<serde_json::Number>,
	#[serde(skip_serializing_if = "Option::is_none")]
	old_range_end: Option<serde_json::Number>,
}

fn dec_number(key: Key) -> serde_json::Number {
	serde_json::from_str(&key.to_decimal()).expect("decimal form is a valid JSON number")
}

fn number_key(n: &Option<serde_json::Number>, default: Key) -> Key {
	match n {
		Some(n) => Key::from_decimal(&n.to_string()).unwrap_or(default),
		None => default,
	}
}

/// The on-disk storage of a node's key range: one subdirectory per content
/// class, a `range_info` file remembering the owned interval, and a
/// free-space backpressure flag.
pub struct FsMappedRange {
	start: Key,
	end: Key,
	root: PathBuf,
	locks: Arc<BlockLocks>,
	subranges: Mutex<Option<(Arc<FsMappedRange>, Arc<FsMappedRange>)>>,
	no_free_space: AtomicBool,
	free_for_unlock: Mutex<f64>,
}

impl FsMappedRange {
	pub fn new(start: Key, end: Key, root: &Path, locks: Arc<BlockLocks>) -> Result<Self, Error> {
		if !root.exists() {
			return Err(Error::Message(format!(
				"Path {} does not exist",
				root.display()
			)));
		}
		for class in ContentClass::ALL {
			let dir = root.join(class.dir_name());
			if !dir.exists() {
				fs::create_dir(&dir).map_err(|e| {
					Error::Message(format!(
						"Unable to create directory {}: {}",
						dir.display(),
						e
					))
				})?;
			}
		}
		Ok(Self {
			start,
			end,
			root: root.to_path_buf(),
			locks,
			subranges: Mutex::new(None),
			no_free_space: AtomicBool::new(false),
			free_for_unlock: Mutex::new(0.0),
		})
	}

	/// Recover the previously saved range scope from `range_info`,
	/// defaulting to the whole key space
	pub fn discover(root: &Path, locks: Arc<BlockLocks>) -> Result<Self, Error> {
		let (start, end) = match Self::read_range_info(root) {
			Ok(info) => (
				number_key(&info.range_start, Key::MIN),
				number_key(&info.range_end, Key::MAX),
			),
			Err(e) => {
				error!("Invalid range_info file: {}", e);
				(Key::MIN, Key::MAX)
			}
		};
		Self::new(start, end, root, locks)
	}

	fn read_range_info(root: &Path) -> Result<RangeInfoFile, Error> {
		let info_path = root.join(RANGE_INFO_FILE);
		if !info_path.exists() {
			return Ok(RangeInfoFile::default());
		}
		let raw = fs::read(&info_path)?;
		Ok(serde_json::from_slice(&raw)?)
	}

	/// Rebuild the previous ownership saved as `old_range_*`
	pub fn last_range(&self) -> Result<Self, Error> {
		let info = Self::read_range_info(&self.root).unwrap_or_default();
		Self::new(
			number_key(&info.old_range_start, Key::MIN),
			number_key(&info.old_range_end, Key::MAX),
			&self.root,
			self.locks.clone(),
		)
	}

	/// Persist the current scope to `range_info`, demoting the previously
	/// saved scope to `old_range_*`
	pub fn save_range(&self) -> Result<(), Error> {
		let prev = Self::read_range_info(&self.root).unwrap_or_default();
		let prev_start = number_key(&prev.range_start, Key::MIN);
		let prev_end = number_key(&prev.range_end, Key::MAX);
		if prev_start == self.start && prev_end == self.end {
			return Ok(());
		}

		let info = RangeInfoFile {
			range_start: Some(dec_number(self.start)),
			range_end: Some(dec_number(self.end)),
			old_range_start: Some(dec_number(prev_start)),
			old_range_end: Some(dec_number(prev_end)),
		};
		let mut db = DataBlock::new(self.root.join(RANGE_INFO_FILE), self.locks.clone());
		db.write(&serde_json::to_vec(&info)?, Some(0), true)?;
		Ok(())
	}

	pub fn start(&self) -> Key {
		self.start
	}

	pub fn end(&self) -> Key {
		self.end
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn contains(&self, key: Key) -> bool {
		self.start <= key && key <= self.end
	}

	pub fn is_max_range(&self) -> bool {
		self.start == Key::MIN && self.end == Key::MAX
	}

	/// `end - start`; ranges are compared by span since the length of the
	/// whole ring does not fit in 160 bits
	pub fn span(&self) -> Key {
		self.end.checked_sub(self.start).unwrap_or(Key::MIN)
	}

	/// Split off a subrange anchored at one end of this range.
	/// The children share the backing directories; the split is purely
	/// logical until the handoff completes. Returns `(subrange, remainder)`;
	/// a concurrent split fails.
	pub fn split_range(
		self: &Arc<Self>,
		sub_start: Key,
		sub_end: Key,
	) -> Result<(Arc<FsMappedRange>, Arc<FsMappedRange>), Error> {
		let (first_end, second_start, sub_is_first) = if sub_start == self.start {
			(
				sub_end,
				sub_end.succ().ok_or_else(|| bad_subrange(self, sub_start, sub_end))?,
				true,
			)
		} else if sub_end == self.end {
			(
				sub_start.pred().ok_or_else(|| bad_subrange(self, sub_start, sub_end))?,
				sub_start,
				false,
			)
		} else {
			return Err(bad_subrange(self, sub_start, sub_end));
		};

		let first = Arc::new(Self::new(
			self.start,
			first_end,
			&self.root,
			self.locks.clone(),
		)?);
		let second = Arc::new(Self::new(
			second_start,
			self.end,
			&self.root,
			self.locks.clone(),
		)?);
		let pair = if sub_is_first {
			(first, second)
		} else {
			(second, first)
		};

		let mut subranges = self.subranges.lock().unwrap();
		if subranges.is_some() {
			return Err(Error::Message("Range is already split".into()));
		}
		*subranges = Some(pair.clone());
		Ok(pair)
	}

	/// Discard the children installed by a previous `split_range`
	pub fn join_subranges(&self) {
		*self.subranges.lock().unwrap() = None;
	}

	pub fn subranges(&self) -> Option<(Arc<FsMappedRange>, Arc<FsMappedRange>)> {
		self.subranges.lock().unwrap().clone()
	}

	/// A new range covering this one plus a left- or right-abutting gap
	pub fn extend(&self, ext_start: Key, ext_end: Key) -> Result<Self, Error> {
		if ext_start > ext_end {
			return Err(bad_extend(self, ext_start, ext_end));
		}

		let (start, end) = if ext_end.succ() == Some(self.start) {
			(ext_start, self.end)
		} else if self.end.succ() == Some(ext_start) {
			(self.start, ext_end)
		} else {
			return Err(bad_extend(self, ext_start, ext_end));
		};

		let range = Self::new(start, end, &self.root, self.locks.clone())?;
		range.save_range()?;
		Ok(range)
	}

	/// Path to the block of `key` under `class`. Writes fail with
	/// `NoFreeSpace` while the range is write-blocked; the block clears
	/// itself once the free percentage rises above the unlock threshold.
	pub fn db_path(&self, key: Key, class: ContentClass, for_write: bool) -> Result<PathBuf, Error> {
		if for_write && self.no_free_space.load(Ordering::SeqCst) {
			let unlock_at = *self.free_for_unlock.lock().unwrap();
			if self.free_size_percents()? > unlock_at {
				self.no_free_space.store(false, Ordering::SeqCst);
				info!("Range is unlocked for write");
			} else {
				return Err(Error::NoFreeSpace(
					"No free space for saving data block".into(),
				));
			}
		}
		Ok(self.class_dir(class).join(key.to_hex()))
	}

	fn class_dir(&self, class: ContentClass) -> PathBuf {
		self.root.join(class.dir_name())
	}

	/// Path to a uniquely-named staging file for `key`
	pub fn tmp_path(&self, key: Key) -> PathBuf {
		let suffix = hex::encode(rand::random::<[u8; 8]>());
		self.class_dir(ContentClass::Tmp)
			.join(format!("{}{}", key.to_hex(), suffix))
	}

	/// Refuse writes until the free percentage exceeds `free_for_unlock`
	pub fn block_for_write(&self, free_for_unlock: f64) {
		if self.no_free_space.load(Ordering::SeqCst) {
			return;
		}
		*self.free_for_unlock.lock().unwrap() = free_for_unlock;
		self.no_free_space.store(true, Ordering::SeqCst);
	}

	/// Unlink the block of `key` under `class`; idempotent
	pub fn remove_db(&self, key: Key, class: ContentClass) -> Result<(), Error> {
		let path = self.class_dir(class).join(key.to_hex());
		match if path.is_dir() {
			fs::remove_dir_all(&path)
		} else {
			fs::remove_file(&path)
		} {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Enumerate the stored blocks of the given classes (all keyed classes
	/// when `classes` is empty). With `foreign_only`, yield only blocks NOT
	/// in `[start, end]`; with `all_data`, skip the range filter entirely.
	/// Files whose name is not a well-formed 40-hex key are skipped with a
	/// warning.
	pub fn iterate(
		&self,
		classes: &[ContentClass],
		foreign_only: bool,
		all_data: bool,
	) -> Result<Vec<(Key, ContentClass, PathBuf)>, Error> {
		let classes: &[ContentClass] = if classes.is_empty() {
			&ContentClass::KEYED
		} else {
			classes
		};

		let mut entries = Vec::new();
		for &class in classes {
			if class == ContentClass::Tmp {
				return Err(Error::Message(
					"The staging area cannot be iterated by key".into(),
				));
			}
			let dir = self.class_dir(class);
			for dirent in fs::read_dir(&dir)? {
				let dirent = dirent?;
				let name = match dirent.file_name().into_string() {
					Ok(name) => name,
					Err(_) => continue,
				};
				let key = match Key::from_hex(&name) {
					Ok(key) => key,
					Err(_) => {
						warn!("Invalid data block name \"{}\"", name);
						continue;
					}
				};
				if !all_data {
					let in_range = self.contains(key);
					if foreign_only == in_range {
						continue;
					}
				}
				entries.push((key, class, dirent.path()));
			}
		}
		Ok(entries)
	}

	pub fn free_size(&self) -> Result<u64, Error> {
		Ok(fs2::available_space(&self.root)?)
	}

	pub fn total_space(&self) -> Result<u64, Error> {
		Ok(fs2::total_space(&self.root)?)
	}

	pub fn free_size_percents(&self) -> Result<f64, Error> {
		let total = fs2::total_space(&self.root)?;
		let available = fs2::available_space(&self.root)?;
		Ok(available as f64 * 100.0 / total as f64)
	}

	/// Used percentage of the filesystem after hypothetically adding
	/// `add_size` bytes
	pub fn estimated_data_percents(&self, add_size: u64) -> Result<f64, Error> {
		let total = fs2::total_space(&self.root)?;
		let free = fs2::free_space(&self.root)?;
		let used = total - free;
		Ok((used + add_size) as f64 * 100.0 / total as f64)
	}

	/// Total size of the blocks stored under the given classes,
	/// restricted to this range unless `all_data`
	pub fn data_size(&self, classes: &[ContentClass], all_data: bool) -> Result<u64, Error> {
		let mut size = 0;
		for (_, _, path) in self.iterate(classes, false, all_data)? {
			size += entry_size(&path)?;
		}
		Ok(size)
	}
}

fn bad_subrange(range: &FsMappedRange, start: Key, end: Key) -> Error {
	Error::Message(format!(
		"Bad subrange [{}-{}] for range [{}-{}]",
		start, end, range.start, range.end
	))
}

fn bad_extend(range: &FsMappedRange, start: Key, end: Key) -> Error {
	Error::Message(format!(
		"Bad range for extend [{}-{}] of [{}-{}]",
		start, end, range.start, range.end
	))
}

fn entry_size(path: &Path) -> Result<u64, Error> {
	let meta = match fs::symlink_metadata(path) {
		Ok(meta) => meta,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
		Err(e) => return Err(e.into()),
	};
	if meta.is_dir() {
		let mut size = 0;
		for dirent in fs::read_dir(path)? {
			size += entry_size(&dirent?.path())?;
		}
		Ok(size)
	} else {
		Ok(file_size_on_disk(&meta))
	}
}

#[cfg(unix)]
fn file_size_on_disk(meta: &fs::Metadata) -> u64 {
	use std::os::unix::fs::MetadataExt;
	let rest = meta.len() % meta.blksize();
	if rest != 0 {
		meta.len() + meta.blksize() - rest
	} else {
		meta.len()
	}
}

#[cfg(not(unix))]
fn file_size_on_disk(meta: &fs::Metadata) -> u64 {
	meta.len()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn new_range(start: u64, end: u64) -> (mktemp::Temp, Arc<FsMappedRange>) {
		let dir = mktemp::Temp::new_dir().unwrap();
		let range = FsMappedRange::new(
			Key::from_u64(start),
			Key::from_u64(end),
			dir.as_path(),
			BlockLocks::new(),
		)
		.unwrap();
		(dir, Arc::new(range))
	}

	#[test]
	fn test_class_dirs_created() {
		let (dir, _range) = new_range(0, 1000);
		for class in ["mdb", "rdb", "mmd", "rmd", "tmp"] {
			assert!(dir.as_path().join(class).is_dir());
		}
	}

	#[test]
	fn test_discover_defaults_to_max_range() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let range = FsMappedRange::discover(dir.as_path(), BlockLocks::new()).unwrap();
		assert!(range.is_max_range());
	}

	#[test]
	fn test_save_range_and_recover() {
		let (dir, range) = new_range(100, 200);
		range.save_range().unwrap();

		let reread = FsMappedRange::discover(dir.as_path(), BlockLocks::new()).unwrap();
		assert_eq!(reread.start(), Key::from_u64(100));
		assert_eq!(reread.end(), Key::from_u64(200));

		// saving a different scope demotes the old one
		let extended = FsMappedRange::new(
			Key::from_u64(100),
			Key::from_u64(500),
			dir.as_path(),
			BlockLocks::new(),
		)
		.unwrap();
		extended.save_range().unwrap();

		let last = extended.last_range().unwrap();
		assert_eq!(last.start(), Key::from_u64(100));
		assert_eq!(last.end(), Key::from_u64(200));
	}

	#[test]
	fn test_split_range_anchored() {
		let (_dir, range) = new_range(0, 999);

		// left-anchored
		let (sub, rest) = range
			.split_range(Key::from_u64(0), Key::from_u64(499))
			.unwrap();
		assert_eq!((sub.start(), sub.end()), (Key::from_u64(0), Key::from_u64(499)));
		assert_eq!(
			(rest.start(), rest.end()),
			(Key::from_u64(500), Key::from_u64(999))
		);

		// concurrent split fails
		assert!(range
			.split_range(Key::from_u64(500), Key::from_u64(999))
			.is_err());
		range.join_subranges();
		assert!(range.subranges().is_none());

		// right-anchored
		let (sub, rest) = range
			.split_range(Key::from_u64(700), Key::from_u64(999))
			.unwrap();
		assert_eq!(sub.start(), Key::from_u64(700));
		assert_eq!(rest.end(), Key::from_u64(699));

		// unanchored subrange is rejected
		range.join_subranges();
		assert!(range
			.split_range(Key::from_u64(10), Key::from_u64(20))
			.is_err());
	}

	#[test]
	fn test_extend_abutting_only() {
		let (_dir, range) = new_range(500, 999);

		let left = range.extend(Key::from_u64(0), Key::from_u64(499)).unwrap();
		assert_eq!((left.start(), left.end()), (Key::MIN, Key::from_u64(999)));

		let right = range.extend(Key::from_u64(1000), Key::from_u64(2000)).unwrap();
		assert_eq!(right.end(), Key::from_u64(2000));

		// a gap that does not touch the range is rejected
		assert!(range.extend(Key::from_u64(0), Key::from_u64(400)).is_err());
		assert!(range.extend(Key::from_u64(1500), Key::from_u64(2000)).is_err());
	}

	#[test]
	fn test_iterate_filters_by_range() {
		let (_dir, range) = new_range(0, 1000);

		for (v, class) in [
			(10u64, ContentClass::Master),
			(900, ContentClass::Replica),
			(5000, ContentClass::Master),
		] {
			let path = range.db_path(Key::from_u64(v), class, false).unwrap();
			fs::write(path, b"x").unwrap();
		}
		// a file with a malformed name is skipped
		fs::write(range.root().join("mdb/not-a-key"), b"x").unwrap();

		let local = range.iterate(&[], false, false).unwrap();
		assert_eq!(local.len(), 2);
		let foreign = range.iterate(&[], true, false).unwrap();
		assert_eq!(foreign.len(), 1);
		assert_eq!(foreign[0].0, Key::from_u64(5000));
		let all = range.iterate(&[ContentClass::Master], false, true).unwrap();
		assert_eq!(all.len(), 2);
	}

	#[test]
	fn test_block_for_write_backpressure() {
		let (_dir, range) = new_range(0, 1000);
		let key = Key::from_u64(1);

		range.db_path(key, ContentClass::Master, true).unwrap();

		// an unreachable unlock threshold keeps the range blocked
		range.block_for_write(101.0);
		assert!(matches!(
			range.db_path(key, ContentClass::Master, true),
			Err(Error::NoFreeSpace(_))
		));
		// reads are not affected
		range.db_path(key, ContentClass::Master, false).unwrap();

		// blocking again does not lower the unlock threshold
		range.block_for_write(-1.0);
		assert!(range.db_path(key, ContentClass::Master, true).is_err());
	}

	#[test]
	fn test_block_for_write_self_clears() {
		let (_dir, range) = new_range(0, 1000);
		let key = Key::from_u64(1);
		// threshold of -1% is always exceeded, so the flag clears on the
		// next write attempt
		range.block_for_write(-1.0);
		range.db_path(key, ContentClass::Master, true).unwrap();
		range.db_path(key, ContentClass::Master, true).unwrap();
	}

	#[test]
	fn test_remove_db_idempotent() {
		let (_dir, range) = new_range(0, 1000);
		let key = Key::from_u64(77);
		let path = range.db_path(key, ContentClass::Replica, false).unwrap();
		fs::write(&path, b"x").unwrap();

		range.remove_db(key, ContentClass::Replica).unwrap();
		assert!(!path.exists());
		range.remove_db(key, ContentClass::Replica).unwrap();
	}

	#[test]
	fn test_data_size_counts_in_range_blocks() {
		let (_dir, range) = new_range(0, 1000);
		let in_key = Key::from_u64(5);
		let out_key = Key::from_u64(5000);
		fs::write(
			range.db_path(in_key, ContentClass::Master, false).unwrap(),
			vec![0u8; 100],
		)
		.unwrap();
		fs::write(
			range.db_path(out_key, ContentClass::Master, false).unwrap(),
			vec![0u8; 100],
		)
		.unwrap();

		let in_range = range.data_size(&[ContentClass::Master], false).unwrap();
		let all = range.data_size(&[ContentClass::Master], true).unwrap();
		assert!(in_range > 0);
		assert_eq!(all, in_range * 2);
	}
}

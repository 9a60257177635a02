use std::fs;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use sha1::{Digest, Sha1};

use ringstore_util::error::Error;
use ringstore_util::key::{Key, KEY_LEN};

use crate::records::*;

/// Name of the advisory lock file serializing writers of one store
pub const STORE_LOCK_FILE: &str = "dht.lock";
/// Name of the file holding the packed data block header of the store,
/// used by repair
pub const STORE_INFO_FILE: &str = "dht_info";

const KV_SUBDIR: &str = "kv";

fn db_err(e: sled::Error) -> Error {
	Error::Message(format!("Metadata store error: {}", e))
}

// Same polynomial as zlib's crc32, which historically hashed these paths
fn path_crc(path: &str) -> u32 {
	Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(path.as_bytes())
}

fn basename(path: &str) -> &str {
	match path.rfind('/') {
		Some(i) => &path[i + 1..],
		None => path,
	}
}

fn split_path(path: &str) -> (&str, &str) {
	match path.rfind('/') {
		Some(i) => (&path[..i], &path[i + 1..]),
		None => ("", path),
	}
}

/// An embedded ordered KV store holding one user's path tree and quota
/// accounting. A single writer at a time is admitted per store; the
/// exclusion is enforced by the cache through the store's lock file.
pub struct UserMetadata {
	dir: PathBuf,
	db: sled::Db,
}

impl UserMetadata {
	/// Open the store under `dir`, creating it lazily on first use
	pub fn open(dir: &Path) -> Result<Self, Error> {
		if !dir.exists() {
			fs::create_dir_all(dir)?;
		}
		let db = sled::Config::new()
			.path(dir.join(KV_SUBDIR))
			.open()
			.map_err(db_err)?;
		Ok(Self {
			dir: dir.to_path_buf(),
			db,
		})
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	pub fn flush(&self) -> Result<(), Error> {
		self.db.flush().map_err(db_err)?;
		Ok(())
	}

	// ---- user info and quota ----

	pub fn get_user_info(&self) -> Result<UserInfo, Error> {
		match self.db.get(MdKey::ROOT.pack()).map_err(db_err)? {
			None => Ok(UserInfo::default()),
			Some(raw) => UserInfo::unpack(&raw),
		}
	}

	pub fn update_user_info(&self, user_info: &UserInfo) -> Result<(), Error> {
		self.db
			.insert(MdKey::ROOT.pack(), user_info.pack())
			.map_err(db_err)?;
		self.flush()
	}

	pub fn add_user_storage_size(&self, delta: i64) -> Result<(), Error> {
		let mut user_info = self.get_user_info()?;
		user_info.storage_size = (user_info.storage_size as i64 + delta).max(0) as u64;
		self.update_user_info(&user_info)
	}

	/// Stable hash of the quota record, compared between master and
	/// replicas by the repair pass
	pub fn checksum(&self) -> Result<Key, Error> {
		let mut hasher = Sha1::new();
		hasher.update(self.get_user_info()?.pack());
		let mut digest = [0u8; KEY_LEN];
		digest.copy_from_slice(&hasher.finalize());
		Ok(Key::from_bytes(digest))
	}

	// ---- tree lookup ----

	fn get_item(
		&self,
		parent: MdKey,
		abs_path: &str,
		level: u16,
	) -> Result<Option<(MdKey, MdItemValue)>, Error> {
		let wanted = basename(abs_path);
		for index in 0..u16::MAX {
			let key = MdKey::new(parent.make_parent(), path_crc(abs_path), level, index);
			match self.db.get(key.pack()).map_err(db_err)? {
				None => return Ok(None),
				Some(raw) => {
					let val = MdItemValue::unpack(&raw)?;
					if val.name == wanted {
						return Ok(Some((key, val)));
					}
				}
			}
		}
		Err(Error::Message(format!(
			"Hash collision chain exhausted for \"{}\"",
			abs_path
		)))
	}

	fn mk_item(
		&self,
		parent: MdKey,
		abs_path: &str,
		level: u16,
		value: &MdItemValue,
	) -> Result<MdKey, Error> {
		for index in 0..u16::MAX {
			let key = MdKey::new(parent.make_parent(), path_crc(abs_path), level, index);
			match self.db.get(key.pack()).map_err(db_err)? {
				None => {
					self.db.insert(key.pack(), value.pack()).map_err(db_err)?;
					return Ok(key);
				}
				Some(raw) => {
					let val = MdItemValue::unpack(&raw)?;
					if val.name == basename(abs_path) {
						return Err(Error::AlreadyExists(format!(
							"Path {} already exists",
							abs_path
						)));
					}
				}
			}
		}
		Err(Error::Message(format!(
			"Hash collision chain exhausted for \"{}\"",
			abs_path
		)))
	}

	fn find(&self, path: &str) -> Result<Option<(MdKey, u16, MdItemValue)>, Error> {
		let mut cur_key = MdKey::ROOT;
		let mut cur_level: u16 = 0;
		let mut cur_path = String::new();
		let mut cur_val = MdItemValue::new(ItemKind::Dir, "")?;

		for part in path.split('/').filter(|p| !p.is_empty()) {
			if cur_level == u16::MAX {
				return Err(Error::Message(format!("Path {} is too deep", path)));
			}
			cur_level += 1;
			cur_path.push('/');
			cur_path.push_str(part);
			match self.get_item(cur_key, &cur_path, cur_level)? {
				None => return Ok(None),
				Some((key, val)) => {
					cur_key = key;
					cur_val = val;
				}
			}
		}
		Ok(Some((cur_key, cur_level, cur_val)))
	}

	fn mkdir(&self, path: &str) -> Result<(MdKey, u16), Error> {
		let path = path.trim_end_matches('/');
		let (dir_name, item_name) = split_path(path);
		let (parent_key, parent_level) = match self.find(dir_name)? {
			Some((key, level, _)) => (key, level),
			None => self.mkdir(dir_name)?,
		};
		let value = MdItemValue::new(ItemKind::Dir, item_name)?;
		let level = parent_level + 1;
		let key = self.mk_item(parent_key, path, level, &value)?;
		Ok((key, level))
	}

	// ---- public tree operations ----

	/// Create `path` and its missing intermediate directories; fails with
	/// `AlreadyExists` when the terminal component is present
	pub fn make_path(&self, path: &str) -> Result<(), Error> {
		self.mkdir(path)?;
		self.flush()
	}

	/// Merge `blocks` into the file at `path`, creating it if needed, and
	/// charge the quota by `size * (replica_count + 1)` for every new or
	/// grown entry
	pub fn update_path(&self, path: &str, blocks: &[MdDataBlockInfo]) -> Result<(), Error> {
		let mut user_info = self.get_user_info()?;
		if user_info.storage_size == 0 {
			return Err(Error::MdNotInitialized);
		}

		let path = path.trim_end_matches('/');
		let charge: i64;
		match self.find(path)? {
			None => {
				let (dir_name, item_name) = split_path(path);
				let (parent_key, parent_level, _) = self
					.find(dir_name)?
					.ok_or_else(|| Error::NotFound(format!("Path {} does not exist", dir_name)))?;

				charge = blocks.iter().map(|b| b.charge() as i64).sum();
				self.check_quota(&user_info, charge)?;

				let mut val = MdItemValue::new(ItemKind::File, item_name)?;
				val.content = pack_file_content(blocks);
				self.mk_item(parent_key, path, parent_level + 1, &val)?;
			}
			Some((key, _, mut val)) => {
				if val.kind != ItemKind::File {
					return Err(Error::Message(format!("Path {} is not a file", path)));
				}
				let mut content = unpack_file_content(&val.content);
				let mut delta = 0i64;
				for new_block in blocks {
					match content.iter_mut().find(|b| b.db_key == new_block.db_key) {
						Some(existing) => {
							if existing.size != new_block.size {
								delta += (new_block.size as i64 - existing.size as i64)
									* (existing.replica_count as i64 + 1);
								existing.size = new_block.size;
							}
						}
						None => {
							delta += new_block.charge() as i64;
							content.push(*new_block);
						}
					}
				}
				charge = delta;
				self.check_quota(&user_info, charge)?;

				val.content = pack_file_content(&content);
				self.db.insert(key.pack(), val.pack()).map_err(db_err)?;
			}
		}

		user_info.used_size = (user_info.used_size as i64 + charge).max(0) as u64;
		self.update_user_info(&user_info)
	}

	fn check_quota(&self, user_info: &UserInfo, charge: i64) -> Result<(), Error> {
		if charge > 0 && user_info.used_size as i64 + charge > user_info.storage_size as i64 {
			return Err(Error::MdNoFreeSpace("No free user space".into()));
		}
		Ok(())
	}

	pub fn get_path_info(&self, path: &str) -> Result<PathInfo, Error> {
		let (_, _, val) = self
			.find(path)?
			.ok_or_else(|| Error::NotFound(format!("Path {} does not exist", path)))?;

		let mut info = PathInfo {
			name: path.to_string(),
			kind: val.kind,
			size: 0,
			children: Vec::new(),
		};
		match val.kind {
			ItemKind::Dir => {
				for (_, child) in self.iterdir(path)? {
					let child_size = match child.kind {
						ItemKind::Dir => 0,
						ItemKind::File => unpack_file_content(&child.content)
							.iter()
							.map(|b| b.size as u64)
							.sum(),
					};
					info.size += child_size;
					info.children.push(PathChild {
						name: child.name,
						kind: child.kind,
						size: child_size,
					});
				}
			}
			ItemKind::File => {
				info.size = unpack_file_content(&val.content)
					.iter()
					.map(|b| b.size as u64)
					.sum();
			}
		}
		Ok(info)
	}

	pub fn get_data_blocks(&self, path: &str) -> Result<Vec<MdDataBlockInfo>, Error> {
		let (_, _, val) = self
			.find(path)?
			.ok_or_else(|| Error::NotFound(format!("Path {} does not exist", path)))?;
		if val.kind != ItemKind::File {
			return Err(Error::Message(format!("Path {} is not a file", path)));
		}
		Ok(unpack_file_content(&val.content))
	}

	/// Remove `path`: directories must be empty, files give their quota
	/// charge back, the root is immutable
	pub fn remove_path(&self, path: &str) -> Result<(), Error> {
		let (key, _, val) = self
			.find(path)?
			.ok_or_else(|| Error::NotFound(format!("Path {} does not exist", path)))?;
		if key == MdKey::ROOT {
			return Err(Error::Message("Cannot remove the root".into()));
		}

		match val.kind {
			ItemKind::Dir => {
				if !self.iterdir(path)?.is_empty() {
					return Err(Error::Message(format!("Directory {} is not empty", path)));
				}
			}
			ItemKind::File => {
				let charge: u64 = unpack_file_content(&val.content)
					.iter()
					.map(|b| b.charge())
					.sum();
				let mut user_info = self.get_user_info()?;
				user_info.used_size = user_info.used_size.saturating_sub(charge);
				self.update_user_info(&user_info)?;
			}
		}
		self.db.remove(key.pack()).map_err(db_err)?;
		self.flush()
	}

	pub fn iterdir(&self, path: &str) -> Result<Vec<(MdKey, MdItemValue)>, Error> {
		let (key, _, val) = self
			.find(path)?
			.ok_or_else(|| Error::NotFound(format!("Path {} does not exist", path)))?;
		if val.kind != ItemKind::Dir {
			return Err(Error::Message(format!("Path {} is not a directory", path)));
		}

		let (start, end) = key.parent_range();
		let mut items = Vec::new();
		for entry in self.db.range(start..=end) {
			let (raw_key, raw_val) = entry.map_err(db_err)?;
			items.push((MdKey::unpack(&raw_key)?, MdItemValue::unpack(&raw_val)?));
		}
		Ok(items)
	}

	pub fn listdir(&self, path: &str) -> Result<Vec<String>, Error> {
		Ok(self
			.iterdir(path)?
			.into_iter()
			.map(|(_, val)| val.name)
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn block(key: u64, replica_count: u8, size: u32) -> MdDataBlockInfo {
		MdDataBlockInfo {
			db_key: Key::from_u64(key),
			replica_count,
			size,
		}
	}

	fn open_store(dir: &Path) -> UserMetadata {
		let store = UserMetadata::open(dir).unwrap();
		store
			.update_user_info(&UserInfo {
				user_id_hash: Key::sha1_of(b"fabregas"),
				storage_size: 100500,
				used_size: 0,
				flags: 0,
			})
			.unwrap();
		store
	}

	#[test]
	fn test_not_initialized() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = UserMetadata::open(dir.as_path()).unwrap();
		assert!(matches!(
			store.update_path("/test.out", &[block(1, 2, 10)]),
			Err(Error::MdNotInitialized)
		));
	}

	#[test]
	fn test_update_path_capacity_accounting() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = open_store(dir.as_path());

		store
			.update_path("/test.out", &[block(23124, 2, 22223), block(542322, 2, 3333)])
			.unwrap();
		let used = store.get_user_info().unwrap().used_size;
		assert_eq!(used, (22223 + 3333) * 3);

		// growing an existing entry charges only the delta
		store
			.update_path("/test.out", &[block(23124, 2, 22300)])
			.unwrap();
		assert_eq!(
			store.get_user_info().unwrap().used_size,
			used + (22300 - 22223) * 3
		);

		// shrinking gives the difference back
		store
			.update_path("/test.out", &[block(23124, 2, 22223)])
			.unwrap();
		assert_eq!(store.get_user_info().unwrap().used_size, used);

		// removal refunds the whole charge
		store.remove_path("/test.out").unwrap();
		assert_eq!(store.get_user_info().unwrap().used_size, 0);
	}

	#[test]
	fn test_update_path_quota_refused() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = open_store(dir.as_path());

		assert!(matches!(
			store.update_path("/big", &[block(1, 2, 40000)]),
			Err(Error::MdNoFreeSpace(_))
		));
		// a failed update does not change the accounting
		assert_eq!(store.get_user_info().unwrap().used_size, 0);
	}

	#[test]
	fn test_update_path_missing_parent() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = open_store(dir.as_path());
		assert!(matches!(
			store.update_path("/no/such/dir/f", &[block(1, 2, 1)]),
			Err(Error::NotFound(_))
		));
	}

	#[test]
	fn test_make_path_and_listing() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = open_store(dir.as_path());

		store.make_path("/home/user/docs").unwrap();
		assert!(matches!(
			store.make_path("/home/user/docs"),
			Err(Error::AlreadyExists(_))
		));

		store.update_path("/home/user/docs/a.txt", &[block(1, 2, 100)]).unwrap();
		store.update_path("/home/user/docs/b.txt", &[block(2, 2, 50)]).unwrap();

		let mut names = store.listdir("/home/user/docs").unwrap();
		names.sort();
		assert_eq!(names, vec!["a.txt", "b.txt"]);
		assert_eq!(store.listdir("/home").unwrap(), vec!["user"]);
	}

	#[test]
	fn test_get_path_info() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = open_store(dir.as_path());

		store.make_path("/data/sub").unwrap();
		store.update_path("/data/f1", &[block(1, 2, 100), block(2, 2, 20)]).unwrap();

		let file_info = store.get_path_info("/data/f1").unwrap();
		assert_eq!(file_info.kind, ItemKind::File);
		assert_eq!(file_info.size, 120);
		assert!(file_info.children.is_empty());

		let dir_info = store.get_path_info("/data").unwrap();
		assert_eq!(dir_info.kind, ItemKind::Dir);
		assert_eq!(dir_info.size, 120);
		assert_eq!(dir_info.children.len(), 2);

		let blocks = store.get_data_blocks("/data/f1").unwrap();
		assert_eq!(blocks.len(), 2);
		assert_eq!(blocks[0].db_key, Key::from_u64(1));
	}

	#[test]
	fn test_remove_path_rules() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = open_store(dir.as_path());

		store.make_path("/adir").unwrap();
		store.update_path("/adir/f", &[block(1, 2, 10)]).unwrap();

		// non-empty directory cannot be removed
		assert!(store.remove_path("/adir").is_err());
		// the root is immutable
		assert!(store.remove_path("/").is_err());

		store.remove_path("/adir/f").unwrap();
		store.remove_path("/adir").unwrap();
		assert!(matches!(
			store.get_path_info("/adir"),
			Err(Error::NotFound(_))
		));
	}

	#[test]
	fn test_checksum_follows_user_info() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store = open_store(dir.as_path());
		let c1 = store.checksum().unwrap();
		store.add_user_storage_size(1).unwrap();
		let c2 = store.checksum().unwrap();
		assert_ne!(c1, c2);
		store.add_user_storage_size(-1).unwrap();
		assert_eq!(store.checksum().unwrap(), c1);
	}
}

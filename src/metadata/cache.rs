use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ringstore_block::{BlockLocks, DataBlock};
use ringstore_util::error::Error;

use crate::archive::{pack_store_dir, unpack_store_dir};
use crate::store::{UserMetadata, STORE_LOCK_FILE};

struct CachedStore {
	store: UserMetadata,
	lock: Mutex<DataBlock>,
}

/// Process-wide cache of open metadata stores. Every access scopes the
/// store's lock file so a single writer at a time is admitted per store;
/// the cache itself is guarded by a short-held mutex.
pub struct MetadataCache {
	locks: Arc<BlockLocks>,
	cached: Mutex<HashMap<PathBuf, Arc<CachedStore>>>,
}

impl MetadataCache {
	pub fn new(locks: Arc<BlockLocks>) -> Self {
		Self {
			locks,
			cached: Mutex::new(HashMap::new()),
		}
	}

	fn entry(&self, path: &Path) -> Result<Arc<CachedStore>, Error> {
		let mut cached = self.cached.lock().unwrap();
		if let Some(entry) = cached.get(path) {
			return Ok(entry.clone());
		}
		let store = UserMetadata::open(path)?;
		let lock = Mutex::new(DataBlock::new(
			path.join(STORE_LOCK_FILE),
			self.locks.clone(),
		));
		let entry = Arc::new(CachedStore { store, lock });
		cached.insert(path.to_path_buf(), entry.clone());
		Ok(entry)
	}

	/// Run `f` on the store at `path` under the store's lock file,
	/// opening the store lazily on first use
	pub fn with_store<T>(
		&self,
		path: &Path,
		f: impl FnOnce(&UserMetadata) -> Result<T, Error>,
	) -> Result<T, Error> {
		let entry = self.entry(path)?;
		let mut guard = entry.lock.lock().unwrap();
		guard.block()?;
		let res = f(&entry.store);
		guard.unblock();
		res
	}

	/// Flush and evict every cached store; they are reopened lazily
	pub fn flush_all(&self) {
		let mut cached = self.cached.lock().unwrap();
		for (path, entry) in cached.drain() {
			if let Err(e) = entry.store.flush() {
				warn!("Flushing metadata store {} failed: {}", path.display(), e);
			}
		}
	}

	/// Flush and evict the store at `path`, forcing the next access to
	/// reopen it from disk
	pub fn close_store(&self, path: &Path) {
		let mut cached = self.cached.lock().unwrap();
		if let Some(entry) = cached.remove(path) {
			if let Err(e) = entry.store.flush() {
				warn!("Flushing metadata store {} failed: {}", path.display(), e);
			}
		}
	}

	/// Archive the store at `path` for replica transport
	pub fn snapshot(&self, path: &Path) -> Result<Vec<u8>, Error> {
		let entry = self.entry(path)?;
		let mut guard = entry.lock.lock().unwrap();
		guard.block()?;
		let res = entry
			.store
			.flush()
			.and_then(|_| pack_store_dir(entry.store.dir()));
		guard.unblock();
		res
	}

	/// Replace the store at `path` with a received archive
	pub fn restore(&self, path: &Path, archive: &[u8]) -> Result<(), Error> {
		let mut cached = self.cached.lock().unwrap();
		if let Some(entry) = cached.remove(path) {
			if let Err(e) = entry.store.flush() {
				warn!("Flushing metadata store {} failed: {}", path.display(), e);
			}
		}
		unpack_store_dir(archive, path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::records::{MdDataBlockInfo, UserInfo};
	use ringstore_util::key::Key;

	#[test]
	fn test_cache_reuses_store_and_survives_flush() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let store_dir = dir.as_path().join("owner");
		let cache = MetadataCache::new(BlockLocks::new());

		cache
			.with_store(&store_dir, |store| {
				store.update_user_info(&UserInfo {
					user_id_hash: Key::sha1_of(b"u"),
					storage_size: 1000,
					used_size: 0,
					flags: 0,
				})
			})
			.unwrap();

		cache.flush_all();

		let info = cache
			.with_store(&store_dir, |store| store.get_user_info())
			.unwrap();
		assert_eq!(info.storage_size, 1000);
	}

	#[test]
	fn test_snapshot_restore_round_trip() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let master_dir = dir.as_path().join("master");
		let replica_dir = dir.as_path().join("replica");
		let cache = MetadataCache::new(BlockLocks::new());

		cache
			.with_store(&master_dir, |store| {
				store.update_user_info(&UserInfo {
					user_id_hash: Key::sha1_of(b"u"),
					storage_size: 100500,
					used_size: 0,
					flags: 0,
				})?;
				store.update_path(
					"/test.out",
					&[MdDataBlockInfo {
						db_key: Key::from_u64(23124),
						replica_count: 2,
						size: 22223,
					}],
				)
			})
			.unwrap();

		let archive = cache.snapshot(&master_dir).unwrap();
		cache.restore(&replica_dir, &archive).unwrap();

		let blocks = cache
			.with_store(&replica_dir, |store| store.get_data_blocks("/test.out"))
			.unwrap();
		assert_eq!(blocks.len(), 1);
		assert_eq!(blocks[0].size, 22223);

		// master and replica agree on the repair checksum
		let master_sum = cache.with_store(&master_dir, |s| s.checksum()).unwrap();
		let replica_sum = cache.with_store(&replica_dir, |s| s.checksum()).unwrap();
		assert_eq!(master_sum, replica_sum);
	}
}

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use sha1::{Digest, Sha1};

use ringstore_util::error::Error;
use ringstore_util::key::{Key, KEY_LEN};

use crate::header::{DataBlockHeader, CHUNK_SIZE, HEADER_LEN};
use crate::locks::BlockLocks;

#[derive(PartialEq, Clone, Copy)]
enum Held {
	None,
	Shared,
	Exclusive,
}

/// A file-backed data block. Concurrent access is mediated by an OS
/// advisory lock on the backing file plus the in-process [`BlockLocks`]
/// table; all locks are released when the block is dropped.
pub struct DataBlock {
	path: PathBuf,
	locks: Arc<BlockLocks>,
	file: Option<File>,
	held: Held,
	link_idx: u32,
}

impl DataBlock {
	pub fn new(path: PathBuf, locks: Arc<BlockLocks>) -> Self {
		Self {
			path,
			locks,
			file: None,
			held: Held::None,
			link_idx: 0,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn exists(&self) -> bool {
		self.path.exists()
	}

	pub fn size(&self) -> Result<u64, Error> {
		Ok(fs::metadata(&self.path)?.len())
	}

	fn open(&mut self) -> Result<&mut File, Error> {
		if self.file.is_none() {
			let file = OpenOptions::new()
				.read(true)
				.write(true)
				.create(true)
				.open(&self.path)?;
			file.lock_shared()?;
			self.locks.lock_shared(&self.path);
			self.held = Held::Shared;
			self.file = Some(file);
		}
		Ok(self.file.as_mut().unwrap())
	}

	/// Acquire the exclusive file lock, opening the file if needed.
	/// Returns false when this instance already holds it; a true return
	/// obliges the caller to `unblock()`.
	pub fn block(&mut self) -> Result<bool, Error> {
		self.open()?;
		if self.held == Held::Exclusive {
			return Ok(false);
		}
		if self.held == Held::Shared {
			self.locks.unlock(&self.path);
			self.held = Held::None;
		}
		self.locks.lock_exclusive(&self.path);
		if let Err(e) = self.file.as_mut().unwrap().lock_exclusive() {
			self.locks.unlock(&self.path);
			return Err(e.into());
		}
		self.held = Held::Exclusive;
		Ok(true)
	}

	/// Release the exclusive lock taken by `block()`
	pub fn unblock(&mut self) {
		if self.held == Held::Exclusive {
			if let Some(file) = self.file.as_mut() {
				if let Err(e) = file.unlock() {
					warn!("Unlocking {} failed: {}", self.path.display(), e);
				}
			}
			self.locks.unlock(&self.path);
			self.held = Held::None;
		}
	}

	/// Read `count` bytes starting at `seek`; `count == 0` reads up to EOF
	pub fn read(&mut self, count: usize, seek: u64) -> Result<Vec<u8>, Error> {
		let file = self.open()?;
		file.seek(SeekFrom::Start(seek))?;
		let mut data = Vec::new();
		if count > 0 {
			let mut buf = vec![0u8; count];
			let mut filled = 0;
			while filled < count {
				let n = file.read(&mut buf[filled..])?;
				if n == 0 {
					break;
				}
				filled += n;
			}
			buf.truncate(filled);
			data = buf;
		} else {
			file.read_to_end(&mut data)?;
		}
		Ok(data)
	}

	/// Write a buffer, fsync, and return the SHA-1 of the written bytes.
	/// With `seek == None` the write goes to the end of the file.
	pub fn write(&mut self, buf: &[u8], seek: Option<u64>, truncate: bool) -> Result<Key, Error> {
		self.write_stream(&mut &buf[..], seek, truncate).map(|(checksum, _)| checksum)
	}

	/// Stream a reader into the block, fsync, and return the SHA-1 and the
	/// number of bytes written
	pub fn write_stream(
		&mut self,
		reader: &mut impl Read,
		seek: Option<u64>,
		truncate: bool,
	) -> Result<(Key, u64), Error> {
		let blocked = self.block()?;
		let res = self.write_stream_locked(reader, seek, truncate);
		if blocked {
			self.unblock();
		}
		res
	}

	fn write_stream_locked(
		&mut self,
		reader: &mut impl Read,
		seek: Option<u64>,
		truncate: bool,
	) -> Result<(Key, u64), Error> {
		let file = self.file.as_mut().unwrap();
		if truncate {
			file.set_len(0)?;
		}
		match seek {
			Some(pos) => file.seek(SeekFrom::Start(pos))?,
			None => file.seek(SeekFrom::End(0))?,
		};

		let mut hasher = Sha1::new();
		let mut written = 0u64;
		let mut chunk = vec![0u8; CHUNK_SIZE];
		loop {
			let n = reader.read(&mut chunk)?;
			if n == 0 {
				break;
			}
			hasher.update(&chunk[..n]);
			file.write_all(&chunk[..n])?;
			written += n as u64;
		}
		file.sync_all()?;

		let mut digest = [0u8; KEY_LEN];
		digest.copy_from_slice(&hasher.finalize());
		Ok((Key::from_bytes(digest), written))
	}

	/// Read and decode the fixed header prefix
	pub fn header(&mut self) -> Result<DataBlockHeader, Error> {
		let raw = self.read(HEADER_LEN, 0)?;
		DataBlockHeader::unpack(&raw)
	}

	/// Create a uniquely-suffixed hardlink of the block, for zero-copy
	/// fan-out streaming
	pub fn hardlink(&mut self) -> Result<PathBuf, Error> {
		loop {
			let link = self.path.with_extension(format!("{}", self.link_idx));
			self.link_idx += 1;
			match fs::hard_link(&self.path, &link) {
				Ok(()) => return Ok(link),
				Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
				Err(e) => return Err(e.into()),
			}
		}
	}

	/// Unlink the backing file; idempotent
	pub fn remove(&mut self) -> Result<(), Error> {
		match fs::remove_file(&self.path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Release all locks and close the file descriptor
	pub fn close(&mut self) {
		self.unblock();
		if self.held == Held::Shared {
			self.locks.unlock(&self.path);
			self.held = Held::None;
		}
		if let Some(file) = self.file.take() {
			let _ = file.unlock();
		}
	}
}

impl Drop for DataBlock {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn tmp_dir() -> mktemp::Temp {
		mktemp::Temp::new_dir().unwrap()
	}

	#[test]
	fn test_write_read_round_trip() {
		let dir = tmp_dir();
		let locks = BlockLocks::new();
		let path = dir.as_path().join("block");

		let mut db = DataBlock::new(path.clone(), locks.clone());
		assert!(!db.exists());
		let checksum = db.write(b"hello world", None, false).unwrap();
		assert_eq!(checksum, Key::sha1_of(b"hello world"));
		assert!(db.exists());
		assert_eq!(db.size().unwrap(), 11);

		assert_eq!(db.read(0, 0).unwrap(), b"hello world");
		assert_eq!(db.read(5, 6).unwrap(), b"world");
		assert_eq!(db.read(100, 6).unwrap(), b"world");
	}

	#[test]
	fn test_write_seek_and_truncate() {
		let dir = tmp_dir();
		let locks = BlockLocks::new();
		let mut db = DataBlock::new(dir.as_path().join("block"), locks);

		db.write(b"0123456789", None, false).unwrap();
		db.write(b"ab", Some(0), false).unwrap();
		assert_eq!(db.read(0, 0).unwrap(), b"ab23456789");
		// appends go to the end
		db.write(b"xy", None, false).unwrap();
		assert_eq!(db.read(0, 0).unwrap(), b"ab23456789xy");

		db.write(b"fresh", None, true).unwrap();
		assert_eq!(db.read(0, 0).unwrap(), b"fresh");
	}

	#[test]
	fn test_header_round_trip_through_file() {
		let dir = tmp_dir();
		let locks = BlockLocks::new();
		let mut db = DataBlock::new(dir.as_path().join("block"), locks);

		let header = DataBlockHeader::new(
			Key::sha1_of(b"m"),
			2,
			Key::sha1_of(b"payload"),
			Key::sha1_of(b"owner"),
		);
		db.write(&header.pack(), None, false).unwrap();
		db.write(b"payload", None, false).unwrap();
		assert_eq!(db.header().unwrap(), header);
	}

	#[test]
	fn test_block_is_idempotent_per_instance() {
		let dir = tmp_dir();
		let locks = BlockLocks::new();
		let mut db = DataBlock::new(dir.as_path().join("block"), locks);

		assert!(db.block().unwrap());
		assert!(!db.block().unwrap());
		db.unblock();
		assert!(db.block().unwrap());
		db.unblock();
	}

	#[test]
	fn test_hardlink_and_remove() {
		let dir = tmp_dir();
		let locks = BlockLocks::new();
		let mut db = DataBlock::new(dir.as_path().join("block"), locks.clone());
		db.write(b"data", None, false).unwrap();

		let link1 = db.hardlink().unwrap();
		let link2 = db.hardlink().unwrap();
		assert_ne!(link1, link2);
		assert_eq!(fs::read(&link1).unwrap(), b"data");

		db.remove().unwrap();
		assert!(!db.exists());
		// removing again is a no-op
		db.remove().unwrap();
		// hardlinked content survives the removal
		assert_eq!(fs::read(&link2).unwrap(), b"data");
	}

	#[test]
	fn test_write_stream_reports_size() {
		let dir = tmp_dir();
		let locks = BlockLocks::new();
		let mut db = DataBlock::new(dir.as_path().join("block"), locks);

		let payload = vec![0x42u8; 3 * CHUNK_SIZE + 17];
		let (checksum, size) = db.write_stream(&mut &payload[..], None, false).unwrap();
		assert_eq!(size, payload.len() as u64);
		assert_eq!(checksum, Key::sha1_of(&payload));
	}
}

use std::fs;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use ringstore_util::error::Error;

use crate::store::STORE_LOCK_FILE;

/// Pack a metadata store directory into an in-memory tar.gz archive,
/// skipping the local lock file
pub fn pack_store_dir(dir: &Path) -> Result<Vec<u8>, Error> {
	let encoder = GzEncoder::new(Vec::new(), Compression::default());
	let mut builder = tar::Builder::new(encoder);

	for dirent in fs::read_dir(dir)? {
		let dirent = dirent?;
		let name = dirent.file_name();
		if name.to_str() == Some(STORE_LOCK_FILE) {
			continue;
		}
		let path = dirent.path();
		if path.is_dir() {
			builder.append_dir_all(&name, &path)?;
		} else {
			builder.append_path_with_name(&path, &name)?;
		}
	}

	let encoder = builder.into_inner()?;
	Ok(encoder.finish()?)
}

/// Replace the content of a metadata store directory with an archive
/// produced by [`pack_store_dir`]
pub fn unpack_store_dir(archive: &[u8], dir: &Path) -> Result<(), Error> {
	if dir.exists() {
		fs::remove_dir_all(dir)?;
	}
	fs::create_dir_all(dir)?;

	let decoder = GzDecoder::new(archive);
	let mut reader = tar::Archive::new(decoder);
	reader.unpack(dir)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_pack_unpack_round_trip() {
		let src = mktemp::Temp::new_dir().unwrap();
		fs::write(src.as_path().join("dht_info"), b"header bytes").unwrap();
		fs::create_dir(src.as_path().join("kv")).unwrap();
		fs::write(src.as_path().join("kv/db"), b"kv content").unwrap();
		fs::write(src.as_path().join(STORE_LOCK_FILE), b"").unwrap();

		let archive = pack_store_dir(src.as_path()).unwrap();

		let dst = mktemp::Temp::new_dir().unwrap();
		let target = dst.as_path().join("restored");
		unpack_store_dir(&archive, &target).unwrap();

		assert_eq!(fs::read(target.join("dht_info")).unwrap(), b"header bytes");
		assert_eq!(fs::read(target.join("kv/db")).unwrap(), b"kv content");
		// the lock file is local and never shipped
		assert!(!target.join(STORE_LOCK_FILE).exists());
	}
}

use std::io::Read;

use sha1::{Digest, Sha1};

use ringstore_util::error::Error;
use ringstore_util::key::{Key, KEY_LEN};
use ringstore_util::time::now_sec;

/// Magic label identifying a data block file
pub const DATA_BLOCK_LABEL: &[u8; 5] = b"FDB01";

/// Size of the fixed header written before every data block payload:
/// label, stored time (f64 LE), master key, replica count, payload
/// checksum, owner hash. The layout is byte-compatible across nodes.
pub const HEADER_LEN: usize = 5 + 8 + KEY_LEN + 1 + KEY_LEN + KEY_LEN;

/// Chunk size used when streaming payloads through the checksum
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Fixed-layout prefix of every stored data block
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DataBlockHeader {
	pub master_key: Key,
	pub replica_count: u8,
	/// SHA-1 of the payload
	pub checksum: Key,
	/// SHA-1 of the owner user id
	pub owner_hash: Key,
	pub stored_unixtime: f64,
}

impl DataBlockHeader {
	/// Build a header stamped with the current UTC time
	pub fn new(master_key: Key, replica_count: u8, checksum: Key, owner_hash: Key) -> Self {
		Self::with_time(master_key, replica_count, checksum, owner_hash, now_sec())
	}

	pub fn with_time(
		master_key: Key,
		replica_count: u8,
		checksum: Key,
		owner_hash: Key,
		stored_unixtime: f64,
	) -> Self {
		Self {
			master_key,
			replica_count,
			checksum,
			owner_hash,
			stored_unixtime,
		}
	}

	pub fn pack(&self) -> [u8; HEADER_LEN] {
		let mut buf = [0u8; HEADER_LEN];
		buf[0..5].copy_from_slice(DATA_BLOCK_LABEL);
		buf[5..13].copy_from_slice(&self.stored_unixtime.to_le_bytes());
		buf[13..33].copy_from_slice(self.master_key.as_slice());
		buf[33] = self.replica_count;
		buf[34..54].copy_from_slice(self.checksum.as_slice());
		buf[54..74].copy_from_slice(self.owner_hash.as_slice());
		buf
	}

	pub fn unpack(raw: &[u8]) -> Result<Self, Error> {
		if raw.len() < HEADER_LEN {
			return Err(Error::InvalidDataBlock(format!(
				"Header is truncated: {} bytes",
				raw.len()
			)));
		}
		if &raw[0..5] != DATA_BLOCK_LABEL {
			return Err(Error::InvalidDataBlock(
				"Corrupted data block, no block label found".into(),
			));
		}
		let mut time_bytes = [0u8; 8];
		time_bytes.copy_from_slice(&raw[5..13]);
		Ok(Self {
			stored_unixtime: f64::from_le_bytes(time_bytes),
			master_key: Key::from_slice(&raw[13..33])?,
			replica_count: raw[33],
			checksum: Key::from_slice(&raw[34..54])?,
			owner_hash: Key::from_slice(&raw[54..74])?,
		})
	}

	/// Verify the stored header against a set of expected fields.
	/// An owner mismatch is a permission error; an incoming write older
	/// than the stored block is rejected as old data; any other mismatch
	/// marks the block as invalid.
	pub fn matches(&self, expected: &HeaderMatch) -> Result<(), Error> {
		if let Some(master_key) = expected.master_key {
			if self.master_key != master_key {
				return Err(Error::InvalidDataBlock(format!(
					"Master key {} != {}",
					master_key, self.master_key
				)));
			}
		}
		if let Some(replica_count) = expected.replica_count {
			if self.replica_count != replica_count {
				return Err(Error::InvalidDataBlock(format!(
					"Replica count {} != {}",
					replica_count, self.replica_count
				)));
			}
		}
		if let Some(checksum) = expected.checksum {
			if self.checksum != checksum {
				return Err(Error::InvalidDataBlock(format!(
					"Checksum {} != {}",
					checksum, self.checksum
				)));
			}
		}
		if let Some(owner_hash) = expected.owner_hash {
			if self.owner_hash != owner_hash {
				return Err(Error::PermissionDenied("Alien data block".into()));
			}
		}
		if let Some(stored_unixtime) = expected.stored_unixtime {
			if stored_unixtime < self.stored_unixtime {
				return Err(Error::OldDataDetected);
			}
		}
		Ok(())
	}
}

/// Expected header fields for [`DataBlockHeader::matches`]; unset fields
/// are not checked
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderMatch {
	pub master_key: Option<Key>,
	pub replica_count: Option<u8>,
	pub checksum: Option<Key>,
	pub owner_hash: Option<Key>,
	pub stored_unixtime: Option<f64>,
}

impl HeaderMatch {
	pub fn owner(owner_hash: Option<Key>) -> Self {
		Self {
			owner_hash,
			..Default::default()
		}
	}
}

/// Stream a raw data block (header + payload) through SHA-1 and verify
/// that the payload matches the header checksum, and optionally that the
/// header checksum equals `expected_checksum`.
pub fn check_raw_data(reader: &mut impl Read, expected_checksum: Option<Key>) -> Result<(), Error> {
	let mut header_buf = [0u8; HEADER_LEN];
	reader
		.read_exact(&mut header_buf)
		.map_err(|e| Error::InvalidDataBlock(format!("Header is unreadable: {}", e)))?;
	let header = DataBlockHeader::unpack(&header_buf)?;

	if let Some(expected) = expected_checksum {
		if expected != header.checksum {
			return Err(Error::InvalidDataBlock(
				"Data checksum is not equal to expected".into(),
			));
		}
	}

	let mut hasher = Sha1::new();
	let mut chunk = vec![0u8; CHUNK_SIZE];
	loop {
		let n = reader.read(&mut chunk)?;
		if n == 0 {
			break;
		}
		hasher.update(&chunk[..n]);
	}
	let mut digest = [0u8; KEY_LEN];
	digest.copy_from_slice(&hasher.finalize());
	if Key::from_bytes(digest) != header.checksum {
		return Err(Error::InvalidDataBlock("Data block has bad checksum".into()));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_header() -> DataBlockHeader {
		DataBlockHeader::with_time(
			Key::sha1_of(b"master"),
			2,
			Key::sha1_of(b"payload"),
			Key::sha1_of(b"fabregas"),
			23523.0,
		)
	}

	#[test]
	fn test_pack_unpack_round_trip() {
		let header = sample_header();
		let packed = header.pack();
		assert_eq!(packed.len(), HEADER_LEN);
		assert_eq!(&packed[0..5], DATA_BLOCK_LABEL);
		let unpacked = DataBlockHeader::unpack(&packed).unwrap();
		assert_eq!(unpacked, header);
	}

	#[test]
	fn test_unpack_rejects_garbage() {
		assert!(matches!(
			DataBlockHeader::unpack(&[0u8; 10]),
			Err(Error::InvalidDataBlock(_))
		));
		let mut packed = sample_header().pack();
		packed[0] = b'X';
		assert!(matches!(
			DataBlockHeader::unpack(&packed),
			Err(Error::InvalidDataBlock(_))
		));
	}

	#[test]
	fn test_matches_owner_and_time() {
		let header = sample_header();

		header
			.matches(&HeaderMatch::owner(Some(Key::sha1_of(b"fabregas"))))
			.unwrap();
		assert!(matches!(
			header.matches(&HeaderMatch::owner(Some(Key::sha1_of(b"1324")))),
			Err(Error::PermissionDenied(_))
		));

		// incoming write older than the stored block
		assert!(matches!(
			header.matches(&HeaderMatch {
				stored_unixtime: Some(100.0),
				..Default::default()
			}),
			Err(Error::OldDataDetected)
		));
		// newer (or equal) incoming write is fine
		header
			.matches(&HeaderMatch {
				stored_unixtime: Some(23523.0),
				..Default::default()
			})
			.unwrap();
	}

	#[test]
	fn test_check_raw_data() {
		let payload = b"some stored payload";
		let header = DataBlockHeader::new(
			Key::sha1_of(b"k"),
			2,
			Key::sha1_of(payload),
			Key::sha1_of(b"owner"),
		);
		let mut raw = header.pack().to_vec();
		raw.extend_from_slice(payload);

		check_raw_data(&mut &raw[..], None).unwrap();
		check_raw_data(&mut &raw[..], Some(Key::sha1_of(payload))).unwrap();
		assert!(check_raw_data(&mut &raw[..], Some(Key::sha1_of(b"other"))).is_err());

		// corrupt one payload byte
		let len = raw.len();
		raw[len - 1] ^= 0xff;
		assert!(matches!(
			check_raw_data(&mut &raw[..], None),
			Err(Error::InvalidDataBlock(_))
		));
	}
}

use std::convert::TryInto;

use serde::{Deserialize, Serialize};

use ringstore_util::error::Error;
use ringstore_util::key::{Key, KEY_LEN};

/// Per-user quota record stored at the fixed root key of the store
#[derive(Clone, Debug, PartialEq, Default)]
pub struct UserInfo {
	pub user_id_hash: Key,
	pub storage_size: u64,
	pub used_size: u64,
	pub flags: u16,
}

impl UserInfo {
	pub const PACKED_LEN: usize = KEY_LEN + 8 + 8 + 2;

	pub fn pack(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(Self::PACKED_LEN);
		buf.extend_from_slice(self.user_id_hash.as_slice());
		buf.extend_from_slice(&self.storage_size.to_le_bytes());
		buf.extend_from_slice(&self.used_size.to_le_bytes());
		buf.extend_from_slice(&self.flags.to_le_bytes());
		buf
	}

	pub fn unpack(raw: &[u8]) -> Result<Self, Error> {
		if raw.len() != Self::PACKED_LEN {
			return Err(Error::Message(format!(
				"Invalid user info record ({} bytes)",
				raw.len()
			)));
		}
		Ok(Self {
			user_id_hash: Key::from_slice(&raw[0..KEY_LEN])?,
			storage_size: u64::from_le_bytes(raw[KEY_LEN..KEY_LEN + 8].try_into().unwrap()),
			used_size: u64::from_le_bytes(raw[KEY_LEN + 8..KEY_LEN + 16].try_into().unwrap()),
			flags: u16::from_le_bytes(raw[KEY_LEN + 16..].try_into().unwrap()),
		})
	}
}

/// Store key of one tree item: items are grouped by their parent, then
/// hashed by path; `index` walks the collision chain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MdKey {
	pub parent_id: u64,
	pub path_hash: u32,
	pub level: u16,
	pub index: u16,
}

impl MdKey {
	pub const PACKED_LEN: usize = 16;
	pub const ROOT: MdKey = MdKey {
		parent_id: 0,
		path_hash: 0,
		level: 0,
		index: 0,
	};

	pub fn new(parent_id: u64, path_hash: u32, level: u16, index: u16) -> Self {
		Self {
			parent_id,
			path_hash,
			level,
			index,
		}
	}

	pub fn pack(&self) -> [u8; Self::PACKED_LEN] {
		let mut buf = [0u8; Self::PACKED_LEN];
		buf[0..8].copy_from_slice(&self.parent_id.to_le_bytes());
		buf[8..12].copy_from_slice(&self.path_hash.to_le_bytes());
		buf[12..14].copy_from_slice(&self.level.to_le_bytes());
		buf[14..16].copy_from_slice(&self.index.to_le_bytes());
		buf
	}

	pub fn unpack(raw: &[u8]) -> Result<Self, Error> {
		if raw.len() != Self::PACKED_LEN {
			return Err(Error::Message(format!(
				"Invalid metadata key ({} bytes)",
				raw.len()
			)));
		}
		Ok(Self {
			parent_id: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
			path_hash: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
			level: u16::from_le_bytes(raw[12..14].try_into().unwrap()),
			index: u16::from_le_bytes(raw[14..16].try_into().unwrap()),
		})
	}

	/// Identifier under which this item's children are grouped
	pub fn make_parent(&self) -> u64 {
		((self.path_hash as u64) << 32) | ((self.level as u64) << 16) | self.index as u64
	}

	/// Store-key interval enclosing every child of this item
	pub fn parent_range(&self) -> ([u8; Self::PACKED_LEN], [u8; Self::PACKED_LEN]) {
		let parent = self.make_parent();
		let mut start = [0u8; Self::PACKED_LEN];
		start[0..8].copy_from_slice(&parent.to_le_bytes());
		start[8..16].copy_from_slice(&1u64.to_le_bytes());
		let mut end = [0u8; Self::PACKED_LEN];
		end[0..8].copy_from_slice(&parent.to_le_bytes());
		end[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
		(start, end)
	}
}

/// Type of a tree item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
	File,
	Dir,
}

impl ItemKind {
	fn tag(self) -> u8 {
		match self {
			ItemKind::File => 1,
			ItemKind::Dir => 2,
		}
	}

	fn from_tag(tag: u8) -> Result<Self, Error> {
		match tag {
			1 => Ok(ItemKind::File),
			2 => Ok(ItemKind::Dir),
			other => Err(Error::Message(format!("Unknown item type {}", other))),
		}
	}
}

/// Value of one tree item: its kind, base name and packed content
/// (the block list for files, empty for directories)
#[derive(Clone, Debug, PartialEq)]
pub struct MdItemValue {
	pub kind: ItemKind,
	pub name: String,
	pub content: Vec<u8>,
}

impl MdItemValue {
	pub fn new(kind: ItemKind, name: &str) -> Result<Self, Error> {
		if name.len() >= 255 {
			return Err(Error::Message(format!("Item name too long: \"{}\"", name)));
		}
		Ok(Self {
			kind,
			name: name.to_string(),
			content: Vec::new(),
		})
	}

	pub fn pack(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(2 + self.name.len() + self.content.len());
		buf.push(self.kind.tag());
		buf.push(self.name.len() as u8);
		buf.extend_from_slice(self.name.as_bytes());
		buf.extend_from_slice(&self.content);
		buf
	}

	pub fn unpack(raw: &[u8]) -> Result<Self, Error> {
		if raw.len() < 2 {
			return Err(Error::Message("Truncated item value".into()));
		}
		let kind = ItemKind::from_tag(raw[0])?;
		let name_len = raw[1] as usize;
		if raw.len() < 2 + name_len {
			return Err(Error::Message("Truncated item name".into()));
		}
		let name = String::from_utf8(raw[2..2 + name_len].to_vec())
			.map_err(|_| Error::Message("Item name is not valid UTF-8".into()))?;
		Ok(Self {
			kind,
			name,
			content: raw[2 + name_len..].to_vec(),
		})
	}
}

/// One stored block of a file: its master key, replica count and size
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MdDataBlockInfo {
	pub db_key: Key,
	pub replica_count: u8,
	pub size: u32,
}

impl MdDataBlockInfo {
	pub const PACKED_LEN: usize = KEY_LEN + 1 + 4;

	/// Bytes of quota this block consumes: its size on every replica
	/// plus the master
	pub fn charge(&self) -> u64 {
		self.size as u64 * (self.replica_count as u64 + 1)
	}

	pub fn pack(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(Self::PACKED_LEN);
		buf.extend_from_slice(self.db_key.as_slice());
		buf.push(self.replica_count);
		buf.extend_from_slice(&self.size.to_le_bytes());
		buf
	}

	pub fn unpack(raw: &[u8]) -> Result<Self, Error> {
		if raw.len() != Self::PACKED_LEN {
			return Err(Error::Message(format!(
				"Invalid data block info record ({} bytes)",
				raw.len()
			)));
		}
		Ok(Self {
			db_key: Key::from_slice(&raw[0..KEY_LEN])?,
			replica_count: raw[KEY_LEN],
			size: u32::from_le_bytes(raw[KEY_LEN + 1..].try_into().unwrap()),
		})
	}
}

/// Packed list of the blocks making up a file
pub fn pack_file_content(blocks: &[MdDataBlockInfo]) -> Vec<u8> {
	let mut buf = Vec::with_capacity(blocks.len() * MdDataBlockInfo::PACKED_LEN);
	for block in blocks {
		buf.extend_from_slice(&block.pack());
	}
	buf
}

pub fn unpack_file_content(raw: &[u8]) -> Vec<MdDataBlockInfo> {
	raw.chunks_exact(MdDataBlockInfo::PACKED_LEN)
		.filter_map(|chunk| MdDataBlockInfo::unpack(chunk).ok())
		.collect()
}

/// Information about one path, as returned to clients
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathInfo {
	pub name: String,
	pub kind: ItemKind,
	pub size: u64,
	/// One-level child list, filled for directories
	pub children: Vec<PathChild>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathChild {
	pub name: String,
	pub kind: ItemKind,
	pub size: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_user_info_round_trip() {
		let info = UserInfo {
			user_id_hash: Key::sha1_of(b"fabregas"),
			storage_size: 100500,
			used_size: 31,
			flags: 7,
		};
		let packed = info.pack();
		assert_eq!(packed.len(), UserInfo::PACKED_LEN);
		assert_eq!(UserInfo::unpack(&packed).unwrap(), info);
		assert!(UserInfo::unpack(&packed[1..]).is_err());
	}

	#[test]
	fn test_md_key_round_trip_and_grouping() {
		let key = MdKey::new(77, 0xdeadbeef, 3, 1);
		assert_eq!(MdKey::unpack(&key.pack()).unwrap(), key);

		// all children of one item share the first 8 bytes of their key
		let parent = key.make_parent();
		let child_a = MdKey::new(parent, 1, 4, 0);
		let child_b = MdKey::new(parent, u32::MAX, 4, 9);
		assert_eq!(child_a.pack()[0..8], child_b.pack()[0..8]);

		let (start, end) = key.parent_range();
		assert!(start < child_a.pack());
		assert!(child_a.pack() < end);
		assert!(child_b.pack() < end);
	}

	#[test]
	fn test_item_value_round_trip() {
		let mut val = MdItemValue::new(ItemKind::File, "test.out").unwrap();
		val.content = vec![1, 2, 3];
		assert_eq!(MdItemValue::unpack(&val.pack()).unwrap(), val);

		assert!(MdItemValue::new(ItemKind::Dir, &"x".repeat(255)).is_err());
	}

	#[test]
	fn test_file_content_round_trip() {
		let blocks = vec![
			MdDataBlockInfo {
				db_key: Key::from_u64(23124),
				replica_count: 2,
				size: 22223,
			},
			MdDataBlockInfo {
				db_key: Key::from_u64(542322),
				replica_count: 2,
				size: 3333,
			},
		];
		let packed = pack_file_content(&blocks);
		assert_eq!(unpack_file_content(&packed), blocks);
		assert_eq!(blocks[0].charge(), 22223 * 3);
	}
}

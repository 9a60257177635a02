//! The 160-bit key space and replica key derivation

use std::fmt;

use rand::prelude::*;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::Error;

/// Size in bytes of a ring key
pub const KEY_LEN: usize = 20;

/// A 160-bit unsigned integer identifying a data block and a position in the
/// ring. Stored as big-endian bytes so that byte order equals numeric order;
/// the canonical text form is 40 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key([u8; KEY_LEN]);

impl Key {
	/// Smallest key of the ring
	pub const MIN: Key = Key([0u8; KEY_LEN]);
	/// Largest key of the ring (2^160 - 1)
	pub const MAX: Key = Key([0xffu8; KEY_LEN]);

	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Key(bytes)
	}

	pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
		if bytes.len() != KEY_LEN {
			return Err(Error::Message(format!(
				"Invalid key length: {} bytes",
				bytes.len()
			)));
		}
		let mut b = [0u8; KEY_LEN];
		b.copy_from_slice(bytes);
		Ok(Key(b))
	}

	/// Parse the canonical 40-hex-lowercase form. Uppercase digits are
	/// accepted on input, never produced on output.
	pub fn from_hex(s: &str) -> Result<Self, Error> {
		if s.len() != 2 * KEY_LEN {
			return Err(Error::Message(format!("Invalid key \"{}\"", s)));
		}
		let bytes = hex::decode(s).map_err(|_| Error::Message(format!("Invalid key \"{}\"", s)))?;
		Self::from_slice(&bytes)
	}

	pub fn to_hex(self) -> String {
		hex::encode(self.0)
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.0[..]
	}

	pub fn from_u64(v: u64) -> Self {
		let mut b = [0u8; KEY_LEN];
		b[KEY_LEN - 8..].copy_from_slice(&v.to_be_bytes());
		Key(b)
	}

	/// SHA-1 digest of arbitrary bytes, as a ring key (used for owner hashes)
	pub fn sha1_of(data: &[u8]) -> Self {
		let mut hasher = Sha1::new();
		hasher.update(data);
		let digest = hasher.finalize();
		let mut b = [0u8; KEY_LEN];
		b.copy_from_slice(&digest);
		Key(b)
	}

	// Internal representation for arithmetic: five 32-bit limbs,
	// least significant limb first.
	fn limbs(self) -> [u32; 5] {
		let mut l = [0u32; 5];
		for (i, limb) in l.iter_mut().enumerate() {
			let off = KEY_LEN - 4 * (i + 1);
			*limb = u32::from_be_bytes([
				self.0[off],
				self.0[off + 1],
				self.0[off + 2],
				self.0[off + 3],
			]);
		}
		l
	}

	fn from_limbs(l: [u32; 5]) -> Self {
		let mut b = [0u8; KEY_LEN];
		for (i, limb) in l.iter().enumerate() {
			let off = KEY_LEN - 4 * (i + 1);
			b[off..off + 4].copy_from_slice(&limb.to_be_bytes());
		}
		Key(b)
	}

	pub fn wrapping_add(self, rhs: Key) -> Key {
		let (a, b) = (self.limbs(), rhs.limbs());
		let mut out = [0u32; 5];
		let mut carry = 0u64;
		for i in 0..5 {
			let v = a[i] as u64 + b[i] as u64 + carry;
			out[i] = v as u32;
			carry = v >> 32;
		}
		Key::from_limbs(out)
	}

	pub fn checked_add(self, rhs: Key) -> Option<Key> {
		let sum = self.wrapping_add(rhs);
		if sum < self {
			None
		} else {
			Some(sum)
		}
	}

	pub fn checked_sub(self, rhs: Key) -> Option<Key> {
		if rhs > self {
			return None;
		}
		let (a, b) = (self.limbs(), rhs.limbs());
		let mut out = [0u32; 5];
		let mut borrow = 0i64;
		for i in 0..5 {
			let v = a[i] as i64 - b[i] as i64 - borrow;
			if v < 0 {
				out[i] = (v + (1i64 << 32)) as u32;
				borrow = 1;
			} else {
				out[i] = v as u32;
				borrow = 0;
			}
		}
		Some(Key::from_limbs(out))
	}

	/// Next key upwards, `None` at the top of the ring
	pub fn succ(self) -> Option<Key> {
		self.checked_add(Key::from_u64(1))
	}

	/// Next key downwards, `None` at the bottom of the ring
	pub fn pred(self) -> Option<Key> {
		self.checked_sub(Key::from_u64(1))
	}

	/// Halve the key (logical shift right by one)
	pub fn half(self) -> Key {
		let l = self.limbs();
		let mut out = [0u32; 5];
		for i in 0..5 {
			out[i] = l[i] >> 1;
			if i + 1 < 5 {
				out[i] |= (l[i + 1] & 1) << 31;
			}
		}
		Key::from_limbs(out)
	}

	/// Compute `self * num / den` without overflowing. Requires `num <= den`.
	pub fn scale(self, num: u32, den: u32) -> Key {
		assert!(num <= den && den != 0);
		let l = self.limbs();
		let mut prod = [0u32; 6];
		let mut carry = 0u64;
		for i in 0..5 {
			let v = l[i] as u64 * num as u64 + carry;
			prod[i] = v as u32;
			carry = v >> 32;
		}
		prod[5] = carry as u32;

		let mut out = [0u32; 6];
		let mut rem = 0u64;
		for i in (0..6).rev() {
			let cur = (rem << 32) | prod[i] as u64;
			out[i] = (cur / den as u64) as u32;
			rem = cur % den as u64;
		}
		Key::from_limbs([out[0], out[1], out[2], out[3], out[4]])
	}

	/// Decimal form, used by the `range_info` file
	pub fn to_decimal(self) -> String {
		let mut l = self.limbs();
		let mut digits = Vec::new();
		loop {
			let mut rem = 0u64;
			let mut all_zero = true;
			for i in (0..5).rev() {
				let cur = (rem << 32) | l[i] as u64;
				l[i] = (cur / 10) as u32;
				rem = cur % 10;
				if l[i] != 0 {
					all_zero = false;
				}
			}
			digits.push(b'0' + rem as u8);
			if all_zero {
				break;
			}
		}
		digits.reverse();
		String::from_utf8(digits).unwrap()
	}

	pub fn from_decimal(s: &str) -> Result<Self, Error> {
		if s.is_empty() || !s.bytes().all(|c| c.is_ascii_digit()) {
			return Err(Error::Message(format!("Invalid decimal key \"{}\"", s)));
		}
		let mut l = [0u32; 5];
		for c in s.bytes() {
			let mut carry = (c - b'0') as u64;
			for limb in l.iter_mut() {
				let v = *limb as u64 * 10 + carry;
				*limb = v as u32;
				carry = v >> 32;
			}
			if carry != 0 {
				return Err(Error::Message(format!("Decimal key \"{}\" overflows", s)));
			}
		}
		Ok(Key::from_limbs(l))
	}
}

impl fmt::Display for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl Serialize for Key {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_bytes(&self.0[..])
	}
}

struct KeyVisitor;

impl<'de> Visitor<'de> for KeyVisitor {
	type Value = Key;

	fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "a 20-byte ring key")
	}

	fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<Key, E> {
		Key::from_slice(v).map_err(|e| E::custom(format!("{}", e)))
	}

	fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Key, A::Error> {
		let mut b = [0u8; KEY_LEN];
		for (i, byte) in b.iter_mut().enumerate() {
			*byte = seq
				.next_element()?
				.ok_or_else(|| A::Error::custom(format!("key too short: {} bytes", i)))?;
		}
		Ok(Key(b))
	}
}

impl<'de> Deserialize<'de> for Key {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Key, D::Error> {
		deserializer.deserialize_bytes(KeyVisitor)
	}
}

/// Generate a fresh random master key for a client of `node_name`
pub fn generate_key(node_name: &str) -> Key {
	let mut hasher = Sha1::new();
	hasher.update(node_name.as_bytes());
	hasher.update(thread_rng().gen::<[u8; 16]>());
	let digest = hasher.finalize();
	let mut b = [0u8; KEY_LEN];
	b.copy_from_slice(&digest);
	Key::from_bytes(b)
}

/// Derive the full key set of a data block: the master key followed by
/// `replica_count` replica keys spaced evenly around the ring.
pub fn derive_keys(master: Key, replica_count: u8) -> Vec<Key> {
	let step = Key::MAX.scale(1, replica_count as u32 + 1);
	let mut keys = Vec::with_capacity(replica_count as usize + 1);
	keys.push(master);
	let mut cur = master;
	for _ in 0..replica_count {
		cur = cur.wrapping_add(step);
		keys.push(cur);
	}
	keys
}

/// Key set for a new write: derive from `prime` when the client supplied a
/// key, otherwise generate a fresh master.
pub fn generate_keys(node_name: &str, replica_count: u8, prime: Option<Key>) -> Vec<Key> {
	derive_keys(prime.unwrap_or_else(|| generate_key(node_name)), replica_count)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_hex_round_trip() {
		let k = Key::from_hex("00000000000000000000000000000000000005a4").unwrap();
		assert_eq!(k, Key::from_u64(0x5a4));
		assert_eq!(k.to_hex(), "00000000000000000000000000000000000005a4");
		assert!(Key::from_hex("zz").is_err());
		assert!(Key::from_hex(&"f".repeat(41)).is_err());
	}

	#[test]
	fn test_ordering_is_numeric() {
		assert!(Key::MIN < Key::from_u64(1));
		assert!(Key::from_u64(u64::MAX) < Key::MAX);
		assert!(Key::from_u64(100) < Key::from_u64(101));
	}

	#[test]
	fn test_add_sub() {
		let a = Key::from_u64(1000);
		let b = Key::from_u64(234);
		assert_eq!(a.checked_sub(b).unwrap(), Key::from_u64(766));
		assert_eq!(b.checked_sub(a), None);
		assert_eq!(a.wrapping_add(b), Key::from_u64(1234));
		assert_eq!(Key::MAX.checked_add(Key::from_u64(1)), None);
		assert_eq!(Key::MAX.wrapping_add(Key::from_u64(1)), Key::MIN);
		assert_eq!(Key::MIN.pred(), None);
		assert_eq!(Key::MAX.succ(), None);

		// carry across limb boundaries
		let c = Key::from_u64(u64::MAX);
		assert_eq!(c.succ().unwrap().pred().unwrap(), c);
	}

	#[test]
	fn test_half_is_midpoint() {
		let half = Key::MAX.half();
		let other = Key::MAX.checked_sub(half).unwrap();
		// MAX is odd so both halves meet at the middle
		assert_eq!(half.succ().unwrap(), other);
		assert_eq!(Key::from_u64(14).half(), Key::from_u64(7));
	}

	#[test]
	fn test_scale() {
		assert_eq!(Key::from_u64(200).scale(15, 100), Key::from_u64(30));
		assert_eq!(Key::MAX.scale(1, 1), Key::MAX);
		// 2^160-1 scaled by 1/2 == MAX >> 1
		assert_eq!(Key::MAX.scale(1, 2), Key::MAX.half());
	}

	#[test]
	fn test_decimal_round_trip() {
		for k in [Key::MIN, Key::MAX, Key::from_u64(100500), Key::sha1_of(b"x")] {
			assert_eq!(Key::from_decimal(&k.to_decimal()).unwrap(), k);
		}
		assert_eq!(Key::MIN.to_decimal(), "0");
		assert_eq!(
			Key::MAX.to_decimal(),
			"1461501637330902918203684832716283019655932542975"
		);
		assert!(Key::from_decimal("").is_err());
		assert!(Key::from_decimal("12a").is_err());
	}

	#[test]
	fn test_derive_keys() {
		let master = Key::sha1_of(b"some block");
		let keys = derive_keys(master, 2);
		assert_eq!(keys.len(), 3);
		assert_eq!(keys[0], master);
		// evenly spaced: the step between successive keys is constant
		let step = Key::MAX.scale(1, 3);
		assert_eq!(keys[1], master.wrapping_add(step));
		assert_eq!(keys[2], keys[1].wrapping_add(step));
		// all distinct
		assert_ne!(keys[0], keys[1]);
		assert_ne!(keys[1], keys[2]);
	}

	#[test]
	fn test_generate_keys_prime() {
		let prime = Key::from_u64(23412);
		let keys = generate_keys("node_1986", 2, Some(prime));
		assert_eq!(keys[0], prime);
		assert_eq!(keys, derive_keys(prime, 2));
		// without a prime key, a random master is generated
		let k1 = generate_keys("node_1986", 2, None);
		let k2 = generate_keys("node_1986", 2, None);
		assert_ne!(k1[0], k2[0]);
	}
}

//! Data-block operations: node-to-node block transfer and the
//! client-facing read/write/delete path

use std::fs;
use std::sync::Arc;

use ringstore_block::{check_raw_data, ContentClass, DataBlock, DataBlockHeader, HeaderMatch, HEADER_LEN};
use ringstore_rpc::{BinarySource, RequestStream};
use ringstore_util::error::{Error, OkOrMessage};
use ringstore_util::key::{derive_keys, generate_key, generate_keys, Key};
use ringstore_util::MIN_REPLICA_COUNT;

use crate::operator::DhtOperator;
use crate::proto::*;

use super::{ok_body, ok_empty, OpResult};

/// Store one data block (or metadata archive) locally, honoring
/// `init_block` first-write and `carefully_save` owner/time checks
#[allow(clippy::too_many_arguments)]
pub async fn put_data_block(
	op: &Arc<DhtOperator>,
	key: Key,
	class: ContentClass,
	user_id_hash: Option<Key>,
	init_block: bool,
	carefully_save: bool,
	stored_unixtime: Option<f64>,
	data: Option<&mut RequestStream>,
) -> OpResult {
	let stream = data.ok_or_message("Binary data not found")?;
	let db_path = op.db_path(key, class, true)?;

	if class.is_metadata() {
		if init_block && db_path.exists() {
			return Err(Error::AlreadyExists("Already exists!".into()));
		}
		let archive = stream.read_all().await?;
		op.md_cache.restore(&db_path, &archive)?;
		return ok_empty();
	}

	let mut db = DataBlock::new(db_path, op.locks());
	if db.exists() {
		if init_block {
			return Err(Error::AlreadyExists("Already exists!".into()));
		}
		if carefully_save {
			db.block()?;
			db.header()?.matches(&HeaderMatch {
				owner_hash: user_id_hash,
				stored_unixtime,
				..Default::default()
			})?;
		}
	}

	let payload = stream.read_all().await?;
	db.write(&payload, Some(0), true)?;
	ok_empty()
}

/// Stream a block's payload back, verifying the header and (optionally)
/// the owner first
pub fn get_data_block(
	op: &Arc<DhtOperator>,
	key: Key,
	class: ContentClass,
	user_id_hash: Option<Key>,
) -> OpResult {
	let db_path = op.db_path(key, class, false)?;
	let mut db = DataBlock::new(db_path.clone(), op.locks());
	if !db.exists() {
		return Err(Error::NoData(key));
	}

	let header = db.header()?;
	if user_id_hash.is_some() {
		header.matches(&HeaderMatch::owner(user_id_hash))?;
	}

	Ok((
		DhtResponse::ok().with_body(ReplyBody::Checksum {
			checksum: header.checksum,
		}),
		Some(BinarySource::File {
			path: db_path,
			offset: HEADER_LEN as u64,
			remove_on_close: false,
		}),
	))
}

/// Verify owner and unlink; no trash
pub fn delete_data_block(
	op: &Arc<DhtOperator>,
	key: Key,
	class: ContentClass,
	user_id_hash: Option<Key>,
	carefully_delete: bool,
) -> OpResult {
	let db_path = op.db_path(key, class, false)?;
	if !db_path.exists() {
		return Err(Error::NoData(key));
	}

	if carefully_delete && !class.is_metadata() {
		let mut db = DataBlock::new(db_path, op.locks());
		db.header()?.matches(&HeaderMatch::owner(user_id_hash))?;
	}

	op.get_dht_range().remove_db(key, class)?;
	ok_empty()
}

/// Stream the stored block through SHA-1 and compare with its header
/// (and with the caller's expected checksum when supplied). For metadata
/// stores, compare the store checksums instead.
pub fn check_data_block(
	op: &Arc<DhtOperator>,
	key: Key,
	class: ContentClass,
	checksum: Option<Key>,
) -> OpResult {
	let db_path = op.db_path(key, class, false)?;

	if class.is_metadata() {
		if !db_path.exists() {
			return Err(Error::NoData(key));
		}
		let actual = op.md_cache.with_store(&db_path, |store| store.checksum())?;
		if let Some(expected) = checksum {
			if actual != expected {
				return Err(Error::InvalidDataBlock(format!(
					"Metadata checksum {} != {}",
					expected, actual
				)));
			}
		}
		return ok_empty();
	}

	if !db_path.exists() {
		return Err(Error::NoData(key));
	}
	let mut file = fs::File::open(&db_path)?;
	check_raw_data(&mut file, checksum)?;
	ok_empty()
}

/// Client write: derive the key set, stage the payload, fan out to the
/// replica owners and require `wait_writes_count` acknowledged writes
pub async fn client_put(
	op: &Arc<DhtOperator>,
	key: Option<Key>,
	replica_count: u8,
	wait_writes_count: u8,
	init_block: bool,
	user_id: &str,
	data: Option<&mut RequestStream>,
) -> OpResult {
	let stream = data.ok_or_message("No binary data found!")?;
	if wait_writes_count > replica_count + 1 {
		return Err(Error::Message(
			"Cannot wait for more replicas than are saved!".into(),
		));
	}
	if replica_count < MIN_REPLICA_COUNT {
		return Err(Error::Message(format!(
			"Minimum replica count is equal to {}!",
			MIN_REPLICA_COUNT
		)));
	}

	let keys = generate_keys(&op.node_name, replica_count, key);
	let owner_hash = Key::sha1_of(user_id.as_bytes());
	let tmp_path = op.get_dht_range().tmp_path(keys[0]);

	let result = client_put_inner(
		op,
		&keys,
		replica_count,
		wait_writes_count,
		init_block,
		owner_hash,
		&tmp_path,
		stream,
	)
	.await;

	// the staging file is gone after a successful local rename; otherwise
	// clean it up here
	if let Err(e) = DataBlock::new(tmp_path, op.locks()).remove() {
		warn!("Removing staging file failed: {}", e);
	}

	match result {
		Ok(body) => ok_body(body),
		Err(e @ Error::AlreadyExists(_)) => Err(e),
		Err(e) => {
			let mut err_msg = format!("Write error [key={}]: {}", keys[0], e);
			if init_block {
				if let Err(del_err) =
					client_delete_inner(op, keys[0], replica_count, Some(owner_hash)).await
				{
					err_msg += &format!("\nDelete saved DBs error: {}", del_err);
				}
			}
			Err(Error::Message(err_msg))
		}
	}
}

#[allow(clippy::too_many_arguments)]
async fn client_put_inner(
	op: &Arc<DhtOperator>,
	keys: &[Key],
	replica_count: u8,
	wait_writes_count: u8,
	init_block: bool,
	owner_hash: Key,
	tmp_path: &std::path::Path,
	stream: &mut RequestStream,
) -> Result<ReplyBody, Error> {
	let mut master_db = DataBlock::new(op.db_path(keys[0], ContentClass::Master, true)?, op.locks());
	if master_db.exists() {
		if init_block {
			return Err(Error::AlreadyExists("[1] Already exists!".into()));
		}
		master_db.header()?.matches(&HeaderMatch::owner(Some(owner_hash)))?;
	}
	master_db.block()?;

	// stage: reserved header space, then the payload, then the real header
	let mut tmp_db = DataBlock::new(tmp_path.to_path_buf(), op.locks());
	tmp_db.write(&[0u8; HEADER_LEN], None, true)?;
	let payload = stream.read_all().await?;
	let checksum = Key::sha1_of(&payload);
	tmp_db.write(&payload, None, false)?;
	let header = DataBlockHeader::new(keys[0], replica_count, checksum, owner_hash);
	tmp_db.write(&header.pack(), Some(0), false)?;
	let size = tmp_db.size()? - HEADER_LEN as u64;

	let mut succ_count = 0u32;
	let mut errors: Vec<String> = Vec::new();
	let mut local_save: Vec<(Key, ContentClass)> = Vec::new();

	for (i, key) in keys.iter().enumerate() {
		let class = if i == 0 {
			ContentClass::Master
		} else {
			ContentClass::Replica
		};
		let h_range = match op.find_range(*key) {
			Some(r) => r,
			None => {
				errors.push(format!("No hash range found for key={}!", key));
				continue;
			}
		};
		let msg = DhtRpc::PutDataBlock {
			key: *key,
			class,
			user_id_hash: Some(owner_hash),
			init_block,
			carefully_save: true,
			stored_unixtime: None,
		};

		if h_range.node_addr == op.self_addr {
			local_save.push((*key, class));
			succ_count += 1;
		} else if succ_count >= wait_writes_count as u32 {
			// enough writes acknowledged: fan out in the background from
			// a hardlink of the staging file
			let link = tmp_db.hardlink()?;
			let op2 = op.clone();
			let addr = h_range.node_addr;
			tokio::spawn(async move {
				let source = BinarySource::File {
					path: link,
					offset: 0,
					remove_on_close: true,
				};
				match op2.call_node(addr, msg, Some(source)).await {
					Ok(answer) if answer.resp.is_ok() => {}
					Ok(answer) => warn!(
						"Background PutDataBlock on {} returned [{}] {}",
						addr, answer.resp.code, answer.resp.message
					),
					Err(e) => warn!("Background PutDataBlock on {} failed: {}", addr, e),
				}
			});
		} else {
			let source = BinarySource::from_file(tmp_path.to_path_buf());
			match op.call_node(h_range.node_addr, msg, Some(source)).await {
				Ok(answer) if answer.resp.code == codes::ALREADY_EXISTS && init_block => {
					return Err(Error::AlreadyExists("[2] Already exists!".into()));
				}
				Ok(answer) if answer.resp.is_ok() => succ_count += 1,
				Ok(answer) => {
					errors.push(format!("From {}: {}", h_range.node_addr, answer.resp.message))
				}
				Err(e) => errors.push(format!("From {}: {}", h_range.node_addr, e)),
			}
		}
	}

	let mut cur_src = tmp_path.to_path_buf();
	for (i, (key, class)) in local_save.iter().enumerate() {
		let save = || -> Result<std::path::PathBuf, Error> {
			let db_path = op.db_path(*key, *class, true)?;
			let mut db = DataBlock::new(db_path.clone(), op.locks());
			if *key != keys[0] && db.exists() {
				if init_block {
					return Err(Error::AlreadyExists(format!(
						"Key {} with class {} already exists",
						key, class
					)));
				}
				db.header()?.matches(&HeaderMatch::owner(Some(owner_hash)))?;
			}
			db.close();
			Ok(db_path)
		};
		match save() {
			Ok(db_path) => {
				let moved = if i == 0 {
					fs::rename(&cur_src, &db_path).map_err(Error::from)
				} else {
					fs::copy(&cur_src, &db_path).map(|_| ()).map_err(Error::from)
				};
				match moved {
					Ok(()) => cur_src = db_path,
					Err(e) => {
						succ_count = succ_count.saturating_sub(1);
						errors.push(format!("Saving data block to local range error: {}", e));
					}
				}
			}
			Err(e) => {
				succ_count = succ_count.saturating_sub(1);
				errors.push(format!("Saving data block to local range error: {}", e));
			}
		}
	}

	if succ_count < wait_writes_count as u32 {
		return Err(Error::Message(errors.join("\n")));
	}

	Ok(ReplyBody::PutResult {
		key: keys[0],
		checksum,
		size,
	})
}

/// Client delete: fan the owner-checked removal out to every replica owner
pub async fn client_delete(
	op: &Arc<DhtOperator>,
	key: Key,
	replica_count: u8,
	user_id_hash: Option<Key>,
) -> OpResult {
	client_delete_inner(op, key, replica_count, user_id_hash).await?;
	ok_empty()
}

pub(crate) async fn client_delete_inner(
	op: &Arc<DhtOperator>,
	key: Key,
	replica_count: u8,
	user_id_hash: Option<Key>,
) -> Result<(), Error> {
	let keys = derive_keys(key, replica_count);
	let mut errors: Vec<String> = Vec::new();

	for (i, key) in keys.iter().enumerate() {
		let class = if i == 0 {
			ContentClass::Master
		} else {
			ContentClass::Replica
		};
		let h_range = match op.find_range(*key) {
			Some(r) => r,
			None => {
				errors.push(format!("No hash range found for key={}!", key));
				continue;
			}
		};
		let msg = DhtRpc::DeleteDataBlock {
			key: *key,
			class,
			user_id_hash,
			carefully_delete: true,
		};
		if let Err(e) = op.call_node_ok(h_range.node_addr, msg, None).await {
			errors.push(format!(
				"DeleteDataBlock failed at {}: {}",
				h_range.node_addr, e
			));
		}
	}

	if errors.is_empty() {
		Ok(())
	} else {
		Err(Error::Message(errors.join("\n")))
	}
}

/// Resolve the full key set and its current owners; without a key,
/// enroll the caller with a freshly generated master key
pub fn get_keys_info(op: &Arc<DhtOperator>, key: Option<Key>, replica_count: u8) -> OpResult {
	let keys = match key {
		Some(k) => derive_keys(k, replica_count),
		None => vec![generate_key(&op.node_name)],
	};

	let mut message = String::new();
	let mut ret_keys = Vec::with_capacity(keys.len());
	for (i, key) in keys.iter().enumerate() {
		let class = if i == 0 {
			ContentClass::Master
		} else {
			ContentClass::Replica
		};
		match op.find_range(*key) {
			Some(r) => ret_keys.push((*key, class, r.node_addr)),
			None => message += &format!("No hash range found for key={}!\n", key),
		}
	}

	let mut resp = DhtResponse::ok().with_body(ReplyBody::KeysInfo { keys: ret_keys });
	resp.message = message;
	Ok((resp, None))
}

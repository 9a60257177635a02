//! User-metadata operations: quota provisioning, path-tree updates with
//! master/replica fan-out, and restore from replicas

use std::sync::Arc;

use ringstore_block::{ContentClass, DataBlock, DataBlockHeader};
use ringstore_metadata::{MdDataBlockInfo, ItemKind, STORE_INFO_FILE};
use ringstore_rpc::{BinarySource, RequestStream};
use ringstore_util::error::Error;
use ringstore_util::key::{derive_keys, Key};
use ringstore_util::MIN_REPLICA_COUNT;

use crate::operator::DhtOperator;
use crate::proto::*;

use super::{ok_body, ok_empty, OpResult};

/// Set a user's quota on every metadata owner; `save_key` narrows the
/// write to one local store when a peer fans the call out
pub async fn update_user_profile(
	op: &Arc<DhtOperator>,
	user_id_hash: Key,
	storage_size: u64,
	bin_flags: u16,
	md_replica_count: u8,
	save_key: Option<Key>,
) -> OpResult {
	let keys = derive_keys(user_id_hash, md_replica_count);
	let mut saved_count = 0;

	for (i, key) in keys.iter().enumerate() {
		if let Some(sk) = save_key {
			if *key != sk {
				continue;
			}
		}
		let class = if i == 0 {
			ContentClass::MdMaster
		} else {
			ContentClass::MdReplica
		};
		let h_range = op
			.find_range(*key)
			.ok_or_else(|| Error::Message(format!("No hash range found for key {}!", key)))?;

		if h_range.node_addr == op.self_addr {
			update_local_profile(
				op,
				keys[0],
				*key,
				class,
				user_id_hash,
				md_replica_count,
				storage_size,
				bin_flags,
			)?;
			saved_count += 1;
			continue;
		}

		let msg = DhtRpc::UpdateUserProfile {
			user_id_hash,
			storage_size,
			bin_flags,
			md_replica_count,
			save_key: Some(*key),
		};
		op.call_node_ok(h_range.node_addr, msg, None)
			.await
			.map_err(|e| {
				Error::Message(format!(
					"Update user profile error at {}: {}",
					h_range.node_addr, e
				))
			})?;
		saved_count += 1;
	}

	if save_key.is_some() && saved_count == 0 {
		return Err(Error::Message(format!(
			"No local key for user {} found!",
			user_id_hash
		)));
	}
	ok_empty()
}

#[allow(clippy::too_many_arguments)]
fn update_local_profile(
	op: &Arc<DhtOperator>,
	master_key: Key,
	key: Key,
	class: ContentClass,
	user_id_hash: Key,
	md_replica_count: u8,
	storage_size: u64,
	bin_flags: u16,
) -> Result<(), Error> {
	let db_path = op.db_path(key, class, true)?;
	op.md_cache.with_store(&db_path, |store| {
		let mut user_info = store.get_user_info()?;
		user_info.user_id_hash = user_id_hash;
		user_info.storage_size = storage_size;
		user_info.flags = bin_flags;
		store.update_user_info(&user_info)
	})?;

	// header used by the repair pass to place and verify this store
	let header = DataBlockHeader::new(master_key, md_replica_count, Key::MIN, user_id_hash);
	let mut info_db = DataBlock::new(db_path.join(STORE_INFO_FILE), op.locks());
	info_db.write(&header.pack(), Some(0), true)?;
	Ok(())
}

/// Apply path-tree changes on the owning store and fan them out to the
/// replica stores. A master store lost on disk is transparently restored
/// from its replicas first.
pub async fn update_metadata(
	op: &Arc<DhtOperator>,
	user_id_hash: Key,
	key: Option<Key>,
	add_list: Vec<(String, Vec<MdDataBlockInfo>)>,
	rm_list: Vec<String>,
) -> OpResult {
	match try_update(op, user_id_hash, key, &add_list, &rm_list, false).await {
		Err(Error::MdNotInitialized) if key.is_none() => {
			info!(
				"User metadata {} is not initialized! Trying to restore from replicas",
				user_id_hash
			);
			let keys = derive_keys(user_id_hash, MIN_REPLICA_COUNT);
			for repl_key in &keys[1..] {
				if !restore_from_replica(op, user_id_hash, *repl_key).await {
					continue;
				}
				match try_update(op, user_id_hash, key, &add_list, &rm_list, true).await {
					Err(Error::MdNotInitialized) => continue,
					other => return other,
				}
			}
			Err(Error::MdNotInitialized)
		}
		other => other,
	}
}

async fn try_update(
	op: &Arc<DhtOperator>,
	user_id_hash: Key,
	key: Option<Key>,
	add_list: &[(String, Vec<MdDataBlockInfo>)],
	rm_list: &[String],
	reinit_md: bool,
) -> OpResult {
	let db_path = match key {
		Some(k) => op.db_path(k, ContentClass::MdReplica, true)?,
		None => {
			let h_range = op.find_range(user_id_hash).ok_or_else(|| {
				Error::Message(format!("No hash range found for key {}!", user_id_hash))
			})?;
			if h_range.node_addr != op.self_addr {
				return Err(Error::Message("Not my range!".into()));
			}
			op.db_path(user_id_hash, ContentClass::MdMaster, true)?
		}
	};

	if reinit_md {
		op.md_cache.close_store(&db_path);
	}

	op.md_cache.with_store(&db_path, |store| {
		for rm_path in rm_list {
			store.remove_path(rm_path)?;
		}
		for (f_path, blocks) in add_list {
			store.update_path(f_path, blocks)?;
		}
		Ok(())
	})?;

	if key.is_none() {
		// fan the same changes out to the replica stores
		let keys = derive_keys(user_id_hash, MIN_REPLICA_COUNT);
		for repl_key in &keys[1..] {
			let h_range = op.find_range(*repl_key).ok_or_else(|| {
				Error::Message(format!("No hash range found for key {}!", repl_key))
			})?;
			let msg = DhtRpc::UpdateMetadata {
				user_id_hash,
				key: Some(*repl_key),
				add_list: add_list.to_vec(),
				rm_list: rm_list.to_vec(),
			};
			let op2 = op.clone();
			let addr = h_range.node_addr;
			tokio::spawn(async move {
				match op2.call_node(addr, msg, None).await {
					Ok(answer) if answer.resp.is_ok() => {}
					Ok(answer) => warn!(
						"UpdateMetadata replica fan-out to {} returned [{}] {}",
						addr, answer.resp.code, answer.resp.message
					),
					Err(e) => warn!("UpdateMetadata replica fan-out to {} failed: {}", addr, e),
				}
			});
		}
	}
	ok_empty()
}

/// Ask the owner of one replica key to push its copy back to the master
/// store; true on success
async fn restore_from_replica(op: &Arc<DhtOperator>, user_id_hash: Key, repl_key: Key) -> bool {
	let h_range = match op.find_range(repl_key) {
		Some(r) => r,
		None => return false,
	};
	let msg = DhtRpc::RestoreMetadata {
		user_id_hash,
		key: repl_key,
		class: ContentClass::MdReplica,
	};
	match op.call_node_ok(h_range.node_addr, msg, None).await {
		Ok(_) => {
			info!(
				"User metadata {} restored from {}",
				user_id_hash, h_range.node_addr
			);
			true
		}
		Err(e) => {
			warn!(
				"User metadata {} not restored from {}: {}",
				user_id_hash, h_range.node_addr, e
			);
			false
		}
	}
}

/// Push our replica store back to the master owner as an archive
pub async fn restore_metadata(
	op: &Arc<DhtOperator>,
	user_id_hash: Key,
	key: Key,
	class: ContentClass,
) -> OpResult {
	let db_path = op.db_path(key, class, false)?;
	op.md_cache.close_store(&db_path);

	let storage_size = op
		.md_cache
		.with_store(&db_path, |store| Ok(store.get_user_info()?.storage_size))?;
	if storage_size == 0 {
		return Err(Error::MdNotInitialized);
	}

	let archive = op.md_cache.snapshot(&db_path)?;
	let h_range = op
		.find_range(user_id_hash)
		.ok_or_else(|| Error::Message(format!("No hash range found for key {}!", user_id_hash)))?;

	let msg = DhtRpc::PutDataBlock {
		key: user_id_hash,
		class: ContentClass::MdMaster,
		user_id_hash: None,
		init_block: false,
		carefully_save: false,
		stored_unixtime: None,
	};
	op.call_node_ok(h_range.node_addr, msg, Some(BinarySource::Buf(archive)))
		.await?;
	ok_empty()
}

/// Client-facing composite: store a data block, then append it to the
/// object's block list; roll the block back if the metadata update fails
#[allow(clippy::too_many_arguments)]
pub async fn put_object_part(
	op: &Arc<DhtOperator>,
	obj_path: &str,
	_seek: u64,
	replica_count: u8,
	wait_writes_count: u8,
	key: Option<Key>,
	init_block: bool,
	user_id: &str,
	data: Option<&mut RequestStream>,
) -> OpResult {
	let (put_resp, _) = super::data_access::client_put(
		op,
		key,
		replica_count,
		wait_writes_count,
		init_block,
		user_id,
		data,
	)
	.await?;
	let (master_key, size) = match &put_resp.body {
		ReplyBody::PutResult { key, size, .. } => (*key, *size),
		_ => return Err(Error::Message("Malformed ClientPutData reply".into())),
	};

	let owner_hash = Key::sha1_of(user_id.as_bytes());
	let update = async {
		let h_range = op.find_range(owner_hash).ok_or_else(|| {
			Error::Message(format!("No hash range found for key={}!", owner_hash))
		})?;
		let add_list = vec![(
			obj_path.to_string(),
			vec![MdDataBlockInfo {
				db_key: master_key,
				replica_count,
				size: size as u32,
			}],
		)];
		let msg = DhtRpc::UpdateMetadata {
			user_id_hash: owner_hash,
			key: None,
			add_list,
			rm_list: vec![],
		};
		op.call_node_ok(h_range.node_addr, msg, None)
			.await
			.map_err(|e| {
				Error::Message(format!("UpdateMetadata failed at {}: {}", h_range.node_addr, e))
			})?;
		Ok::<(), Error>(())
	};

	match update.await {
		Ok(()) => Ok((put_resp, None)),
		Err(e) => {
			let mut err_msg = format!("{}", e);
			if let Err(del_err) = super::data_access::client_delete_inner(
				op,
				master_key,
				replica_count,
				Some(owner_hash),
			)
			.await
			{
				err_msg += &format!("\nDelete saved DBs error: {}", del_err);
			}
			Err(Error::Message(err_msg))
		}
	}
}

/// Resolve the user's metadata owner (master first, replicas as
/// fallback) and return the path information
pub async fn get_object_info(
	op: &Arc<DhtOperator>,
	obj_path: &str,
	req_user_info: bool,
	md_replica_count: u8,
	get_key: Option<Key>,
	user_id_hash: Key,
) -> OpResult {
	let keys = derive_keys(user_id_hash, md_replica_count);
	let mut errors: Vec<String> = Vec::new();

	for (i, key) in keys.iter().enumerate() {
		if let Some(gk) = get_key {
			if gk != *key {
				continue;
			}
		}
		let class = if i == 0 {
			ContentClass::MdMaster
		} else {
			ContentClass::MdReplica
		};
		let h_range = match op.find_range(*key) {
			Some(r) => r,
			None => {
				errors.push(format!("No hash range found for key {}!", key));
				continue;
			}
		};

		if h_range.node_addr == op.self_addr {
			match local_object_info(op, *key, class, obj_path, req_user_info) {
				Ok(body) => return ok_body(body),
				Err(e) => {
					errors.push(format!("{}", e));
					continue;
				}
			}
		}

		let msg = DhtRpc::GetObjectInfo {
			obj_path: obj_path.to_string(),
			req_user_info,
			md_replica_count,
			get_key: Some(*key),
			user_id_hash: Some(user_id_hash),
			user_id: None,
		};
		match op.call_node_ok(h_range.node_addr, msg, None).await {
			Ok(answer) => return ok_body(answer.resp.body),
			Err(e) => errors.push(format!(
				"Get path info error at {}: {}",
				h_range.node_addr, e
			)),
		}
	}

	Err(Error::Message(errors.join("\n")))
}

fn local_object_info(
	op: &Arc<DhtOperator>,
	key: Key,
	class: ContentClass,
	obj_path: &str,
	req_user_info: bool,
) -> Result<ReplyBody, Error> {
	let db_path = op.db_path(key, class, false)?;
	if !db_path.exists() {
		return Err(Error::NotFound(format!("No metadata store for key {}", key)));
	}
	op.md_cache.with_store(&db_path, |store| {
		let user_info = if req_user_info {
			let info = store.get_user_info()?;
			Some(UserInfoView {
				storage_size: info.storage_size,
				used_size: info.used_size,
				flags: info.flags,
			})
		} else {
			None
		};
		let path_info = store.get_path_info(obj_path)?;
		let data_blocks = match path_info.kind {
			ItemKind::File => Some(store.get_data_blocks(obj_path)?),
			ItemKind::Dir => None,
		};
		Ok(ReplyBody::ObjectInfo {
			user_info,
			path_info,
			data_blocks,
		})
	})
}

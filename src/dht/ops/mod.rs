//! Operation handlers: the thin mapping from wire methods to component
//! calls, with per-method capability checks

pub mod data_access;
pub mod metadata_ops;
pub mod mgmt;

use std::sync::Arc;

use async_trait::async_trait;

use ringstore_rpc::{BinarySource, EndpointHandler, RequestStream, Role};
use ringstore_util::error::Error;

use crate::operator::DhtOperator;
use crate::proto::*;

/// Capability sets per method, mirroring the roles that may invoke it
fn role_allowed(msg: &DhtRpc, role: Role) -> bool {
	use DhtRpc::*;
	match msg {
		ClientPutData { .. } | ClientDeleteData { .. } | GetKeysInfo { .. }
		| GetDataBlock { .. } => matches!(role, Role::Node | Role::Client),
		PutObjectPart { .. } => matches!(role, Role::Client),
		GetObjectInfo { .. } => matches!(role, Role::Node | Role::Client),
		NodeStatistic => true,
		RepairDataBlocks { .. } => matches!(role, Role::Node | Role::Monitor),
		Notify(_) => matches!(role, Role::Node | Role::Monitor),
		_ => matches!(role, Role::Node),
	}
}

pub(crate) type OpResult = Result<(DhtResponse, Option<BinarySource>), Error>;

pub(crate) fn ok_body(body: ReplyBody) -> OpResult {
	Ok((DhtResponse::ok().with_body(body), None))
}

pub(crate) fn ok_empty() -> OpResult {
	Ok((DhtResponse::ok(), None))
}

#[async_trait]
impl EndpointHandler<DhtRpc> for DhtOperator {
	type Body = ReplyBody;

	async fn handle(
		self: &Arc<Self>,
		req: DhtRequest,
		data: Option<&mut RequestStream>,
	) -> (DhtResponse, Option<BinarySource>) {
		let method = req.msg.method();
		if !role_allowed(&req.msg, req.role) {
			return (
				DhtResponse::error(
					codes::PERMISSION_DENIED,
					format!("Method {} is not allowed for role {:?}", method, req.role),
				),
				None,
			);
		}

		match dispatch(self, req, data).await {
			Ok((resp, resp_data)) => (resp, resp_data),
			Err(e) => {
				debug!("{} failed: {}", method, e);
				(DhtResponse::error(error_code(&e), format!("{}", e)), None)
			}
		}
	}
}

async fn dispatch(
	op: &Arc<DhtOperator>,
	req: DhtRequest,
	data: Option<&mut RequestStream>,
) -> OpResult {
	let sender = req.sender;
	let role = req.role;
	match req.msg {
		DhtRpc::PutDataBlock {
			key,
			class,
			user_id_hash,
			init_block,
			carefully_save,
			stored_unixtime,
		} => {
			data_access::put_data_block(
				op,
				key,
				class,
				user_id_hash,
				init_block,
				carefully_save,
				stored_unixtime,
				data,
			)
			.await
		}
		DhtRpc::GetDataBlock {
			key,
			class,
			user_id_hash,
		} => data_access::get_data_block(op, key, class, user_id_hash),
		DhtRpc::DeleteDataBlock {
			key,
			class,
			user_id_hash,
			carefully_delete,
		} => data_access::delete_data_block(op, key, class, user_id_hash, carefully_delete),
		DhtRpc::CheckDataBlock {
			key,
			class,
			checksum,
		} => data_access::check_data_block(op, key, class, checksum),
		DhtRpc::ClientPutData {
			key,
			replica_count,
			wait_writes_count,
			init_block,
			user_id,
		} => {
			data_access::client_put(
				op,
				key,
				replica_count,
				wait_writes_count,
				init_block,
				&user_id,
				data,
			)
			.await
		}
		DhtRpc::ClientDeleteData {
			key,
			replica_count,
			user_id_hash,
			user_id,
		} => {
			let owner = match role {
				Role::Client => Some(ringstore_util::key::Key::sha1_of(
					user_id.unwrap_or_default().as_bytes(),
				)),
				_ => user_id_hash,
			};
			data_access::client_delete(op, key, replica_count, owner).await
		}
		DhtRpc::GetKeysInfo { key, replica_count } => {
			data_access::get_keys_info(op, key, replica_count)
		}
		DhtRpc::UpdateHashRangeTable { append, remove } => {
			mgmt::update_hash_range_table(op, &remove, &append)
		}
		DhtRpc::CheckHashRangeTable {
			mod_index,
			ranges_count,
			range_start,
			range_end,
		} => mgmt::check_hash_range_table(op, sender, mod_index, ranges_count, range_start, range_end),
		DhtRpc::GetRangesTable => mgmt::get_ranges_table(op),
		DhtRpc::SplitRangeRequest { start_key, end_key } => {
			mgmt::split_range_request(op, start_key, end_key)
		}
		DhtRpc::SplitRangeCancel => mgmt::split_range_cancel(op),
		DhtRpc::PullSubrangeRequest {
			start_key,
			end_key,
			subrange_size,
		} => mgmt::pull_subrange_request(op, subrange_size, start_key, end_key).await,
		DhtRpc::GetRangeDataRequest => mgmt::get_range_data_request(op, sender).await,
		DhtRpc::UpdateUserProfile {
			user_id_hash,
			storage_size,
			bin_flags,
			md_replica_count,
			save_key,
		} => {
			metadata_ops::update_user_profile(
				op,
				user_id_hash,
				storage_size,
				bin_flags,
				md_replica_count,
				save_key,
			)
			.await
		}
		DhtRpc::UpdateMetadata {
			user_id_hash,
			key,
			add_list,
			rm_list,
		} => metadata_ops::update_metadata(op, user_id_hash, key, add_list, rm_list).await,
		DhtRpc::RestoreMetadata {
			user_id_hash,
			key,
			class,
		} => metadata_ops::restore_metadata(op, user_id_hash, key, class).await,
		DhtRpc::PutObjectPart {
			obj_path,
			seek,
			replica_count,
			wait_writes_count,
			key,
			init_block,
			user_id,
		} => {
			metadata_ops::put_object_part(
				op,
				&obj_path,
				seek,
				replica_count,
				wait_writes_count,
				key,
				init_block,
				&user_id,
				data,
			)
			.await
		}
		DhtRpc::GetObjectInfo {
			obj_path,
			req_user_info,
			md_replica_count,
			get_key,
			user_id_hash,
			user_id,
		} => {
			let owner = match role {
				Role::Client => {
					ringstore_util::key::Key::sha1_of(user_id.unwrap_or_default().as_bytes())
				}
				_ => user_id_hash.ok_or_else(|| {
					Error::Message("user_id_hash is required for GetObjectInfo".into())
				})?,
			};
			metadata_ops::get_object_info(op, &obj_path, req_user_info, md_replica_count, get_key, owner)
				.await
		}
		DhtRpc::RepairDataBlocks {
			check_range_start,
			check_range_end,
		} => mgmt::repair_data_blocks(op, check_range_start, check_range_end).await,
		DhtRpc::NodeStatistic => mgmt::node_statistic(op),
		DhtRpc::Notify(notification) => mgmt::notify(op, notification),
	}
}

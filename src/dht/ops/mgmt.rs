//! Ring management operations: table convergence, range splits and
//! pulls, statistics and the repair trigger

use std::net::SocketAddr;
use std::sync::Arc;

use ringstore_rpc::BinarySource;
use ringstore_table::HashRange;
use ringstore_util::key::Key;

use crate::operator::DhtOperator;
use crate::proto::*;
use crate::repair::RepairProcess;

use super::{ok_body, ok_empty, OpResult};

pub fn update_hash_range_table(
	op: &Arc<DhtOperator>,
	remove: &[HashRange],
	append: &[HashRange],
) -> OpResult {
	if op.status() == NodeStatus::Destroying {
		return ok_empty();
	}
	match op.apply_table_changes(remove, append) {
		Ok(()) => {
			debug!(
				"RM RANGES: {}",
				remove.iter().map(|r| r.to_str()).collect::<Vec<_>>().join(", ")
			);
			debug!(
				"APP RANGES: {}",
				append.iter().map(|r| r.to_str()).collect::<Vec<_>>().join(", ")
			);
		}
		Err(e) => {
			debug!(
				"UpdateHashRangeTable error: {} STATUS={:?}",
				e,
				op.status()
			);
		}
	}
	ok_empty()
}

/// Compare the sender's table status against ours and tell it whether it
/// must fetch, wait, or is fine (see the convergence protocol)
pub fn check_hash_range_table(
	op: &Arc<DhtOperator>,
	sender: SocketAddr,
	mod_index: u64,
	ranges_count: usize,
	range_start: Key,
	range_end: Key,
) -> OpResult {
	if op.status() == NodeStatus::Initialize {
		let mut resp = DhtResponse::ok();
		resp.message = "Node is not initialized yet!".into();
		return Ok((resp, None));
	}

	let c_mod_index = op.ranges_table.mod_index();
	let c_ranges_count = op.ranges_table.count();

	let found = matches!(
		op.find_range(range_start),
		Some(r) if r.start == range_start && r.end == range_end && r.node_addr == sender
	);

	if !found {
		debug!("CheckHashRangeTable: sender range not found in the local table");
		if ranges_count < c_ranges_count {
			return Ok((
				DhtResponse::error(codes::NEED_UPDATE, "").with_body(ReplyBody::TableStatus {
					mod_index: c_mod_index,
					ranges_count: c_ranges_count,
					force: false,
				}),
				None,
			));
		}
		if ranges_count == c_ranges_count && c_mod_index == mod_index {
			// symmetric disagreement: break the tie by address so that
			// exactly one side refetches
			if sender > op.self_addr {
				return Ok((
					DhtResponse::error(codes::NEED_UPDATE, "").with_body(ReplyBody::TableStatus {
						mod_index: c_mod_index,
						ranges_count: c_ranges_count,
						force: true,
					}),
					None,
				));
			} else if sender < op.self_addr {
				return Ok((DhtResponse::error(codes::JUST_WAIT, ""), None));
			}
		}
	}

	debug!(
		"CheckHashRangeTable: f_mod_index={} c_mod_index={}",
		mod_index, c_mod_index
	);
	if mod_index >= c_mod_index {
		ok_empty()
	} else {
		Ok((
			DhtResponse::error(codes::NEED_UPDATE, "").with_body(ReplyBody::TableStatus {
				mod_index: c_mod_index,
				ranges_count: c_ranges_count,
				force: false,
			}),
			None,
		))
	}
}

pub fn get_ranges_table(op: &Arc<DhtOperator>) -> OpResult {
	let dump = op.ranges_table.dump()?;
	Ok((DhtResponse::ok(), Some(BinarySource::Buf(dump))))
}

/// A joiner asks us to give away a subrange of our local range
pub fn split_range_request(op: &Arc<DhtOperator>, start_key: Key, end_key: Key) -> OpResult {
	let size = op.split_local_range(start_key, end_key)?;

	match op.projected_post_split_percents(size) {
		Ok(projected) if projected <= op.config.dht.allow_used_size_percents => {
			ok_body(ReplyBody::SubrangeSize { size })
		}
		projected => {
			info!(
				"Requested range is too big to give away (projected {:?}), cancelling",
				projected
			);
			op.join_subranges();
			ok_body(ReplyBody::SplitCancelled)
		}
	}
}

pub fn split_range_cancel(op: &Arc<DhtOperator>) -> OpResult {
	info!("Cancelled range splitting! Joining subranges");
	op.join_subranges();
	ok_empty()
}

pub async fn pull_subrange_request(
	op: &Arc<DhtOperator>,
	subrange_size: u64,
	start_key: Key,
	end_key: Key,
) -> OpResult {
	op.extend_range_for_pull(subrange_size, start_key, end_key)
		.await?;
	ok_empty()
}

pub async fn get_range_data_request(op: &Arc<DhtOperator>, sender: SocketAddr) -> OpResult {
	op.send_subrange_data(sender).await?;
	ok_empty()
}

pub async fn repair_data_blocks(
	op: &Arc<DhtOperator>,
	check_range_start: Option<Key>,
	check_range_end: Option<Key>,
) -> OpResult {
	match RepairProcess::new(op.clone())
		.run(check_range_start, check_range_end)
		.await
	{
		Ok(stat) => {
			op.notify(NotifyKind::Info, "RepairDataBlocks", stat.to_string())
				.await;
			ok_body(ReplyBody::RepairStat(stat))
		}
		Err(e) => {
			op.notify(NotifyKind::Alert, "RepairDataBlocks", format!("{}", e))
				.await;
			Err(e)
		}
	}
}

pub fn node_statistic(op: &Arc<DhtOperator>) -> OpResult {
	ok_body(ReplyBody::DhtInfo(op.dht_info()?))
}

pub fn notify(_op: &Arc<DhtOperator>, notification: Notification) -> OpResult {
	info!(
		"[{:?}] {} from {} at {}: {}",
		notification.kind,
		notification.topic,
		notification.provider,
		notification.at,
		notification.message
	);
	ok_empty()
}

//! Periodic background tasks: the ranges-table consistency probe and the
//! disk-pressure / foreign-handoff monitor

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::select;
use tokio::sync::watch;

use ringstore_block::{ContentClass, FsMappedRange};
use ringstore_rpc::BinarySource;
use ringstore_util::background::{Worker, WorkerStatus};
use ringstore_util::error::Error;
use ringstore_util::key::Key;

use crate::operator::DhtOperator;
use crate::proto::*;

/// Probes a neighbour with our table status every
/// `check_hash_table_timeout` seconds, and flushes the metadata store
/// cache on its own slower period
pub struct CheckTableWorker {
	op: Arc<DhtOperator>,
	last_md_flush: Instant,
}

impl CheckTableWorker {
	pub fn new(op: Arc<DhtOperator>) -> Self {
		Self {
			op,
			last_md_flush: Instant::now(),
		}
	}
}

#[async_trait]
impl Worker for CheckTableWorker {
	fn name(&self) -> String {
		"Ranges table checker".into()
	}

	async fn work(&mut self, _must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		let flush_period = Duration::from_secs(self.op.config.dht.flush_md_cache_timeout);
		if self.last_md_flush.elapsed() >= flush_period {
			self.op.md_cache.flush_all();
			self.last_md_flush = Instant::now();
		}

		if !self.op.check_range_table().await {
			info!("Waiting for neighbours");
			tokio::time::sleep(Duration::from_secs(
				self.op.config.dht.init_dht_wait_neighbour_timeout,
			))
			.await;
			return Ok(WorkerStatus::Busy);
		}
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		tokio::time::sleep(Duration::from_secs(
			self.op.config.dht.check_hash_table_timeout,
		))
		.await;
		WorkerStatus::Busy
	}
}

/// Every `monitor_dht_ranges_timeout` seconds (or sooner when forced):
/// hand foreign blocks off to their current owners, then react to disk
/// pressure by blocking writes and pulling subranges to neighbours
pub struct MonitorWorker {
	op: Arc<DhtOperator>,
	last_is_start_part: bool,
	notified: bool,
	changed_range: bool,
	full_nodes: Vec<std::net::SocketAddr>,
}

impl MonitorWorker {
	pub fn new(op: Arc<DhtOperator>) -> Self {
		Self {
			op,
			last_is_start_part: true,
			notified: false,
			changed_range: false,
			full_nodes: Vec::new(),
		}
	}

	async fn process_foreign(&mut self, must_exit: &watch::Receiver<bool>) -> Result<(), Error> {
		self.full_nodes.clear();
		let dht_range = self.op.get_dht_range();

		let foreign = dht_range.iterate(&[], true, false)?;
		if foreign.is_empty() {
			self.changed_range = false;
			return Ok(());
		}

		for (key, class, path) in foreign {
			if *must_exit.borrow() {
				break;
			}
			info!("Processing foreign data block {} {}", key, class);
			if self.put_foreign(key, class, &path).await {
				debug!("Data block with key={} is sent", key);
				if path.is_dir() {
					self.op.md_cache.close_store(&path);
					std::fs::remove_dir_all(&path)?;
				} else {
					std::fs::remove_file(&path)?;
				}
			}
		}
		Ok(())
	}

	async fn put_foreign(&mut self, key: Key, class: ContentClass, path: &std::path::Path) -> bool {
		let range = match self.op.find_range(key) {
			Some(r) => r,
			None => {
				debug!("No range found for reservation key {}", key);
				return false;
			}
		};
		if self.full_nodes.contains(&range.node_addr) {
			info!(
				"Node {} does not have free space. Skipping put data block",
				range.node_addr
			);
			return false;
		}
		if range.node_addr == self.op.self_addr {
			info!("Skip moving to local node");
			return false;
		}

		let source = if path.is_dir() {
			match self.op.md_cache.snapshot(path) {
				Ok(archive) => BinarySource::Buf(archive),
				Err(e) => {
					error!("Archiving metadata store {} failed: {}", path.display(), e);
					return false;
				}
			}
		} else {
			BinarySource::from_file(path.to_path_buf())
		};

		let msg = DhtRpc::PutDataBlock {
			key,
			class,
			user_id_hash: None,
			init_block: false,
			carefully_save: true,
			stored_unixtime: None,
		};
		match self.op.call_node(range.node_addr, msg, Some(source)).await {
			Ok(answer) if answer.resp.code == codes::NO_FREE_SPACE => {
				self.full_nodes.push(range.node_addr);
				false
			}
			Ok(answer) if answer.resp.is_ok() || answer.resp.code == codes::OLD_DATA => true,
			Ok(answer) => {
				error!(
					"PutDataBlock error on {}: {}",
					range.node_addr, answer.resp.message
				);
				false
			}
			Err(e) => {
				error!("PutDataBlock error on {}: {}", range.node_addr, e);
				false
			}
		}
	}

	async fn check_range_free_size(&mut self) -> Result<(), Error> {
		let dht_range = self.op.get_dht_range();
		let free_percents = dht_range.free_size_percents()?;
		let used_percents = 100.0 - free_percents;
		let cfg = self.op.config.dht.clone();

		if used_percents >= cfg.max_used_size_percents {
			if self.changed_range {
				warn!("Critical free disk space! Waiting for data move");
				return Ok(());
			}
			if free_percents < cfg.critical_free_space_percent {
				warn!("Critical free disk space! Blocking range for write!");
				dht_range.block_for_write(cfg.critical_free_space_percent);
			}
			warn!("Few free size for data range. Trying to pull part of the range to the network");
			if !self.pull_subrange(&dht_range).await {
				// retry at the opposite end
				let dht_range = self.op.get_dht_range();
				self.pull_subrange(&dht_range).await;
			}
		} else if used_percents >= cfg.danger_used_size_percents {
			if !self.notified {
				self.op
					.notify(
						NotifyKind::Alert,
						"HDD usage",
						format!("{:.0} percents", used_percents),
					)
					.await;
				self.notified = true;
			}
		} else {
			self.changed_range = false;
			self.notified = false;
		}
		Ok(())
	}

	async fn pull_subrange(&mut self, dht_range: &Arc<FsMappedRange>) -> bool {
		let split_part = dht_range
			.span()
			.scale(self.op.config.dht.pull_subrange_size_perc, 100);

		let (dest_key, start_subrange, end_subrange) = if self.last_is_start_part {
			(
				dht_range.start().pred(),
				dht_range.start(),
				dht_range.start().wrapping_add(split_part),
			)
		} else {
			(
				dht_range.end().succ(),
				dht_range.end().checked_sub(split_part).unwrap_or(Key::MIN),
				dht_range.end(),
			)
		};
		self.last_is_start_part = !self.last_is_start_part;

		let dest_key = match dest_key {
			Some(k) => k,
			None => {
				info!("[pull_subrange] No range beyond this end of the ring");
				return false;
			}
		};
		let k_range = match self.op.find_range(dest_key) {
			Some(r) => r,
			None => {
				error!(
					"[pull_subrange] No range found for key={} in ranges table",
					dest_key
				);
				return false;
			}
		};

		let (pull_subrange, new_dht_range) =
			match dht_range.split_range(start_subrange, end_subrange) {
				Ok(pair) => pair,
				Err(e) => {
					error!("[pull_subrange] {}", e);
					return false;
				}
			};
		let subrange_size = pull_subrange.data_size(&[], false).unwrap_or(0);

		info!(
			"Call PullSubrangeRequest [{}-{}] to {}",
			pull_subrange.start(),
			pull_subrange.end(),
			k_range.node_addr
		);
		let msg = DhtRpc::PullSubrangeRequest {
			start_key: pull_subrange.start(),
			end_key: pull_subrange.end(),
			subrange_size,
		};
		match self.op.call_node_ok(k_range.node_addr, msg, None).await {
			Ok(_) => {
				if let Err(e) = new_dht_range.save_range() {
					error!("Saving range info failed: {}", e);
				}
				self.op.update_dht_range(new_dht_range);
				self.changed_range = true;
				true
			}
			Err(e) => {
				error!(
					"PullSubrangeRequest operation failed on node {}. Details: {}",
					k_range.node_addr, e
				);
				dht_range.join_subranges();
				false
			}
		}
	}
}

#[async_trait]
impl Worker for MonitorWorker {
	fn name(&self) -> String {
		"DHT ranges monitor".into()
	}

	async fn work(&mut self, must_exit: &mut watch::Receiver<bool>) -> Result<WorkerStatus, Error> {
		if self.op.status() == NodeStatus::Initialize {
			return Ok(WorkerStatus::Idle);
		}

		debug!("MonitorDHTRanges iteration");
		self.process_foreign(must_exit).await?;
		if *must_exit.borrow() {
			return Ok(WorkerStatus::Idle);
		}
		self.check_range_free_size().await?;
		Ok(WorkerStatus::Idle)
	}

	async fn wait_for_work(&mut self, _must_exit: &watch::Receiver<bool>) -> WorkerStatus {
		let period = Duration::from_secs(self.op.config.dht.monitor_dht_ranges_timeout);
		select! {
			_ = tokio::time::sleep(period) => (),
			_ = self.op.monitor_forced() => (),
		}
		WorkerStatus::Busy
	}
}

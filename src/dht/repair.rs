//! Anti-entropy pass: verify that every replica of our local blocks and
//! metadata stores exists on its current owner, and push repairs where
//! they diverged

use std::path::Path;
use std::sync::Arc;

use ringstore_block::{ContentClass, DataBlock, DataBlockHeader};
use ringstore_rpc::BinarySource;
use ringstore_util::error::Error;
use ringstore_util::key::{derive_keys, Key};
use ringstore_util::MIN_REPLICA_COUNT;

use crate::operator::DhtOperator;
use crate::proto::*;

pub struct RepairProcess {
	op: Arc<DhtOperator>,
	stat: RepairStat,
	// repairs already satisfied by a local class-to-class copy this run
	local_moved: Vec<(Key, ContentClass)>,
	check_range_start: Option<Key>,
	check_range_end: Option<Key>,
}

impl RepairProcess {
	pub fn new(op: Arc<DhtOperator>) -> Self {
		Self {
			op,
			stat: RepairStat::default(),
			local_moved: Vec::new(),
			check_range_start: None,
			check_range_end: None,
		}
	}

	pub async fn run(
		mut self,
		check_range_start: Option<Key>,
		check_range_end: Option<Key>,
	) -> Result<RepairStat, Error> {
		self.check_range_start = check_range_start;
		self.check_range_end = check_range_end;
		let dht_range = self.op.get_dht_range();

		info!("[RepairDataBlocks] Processing DHT range");
		for (key, class, path) in
			dht_range.iterate(&[ContentClass::Master, ContentClass::Replica], false, false)?
		{
			if self.local_moved.contains(&(key, class)) {
				continue;
			}
			self.process_data_block(key, class, &path).await;
		}
		info!("[RepairDataBlocks] DHT range is processed");

		info!("[RepairDataBlocks] Processing users metadata range");
		for (key, _, path) in dht_range.iterate(&[ContentClass::MdMaster], false, false)? {
			self.process_md_block(key, &path).await;
		}
		info!("[RepairDataBlocks] Users metadata range is processed");

		Ok(self.stat)
	}

	fn in_check_range(&self, key: Key) -> bool {
		match (self.check_range_start, self.check_range_end) {
			(None, None) => true,
			(start, end) => {
				start.map(|s| s <= key).unwrap_or(true) && end.map(|e| key <= e).unwrap_or(true)
			}
		}
	}

	async fn process_data_block(&mut self, key: Key, class: ContentClass, path: &Path) {
		self.stat.processed_local_blocks += 1;

		let header = match DataBlock::new(path.to_path_buf(), self.op.locks()).header() {
			Ok(header) => header,
			Err(e) => {
				self.stat.invalid_local_blocks += 1;
				error!("[RepairDataBlocks] {}", e);
				return;
			}
		};
		let data_keys = derive_keys(header.master_key, header.replica_count);

		match class {
			ContentClass::Master if key != header.master_key => {
				self.stat.invalid_local_blocks += 1;
				error!(
					"[RepairDataBlocks] Master key is invalid: {} != {}",
					key, header.master_key
				);
				return;
			}
			ContentClass::Replica if !data_keys.contains(&key) => {
				self.stat.invalid_local_blocks += 1;
				error!("[RepairDataBlocks] Replica key is invalid: {}", key);
				return;
			}
			_ => {}
		}

		// a replica also guards the master copy
		if class == ContentClass::Replica && self.in_check_range(data_keys[0]) {
			self.check_remote_block(key, class, path, data_keys[0], &header, ContentClass::Master)
				.await;
		}
		for repl_key in &data_keys[1..] {
			if *repl_key == key {
				continue;
			}
			if self.in_check_range(*repl_key) {
				self.check_remote_block(key, class, path, *repl_key, &header, ContentClass::Replica)
					.await;
			}
		}
	}

	async fn check_remote_block(
		&mut self,
		local_key: Key,
		local_class: ContentClass,
		path: &Path,
		check_key: Key,
		header: &DataBlockHeader,
		remote_class: ContentClass,
	) {
		let range = match self.op.find_range(check_key) {
			Some(r) => r,
			None => {
				self.stat.failed_repair_foreign_blocks += 1;
				error!("[RepairDataBlocks] No range found for key {}", check_key);
				return;
			}
		};

		let check = DhtRpc::CheckDataBlock {
			key: check_key,
			class: remote_class,
			checksum: Some(header.checksum),
		};
		let code = match self.op.call_node(range.node_addr, check, None).await {
			Ok(answer) => answer.resp.code,
			Err(e) => {
				self.stat.failed_repair_foreign_blocks += 1;
				error!("CheckDataBlock failed on {}: {}", range.node_addr, e);
				return;
			}
		};

		match code {
			codes::OK => {}
			codes::NO_DATA | codes::INVALID_DATA => {
				info!(
					"Invalid DB with key={} at {} ([{}]). Sending valid block",
					check_key, range.node_addr, code
				);
				if range.node_addr == self.op.self_addr {
					self.local_moved.push((check_key, remote_class));
					match self.op.copy_db(local_key, local_class, check_key, remote_class) {
						Ok(()) => self.stat.repaired_foreign_blocks += 1,
						Err(e) => {
							self.stat.failed_repair_foreign_blocks += 1;
							error!("Local repair copy failed: {}", e);
						}
					}
					return;
				}

				let put = DhtRpc::PutDataBlock {
					key: check_key,
					class: remote_class,
					user_id_hash: Some(header.owner_hash),
					init_block: false,
					carefully_save: true,
					stored_unixtime: Some(header.stored_unixtime),
				};
				let source = BinarySource::from_file(path.to_path_buf());
				match self.op.call_node(range.node_addr, put, Some(source)).await {
					Ok(answer) if answer.resp.is_ok() => self.stat.repaired_foreign_blocks += 1,
					Ok(answer) if answer.resp.code == codes::OLD_DATA => {
						self.stat.invalid_local_blocks += 1;
						error!("Old data block detected with key={}", check_key);
					}
					Ok(answer) => {
						self.stat.failed_repair_foreign_blocks += 1;
						error!(
							"PutDataBlock failed on {}: {}",
							range.node_addr, answer.resp.message
						);
					}
					Err(e) => {
						self.stat.failed_repair_foreign_blocks += 1;
						error!("PutDataBlock failed on {}: {}", range.node_addr, e);
					}
				}
			}
			_ => {
				self.stat.failed_repair_foreign_blocks += 1;
				error!(
					"CheckDataBlock failed on {} with code {}",
					range.node_addr, code
				);
			}
		}
	}

	async fn process_md_block(&mut self, check_key: Key, path: &Path) {
		self.stat.processed_local_blocks += 1;
		let data_keys = derive_keys(check_key, MIN_REPLICA_COUNT);

		for repl_key in &data_keys[1..] {
			if !self.in_check_range(*repl_key) {
				continue;
			}
			let range = match self.op.find_range(*repl_key) {
				Some(r) => r,
				None => {
					self.stat.failed_repair_foreign_blocks += 1;
					error!("[RepairDataBlocks] No range found for key {}", repl_key);
					continue;
				}
			};

			let checksum = match self.op.md_cache.with_store(path, |store| store.checksum()) {
				Ok(c) => c,
				Err(e) => {
					self.stat.failed_repair_foreign_blocks += 1;
					error!("Reading metadata store checksum failed: {}", e);
					return;
				}
			};

			let check = DhtRpc::CheckDataBlock {
				key: *repl_key,
				class: ContentClass::MdReplica,
				checksum: Some(checksum),
			};
			let code = match self.op.call_node(range.node_addr, check, None).await {
				Ok(answer) => answer.resp.code,
				Err(e) => {
					self.stat.failed_repair_foreign_blocks += 1;
					error!("CheckDataBlock failed at {}: {}", range.node_addr, e);
					return;
				}
			};

			match code {
				codes::OK => return,
				codes::NO_DATA | codes::INVALID_DATA => {
					info!(
						"Invalid metadata for user={} at {} ([{}]). Sending valid block",
						check_key, range.node_addr, code
					);
					let archive = match self.op.md_cache.snapshot(path) {
						Ok(archive) => archive,
						Err(e) => {
							self.stat.failed_repair_foreign_blocks += 1;
							error!("Archiving metadata store failed: {}", e);
							return;
						}
					};
					let put = DhtRpc::PutDataBlock {
						key: *repl_key,
						class: ContentClass::MdReplica,
						user_id_hash: Some(check_key),
						init_block: false,
						carefully_save: false,
						stored_unixtime: None,
					};
					match self
						.op
						.call_node(range.node_addr, put, Some(BinarySource::Buf(archive)))
						.await
					{
						Ok(answer) if answer.resp.is_ok() => {
							self.stat.repaired_foreign_blocks += 1
						}
						Ok(answer) => {
							self.stat.failed_repair_foreign_blocks += 1;
							error!(
								"PutDataBlock failed on {}: {}",
								range.node_addr, answer.resp.message
							);
						}
						Err(e) => {
							self.stat.failed_repair_foreign_blocks += 1;
							error!("PutDataBlock failed on {}: {}", range.node_addr, e);
						}
					}
				}
				_ => {
					self.stat.failed_repair_foreign_blocks += 1;
					error!(
						"CheckDataBlock failed at {} with code {}",
						range.node_addr, code
					);
					return;
				}
			}
		}
	}
}

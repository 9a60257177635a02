//! The membership state machine owning the local range and ranges-table

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::prelude::*;
use tokio::sync::Notify;

use ringstore_block::{BlockLocks, ContentClass, FsMappedRange};
use ringstore_metadata::MetadataCache;
use ringstore_rpc::{BinarySource, Request, Role, RpcAnswer, RpcClient};
use ringstore_table::{HashRange, RangesTable};
use ringstore_util::config::Config;
use ringstore_util::error::{Error, OkOrMessage};
use ringstore_util::key::Key;
use ringstore_util::time::{msec_to_rfc3339, now_msec};

use crate::proto::*;

const RANGE_DIR: &str = "dht_range";

pub struct DhtOperator {
	pub self_addr: SocketAddr,
	pub node_name: String,
	pub config: Config,
	pub ranges_table: RangesTable,
	pub rpc: RpcClient,
	pub md_cache: MetadataCache,

	save_path: PathBuf,
	locks: Arc<BlockLocks>,
	dht_range: RwLock<Arc<FsMappedRange>>,
	status: Mutex<NodeStatus>,
	// serializes compound range mutations (extend, split handoff)
	oper_lock: tokio::sync::Mutex<()>,
	split_requests_cache: Mutex<Vec<SocketAddr>>,
	start_try_count: AtomicU32,
	monitor_force: Notify,
}

impl DhtOperator {
	pub fn new(config: Config) -> Result<Arc<Self>, Error> {
		let save_path = config.home_dir.join(RANGE_DIR);
		if !save_path.exists() {
			fs::create_dir_all(&save_path)?;
		}

		let locks = BlockLocks::new();
		let dht_range = Arc::new(FsMappedRange::discover(&save_path, locks.clone())?);
		let self_addr = config.rpc_public_addr();

		let ranges_table = RangesTable::new();
		ranges_table.append(dht_range.start(), dht_range.end(), self_addr)?;

		Ok(Arc::new(Self {
			self_addr,
			node_name: config.node_name.clone(),
			rpc: RpcClient::new(Duration::from_secs(config.rpc_timeout)),
			md_cache: MetadataCache::new(locks.clone()),
			ranges_table,
			save_path,
			locks,
			dht_range: RwLock::new(dht_range),
			status: Mutex::new(NodeStatus::PreInit),
			oper_lock: tokio::sync::Mutex::new(()),
			split_requests_cache: Mutex::new(Vec::new()),
			start_try_count: AtomicU32::new(0),
			monitor_force: Notify::new(),
			config,
		}))
	}

	// ---- status ----

	pub fn status(&self) -> NodeStatus {
		*self.status.lock().unwrap()
	}

	pub fn set_status(&self, status: NodeStatus) {
		*self.status.lock().unwrap() = status;
	}

	pub fn set_status_to_normalwork(&self, save_range: bool) {
		info!("Changing node status to NORMALWORK");
		self.set_status(NodeStatus::NormalWork);
		self.split_requests_cache.lock().unwrap().clear();
		self.start_try_count.store(0, Ordering::SeqCst);
		if save_range {
			if let Err(e) = self.get_dht_range().save_range() {
				error!("Saving range info failed: {}", e);
			}
		}
	}

	// ---- local range ----

	pub fn get_dht_range(&self) -> Arc<FsMappedRange> {
		self.dht_range.read().unwrap().clone()
	}

	pub fn update_dht_range(&self, new_range: Arc<FsMappedRange>) {
		*self.dht_range.write().unwrap() = new_range;
		let range = self.get_dht_range();
		info!("New node range: {}-{}", range.start(), range.end());
	}

	pub fn locks(&self) -> Arc<BlockLocks> {
		self.locks.clone()
	}

	pub fn db_path(&self, key: Key, class: ContentClass, for_write: bool) -> Result<PathBuf, Error> {
		self.get_dht_range().db_path(key, class, for_write)
	}

	pub fn copy_db(
		&self,
		s_key: Key,
		s_class: ContentClass,
		d_key: Key,
		d_class: ContentClass,
	) -> Result<(), Error> {
		let src = self.db_path(s_key, s_class, false)?;
		let dst = self.db_path(d_key, d_class, true)?;
		fs::copy(src, dst)?;
		Ok(())
	}

	// ---- ranges table ----

	pub fn find_range(&self, key: Key) -> Option<HashRange> {
		self.ranges_table.find(key)
	}

	pub fn apply_table_changes(
		&self,
		rm_list: &[HashRange],
		append_list: &[HashRange],
	) -> Result<(), Error> {
		self.ranges_table.apply_changes(rm_list, append_list)
	}

	// ---- RPC plumbing ----

	pub fn node_request(&self, msg: DhtRpc) -> Request<DhtRpc> {
		Request::new(self.self_addr, Role::Node, msg)
	}

	pub async fn call_node(
		&self,
		to: SocketAddr,
		msg: DhtRpc,
		data: Option<BinarySource>,
	) -> Result<RpcAnswer<ReplyBody>, Error> {
		let req = self.node_request(msg);
		self.rpc.call(to, req, data).await
	}

	/// Like `call_node` but turning a non-OK return code into its typed error
	pub async fn call_node_ok(
		&self,
		to: SocketAddr,
		msg: DhtRpc,
		data: Option<BinarySource>,
	) -> Result<RpcAnswer<ReplyBody>, Error> {
		let answer = self.call_node(to, msg, data).await?;
		if !answer.resp.is_ok() {
			return Err(code_error(answer.resp.code, &answer.resp.message));
		}
		Ok(answer)
	}

	/// Apply `msg` locally, then fan it out to every other node known to
	/// the ranges-table (plus `extra` recipients)
	pub async fn call_network(&self, msg: DhtRpc, extra: &[SocketAddr]) {
		self.local_apply(&msg);

		let mut addrs: Vec<SocketAddr> = self
			.ranges_table
			.snapshot()
			.iter()
			.map(|r| r.node_addr)
			.chain(extra.iter().copied())
			.filter(|a| *a != self.self_addr)
			.collect();
		addrs.sort();
		addrs.dedup();

		for addr in addrs {
			match self.call_node(addr, msg.clone(), None).await {
				Ok(answer) if answer.resp.is_ok() => {}
				Ok(answer) => warn!(
					"{} broadcast to {} returned [{}] {}",
					msg.method(),
					addr,
					answer.resp.code,
					answer.resp.message
				),
				Err(e) => warn!("{} broadcast to {} failed: {}", msg.method(), addr, e),
			}
		}
	}

	fn local_apply(&self, msg: &DhtRpc) {
		match msg {
			DhtRpc::UpdateHashRangeTable { append, remove } => {
				if let Err(e) = self.apply_table_changes(remove, append) {
					debug!(
						"UpdateHashRangeTable error: {} STATUS={:?}",
						e,
						self.status()
					);
				}
			}
			DhtRpc::Notify(n) => {
				info!("[{:?}] {} from {}: {}", n.kind, n.topic, n.provider, n.message)
			}
			_ => {}
		}
	}

	pub async fn notify(&self, kind: NotifyKind, topic: &str, message: String) {
		let notification = Notification {
			kind,
			topic: topic.to_string(),
			message,
			provider: self.self_addr,
			at: msec_to_rfc3339(now_msec()),
		};
		self.call_network(DhtRpc::Notify(notification), &[]).await;
	}

	// ---- membership ----

	async fn take_range(&self, range: HashRange) {
		info!(
			"Take node old range {}-{}. Updating hash range table on network",
			range.start, range.end
		);
		self.call_network(
			DhtRpc::UpdateHashRangeTable {
				append: vec![range],
				remove: vec![],
			},
			&[],
		)
		.await;
	}

	async fn move_range(&self, range: HashRange) {
		info!(
			"Node {} went from DHT. Updating hash range table on network",
			range.node_addr
		);
		self.call_network(
			DhtRpc::UpdateHashRangeTable {
				append: vec![],
				remove: vec![range],
			},
			&[],
		)
		.await;
	}

	pub async fn remove_node_range(&self, node_addr: SocketAddr) {
		for range in self.ranges_table.snapshot() {
			if range.node_addr == node_addr {
				self.move_range(range).await;
				break;
			}
		}
	}

	fn normalize_range_request(c_start: Key, c_end: Key, foreign: &HashRange) -> Option<HashRange> {
		let r1 = if foreign.contains(c_start) {
			Some(HashRange::new(c_start, foreign.end, foreign.node_addr))
		} else {
			None
		};
		let r2 = if foreign.contains(c_end) {
			Some(HashRange::new(foreign.start, c_end, foreign.node_addr))
		} else {
			None
		};
		match (r1, r2) {
			(Some(a), Some(b)) => Some(if a.span() < b.span() { a } else { b }),
			(Some(a), None) => Some(a),
			(None, b) => b,
		}
	}

	/// The rightmost half of the largest foreign range, ties broken by
	/// uniform random choice. Returns our own range verbatim when we are
	/// still in the table.
	fn next_max_range(&self) -> Option<HashRange> {
		let tried = self.split_requests_cache.lock().unwrap().clone();
		let snapshot = self.ranges_table.snapshot();

		let mut max_range: Option<HashRange> = None;
		for range in snapshot.iter() {
			if range.node_addr == self.self_addr {
				return Some(*range);
			}
			if tried.contains(&range.node_addr) {
				continue;
			}
			match &max_range {
				Some(m) if m.span() >= range.span() => {}
				_ => max_range = Some(*range),
			}
		}
		let max_range = max_range?;

		let candidates: Vec<&HashRange> = snapshot
			.iter()
			.filter(|r| r.span() == max_range.span() && r.node_addr != self.self_addr)
			.collect();
		let chosen = candidates.choose(&mut thread_rng())?;

		let new_start = chosen.start.wrapping_add(chosen.span().half()).succ()?;
		if new_start > chosen.end {
			return None;
		}
		Some(HashRange::new(new_start, chosen.end, chosen.node_addr))
	}

	/// A range near our previous ownership, normalized so the chosen
	/// subrange sits entirely within a single foreign range
	fn next_range_near(&self, c_start: Key, c_end: Key) -> Option<HashRange> {
		let tried = self.split_requests_cache.lock().unwrap().clone();

		let mut ret: Option<HashRange> = None;
		if let Some(found) = self.ranges_table.find(c_start) {
			if !tried.contains(&found.node_addr) {
				ret = Self::normalize_range_request(c_start, c_end, &found);
			}
			if found.contains(c_end) {
				return ret;
			}
		}

		// our previous range may be split between two other nodes by now
		if let Some(found) = self.ranges_table.find(c_end) {
			if !tried.contains(&found.node_addr) {
				let ret_e = Self::normalize_range_request(c_start, c_end, &found);
				match (&ret, &ret_e) {
					(Some(r), Some(re)) if re.span() <= r.span() => {}
					(_, Some(_)) => ret = ret_e,
					_ => {}
				}
			}
		}

		Some(ret.unwrap_or_else(|| HashRange::new(c_start, c_end, self.self_addr)))
	}

	/// Join routine: pick a target range, ask its owner to split, receive
	/// the handoff. Retries with other targets until the candidate list is
	/// exhausted.
	pub async fn start_as_dht_member(self: &Arc<Self>) {
		loop {
			if self.status() == NodeStatus::Destroying {
				return;
			}
			info!("Starting as DHT member");
			self.set_status(NodeStatus::Initialize);

			let mut dht_range = self.get_dht_range();
			let curr_start = dht_range.start();
			let curr_end = dht_range.end();

			let tried_count = self.split_requests_cache.lock().unwrap().len();
			if tried_count == 1 {
				// after the first failure, retry with the previous ownership
				match dht_range.last_range() {
					Ok(last) => dht_range = Arc::new(last),
					Err(e) => warn!("Cannot rebuild the previous range: {}", e),
				}
			}

			let new_range = if dht_range.is_max_range() || tried_count > 0 {
				self.next_max_range()
			} else {
				self.next_range_near(curr_start, curr_end)
			};

			let new_range = match new_range {
				Some(r) => r,
				None => {
					let tries = self.start_try_count.load(Ordering::SeqCst);
					if tries >= self.config.dht.dht_cycle_try_count {
						error!("Cannot initialize node as a part of DHT");
						self.start_try_count.store(0, Ordering::SeqCst);
						return;
					}
					info!("No ready range for me on the network, syncing ranges tables");
					self.start_try_count.store(tries + 1, Ordering::SeqCst);
					self.split_requests_cache.lock().unwrap().clear();
					self.check_range_table().await;
					return;
				}
			};

			let new_dht_range = if new_range.start == curr_start && new_range.end == curr_end {
				self.get_dht_range()
			} else {
				let range = match FsMappedRange::new(
					new_range.start,
					new_range.end,
					&self.save_path,
					self.locks.clone(),
				) {
					Ok(r) => Arc::new(r),
					Err(e) => {
						error!("Cannot map new range: {}", e);
						return;
					}
				};
				self.update_dht_range(range.clone());
				range
			};

			if new_range.node_addr == self.self_addr {
				self.take_range(new_range).await;
				self.set_status_to_normalwork(false);
				return;
			}

			let target = new_range.node_addr;
			self.split_requests_cache.lock().unwrap().push(target);

			info!(
				"Call SplitRangeRequest [{}-{}] to {}",
				new_dht_range.start(),
				new_dht_range.end(),
				target
			);
			let answer = self
				.call_node(
					target,
					DhtRpc::SplitRangeRequest {
						start_key: new_dht_range.start(),
						end_key: new_dht_range.end(),
					},
					None,
				)
				.await;

			let subrange_size = match answer {
				Ok(answer) if answer.resp.is_ok() => match answer.resp.body {
					ReplyBody::SubrangeSize { size } => size,
					ReplyBody::SplitCancelled => {
						info!("Split request refused by {}, trying another range", target);
						continue;
					}
					_ => {
						warn!("Malformed SplitRangeRequest reply from {}", target);
						continue;
					}
				},
				Ok(answer) => {
					warn!(
						"SplitRangeRequest to {} returned [{}] {}",
						target, answer.resp.code, answer.resp.message
					);
					continue;
				}
				Err(e) => {
					warn!("SplitRangeRequest to {} failed: {}", target, e);
					continue;
				}
			};

			// would the incoming subrange overflow this node?
			let estimated = new_dht_range
				.estimated_data_percents(subrange_size)
				.unwrap_or(100.0);
			if estimated >= self.config.dht.allow_used_size_percents {
				info!("Requested range is too big for this node, cancelling");
				let _ = self.call_node(target, DhtRpc::SplitRangeCancel, None).await;
				continue;
			}

			info!("Requesting range data from {}", target);
			match self.call_node(target, DhtRpc::GetRangeDataRequest, None).await {
				Ok(answer) if answer.resp.is_ok() => {
					if let Err(e) = new_dht_range.save_range() {
						error!("Saving range info failed: {}", e);
					}
					self.set_status_to_normalwork(false);
					return;
				}
				other => {
					warn!(
						"GetRangeDataRequest to {} failed: {:?}",
						target,
						other.map(|a| (a.resp.code, a.resp.message))
					);
					let _ = self.call_node(target, DhtRpc::SplitRangeCancel, None).await;
					continue;
				}
			}
		}
	}

	/// Spawn a deferred rejoin; used where the call stack would otherwise
	/// recurse into `start_as_dht_member`
	pub fn rejoin_later(self: &Arc<Self>) {
		let op = self.clone();
		tokio::spawn(async move {
			let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
				Box::pin(async move { op.start_as_dht_member().await });
			fut.await;
		});
	}

	/// True when the local range is unstable (initializing, split, or
	/// diverged from the table). A diverged range triggers a deferred
	/// rejoin when `reinit` is set or the range is gone from the table.
	pub fn check_dht_range(self: &Arc<Self>, reinit: bool) -> bool {
		if self.status() == NodeStatus::Initialize {
			return true;
		}
		let dht_range = self.get_dht_range();
		if dht_range.subranges().is_some() {
			return true;
		}

		let start = dht_range.start();
		let end = dht_range.end();
		let range_obj = self
			.ranges_table
			.find(start)
			.or_else(|| self.ranges_table.find(end));
		match range_obj {
			Some(r) if r.start == start && r.end == end && r.node_addr == self.self_addr => false,
			other => {
				match other {
					Some(r) => info!(
						"Invalid self range! Table has {}, mine is [{}-{}]{}",
						r.to_str(),
						start,
						end,
						self.self_addr
					),
					None => info!(
						"Invalid self range! [{}-{}]{} not found in the table",
						start, end, self.self_addr
					),
				}
				if range_obj.is_none() || reinit {
					info!("Trying to rejoin the ring");
					self.rejoin_later();
				}
				true
			}
		}
	}

	/// Absorb an unowned gap to the right of our range (or to the left
	/// when we hold the first range) and broadcast the new scope
	pub async fn check_near_range(self: &Arc<Self>, reinit_dht: bool) {
		if self.status() != NodeStatus::NormalWork {
			return;
		}
		if self.check_dht_range(reinit_dht) {
			return;
		}

		let _guard = self.oper_lock.lock().await;
		let self_range = self.get_dht_range();

		if self_range.end() != Key::MAX {
			let next_key = self_range.end().succ().unwrap();
			if self.ranges_table.find(next_key).is_none() {
				let gap_end = match self
					.ranges_table
					.find_next(self_range.end().pred().unwrap_or(Key::MIN))
				{
					Some(next_exists) => next_exists.start.pred().unwrap_or(Key::MAX),
					None => Key::MAX,
				};
				match self_range.extend(next_key, gap_end) {
					Ok(new_range) => {
						let new_range = Arc::new(new_range);
						self.update_dht_range(new_range.clone());
						info!("Extended range by next neighbours");
						self.call_network(
							DhtRpc::UpdateHashRangeTable {
								append: vec![HashRange::new(
									new_range.start(),
									new_range.end(),
									self.self_addr,
								)],
								remove: vec![HashRange::new(
									self_range.start(),
									self_range.end(),
									self.self_addr,
								)],
							},
							&[],
						)
						.await;
					}
					Err(e) => warn!("Extending range failed: {}", e),
				}
				return;
			}
		}

		if self.ranges_table.find(Key::MIN).is_none() {
			if let Some(first) = self.ranges_table.get_first() {
				if first.node_addr == self.self_addr && first.start != Key::MIN {
					match self_range.extend(Key::MIN, first.start.pred().unwrap()) {
						Ok(new_range) => {
							let new_range = Arc::new(new_range);
							self.update_dht_range(new_range.clone());
							info!("Extended range by first range");
							self.call_network(
								DhtRpc::UpdateHashRangeTable {
									append: vec![HashRange::new(
										new_range.start(),
										new_range.end(),
										self.self_addr,
									)],
									remove: vec![HashRange::new(
										self_range.start(),
										self_range.end(),
										self.self_addr,
									)],
								},
								&[],
							)
							.await;
						}
						Err(e) => warn!("Extending range failed: {}", e),
					}
				}
			}
		}
	}

	/// Probe a neighbour (or a bootstrap node when alone) with our table
	/// status, and react to its verdict. Returns false when there is no
	/// one to ask.
	pub async fn check_range_table(self: &Arc<Self>) -> bool {
		let mod_index = self.ranges_table.mod_index();
		let ranges_count = self.ranges_table.count();
		let dht_range = self.get_dht_range();
		let (range_start, range_end) = (dht_range.start(), dht_range.end());

		let neighbour = self
			.ranges_table
			.find_next(range_start)
			.or_else(|| self.ranges_table.get_first())
			.map(|r| r.node_addr)
			.filter(|a| *a != self.self_addr);
		let neighbour = match neighbour {
			Some(addr) => addr,
			None => match self.config.bootstrap_nodes.choose(&mut thread_rng()) {
				Some(addr) => *addr,
				None => return false,
			},
		};

		debug!("Checking ranges table at {}", neighbour);
		let answer = self
			.call_node(
				neighbour,
				DhtRpc::CheckHashRangeTable {
					mod_index,
					ranges_count,
					range_start,
					range_end,
				},
				None,
			)
			.await;

		match answer {
			Err(e) => {
				debug!("CheckHashRangeTable: {} is unreachable: {}", neighbour, e);
				self.handle_neighbour_down(neighbour).await;
			}
			Ok(answer) => match answer.resp.code {
				codes::DONT_STARTED => self.handle_neighbour_down(neighbour).await,
				codes::OK => {
					if self.status() == NodeStatus::PreInit {
						self.set_status_to_normalwork(false);
					}
					self.check_near_range(false).await;
				}
				codes::NEED_UPDATE => {
					if let ReplyBody::TableStatus {
						mod_index,
						ranges_count,
						force,
					} = answer.resp.body
					{
						self.fetch_ranges_table(neighbour, mod_index, ranges_count, force)
							.await;
					}
				}
				codes::JUST_WAIT => {
					if self.status() == NodeStatus::PreInit {
						self.set_status_to_normalwork(false);
					}
				}
				code => error!(
					"CheckHashRangeTable failed on {}: [{}] {}",
					neighbour, code, answer.resp.message
				),
			},
		}
		true
	}

	async fn handle_neighbour_down(self: &Arc<Self>, neighbour: SocketAddr) {
		self.remove_node_range(neighbour).await;
		tokio::time::sleep(Duration::from_secs(self.config.dht.wait_dht_table_update)).await;
		self.check_near_range(false).await;
	}

	/// Fetch the full table from `from`, unless the local table converges
	/// to the advertised status within the flapping window
	async fn fetch_ranges_table(
		self: &Arc<Self>,
		from: SocketAddr,
		adv_mod_index: u64,
		adv_count: usize,
		force: bool,
	) {
		if !force {
			for _ in 0..self.config.dht.ranges_table_flapping_timeout {
				if self.ranges_table.count() == 0 {
					break;
				}
				if self.ranges_table.mod_index() == adv_mod_index
					&& self.ranges_table.count() == adv_count
				{
					return;
				}
				tokio::time::sleep(Duration::from_secs(1)).await;
			}
		}

		info!("Ranges table is invalid! Requesting table from {}", from);
		match self.call_node(from, DhtRpc::GetRangesTable, None).await {
			Ok(answer) if answer.resp.is_ok() => match answer.data {
				Some(dump) => {
					if let Err(e) = self.ranges_table.load(&dump) {
						error!("Loading ranges table from {} failed: {}", from, e);
					}
				}
				None => warn!("GetRangesTable reply from {} carried no dump", from),
			},
			other => warn!("GetRangesTable from {} failed: {:?}", from, other.err()),
		}
	}

	// ---- split / pull support ----

	/// Target side of `SplitRangeRequest`: logically split off the
	/// requested subrange and return its data size
	pub fn split_local_range(&self, start_key: Key, end_key: Key) -> Result<u64, Error> {
		let dht_range = self.get_dht_range();
		if dht_range.subranges().is_some() {
			return Err(Error::Message("Range is already split".into()));
		}
		let (subrange, _rest) = dht_range.split_range(start_key, end_key)?;
		subrange.data_size(&[], false)
	}

	pub fn join_subranges(&self) {
		self.get_dht_range().join_subranges();
	}

	/// Projected used percentage after shedding `subrange_size` bytes;
	/// splits are refused while this stays above the allowed level
	pub fn projected_post_split_percents(&self, subrange_size: u64) -> Result<f64, Error> {
		let range = self.get_dht_range();
		let total = range.total_space()?;
		let used = range.estimated_data_percents(0)? * total as f64 / 100.0;
		Ok((used - subrange_size as f64).max(0.0) * 100.0 / total as f64)
	}

	/// Target side of `GetRangeDataRequest`: commit the pending split,
	/// keep the remainder, assign the subrange to `new_owner` on the
	/// network and let the monitor push its data over
	pub async fn send_subrange_data(self: &Arc<Self>, new_owner: SocketAddr) -> Result<(), Error> {
		let dht_range = self.get_dht_range();
		let (subrange, rest) = dht_range.subranges().ok_or_message("Range is not split")?;

		let commit = || -> Result<(), Error> {
			rest.save_range()?;
			self.update_dht_range(rest.clone());
			self.set_status_to_normalwork(true);
			Ok(())
		};
		if let Err(e) = commit() {
			error!("send_subrange_data error: {}", e);
			dht_range.join_subranges();
			return Err(e);
		}
		self.force_monitor();

		self.call_network(
			DhtRpc::UpdateHashRangeTable {
				append: vec![
					HashRange::new(subrange.start(), subrange.end(), new_owner),
					HashRange::new(rest.start(), rest.end(), self.self_addr),
				],
				remove: vec![HashRange::new(
					dht_range.start(),
					dht_range.end(),
					self.self_addr,
				)],
			},
			&[new_owner],
		)
		.await;
		Ok(())
	}

	/// Target side of `PullSubrangeRequest`: absorb an abutting subrange
	/// shed by an overloaded neighbour
	pub async fn extend_range_for_pull(
		self: &Arc<Self>,
		subrange_size: u64,
		start_key: Key,
		end_key: Key,
	) -> Result<(), Error> {
		let _guard = self.oper_lock.lock().await;
		let dht_range = self.get_dht_range();
		if dht_range.subranges().is_some() {
			return Err(Error::Message("Local range is split at this time".into()));
		}

		let estimated = dht_range.estimated_data_percents(subrange_size)?;
		if estimated >= self.config.dht.max_used_size_percents {
			return Err(Error::NoFreeSpace("Subrange is too big for this node".into()));
		}

		let old_range = self.ranges_table.find(start_key).ok_or_else(|| {
			Error::Message(format!(
				"No parent range found for subrange [{}-{}] in the ranges table",
				start_key, end_key
			))
		})?;

		let new_range = Arc::new(dht_range.extend(start_key, end_key)?);

		let new_foreign = if old_range.start < start_key {
			HashRange::new(
				old_range.start,
				start_key.pred().unwrap(),
				old_range.node_addr,
			)
		} else {
			let foreign_start = end_key
				.succ()
				.ok_or_else(|| Error::Message("Bad subrange at the top of the ring".into()))?;
			HashRange::new(foreign_start, old_range.end, old_range.node_addr)
		};

		let append = vec![
			HashRange::new(new_range.start(), new_range.end(), self.self_addr),
			new_foreign,
		];
		let remove = vec![
			HashRange::new(dht_range.start(), dht_range.end(), self.self_addr),
			old_range,
		];

		self.update_dht_range(new_range);
		self.call_network(DhtRpc::UpdateHashRangeTable { append, remove }, &[])
			.await;
		Ok(())
	}

	// ---- monitor interrupt ----

	pub fn force_monitor(&self) {
		self.monitor_force.notify_one();
	}

	pub async fn monitor_forced(&self) {
		self.monitor_force.notified().await;
	}

	// ---- statistics ----

	pub fn dht_info(&self) -> Result<DhtInfo, Error> {
		let range = self.get_dht_range();
		Ok(DhtInfo {
			status: self.status().as_str().to_string(),
			range_start: range.start(),
			range_end: range.end(),
			range_size: range.data_size(&[ContentClass::Master], false)?,
			replicas_size: range.data_size(&[ContentClass::Replica], false)?,
			metadata_size: range.data_size(&[ContentClass::MdMaster], false)?
				+ range.data_size(&[ContentClass::MdReplica], false)?,
			free_size: range.free_size()?,
			free_size_percents: range.free_size_percents()?,
		})
	}

	// ---- lifecycle ----

	/// Load the ranges table from a bootstrap node, then join the ring.
	/// Without bootstrap nodes the node keeps (or takes) the whole space.
	pub async fn bootstrap(self: &Arc<Self>) {
		for addr in self.config.bootstrap_nodes.clone() {
			match self.call_node_ok(addr, DhtRpc::GetRangesTable, None).await {
				Ok(answer) => match answer.data {
					Some(dump) => match self.ranges_table.load(&dump) {
						Ok(_) => break,
						Err(e) => error!("Loading bootstrap table from {} failed: {}", addr, e),
					},
					None => warn!("GetRangesTable reply from {} carried no dump", addr),
				},
				Err(e) => warn!("Bootstrap node {} is unreachable: {}", addr, e),
			}
		}
		self.start_as_dht_member().await;
	}

	/// Leave the ring: broadcast the removal of our range and flush the
	/// metadata cache. Background tasks are joined by the server under
	/// `dht_stop_timeout`.
	pub async fn stop_inherited(&self) {
		self.set_status(NodeStatus::Destroying);
		for range in self.ranges_table.snapshot() {
			if range.node_addr == self.self_addr {
				self.move_range(range).await;
				break;
			}
		}
		tokio::time::sleep(Duration::from_secs(self.config.dht.dht_stop_timeout)).await;
		self.md_cache.flush_all();
	}
}

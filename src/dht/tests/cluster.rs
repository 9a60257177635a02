//! Two-node ring: join by splitting, client data path, metadata
//! replication and repair, all over real loopback sockets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use ringstore_block::{ContentClass, HEADER_LEN};
use ringstore_dht::client::StorageClient;
use ringstore_dht::operator::DhtOperator;
use ringstore_dht::proto::*;
use ringstore_metadata::MdDataBlockInfo;
use ringstore_rpc::{run_rpc_server, BinarySource, Request, Role, RpcClient};
use ringstore_util::config::{Config, DhtConfig};
use ringstore_util::key::{derive_keys, Key};

struct TestNode {
	op: Arc<DhtOperator>,
	addr: SocketAddr,
	_home: mktemp::Temp,
	stop: watch::Sender<bool>,
}

impl TestNode {
	async fn start(port: u16, bootstrap: Vec<SocketAddr>) -> TestNode {
		let home = mktemp::Temp::new_dir().unwrap();
		let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
		let config = Config {
			home_dir: home.as_path().to_path_buf(),
			node_name: format!("node_{}", port),
			rpc_bind_addr: addr,
			rpc_public_addr: None,
			bootstrap_nodes: bootstrap,
			rpc_timeout: 5,
			dht: DhtConfig {
				// keep joins independent of how full the test machine's
				// disk happens to be
				allow_used_size_percents: 101.0,
				wait_dht_table_update: 0,
				..Default::default()
			},
		};

		let op = DhtOperator::new(config).unwrap();
		let (stop, stop_rx) = watch::channel(false);
		tokio::spawn(run_rpc_server::<DhtRpc, _>(addr, op.clone(), stop_rx));
		tokio::time::sleep(Duration::from_millis(50)).await;

		op.bootstrap().await;
		TestNode {
			op,
			addr,
			_home: home,
			stop,
		}
	}

	fn node_rpc(&self) -> RpcClient {
		RpcClient::new(Duration::from_secs(5))
	}

	async fn call(
		&self,
		msg: DhtRpc,
		data: Option<BinarySource>,
	) -> ringstore_rpc::RpcAnswer<ReplyBody> {
		let req = Request::new("127.0.0.1:9".parse().unwrap(), Role::Node, msg);
		self.node_rpc().call(self.addr, req, data).await.unwrap()
	}
}

impl Drop for TestNode {
	fn drop(&mut self) {
		let _ = self.stop.send(true);
	}
}

// each test gets its own port pair: the tests run concurrently in one
// process
async fn two_node_ring(base_port: u16) -> (TestNode, TestNode) {
	let a = TestNode::start(base_port, vec![]).await;
	assert_eq!(a.op.status(), NodeStatus::NormalWork);
	let b = TestNode::start(base_port + 1, vec![a.addr]).await;
	(a, b)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_splits_the_ring_in_half() {
	let (a, b) = two_node_ring(21986).await;

	assert_eq!(a.op.status(), NodeStatus::NormalWork);
	assert_eq!(b.op.status(), NodeStatus::NormalWork);
	assert_eq!(a.op.ranges_table.count(), 2);
	assert_eq!(b.op.ranges_table.count(), 2);

	let mid = Key::MAX.half();
	let a_range = a.op.get_dht_range();
	assert_eq!(a_range.start(), Key::MIN);
	assert_eq!(a_range.end(), mid);
	let b_range = b.op.get_dht_range();
	assert_eq!(b_range.start(), mid.succ().unwrap());
	assert_eq!(b_range.end(), Key::MAX);

	// both tables agree on who owns what
	for node in [&a, &b] {
		assert_eq!(node.op.find_range(Key::MIN).unwrap().node_addr, a.addr);
		assert_eq!(node.op.find_range(Key::MAX).unwrap().node_addr, b.addr);
	}
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_put_get_delete() {
	let (a, b) = two_node_ring(22086).await;
	let client = StorageClient::new(a.addr, "fabregas", Duration::from_secs(5));

	let payload = vec![0x17u8; 30720];
	let key = client
		.put_data_block(payload.clone(), None, 2, true, 3)
		.await
		.unwrap();

	// with wait_writes == replica_count + 1, every derived key is
	// readable from either node right away
	for read_from in [a.addr, b.addr] {
		let reader = StorageClient::new(read_from, "fabregas", Duration::from_secs(5));
		assert_eq!(reader.get_data_block(key, 2).await.unwrap(), payload);
	}
	for (i, derived) in derive_keys(key, 2).into_iter().enumerate() {
		let class = if i == 0 {
			ContentClass::Master
		} else {
			ContentClass::Replica
		};
		let owner = a.op.find_range(derived).unwrap().node_addr;
		let node = if owner == a.addr { &a } else { &b };
		let answer = node
			.call(
				DhtRpc::GetDataBlock {
					key: derived,
					class,
					user_id_hash: None,
				},
				None,
			)
			.await;
		assert_eq!(answer.resp.code, codes::OK, "{}", answer.resp.message);
		assert_eq!(answer.data.unwrap(), payload);
	}

	// a first-write put on the same key is refused
	let err = client
		.put_data_block(payload.clone(), Some(key), 2, true, 3)
		.await
		.unwrap_err();
	assert!(matches!(
		err,
		ringstore_util::error::Error::AlreadyExists(_)
	));

	// an alien user cannot read the block
	let stranger = StorageClient::new(a.addr, "1324", Duration::from_secs(5));
	let err = stranger.get_data_block(key, 2).await.unwrap_err();
	assert!(matches!(
		err,
		ringstore_util::error::Error::PermissionDenied(_)
	));

	client.delete_data_block(key, 2).await.unwrap();
	let err = client.get_data_block(key, 2).await.unwrap_err();
	assert!(matches!(err, ringstore_util::error::Error::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_careful_save_rejects_old_and_alien_writes() {
	let (a, _b) = two_node_ring(22186).await;

	let key = a.op.get_dht_range().start().succ().unwrap();
	let owner = Key::sha1_of(b"1324");
	let put = |owner, stored| DhtRpc::PutDataBlock {
		key,
		class: ContentClass::Master,
		user_id_hash: Some(owner),
		init_block: false,
		carefully_save: true,
		stored_unixtime: stored,
	};

	// seed the block with a freshly stamped header
	let header = ringstore_block::DataBlockHeader::new(key, 2, Key::sha1_of(b"P"), owner);
	let mut raw = header.pack().to_vec();
	raw.extend_from_slice(b"P");
	let answer = a
		.call(put(owner, None), Some(BinarySource::Buf(raw.clone())))
		.await;
	assert_eq!(answer.resp.code, codes::OK, "{}", answer.resp.message);

	// an ancient timestamp is rejected as old data
	let answer = a
		.call(put(owner, Some(23523.0)), Some(BinarySource::Buf(raw.clone())))
		.await;
	assert_eq!(answer.resp.code, codes::OLD_DATA);

	// a different owner is rejected outright
	let answer = a
		.call(
			put(Key::sha1_of(b"fabregas"), None),
			Some(BinarySource::Buf(raw)),
		)
		.await;
	assert_eq!(answer.resp.code, codes::PERMISSION_DENIED);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metadata_update_and_restore_from_replica() {
	let (a, b) = two_node_ring(22286).await;
	let client = StorageClient::new(b.addr, "fabregas", Duration::from_secs(5));

	let user_hash = Key::sha1_of(b"fabregas");
	let md_owner_addr = a.op.find_range(user_hash).unwrap().node_addr;
	let md_owner = if md_owner_addr == a.addr { &a } else { &b };

	client
		.update_user_profile(md_owner_addr, user_hash, 100500)
		.await
		.unwrap();

	let add_list = vec![(
		"/test.out".to_string(),
		vec![
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
		],
	)];
	client
		.update_metadata(md_owner_addr, user_hash, add_list, vec![])
		.await
		.unwrap();

	// quota accounting is visible through GetObjectInfo
	let answer = md_owner
		.call(
			DhtRpc::GetObjectInfo {
				obj_path: "/test.out".into(),
				req_user_info: true,
				md_replica_count: 2,
				get_key: None,
				user_id_hash: Some(user_hash),
				user_id: None,
			},
			None,
		)
		.await;
	assert_eq!(answer.resp.code, codes::OK, "{}", answer.resp.message);
	match answer.resp.body {
		ReplyBody::ObjectInfo {
			user_info,
			path_info,
			data_blocks,
		} => {
			assert_eq!(user_info.unwrap().used_size, (22223 + 3333) * 3);
			assert_eq!(path_info.size, 22223 + 3333);
			assert_eq!(data_blocks.unwrap().len(), 2);
		}
		other => panic!("unexpected body {:?}", other),
	}

	// give the asynchronous replica fan-out a moment to land
	tokio::time::sleep(Duration::from_millis(300)).await;

	// lose the master store on disk; the next update restores it from a
	// replica automatically
	let master_path = md_owner
		.op
		.db_path(user_hash, ContentClass::MdMaster, false)
		.unwrap();
	md_owner.op.md_cache.close_store(&master_path);
	std::fs::remove_dir_all(&master_path).unwrap();

	let add_list = vec![(
		"/test2.out".to_string(),
		vec![MdDataBlockInfo {
			db_key: Key::from_u64(999),
			replica_count: 2,
			size: 100,
		}],
	)];
	client
		.update_metadata(md_owner_addr, user_hash, add_list, vec![])
		.await
		.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repair_heals_a_corrupted_block() {
	let (a, b) = two_node_ring(22386).await;
	let client = StorageClient::new(a.addr, "fabregas", Duration::from_secs(5));

	let payload = vec![0x55u8; 4096];
	let key = client
		.put_data_block(payload, None, 2, true, 3)
		.await
		.unwrap();

	// corrupt one payload byte of the master copy on its owner
	let master_owner_addr = a.op.find_range(key).unwrap().node_addr;
	let (victim, healer) = if master_owner_addr == a.addr {
		(&a, &b)
	} else {
		(&b, &a)
	};
	let block_path = victim
		.op
		.db_path(key, ContentClass::Master, false)
		.unwrap();
	let mut content = std::fs::read(&block_path).unwrap();
	assert!(content.len() > 100 && 100 > HEADER_LEN);
	content[100] ^= 0xff;
	std::fs::write(&block_path, &content).unwrap();

	let check = DhtRpc::CheckDataBlock {
		key,
		class: ContentClass::Master,
		checksum: None,
	};
	let answer = victim.call(check.clone(), None).await;
	assert_eq!(answer.resp.code, codes::INVALID_DATA);

	// the node holding a valid replica detects the divergence and
	// re-pushes the block
	let answer = healer
		.call(
			DhtRpc::RepairDataBlocks {
				check_range_start: None,
				check_range_end: None,
			},
			None,
		)
		.await;
	assert_eq!(answer.resp.code, codes::OK, "{}", answer.resp.message);
	match answer.resp.body {
		ReplyBody::RepairStat(stat) => {
			assert!(stat.repaired_foreign_blocks >= 1);
			assert_eq!(stat.invalid_local_blocks, 0);
		}
		other => panic!("unexpected body {:?}", other),
	}

	let answer = victim.call(check, None).await;
	assert_eq!(answer.resp.code, codes::OK, "{}", answer.resp.message);

	// a quiescent ring has nothing left to repair
	let answer = healer
		.call(
			DhtRpc::RepairDataBlocks {
				check_range_start: None,
				check_range_end: None,
			},
			None,
		)
		.await;
	match answer.resp.body {
		ReplyBody::RepairStat(stat) => assert_eq!(stat.repaired_foreign_blocks, 0),
		other => panic!("unexpected body {:?}", other),
	}
}

//! Thin end-user client speaking the DHT wire protocol: placement is
//! resolved through `GetKeysInfo`, reads fail over across the derived
//! key set

use std::net::SocketAddr;
use std::time::Duration;

use ringstore_block::ContentClass;
use ringstore_metadata::MdDataBlockInfo;
use ringstore_rpc::{BinarySource, Request, Role, RpcClient};
use ringstore_util::error::Error;
use ringstore_util::key::Key;
use ringstore_util::MIN_REPLICA_COUNT;

use crate::proto::*;

pub struct StorageClient {
	rpc: RpcClient,
	endpoint: SocketAddr,
	user_id: String,
}

impl StorageClient {
	pub fn new(endpoint: SocketAddr, user_id: impl Into<String>, timeout: Duration) -> Self {
		Self {
			rpc: RpcClient::new(timeout),
			endpoint,
			user_id: user_id.into(),
		}
	}

	fn user_id_hash(&self) -> Key {
		Key::sha1_of(self.user_id.as_bytes())
	}

	fn request(&self, msg: DhtRpc) -> Request<DhtRpc> {
		// clients have no listening address of their own
		Request::new("0.0.0.0:0".parse().unwrap(), Role::Client, msg)
	}

	async fn call(
		&self,
		to: SocketAddr,
		msg: DhtRpc,
		data: Option<BinarySource>,
	) -> Result<ringstore_rpc::RpcAnswer<ReplyBody>, Error> {
		let answer = self.rpc.call(to, self.request(msg), data).await?;
		if !answer.resp.is_ok() {
			return Err(code_error(answer.resp.code, &answer.resp.message));
		}
		Ok(answer)
	}

	async fn keys_info(
		&self,
		key: Option<Key>,
		replica_count: u8,
	) -> Result<Vec<(Key, ContentClass, SocketAddr)>, Error> {
		let answer = self
			.call(self.endpoint, DhtRpc::GetKeysInfo { key, replica_count }, None)
			.await?;
		match answer.resp.body {
			ReplyBody::KeysInfo { keys } if !keys.is_empty() => Ok(keys),
			_ => Err(Error::Message(format!(
				"GetKeysInfo error: {}",
				answer.resp.message
			))),
		}
	}

	/// Store a data block, letting the network derive the key set.
	/// Returns the master key under which the block can be read back.
	pub async fn put_data_block(
		&self,
		data: Vec<u8>,
		key: Option<Key>,
		replica_count: u8,
		init_block: bool,
		wait_writes: u8,
	) -> Result<Key, Error> {
		loop {
			let keys_info = self.keys_info(key, replica_count).await?;
			let (master_key, _, node_addr) = keys_info[0];

			let msg = DhtRpc::ClientPutData {
				key: Some(master_key),
				replica_count,
				wait_writes_count: wait_writes,
				init_block,
				user_id: self.user_id.clone(),
			};
			match self
				.call(node_addr, msg, Some(BinarySource::Buf(data.clone())))
				.await
			{
				Ok(answer) => match answer.resp.body {
					ReplyBody::PutResult { key, .. } => return Ok(key),
					_ => return Err(Error::Message("Malformed ClientPutData reply".into())),
				},
				// a generated key collided with existing data: try a new one
				Err(Error::AlreadyExists(_)) if key.is_none() => continue,
				Err(e) => return Err(e),
			}
		}
	}

	/// Read a block back, trying each derived key's owner until one
	/// returns the payload
	pub async fn get_data_block(&self, key: Key, replica_count: u8) -> Result<Vec<u8>, Error> {
		let keys_info = self.keys_info(Some(key), replica_count).await?;

		for (key, class, node_addr) in keys_info {
			let msg = DhtRpc::GetDataBlock {
				key,
				class,
				user_id_hash: Some(self.user_id_hash()),
			};
			match self.call(node_addr, msg, None).await {
				Ok(answer) => {
					return answer
						.data
						.ok_or_else(|| Error::Message("GetDataBlock reply carried no data".into()))
				}
				Err(e) if e.is_recoverable() => continue,
				Err(e) => return Err(e),
			}
		}
		Err(Error::NotFound("No data found!".into()))
	}

	pub async fn delete_data_block(&self, key: Key, replica_count: u8) -> Result<(), Error> {
		let msg = DhtRpc::ClientDeleteData {
			key,
			replica_count,
			user_id_hash: None,
			user_id: Some(self.user_id.clone()),
		};
		self.call(self.endpoint, msg, None).await?;
		Ok(())
	}

	pub async fn update_user_profile(
		&self,
		endpoint: SocketAddr,
		user_id_hash: Key,
		storage_size: u64,
	) -> Result<(), Error> {
		let msg = DhtRpc::UpdateUserProfile {
			user_id_hash,
			storage_size,
			bin_flags: 0,
			md_replica_count: MIN_REPLICA_COUNT,
			save_key: None,
		};
		let req = Request::new("0.0.0.0:0".parse().unwrap(), Role::Node, msg);
		let answer: ringstore_rpc::RpcAnswer<ReplyBody> = self.rpc.call(endpoint, req, None).await?;
		if !answer.resp.is_ok() {
			return Err(code_error(answer.resp.code, &answer.resp.message));
		}
		Ok(())
	}

	pub async fn update_metadata(
		&self,
		endpoint: SocketAddr,
		user_id_hash: Key,
		add_list: Vec<(String, Vec<MdDataBlockInfo>)>,
		rm_list: Vec<String>,
	) -> Result<(), Error> {
		let msg = DhtRpc::UpdateMetadata {
			user_id_hash,
			key: None,
			add_list,
			rm_list,
		};
		let req = Request::new("0.0.0.0:0".parse().unwrap(), Role::Node, msg);
		let answer: ringstore_rpc::RpcAnswer<ReplyBody> = self.rpc.call(endpoint, req, None).await?;
		if !answer.resp.is_ok() {
			return Err(code_error(answer.resp.code, &answer.resp.message));
		}
		Ok(())
	}
}

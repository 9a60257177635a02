//! Wire vocabulary of the DHT: one typed variant per named method, the
//! stable numeric return codes, and the reply bodies

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use ringstore_block::ContentClass;
use ringstore_metadata::{MdDataBlockInfo, PathInfo};
use ringstore_table::HashRange;
use ringstore_util::error::Error;
use ringstore_util::key::Key;

/// Stable numeric return codes carried in every response envelope
pub mod codes {
	pub const OK: i64 = 0;
	pub const ERROR: i64 = 1;
	pub const DONT_STARTED: i64 = 2;
	pub const PERMISSION_DENIED: i64 = 3;
	pub const NEED_UPDATE: i64 = 101;
	pub const JUST_WAIT: i64 = 201;
	pub const NO_DATA: i64 = 324;
	pub const OLD_DATA: i64 = 325;
	pub const INVALID_DATA: i64 = 326;
	pub const NO_FREE_SPACE: i64 = 327;
	pub const ALREADY_EXISTS: i64 = 330;
	pub const MD_NO_FREE_SPACE: i64 = 400;
	pub const MD_NOT_INIT: i64 = 401;
}

/// Map a local error to its wire code
pub fn error_code(e: &Error) -> i64 {
	match e {
		Error::NoData(_) | Error::NotFound(_) => codes::NO_DATA,
		Error::OldDataDetected => codes::OLD_DATA,
		Error::InvalidDataBlock(_) => codes::INVALID_DATA,
		Error::NoFreeSpace(_) => codes::NO_FREE_SPACE,
		Error::MdNoFreeSpace(_) => codes::MD_NO_FREE_SPACE,
		Error::MdNotInitialized => codes::MD_NOT_INIT,
		Error::AlreadyExists(_) => codes::ALREADY_EXISTS,
		Error::PermissionDenied(_) => codes::PERMISSION_DENIED,
		Error::Remote(code, _) => *code,
		_ => codes::ERROR,
	}
}

/// Map a remote return code back to a typed error
pub fn code_error(code: i64, message: &str) -> Error {
	match code {
		codes::NO_DATA => Error::NotFound(message.to_string()),
		codes::OLD_DATA => Error::OldDataDetected,
		codes::INVALID_DATA => Error::InvalidDataBlock(message.to_string()),
		codes::NO_FREE_SPACE => Error::NoFreeSpace(message.to_string()),
		codes::MD_NO_FREE_SPACE => Error::MdNoFreeSpace(message.to_string()),
		codes::MD_NOT_INIT => Error::MdNotInitialized,
		codes::ALREADY_EXISTS => Error::AlreadyExists(message.to_string()),
		codes::PERMISSION_DENIED => Error::PermissionDenied(message.to_string()),
		other => Error::Remote(other, message.to_string()),
	}
}

/// States of the membership state machine
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NodeStatus {
	PreInit,
	Initialize,
	NormalWork,
	Destroying,
}

impl NodeStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			NodeStatus::PreInit => "preinit",
			NodeStatus::Initialize => "init",
			NodeStatus::NormalWork => "normwork",
			NodeStatus::Destroying => "destroying",
		}
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum NotifyKind {
	Info,
	Alert,
}

/// Out-of-band event fanned out to the fleet
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
	pub kind: NotifyKind,
	pub topic: String,
	pub message: String,
	pub provider: SocketAddr,
	/// RFC 3339 timestamp stamped by the provider
	pub at: String,
}

/// The DHT's named methods; serde variant names are the on-the-wire
/// identifiers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRpc {
	PutDataBlock {
		key: Key,
		class: ContentClass,
		user_id_hash: Option<Key>,
		init_block: bool,
		carefully_save: bool,
		stored_unixtime: Option<f64>,
	},
	GetDataBlock {
		key: Key,
		class: ContentClass,
		user_id_hash: Option<Key>,
	},
	DeleteDataBlock {
		key: Key,
		class: ContentClass,
		user_id_hash: Option<Key>,
		carefully_delete: bool,
	},
	CheckDataBlock {
		key: Key,
		class: ContentClass,
		checksum: Option<Key>,
	},
	ClientPutData {
		key: Option<Key>,
		replica_count: u8,
		wait_writes_count: u8,
		init_block: bool,
		user_id: String,
	},
	ClientDeleteData {
		key: Key,
		replica_count: u8,
		user_id_hash: Option<Key>,
		user_id: Option<String>,
	},
	GetKeysInfo {
		key: Option<Key>,
		replica_count: u8,
	},
	UpdateHashRangeTable {
		append: Vec<HashRange>,
		remove: Vec<HashRange>,
	},
	CheckHashRangeTable {
		mod_index: u64,
		ranges_count: usize,
		range_start: Key,
		range_end: Key,
	},
	GetRangesTable,
	SplitRangeRequest {
		start_key: Key,
		end_key: Key,
	},
	SplitRangeCancel,
	PullSubrangeRequest {
		start_key: Key,
		end_key: Key,
		subrange_size: u64,
	},
	GetRangeDataRequest,
	UpdateUserProfile {
		user_id_hash: Key,
		storage_size: u64,
		bin_flags: u16,
		md_replica_count: u8,
		save_key: Option<Key>,
	},
	UpdateMetadata {
		user_id_hash: Key,
		key: Option<Key>,
		add_list: Vec<(String, Vec<MdDataBlockInfo>)>,
		rm_list: Vec<String>,
	},
	RestoreMetadata {
		user_id_hash: Key,
		key: Key,
		class: ContentClass,
	},
	PutObjectPart {
		obj_path: String,
		seek: u64,
		replica_count: u8,
		wait_writes_count: u8,
		key: Option<Key>,
		init_block: bool,
		user_id: String,
	},
	GetObjectInfo {
		obj_path: String,
		req_user_info: bool,
		md_replica_count: u8,
		get_key: Option<Key>,
		user_id_hash: Option<Key>,
		user_id: Option<String>,
	},
	RepairDataBlocks {
		check_range_start: Option<Key>,
		check_range_end: Option<Key>,
	},
	NodeStatistic,
	Notify(Notification),
}

impl DhtRpc {
	/// Wire identifier, used in log lines
	pub fn method(&self) -> &'static str {
		match self {
			DhtRpc::PutDataBlock { .. } => "PutDataBlock",
			DhtRpc::GetDataBlock { .. } => "GetDataBlock",
			DhtRpc::DeleteDataBlock { .. } => "DeleteDataBlock",
			DhtRpc::CheckDataBlock { .. } => "CheckDataBlock",
			DhtRpc::ClientPutData { .. } => "ClientPutData",
			DhtRpc::ClientDeleteData { .. } => "ClientDeleteData",
			DhtRpc::GetKeysInfo { .. } => "GetKeysInfo",
			DhtRpc::UpdateHashRangeTable { .. } => "UpdateHashRangeTable",
			DhtRpc::CheckHashRangeTable { .. } => "CheckHashRangeTable",
			DhtRpc::GetRangesTable => "GetRangesTable",
			DhtRpc::SplitRangeRequest { .. } => "SplitRangeRequest",
			DhtRpc::SplitRangeCancel => "SplitRangeCancel",
			DhtRpc::PullSubrangeRequest { .. } => "PullSubrangeRequest",
			DhtRpc::GetRangeDataRequest => "GetRangeDataRequest",
			DhtRpc::UpdateUserProfile { .. } => "UpdateUserProfile",
			DhtRpc::UpdateMetadata { .. } => "UpdateMetadata",
			DhtRpc::RestoreMetadata { .. } => "RestoreMetadata",
			DhtRpc::PutObjectPart { .. } => "PutObjectPart",
			DhtRpc::GetObjectInfo { .. } => "GetObjectInfo",
			DhtRpc::RepairDataBlocks { .. } => "RepairDataBlocks",
			DhtRpc::NodeStatistic => "NodeStatistic",
			DhtRpc::Notify(_) => "Notify",
		}
	}
}

/// Client-visible view of a user's quota record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserInfoView {
	pub storage_size: u64,
	pub used_size: u64,
	pub flags: u16,
}

/// Counters reported by one repair pass
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RepairStat {
	pub processed_local_blocks: u64,
	pub invalid_local_blocks: u64,
	pub repaired_foreign_blocks: u64,
	pub failed_repair_foreign_blocks: u64,
}

impl std::fmt::Display for RepairStat {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"processed_local_blocks={}, invalid_local_blocks={}, \
			 repaired_foreign_blocks={}, failed_repair_foreign_blocks={}",
			self.processed_local_blocks,
			self.invalid_local_blocks,
			self.repaired_foreign_blocks,
			self.failed_repair_foreign_blocks
		)
	}
}

/// The `DHTInfo` submap of a `NodeStatistic` reply
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtInfo {
	pub status: String,
	pub range_start: Key,
	pub range_end: Key,
	pub range_size: u64,
	pub replicas_size: u64,
	pub metadata_size: u64,
	pub free_size: u64,
	pub free_size_percents: f64,
}

/// Typed reply bodies; `None` for methods that only return a code
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplyBody {
	None,
	PutResult {
		key: Key,
		checksum: Key,
		size: u64,
	},
	KeysInfo {
		keys: Vec<(Key, ContentClass, SocketAddr)>,
	},
	TableStatus {
		mod_index: u64,
		ranges_count: usize,
		force: bool,
	},
	Checksum {
		checksum: Key,
	},
	SubrangeSize {
		size: u64,
	},
	SplitCancelled,
	ObjectInfo {
		user_info: Option<UserInfoView>,
		path_info: PathInfo,
		data_blocks: Option<Vec<MdDataBlockInfo>>,
	},
	RepairStat(RepairStat),
	DhtInfo(DhtInfo),
}

impl Default for ReplyBody {
	fn default() -> Self {
		ReplyBody::None
	}
}

/// Response envelope alias used across the operation handlers
pub type DhtResponse = ringstore_rpc::Response<ReplyBody>;
pub type DhtRequest = ringstore_rpc::Request<DhtRpc>;

//! Contains type and functions related to Ringstore configuration file

use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Path where the node keeps its DHT range and metadata stores
	pub home_dir: PathBuf,

	/// Name this node presents to the network
	pub node_name: String,

	/// Address to bind for RPC
	pub rpc_bind_addr: SocketAddr,
	/// Public address of this node, as seen by other nodes.
	/// Defaults to `rpc_bind_addr`.
	pub rpc_public_addr: Option<SocketAddr>,

	/// Addresses of nodes already part of the ring
	#[serde(default)]
	pub bootstrap_nodes: Vec<SocketAddr>,

	/// Client-side deadline on every RPC, in seconds
	#[serde(default = "default_rpc_timeout")]
	pub rpc_timeout: u64,

	/// DHT behavior tunables
	#[serde(default)]
	pub dht: DhtConfig,
}

/// DHT tunables; all durations are in seconds
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DhtConfig {
	/// Wait this long for a usable range before a join retry
	pub wait_range_timeout: u64,
	/// Consecutive futile join attempts before giving up
	pub dht_cycle_try_count: u32,
	/// Sleep while no neighbour answers during init
	pub init_dht_wait_neighbour_timeout: u64,
	/// A node refuses a split when it would stay above this used percentage
	pub allow_used_size_percents: f64,
	/// One-shot ALERT notification above this used percentage
	pub danger_used_size_percents: f64,
	/// Start pulling subranges to neighbours above this used percentage
	pub max_used_size_percents: f64,
	/// Fraction of the local range offered in one pull, in percent
	pub pull_subrange_size_perc: u32,
	/// Block the range for writes below this free percentage
	pub critical_free_space_percent: f64,
	/// Period of the ranges-table consistency probe
	pub check_hash_table_timeout: u64,
	/// Period of the disk-pressure / foreign-handoff monitor
	pub monitor_dht_ranges_timeout: u64,
	/// Grace period before touching freshly written metadata
	pub wait_file_md_timedelta: u64,
	/// Pause after removing a dead neighbour's range
	pub wait_dht_table_update: u64,
	/// Debounce window for full-table fetches
	pub ranges_table_flapping_timeout: u64,
	/// Period of the metadata store cache flush
	pub flush_md_cache_timeout: u64,
	/// Grace period when joining background tasks on shutdown
	pub dht_stop_timeout: u64,
}

impl Default for DhtConfig {
	fn default() -> Self {
		Self {
			wait_range_timeout: 120,
			dht_cycle_try_count: 3,
			init_dht_wait_neighbour_timeout: 1,
			allow_used_size_percents: 70.0,
			danger_used_size_percents: 80.0,
			max_used_size_percents: 90.0,
			pull_subrange_size_perc: 15,
			critical_free_space_percent: 3.0,
			check_hash_table_timeout: 60,
			monitor_dht_ranges_timeout: 30,
			wait_file_md_timedelta: 10,
			wait_dht_table_update: 3,
			ranges_table_flapping_timeout: 3,
			flush_md_cache_timeout: 600,
			dht_stop_timeout: 2,
		}
	}
}

fn default_rpc_timeout() -> u64 {
	30
}

impl Config {
	pub fn rpc_public_addr(&self) -> SocketAddr {
		self.rpc_public_addr.unwrap_or(self.rpc_bind_addr)
	}
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_minimal_config() {
		let config: Config = toml::from_str(
			r#"
			home_dir = "/tmp/ringstore"
			node_name = "node_1986"
			rpc_bind_addr = "127.0.0.1:1986"
			bootstrap_nodes = ["127.0.0.1:1987"]
			"#,
		)
		.unwrap();
		assert_eq!(config.node_name, "node_1986");
		assert_eq!(config.dht.check_hash_table_timeout, 60);
		assert_eq!(config.dht.allow_used_size_percents, 70.0);
		assert_eq!(config.rpc_timeout, 30);
		assert_eq!(config.rpc_public_addr(), "127.0.0.1:1986".parse().unwrap());
	}
}

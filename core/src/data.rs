use crate::{
	server_pool::StoredCandidate,
	types::NodeId,
	value_tracker::{GlobalStats, NodeStats},
};
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};

mod keys;
use keys::*;

mod mem_db;
pub use mem_db::*;

#[cfg(feature = "rocksdb")]
mod rocks_db;
#[cfg(feature = "rocksdb")]
pub use rocks_db::RocksDB;

#[cfg(not(feature = "rocksdb"))]
pub type DB = mem_db::MemoryDB;
#[cfg(feature = "rocksdb")]
pub type DB = rocks_db::RocksDB;

/// Opens the database at the configured path, in memory unless built with `rocksdb`.
#[cfg(not(feature = "rocksdb"))]
pub fn open(_path: &str) -> Result<DB> {
	Ok(DB::default())
}

#[cfg(feature = "rocksdb")]
pub fn open(path: &str) -> Result<DB> {
	DB::open(path)
}

/// Column family for peer statistics and candidate tables
pub const LIGHT_STATE_CF: &str = "light_state_cf";

/// Type of the database key which we can get from the custom key.
pub trait RecordKey {
	type Type: Serialize + DeserializeOwned;

	fn space(&self) -> Option<&'static str>;

	/// Returns key space (if any) and key
	fn key(&self) -> String;
}

/// Key-value store holding JSON encoded records.
///
/// Errors are returned to the caller, which decides whether they are fatal.
/// The retrieval path only logs them.
pub trait Database {
	/// Puts value for given key into database.
	fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<()>;

	/// Gets value for given key.
	///
	/// Returns an error if the stored value can't be decoded into the record type.
	fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>>;

	/// Deletes value from the database for the given key.
	fn delete<T: RecordKey>(&self, key: T) -> Result<()>;
}

/// Value tracker statistics of a single server.
pub struct NodeStatsKey(pub NodeId);

impl RecordKey for NodeStatsKey {
	type Type = NodeStats;

	fn space(&self) -> Option<&'static str> {
		Some(LIGHT_STATE_CF)
	}

	fn key(&self) -> String {
		let NodeStatsKey(node_id) = self;
		format!("{VALUE_TRACKER_NODE_PREFIX}:{node_id}")
	}
}

pub struct GlobalStatsKey;

impl RecordKey for GlobalStatsKey {
	type Type = GlobalStats;

	fn space(&self) -> Option<&'static str> {
		Some(LIGHT_STATE_CF)
	}

	fn key(&self) -> String {
		VALUE_TRACKER_GLOBAL_KEY.into()
	}
}

pub struct ServerPoolKey;

impl RecordKey for ServerPoolKey {
	type Type = Vec<StoredCandidate>;

	fn space(&self) -> Option<&'static str> {
		Some(LIGHT_STATE_CF)
	}

	fn key(&self) -> String {
		SERVER_POOL_NODES_KEY.into()
	}
}

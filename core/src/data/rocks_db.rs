use super::{Database, RecordKey, LIGHT_STATE_CF};
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use rocksdb::{ColumnFamilyDescriptor, Options};
use std::{path::Path, sync::Arc};

#[derive(Clone)]
pub struct RocksDB {
	db: Arc<rocksdb::DB>,
}

#[derive(Eq, Hash, PartialEq)]
pub struct RocksDBKey(Option<&'static str>, Vec<u8>);

impl<T: RecordKey> From<T> for RocksDBKey {
	fn from(value: T) -> Self {
		RocksDBKey(value.space(), value.key().into_bytes())
	}
}

impl RocksDB {
	pub fn open(path: impl AsRef<Path>) -> Result<RocksDB> {
		let cf_opts = vec![ColumnFamilyDescriptor::new(
			LIGHT_STATE_CF,
			Options::default(),
		)];

		let mut db_opts = Options::default();
		db_opts.create_if_missing(true);
		db_opts.create_missing_column_families(true);

		let db = rocksdb::DB::open_cf_descriptors(&db_opts, path, cf_opts)
			.wrap_err("Failed to open RocksDB")?;
		Ok(RocksDB { db: Arc::new(db) })
	}

	fn cf_handle(&self, cf: &str) -> Result<Arc<rocksdb::BoundColumnFamily<'_>>> {
		self.db
			.cf_handle(cf)
			.ok_or_else(|| eyre!("Couldn't get Column Family handle {cf} from RocksDB"))
	}
}

impl Database for RocksDB {
	fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<()> {
		let RocksDBKey(column_family, key) = key.into();
		let value = serde_json::to_vec(&value)?;
		// if Column Family descriptor was provided, put the key in that partition
		let Some(cf) = column_family else {
			// else, just put it in the default partition
			return self
				.db
				.put(key, value)
				.wrap_err("Put operation has failed on RocksDB");
		};

		self.db
			.put_cf(&self.cf_handle(cf)?, key, value)
			.wrap_err("Put operation with Column Family has failed on RocksDB")
	}

	fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>> {
		let RocksDBKey(column_family, key) = key.into();
		let value = match column_family {
			Some(cf) => self
				.db
				.get_cf(&self.cf_handle(cf)?, key)
				.wrap_err("Get operation with Column Family has failed on RocksDB")?,
			None => self
				.db
				.get(key)
				.wrap_err("Get operation has failed on RocksDB")?,
		};

		value
			.map(|value| serde_json::from_slice(&value))
			.transpose()
			.wrap_err("Failed to decode the RocksDB data")
	}

	fn delete<T: RecordKey>(&self, key: T) -> Result<()> {
		let RocksDBKey(column_family, key) = key.into();
		// if Column Family descriptor was provided, delete the key from that partition
		let Some(cf) = column_family else {
			// else, just delete it from the default partition
			return self
				.db
				.delete(key)
				.wrap_err("Delete operation has failed on RocksDB");
		};
		self.db
			.delete_cf(&self.cf_handle(cf)?, key)
			.wrap_err("Delete operation with Column Family has failed on RocksDB")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{data::GlobalStatsKey, value_tracker::GlobalStats};

	#[test]
	fn persists_across_reopen() {
		let dir = tempfile::tempdir().unwrap();
		{
			let db = RocksDB::open(dir.path()).unwrap();
			db.put(GlobalStatsKey, GlobalStats::default()).unwrap();
		}
		let db = RocksDB::open(dir.path()).unwrap();
		assert!(db.get(GlobalStatsKey).unwrap().is_some());
		db.delete(GlobalStatsKey).unwrap();
		assert!(db.get(GlobalStatsKey).unwrap().is_none());
	}
}

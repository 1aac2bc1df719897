use crate::data::Database;
use color_eyre::{eyre::eyre, Result};
use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};

use super::RecordKey;

#[derive(Clone)]
pub struct MemoryDB {
	map: Arc<RwLock<HashMap<HashMapKey, String>>>,
}

#[derive(Eq, Hash, PartialEq)]
pub struct HashMapKey(pub String);

impl Default for MemoryDB {
	fn default() -> Self {
		MemoryDB {
			map: Arc::new(RwLock::new(HashMap::new())),
		}
	}
}

impl<T: RecordKey> From<T> for HashMapKey {
	fn from(value: T) -> Self {
		let key = value.key();
		HashMapKey(match value.space() {
			Some(space) => format!("{space}::{key}"),
			None => key,
		})
	}
}

impl MemoryDB {
	/// Stores a raw value, bypassing the record encoding.
	#[cfg(test)]
	pub(crate) fn put_raw<T: RecordKey>(&self, key: T, value: &str) {
		let mut map = self.map.write().expect("Lock acquired");
		map.insert(key.into(), value.to_string());
	}
}

impl Database for MemoryDB {
	fn put<T: RecordKey>(&self, key: T, value: T::Type) -> Result<()> {
		let value = serde_json::to_string(&value)?;
		let mut map = self
			.map
			.write()
			.map_err(|_| eyre!("MemoryDB lock poisoned"))?;
		map.insert(key.into(), value);
		Ok(())
	}

	fn get<T: RecordKey>(&self, key: T) -> Result<Option<T::Type>> {
		let map = self
			.map
			.read()
			.map_err(|_| eyre!("MemoryDB lock poisoned"))?;
		map.get(&key.into())
			.map(|value| serde_json::from_str(value))
			.transpose()
			.map_err(Into::into)
	}

	fn delete<T: RecordKey>(&self, key: T) -> Result<()> {
		let mut map = self
			.map
			.write()
			.map_err(|_| eyre!("MemoryDB lock poisoned"))?;
		map.remove(&key.into());
		Ok(())
	}
}

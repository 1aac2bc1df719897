//! Shared light client types.
use color_eyre::{eyre::eyre, Report, Result};
use serde::{Deserialize, Serialize};
use std::{
	collections::HashMap,
	fmt::{self, Debug, Display, Formatter},
	str::FromStr,
	time::Duration,
};
use strum::{EnumCount, EnumIter};

/// Stable 32-byte identity of a server peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
	/// Shortened form used in logs.
	pub fn short(&self) -> String {
		hex::encode(&self.0[..4])
	}
}

impl From<[u8; 32]> for NodeId {
	fn from(value: [u8; 32]) -> Self {
		NodeId(value)
	}
}

impl Display for NodeId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

impl Debug for NodeId {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "NodeId({})", self.short())
	}
}

impl FromStr for NodeId {
	type Err = Report;

	fn from_str(value: &str) -> Result<Self> {
		let bytes = hex::decode(value.trim_start_matches("0x"))?;
		let bytes: [u8; 32] = bytes
			.try_into()
			.map_err(|bytes: Vec<u8>| eyre!("Invalid node id length: {}", bytes.len()))?;
		Ok(NodeId(bytes))
	}
}

impl TryFrom<String> for NodeId {
	type Error = Report;

	fn try_from(value: String) -> Result<Self> {
		value.parse()
	}
}

impl From<NodeId> for String {
	fn from(value: NodeId) -> Self {
		value.to_string()
	}
}

/// Kinds of on-demand retrieval requests, keying both the cost tables and the value statistics.
#[derive(
	Clone,
	Copy,
	Debug,
	PartialEq,
	Eq,
	Hash,
	PartialOrd,
	Ord,
	Serialize,
	Deserialize,
	strum::Display,
	EnumIter,
	EnumCount,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestType {
	BlockHeaders,
	BlockBodies,
	Receipts,
	Code,
	StateProofs,
	HelperTrieProofs,
	TxStatus,
	SendTx,
}

/// Distributor assigned sequence number of a pending request.
#[derive(
	Clone,
	Copy,
	Debug,
	PartialEq,
	Eq,
	Hash,
	PartialOrd,
	Ord,
	Serialize,
	Deserialize,
	derive_more::Display,
	derive_more::From,
)]
pub struct RequestId(pub u64);

/// Chain head advertised by a server peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChainHead {
	pub hash: [u8; 32],
	pub number: u64,
	pub total_difficulty: u128,
}

/// Cost of a single request kind, as announced by the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCost {
	pub base: u64,
	pub per_item: u64,
}

/// Per peer cost table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCosts(pub HashMap<RequestType, RequestCost>);

impl RequestCosts {
	/// Uniform cost table, the same base and per item cost for every request type.
	pub fn uniform(base: u64, per_item: u64) -> Self {
		use strum::IntoEnumIterator;
		RequestCosts(
			RequestType::iter()
				.map(|request_type| (request_type, RequestCost { base, per_item }))
				.collect(),
		)
	}

	pub fn base(&self, request_type: RequestType) -> u64 {
		self.0
			.get(&request_type)
			.map(|cost| cost.base)
			.unwrap_or_default()
	}

	/// Cost of a request with the given item count, `base + per_item * amount`.
	pub fn cost(&self, request_type: RequestType, amount: u64) -> u64 {
		let Some(cost) = self.0.get(&request_type) else {
			return 0;
		};
		cost.base
			.saturating_add(cost.per_item.saturating_mul(amount))
	}
}

/// Server address reported by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
	pub id: NodeId,
	pub address: String,
}

impl NodeRecord {
	pub fn new(id: NodeId, address: impl Into<String>) -> Self {
		Self {
			id,
			address: address.into(),
		}
	}
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_secs())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_secs(value))
	}
}

pub mod duration_millis_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(value))
	}
}

pub mod duration_vec_seconds_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.collect_seq(durations.iter().map(Duration::as_secs))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let values = Vec::<u64>::deserialize(deserializer)?;
		Ok(values.into_iter().map(Duration::from_secs).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test]
	fn node_id_hex_round_trip() {
		let id = NodeId([0xab; 32]);
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
		let decoded: NodeId = serde_json::from_str(&json).unwrap();
		assert_eq!(decoded, id);
		assert_eq!(id.short(), "abababab");
	}

	#[test_case("0x" ; "prefix only")]
	#[test_case("abcd" ; "too short")]
	#[test_case("zz" ; "not hex")]
	fn node_id_rejects_invalid(value: &str) {
		assert!(value.parse::<NodeId>().is_err());
	}

	#[test_case(RequestType::BlockHeaders, 0 => 10 ; "no items")]
	#[test_case(RequestType::BlockHeaders, 3 => 16 ; "three items")]
	#[test_case(RequestType::Receipts, 5 => 0 ; "unknown request type")]
	fn request_cost(request_type: RequestType, amount: u64) -> u64 {
		let mut costs = RequestCosts::default();
		costs.0.insert(
			RequestType::BlockHeaders,
			RequestCost {
				base: 10,
				per_item: 2,
			},
		);
		costs.cost(request_type, amount)
	}

	#[test]
	fn request_type_names() {
		assert_eq!(RequestType::HelperTrieProofs.to_string(), "helper_trie_proofs");
		let json = serde_json::to_string(&RequestType::SendTx).unwrap();
		assert_eq!(json, "\"send_tx\"");
		assert_eq!(RequestType::COUNT, 8);
	}
}

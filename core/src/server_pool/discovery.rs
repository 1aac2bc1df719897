use crate::types::NodeRecord;
use futures::stream::{self, BoxStream, StreamExt};
use rand::seq::SliceRandom;

/// Source of server candidates.
///
/// Every call starts a fresh pass, so an exhausted source can be restarted.
pub trait Discovery: Send + Sync {
	fn discover(&self) -> BoxStream<'static, NodeRecord>;
}

/// Fixed list of servers, served in random order on each pass.
#[derive(Clone, Debug, Default)]
pub struct StaticDiscovery {
	records: Vec<NodeRecord>,
}

impl StaticDiscovery {
	pub fn new(records: Vec<NodeRecord>) -> Self {
		Self { records }
	}
}

impl Discovery for StaticDiscovery {
	fn discover(&self) -> BoxStream<'static, NodeRecord> {
		let mut records = self.records.clone();
		records.shuffle(&mut rand::thread_rng());
		stream::iter(records).boxed()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::NodeId;

	#[tokio::test]
	async fn static_discovery_restarts() {
		let records: Vec<_> = (1..=5u8)
			.map(|byte| NodeRecord::new(NodeId([byte; 32]), format!("10.0.0.{byte}:30303")))
			.collect();
		let discovery = StaticDiscovery::new(records.clone());

		for _ in 0..2 {
			let mut found: Vec<_> = discovery.discover().collect().await;
			found.sort_by_key(|record| record.id);
			assert_eq!(found, records);
		}
	}
}

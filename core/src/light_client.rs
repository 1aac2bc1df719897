//! Light client retrieval core, wiring server peers, scoring, dialing and retrieval together.
//!
//! # Flow
//!
//! * Server pool hands out dial candidates, the connection layer dials them
//! * Connected servers are registered in the peer set, which notifies the value tracker, the server pool and the distributor, in that order
//! * Odr requests are submitted through [`LightClient::retrieve`] and assigned to the best server by the distributor
//! * Replies arrive through [`LightClient::deliver`], are decoded and validated, and failures move the request to the next server
//! * Every outcome updates the value tracker, whose estimates drive both the assignment and the dial order
//!
//! # Notes
//!
//! Stopping the client, directly or by triggering the shutdown controller, cancels every pending retrieval.
use crate::{
	config::LightConfig,
	data::{self, Database, DB},
	distributor::{self, RequestDistributor},
	peers::{self, Peer, PeerSet},
	retrieve::{self, OdrRequest, RetrieveManager},
	server_pool::{DialCandidates, Discovery, ServerPool},
	shutdown::Controller,
	types::{ChainHead, NodeId, RequestCosts, RequestId},
	utils::{init_logging, spawn_in_span},
	value_tracker::ValueTracker,
};
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct LightClient<D: Database> {
	peers: Arc<PeerSet>,
	value_tracker: Arc<ValueTracker<D>>,
	server_pool: Arc<ServerPool<D>>,
	distributor: RequestDistributor,
	retriever: RetrieveManager,
	shutdown: Controller<String>,
	started: Arc<AtomicBool>,
}

impl<D: Database> Clone for LightClient<D> {
	fn clone(&self) -> Self {
		Self {
			peers: self.peers.clone(),
			value_tracker: self.value_tracker.clone(),
			server_pool: self.server_pool.clone(),
			distributor: self.distributor.clone(),
			retriever: self.retriever.clone(),
			shutdown: self.shutdown.clone(),
			started: self.started.clone(),
		}
	}
}

impl LightClient<DB> {
	/// Sets up logging, opens the configured database and builds the client.
	///
	/// An already installed global subscriber is kept.
	pub fn from_config(
		config: &LightConfig,
		discovery: Arc<dyn Discovery>,
		shutdown: Controller<String>,
	) -> Result<Self> {
		config.validate()?;
		if let Err(error) = init_logging(config.log_level, config.log_format_json) {
			warn!(%error, "Keeping the installed tracing subscriber");
		}
		let db = data::open(&config.db_path)
			.wrap_err_with(|| format!("Failed to open database at {}", config.db_path))?;
		Self::new(config, db, discovery, shutdown)
	}
}

impl<D: Database + Clone + Send + Sync + 'static> LightClient<D> {
	/// Builds the components and subscribes them to the peer set, rejecting an invalid configuration.
	pub fn new(
		config: &LightConfig,
		db: D,
		discovery: Arc<dyn Discovery>,
		shutdown: Controller<String>,
	) -> Result<Self> {
		config.validate()?;
		let value_tracker = Arc::new(ValueTracker::new(
			config.value_tracker.clone(),
			db.clone(),
		));
		let server_pool = Arc::new(ServerPool::new(
			config.server_pool.clone(),
			db,
			value_tracker.clone(),
			discovery,
		));
		let distributor =
			RequestDistributor::new(config.distributor.clone(), value_tracker.clone());
		let retriever = RetrieveManager::new(config.retrieve.clone(), distributor.clone());

		let peers = Arc::new(PeerSet::new());
		peers.subscribe(value_tracker.clone());
		peers.subscribe(server_pool.clone());
		peers.subscribe(Arc::new(distributor.clone()));

		Ok(Self {
			peers,
			value_tracker,
			server_pool,
			distributor,
			retriever,
			shutdown,
			started: Arc::new(AtomicBool::new(false)),
		})
	}

	/// Spawns the background loops, they stop when the shutdown is triggered.
	///
	/// Fails if the client was already started or is shutting down.
	pub fn start(&self) -> Result<()> {
		if self.shutdown.is_shutdown_triggered() {
			return Err(eyre!("Cannot start light client, shutdown already triggered"));
		}
		if self.started.swap(true, Ordering::AcqRel) {
			return Err(eyre!("Light client already started"));
		}

		let client = self.clone();
		let watcher = self.shutdown.with_delay(async move {
			let reason = client.shutdown.triggered_shutdown().await;
			debug!(%reason, "Shutdown triggered, stopping light client");
			client.stop();
		})?;

		spawn_in_span(
			self.value_tracker
				.clone()
				.run(self.shutdown.clone()),
		);
		spawn_in_span(self.distributor.clone().run(self.shutdown.clone()));
		self.server_pool.start(self.shutdown.clone());
		spawn_in_span(watcher);
		info!("Light client started");
		Ok(())
	}

	/// Stops dialing, persists the statistics and cancels pending retrievals.
	pub fn stop(&self) {
		self.server_pool.stop();
		self.value_tracker.stop();
		self.peers.close();
		self.distributor.close();
		let _ = self
			.shutdown
			.trigger_shutdown("Light client stopped".to_string());
		let reason = self.shutdown.shutdown_reason().unwrap_or_default();
		info!(%reason, "Light client stopped");
	}

	pub fn dial_candidates(&self) -> DialCandidates<D> {
		self.server_pool.dial_candidates()
	}

	/// Registers a connected server, a rejected one is handed back to the dial candidates.
	pub fn connect(&self, peer: Peer) -> Result<Arc<Peer>, peers::Error> {
		let peer = Arc::new(peer);
		self.value_tracker.preload(peer.id());
		if let Err(error) = self.peers.register(peer.clone()) {
			self.value_tracker.discard_preloaded(&peer.id());
			self.server_pool.dial_aborted(&peer.id());
			return Err(error);
		}
		Ok(peer)
	}

	pub fn disconnect(&self, id: &NodeId) -> Result<(), peers::Error> {
		self.peers.unregister(id)
	}

	/// Reports a dial attempt that didn't connect.
	pub fn dial_failed(&self, id: &NodeId) {
		self.server_pool.dial_failed(id);
	}

	/// Applies a head announcement, requests waiting for that head may now be served.
	pub fn announce(&self, id: &NodeId, head: ChainHead) -> Result<(), peers::Error> {
		let peer = self.peers.peer(id).ok_or(peers::Error::NotFound(*id))?;
		peer.announce(head);
		self.distributor.peer_updated();
		Ok(())
	}

	pub fn set_can_send(&self, id: &NodeId, can_send: bool) -> Result<(), peers::Error> {
		let peer = self.peers.peer(id).ok_or(peers::Error::NotFound(*id))?;
		peer.set_can_send(can_send);
		self.distributor.peer_updated();
		Ok(())
	}

	pub fn set_costs(&self, id: &NodeId, costs: RequestCosts) -> Result<(), peers::Error> {
		let peer = self.peers.peer(id).ok_or(peers::Error::NotFound(*id))?;
		self.value_tracker.set_costs(id, costs.clone());
		peer.set_costs(costs);
		Ok(())
	}

	pub async fn retrieve<R, F>(
		&self,
		request: R,
		validate: F,
		deadline: Option<Instant>,
	) -> Result<R::Reply, retrieve::Error>
	where
		R: OdrRequest,
		F: Fn(&R, &R::Reply) -> Result<()> + Send + Sync + 'static,
	{
		self.shutdown
			.with_cancel(self.retriever.retrieve(request, validate, deadline))
			.await
			.unwrap_or_else(|reason| {
				debug!(%reason, "Retrieval cancelled by shutdown");
				Err(distributor::Error::Cancelled.into())
			})
	}

	/// Reply callback of the wire layer.
	pub fn deliver(&self, peer: &NodeId, id: RequestId, payload: Vec<u8>) -> bool {
		self.retriever.deliver(peer, id, payload)
	}

	pub fn peers(&self) -> &Arc<PeerSet> {
		&self.peers
	}

	pub fn value_tracker(&self) -> &Arc<ValueTracker<D>> {
		&self.value_tracker
	}

	pub fn server_pool(&self) -> &Arc<ServerPool<D>> {
		&self.server_pool
	}

	pub fn retriever(&self) -> &RetrieveManager {
		&self.retriever
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		data::MemoryDB,
		distributor,
		peers::Wire,
		server_pool::{ConnectionState, StaticDiscovery},
		types::{NodeRecord, RequestType},
	};
	use async_trait::async_trait;
	use color_eyre::eyre::ensure;
	use std::time::Duration;
	use tokio::{
		sync::mpsc::{unbounded_channel, UnboundedSender},
		time,
	};

	fn node(byte: u8) -> NodeId {
		NodeId([byte; 32])
	}

	fn record(byte: u8) -> NodeRecord {
		NodeRecord::new(node(byte), format!("10.0.0.{byte}:30303"))
	}

	struct ChannelWire {
		sent: UnboundedSender<(NodeId, RequestId, Vec<u8>)>,
	}

	#[async_trait]
	impl Wire for ChannelWire {
		async fn send_request(
			&self,
			peer: NodeId,
			request_id: RequestId,
			_: RequestType,
			payload: Vec<u8>,
		) -> Result<()> {
			let _ = self.sent.send((peer, request_id, payload));
			Ok(())
		}
	}

	struct Receipts(u64);

	impl OdrRequest for Receipts {
		type Reply = u64;

		fn request_type(&self) -> RequestType {
			RequestType::Receipts
		}

		fn encode(&self) -> Result<Vec<u8>> {
			Ok(self.0.to_be_bytes().to_vec())
		}

		fn decode(&self, payload: &[u8]) -> Result<u64> {
			let bytes: [u8; 8] = payload.try_into()?;
			Ok(u64::from_be_bytes(bytes))
		}
	}

	fn same_block(request: &Receipts, reply: &u64) -> Result<()> {
		ensure!(request.0 == *reply, "Receipts of another block");
		Ok(())
	}

	fn client(
		discovery: Vec<NodeRecord>,
	) -> (
		LightClient<MemoryDB>,
		Arc<ChannelWire>,
		tokio::sync::mpsc::UnboundedReceiver<(NodeId, RequestId, Vec<u8>)>,
	) {
		let (sent, sends) = unbounded_channel();
		let client = LightClient::new(
			&LightConfig::default(),
			MemoryDB::default(),
			Arc::new(StaticDiscovery::new(discovery)),
			Controller::new(),
		)
		.unwrap();
		(client, Arc::new(ChannelWire { sent }), sends)
	}

	#[tokio::test(start_paused = true)]
	async fn dial_connect_and_retrieve() {
		let (client, wire, mut sends) = client(vec![record(1)]);
		client.start().unwrap();

		let dial = client.dial_candidates();
		let candidate = dial.next().await.unwrap();
		assert_eq!(candidate, record(1));
		client
			.connect(Peer::new(candidate.id, candidate.address, wire.clone()))
			.unwrap();

		let responder = client.clone();
		tokio::spawn(async move {
			while let Some((peer, id, payload)) = sends.recv().await {
				time::sleep(Duration::from_millis(50)).await;
				responder.deliver(&peer, id, payload);
			}
		});

		let reply = client.retrieve(Receipts(42), same_block, None).await.unwrap();
		assert_eq!(reply, 42);

		let priority = client.value_tracker().priority(&node(1), RequestType::Receipts);
		assert!(priority > 50.0);
		let candidate = client.server_pool().candidate(&node(1)).unwrap();
		assert!(candidate.known_good);
		assert!(matches!(candidate.state, ConnectionState::Connected { .. }));

		client.stop();
	}

	#[tokio::test(start_paused = true)]
	async fn wrong_server_is_skipped() {
		let (client, wire, mut sends) = client(vec![]);
		client.start().unwrap();
		client
			.connect(Peer::new(node(1), "10.0.0.1:30303", wire.clone()))
			.unwrap();
		client
			.connect(Peer::new(node(2), "10.0.0.2:30303", wire.clone()))
			.unwrap();

		let responder = client.clone();
		tokio::spawn(async move {
			while let Some((peer, id, payload)) = sends.recv().await {
				// the first server answers for a different block
				let payload = if peer == node(1) {
					7u64.to_be_bytes().to_vec()
				} else {
					payload
				};
				responder.deliver(&peer, id, payload);
			}
		});

		let reply = client.retrieve(Receipts(9), same_block, None).await.unwrap();
		assert_eq!(reply, 9);
		assert!(
			client.value_tracker().priority(&node(1), RequestType::Receipts)
				< client.value_tracker().priority(&node(2), RequestType::Receipts)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_cancels_pending_and_closes_peers() {
		let (client, wire, _sends) = client(vec![]);
		client.start().unwrap();
		client
			.connect(Peer::new(node(1), "10.0.0.1:30303", wire.clone()))
			.unwrap();

		let pending = tokio::spawn({
			let client = client.clone();
			async move { client.retrieve(Receipts(1), same_block, None).await }
		});
		time::sleep(Duration::from_millis(10)).await;

		client
			.shutdown
			.trigger_shutdown("test over".to_string())
			.unwrap();
		let result = pending.await.unwrap();
		assert!(matches!(
			result,
			Err(retrieve::Error::Retrieval(distributor::Error::Cancelled))
		));

		client.shutdown.completed_shutdown().await;
		assert!(client.peers().is_empty());
		assert!(matches!(
			client.connect(Peer::new(node(2), "10.0.0.2:30303", wire)),
			Err(peers::Error::SetClosed)
		));
		assert!(client.server_pool().is_stopped());
		assert_eq!(client.dial_candidates().next().await, None);
	}

	#[tokio::test(start_paused = true)]
	async fn head_announcement_unblocks_request() {
		struct Header(u64);

		impl OdrRequest for Header {
			type Reply = u64;

			fn request_type(&self) -> RequestType {
				RequestType::BlockHeaders
			}

			fn encode(&self) -> Result<Vec<u8>> {
				Ok(self.0.to_be_bytes().to_vec())
			}

			fn decode(&self, payload: &[u8]) -> Result<u64> {
				let bytes: [u8; 8] = payload.try_into()?;
				Ok(u64::from_be_bytes(bytes))
			}

			fn min_head(&self) -> Option<u64> {
				Some(self.0)
			}
		}

		let (client, wire, mut sends) = client(vec![]);
		client.start().unwrap();
		client
			.connect(Peer::new(node(1), "10.0.0.1:30303", wire))
			.unwrap();

		let pending = tokio::spawn({
			let client = client.clone();
			async move {
				client
					.retrieve(Header(100), |_: &Header, _: &u64| Ok(()), None)
					.await
			}
		});
		time::sleep(Duration::from_secs(1)).await;
		assert!(sends.try_recv().is_err());

		client
			.announce(
				&node(1),
				ChainHead {
					number: 100,
					..Default::default()
				},
			)
			.unwrap();
		let (peer, id, payload) = sends.recv().await.unwrap();
		client.deliver(&peer, id, payload);
		assert_eq!(pending.await.unwrap().unwrap(), 100);
	}

	#[tokio::test(start_paused = true)]
	async fn start_only_once() {
		let (client, _, _) = client(vec![]);
		client.start().unwrap();
		assert!(client.start().is_err());

		client.stop();
		client.shutdown.completed_shutdown().await;
		assert!(client.clone().start().is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn start_after_shutdown_fails() {
		let (client, _, _) = client(vec![]);
		client
			.shutdown
			.trigger_shutdown("stopping".to_string())
			.unwrap();
		assert!(client.start().is_err());
	}

	#[test]
	fn equal_priority_bounds_are_rejected() {
		let mut config = LightConfig::default();
		config.value_tracker.min_priority = 50.0;
		config.value_tracker.max_priority = 50.0;
		let client = LightClient::new(
			&config,
			MemoryDB::default(),
			Arc::new(StaticDiscovery::default()),
			Controller::new(),
		);
		assert!(client.is_err());
	}

	#[cfg(not(feature = "rocksdb"))]
	#[tokio::test(start_paused = true)]
	async fn builds_from_config() {
		let config = LightConfig {
			log_level: tracing::Level::ERROR,
			..Default::default()
		};
		let client = LightClient::from_config(
			&config,
			Arc::new(StaticDiscovery::new(vec![record(1)])),
			Controller::new(),
		)
		.unwrap();
		assert_eq!(client.server_pool().len(), 0);

		let mut invalid = config.clone();
		invalid.distributor.max_attempts = 0;
		assert!(LightClient::from_config(
			&invalid,
			Arc::new(StaticDiscovery::default()),
			Controller::new()
		)
		.is_err());
	}

	#[tokio::test(start_paused = true)]
	async fn rejected_connection_returns_candidate() {
		let (client, wire, _) = client(vec![]);
		client.peers().close();
		client.server_pool().add_discovered(record(2));
		let dial = client.dial_candidates();
		assert_eq!(dial.next().await, Some(record(2)));
		assert!(matches!(
			client.connect(Peer::new(node(2), "10.0.0.2:30303", wire)),
			Err(peers::Error::SetClosed)
		));
		assert_eq!(
			client.server_pool().candidate(&node(2)).unwrap().state,
			ConnectionState::Idle
		);
	}

	#[tokio::test(start_paused = true)]
	async fn updates_for_unknown_peer_fail() {
		let (client, _, _) = client(vec![]);
		assert_eq!(
			client.set_can_send(&node(5), false),
			Err(peers::Error::NotFound(node(5)))
		);
		assert_eq!(
			client.set_costs(&node(5), RequestCosts::uniform(1, 1)),
			Err(peers::Error::NotFound(node(5)))
		);
	}
}

//! Registry of connected server peers.
//!
//! Membership changes are pushed to every [`PeerSubscriber`] before
//! [`PeerSet::register`] and [`PeerSet::unregister`] return, so the value tracker,
//! the server pool and the distributor always agree on who is connected.
use crate::{
	distributor::DistPeer,
	types::{ChainHead, NodeId, RequestCosts, RequestId, RequestType},
};
use async_trait::async_trait;
use color_eyre::Result;
use mockall::automock;
use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, MutexGuard, PoisonError, RwLock,
	},
};
use thiserror::Error;
use tracing::{debug, info};

/// Number of concurrent requests a server serves unless it says otherwise.
pub const DEFAULT_CAPACITY: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
	#[error("Peer {0} is already registered")]
	AlreadyRegistered(NodeId),
	#[error("Peer {0} is not registered")]
	NotFound(NodeId),
	#[error("Peer set is closed")]
	SetClosed,
}

/// Outbound half of the wire protocol.
///
/// Replies come back asynchronously through [`crate::retrieve::RetrieveManager::deliver`].
#[automock]
#[async_trait]
pub trait Wire: Send + Sync {
	async fn send_request(
		&self,
		peer: NodeId,
		request_id: RequestId,
		request_type: RequestType,
		payload: Vec<u8>,
	) -> Result<()>;
}

/// Connected server peer.
pub struct Peer {
	id: NodeId,
	address: String,
	version: u32,
	capacity: usize,
	head: RwLock<ChainHead>,
	costs: RwLock<RequestCosts>,
	can_send: AtomicBool,
	wire: Arc<dyn Wire>,
}

impl Peer {
	pub fn new(id: NodeId, address: impl Into<String>, wire: Arc<dyn Wire>) -> Self {
		Self {
			id,
			address: address.into(),
			version: 0,
			capacity: DEFAULT_CAPACITY,
			head: RwLock::new(ChainHead::default()),
			costs: RwLock::new(RequestCosts::default()),
			can_send: AtomicBool::new(true),
			wire,
		}
	}

	pub fn with_version(mut self, version: u32) -> Self {
		self.version = version;
		self
	}

	pub fn with_capacity(mut self, capacity: usize) -> Self {
		self.capacity = capacity;
		self
	}

	pub fn with_head(self, head: ChainHead) -> Self {
		*self.head.write().unwrap_or_else(PoisonError::into_inner) = head;
		self
	}

	pub fn with_costs(self, costs: RequestCosts) -> Self {
		*self.costs.write().unwrap_or_else(PoisonError::into_inner) = costs;
		self
	}

	pub fn id(&self) -> NodeId {
		self.id
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	pub fn version(&self) -> u32 {
		self.version
	}

	pub fn head(&self) -> ChainHead {
		*self.head.read().unwrap_or_else(PoisonError::into_inner)
	}

	/// Applies a head announcement received from the peer.
	pub fn announce(&self, head: ChainHead) {
		debug!(peer = %self.id.short(), number = head.number, "Peer announced new head");
		*self.head.write().unwrap_or_else(PoisonError::into_inner) = head;
	}

	pub fn costs(&self) -> RequestCosts {
		self.costs
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	pub fn set_costs(&self, costs: RequestCosts) {
		*self.costs.write().unwrap_or_else(PoisonError::into_inner) = costs;
	}

	pub fn can_send(&self) -> bool {
		self.can_send.load(Ordering::Acquire)
	}

	/// Flow control switch, a peer that can't send is skipped by the distributor.
	pub fn set_can_send(&self, can_send: bool) {
		self.can_send.store(can_send, Ordering::Release);
	}
}

#[async_trait]
impl DistPeer for Peer {
	fn id(&self) -> NodeId {
		self.id
	}

	fn request_cost(&self, request_type: RequestType, amount: u64) -> u64 {
		self.costs
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.cost(request_type, amount)
	}

	fn capacity(&self) -> usize {
		self.capacity
	}

	fn can_send(&self) -> bool {
		Peer::can_send(self)
	}

	fn head(&self) -> ChainHead {
		Peer::head(self)
	}

	async fn send(
		&self,
		request_id: RequestId,
		request_type: RequestType,
		payload: Vec<u8>,
	) -> Result<()> {
		self.wire
			.send_request(self.id, request_id, request_type, payload)
			.await
	}
}

/// Observer of peer set membership.
///
/// Callbacks run while the peer set is locked and must not call back into it.
pub trait PeerSubscriber: Send + Sync {
	fn register_peer(&self, peer: &Arc<Peer>);
	fn unregister_peer(&self, peer: &Arc<Peer>);
}

#[derive(Default)]
struct PeerSetInner {
	peers: BTreeMap<NodeId, Arc<Peer>>,
	subscribers: Vec<Arc<dyn PeerSubscriber>>,
	closed: bool,
}

#[derive(Default)]
pub struct PeerSet {
	inner: Mutex<PeerSetInner>,
}

impl PeerSet {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, PeerSetInner> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Adds a subscriber and replays the already connected peers to it.
	pub fn subscribe(&self, subscriber: Arc<dyn PeerSubscriber>) {
		let mut inner = self.lock();
		for peer in inner.peers.values() {
			subscriber.register_peer(peer);
		}
		inner.subscribers.push(subscriber);
	}

	pub fn register(&self, peer: Arc<Peer>) -> Result<(), Error> {
		let mut inner = self.lock();
		if inner.closed {
			return Err(Error::SetClosed);
		}
		if inner.peers.contains_key(&peer.id()) {
			return Err(Error::AlreadyRegistered(peer.id()));
		}
		inner.peers.insert(peer.id(), peer.clone());
		for subscriber in &inner.subscribers {
			subscriber.register_peer(&peer);
		}
		info!(peer = %peer.id().short(), address = peer.address(), "Server peer registered");
		Ok(())
	}

	pub fn unregister(&self, id: &NodeId) -> Result<(), Error> {
		let mut inner = self.lock();
		let peer = inner.peers.remove(id).ok_or(Error::NotFound(*id))?;
		for subscriber in &inner.subscribers {
			subscriber.unregister_peer(&peer);
		}
		info!(peer = %id.short(), "Server peer unregistered");
		Ok(())
	}

	pub fn peer(&self, id: &NodeId) -> Option<Arc<Peer>> {
		self.lock().peers.get(id).cloned()
	}

	/// Point in time copy of the connected peers, ordered by id.
	pub fn all_peers(&self) -> Vec<Arc<Peer>> {
		self.lock().peers.values().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.lock().peers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().peers.is_empty()
	}

	/// Unregisters every peer and rejects further registrations.
	pub fn close(&self) {
		let mut inner = self.lock();
		inner.closed = true;
		let peers = std::mem::take(&mut inner.peers);
		for peer in peers.values() {
			for subscriber in &inner.subscribers {
				subscriber.unregister_peer(peer);
			}
		}
		if !peers.is_empty() {
			info!(count = peers.len(), "Peer set closed");
		}
	}
}

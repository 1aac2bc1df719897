//! Typed on-demand retrievals on top of the request distributor.
//!
//! A reply is decoded and validated before it resolves the retrieval. Replies
//! that fail either step are treated like a missing reply and the request moves
//! on to the next server, callers only ever see the decoded reply or a terminal
//! [`distributor::Error`].
use crate::{
	config::RetrieveConfig,
	distributor::{self, DistHandle, DistPeer, DistRequest, RequestDistributor},
	types::{NodeId, RequestId, RequestType},
};
use color_eyre::{eyre::WrapErr, Result};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum Error {
	#[error("Failed to encode request: {0}")]
	Encode(String),
	#[error(transparent)]
	Retrieval(#[from] distributor::Error),
}

/// Request of the on-demand retrieval layer.
pub trait OdrRequest: Send + Sync + 'static {
	type Reply: Send + 'static;

	fn request_type(&self) -> RequestType;

	/// Number of items requested, used for cost accounting.
	fn amount(&self) -> u64 {
		1
	}

	fn encode(&self) -> Result<Vec<u8>>;

	fn decode(&self, payload: &[u8]) -> Result<Self::Reply>;

	/// Lowest head number a server needs to serve the request.
	fn min_head(&self) -> Option<u64> {
		None
	}
}

/// Submitted retrieval, cancelled when dropped before completion.
pub struct Retrieval<T> {
	handle: DistHandle,
	reply: Arc<Mutex<Option<T>>>,
	distributor: RequestDistributor,
	finished: bool,
}

impl<T> Retrieval<T> {
	pub fn id(&self) -> RequestId {
		self.handle.id
	}

	/// Waits for the validated reply.
	pub async fn wait(mut self) -> Result<T, distributor::Error> {
		let result = self.handle.result().await;
		self.finished = true;
		let reply = result?;
		trace!(request_id = %self.handle.id, peer = %reply.peer.short(), "Retrieval completed");
		self.reply
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
			.ok_or(distributor::Error::NoReply)
	}
}

impl<T> Drop for Retrieval<T> {
	fn drop(&mut self) {
		if !self.finished && self.distributor.cancel(self.handle.id) {
			debug!(request_id = %self.handle.id, "Retrieval dropped, request cancelled");
		}
	}
}

#[derive(Clone)]
pub struct RetrieveManager {
	config: RetrieveConfig,
	distributor: RequestDistributor,
}

impl RetrieveManager {
	pub fn new(config: RetrieveConfig, distributor: RequestDistributor) -> Self {
		Self {
			config,
			distributor,
		}
	}

	/// Queues a retrieval, `validate` checks decoded replies against the request.
	///
	/// Without a deadline the configured request deadline applies.
	pub fn submit<R, F>(
		&self,
		request: R,
		validate: F,
		deadline: Option<Instant>,
	) -> Result<Retrieval<R::Reply>, Error>
	where
		R: OdrRequest,
		F: Fn(&R, &R::Reply) -> Result<()> + Send + Sync + 'static,
	{
		let payload = request
			.encode()
			.map_err(|error| Error::Encode(error.to_string()))?;
		let request_type = request.request_type();
		let amount = request.amount();
		let filter = request.min_head().map(|min_head| {
			Arc::new(move |peer: &dyn DistPeer| peer.head().number >= min_head)
				as distributor::PeerFilter
		});

		let request = Arc::new(request);
		let reply = Arc::new(Mutex::new(None));
		let validator = {
			let reply = reply.clone();
			Arc::new(move |peer: &NodeId, payload: &[u8]| -> Result<()> {
				let decoded = request
					.decode(payload)
					.wrap_err_with(|| format!("Failed to decode reply from {}", peer.short()))?;
				validate(&*request, &decoded)?;
				*reply.lock().unwrap_or_else(PoisonError::into_inner) = Some(decoded);
				Ok(())
			})
		};

		let handle = self.distributor.distribute(DistRequest {
			request_type,
			amount,
			payload,
			deadline: deadline.unwrap_or_else(|| Instant::now() + self.config.request_deadline),
			served_value: self.config.reference_value(request_type),
			filter,
			validator,
		});
		debug!(request_id = %handle.id, %request_type, amount, "Retrieval submitted");

		Ok(Retrieval {
			handle,
			reply,
			distributor: self.distributor.clone(),
			finished: false,
		})
	}

	/// Retrieves and validates a reply, resolving exactly once.
	pub async fn retrieve<R, F>(
		&self,
		request: R,
		validate: F,
		deadline: Option<Instant>,
	) -> Result<R::Reply, Error>
	where
		R: OdrRequest,
		F: Fn(&R, &R::Reply) -> Result<()> + Send + Sync + 'static,
	{
		let retrieval = self.submit(request, validate, deadline)?;
		Ok(retrieval.wait().await?)
	}

	pub fn cancel(&self, id: RequestId) -> bool {
		self.distributor.cancel(id)
	}

	/// Reply callback of the wire layer.
	pub fn deliver(&self, peer: &NodeId, id: RequestId, payload: Vec<u8>) -> bool {
		self.distributor.deliver(peer, id, payload)
	}
}

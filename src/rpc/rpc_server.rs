use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;

use ringstore_util::error::Error;

use crate::codec::{read_message, write_message, write_source, BinaryStream};
use crate::envelope::{BinarySource, Request, Response};

/// Binary stream of an inbound request
pub type RequestStream = BinaryStream<BufReader<OwnedReadHalf>>;

/// Implemented by the component dispatching inbound requests
#[async_trait]
pub trait EndpointHandler<M>: Send + Sync
where
	M: Send,
{
	type Body: Serialize + Default + Send + Sync;

	async fn handle(
		self: &Arc<Self>,
		req: Request<M>,
		data: Option<&mut RequestStream>,
	) -> (Response<Self::Body>, Option<BinarySource>);
}

/// Accept loop: one task per inbound request, stopping when the exit
/// signal fires
pub async fn run_rpc_server<M, H>(
	bind_addr: SocketAddr,
	handler: Arc<H>,
	mut must_exit: watch::Receiver<bool>,
) -> Result<(), Error>
where
	M: DeserializeOwned + Send + 'static,
	H: EndpointHandler<M> + 'static,
{
	let listener = TcpListener::bind(bind_addr).await?;
	info!("RPC server listening on {}", bind_addr);

	loop {
		select! {
			accepted = listener.accept() => {
				let (socket, peer) = accepted?;
				let handler = handler.clone();
				tokio::spawn(async move {
					if let Err(e) = handle_connection(socket, handler).await {
						debug!("RPC connection from {} failed: {}", peer, e);
					}
				});
			}
			_ = must_exit.changed() => {
				if *must_exit.borrow() {
					info!("RPC server exiting");
					return Ok(());
				}
			}
		}
	}
}

async fn handle_connection<M, H>(socket: TcpStream, handler: Arc<H>) -> Result<(), Error>
where
	M: DeserializeOwned + Send + 'static,
	H: EndpointHandler<M>,
{
	let (read_half, write_half) = socket.into_split();
	let mut reader = BufReader::new(read_half);
	let mut writer = BufWriter::new(write_half);

	let req: Request<M> = read_message(&mut reader).await?;
	let mut data = if req.has_data {
		Some(BinaryStream::new(reader))
	} else {
		None
	};

	let (mut resp, resp_data) = handler.handle(req, data.as_mut()).await;

	// Consume whatever the handler left of the request stream, so the
	// peer never blocks on a half-written request
	if let Some(stream) = data.as_mut() {
		if let Err(e) = stream.drain().await {
			debug!("Draining request stream failed: {}", e);
		}
	}

	resp.has_data = resp_data.is_some();
	write_message(&mut writer, &resp).await?;
	if let Some(source) = resp_data {
		write_source(&mut writer, source).await?;
	}
	writer.flush().await?;
	Ok(())
}

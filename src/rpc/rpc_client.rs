use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use ringstore_util::error::Error;

use crate::codec::{read_message, write_message, write_source, BinaryStream};
use crate::envelope::{BinarySource, Request, Response};

/// Response and fully-buffered binary payload of one RPC
pub struct RpcAnswer<B> {
	pub resp: Response<B>,
	pub data: Option<Vec<u8>>,
}

/// One-connection-per-request RPC client with a client-side deadline
#[derive(Clone)]
pub struct RpcClient {
	timeout: Duration,
}

impl RpcClient {
	pub fn new(timeout: Duration) -> Self {
		Self { timeout }
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Send a request, optionally streaming a binary payload after the
	/// envelope, and wait for the typed response within the deadline
	pub async fn call<M, B>(
		&self,
		to: SocketAddr,
		req: Request<M>,
		data: Option<BinarySource>,
	) -> Result<RpcAnswer<B>, Error>
	where
		M: Serialize + Send,
		B: DeserializeOwned + Send,
	{
		tokio::time::timeout(self.timeout, self.call_inner(to, req, data))
			.await
			.map_err(|_| Error::Timeout)?
	}

	async fn call_inner<M, B>(
		&self,
		to: SocketAddr,
		mut req: Request<M>,
		data: Option<BinarySource>,
	) -> Result<RpcAnswer<B>, Error>
	where
		M: Serialize + Send,
		B: DeserializeOwned + Send,
	{
		let socket = TcpStream::connect(to)
			.await
			.map_err(|e| Error::Transport(format!("Cannot connect to {}: {}", to, e)))?;
		let (read_half, write_half) = socket.into_split();
		let mut reader = BufReader::new(read_half);
		let mut writer = BufWriter::new(write_half);

		req.has_data = data.is_some();
		write_message(&mut writer, &req).await?;
		if let Some(source) = data {
			write_source(&mut writer, source).await?;
		}
		writer.flush().await?;

		let resp: Response<B> = read_message(&mut reader).await?;
		let data = if resp.has_data {
			Some(BinaryStream::new(reader).read_all().await?)
		} else {
			None
		};
		Ok(RpcAnswer { resp, data })
	}
}

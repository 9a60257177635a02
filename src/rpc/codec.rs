use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use ringstore_util::error::Error;

use crate::envelope::BinarySource;

/// Upper bound on a serialized envelope; keeps a broken peer from making
/// us allocate unboundedly
const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Size of one binary stream chunk on the wire
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Write a length-prefixed msgpack message
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), Error>
where
	W: AsyncWrite + Unpin,
	T: Serialize,
{
	let bytes = rmp_serde::encode::to_vec_named(msg)?;
	if bytes.len() as u32 > MAX_MESSAGE_SIZE {
		return Err(Error::Message(format!(
			"Refusing to send oversized message ({} bytes)",
			bytes.len()
		)));
	}
	writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
	writer.write_all(&bytes).await?;
	Ok(())
}

/// Read a length-prefixed msgpack message
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, Error>
where
	R: AsyncRead + Unpin,
	T: DeserializeOwned,
{
	let mut len_bytes = [0u8; 4];
	reader.read_exact(&mut len_bytes).await?;
	let len = u32::from_be_bytes(len_bytes);
	if len > MAX_MESSAGE_SIZE {
		return Err(Error::Transport(format!(
			"Oversized message announced ({} bytes)",
			len
		)));
	}
	let mut bytes = vec![0u8; len as usize];
	reader.read_exact(&mut bytes).await?;
	Ok(rmp_serde::decode::from_read_ref(&bytes)?)
}

/// Incoming binary stream: length-prefixed chunks terminated by an empty one
pub struct BinaryStream<R> {
	reader: R,
	finished: bool,
}

impl<R: AsyncRead + Unpin> BinaryStream<R> {
	pub fn new(reader: R) -> Self {
		Self {
			reader,
			finished: false,
		}
	}

	pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, Error> {
		if self.finished {
			return Ok(None);
		}
		let mut len_bytes = [0u8; 4];
		self.reader.read_exact(&mut len_bytes).await?;
		let len = u32::from_be_bytes(len_bytes);
		if len == 0 {
			self.finished = true;
			return Ok(None);
		}
		if len as usize > 2 * STREAM_CHUNK_SIZE {
			return Err(Error::Transport(format!(
				"Oversized stream chunk announced ({} bytes)",
				len
			)));
		}
		let mut chunk = vec![0u8; len as usize];
		self.reader.read_exact(&mut chunk).await?;
		Ok(Some(chunk))
	}

	pub async fn read_all(&mut self) -> Result<Vec<u8>, Error> {
		let mut data = Vec::new();
		while let Some(chunk) = self.next_chunk().await? {
			data.extend_from_slice(&chunk);
		}
		Ok(data)
	}

	/// Consume the remainder of the stream so the connection can be reused
	pub async fn drain(&mut self) -> Result<(), Error> {
		while self.next_chunk().await?.is_some() {}
		Ok(())
	}
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> Result<(), Error> {
	writer.write_all(&(chunk.len() as u32).to_be_bytes()).await?;
	writer.write_all(chunk).await?;
	Ok(())
}

/// Stream a binary source out as chunk frames, ending with the terminator
pub async fn write_source<W: AsyncWrite + Unpin>(
	writer: &mut W,
	source: BinarySource,
) -> Result<(), Error> {
	match source {
		BinarySource::Buf(data) => {
			for chunk in data.chunks(STREAM_CHUNK_SIZE) {
				write_chunk(writer, chunk).await?;
			}
		}
		BinarySource::File {
			path,
			offset,
			remove_on_close,
		} => {
			let res = async {
				let mut file = tokio::fs::File::open(&path).await?;
				if offset > 0 {
					use tokio::io::AsyncSeekExt;
					file.seek(std::io::SeekFrom::Start(offset)).await?;
				}
				let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
				loop {
					let n = file.read(&mut buf).await?;
					if n == 0 {
						break;
					}
					write_chunk(writer, &buf[..n]).await?;
				}
				Ok::<(), Error>(())
			}
			.await;
			if remove_on_close {
				if let Err(e) = tokio::fs::remove_file(&path).await {
					warn!("Removing streamed file {} failed: {}", path.display(), e);
				}
			}
			res?;
		}
	}
	writer.write_all(&0u32.to_be_bytes()).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde::Deserialize;

	#[derive(Serialize, Deserialize, PartialEq, Debug)]
	struct Ping {
		seq: u64,
		tag: String,
	}

	#[tokio::test]
	async fn test_message_round_trip() {
		let mut buf = Vec::new();
		let msg = Ping {
			seq: 42,
			tag: "hello".into(),
		};
		write_message(&mut buf, &msg).await.unwrap();
		let parsed: Ping = read_message(&mut &buf[..]).await.unwrap();
		assert_eq!(parsed, msg);
	}

	#[tokio::test]
	async fn test_stream_round_trip() {
		let payload = vec![7u8; 3 * STREAM_CHUNK_SIZE + 11];
		let mut buf = Vec::new();
		write_source(&mut buf, BinarySource::Buf(payload.clone()))
			.await
			.unwrap();

		let mut stream = BinaryStream::new(&buf[..]);
		assert_eq!(stream.read_all().await.unwrap(), payload);
		// stream stays exhausted
		assert!(stream.next_chunk().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_file_source_with_offset_and_removal() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let path = dir.as_path().join("payload");
		tokio::fs::write(&path, b"HEADERbody bytes").await.unwrap();

		let mut buf = Vec::new();
		write_source(
			&mut buf,
			BinarySource::File {
				path: path.clone(),
				offset: 6,
				remove_on_close: true,
			},
		)
		.await
		.unwrap();

		let mut stream = BinaryStream::new(&buf[..]);
		assert_eq!(stream.read_all().await.unwrap(), b"body bytes");
		assert!(!path.exists());
	}
}

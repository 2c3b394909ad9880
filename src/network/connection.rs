//! Connection handling for CodePipe
//!
//! One TCP connection carries both surfaces of the protocol: framed JSON
//! messages, and the raw byte streams used by the file-transfer and
//! custom-communicator sub-protocols after their envelope handshake.

use std::path::Path;
use std::net::SocketAddr;

use serde_json::Value;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::{read_frame, write_frame, CodecError, TRANSFER_CHUNK_SIZE};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("socket connection broken")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// A single TCP connection to a peer.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    /// Wrap an accepted stream.
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Open a fresh connection to the peer.
    pub async fn connect(address: &str, port: u16) -> ConnectionResult<Self> {
        let stream = TcpStream::connect((address, port)).await?;
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Send one framed JSON message.
    pub async fn send_value(&mut self, message: &Value) -> ConnectionResult<()> {
        write_frame(&mut self.stream, message).await?;
        Ok(())
    }

    /// Receive one framed JSON message.
    pub async fn recv_value(&mut self) -> ConnectionResult<Value> {
        Ok(read_frame(&mut self.stream).await?)
    }

    /// Write raw bytes, unframed.
    pub async fn send_all(&mut self, data: &[u8]) -> ConnectionResult<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read exactly `len` raw bytes, retrying partial reads. A peer
    /// closing before the count is reached is a connection fault.
    pub async fn recv_exact(&mut self, len: usize) -> ConnectionResult<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.stream
            .read_exact(&mut data)
            .await
            .map_err(map_eof)?;
        Ok(data)
    }

    /// Read the single status byte of a bytestream handshake.
    pub async fn recv_status(&mut self) -> ConnectionResult<u8> {
        let mut status = [0u8; 1];
        self.stream
            .read_exact(&mut status)
            .await
            .map_err(map_eof)?;
        Ok(status[0])
    }

    /// Stream exactly `len` raw bytes into a local file, in bounded
    /// chunks. Returns the byte count written.
    pub async fn recv_to_file(&mut self, len: u64, path: &Path) -> ConnectionResult<u64> {
        let mut file = File::create(path).await?;
        let mut buf = [0u8; TRANSFER_CHUNK_SIZE];
        let mut count = 0u64;

        while count < len {
            let want = usize::min((len - count) as usize, TRANSFER_CHUNK_SIZE);
            let read = self.stream.read(&mut buf[..want]).await?;
            if read == 0 {
                return Err(ConnectionError::Closed);
            }
            file.write_all(&buf[..read]).await?;
            count += read as u64;
        }

        file.flush().await?;
        Ok(count)
    }

    /// Stream a local file's content, in bounded chunks. Returns the byte
    /// count sent.
    pub async fn send_from_file(&mut self, path: &Path) -> ConnectionResult<u64> {
        let mut file = File::open(path).await?;
        let mut buf = [0u8; TRANSFER_CHUNK_SIZE];
        let mut count = 0u64;

        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            self.stream.write_all(&buf[..read]).await?;
            count += read as u64;
        }

        self.stream.flush().await?;
        Ok(count)
    }
}

fn map_eof(err: std::io::Error) -> ConnectionError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ConnectionError::Closed
    } else {
        ConnectionError::Io(err)
    }
}

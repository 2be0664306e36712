//! Byte stream transports.
//!
//! # Design
//! A [Transport] is shared between the task that reads from it and every task that writes to it.
//! The read and write directions are therefore locked separately, so a pending read never
//! blocks a write. End-of-stream is reported as a zero-length read, never as an error.
use crate::Error;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the byte stream. Any previous stream is replaced.
    async fn connect(&self) -> Result<(), Error>;

    /// Close the byte stream.
    async fn disconnect(&self) -> Result<(), Error>;

    /// Read available data into `buffer`.
    ///
    /// # Returns
    /// The number of bytes read. Zero indicates that the peer closed the stream.
    async fn read(&self, buffer: &mut [u8]) -> Result<usize, Error>;

    /// Write all of `data`.
    async fn write(&self, data: &[u8]) -> Result<(), Error>;
}

/// A transport over an established tokio byte stream, e.g. one accepted by a listener or one
/// half of a [tokio::io::duplex] pipe.
pub struct StreamTransport<S> {
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
}

impl<S> Default for StreamTransport<S> {
    fn default() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Replace the underlying stream.
    pub async fn attach(&self, stream: S) {
        let (reader, writer) = tokio::io::split(stream);
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
    }

    async fn close(&self) -> Result<(), Error> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            // The peer may already be gone.
            writer.shutdown().await.ok();
        }

        self.reader.lock().await.take();
        Ok(())
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> Transport for StreamTransport<S> {
    async fn connect(&self) -> Result<(), Error> {
        match self.writer.lock().await.as_ref() {
            Some(_) => Ok(()),
            None => Err(Error::NotConnected),
        }
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.close().await
    }

    async fn read(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(Error::NotConnected)?;
        Ok(reader.read(buffer).await?)
    }

    async fn write(&self, data: &[u8]) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// A transport connecting a TCP socket to a remote address on every [Transport::connect].
pub struct TcpTransport {
    address: String,
    stream: StreamTransport<TcpStream>,
}

impl TcpTransport {
    /// # Args
    /// * `address` - The remote address, e.g. `"broker.local:1883"`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stream: StreamTransport::default(),
        }
    }

    /// Wrap a socket that is already connected, e.g. one accepted by a listener.
    pub fn from_stream(stream: TcpStream) -> Self {
        let address = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_default();

        Self {
            address,
            stream: StreamTransport::new(stream),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> Result<(), Error> {
        self.stream.close().await?;

        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        crate::debug!("TCP connection established to {}", self.address);

        self.stream.attach(stream).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.stream.disconnect().await
    }

    async fn read(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        self.stream.read(buffer).await
    }

    async fn write(&self, data: &[u8]) -> Result<(), Error> {
        self.stream.write(data).await
    }
}

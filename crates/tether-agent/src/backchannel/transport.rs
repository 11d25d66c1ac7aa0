//! Byte transports to the controller
//!
//! Either a dialed TCP connection or a serial device opened twice, once for
//! reading and once for writing, joined into one stream.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use tether_core::config::{AgentConfig, Transport};

/// Any duplex byte stream the control connection can ride on
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

pub type BoxStream = Box<dyn ControlStream>;

/// Separate read and write halves presented as one stream
pub struct Duplex<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Duplex<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for Duplex<R, W> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for Duplex<R, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Open the serial device for the control connection
///
/// Both opens are issued together: on a FIFO each one blocks until the
/// other end is open.
pub async fn open_serial(path: &Path) -> io::Result<BoxStream> {
    let mut read_opts = OpenOptions::new();
    read_opts.read(true);
    let mut write_opts = OpenOptions::new();
    write_opts.write(true);
    let (reader, writer) = tokio::try_join!(read_opts.open(path), write_opts.open(path))?;
    Ok(Box::new(Duplex::new(reader, writer)))
}

/// Dial the controller over TCP
pub async fn dial(address: &str) -> io::Result<BoxStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
}

/// One attempt at the configured transport
pub async fn open(config: &AgentConfig) -> io::Result<BoxStream> {
    match config.transport {
        Transport::Tcp => dial(&config.controller_address).await,
        Transport::Serial => open_serial(&config.serial_device).await,
    }
}

/// Where `config` points, for logs
pub fn describe(config: &AgentConfig) -> String {
    match config.transport {
        Transport::Tcp => format!("tcp://{}", config.controller_address),
        Transport::Serial => format!("serial://{}", config.serial_device.display()),
    }
}

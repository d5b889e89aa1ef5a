//! Framed transports between the daemon and its host. The browser launches the daemon as a
//! native messaging host and talks to it over stdin/stdout.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::daemon::collection::browser::{BrowserEvent, TabInfo, WindowId, WindowInfo};

use super::messages::{Request, Response};

/// Largest message the browser accepts from a native host.
pub const MAX_OUTBOUND_FRAME: usize = 1024 * 1024;
pub const MAX_INBOUND_FRAME: usize = 64 * 1024 * 1024;

/// Messages arriving from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostMessage {
    Event {
        event: BrowserEvent,
    },
    Request {
        id: u64,
        request: Request,
    },
    /// Full listing of windows and tabs. Sent on connect.
    Snapshot {
        windows: Vec<WindowInfo>,
        tabs: Vec<TabInfo>,
        #[serde(default)]
        focused_window: Option<WindowId>,
    },
    Connectivity {
        online: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostReply {
    pub id: u64,
    pub response: Response,
}

/// Bidirectional stream of whole frames.
#[async_trait]
pub trait MessagePort: Send {
    /// Next frame, `None` once the peer has closed the stream.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    async fn send(&mut self, frame: &[u8]) -> Result<()>;
}

/// One JSON document per line.
pub struct JsonLinesPort<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send> JsonLinesPort<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send> MessagePort
    for JsonLinesPort<R, W>
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.as_bytes().to_vec()));
            }
        }
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if frame.contains(&b'\n') {
            bail!("Frame contains a line break");
        }
        self.writer.write_all(frame).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Browser native messaging framing: a 32-bit length in native byte order, then the JSON.
pub struct NativeMessagingPort<R, W> {
    reader: R,
    writer: W,
}

impl<R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send> NativeMessagingPort<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send, W: AsyncWrite + Unpin + Send> MessagePort
    for NativeMessagingPort<R, W>
{
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_ne_bytes(header) as usize;
        if len > MAX_INBOUND_FRAME {
            bail!("Inbound frame of {len} bytes exceeds {MAX_INBOUND_FRAME}");
        }
        let mut frame = vec![0u8; len];
        self.reader.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > MAX_OUTBOUND_FRAME {
            bail!(
                "Outbound frame of {} bytes exceeds {MAX_OUTBOUND_FRAME}",
                frame.len()
            );
        }
        let len = u32::try_from(frame.len())?;
        self.writer.write_all(&len.to_ne_bytes()).await?;
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

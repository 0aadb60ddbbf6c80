//! PeerLink wire protocol implementation.
//!
//! Every operation uses one fresh TCP connection. The client sends a single
//! UTF-8 command line, the server answers with a reply line, and binary
//! payloads follow where the command calls for them.
//!
//! ## Commands
//!
//! | Command | Reply |
//! |---------|-------|
//! | `GET_FILE_LIST` | one line with a JSON array of file names |
//! | `GET_FILE:<name>` | `OK` + file payload, or `ERROR:<reason>` |
//! | `UPLOAD_FILE` | `READY`, then `SUCCESS` or `FAILED` after the client's payload |
//! | `READY_FOR_SERVER_TRANSFERS` | `OK`, then zero or more `SERVER_FILE:<name>` + payload |
//! | anything else | `ERROR:Unknown command` |
//!
//! ## File Payload
//!
//! ```text
//! ┌──────────────┬────────────────┬──────────────┬─────────────────┐
//! │ Name length  │   Name bytes   │     Size     │   File bytes    │
//! │ 2 bytes (BE) │ UTF-8, n bytes │ 8 bytes (BE) │  `size` bytes   │
//! └──────────────┴────────────────┴──────────────┴─────────────────┘
//! ```

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Reason sent when a requested file does not exist.
pub const FILE_NOT_FOUND_REASON: &str = "File not found";

/// Reason sent for unparseable commands.
pub const UNKNOWN_COMMAND_REASON: &str = "Unknown command";

const LIST_FILES: &str = "GET_FILE_LIST";
const GET_FILE_PREFIX: &str = "GET_FILE:";
const PUT_FILE: &str = "UPLOAD_FILE";
const READY_FOR_PUSH: &str = "READY_FOR_SERVER_TRANSFERS";

const REPLY_OK: &str = "OK";
const REPLY_READY: &str = "READY";
const REPLY_SUCCESS: &str = "SUCCESS";
const REPLY_FAILED: &str = "FAILED";
const REPLY_ERROR_PREFIX: &str = "ERROR:";
const REPLY_SERVER_FILE_PREFIX: &str = "SERVER_FILE:";

/// A client request, one per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List every file in the server's catalog
    ListFiles,
    /// Download the named file
    GetFile(String),
    /// Upload a file; name and size travel in the payload header
    PutFile,
    /// Keep the connection open for server-initiated pushes
    ReadyForPush,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        match line {
            LIST_FILES => Ok(Self::ListFiles),
            PUT_FILE => Ok(Self::PutFile),
            READY_FOR_PUSH => Ok(Self::ReadyForPush),
            _ => match line.strip_prefix(GET_FILE_PREFIX) {
                Some(name) if !name.trim().is_empty() => Ok(Self::GetFile(name.to_string())),
                _ => Err(Error::ProtocolError(format!("unknown command: {line}"))),
            },
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListFiles => f.write_str(LIST_FILES),
            Self::GetFile(name) => write!(f, "{GET_FILE_PREFIX}{name}"),
            Self::PutFile => f.write_str(PUT_FILE),
            Self::ReadyForPush => f.write_str(READY_FOR_PUSH),
        }
    }
}

/// A status line sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Request accepted; payload follows where applicable
    Ok,
    /// Server is ready to receive an upload
    Ready,
    /// Upload stored
    Success,
    /// Upload did not complete
    Failed,
    /// Request rejected
    Error(String),
    /// A pushed file follows
    ServerFile(String),
}

impl Reply {
    /// Parse a reply line.
    pub fn parse(line: &str) -> Result<Self> {
        match line {
            REPLY_OK => Ok(Self::Ok),
            REPLY_READY => Ok(Self::Ready),
            REPLY_SUCCESS => Ok(Self::Success),
            REPLY_FAILED => Ok(Self::Failed),
            _ => {
                if let Some(reason) = line.strip_prefix(REPLY_ERROR_PREFIX) {
                    Ok(Self::Error(reason.trim().to_string()))
                } else if let Some(name) = line.strip_prefix(REPLY_SERVER_FILE_PREFIX) {
                    Ok(Self::ServerFile(name.to_string()))
                } else {
                    Err(Error::ProtocolError(format!("unexpected reply: {line}")))
                }
            }
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str(REPLY_OK),
            Self::Ready => f.write_str(REPLY_READY),
            Self::Success => f.write_str(REPLY_SUCCESS),
            Self::Failed => f.write_str(REPLY_FAILED),
            Self::Error(reason) => write!(f, "{REPLY_ERROR_PREFIX}{reason}"),
            Self::ServerFile(name) => write!(f, "{REPLY_SERVER_FILE_PREFIX}{name}"),
        }
    }
}

/// Name and size sent ahead of file bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// File name
    pub name: String,
    /// Number of bytes that follow
    pub size: u64,
}

impl FileHeader {
    /// Create a header.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Write the header to a stream.
    pub async fn write<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let name = self.name.as_bytes();
        let len = u16::try_from(name.len()).map_err(|_| {
            Error::InvalidFileName(format!("name is {} bytes, limit is 65535", name.len()))
        })?;

        writer.write_u16(len).await?;
        writer.write_all(name).await?;
        writer.write_u64(self.size).await?;
        Ok(())
    }

    /// Read a header from a stream.
    pub async fn read<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_u16().await.map_err(map_eof)?;
        let mut name = vec![0u8; usize::from(len)];
        reader.read_exact(&mut name).await.map_err(map_eof)?;
        let name = String::from_utf8(name)
            .map_err(|_| Error::ProtocolError("file name is not valid UTF-8".to_string()))?;
        let size = reader.read_u64().await.map_err(map_eof)?;

        Ok(Self { name, size })
    }
}

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read one line, without its `\n` or `\r\n` terminator.
///
/// Returns `None` if the stream ends before any byte arrives. A final line
/// without terminator is returned as is.
pub async fn read_line<R>(reader: &mut R, max_len: usize) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX).saturating_add(2);
    (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;

    if buf.is_empty() {
        return Ok(None);
    }

    let terminated = buf.last() == Some(&b'\n');
    if terminated {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > max_len {
        return Err(Error::ProtocolError(format!(
            "line exceeds {max_len} bytes"
        )));
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| Error::ProtocolError("line is not valid UTF-8".to_string()))
}

/// Write one `\n`-terminated line and flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Run a protocol step with a deadline.
///
/// Returns `Error::Timeout` if the step exceeds `duration`.
pub async fn with_timeout<T, F>(duration: Duration, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    timeout(duration, step)
        .await
        .map_err(|_| Error::Timeout(duration.as_secs()))?
}

/// Copy exactly `size` bytes from `reader` to `writer` in `chunk_size` pieces.
///
/// Each read and write carries its own `step_timeout`. Returns the number of
/// bytes copied, which is less than `size` only if the reader hit end of
/// stream early. `on_progress` receives the running total after every chunk.
pub async fn copy_exact<R, W, P>(
    reader: &mut R,
    writer: &mut W,
    size: u64,
    chunk_size: usize,
    step_timeout: Duration,
    mut on_progress: P,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    P: FnMut(u64),
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;

    while copied < size {
        let remaining = size - copied;
        let want = usize::try_from(remaining).map_or(buffer.len(), |r| r.min(buffer.len()));

        let n = with_timeout(step_timeout, async {
            Ok::<_, Error>(reader.read(&mut buffer[..want]).await?)
        })
        .await?;
        if n == 0 {
            break;
        }

        with_timeout(step_timeout, async {
            writer.write_all(&buffer[..n]).await?;
            Ok::<_, Error>(())
        })
        .await?;

        copied += n as u64;
        on_progress(copied);
    }

    with_timeout(step_timeout, async {
        writer.flush().await?;
        Ok::<_, Error>(())
    })
    .await?;

    Ok(copied)
}

/// Encode a file listing as a single-line JSON array.
pub fn encode_file_list(names: &[String]) -> Result<String> {
    serde_json::to_string(names).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a file listing line.
pub fn decode_file_list(line: &str) -> Result<Vec<String>> {
    serde_json::from_str(line).map_err(|e| Error::Serialization(e.to_string()))
}

//! Chunk framing.
//!
//! ```text
//! +----------------+------+-----------------+
//! | len: u32 (BE)  | type | payload (len B) |
//! +----------------+------+-----------------+
//! ```

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::NailgunError;

/// Payloads larger than this are rejected rather than buffered.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

const HEADER_SIZE: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkType {
    /// `A`: one command-line argument.
    Argument,
    /// `E`: one `KEY=VALUE` environment entry.
    Environment,
    /// `D`: the client's working directory.
    WorkingDirectory,
    /// `C`: the command to run; ends the request header.
    Command,
    /// `0`: bytes of standard input.
    Stdin,
    /// `.`: standard input is exhausted.
    StdinEof,
    /// `1`: bytes of standard output.
    Stdout,
    /// `2`: bytes of standard error.
    Stderr,
    /// `X`: the exit code, as ASCII decimal.
    Exit,
    /// `S`: the server is ready for a stdin chunk.
    StartReadingInput,
    /// `H`: keepalive.
    Heartbeat,
}

impl ChunkType {
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Argument => b'A',
            Self::Environment => b'E',
            Self::WorkingDirectory => b'D',
            Self::Command => b'C',
            Self::Stdin => b'0',
            Self::StdinEof => b'.',
            Self::Stdout => b'1',
            Self::Stderr => b'2',
            Self::Exit => b'X',
            Self::StartReadingInput => b'S',
            Self::Heartbeat => b'H',
        }
    }

    /// # Errors
    /// Returns [`NailgunError::UnknownChunkType`] for bytes outside the
    /// protocol.
    pub fn from_byte(byte: u8) -> Result<Self, NailgunError> {
        Ok(match byte {
            b'A' => Self::Argument,
            b'E' => Self::Environment,
            b'D' => Self::WorkingDirectory,
            b'C' => Self::Command,
            b'0' => Self::Stdin,
            b'.' => Self::StdinEof,
            b'1' => Self::Stdout,
            b'2' => Self::Stderr,
            b'X' => Self::Exit,
            b'S' => Self::StartReadingInput,
            b'H' => Self::Heartbeat,
            other => return Err(NailgunError::UnknownChunkType(other)),
        })
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", char::from(self.to_byte()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_type: ChunkType,
    pub payload: Bytes,
}

impl Chunk {
    #[must_use]
    pub fn new(chunk_type: ChunkType, payload: impl Into<Bytes>) -> Self {
        Self {
            chunk_type,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub const fn empty(chunk_type: ChunkType) -> Self {
        Self {
            chunk_type,
            payload: Bytes::new(),
        }
    }

    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self::new(ChunkType::Exit, code.to_string())
    }

    /// The payload as UTF-8.
    ///
    /// # Errors
    /// Returns [`NailgunError::Protocol`] if the payload is not valid UTF-8.
    pub fn text(&self) -> Result<&str, NailgunError> {
        std::str::from_utf8(&self.payload).map_err(|_| {
            NailgunError::Protocol(format!("{} chunk is not valid UTF-8", self.chunk_type))
        })
    }

    /// Parse an exit chunk's payload.
    ///
    /// # Errors
    /// Returns [`NailgunError::Protocol`] if it is not a decimal integer.
    pub fn exit_code(&self) -> Result<i32, NailgunError> {
        let text = self.text()?.trim();
        text.parse()
            .map_err(|_| NailgunError::Protocol(format!("invalid exit code {text:?}")))
    }
}

/// Read one chunk. Returns `Ok(None)` if the stream ends cleanly before a
/// chunk header starts.
///
/// # Errors
/// Returns an error on I/O failure, a truncated chunk, an unknown type, or an
/// oversized payload.
pub async fn read_chunk<R>(reader: &mut R) -> Result<Option<Chunk>, NailgunError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(NailgunError::Protocol("truncated chunk header".to_owned()));
        }
        filled += n;
    }
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let chunk_type = ChunkType::from_byte(header[4])?;
    if len > MAX_CHUNK_SIZE {
        return Err(NailgunError::ChunkTooLarge { len });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Chunk {
        chunk_type,
        payload: Bytes::from(payload),
    }))
}

/// Write one chunk and flush.
///
/// # Errors
/// Returns an error on I/O failure or an oversized payload.
pub async fn write_chunk<W>(writer: &mut W, chunk: &Chunk) -> Result<(), NailgunError>
where
    W: AsyncWrite + Unpin,
{
    let len = chunk.payload.len();
    if len > MAX_CHUNK_SIZE {
        return Err(NailgunError::ChunkTooLarge { len });
    }
    let len = u32::try_from(len).map_err(|_| NailgunError::ChunkTooLarge { len })?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + chunk.payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(chunk.chunk_type.to_byte());
    frame.extend_from_slice(&chunk.payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

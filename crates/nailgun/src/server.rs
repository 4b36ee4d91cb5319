use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::codec::{Chunk, ChunkType, read_chunk, write_chunk};
use crate::{NailgunError, Request};

/// A command implementation hosted by a [`Server`].
#[async_trait]
pub trait Nail: Send + Sync + 'static {
    /// Handle one request, writing output through `session`, and return the
    /// exit code. An error is reported to the client on stderr with exit
    /// code 1.
    async fn run(&self, request: Request, session: &mut Session) -> Result<i32, NailgunError>;
}

/// The server side of one connection, handed to [`Nail::run`].
pub struct Session {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    stdin_eof: bool,
}

impl Session {
    /// Ask the client for the next chunk of stdin. `None` once it is
    /// exhausted.
    ///
    /// # Errors
    /// Returns an error on I/O failure or a protocol violation.
    pub async fn read_stdin(&mut self) -> Result<Option<Bytes>, NailgunError> {
        if self.stdin_eof {
            return Ok(None);
        }
        write_chunk(&mut self.writer, &Chunk::empty(ChunkType::StartReadingInput)).await?;
        loop {
            let Some(chunk) = read_chunk(&mut self.reader).await? else {
                return Err(NailgunError::ConnectionClosed("while waiting for stdin"));
            };
            match chunk.chunk_type {
                ChunkType::Stdin => return Ok(Some(chunk.payload)),
                ChunkType::StdinEof => {
                    self.stdin_eof = true;
                    return Ok(None);
                }
                ChunkType::Heartbeat => {}
                other => {
                    return Err(NailgunError::UnexpectedChunk {
                        chunk_type: other,
                        context: "while waiting for stdin",
                    });
                }
            }
        }
    }

    /// Read stdin until the client reports EOF.
    ///
    /// # Errors
    /// See [`read_stdin`](Self::read_stdin).
    pub async fn read_all_stdin(&mut self) -> Result<Vec<u8>, NailgunError> {
        let mut all = Vec::new();
        while let Some(bytes) = self.read_stdin().await? {
            all.extend_from_slice(&bytes);
        }
        Ok(all)
    }

    /// # Errors
    /// Returns an error if the client is gone.
    pub async fn write_stdout(&mut self, bytes: &[u8]) -> Result<(), NailgunError> {
        self.write_output(ChunkType::Stdout, bytes).await
    }

    /// # Errors
    /// Returns an error if the client is gone.
    pub async fn write_stderr(&mut self, bytes: &[u8]) -> Result<(), NailgunError> {
        self.write_output(ChunkType::Stderr, bytes).await
    }

    async fn write_output(&mut self, chunk_type: ChunkType, bytes: &[u8]) -> Result<(), NailgunError> {
        if bytes.is_empty() {
            return Ok(());
        }
        write_chunk(
            &mut self.writer,
            &Chunk::new(chunk_type, Bytes::copy_from_slice(bytes)),
        )
        .await
    }
}

/// A listening nailgun server. Each connection is served on its own task.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Server {
    /// Bind `addr` (port 0 picks a free port) and start accepting.
    ///
    /// # Errors
    /// Returns [`NailgunError::Io`] if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, nail: Arc<dyn Nail>) -> Result<Self, NailgunError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, nail, shutdown_rx));
        tracing::info!(%local_addr, "nailgun server listening");
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Sessions already running finish on their
    /// own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "nailgun accept loop failed");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    nail: Arc<dyn Nail>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!("nailgun server shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let nail = Arc::clone(&nail);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, nail).await {
                            tracing::warn!(%peer, error = %e, "nailgun session failed");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "failed to accept nailgun connection"),
            },
        }
    }
}

async fn handle_connection(stream: TcpStream, nail: Arc<dyn Nail>) -> Result<(), NailgunError> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let request = read_request(&mut reader).await?;
    tracing::debug!(command = %request.command, args = request.args.len(), "nailgun request");

    let mut session = Session {
        reader,
        writer,
        stdin_eof: false,
    };
    let exit_code = match nail.run(request, &mut session).await {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!(error = %e, "nail failed");
            let _ = session.write_stderr(format!("{e}\n").as_bytes()).await;
            1
        }
    };
    write_chunk(&mut session.writer, &Chunk::exit(exit_code)).await?;
    session.writer.shutdown().await?;
    Ok(())
}

async fn read_request<R>(reader: &mut R) -> Result<Request, NailgunError>
where
    R: AsyncRead + Unpin,
{
    let mut request = Request::default();
    loop {
        let Some(chunk) = read_chunk(reader).await? else {
            return Err(NailgunError::ConnectionClosed("before the command was sent"));
        };
        match chunk.chunk_type {
            ChunkType::Argument => request.args.push(chunk.text()?.to_owned()),
            ChunkType::Environment => {
                let entry = chunk.text()?;
                let (key, value) = entry.split_once('=').ok_or_else(|| {
                    NailgunError::Protocol(format!("environment entry {entry:?} has no '='"))
                })?;
                request.env.insert(key.to_owned(), value.to_owned());
            }
            ChunkType::WorkingDirectory => request.working_dir = PathBuf::from(chunk.text()?),
            ChunkType::Command => {
                request.command = chunk.text()?.to_owned();
                return Ok(request);
            }
            ChunkType::Heartbeat => {}
            other => {
                return Err(NailgunError::UnexpectedChunk {
                    chunk_type: other,
                    context: "before the command",
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode(chunks: &[Chunk]) -> Vec<u8> {
        let mut buf = Vec::new();
        for chunk in chunks {
            write_chunk(&mut buf, chunk).await.unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn request_header_is_decoded() {
        let bytes = encode(&[
            Chunk::new(ChunkType::Argument, "-v"),
            Chunk::empty(ChunkType::Heartbeat),
            Chunk::new(ChunkType::Environment, "A=b=c"),
            Chunk::new(ChunkType::WorkingDirectory, "/work"),
            Chunk::new(ChunkType::Command, "compile"),
        ])
        .await;
        let request = read_request(&mut bytes.as_slice()).await.unwrap();
        assert_eq!(request.command, "compile");
        assert_eq!(request.args, ["-v"]);
        assert_eq!(request.env.get("A").map(String::as_str), Some("b=c"));
        assert_eq!(request.working_dir, PathBuf::from("/work"));
    }

    #[tokio::test]
    async fn env_without_equals_is_rejected() {
        let bytes = encode(&[Chunk::new(ChunkType::Environment, "JUSTKEY")]).await;
        assert!(matches!(
            read_request(&mut bytes.as_slice()).await,
            Err(NailgunError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn output_before_command_is_rejected() {
        let bytes = encode(&[Chunk::new(ChunkType::Stdout, "x")]).await;
        assert!(matches!(
            read_request(&mut bytes.as_slice()).await,
            Err(NailgunError::UnexpectedChunk {
                chunk_type: ChunkType::Stdout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn missing_command_is_reported() {
        let bytes = encode(&[Chunk::new(ChunkType::Argument, "x")]).await;
        assert!(matches!(
            read_request(&mut bytes.as_slice()).await,
            Err(NailgunError::ConnectionClosed(_))
        ));
    }
}

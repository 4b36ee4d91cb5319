use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::net::TcpStream;

use crate::codec::{Chunk, ChunkType, read_chunk, write_chunk};
use crate::{NailgunError, Request};

const STDIN_CHUNK_SIZE: usize = 8 * 1024;

/// Run `request` on the nailgun server at `addr`.
///
/// Output chunks are copied to `stdout` and `stderr` as they arrive. Stdin is
/// read from `stdin` only when the server asks for it.
///
/// # Errors
/// Returns an error if the connection fails, the server violates the
/// protocol, or the connection closes before an exit code arrives.
pub async fn client_execute<I, O, E>(
    addr: SocketAddr,
    request: &Request,
    stdin: &mut I,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<i32, NailgunError>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| NailgunError::Connect { addr, source })?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    send_request(&mut writer, request).await?;
    tracing::debug!(%addr, command = %request.command, "sent nailgun request");

    let mut stdin_done = false;
    let mut buf = vec![0u8; STDIN_CHUNK_SIZE];
    loop {
        let Some(chunk) = read_chunk(&mut reader).await? else {
            return Err(NailgunError::ConnectionClosed("before the exit code was sent"));
        };
        match chunk.chunk_type {
            ChunkType::Stdout => stdout.write_all(&chunk.payload).await?,
            ChunkType::Stderr => stderr.write_all(&chunk.payload).await?,
            ChunkType::Exit => {
                stdout.flush().await?;
                stderr.flush().await?;
                let code = chunk.exit_code()?;
                tracing::debug!(exit_code = code, "nailgun command finished");
                return Ok(code);
            }
            ChunkType::StartReadingInput => {
                let n = if stdin_done {
                    0
                } else {
                    stdin.read(&mut buf).await?
                };
                let reply = if n == 0 {
                    stdin_done = true;
                    Chunk::empty(ChunkType::StdinEof)
                } else {
                    Chunk::new(ChunkType::Stdin, Bytes::copy_from_slice(&buf[..n]))
                };
                write_chunk(&mut writer, &reply).await?;
            }
            ChunkType::Heartbeat => {}
            other => {
                return Err(NailgunError::UnexpectedChunk {
                    chunk_type: other,
                    context: "from the server",
                });
            }
        }
    }
}

async fn send_request<W>(writer: &mut W, request: &Request) -> Result<(), NailgunError>
where
    W: AsyncWrite + Unpin,
{
    for arg in &request.args {
        write_chunk(writer, &Chunk::new(ChunkType::Argument, arg.clone())).await?;
    }
    for (key, value) in &request.env {
        write_chunk(writer, &Chunk::new(ChunkType::Environment, format!("{key}={value}"))).await?;
    }
    let cwd = request.working_dir.to_string_lossy().into_owned();
    write_chunk(writer, &Chunk::new(ChunkType::WorkingDirectory, cwd)).await?;
    write_chunk(writer, &Chunk::new(ChunkType::Command, request.command.clone())).await
}

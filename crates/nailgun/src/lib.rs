//! The nailgun protocol: run commands in a long-lived ("warm") process
//! instead of spawning a fresh one per invocation.
//!
//! A client connects over TCP, sends its arguments (`A`), environment (`E`),
//! working directory (`D`) and finally the command (`C`). The server then
//! streams stdout (`1`) and stderr (`2`) back, asks for stdin with `S` when
//! it wants some, and ends the session with the exit code (`X`).
//!
//! [`client_execute`] is the client side; [`Server`] hosts a [`Nail`].

pub mod codec;
mod client;
mod server;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

pub use client::client_execute;
pub use codec::{Chunk, ChunkType};
pub use server::{Nail, Server, Session};

/// Errors from either side of a nailgun session.
#[derive(Debug, Error)]
pub enum NailgunError {
    #[error("failed to connect to nailgun server at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("nailgun I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nailgun protocol violation: {0}")]
    Protocol(String),

    #[error("unknown nailgun chunk type {:?}", char::from(*.0))]
    UnknownChunkType(u8),

    /// A known chunk type arrived where the protocol does not allow it.
    #[error("unexpected {chunk_type} chunk {context}")]
    UnexpectedChunk {
        chunk_type: ChunkType,
        context: &'static str,
    },

    #[error("nailgun chunk of {len} bytes exceeds the size limit")]
    ChunkTooLarge { len: usize },

    #[error("nailgun connection closed {0}")]
    ConnectionClosed(&'static str),
}

/// A command invocation as the client describes it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
}

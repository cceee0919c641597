//! Wire messages and the framed binary codec.
//!
//! Frames are a `u32` big-endian length prefix followed by a MessagePack
//! body. Every node in a deployment runs the same codec, so edges and
//! requests decode identically cluster-wide.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::edge::{Edge, EdgeId, Role, VertexId};
use crate::request_map::EdgeRequest;
use crate::tuple::FlowTuple;

/// Upper bound on a frame body; protects readers from a corrupt length
/// prefix.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeMessage {
    pub id: u64,
    pub src: String,
    pub dst: String,
    pub t_start: f64,
    pub t_end: f64,
    pub tuple: FlowTuple,
}

impl From<&Edge> for EdgeMessage {
    fn from(edge: &Edge) -> Self {
        EdgeMessage {
            id: edge.id.0,
            src: edge.src.as_str().to_string(),
            dst: edge.dst.as_str().to_string(),
            t_start: edge.t_start,
            t_end: edge.t_end,
            tuple: edge.tuple.clone(),
        }
    }
}

impl From<EdgeMessage> for Edge {
    fn from(msg: EdgeMessage) -> Self {
        Edge {
            id: EdgeId(msg.id),
            src: VertexId::new(msg.src),
            dst: VertexId::new(msg.dst),
            t_start: msg.t_start,
            t_end: msg.t_end,
            tuple: msg.tuple,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRequestMessage {
    pub request_id: u64,
    pub vertex: String,
    pub role: Role,
    pub t_lo: f64,
    pub t_hi: f64,
    pub requester: u32,
}

impl From<&EdgeRequest> for EdgeRequestMessage {
    fn from(req: &EdgeRequest) -> Self {
        EdgeRequestMessage {
            request_id: req.request_id,
            vertex: req.vertex.as_str().to_string(),
            role: req.role,
            t_lo: req.t_lo,
            t_hi: req.t_hi,
            requester: req.requester as u32,
        }
    }
}

impl From<EdgeRequestMessage> for EdgeRequest {
    fn from(msg: EdgeRequestMessage) -> Self {
        EdgeRequest {
            request_id: msg.request_id,
            vertex: VertexId::new(msg.vertex),
            role: msg.role,
            t_lo: msg.t_lo,
            t_hi: msg.t_hi,
            requester: msg.requester as usize,
        }
    }
}

/// Everything that crosses a socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Edge(EdgeMessage),
    Request(EdgeRequestMessage),
}

pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    rmp_serde::to_vec(msg).context("Failed to encode wire message")
}

pub fn decode(bytes: &[u8]) -> Result<Message> {
    rmp_serde::from_slice(bytes).context("Failed to decode wire message")
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let body = encode(msg)?;
    if body.len() as u32 > MAX_FRAME_LEN {
        bail!("frame body of {} bytes exceeds limit", body.len());
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read frame length"),
    };
    if len > MAX_FRAME_LEN {
        bail!("frame length {} exceeds limit", len);
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read frame body")?;
    Ok(Some(decode(&body)?))
}

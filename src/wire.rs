//! Length-framed call/reply transport shared by all three algorithms.
//!
//! Grounded on `net/session.rs`'s `TcpControl::read_task`/`write_task`
//! (`write_u64` length prefix, `read_exact` body) and on
//! `original_source/**/node/node.go`'s `CallByRPC` (dial, one call, one
//! reply, close). The body codec is `serde_json` rather than the teacher's
//! `bincode`: spec.md §6 requires the wire record to be self-describing,
//! which JSON is and `bincode` is not.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::MutexError;

/// Frames larger than this are rejected rather than trusted — a lone
/// misbehaving or corrupt peer should not make a handler allocate unbounded
/// memory.
const MAX_FRAME_LEN: u64 = 1 << 20;

/// A reply carrying no information beyond "the call was handled".
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ack;

pub async fn write_frame<T: Serialize>(
    stream: &mut (impl AsyncWrite + Unpin),
    value: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(value)?;
    stream.write_u64(body.len() as u64).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<T: DeserializeOwned>(
    stream: &mut (impl AsyncRead + Unpin),
) -> anyhow::Result<T> {
    let len = stream.read_u64().await?;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame too large: {len} bytes");
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Dial `addr`, send one framed `req`, read back one framed reply, then let
/// the connection drop — the connection-per-call model spec.md §6 requires.
pub async fn call<Req, Resp>(addr: SocketAddr, req: &Req) -> anyhow::Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| MutexError::Dial { addr, source })?;
    write_frame(&mut stream, req).await?;
    read_frame(&mut stream).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Payload {
            id: u32,
            text: String,
        }
        let sent = Payload {
            id: 7,
            text: "hello".into(),
        };
        write_frame(&mut a, &sent).await.unwrap();
        let got: Payload = read_frame(&mut b).await.unwrap();
        assert_eq!(sent, got);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(8);
        a.write_u64(MAX_FRAME_LEN + 1).await.unwrap();
        let result: anyhow::Result<Ack> = read_frame(&mut b).await;
        assert!(result.is_err());
    }
}

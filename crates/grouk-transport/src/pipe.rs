use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, TransportError};
use crate::stream::Stream;

const PIPE_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by one [`pipe_tcp`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Relayed {
    /// TCP to stream.
    pub upstream: u64,
    /// Stream to TCP.
    pub downstream: u64,
}

impl Relayed {
    pub fn total(&self) -> u64 {
        self.upstream + self.downstream
    }
}

/// Copy bytes both ways between `stream` and `tcp` until either side
/// finishes, then close the stream.
pub async fn pipe_tcp(stream: Stream, tcp: TcpStream) -> Result<Relayed> {
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let mut relayed = Relayed::default();
    let upstream_bytes = &mut relayed.upstream;
    let downstream_bytes = &mut relayed.downstream;

    let upstream = async {
        let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
        loop {
            let n = tcp_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, TransportError>(());
            }
            stream.write(&buf[..n]).await?;
            *upstream_bytes += n as u64;
        }
    };

    let downstream = async {
        let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            tcp_write.write_all(&buf[..n]).await?;
            *downstream_bytes += n as u64;
        }
        tcp_write.shutdown().await?;
        Ok(())
    };

    let result = tokio::select! {
        result = upstream => result,
        result = downstream => result,
    };
    stream.close().await;
    result.map(|()| relayed)
}

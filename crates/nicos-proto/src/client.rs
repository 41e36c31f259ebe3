// ── Request/response cache client ──
//
// A thin framed-TCP client for one-shot interactions (CLI `get`/`set`,
// tests). Long-lived mirrored connections live in `nicos-core`.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::codec::CacheCodec;
use crate::error::Error;
use crate::message::{END_MARKER, Message, Op};

/// A framed cache connection.
pub type CacheStream = Framed<TcpStream, CacheCodec>;

/// Open a framed TCP connection with a bounded connect time.
pub async fn connect(addr: &str, timeout: Duration) -> Result<CacheStream, Error> {
    tracing::debug!(addr, "connecting to cache");
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout {
            timeout_ms: duration_ms(timeout),
        })?
        .map_err(|e| Error::Connect {
            addr: addr.to_owned(),
            reason: e.to_string(),
        })?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, CacheCodec::default()))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Request/response client over a single cache connection.
pub struct CacheClient {
    stream: CacheStream,
    timeout: Duration,
}

impl CacheClient {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            stream: connect(addr, timeout).await?,
            timeout,
        })
    }

    /// Send a message without waiting for any reply.
    pub async fn send(&mut self, msg: Message) -> Result<(), Error> {
        self.stream.send(msg).await
    }

    /// Receive the next message, bounded by the client timeout.
    pub async fn recv(&mut self) -> Result<Message, Error> {
        match tokio::time::timeout(self.timeout, self.stream.next()).await {
            Err(_) => Err(Error::Timeout {
                timeout_ms: duration_ms(self.timeout),
            }),
            Ok(None) => Err(Error::ConnectionClosed),
            Ok(Some(msg)) => msg,
        }
    }

    /// Query a single key. The reply is `key=value` or `key!` / `key!value`.
    pub async fn ask(&mut self, key: &str, with_time: bool) -> Result<Message, Error> {
        self.send(Message::ask(key, with_time)).await?;
        loop {
            let reply = self.recv().await?;
            if reply.key == key && matches!(reply.op, Op::Tell | Op::TellOld) {
                return Ok(reply);
            }
        }
    }

    /// All keys containing `pattern`, terminated by the end marker reply.
    pub async fn query(&mut self, pattern: &str, with_time: bool) -> Result<Vec<Message>, Error> {
        self.send(Message::wildcard(pattern, with_time)).await?;
        self.send(Message::ask(END_MARKER, false)).await?;
        let mut out = Vec::new();
        loop {
            let reply = self.recv().await?;
            if reply.key == END_MARKER {
                return Ok(out);
            }
            out.push(reply);
        }
    }

    /// Acquire (`lock = true`) or release a lock. Returns the holder on denial.
    pub async fn lock(
        &mut self,
        key: &str,
        client: &str,
        lock: bool,
        ttl: Option<f64>,
    ) -> Result<Result<(), String>, Error> {
        self.send(Message::lock(key, client, lock, ttl)).await?;
        loop {
            let reply = self.recv().await?;
            if reply.op == Op::Lock && reply.key == key {
                return Ok(if reply.value.is_empty() {
                    Ok(())
                } else {
                    Err(reply.value)
                });
            }
        }
    }

    /// Hand over the framed stream, e.g. to follow a subscription.
    pub fn into_stream(self) -> CacheStream {
        self.stream
    }
}

//! Wire layer of the NICOS cache.
//!
//! - **[`Value`]**: the literal language every cache value is written in
//!   (`None`, bools, numbers, strings, tuples, lists, dicts).
//! - **[`Message`]**: one protocol line, `[time] [+|-] [ttl] [@] key op [value]`.
//! - **[`CacheCodec`]**: `tokio_util` framing of messages over a byte stream.
//! - **[`CacheClient`]**: request/response helper over a framed TCP connection.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod value;

pub use client::{CacheClient, CacheStream, connect};
pub use codec::CacheCodec;
pub use error::Error;
pub use message::{
    DEFAULT_CACHE_PORT, DEFAULT_LOCK_TTL, END_MARKER, FLAG_NO_STORE, Message, Op, SYNC_MARKER,
};
pub use value::Value;

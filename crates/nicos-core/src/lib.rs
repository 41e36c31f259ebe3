//! Device abstraction, cache, poller and session layer for NICOS.
//!
//! - [`device`]: the [`Device`] wrapper, driver traits and class registry
//! - [`devices`]: built-in classes (virtual hardware, aliases, switchers)
//! - [`cache`]: timestamped key/value store, its TCP server and client
//! - [`poller`]: one polling task per device with backoff
//! - [`session`]: builds the device graph from [`setup`] files

pub mod cache;
pub mod device;
pub mod devices;
pub mod error;
pub mod params;
pub mod poller;
pub mod retry;
pub mod session;
pub mod setup;
pub mod status;

pub use cache::{
    CacheBackend, CacheServer, CacheStore, FlatFileStore, RemoteCache, RemoteCacheConfig,
};
pub use device::{Device, DeviceClass, DeviceRegistry, Driver, Mode, Movement};
pub use error::NicosError;
pub use params::{ParamInfo, ParamType};
pub use poller::{PollState, PollStatus, Poller, PollerConfig};
pub use retry::BackoffPolicy;
pub use session::{LoadReport, Session};
pub use setup::{DeviceConfig, SetupGroup, SetupInfo};
pub use status::{DeviceStatus, Status};

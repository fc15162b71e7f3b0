//! # Parsec Space
//! One node of a distributed virtual world: the authoritative object
//! directory (OSeg), location service, proximity query engine, forwarding
//! plane with weighted fair queuing, and object session management, glued
//! together over the shared SST transport.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate cfg_if;

cfg_if! {
    if #[cfg(target_arch = "wasm32")] {
        compile_error!("parsec-space is a native server, wasm builds are not supported");
    }
}

pub mod config;
pub mod context;
pub mod forwarder;
pub mod link;
pub mod loc;
pub mod oseg;
pub mod prox;
pub mod receiver;
pub mod server;
pub mod session;
pub mod strand;

pub use config::{ConfigError, SpaceConfig, SpaceOpts};
pub use context::{Counters, SpaceContext};
pub use forwarder::{Forwarder, ForwarderConfig};
pub use loc::record::{LocFieldKind, LocRecord};
pub use loc::subscription::SubscriberRef;
pub use loc::{LocEvent, LocationService};
pub use oseg::store::{KeyValueStore, MemoryStore, StoreError, StoreRequest, StoreResponse};
pub use oseg::{ObjectSegmentation, OsegAddStatus, OsegConfig, OsegEntry, OsegEvent};
pub use prox::{ProxConfig, ProxEvent, ProximityEngine, QuerierRef, QueryCenter};
pub use receiver::{ReceiverConfig, ServerMessageReceiver};
pub use server::{ServerConfig, SpaceServer};
pub use session::{ObjectSessionManager, SessionConfig, SessionEvent, SessionState};
pub use strand::{Strand, WorkPool};

//! # Parsec Shared
//! Common functionality shared between parsec space servers: identifiers,
//! the space timebase, kinematic state, datagram framing, inter-server
//! message payloads, and the SST reliable stream transport.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate cfg_if;

cfg_if! {
    if #[cfg(target_arch = "wasm32")] {
        // Space servers are native processes; there is no wasm story here.
        compile_error!("parsec-shared targets native space servers, wasm builds are not supported");
    }
}

mod math;
mod messages;
mod motion;
mod odp;
mod oid;
mod sequence;
mod time;
mod timer;
mod wire;

pub mod sst;

pub use math::{Quat, Vec3};
pub use messages::{
    LocField, LocFieldValue, LocUpdate, MigrateState, OsegMigrateAck, OsegUpdate, ProxResults,
    ServerMessage, SessionRequest, SessionResponse, SessionStatus, WeightUpdate,
};
pub use motion::{BoundingInfo, TimedMotionQuaternion, TimedMotionVector};
pub use odp::{
    port, OdpDatagram, OdpHeader, OhdpDatagram, OhdpHeader, PortId, SYSTEM_PORT_MAX,
};
pub use oid::{ObjectId, ObjectIdParseError, ServerId, SpaceId, SpaceObjectRef};
pub use sequence::{seq_diff, seq_greater_than, seq_less_than, SequenceList};
pub use time::{SpaceDuration, SpaceInstant, TimeSource};
pub use timer::{Generation, GenerationSource, Timer};
pub use wire::{ByteReader, ByteWriter, WireError};

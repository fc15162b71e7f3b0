//! Inter-server and session control payloads. These are the semantic
//! contents defined by the space protocol; each carries a byte codec so the
//! forwarding plane can treat payloads opaquely.

use crate::motion::{BoundingInfo, TimedMotionQuaternion, TimedMotionVector};
use crate::oid::{ObjectId, ServerId};
use crate::wire::{ByteReader, ByteWriter, WireError};

/// One replicated presence field together with its monotonic sequence
/// number. The field kind is implied by the value variant.
#[derive(Clone, PartialEq, Debug)]
pub struct LocField {
    pub seqno: u64,
    pub value: LocFieldValue,
}

#[derive(Clone, PartialEq, Debug)]
pub enum LocFieldValue {
    Location(TimedMotionVector),
    Orientation(TimedMotionQuaternion),
    Bounds(BoundingInfo),
    Mesh(String),
    Physics(String),
}

impl LocFieldValue {
    fn tag(&self) -> u8 {
        match self {
            LocFieldValue::Location(_) => 0,
            LocFieldValue::Orientation(_) => 1,
            LocFieldValue::Bounds(_) => 2,
            LocFieldValue::Mesh(_) => 3,
            LocFieldValue::Physics(_) => 4,
        }
    }

    fn encode(&self, writer: &mut ByteWriter) {
        match self {
            LocFieldValue::Location(motion) => {
                writer.write_instant(motion.time());
                writer.write_vec3(&motion.position());
                writer.write_vec3(&motion.velocity());
            }
            LocFieldValue::Orientation(motion) => {
                writer.write_instant(motion.time());
                writer.write_quat(&motion.orientation());
                writer.write_vec3(&motion.angular_velocity());
            }
            LocFieldValue::Bounds(bounds) => {
                writer.write_vec3(&bounds.center_offset);
                writer.write_f32(bounds.center_bounds_radius);
                writer.write_f32(bounds.max_object_radius);
            }
            LocFieldValue::Mesh(uri) => writer.write_string(uri),
            LocFieldValue::Physics(desc) => writer.write_string(desc),
        }
    }

    fn decode(tag: u8, reader: &mut ByteReader) -> Result<Self, WireError> {
        match tag {
            0 => Ok(LocFieldValue::Location(TimedMotionVector::new(
                reader.read_instant()?,
                reader.read_vec3()?,
                reader.read_vec3()?,
            ))),
            1 => Ok(LocFieldValue::Orientation(TimedMotionQuaternion::new(
                reader.read_instant()?,
                reader.read_quat()?,
                reader.read_vec3()?,
            ))),
            2 => Ok(LocFieldValue::Bounds(BoundingInfo {
                center_offset: reader.read_vec3()?,
                center_bounds_radius: reader.read_f32()?,
                max_object_radius: reader.read_f32()?,
            })),
            3 => Ok(LocFieldValue::Mesh(reader.read_string()?)),
            4 => Ok(LocFieldValue::Physics(reader.read_string()?)),
            _ => Err(WireError::InvalidField { field: "loc_field" }),
        }
    }
}

fn encode_fields(fields: &[LocField], writer: &mut ByteWriter) {
    writer.write_u8(fields.len() as u8);
    for field in fields {
        writer.write_u8(field.value.tag());
        writer.write_u64(field.seqno);
        field.value.encode(writer);
    }
}

fn decode_fields(reader: &mut ByteReader) -> Result<Vec<LocField>, WireError> {
    let count = reader.read_u8()?;
    let mut fields = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let tag = reader.read_u8()?;
        let seqno = reader.read_u64()?;
        fields.push(LocField {
            seqno,
            value: LocFieldValue::decode(tag, reader)?,
        });
    }
    Ok(fields)
}

/// A delta of presence fields for one object, sent to subscribers and to
/// replica holders. Only fields whose sequence numbers advanced are
/// present.
#[derive(Clone, PartialEq, Debug)]
pub struct LocUpdate {
    pub object: ObjectId,
    pub aggregate: bool,
    pub fields: Vec<LocField>,
}

/// Acknowledges that a migrated object's directory entry has been committed
/// by the destination server. Receiving this is the only signal that lets
/// the source disconnect the object's session.
#[derive(Clone, PartialEq, Debug)]
pub struct OsegMigrateAck {
    pub from: ServerId,
    pub to: ServerId,
    pub object: ObjectId,
    pub radius: f32,
}

/// Best-effort cache invalidation broadcast after a directory change.
#[derive(Clone, PartialEq, Debug)]
pub struct OsegUpdate {
    pub object: ObjectId,
    pub server: ServerId,
    pub radius: f32,
}

/// Periodic receiver-side report of per-sender used weights, closing the
/// fair-queueing loop between a pair of servers.
#[derive(Clone, PartialEq, Debug)]
pub struct WeightUpdate {
    pub receiver_capacity: f64,
    pub entries: Vec<(ServerId, f64)>,
}

/// The full object state shipped from migration source to destination.
#[derive(Clone, PartialEq, Debug)]
pub struct MigrateState {
    pub object: ObjectId,
    pub radius: f32,
    pub source: ServerId,
    pub fields: Vec<LocField>,
    pub subscribers: Vec<ObjectId>,
}

/// Session admission status codes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SessionStatus {
    Success,
    AlreadyRegistered,
    InvalidToken,
    InternalError,
}

impl SessionStatus {
    fn tag(&self) -> u8 {
        match self {
            SessionStatus::Success => 0,
            SessionStatus::AlreadyRegistered => 1,
            SessionStatus::InvalidToken => 2,
            SessionStatus::InternalError => 3,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, WireError> {
        match tag {
            0 => Ok(SessionStatus::Success),
            1 => Ok(SessionStatus::AlreadyRegistered),
            2 => Ok(SessionStatus::InvalidToken),
            3 => Ok(SessionStatus::InternalError),
            _ => Err(WireError::InvalidField { field: "session_status" }),
        }
    }
}

/// An object's request to join the space on this server, carrying its
/// credential and initial presence fields.
#[derive(Clone, PartialEq, Debug)]
pub struct SessionRequest {
    pub object: ObjectId,
    pub radius: f32,
    pub token: Vec<u8>,
    pub fields: Vec<LocField>,
}

#[derive(Clone, PartialEq, Debug)]
pub struct SessionResponse {
    pub object: ObjectId,
    pub status: SessionStatus,
}

/// An incremental proximity result batch for one querier: objects entering
/// view (seeded with their presence fields) and objects leaving it.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ProxResults {
    pub enter: Vec<(ObjectId, Vec<LocField>)>,
    pub exit: Vec<ObjectId>,
}

/// Envelope for every payload exchanged between space servers (and the
/// session/proximity exchanges with objects).
#[derive(Clone, PartialEq, Debug)]
pub enum ServerMessage {
    Loc(LocUpdate),
    OsegMigrateAck(OsegMigrateAck),
    OsegUpdate(OsegUpdate),
    Weight(WeightUpdate),
    Migrate(MigrateState),
    SessionRequest(SessionRequest),
    SessionResponse(SessionResponse),
    /// An object-addressed datagram being routed between servers, opaque to
    /// the forwarding plane.
    ObjectRoute(Vec<u8>),
    Prox(ProxResults),
}

const TAG_LOC: u8 = 0;
const TAG_MIGRATE_ACK: u8 = 1;
const TAG_OSEG_UPDATE: u8 = 2;
const TAG_WEIGHT: u8 = 3;
const TAG_MIGRATE: u8 = 4;
const TAG_SESSION_REQUEST: u8 = 5;
const TAG_SESSION_RESPONSE: u8 = 6;
const TAG_OBJECT_ROUTE: u8 = 7;
const TAG_PROX: u8 = 8;

impl ServerMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        match self {
            ServerMessage::Loc(update) => {
                writer.write_u8(TAG_LOC);
                writer.write_object_id(&update.object);
                writer.write_u8(update.aggregate as u8);
                encode_fields(&update.fields, &mut writer);
            }
            ServerMessage::OsegMigrateAck(ack) => {
                writer.write_u8(TAG_MIGRATE_ACK);
                writer.write_server_id(ack.from);
                writer.write_server_id(ack.to);
                writer.write_object_id(&ack.object);
                writer.write_f32(ack.radius);
            }
            ServerMessage::OsegUpdate(update) => {
                writer.write_u8(TAG_OSEG_UPDATE);
                writer.write_object_id(&update.object);
                writer.write_server_id(update.server);
                writer.write_f32(update.radius);
            }
            ServerMessage::Weight(update) => {
                writer.write_u8(TAG_WEIGHT);
                writer.write_f64(update.receiver_capacity);
                writer.write_u32(update.entries.len() as u32);
                for (server, used) in &update.entries {
                    writer.write_server_id(*server);
                    writer.write_f64(*used);
                }
            }
            ServerMessage::Migrate(state) => {
                writer.write_u8(TAG_MIGRATE);
                writer.write_object_id(&state.object);
                writer.write_f32(state.radius);
                writer.write_server_id(state.source);
                encode_fields(&state.fields, &mut writer);
                writer.write_u32(state.subscribers.len() as u32);
                for subscriber in &state.subscribers {
                    writer.write_object_id(subscriber);
                }
            }
            ServerMessage::SessionRequest(request) => {
                writer.write_u8(TAG_SESSION_REQUEST);
                writer.write_object_id(&request.object);
                writer.write_f32(request.radius);
                writer.write_bytes(&request.token);
                encode_fields(&request.fields, &mut writer);
            }
            ServerMessage::SessionResponse(response) => {
                writer.write_u8(TAG_SESSION_RESPONSE);
                writer.write_object_id(&response.object);
                writer.write_u8(response.status.tag());
            }
            ServerMessage::ObjectRoute(datagram) => {
                writer.write_u8(TAG_OBJECT_ROUTE);
                writer.write_bytes(datagram);
            }
            ServerMessage::Prox(results) => {
                writer.write_u8(TAG_PROX);
                writer.write_u32(results.enter.len() as u32);
                for (object, fields) in &results.enter {
                    writer.write_object_id(object);
                    encode_fields(fields, &mut writer);
                }
                writer.write_u32(results.exit.len() as u32);
                for object in &results.exit {
                    writer.write_object_id(object);
                }
            }
        }
        writer.finish()
    }

    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(input);
        let tag = reader.read_u8()?;
        match tag {
            TAG_LOC => Ok(ServerMessage::Loc(LocUpdate {
                object: reader.read_object_id()?,
                aggregate: reader.read_u8()? != 0,
                fields: decode_fields(&mut reader)?,
            })),
            TAG_MIGRATE_ACK => Ok(ServerMessage::OsegMigrateAck(OsegMigrateAck {
                from: reader.read_server_id()?,
                to: reader.read_server_id()?,
                object: reader.read_object_id()?,
                radius: reader.read_f32()?,
            })),
            TAG_OSEG_UPDATE => Ok(ServerMessage::OsegUpdate(OsegUpdate {
                object: reader.read_object_id()?,
                server: reader.read_server_id()?,
                radius: reader.read_f32()?,
            })),
            TAG_WEIGHT => {
                let receiver_capacity = reader.read_f64()?;
                let count = reader.read_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    entries.push((reader.read_server_id()?, reader.read_f64()?));
                }
                Ok(ServerMessage::Weight(WeightUpdate {
                    receiver_capacity,
                    entries,
                }))
            }
            TAG_MIGRATE => {
                let object = reader.read_object_id()?;
                let radius = reader.read_f32()?;
                let source = reader.read_server_id()?;
                let fields = decode_fields(&mut reader)?;
                let count = reader.read_u32()?;
                let mut subscribers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    subscribers.push(reader.read_object_id()?);
                }
                Ok(ServerMessage::Migrate(MigrateState {
                    object,
                    radius,
                    source,
                    fields,
                    subscribers,
                }))
            }
            TAG_SESSION_REQUEST => Ok(ServerMessage::SessionRequest(SessionRequest {
                object: reader.read_object_id()?,
                radius: reader.read_f32()?,
                token: reader.read_bytes()?.to_vec(),
                fields: decode_fields(&mut reader)?,
            })),
            TAG_SESSION_RESPONSE => Ok(ServerMessage::SessionResponse(SessionResponse {
                object: reader.read_object_id()?,
                status: SessionStatus::from_tag(reader.read_u8()?)?,
            })),
            TAG_OBJECT_ROUTE => Ok(ServerMessage::ObjectRoute(reader.read_bytes()?.to_vec())),
            TAG_PROX => {
                let enter_count = reader.read_u32()?;
                let mut enter = Vec::with_capacity(enter_count as usize);
                for _ in 0..enter_count {
                    let object = reader.read_object_id()?;
                    let fields = decode_fields(&mut reader)?;
                    enter.push((object, fields));
                }
                let exit_count = reader.read_u32()?;
                let mut exit = Vec::with_capacity(exit_count as usize);
                for _ in 0..exit_count {
                    exit.push(reader.read_object_id()?);
                }
                Ok(ServerMessage::Prox(ProxResults { enter, exit }))
            }
            _ => Err(WireError::InvalidField { field: "server_message_tag" }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{Quat, Vec3};
    use crate::time::SpaceInstant;

    fn oid(value: u128) -> ObjectId {
        ObjectId::from_u128(value)
    }

    #[test]
    fn loc_update_round_trip() {
        let message = ServerMessage::Loc(LocUpdate {
            object: oid(3),
            aggregate: false,
            fields: vec![
                LocField {
                    seqno: 5,
                    value: LocFieldValue::Location(TimedMotionVector::new(
                        SpaceInstant::from_millis(100),
                        Vec3::new(1.0, 2.0, 3.0),
                        Vec3::new(0.1, 0.0, 0.0),
                    )),
                },
                LocField {
                    seqno: 2,
                    value: LocFieldValue::Orientation(TimedMotionQuaternion::fixed(
                        SpaceInstant::from_millis(100),
                        Quat::IDENTITY,
                    )),
                },
                LocField {
                    seqno: 9,
                    value: LocFieldValue::Mesh("meerkat:///cube.dae".to_string()),
                },
            ],
        });
        assert_eq!(ServerMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn migrate_ack_round_trip() {
        let message = ServerMessage::OsegMigrateAck(OsegMigrateAck {
            from: ServerId(2),
            to: ServerId(1),
            object: oid(7),
            radius: 1.5,
        });
        assert_eq!(ServerMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn weight_update_round_trip() {
        let message = ServerMessage::Weight(WeightUpdate {
            receiver_capacity: 1e6,
            entries: vec![(ServerId(1), 0.25), (ServerId(3), 0.75)],
        });
        assert_eq!(ServerMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn migrate_state_round_trip() {
        let message = ServerMessage::Migrate(MigrateState {
            object: oid(11),
            radius: 2.0,
            source: ServerId(1),
            fields: vec![LocField {
                seqno: 1,
                value: LocFieldValue::Bounds(BoundingInfo::single_object(2.0)),
            }],
            subscribers: vec![oid(50), oid(51)],
        });
        assert_eq!(ServerMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn session_round_trip() {
        let request = ServerMessage::SessionRequest(SessionRequest {
            object: oid(20),
            radius: 1.0,
            token: b"secret".to_vec(),
            fields: vec![LocField {
                seqno: 1,
                value: LocFieldValue::Bounds(BoundingInfo::single_object(1.0)),
            }],
        });
        assert_eq!(ServerMessage::decode(&request.encode()).unwrap(), request);

        let response = ServerMessage::SessionResponse(SessionResponse {
            object: oid(20),
            status: SessionStatus::AlreadyRegistered,
        });
        assert_eq!(ServerMessage::decode(&response.encode()).unwrap(), response);
    }

    #[test]
    fn prox_results_round_trip() {
        let message = ServerMessage::Prox(ProxResults {
            enter: vec![(
                oid(1),
                vec![LocField {
                    seqno: 3,
                    value: LocFieldValue::Bounds(BoundingInfo::single_object(1.0)),
                }],
            )],
            exit: vec![oid(2), oid(3)],
        });
        assert_eq!(ServerMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(ServerMessage::decode(&[250]).is_err());
    }
}

use std::fmt;

use thiserror::Error;

/// Errors that can occur when parsing an identifier from its hex form
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectIdParseError {
    #[error("Expected 32 hex characters, got {got}")]
    WrongLength { got: usize },
    #[error("Invalid hex character '{ch}' at position {position}")]
    InvalidHexDigit { ch: char, position: usize },
}

fn parse_hex_128(hex: &str) -> Result<[u8; 16], ObjectIdParseError> {
    if hex.len() != 32 {
        return Err(ObjectIdParseError::WrongLength { got: hex.len() });
    }
    let mut bytes = [0u8; 16];
    for (position, ch) in hex.chars().enumerate() {
        let nibble = ch
            .to_digit(16)
            .ok_or(ObjectIdParseError::InvalidHexDigit { ch, position })? as u8;
        let byte = &mut bytes[position / 2];
        *byte = (*byte << 4) | nibble;
    }
    Ok(bytes)
}

fn write_hex_128(bytes: &[u8; 16], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// A 128-bit globally unique object identifier. The canonical textual form
/// is 32 lowercase hex characters, which is also the form used for backing
/// store keys.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 16]);

impl ObjectId {
    pub const ZERO: ObjectId = ObjectId([0u8; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn from_hex(hex: &str) -> Result<Self, ObjectIdParseError> {
        parse_hex_128(hex).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex_128(&self.0, f)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(")?;
        write_hex_128(&self.0, f)?;
        write!(f, ")")
    }
}

/// A 128-bit space identifier, the same shape as an [`ObjectId`] but a
/// distinct type: a space is a logical world, not an object in one.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId([u8; 16]);

impl SpaceId {
    pub const ZERO: SpaceId = SpaceId([0u8; 16]);

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn from_hex(hex: &str) -> Result<Self, ObjectIdParseError> {
        parse_hex_128(hex).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex_128(&self.0, f)
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceId(")?;
        write_hex_128(&self.0, f)?;
        write!(f, ")")
    }
}

/// The globally addressable form of an object: which space it lives in plus
/// its object id. This pair is the only addressing form that crosses the
/// wire.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SpaceObjectRef {
    pub space: SpaceId,
    pub object: ObjectId,
}

impl SpaceObjectRef {
    pub fn new(space: SpaceId, object: ObjectId) -> Self {
        Self { space, object }
    }
}

impl fmt::Display for SpaceObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.object)
    }
}

/// A space-server identifier. Server 0 is reserved as the null server and
/// never addresses a real node.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ServerId(pub u32);

impl ServerId {
    pub const NULL: ServerId = ServerId(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let oid = ObjectId::from_u128(0xdeadbeef_00112233_44556677_8899aabb);
        let hex = oid.to_string();
        assert_eq!(hex, "deadbeef00112233445566778899aabb");
        assert_eq!(ObjectId::from_hex(&hex).unwrap(), oid);
    }

    #[test]
    fn hex_rejects_bad_length() {
        assert_eq!(
            ObjectId::from_hex("abc"),
            Err(ObjectIdParseError::WrongLength { got: 3 })
        );
    }

    #[test]
    fn hex_rejects_bad_digit() {
        let err = ObjectId::from_hex("zz000000000000000000000000000000").unwrap_err();
        assert_eq!(
            err,
            ObjectIdParseError::InvalidHexDigit {
                ch: 'z',
                position: 0
            }
        );
    }

    #[test]
    fn null_server_is_null() {
        assert!(ServerId::NULL.is_null());
        assert!(!ServerId(1).is_null());
    }
}

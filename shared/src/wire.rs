use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::math::{Quat, Vec3};
use crate::oid::{ObjectId, ServerId, SpaceId, SpaceObjectRef};
use crate::time::SpaceInstant;

/// Errors produced while decoding wire data. Encoding into a `Vec` cannot
/// fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("Unexpected end of input")]
    Truncated,
    #[error("Invalid value for field '{field}'")]
    InvalidField { field: &'static str },
    #[error("Declared length {declared} exceeds remaining input {remaining}")]
    BadLength { declared: usize, remaining: usize },
}

impl From<io::Error> for WireError {
    fn from(_: io::Error) -> Self {
        WireError::Truncated
    }
}

/// Big-endian wire encoder over a growable buffer.
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        // Writing into a Vec cannot fail.
        let _ = WriteBytesExt::write_u16::<BigEndian>(&mut self.buffer, value);
    }

    pub fn write_u32(&mut self, value: u32) {
        let _ = WriteBytesExt::write_u32::<BigEndian>(&mut self.buffer, value);
    }

    pub fn write_u64(&mut self, value: u64) {
        let _ = WriteBytesExt::write_u64::<BigEndian>(&mut self.buffer, value);
    }

    pub fn write_f32(&mut self, value: f32) {
        let _ = WriteBytesExt::write_f32::<BigEndian>(&mut self.buffer, value);
    }

    pub fn write_f64(&mut self, value: f64) {
        let _ = WriteBytesExt::write_f64::<BigEndian>(&mut self.buffer, value);
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// u32 length prefix followed by the bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_raw(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_object_id(&mut self, id: &ObjectId) {
        self.write_raw(id.as_bytes());
    }

    pub fn write_space_id(&mut self, id: &SpaceId) {
        self.write_raw(id.as_bytes());
    }

    pub fn write_sor(&mut self, sor: &SpaceObjectRef) {
        self.write_space_id(&sor.space);
        self.write_object_id(&sor.object);
    }

    pub fn write_server_id(&mut self, id: ServerId) {
        self.write_u32(id.0);
    }

    pub fn write_instant(&mut self, t: SpaceInstant) {
        self.write_u64(t.as_micros());
    }

    pub fn write_vec3(&mut self, v: &Vec3) {
        self.write_f32(v.x);
        self.write_f32(v.y);
        self.write_f32(v.z);
    }

    pub fn write_quat(&mut self, q: &Quat) {
        self.write_f32(q.w);
        self.write_f32(q.x);
        self.write_f32(q.y);
        self.write_f32(q.z);
    }
}

impl Default for ByteWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Big-endian wire decoder over a borrowed slice.
pub struct ByteReader<'a> {
    input: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(ReadBytesExt::read_u8(&mut self.input)?)
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(ReadBytesExt::read_u16::<BigEndian>(&mut self.input)?)
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(ReadBytesExt::read_u32::<BigEndian>(&mut self.input)?)
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(ReadBytesExt::read_u64::<BigEndian>(&mut self.input)?)
    }

    pub fn read_f32(&mut self) -> Result<f32, WireError> {
        Ok(ReadBytesExt::read_f32::<BigEndian>(&mut self.input)?)
    }

    pub fn read_f64(&mut self) -> Result<f64, WireError> {
        Ok(ReadBytesExt::read_f64::<BigEndian>(&mut self.input)?)
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.input.len() < len {
            return Err(WireError::BadLength {
                declared: len,
                remaining: self.input.len(),
            });
        }
        let (head, tail) = self.input.split_at(len);
        self.input = tail;
        Ok(head)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.read_u32()? as usize;
        self.read_raw(len)
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| WireError::InvalidField { field: "string" })
    }

    pub fn read_object_id(&mut self) -> Result<ObjectId, WireError> {
        let raw = self.read_raw(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(ObjectId::from_bytes(bytes))
    }

    pub fn read_space_id(&mut self) -> Result<SpaceId, WireError> {
        let raw = self.read_raw(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(SpaceId::from_bytes(bytes))
    }

    pub fn read_sor(&mut self) -> Result<SpaceObjectRef, WireError> {
        let space = self.read_space_id()?;
        let object = self.read_object_id()?;
        Ok(SpaceObjectRef::new(space, object))
    }

    pub fn read_server_id(&mut self) -> Result<ServerId, WireError> {
        Ok(ServerId(self.read_u32()?))
    }

    pub fn read_instant(&mut self) -> Result<SpaceInstant, WireError> {
        Ok(SpaceInstant::from_micros(self.read_u64()?))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, WireError> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    pub fn read_quat(&mut self) -> Result<Quat, WireError> {
        Ok(Quat::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut writer = ByteWriter::new();
        writer.write_u8(7);
        writer.write_u16(0x0102);
        writer.write_u32(0xdeadbeef);
        writer.write_u64(u64::MAX - 1);
        writer.write_f32(1.5);
        let buffer = writer.finish();

        let mut reader = ByteReader::new(&buffer);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
        assert_eq!(reader.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_f32().unwrap(), 1.5);
        assert!(reader.is_empty());
    }

    #[test]
    fn truncated_input_errors() {
        let buffer = [0u8; 3];
        let mut reader = ByteReader::new(&buffer);
        assert_eq!(reader.read_u32(), Err(WireError::Truncated));
    }

    #[test]
    fn length_prefixed_bytes() {
        let mut writer = ByteWriter::new();
        writer.write_bytes(b"hello");
        writer.write_string("mesh://cube");
        let buffer = writer.finish();

        let mut reader = ByteReader::new(&buffer);
        assert_eq!(reader.read_bytes().unwrap(), b"hello");
        assert_eq!(reader.read_string().unwrap(), "mesh://cube");
    }

    #[test]
    fn bad_declared_length_errors() {
        let mut writer = ByteWriter::new();
        writer.write_u32(100);
        writer.write_raw(b"abc");
        let buffer = writer.finish();

        let mut reader = ByteReader::new(&buffer);
        assert_eq!(
            reader.read_bytes(),
            Err(WireError::BadLength {
                declared: 100,
                remaining: 3
            })
        );
    }

    #[test]
    fn identifier_round_trip() {
        let sor = SpaceObjectRef::new(SpaceId::from_u128(5), ObjectId::from_u128(77));
        let mut writer = ByteWriter::new();
        writer.write_sor(&sor);
        writer.write_server_id(ServerId(9));
        let buffer = writer.finish();

        let mut reader = ByteReader::new(&buffer);
        assert_eq!(reader.read_sor().unwrap(), sor);
        assert_eq!(reader.read_server_id().unwrap(), ServerId(9));
    }
}

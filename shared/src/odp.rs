use crate::oid::{ServerId, SpaceObjectRef};
use crate::wire::{ByteReader, ByteWriter, WireError};

/// An ODP/OHDP port. Ports below [`SYSTEM_PORT_MAX`] are reserved for
/// system services.
pub type PortId = u32;

pub const SYSTEM_PORT_MAX: PortId = 127;

/// Well-known system ports.
pub mod port {
    use super::PortId;

    pub const SESSION: PortId = 1;
    pub const LOCATION: PortId = 2;
    pub const PROXIMITY: PortId = 3;
    pub const REGISTRATION: PortId = 4;
    pub const OSEG: PortId = 5;
    pub const WEIGHT: PortId = 6;
    /// The inter-server SST link rides this OHDP port.
    pub const LINK: PortId = 7;

    /// First port available for application use.
    pub const USER_BASE: PortId = 128;
}

/// Object Datagram Protocol header: object-addressed, best-effort.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OdpHeader {
    pub source: SpaceObjectRef,
    pub dest: SpaceObjectRef,
    pub source_port: PortId,
    pub dest_port: PortId,
    pub unique_id: u64,
}

/// An ODP datagram. A null (empty) payload is legal and used as a control
/// poke.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OdpDatagram {
    pub header: OdpHeader,
    pub payload: Vec<u8>,
}

impl OdpDatagram {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(84 + self.payload.len());
        writer.write_sor(&self.header.source);
        writer.write_sor(&self.header.dest);
        writer.write_u32(self.header.source_port);
        writer.write_u32(self.header.dest_port);
        writer.write_u64(self.header.unique_id);
        writer.write_raw(&self.payload);
        writer.finish()
    }

    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(input);
        let source = reader.read_sor()?;
        let dest = reader.read_sor()?;
        let source_port = reader.read_u32()?;
        let dest_port = reader.read_u32()?;
        let unique_id = reader.read_u64()?;
        let payload = reader.read_raw(reader.remaining())?.to_vec();
        Ok(Self {
            header: OdpHeader {
                source,
                dest,
                source_port,
                dest_port,
                unique_id,
            },
            payload,
        })
    }

    pub fn size(&self) -> usize {
        84 + self.payload.len()
    }
}

/// Object Host Datagram Protocol header: the host-addressed analogue of
/// ODP, used between space servers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct OhdpHeader {
    pub source_server: ServerId,
    pub dest_server: ServerId,
    pub source_port: PortId,
    pub dest_port: PortId,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OhdpDatagram {
    pub header: OhdpHeader,
    pub payload: Vec<u8>,
}

impl OhdpDatagram {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(16 + self.payload.len());
        writer.write_server_id(self.header.source_server);
        writer.write_server_id(self.header.dest_server);
        writer.write_u32(self.header.source_port);
        writer.write_u32(self.header.dest_port);
        writer.write_raw(&self.payload);
        writer.finish()
    }

    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(input);
        let source_server = reader.read_server_id()?;
        let dest_server = reader.read_server_id()?;
        let source_port = reader.read_u32()?;
        let dest_port = reader.read_u32()?;
        let payload = reader.read_raw(reader.remaining())?.to_vec();
        Ok(Self {
            header: OhdpHeader {
                source_server,
                dest_server,
                source_port,
                dest_port,
            },
            payload,
        })
    }

    pub fn size(&self) -> usize {
        16 + self.payload.len()
    }
}

use crate::wire::{ByteReader, ByteWriter, WireError};

/// The kinds of SST packets.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PacketType {
    /// Opens a connection (lsid 0) or a substream (lsid != 0)
    Init,
    /// Accepts an Init on the same lsid
    InitAck,
    /// A data segment; an empty payload is a bare acknowledgment
    Data,
    /// Graceful end of the sender's byte stream
    Fin,
    /// Acknowledges a Fin
    FinAck,
    /// Forced teardown
    Rst,
}

impl PacketType {
    fn to_u8(self) -> u8 {
        match self {
            PacketType::Init => 0,
            PacketType::InitAck => 1,
            PacketType::Data => 2,
            PacketType::Fin => 3,
            PacketType::FinAck => 4,
            PacketType::Rst => 5,
        }
    }

    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(PacketType::Init),
            1 => Ok(PacketType::InitAck),
            2 => Ok(PacketType::Data),
            3 => Ok(PacketType::Fin),
            4 => Ok(PacketType::FinAck),
            5 => Ok(PacketType::Rst),
            _ => Err(WireError::InvalidField { field: "packet_type" }),
        }
    }
}

/// The fixed SST header carried in every packet. `channel_id` is the
/// sender's channel identifier, `connection_id` the receiver's (zero until
/// learned from the handshake). `ack` always carries the sender's current
/// cumulative acknowledgment for the stream, so every outbound segment
/// piggybacks an ACK.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SstHeader {
    pub channel_id: u32,
    pub connection_id: u32,
    pub lsid: u16,
    pub seq: u32,
    pub ack: u32,
    pub packet_type: PacketType,
}

pub const SST_HEADER_BYTES: usize = 4 + 4 + 2 + 4 + 4 + 1 + 2;

/// One SST packet: header plus opaque payload. For Init/InitAck the payload
/// is the handshake block, for Data it is stream bytes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SstPacket {
    pub header: SstHeader,
    pub payload: Vec<u8>,
}

impl SstPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(SST_HEADER_BYTES + self.payload.len());
        writer.write_u32(self.header.channel_id);
        writer.write_u32(self.header.connection_id);
        writer.write_u16(self.header.lsid);
        writer.write_u32(self.header.seq);
        writer.write_u32(self.header.ack);
        writer.write_u8(self.header.packet_type.to_u8());
        writer.write_u16(self.payload.len() as u16);
        writer.write_raw(&self.payload);
        writer.finish()
    }

    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(input);
        let channel_id = reader.read_u32()?;
        let connection_id = reader.read_u32()?;
        let lsid = reader.read_u16()?;
        let seq = reader.read_u32()?;
        let ack = reader.read_u32()?;
        let packet_type = PacketType::from_u8(reader.read_u8()?)?;
        let payload_len = reader.read_u16()? as usize;
        if payload_len != reader.remaining() {
            return Err(WireError::BadLength {
                declared: payload_len,
                remaining: reader.remaining(),
            });
        }
        let payload = reader.read_raw(payload_len)?.to_vec();
        Ok(Self {
            header: SstHeader {
                channel_id,
                connection_id,
                lsid,
                seq,
                ack,
                packet_type,
            },
            payload,
        })
    }
}

/// Handshake block carried by a connection-opening Init/InitAck (lsid 0):
/// the sender's initial sequence number and receive window.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ConnectionHandshake {
    pub initial_seq: u32,
    pub recv_window: u32,
}

impl ConnectionHandshake {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(8);
        writer.write_u32(self.initial_seq);
        writer.write_u32(self.recv_window);
        writer.finish()
    }

    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(input);
        Ok(Self {
            initial_seq: reader.read_u32()?,
            recv_window: reader.read_u32()?,
        })
    }
}

/// Handshake block carried by a substream Init: parent linkage, the stream
/// port pair, and the opener's sequence state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SubstreamHandshake {
    pub parent_lsid: u16,
    pub local_port: u32,
    pub remote_port: u32,
    pub initial_seq: u32,
    pub recv_window: u32,
}

impl SubstreamHandshake {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(18);
        writer.write_u16(self.parent_lsid);
        writer.write_u32(self.local_port);
        writer.write_u32(self.remote_port);
        writer.write_u32(self.initial_seq);
        writer.write_u32(self.recv_window);
        writer.finish()
    }

    pub fn decode(input: &[u8]) -> Result<Self, WireError> {
        let mut reader = ByteReader::new(input);
        Ok(Self {
            parent_lsid: reader.read_u16()?,
            local_port: reader.read_u32()?,
            remote_port: reader.read_u32()?,
            initial_seq: reader.read_u32()?,
            recv_window: reader.read_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_round_trip() {
        let packet = SstPacket {
            header: SstHeader {
                channel_id: 11,
                connection_id: 22,
                lsid: 4,
                seq: 1000,
                ack: 999,
                packet_type: PacketType::Data,
            },
            payload: vec![9, 8, 7],
        };
        assert_eq!(SstPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn empty_payload_round_trip() {
        let packet = SstPacket {
            header: SstHeader {
                channel_id: 1,
                connection_id: 2,
                lsid: 0,
                seq: 0,
                ack: 5,
                packet_type: PacketType::FinAck,
            },
            payload: Vec::new(),
        };
        assert_eq!(SstPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut bytes = SstPacket {
            header: SstHeader {
                channel_id: 1,
                connection_id: 2,
                lsid: 0,
                seq: 0,
                ack: 0,
                packet_type: PacketType::Data,
            },
            payload: vec![1, 2, 3, 4],
        }
        .encode();
        bytes.truncate(bytes.len() - 1);
        assert!(SstPacket::decode(&bytes).is_err());
    }

    #[test]
    fn bad_packet_type_rejected() {
        let mut bytes = SstPacket {
            header: SstHeader {
                channel_id: 1,
                connection_id: 2,
                lsid: 0,
                seq: 0,
                ack: 0,
                packet_type: PacketType::Init,
            },
            payload: Vec::new(),
        }
        .encode();
        // flags byte sits right before the u16 payload length
        let flags_at = bytes.len() - 3;
        bytes[flags_at] = 99;
        assert!(SstPacket::decode(&bytes).is_err());
    }

    #[test]
    fn handshake_round_trip() {
        let hs = ConnectionHandshake {
            initial_seq: 77,
            recv_window: 65536,
        };
        assert_eq!(ConnectionHandshake::decode(&hs.encode()).unwrap(), hs);

        let sub = SubstreamHandshake {
            parent_lsid: 0,
            local_port: 200,
            remote_port: 300,
            initial_seq: 5,
            recv_window: 65536,
        };
        assert_eq!(SubstreamHandshake::decode(&sub.encode()).unwrap(), sub);
    }
}

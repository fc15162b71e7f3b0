use thiserror::Error;

/// Errors surfaced by the SST transport API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SstError {
    #[error("Unknown connection {channel}")]
    UnknownConnection { channel: u32 },
    #[error("Unknown stream lsid {lsid} on connection {channel}")]
    UnknownStream { channel: u32, lsid: u16 },
    #[error("Connection {channel} is not connected")]
    NotConnected { channel: u32 },
    #[error("Stream lsid {lsid} is closed or closing")]
    StreamClosed { lsid: u16 },
    #[error("Send buffer full ({buffered} bytes buffered, limit {limit})")]
    SendBufferFull { buffered: usize, limit: usize },
    #[error("Port {port} is not being listened on")]
    NotListening { port: u32 },
}

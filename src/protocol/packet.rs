use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;
/// Length of the full authentication scramble
pub const SCRAMBLE_SIZE: usize = 20;
/// Length of the first scramble half in the server handshake
pub const SCRAMBLE_PART_1: usize = 8;

/// Reply tag bytes (first payload byte of a server response)
pub const REPLY_OK: u8 = 0x00;
pub const REPLY_LOCAL_INFILE: u8 = 0xFB;
pub const REPLY_EOF: u8 = 0xFE;
pub const REPLY_ERR: u8 = 0xFF;

/// MySQL wire protocol packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.put_u8((len & 0xFF) as u8);
        dst.put_u8(((len >> 8) & 0xFF) as u8);
        dst.put_u8(((len >> 16) & 0xFF) as u8);
        dst.put_u8(self.sequence_id);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode one packet from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// Command byte of a client packet, if any
    pub fn command(&self) -> Option<Command> {
        self.payload.first().map(|&b| Command::from(b))
    }
}

/// Peek the payload length of the packet at the start of `buf` without consuming
pub fn peek_payload_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < PACKET_HEADER_SIZE {
        return None;
    }
    Some(buf[0] as usize | ((buf[1] as usize) << 8) | ((buf[2] as usize) << 16))
}

/// Split off all wholly-contained packets from the front of `buf`.
///
/// If the first packet starts a large-packet chain (payload == MAX_PACKET_SIZE),
/// the chain is only split off once the terminating short packet is present,
/// so callers always see whole logical payloads. Returns the raw bytes of the
/// complete packets; partial data stays in `buf`. Never copies payload bytes.
pub fn split_complete_packets(buf: &mut BytesMut) -> Bytes {
    // `used` only advances at logical packet boundaries, so an unterminated
    // max-size chain is held back in its entirety.
    let mut used = 0;
    let mut scanned = 0;

    loop {
        let rest = &buf[scanned..];
        let Some(len) = peek_payload_len(rest) else {
            break;
        };
        if rest.len() < PACKET_HEADER_SIZE + len {
            break;
        }
        scanned += PACKET_HEADER_SIZE + len;
        if len != MAX_PACKET_SIZE {
            used = scanned;
        }
    }

    buf.split_to(used).freeze()
}

/// True if the payload is an OK packet
pub fn is_ok_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == REPLY_OK
}

/// True if the payload is an ERR packet
pub fn is_err_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == REPLY_ERR
}

/// True if the payload is an EOF packet (0xfe with a short payload)
pub fn is_eof_packet(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == REPLY_EOF && payload.len() < 9
}

/// True if the payload starts a LOCAL INFILE request
pub fn is_local_infile(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == REPLY_LOCAL_INFILE
}

/// True if the payload is an AuthSwitchRequest (0xfe with a long payload)
pub fn is_auth_switch_request(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == REPLY_EOF && payload.len() >= 9
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capability bits the proxy understands and is willing to pass through
    /// to a backend. CLIENT_DEPRECATE_EOF is excluded: the reply tracker
    /// relies on EOF packet boundaries.
    pub const CLIENT_COMPATIBLE: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_INTERACTIVE
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_CONNECT_ATTRS
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

    /// Default capabilities announced to connecting clients
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH;
}

/// Server status flags carried in OK and EOF packets
#[allow(dead_code)]
pub mod status_flags {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXIST: u16 = 0x0008;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl Command {
    /// Whether the server sends a response to this command
    pub fn will_respond(self) -> bool {
        !matches!(
            self,
            Command::StmtSendLongData | Command::StmtClose | Command::Quit
        )
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_packet(seq: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        Packet::new(seq, payload.to_vec()).encode(&mut buf);
        buf
    }

    #[test]
    fn test_decode_roundtrip() {
        let mut buf = raw_packet(3, b"\x03SELECT 1");
        let packet = Packet::decode(&mut buf).unwrap();
        assert_eq!(packet.sequence_id, 3);
        assert_eq!(&packet.payload[..], b"\x03SELECT 1");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial() {
        let mut buf = BytesMut::from(&b"\x05\x00\x00"[..]);
        assert!(Packet::decode(&mut buf).is_none());
        assert_eq!(buf.len(), 3);

        // Header present but payload truncated
        let mut buf = BytesMut::from(&b"\x05\x00\x00\x00ab"[..]);
        assert!(Packet::decode(&mut buf).is_none());
    }

    #[test]
    fn test_split_complete_packets() {
        let mut buf = raw_packet(1, b"abc");
        buf.extend_from_slice(&raw_packet(2, b"defg"));
        buf.extend_from_slice(&[0x10, 0x00]); // partial header

        let complete = split_complete_packets(&mut buf);
        assert_eq!(complete.len(), (4 + 3) + (4 + 4));
        assert_eq!(buf.len(), 2);

        // Reassembly law: the split-off bytes are the packet prefix verbatim
        let mut first = BytesMut::from(&complete[..]);
        let p1 = Packet::decode(&mut first).unwrap();
        assert_eq!(&p1.payload[..], b"abc");
    }

    #[test]
    fn test_split_holds_back_large_packet_chain() {
        // A max-size packet with no terminator must be held back whole
        let mut payload = vec![0u8; MAX_PACKET_SIZE];
        payload[0] = 0x01;
        let mut buf = raw_packet(1, &payload);
        let before = buf.len();

        let complete = split_complete_packets(&mut buf);
        assert!(complete.is_empty());
        assert_eq!(buf.len(), before);

        // Once the (empty) terminating packet arrives, the chain splits off
        buf.extend_from_slice(&raw_packet(2, b""));
        let complete = split_complete_packets(&mut buf);
        assert_eq!(complete.len(), (4 + MAX_PACKET_SIZE) + 4);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_predicates() {
        assert!(is_ok_packet(&[0x00, 0x00, 0x00]));
        assert!(is_err_packet(&[0xFF, 0x15, 0x04]));
        assert!(is_eof_packet(&[0xFE, 0x00, 0x00, 0x02, 0x00]));
        assert!(is_local_infile(&[0xFB, b'f']));
        // 0xfe with a long payload is an AuthSwitchRequest, not EOF
        let auth_switch = [0xFEu8; 24];
        assert!(!is_eof_packet(&auth_switch));
        assert!(is_auth_switch_request(&auth_switch));
    }

    #[test]
    fn test_command_will_respond() {
        assert!(Command::Query.will_respond());
        assert!(Command::Ping.will_respond());
        assert!(!Command::Quit.will_respond());
        assert!(!Command::StmtClose.will_respond());
        assert!(!Command::StmtSendLongData.will_respond());
    }
}

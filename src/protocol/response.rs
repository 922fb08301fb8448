//! Server response packets: OK (with session-state tracking), ERR, EOF and
//! the COM_STMT_PREPARE response header.

use bytes::{BufMut, BytesMut};

use super::packet::{status_flags::*, Packet, REPLY_ERR, REPLY_OK};
use super::reader::{put_lenenc_int, PayloadReader};

/// Session-track block type tags
pub const SESSION_TRACK_SYSTEM_VARIABLES: u8 = 0x00;
pub const SESSION_TRACK_SCHEMA: u8 = 0x01;
pub const SESSION_TRACK_STATE_CHANGE: u8 = 0x02;
pub const SESSION_TRACK_GTIDS: u8 = 0x03;
pub const SESSION_TRACK_TRANSACTION_CHARACTERISTICS: u8 = 0x04;
pub const SESSION_TRACK_TRANSACTION_TYPE: u8 = 0x05;

/// Name under which the GTID session-track block is surfaced to routers
pub const VAR_LAST_GTID: &str = "last_gtid";

/// Parsed OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: Vec<u8>,
    /// Raw session-state block, kept verbatim for lossless re-encoding
    pub session_state: Vec<u8>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        }
    }

    pub fn more_results(&self) -> bool {
        self.status_flags & SERVER_MORE_RESULTS_EXIST != 0
    }

    pub fn session_state_changed(&self) -> bool {
        self.status_flags & SERVER_SESSION_STATE_CHANGED != 0
    }

    /// Parse an OK payload. `session_track` controls whether the trailing
    /// info string and session-state block are expected.
    pub fn parse(payload: &[u8], session_track: bool) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != REPLY_OK {
            return None;
        }

        let affected_rows = r.lenenc_int()?;
        let last_insert_id = r.lenenc_int()?;
        let status_flags = r.u16_le()?;
        let warnings = r.u16_le()?;

        let mut info = Vec::new();
        let mut session_state = Vec::new();

        if session_track && !r.is_empty() {
            info = r.lenenc_bytes()?.to_vec();
            if status_flags & SERVER_SESSION_STATE_CHANGED != 0 {
                session_state = r.lenenc_bytes()?.to_vec();
            }
        } else if !r.is_empty() {
            info = r.rest().to_vec();
        }

        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state,
        })
    }

    /// Walk the session-state block, yielding `(name, value)` pairs for the
    /// recognised change types. Unknown types are skipped by length.
    pub fn session_variables(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut r = PayloadReader::new(&self.session_state);

        while !r.is_empty() {
            let Some(kind) = r.u8() else { break };
            let Some(len) = r.lenenc_int() else { break };
            let Some(body) = r.bytes(len as usize) else { break };
            let mut b = PayloadReader::new(body);

            match kind {
                SESSION_TRACK_SYSTEM_VARIABLES => {
                    if let (Some(name), Some(value)) = (b.lenenc_str(), b.lenenc_str()) {
                        out.push((name, value));
                    }
                }
                SESSION_TRACK_SCHEMA => {
                    if let Some(schema) = b.lenenc_str() {
                        out.push(("schema".to_string(), schema));
                    }
                }
                SESSION_TRACK_GTIDS => {
                    // Encoding specification byte precedes the GTID string
                    if b.lenenc_int().is_some() {
                        if let Some(gtid) = b.lenenc_str() {
                            out.push((VAR_LAST_GTID.to_string(), gtid));
                        }
                    }
                }
                SESSION_TRACK_TRANSACTION_CHARACTERISTICS => {
                    if let Some(value) = b.lenenc_str() {
                        out.push(("trx_characteristics".to_string(), value));
                    }
                }
                SESSION_TRACK_TRANSACTION_TYPE => {
                    if let Some(value) = b.lenenc_str() {
                        out.push(("trx_state".to_string(), value));
                    }
                }
                SESSION_TRACK_STATE_CHANGE => {}
                _ => {}
            }
        }

        out
    }

    /// Encode to packet. Re-emits the parsed fields verbatim, including the
    /// session-state block when present.
    pub fn encode(&self, sequence_id: u8, session_track: bool) -> Packet {
        let mut buf = Vec::new();

        buf.push(REPLY_OK);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);
        buf.extend_from_slice(&self.status_flags.to_le_bytes());
        buf.extend_from_slice(&self.warnings.to_le_bytes());

        if session_track {
            put_lenenc_int(&mut buf, self.info.len() as u64);
            buf.extend_from_slice(&self.info);
            if self.session_state_changed() {
                put_lenenc_int(&mut buf, self.session_state.len() as u64);
                buf.extend_from_slice(&self.session_state);
            }
        } else {
            buf.extend_from_slice(&self.info);
        }

        Packet::new(sequence_id, buf)
    }
}

/// Parsed ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn new(code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: sql_state.to_string(),
            message: message.into(),
        }
    }

    /// The error the client sees when a backend is lost
    pub fn lost_connection(message: impl Into<String>) -> Self {
        Self::new(2003, "HY000", message)
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != REPLY_ERR {
            return None;
        }

        let code = r.u16_le()?;

        let (sql_state, message) = if r.remaining() >= 6 && payload[3] == b'#' {
            r.skip(1)?;
            let state = String::from_utf8_lossy(r.bytes(5)?).into_owned();
            (state, String::from_utf8_lossy(r.rest()).into_owned())
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(r.rest()).into_owned())
        };

        Some(Self {
            code,
            sql_state,
            message,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(REPLY_ERR);
        buf.put_u16_le(self.code);
        buf.put_u8(b'#');
        buf.extend_from_slice(self.sql_state.as_bytes());
        buf.extend_from_slice(self.message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Status flags and warning count of an EOF packet
pub fn eof_status(payload: &[u8]) -> Option<(u16, u16)> {
    let mut r = PayloadReader::new(payload);
    r.skip(1)?; // 0xfe
    let warnings = r.u16_le()?;
    let status = r.u16_le()?;
    Some((status, warnings))
}

/// COM_STMT_PREPARE OK response header
#[derive(Debug, Clone, Copy)]
pub struct PrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

impl PrepareOk {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != REPLY_OK {
            return None;
        }
        let statement_id = r.u32_le()?;
        let num_columns = r.u16_le()?;
        let num_params = r.u16_le()?;
        r.skip(1)?; // filler
        let warnings = r.u16_le().unwrap_or(0);

        Some(Self {
            statement_id,
            num_columns,
            num_params,
            warnings,
        })
    }

    /// Column/parameter definition packets plus one EOF per non-empty group
    pub fn trailing_packets(&self) -> u32 {
        let mut n = 0;
        if self.num_columns > 0 {
            n += self.num_columns as u32 + 1;
        }
        if self.num_params > 0 {
            n += self.num_params as u32 + 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_parse_basic() {
        let payload = [0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00];
        let ok = OkPacket::parse(&payload, false).unwrap();
        assert_eq!(ok.affected_rows, 1);
        assert_eq!(ok.last_insert_id, 0);
        assert_eq!(ok.status_flags, SERVER_STATUS_AUTOCOMMIT);
        assert!(!ok.more_results());
    }

    fn session_track_ok() -> Vec<u8> {
        // OK with SERVER_SESSION_STATE_CHANGED carrying a system variable
        // and a GTID block
        let mut state = Vec::new();
        state.push(SESSION_TRACK_SYSTEM_VARIABLES);
        let mut var = Vec::new();
        put_lenenc_int(&mut var, 10);
        var.extend_from_slice(b"autocommit");
        put_lenenc_int(&mut var, 3);
        var.extend_from_slice(b"OFF");
        put_lenenc_int(&mut state, var.len() as u64);
        state.extend_from_slice(&var);

        state.push(SESSION_TRACK_GTIDS);
        let mut gtid = Vec::new();
        put_lenenc_int(&mut gtid, 0); // encoding spec
        put_lenenc_int(&mut gtid, 6);
        gtid.extend_from_slice(b"0-1-42");
        put_lenenc_int(&mut state, gtid.len() as u64);
        state.extend_from_slice(&gtid);

        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&(SERVER_SESSION_STATE_CHANGED).to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        put_lenenc_int(&mut payload, 0); // empty info
        put_lenenc_int(&mut payload, state.len() as u64);
        payload.extend_from_slice(&state);
        payload
    }

    #[test]
    fn test_ok_session_track_variables() {
        let payload = session_track_ok();
        let ok = OkPacket::parse(&payload, true).unwrap();
        assert!(ok.session_state_changed());

        let vars = ok.session_variables();
        assert!(vars.contains(&("autocommit".to_string(), "OFF".to_string())));
        assert!(vars.iter().any(|(k, v)| k == VAR_LAST_GTID && v == "0-1-42"));
    }

    #[test]
    fn test_ok_session_track_reencode_lossless() {
        let payload = session_track_ok();
        let ok = OkPacket::parse(&payload, true).unwrap();
        let packet = ok.encode(1, true);
        assert_eq!(&packet.payload[..], &payload[..]);
    }

    #[test]
    fn test_err_roundtrip() {
        let err = ErrPacket::new(1045, "28000", "Access denied for user 'app'");
        let packet = err.encode(2);
        let parsed = ErrPacket::parse(&packet.payload).unwrap();
        assert_eq!(parsed.code, 1045);
        assert_eq!(parsed.sql_state, "28000");
        assert_eq!(parsed.message, "Access denied for user 'app'");
    }

    #[test]
    fn test_err_without_sqlstate_marker() {
        let mut payload = vec![0xFF];
        payload.extend_from_slice(&1040u16.to_le_bytes());
        payload.extend_from_slice(b"Too many connections");
        let parsed = ErrPacket::parse(&payload).unwrap();
        assert_eq!(parsed.code, 1040);
        assert_eq!(parsed.sql_state, "HY000");
    }

    #[test]
    fn test_prepare_ok() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&17u32.to_le_bytes());
        payload.extend_from_slice(&1u16.to_le_bytes()); // columns
        payload.extend_from_slice(&1u16.to_le_bytes()); // params
        payload.push(0);
        payload.extend_from_slice(&0u16.to_le_bytes());

        let ok = PrepareOk::parse(&payload).unwrap();
        assert_eq!(ok.statement_id, 17);
        assert_eq!(ok.num_columns, 1);
        assert_eq!(ok.num_params, 1);
        // 1 param def + EOF + 1 col def + EOF
        assert_eq!(ok.trailing_packets(), 4);
    }

    #[test]
    fn test_eof_status() {
        let payload = [0xFE, 0x01, 0x00, 0x08, 0x00];
        let (status, warnings) = eof_status(&payload).unwrap();
        assert_eq!(warnings, 1);
        assert_ne!(status & SERVER_MORE_RESULTS_EXIST, 0);
    }
}

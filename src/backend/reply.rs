//! Reply tracking for backend connections.
//!
//! The tracker consumes complete packets one at a time and follows the
//! response structure of the command most recently written to the backend.
//! It never rewrites packet bytes; the session forwards them verbatim.

use std::collections::HashMap;

use crate::protocol::{
    eof_status, is_eof_packet, peek_payload_len, status_flags::*, Command, ErrPacket, OkPacket,
    PayloadReader, PrepareOk, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, REPLY_EOF, REPLY_ERR,
    REPLY_LOCAL_INFILE, REPLY_OK,
};

/// Where we are inside the current response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyState {
    /// Expecting the first packet of a response
    Start,
    /// Response complete; only out-of-band errors may arrive. Idle
    /// connections sit here, which is also the only state a connection can
    /// be pooled in.
    #[default]
    Done,
    /// Counting column definition packets
    RsetColDef,
    /// Expecting the EOF that closes the column definitions
    RsetColDefEof,
    /// Reading resultset rows
    RsetRows,
    /// Counting COM_STMT_PREPARE trailing packets
    Prepare,
}

/// Metadata about the in-flight (or just completed) response
#[derive(Debug, Clone, Default)]
pub struct Reply {
    command: Option<Command>,
    state: ReplyState,
    rows: u64,
    field_counts: Vec<u64>,
    warnings: u16,
    variables: HashMap<String, String>,
    error: Option<ErrPacket>,
    generated_id: u32,
    param_count: u16,
    is_ok: bool,
    server_status: u16,
    bytes: u64,
}

impl Reply {
    pub fn command(&self) -> Option<Command> {
        self.command
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn field_counts(&self) -> &[u64] {
        &self.field_counts
    }

    pub fn warnings(&self) -> u16 {
        self.warnings
    }

    pub fn error(&self) -> Option<&ErrPacket> {
        self.error.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.is_ok
    }

    /// Statement id assigned by COM_STMT_PREPARE
    pub fn generated_id(&self) -> u32 {
        self.generated_id
    }

    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Status flags from the most recent OK packet
    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    fn clear(&mut self) {
        *self = Reply::default();
    }
}

/// Packet-by-packet response state machine
#[derive(Debug, Default)]
pub struct ReplyTracker {
    reply: Reply,
    num_coldefs: u64,
    ps_packets: u32,
    /// Next packet is the continuation of a max-size packet
    skip_next: bool,
    /// The client command itself spans multiple packets
    large_query: bool,
    /// COM_STMT_EXECUTE opened a cursor; response ends at the coldef EOF
    opening_cursor: bool,
    /// COM_CHANGE_USER in flight; a bare EOF is an AuthSwitchRequest
    changing_user: bool,
    /// LOAD DATA LOCAL INFILE in progress on this connection
    load_active: bool,
    /// Parse session-track data out of OK packets
    session_track: bool,
}

impl ReplyTracker {
    pub fn new(session_track: bool) -> Self {
        Self {
            session_track,
            ..Default::default()
        }
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn state(&self) -> ReplyState {
        self.reply.state
    }

    pub fn set_state(&mut self, state: ReplyState) {
        self.reply.state = state;
    }

    pub fn is_complete(&self) -> bool {
        self.reply.is_complete()
    }

    pub fn set_changing_user(&mut self, value: bool) {
        self.changing_user = value;
    }

    pub fn changing_user(&self) -> bool {
        self.changing_user
    }

    pub fn load_active(&self) -> bool {
        self.load_active
    }

    /// Inspect a client command about to be written and prime the tracker
    /// for its response. `framed` is the full packet including the header.
    pub fn track_query(&mut self, framed: &[u8]) {
        let Some(len) = peek_payload_len(framed) else {
            return;
        };
        let payload = &framed[PACKET_HEADER_SIZE..];

        if self.changing_user {
            // Re-authentication in progress; the bytes are auth data
            return;
        }

        if self.load_active {
            // The client streams file contents; an empty packet ends the load
            if len == 0 {
                self.load_active = false;
                self.reply.state = ReplyState::Start;
            }
        } else if !self.large_query {
            let command = payload.first().map(|&b| Command::from(b));
            self.reply.clear();
            self.reply.command = command;

            match command {
                Some(cmd) if cmd.will_respond() => {
                    self.reply.state = ReplyState::Start;
                }
                _ => {
                    self.reply.state = ReplyState::Done;
                }
            }

            if command == Some(Command::StmtExecute) {
                // Flag byte follows the 4-byte statement id; any non-zero
                // value opens a cursor
                self.opening_cursor = payload.get(5).copied().unwrap_or(0) != 0;
            } else if command == Some(Command::StmtFetch) {
                self.reply.state = ReplyState::RsetRows;
            }
        }

        // A max-size client packet means the next packet continues this
        // command rather than starting a new one.
        self.large_query = len == MAX_PACKET_SIZE;
    }

    /// Consume a buffer of complete packets (headers included), advancing
    /// the state machine once per logical packet.
    pub fn process_packets(&mut self, buf: &[u8]) {
        let mut pos = 0;

        while let Some(len) = peek_payload_len(&buf[pos..]) {
            let payload = &buf[pos + PACKET_HEADER_SIZE..pos + PACKET_HEADER_SIZE + len];
            pos += PACKET_HEADER_SIZE + len;

            // Only resultset rows can produce max-size packets; their
            // continuations carry no structural meaning.
            let skip = self.skip_next;
            self.skip_next = len == MAX_PACKET_SIZE;

            if !skip {
                self.process_one_packet(payload);
            }
        }

        self.reply.bytes += buf.len() as u64;
    }

    fn process_one_packet(&mut self, payload: &[u8]) {
        match self.reply.state {
            ReplyState::Start => self.process_reply_start(payload),

            ReplyState::Done => {
                // Only an out-of-band error may arrive here
                if payload.first() == Some(&REPLY_ERR) {
                    self.update_error(payload);
                }
            }

            ReplyState::RsetColDef => {
                self.num_coldefs = self.num_coldefs.saturating_sub(1);
                if self.num_coldefs == 0 {
                    self.reply.state = ReplyState::RsetColDefEof;
                }
            }

            ReplyState::RsetColDefEof => {
                self.reply.state = ReplyState::RsetRows;

                if self.opening_cursor {
                    self.opening_cursor = false;
                    self.reply.state = ReplyState::Done;
                }
            }

            ReplyState::RsetRows => {
                if is_eof_packet(payload) {
                    let (status, warnings) = eof_status(payload).unwrap_or((0, 0));
                    self.reply.warnings = warnings;
                    self.reply.state = if status & SERVER_MORE_RESULTS_EXIST != 0 {
                        ReplyState::Start
                    } else {
                        ReplyState::Done
                    };
                } else if payload.first() == Some(&REPLY_ERR) {
                    self.update_error(payload);
                    self.reply.state = ReplyState::Done;
                } else {
                    self.reply.rows += 1;
                }
            }

            ReplyState::Prepare => {
                self.ps_packets = self.ps_packets.saturating_sub(1);
                if self.ps_packets == 0 {
                    self.reply.state = ReplyState::Done;
                }
            }
        }
    }

    fn process_reply_start(&mut self, payload: &[u8]) {
        match self.reply.command {
            Some(Command::BinlogDump) | Some(Command::BinlogDumpGtid) => {
                // An endless stream of events; stay in Start
            }
            Some(Command::Statistics) => {
                // Single string response
                self.reply.state = ReplyState::Done;
            }
            Some(Command::FieldList) => {
                // Field definitions without a header packet
                self.reply.state = ReplyState::RsetRows;
            }
            _ => self.process_result_start(payload),
        }
    }

    fn process_result_start(&mut self, payload: &[u8]) {
        match payload.first().copied() {
            Some(REPLY_OK) => {
                self.reply.is_ok = true;
                if self.reply.command == Some(Command::StmtPrepare) {
                    self.process_ps_response(payload);
                } else {
                    self.process_ok_packet(payload);
                }
            }

            Some(REPLY_LOCAL_INFILE) => {
                // The client now sends the file; the server's OK/ERR for it
                // starts a fresh response.
                self.load_active = true;
                self.reply.state = ReplyState::Done;
            }

            Some(REPLY_ERR) => {
                self.update_error(payload);
                self.reply.state = ReplyState::Done;
            }

            Some(REPLY_EOF) if payload.len() < 9 => {
                // Only valid as an AuthSwitchRequest during change-user
                debug_assert!(self.changing_user);
            }

            Some(_) => {
                // Length-encoded column count: start of a resultset
                let mut r = PayloadReader::new(payload);
                self.num_coldefs = r.lenenc_int().unwrap_or(0);
                self.reply.field_counts.push(self.num_coldefs);
                self.reply.state = ReplyState::RsetColDef;
            }

            None => {}
        }
    }

    fn process_ok_packet(&mut self, payload: &[u8]) {
        let Some(ok) = OkPacket::parse(payload, self.session_track) else {
            return;
        };

        if !ok.more_results() {
            self.reply.state = ReplyState::Done;
        }
        self.reply.warnings = ok.warnings;
        self.reply.server_status = ok.status_flags;

        if self.session_track && ok.session_state_changed() {
            for (name, value) in ok.session_variables() {
                self.reply.variables.insert(name, value);
            }
        }
    }

    fn process_ps_response(&mut self, payload: &[u8]) {
        let Some(ok) = PrepareOk::parse(payload) else {
            return;
        };

        self.reply.generated_id = ok.statement_id;
        self.reply.param_count = ok.num_params;
        self.ps_packets = ok.trailing_packets();

        self.reply.state = if self.ps_packets == 0 {
            ReplyState::Done
        } else {
            ReplyState::Prepare
        };
    }

    fn update_error(&mut self, payload: &[u8]) {
        if let Some(err) = ErrPacket::parse(payload) {
            self.reply.error = Some(err);
        }
    }
}

mod codec;
mod handshake;
mod packet;
mod reader;
mod response;

pub use codec::PacketCodec;
pub use handshake::{
    backend_capabilities, compute_auth_response, password_hash, scramble_token,
    verify_auth_response, HandshakeResponse, ServerHandshake, DEFAULT_AUTH_PLUGIN,
};
pub use packet::{
    capabilities, is_auth_switch_request, is_eof_packet, is_err_packet, is_local_infile,
    is_ok_packet, peek_payload_len, split_complete_packets, status_flags, Command, Packet,
    MAX_PACKET_SIZE, PACKET_HEADER_SIZE, REPLY_EOF, REPLY_ERR, REPLY_LOCAL_INFILE, REPLY_OK,
    SCRAMBLE_SIZE,
};
pub use reader::{put_lenenc_int, PayloadReader};
pub use response::{
    eof_status, ErrPacket, OkPacket, PrepareOk, VAR_LAST_GTID,
};

use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Packet, SCRAMBLE_PART_1, SCRAMBLE_SIZE};
use super::reader::PayloadReader;

pub const DEFAULT_AUTH_PLUGIN: &str = "mysql_native_password";

/// MySQL protocol v10 initial handshake (server -> client).
///
/// Parsed when dialing a backend, generated when greeting a client.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: [u8; SCRAMBLE_SIZE],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl ServerHandshake {
    /// Create a handshake to greet a connecting client with a fresh scramble
    pub fn generate(thread_id: u32, server_version: &str) -> Self {
        use rand::RngCore;
        let mut scramble = [0u8; SCRAMBLE_SIZE];
        rand::thread_rng().fill_bytes(&mut scramble);
        // The scramble doubles as a NUL-terminated string on the wire
        for b in scramble.iter_mut() {
            if *b == 0 {
                *b = 0x2A;
            }
        }

        Self {
            protocol_version: 10,
            server_version: server_version.to_string(),
            thread_id,
            scramble,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: 0x0002,
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
        }
    }

    /// Encode to packet (sequence 0)
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(self.protocol_version);
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);
        buf.put_u32_le(self.thread_id);

        // Scramble part 1 (8 bytes) + filler
        buf.extend_from_slice(&self.scramble[..SCRAMBLE_PART_1]);
        buf.put_u8(0);

        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);
        buf.put_u8(self.character_set);
        buf.put_u16_le(self.status_flags);
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((SCRAMBLE_SIZE + 1) as u8);
        } else {
            buf.put_u8(0);
        }

        buf.extend_from_slice(&[0u8; 10]);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.scramble[SCRAMBLE_PART_1..]);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    /// Parse from packet payload. Returns None on malformed input.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);

        let protocol_version = r.u8()?;
        if protocol_version != 10 {
            return None;
        }

        let server_version = r.nul_str()?;
        let thread_id = r.u32_le()?;

        let mut scramble = [0u8; SCRAMBLE_SIZE];
        scramble[..SCRAMBLE_PART_1].copy_from_slice(r.bytes(SCRAMBLE_PART_1)?);

        r.skip(1)?; // filler

        let capability_lo = r.u16_le()? as u32;
        let character_set = r.u8()?;
        let status_flags = r.u16_le()?;
        let capability_hi = r.u16_le()? as u32;
        let capability_flags = capability_lo | (capability_hi << 16);

        let scramble_len = r.u8()? as usize;
        r.skip(10)?; // reserved

        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            // Second scramble half, at least 13 bytes of which 12 are used
            let part2_len = std::cmp::max(13, scramble_len.saturating_sub(SCRAMBLE_PART_1));
            let part2 = r.bytes(part2_len)?;
            let used = std::cmp::min(SCRAMBLE_SIZE - SCRAMBLE_PART_1, part2.len());
            scramble[SCRAMBLE_PART_1..SCRAMBLE_PART_1 + used].copy_from_slice(&part2[..used]);
        }

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            r.nul_str().unwrap_or_else(|| DEFAULT_AUTH_PLUGIN.to_string())
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// Handshake response (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
    pub connect_attrs: Vec<u8>,
}

impl HandshakeResponse {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut r = PayloadReader::new(payload);

        let capability_flags = r.u32_le()?;
        let max_packet_size = r.u32_le()?;
        let character_set = r.u8()?;
        r.skip(23)?; // reserved

        let username = r.nul_str()?;

        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.lenenc_bytes()?.to_vec()
        } else if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8()? as usize;
            r.bytes(len)?.to_vec()
        } else {
            let s = r.nul_str()?;
            s.into_bytes()
        };

        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
            let db = r.nul_str()?;
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            r.nul_str().unwrap_or_else(|| DEFAULT_AUTH_PLUGIN.to_string())
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        let connect_attrs = if capability_flags & CLIENT_CONNECT_ATTRS != 0 {
            r.rest().to_vec()
        } else {
            Vec::new()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
            connect_attrs,
        })
    }

    /// Encode to packet
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);
        buf.extend_from_slice(&[0u8; 23]);

        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        if self.capability_flags & CLIENT_CONNECT_ATTRS != 0 && !self.connect_attrs.is_empty() {
            buf.extend_from_slice(&self.connect_attrs);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Backend capability mask per the negotiation rules: start from the
/// client's own mask restricted to what the proxy can pass through, then
/// force the bits the proxy itself depends on.
pub fn backend_capabilities(
    client_capabilities: u32,
    with_ssl: bool,
    session_track: bool,
    db_specified: bool,
) -> u32 {
    let mut caps = client_capabilities & CLIENT_COMPATIBLE;

    if with_ssl {
        caps |= CLIENT_SSL;
    }

    if session_track {
        caps |= CLIENT_SESSION_TRACK;
    }

    caps |= CLIENT_MULTI_STATEMENTS;

    if db_specified {
        caps |= CLIENT_CONNECT_WITH_DB;
    } else {
        caps &= !CLIENT_CONNECT_WITH_DB;
    }

    caps | CLIENT_PLUGIN_AUTH
}

/// SHA1(password)
pub fn password_hash(password: &str) -> [u8; 20] {
    let mut out = [0u8; 20];
    if !password.is_empty() {
        out.copy_from_slice(&Sha1::digest(password.as_bytes()));
    }
    out
}

/// mysql_native_password token from the plaintext password:
/// SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))
pub fn compute_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hash1 = Sha1::digest(password.as_bytes());
    scramble_token(&hash1, scramble)
}

/// mysql_native_password token from the stored first-stage hash
/// (SHA1 of the password), as used when re-authenticating a pooled
/// connection where the plaintext is not available.
pub fn scramble_token(sha1_password: &[u8], scramble: &[u8]) -> Vec<u8> {
    let hash2 = Sha1::digest(sha1_password);

    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    sha1_password
        .iter()
        .zip(hash3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Verify a client's native-password token against the expected double hash
/// SHA1(SHA1(password)) and the scramble sent to the client.
pub fn verify_auth_response(token: &[u8], double_hash: &[u8], scramble: &[u8]) -> bool {
    if token.len() != 20 {
        return false;
    }

    // SHA1(password) = token XOR SHA1(scramble || SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(double_hash);
    let hash3 = hasher.finalize();

    let stage1: Vec<u8> = token.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect();
    Sha1::digest(&stage1).as_slice() == double_hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_handshake_roundtrip() {
        let hs = ServerHandshake::generate(42, "8.0.0-bifrost");
        let packet = hs.encode();
        let parsed = ServerHandshake::parse(&packet.payload).unwrap();

        assert_eq!(parsed.protocol_version, 10);
        assert_eq!(parsed.server_version, "8.0.0-bifrost");
        assert_eq!(parsed.thread_id, 42);
        assert_eq!(parsed.scramble, hs.scramble);
        assert_eq!(parsed.auth_plugin_name, DEFAULT_AUTH_PLUGIN);
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let response = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES,
            max_packet_size: 16_777_216,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: vec![0xAB; 20],
            database: Some("orders".to_string()),
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
            connect_attrs: Vec::new(),
        };

        let packet = response.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();

        assert_eq!(parsed.username, "app");
        assert_eq!(parsed.auth_response, vec![0xAB; 20]);
        assert_eq!(parsed.database.as_deref(), Some("orders"));
        assert_eq!(parsed.max_packet_size, 16_777_216);
    }

    #[test]
    fn test_auth_token_verifies() {
        let scramble = [7u8; 20];
        let token = compute_auth_response("secret", &scramble);
        assert_eq!(token.len(), 20);

        let double_hash = Sha1::digest(Sha1::digest(b"secret"));
        assert!(verify_auth_response(&token, &double_hash, &scramble));
        assert!(!verify_auth_response(&token, &double_hash, &[8u8; 20]));

        let wrong = compute_auth_response("other", &scramble);
        assert!(!verify_auth_response(&wrong, &double_hash, &scramble));
    }

    #[test]
    fn test_token_from_stage1_hash_matches_plaintext_token() {
        let scramble = [3u8; 20];
        let from_plain = compute_auth_response("secret", &scramble);
        let stage1 = password_hash("secret");
        let from_hash = scramble_token(&stage1, &scramble);
        assert_eq!(from_plain, from_hash);
    }

    #[test]
    fn test_backend_capabilities_rules() {
        let client = DEFAULT_CAPABILITIES | CLIENT_DEPRECATE_EOF;

        let caps = backend_capabilities(client, false, false, false);
        // DEPRECATE_EOF never passes through
        assert_eq!(caps & CLIENT_DEPRECATE_EOF, 0);
        assert_ne!(caps & CLIENT_MULTI_STATEMENTS, 0);
        assert_ne!(caps & CLIENT_PLUGIN_AUTH, 0);
        assert_eq!(caps & CLIENT_CONNECT_WITH_DB, 0);
        assert_eq!(caps & CLIENT_SSL, 0);

        let caps = backend_capabilities(client, true, true, true);
        assert_ne!(caps & CLIENT_SSL, 0);
        assert_ne!(caps & CLIENT_SESSION_TRACK, 0);
        assert_ne!(caps & CLIENT_CONNECT_WITH_DB, 0);
    }
}

#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # tls-peek
//!
//! Extracts the SNI server name from a buffered TLS ClientHello without
//! terminating TLS. The caller accumulates bytes from the socket and retries
//! [`server_name`] until it stops returning [`PeekError::Incomplete`];
//! whatever was buffered is then replayed verbatim to the real TLS endpoint.

use thiserror::Error;

/// TLS record type for handshake messages
const RECORD_HANDSHAKE: u8 = 0x16;
/// handshake message type for ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
/// extension id for server_name (RFC 6066)
const EXT_SERVER_NAME: u16 = 0x0000;
/// server_name entry type for a DNS hostname
const NAME_TYPE_HOST: u8 = 0x00;

/// Why a buffer could not be resolved to a server name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeekError {
    /// not enough bytes yet; read more and retry
    #[error("client hello incomplete")]
    Incomplete,
    /// the first bytes are not a TLS handshake record
    #[error("not a TLS client hello")]
    NotTls,
    /// a structurally valid hello without a usable server_name extension
    #[error("no server name in client hello")]
    NoServerName,
    /// lengths that contradict each other; treat the peer as hostile
    #[error("malformed client hello")]
    Malformed,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PeekError> {
        if self.buf.len() - self.pos < n {
            return Err(PeekError::Malformed);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, PeekError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PeekError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn skip(&mut self, n: usize) -> Result<(), PeekError> {
        self.take(n).map(|_| ())
    }
}

/// Parse the SNI server name out of `buf`, which holds the first bytes read
/// from a TCP connection.
///
/// Returns [`PeekError::Incomplete`] while the record is still arriving; any
/// other error is final. The returned name is ASCII-lowercased.
pub fn server_name(buf: &[u8]) -> Result<String, PeekError> {
    if buf.is_empty() {
        return Err(PeekError::Incomplete);
    }
    if buf[0] != RECORD_HANDSHAKE {
        return Err(PeekError::NotTls);
    }
    if buf.len() < 5 {
        return Err(PeekError::Incomplete);
    }
    // legacy record version must be 3.x
    if buf[1] != 0x03 {
        return Err(PeekError::NotTls);
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return Err(PeekError::Incomplete);
    }

    let mut cur = Cursor::new(&buf[5..5 + record_len]);
    if cur.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(PeekError::NotTls);
    }
    let hs_len = {
        let b = cur.take(3)?;
        ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize
    };
    // a hello fragmented across records is rejected rather than reassembled
    if hs_len > record_len - 4 {
        return Err(PeekError::Malformed);
    }

    cur.skip(2)?; // client_version
    cur.skip(32)?; // random
    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len)?;
    let cipher_len = cur.u16()? as usize;
    cur.skip(cipher_len)?;
    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len)?;

    if cur.pos == cur.buf.len() {
        // legal pre-extensions hello, but useless to us
        return Err(PeekError::NoServerName);
    }
    let ext_total = cur.u16()? as usize;
    let ext_buf = cur.take(ext_total)?;
    let mut ext = Cursor::new(ext_buf);
    while ext.pos < ext.buf.len() {
        let ext_type = ext.u16()?;
        let ext_len = ext.u16()? as usize;
        let body = ext.take(ext_len)?;
        if ext_type != EXT_SERVER_NAME {
            continue;
        }
        let mut names = Cursor::new(body);
        let list_len = names.u16()? as usize;
        let list = names.take(list_len)?;
        let mut entry = Cursor::new(list);
        while entry.pos < entry.buf.len() {
            let name_type = entry.u8()?;
            let name_len = entry.u16()? as usize;
            let name = entry.take(name_len)?;
            if name_type != NAME_TYPE_HOST {
                continue;
            }
            let name = std::str::from_utf8(name).map_err(|_| PeekError::Malformed)?;
            if name.is_empty() {
                return Err(PeekError::NoServerName);
            }
            return Ok(name.to_ascii_lowercase());
        }
        return Err(PeekError::NoServerName);
    }
    Err(PeekError::NoServerName)
}

/// Build a minimal ClientHello carrying `server_name` as its SNI.
///
/// Only used to exercise the parser and the SNI front door in tests and
/// tooling; real clients send far richer hellos, which parse the same way.
pub fn encode_client_hello(server_name: &str) -> Vec<u8> {
    let name = server_name.as_bytes();

    // server_name extension
    let mut ext_body = Vec::new();
    ext_body.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes()); // list len
    ext_body.push(NAME_TYPE_HOST);
    ext_body.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext_body.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
    extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&ext_body);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // client_version TLS1.2
    body.extend_from_slice(&[0u8; 32]); // random
    body.push(0); // session id
    body.extend_from_slice(&2u16.to_be_bytes()); // one cipher suite
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1); // one compression method
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut hs = Vec::new();
    hs.push(HANDSHAKE_CLIENT_HELLO);
    hs.extend_from_slice(&[
        (body.len() >> 16) as u8,
        (body.len() >> 8) as u8,
        body.len() as u8,
    ]);
    hs.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(RECORD_HANDSHAKE);
    record.extend_from_slice(&[0x03, 0x01]); // legacy record version
    record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
    record.extend_from_slice(&hs);
    record
}

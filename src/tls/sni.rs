//! ClientHello SNI extraction.
//!
//! The interception pipeline peeks the client's first bytes before any TLS
//! engine is started: the SNI decides bypass and is forwarded on the origin
//! handshake.  Only the fields on the path to the server_name extension are
//! parsed; everything else is skipped by length.

use std::fmt;

//----------- SniPeek ----------------------------------------------------------

/// The result of peeking at a client's first bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SniPeek {
    /// Not enough bytes buffered yet to decide.
    Incomplete,

    /// The bytes are not a TLS ClientHello.
    NotTls,

    /// A ClientHello without a server_name extension.
    NoSni,

    /// The requested server name.
    Found(String),
}

impl fmt::Display for SniPeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Incomplete => f.write_str("incomplete"),
            Self::NotTls => f.write_str("not TLS"),
            Self::NoSni => f.write_str("no SNI"),
            Self::Found(name) => write!(f, "SNI '{name}'"),
        }
    }
}

/// A bounds-checked big-endian cursor.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.pos + n > self.buf.len() {
            return None;
        }
        self.pos += n;
        Some(())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }
}

/// Peek the SNI out of buffered client bytes.
pub fn peek_client_hello(buf: &[u8]) -> SniPeek {
    // TLS record header: type, legacy version, length.
    if buf.len() < 5 {
        return SniPeek::Incomplete;
    }
    if buf[0] != 22 {
        // Not a handshake record.
        return SniPeek::NotTls;
    }
    if buf[1] != 3 {
        return SniPeek::NotTls;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if buf.len() < 5 + record_len {
        return SniPeek::Incomplete;
    }

    let mut cur = Cursor::new(&buf[5..5 + record_len]);

    // Handshake header.
    match cur.u8() {
        Some(1) => {}
        Some(_) => return SniPeek::NotTls,
        None => return SniPeek::Incomplete,
    }
    let Some(_body_len) = cur.take(3) else {
        return SniPeek::Incomplete;
    };

    let mut parse = || -> Option<SniPeek> {
        // client_version + random.
        cur.skip(2 + 32)?;
        let session_id_len = cur.u8()? as usize;
        cur.skip(session_id_len)?;
        let cipher_suites_len = cur.u16()? as usize;
        cur.skip(cipher_suites_len)?;
        let compression_len = cur.u8()? as usize;
        cur.skip(compression_len)?;

        // A ClientHello without extensions has no SNI.
        let Some(extensions_len) = cur.u16() else {
            return Some(SniPeek::NoSni);
        };
        let mut remaining = extensions_len as usize;

        while remaining >= 4 {
            let ext_type = cur.u16()?;
            let ext_len = cur.u16()? as usize;
            remaining = remaining.checked_sub(4 + ext_len)?;

            if ext_type != 0 {
                cur.skip(ext_len)?;
                continue;
            }

            // server_name extension: list length, then entries of
            // (name_type, length, bytes); type 0 is host_name.
            let mut ext = Cursor::new(cur.take(ext_len)?);
            let _list_len = ext.u16()?;
            while let Some(name_type) = ext.u8() {
                let name_len = ext.u16()? as usize;
                let name = ext.take(name_len)?;
                if name_type == 0 {
                    let name = std::str::from_utf8(name).ok()?;
                    return Some(SniPeek::Found(name.to_ascii_lowercase()));
                }
            }
            return Some(SniPeek::NoSni);
        }

        Some(SniPeek::NoSni)
    };

    // The record is complete, so running out of bytes inside it means a
    // malformed hello rather than a short read.
    parse().unwrap_or(SniPeek::NotTls)
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a minimal ClientHello with the given extensions blob.
    fn client_hello(extensions: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&[0, 2, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[1, 0]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(extensions);

        let mut hs = vec![1];
        hs.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut record = vec![22, 3, 1];
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);
        record
    }

    fn sni_extension(host: &str) -> Vec<u8> {
        let name = host.as_bytes();
        let mut entry = vec![0]; // host_name
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name);

        let mut list = (entry.len() as u16).to_be_bytes().to_vec();
        list.extend_from_slice(&entry);

        let mut ext = vec![0, 0]; // server_name
        ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
        ext.extend_from_slice(&list);
        ext
    }

    #[test]
    fn finds_the_server_name() {
        let hello = client_hello(&sni_extension("Example.COM"));
        assert_eq!(
            peek_client_hello(&hello),
            SniPeek::Found("example.com".into())
        );
    }

    #[test]
    fn skips_unrelated_extensions() {
        let mut exts = vec![0xff, 0x01, 0, 1, 0]; // renegotiation_info
        exts.extend_from_slice(&sni_extension("bank.example"));
        let hello = client_hello(&exts);
        assert_eq!(
            peek_client_hello(&hello),
            SniPeek::Found("bank.example".into())
        );
    }

    #[test]
    fn hello_without_sni() {
        let hello = client_hello(&[]);
        assert_eq!(peek_client_hello(&hello), SniPeek::NoSni);
    }

    #[test]
    fn short_reads_are_incomplete() {
        let hello = client_hello(&sni_extension("example.com"));
        for cut in [0, 3, 5, hello.len() - 1] {
            assert_eq!(peek_client_hello(&hello[..cut]), SniPeek::Incomplete);
        }
    }

    #[test]
    fn plaintext_is_not_tls() {
        assert_eq!(peek_client_hello(b"GET / HTTP/1.1\r\n"), SniPeek::NotTls);
    }
}

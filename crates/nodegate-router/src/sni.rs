//! TLS ClientHello server name extraction

use thiserror::Error;
use tracing::trace;

/// TLS record header: content type, version, length
const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// SNI extraction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SniError {
    #[error("Not a TLS ClientHello")]
    NotClientHello,

    #[error("Truncated ClientHello")]
    Truncated,

    #[error("ClientHello carries no server name")]
    Missing,

    #[error("Invalid SNI hostname: {0}")]
    InvalidSni(String),
}

/// Bytes needed to hold the whole first TLS record, once its header is known
///
/// Returns `None` while fewer than five bytes are buffered.
pub fn client_hello_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < RECORD_HEADER_LEN {
        return None;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    Some(RECORD_HEADER_LEN + record_len)
}

/// Extract the server name from a TLS ClientHello record
pub fn extract_sni(client_hello: &[u8]) -> Result<String, SniError> {
    let mut reader = Reader::new(client_hello);

    if reader.u8()? != CONTENT_TYPE_HANDSHAKE {
        return Err(SniError::NotClientHello);
    }
    reader.skip(2)?; // record version
    let record_len = reader.u16()? as usize;
    let mut record = Reader::new(reader.take(record_len)?);

    if record.u8()? != HANDSHAKE_CLIENT_HELLO {
        return Err(SniError::NotClientHello);
    }
    record.skip(3)?; // handshake length
    record.skip(2)?; // client version
    record.skip(32)?; // random

    let session_id_len = record.u8()? as usize;
    record.skip(session_id_len)?;

    let cipher_suites_len = record.u16()? as usize;
    record.skip(cipher_suites_len)?;

    let compression_methods_len = record.u8()? as usize;
    record.skip(compression_methods_len)?;

    if record.is_empty() {
        return Err(SniError::Missing);
    }

    let extensions_len = record.u16()? as usize;
    let mut extensions = Reader::new(record.take(extensions_len)?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let data = extensions.take(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(data);
        }
    }

    Err(SniError::Missing)
}

fn parse_server_name(data: &[u8]) -> Result<String, SniError> {
    let mut ext = Reader::new(data);
    let list_len = ext.u16()? as usize;
    let mut list = Reader::new(ext.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;

        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let hostname = std::str::from_utf8(name)
            .map_err(|_| SniError::InvalidSni("Invalid UTF-8 in hostname".to_string()))?;

        if hostname.is_empty() {
            return Err(SniError::InvalidSni("Empty hostname".to_string()));
        }

        trace!("Extracted SNI hostname: {}", hostname);
        return Ok(hostname.to_ascii_lowercase());
    }

    Err(SniError::Missing)
}

/// Bounds-checked big-endian cursor
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SniError> {
        if n > self.buf.len() {
            return Err(SniError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), SniError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SniError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SniError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn with_len16(out: &mut Vec<u8>, body: &[u8]) {
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
    }

    /// Minimal ClientHello record, with an SNI extension when `server_name` is set
    pub(crate) fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();

        // unrelated extension first: supported_versions
        extensions.extend_from_slice(&[0x00, 0x2b, 0x00, 0x03, 0x02, 0x03, 0x04]);

        if let Some(name) = server_name {
            let mut entry = vec![NAME_TYPE_HOST_NAME];
            with_len16(&mut entry, name.as_bytes());
            let mut list = Vec::new();
            with_len16(&mut list, &entry);

            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            with_len16(&mut extensions, &list);
        }

        let mut hello = vec![0x03, 0x03];
        hello.extend_from_slice(&[0x11; 32]);
        hello.push(0x00); // session id
        with_len16(&mut hello, &[0x13, 0x01, 0x00, 0x2f]);
        hello.extend_from_slice(&[0x01, 0x00]); // null compression
        with_len16(&mut hello, &extensions);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&hello);

        let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        with_len16(&mut record, &handshake);
        record
    }

    #[test]
    fn test_sni_extraction() {
        let record = client_hello(Some("Node.Example.test"));
        assert_eq!(extract_sni(&record).unwrap(), "node.example.test");
        assert_eq!(client_hello_len(&record), Some(record.len()));
    }

    #[test]
    fn test_sni_extraction_not_found() {
        let record = client_hello(None);
        assert_eq!(extract_sni(&record), Err(SniError::Missing));
    }

    #[test]
    fn test_sni_extraction_malformed() {
        assert_eq!(extract_sni(&[0x16, 0x03, 0x01]), Err(SniError::Truncated));
        assert_eq!(client_hello_len(&[0x16, 0x03]), None);
    }

    #[test]
    fn test_not_tls() {
        assert_eq!(
            extract_sni(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            Err(SniError::NotClientHello)
        );
    }

    #[test]
    fn test_truncated_record_never_panics() {
        let record = client_hello(Some("node.example.test"));
        for len in 0..record.len() {
            assert!(extract_sni(&record[..len]).is_err());
        }
    }

    #[test]
    fn test_lying_extension_length() {
        let mut record = client_hello(Some("node.example.test"));
        // server_name extension length, just ahead of the name list
        let pos = record.len() - ("node.example.test".len() + 3 + 2 + 2);
        record[pos] = 0xff;
        record[pos + 1] = 0xff;
        assert_eq!(extract_sni(&record), Err(SniError::Truncated));
    }
}

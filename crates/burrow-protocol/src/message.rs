use std::fmt;

use bytes::Bytes;

use crate::error::ProtocolError;

/// Double line terminator separating the textual header from the body.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// The seven wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PutChunk,
    Stored,
    GetChunk,
    Chunk,
    Delete,
    Removed,
    Debug,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PutChunk => "PUTCHUNK",
            MessageKind::Stored => "STORED",
            MessageKind::GetChunk => "GETCHUNK",
            MessageKind::Chunk => "CHUNK",
            MessageKind::Delete => "DELETE",
            MessageKind::Removed => "REMOVED",
            MessageKind::Debug => "DEBUG",
        }
    }

    fn from_token(token: &str) -> Result<Self, ProtocolError> {
        match token {
            "PUTCHUNK" => Ok(MessageKind::PutChunk),
            "STORED" => Ok(MessageKind::Stored),
            "GETCHUNK" => Ok(MessageKind::GetChunk),
            "CHUNK" => Ok(MessageKind::Chunk),
            "DELETE" => Ok(MessageKind::Delete),
            "REMOVED" => Ok(MessageKind::Removed),
            "DEBUG" => Ok(MessageKind::Debug),
            other => Err(ProtocolError::UnknownKind(other.to_string())),
        }
    }

    /// DELETE addresses a whole file and carries no chunk number.
    pub fn has_chunk_no(&self) -> bool {
        !matches!(self, MessageKind::Delete)
    }

    /// Only the kinds that ask for storage declare a replication degree.
    pub fn has_degree(&self) -> bool {
        matches!(self, MessageKind::PutChunk | MessageKind::Debug)
    }

    /// Kinds whose datagram carries a binary body after the header.
    pub fn has_body(&self) -> bool {
        matches!(
            self,
            MessageKind::PutChunk | MessageKind::Chunk | MessageKind::Debug
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded (or to-be-encoded) protocol message.
///
/// `chunk_no` is meaningless for DELETE and `replication_degree` for
/// everything but PUTCHUNK/DEBUG; both encode as absent tokens for those
/// kinds and decode as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: String,
    pub kind: MessageKind,
    pub sender: u64,
    pub file_id: String,
    pub chunk_no: u32,
    pub replication_degree: u8,
    pub body: Bytes,
}

/// Canonical map key for a chunk: `fileId_chunkNo`.
pub fn chunk_id(file_id: &str, chunk_no: u32) -> String {
    format!("{}_{}", file_id, chunk_no)
}

impl Message {
    pub fn putchunk(
        version: &str,
        sender: u64,
        file_id: &str,
        chunk_no: u32,
        replication_degree: u8,
        body: Bytes,
    ) -> Self {
        Self {
            version: version.to_string(),
            kind: MessageKind::PutChunk,
            sender,
            file_id: file_id.to_string(),
            chunk_no,
            replication_degree,
            body,
        }
    }

    pub fn stored(version: &str, sender: u64, file_id: &str, chunk_no: u32) -> Self {
        Self::bare(version, MessageKind::Stored, sender, file_id, chunk_no)
    }

    pub fn getchunk(version: &str, sender: u64, file_id: &str, chunk_no: u32) -> Self {
        Self::bare(version, MessageKind::GetChunk, sender, file_id, chunk_no)
    }

    pub fn chunk(version: &str, sender: u64, file_id: &str, chunk_no: u32, body: Bytes) -> Self {
        Self {
            body,
            ..Self::bare(version, MessageKind::Chunk, sender, file_id, chunk_no)
        }
    }

    pub fn delete(version: &str, sender: u64, file_id: &str) -> Self {
        Self::bare(version, MessageKind::Delete, sender, file_id, 0)
    }

    pub fn removed(version: &str, sender: u64, file_id: &str, chunk_no: u32) -> Self {
        Self::bare(version, MessageKind::Removed, sender, file_id, chunk_no)
    }

    pub fn debug(
        version: &str,
        sender: u64,
        file_id: &str,
        chunk_no: u32,
        replication_degree: u8,
        body: Bytes,
    ) -> Self {
        Self {
            replication_degree,
            body,
            ..Self::bare(version, MessageKind::Debug, sender, file_id, chunk_no)
        }
    }

    fn bare(version: &str, kind: MessageKind, sender: u64, file_id: &str, chunk_no: u32) -> Self {
        Self {
            version: version.to_string(),
            kind,
            sender,
            file_id: file_id.to_string(),
            chunk_no,
            replication_degree: 0,
            body: Bytes::new(),
        }
    }

    /// Canonical map key for this message's chunk.
    pub fn chunk_id(&self) -> String {
        chunk_id(&self.file_id, self.chunk_no)
    }

    /// Encode into a single datagram: header tokens, terminator, body.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = format!(
            "{} {} {} {}",
            self.version, self.kind, self.sender, self.file_id
        );
        if self.kind.has_chunk_no() {
            header.push_str(&format!(" {}", self.chunk_no));
        }
        if self.kind.has_degree() {
            header.push_str(&format!(" {}", self.replication_degree));
        }

        let mut out = Vec::with_capacity(header.len() + HEADER_TERMINATOR.len() + self.body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(HEADER_TERMINATOR);
        if self.kind.has_body() {
            out.extend_from_slice(&self.body);
        }
        out
    }

    /// Decode a received datagram. The body is whatever follows the
    /// terminator; an empty body is valid.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let split = datagram
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
            .ok_or(ProtocolError::MissingTerminator)?;

        let header = std::str::from_utf8(&datagram[..split])
            .map_err(|_| ProtocolError::HeaderNotUtf8)?;
        let mut tokens = header.split_whitespace();

        let version = tokens
            .next()
            .ok_or(ProtocolError::MissingField("version"))?
            .to_string();
        let kind = MessageKind::from_token(
            tokens.next().ok_or(ProtocolError::MissingField("kind"))?,
        )?;
        let sender = parse_field(tokens.next(), "sender")?;
        let file_id = tokens
            .next()
            .ok_or(ProtocolError::MissingField("fileId"))?
            .to_string();

        let chunk_no = if kind.has_chunk_no() {
            parse_field(tokens.next(), "chunkNo")?
        } else {
            0
        };
        let replication_degree = if kind.has_degree() {
            parse_field(tokens.next(), "replicationDegree")?
        } else {
            0
        };

        let body = if kind.has_body() {
            Bytes::copy_from_slice(&datagram[split + HEADER_TERMINATOR.len()..])
        } else {
            Bytes::new()
        };

        Ok(Self {
            version,
            kind,
            sender,
            file_id,
            chunk_no,
            replication_degree,
            body,
        })
    }
}

fn parse_field<T: std::str::FromStr>(
    token: Option<&str>,
    field: &'static str,
) -> Result<T, ProtocolError> {
    let token = token.ok_or(ProtocolError::MissingField(field))?;
    token.parse().map_err(|_| ProtocolError::InvalidField {
        field,
        value: token.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        Message::decode(&msg.encode()).unwrap()
    }

    #[test]
    fn test_putchunk_roundtrip() {
        let body = Bytes::from_static(b"payload bytes");
        let msg = Message::putchunk("1.0", 7, "abc123", 4, 2, body.clone());
        let back = roundtrip(msg.clone());
        assert_eq!(back, msg);
        assert_eq!(back.body, body);
        assert_eq!(back.replication_degree, 2);
    }

    #[test]
    fn test_putchunk_empty_body_roundtrip() {
        // Empty bodies mark a file whose size is an exact multiple of the
        // chunk size; they must survive the trip.
        let msg = Message::putchunk("1.0", 7, "abc123", 3, 2, Bytes::new());
        let back = roundtrip(msg.clone());
        assert_eq!(back, msg);
        assert!(back.body.is_empty());
    }

    #[test]
    fn test_bodyless_kinds_roundtrip() {
        for msg in [
            Message::stored("1.0", 2, "f", 9),
            Message::getchunk("1.0", 2, "f", 9),
            Message::removed("1.0", 2, "f", 9),
        ] {
            let back = roundtrip(msg.clone());
            assert_eq!(back, msg);
            assert!(back.body.is_empty());
        }
    }

    #[test]
    fn test_delete_has_no_chunk_no() {
        let msg = Message::delete("1.0", 2, "deadbeef");
        let wire = msg.encode();
        assert!(wire.starts_with(b"1.0 DELETE 2 deadbeef\r\n\r\n"));
        let back = Message::decode(&wire).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.chunk_no, 0);
    }

    #[test]
    fn test_chunk_roundtrip() {
        let msg = Message::chunk("1.0", 5, "f1", 1, Bytes::from_static(b"x"));
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_debug_roundtrip() {
        let msg = Message::debug("1.0", 5, "f1", 1, 3, Bytes::from_static(b"note"));
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_missing_terminator() {
        assert_eq!(
            Message::decode(b"1.0 STORED 1 f 1"),
            Err(ProtocolError::MissingTerminator)
        );
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(
            Message::decode(b"1.0 FROB 1 f 1\r\n\r\n"),
            Err(ProtocolError::UnknownKind("FROB".into()))
        );
    }

    #[test]
    fn test_missing_tokens() {
        assert_eq!(
            Message::decode(b"1.0 STORED 1\r\n\r\n"),
            Err(ProtocolError::MissingField("fileId"))
        );
        assert_eq!(
            Message::decode(b"1.0 STORED 1 f\r\n\r\n"),
            Err(ProtocolError::MissingField("chunkNo"))
        );
    }

    #[test]
    fn test_bad_numeric_field() {
        assert!(matches!(
            Message::decode(b"1.0 STORED one f 1\r\n\r\n"),
            Err(ProtocolError::InvalidField { field: "sender", .. })
        ));
    }

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(chunk_id("abc", 12), "abc_12");
        let msg = Message::stored("1.0", 1, "abc", 12);
        assert_eq!(msg.chunk_id(), "abc_12");
    }
}

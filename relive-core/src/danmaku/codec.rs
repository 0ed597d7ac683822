//! Binary framing and key/value payload grammar of the Douyu STT chat
//! protocol. Frames carry an ASCII-safe payload of `key@=value/` tokens; the
//! 12-byte header is two little-endian u32 copies of the length followed by
//! the client opcode.

use std::collections::HashMap;

const OPCODE: u32 = 689;
const HEADER_SIZE: usize = 12;

pub fn escape(s: &str) -> String {
    s.replace('@', "@A").replace('/', "@S")
}

pub fn unescape(s: &str) -> String {
    s.replace("@S", "/").replace("@A", "@")
}

/// Serialize a flat map into an STT payload. Iteration order is not part of
/// the wire contract.
pub fn encode(fields: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in fields {
        out.push_str(key);
        out.push_str("@=");
        out.push_str(&escape(value));
        out.push('/');
    }
    out
}

/// Parse an STT payload into a map. Tokens without `@=` are ignored.
pub fn parse(payload: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for token in payload.split('/') {
        if token.is_empty() {
            continue;
        }
        if let Some((key, value)) = token.split_once("@=") {
            fields.insert(key.to_string(), unescape(value));
        }
    }
    fields
}

/// Pack a single payload into a binary frame ready for the wire.
pub fn pack(payload: &str) -> Vec<u8> {
    let mut body = payload.as_bytes().to_vec();
    if !payload.ends_with('/') {
        body.push(b'/');
    }
    body.push(0);

    let length = (body.len() + 8) as u32;
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&length.to_le_bytes());
    frame.extend_from_slice(&OPCODE.to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Lazy parser over one or more concatenated frames in a single buffer.
///
/// Partial trailing frames are left unconsumed and can be retrieved with
/// [`PayloadIter::remaining`]. Frames whose declared length cannot cover the
/// header are counted as malformed and terminate iteration, since the stream
/// offers no way to resynchronize past them.
pub fn iter_payloads(data: &[u8]) -> PayloadIter<'_> {
    PayloadIter {
        data,
        offset: 0,
        malformed: 0,
    }
}

pub struct PayloadIter<'a> {
    data: &'a [u8],
    offset: usize,
    malformed: u64,
}

impl<'a> PayloadIter<'a> {
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }
}

impl Iterator for PayloadIter<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.offset + 4 > self.data.len() {
            return None;
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&self.data[self.offset..self.offset + 4]);
        let length = u32::from_le_bytes(length_bytes) as usize;
        let packet_size = length + 4;
        if packet_size <= HEADER_SIZE {
            self.malformed += 1;
            return None;
        }
        if self.offset + packet_size > self.data.len() {
            return None;
        }

        let body = &self.data[self.offset + HEADER_SIZE..self.offset + packet_size];
        let body = body.split(|b| *b == 0).next().unwrap_or(body);
        self.offset += packet_size;
        Some(String::from_utf8_lossy(body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips_arbitrary_text() {
        for s in ["", "plain", "a@b/c", "@S@A//", "弹幕@=测试/"] {
            assert_eq!(unescape(&escape(s)), s);
        }
    }

    #[test]
    fn parse_inverts_encode() {
        let mut fields = HashMap::new();
        fields.insert("type".to_string(), "chatmsg".to_string());
        fields.insert("txt".to_string(), "hello @ world / again".to_string());
        fields.insert("rid".to_string(), "251783".to_string());
        assert_eq!(parse(&encode(&fields)), fields);
    }

    #[test]
    fn parse_ignores_tokens_without_separator() {
        let fields = parse("type@=chatmsg/garbage/txt@=hi/");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["txt"], "hi");
    }

    #[test]
    fn pack_appends_terminator_and_header() {
        let frame = pack("type@=loginreq/roomid@=123/");
        let body_len = "type@=loginreq/roomid@=123/".len() + 1;
        let declared = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared, body_len + 8);
        assert_eq!(&frame[0..4], &frame[4..8]);
        assert_eq!(u32::from_le_bytes(frame[8..12].try_into().unwrap()), 689);
        assert_eq!(*frame.last().unwrap(), 0);
    }

    #[test]
    fn pack_adds_missing_trailing_slash() {
        let with = pack("type@=mrkl/");
        let without = pack("type@=mrkl");
        assert_eq!(with, without);
    }

    #[test]
    fn iter_payloads_walks_concatenated_frames() {
        let mut buffer = pack("type@=chatmsg/txt@=one/");
        buffer.extend_from_slice(&pack("type@=chatmsg/txt@=two/"));

        let payloads: Vec<String> = iter_payloads(&buffer).collect();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].contains("one"));
        assert!(payloads[1].contains("two"));
    }

    #[test]
    fn iter_payloads_leaves_partial_frames_unconsumed() {
        let mut buffer = pack("type@=chatmsg/txt@=whole/");
        let partial = pack("type@=chatmsg/txt@=cut/");
        buffer.extend_from_slice(&partial[..partial.len() - 5]);

        let mut iter = iter_payloads(&buffer);
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        assert_eq!(iter.malformed(), 0);
        assert!(!iter.remaining().is_empty());
    }

    #[test]
    fn iter_payloads_counts_undersized_frames() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&2u32.to_le_bytes());
        buffer.extend_from_slice(&[0u8; 8]);

        let mut iter = iter_payloads(&buffer);
        assert!(iter.next().is_none());
        assert_eq!(iter.malformed(), 1);
    }
}

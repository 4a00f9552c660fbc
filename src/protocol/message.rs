use std::fmt::{Debug, Formatter};

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::error::PrtError;
use crate::protocol::ACK;

/// The unit of exchange. See the [module docs](crate::protocol) for the wire format.
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    pub session: String,
    pub identifier: String,
    /// [Message::NO_ACK] for fire-and-forget messages
    pub sequence: i64,
    pub body: String,
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{session:{:?}, identifier:{:?}, sequence:{}, body:{} bytes}}", self.session, self.identifier, self.sequence, self.body.len())
    }
}

impl Message {
    /// sequence number marking a message that does not expect an acknowledgment
    pub const NO_ACK: i64 = -1;

    const SEPARATOR: u8 = b'\n';
    const NUM_PARTS: usize = 5;

    pub fn new(session: impl Into<String>, identifier: impl Into<String>, sequence: i64, body: impl Into<String>) -> Message {
        Message {
            session: session.into(),
            identifier: identifier.into(),
            sequence,
            body: body.into(),
        }
    }

    pub fn expects_ack(&self) -> bool {
        self.sequence != Self::NO_ACK
    }

    /// Creates the acknowledgment for this message, correlated by session and sequence number.
    ///  This is what handlers typically return.
    pub fn reply(&self, body: impl Into<String>) -> Message {
        Message::new(self.session.clone(), ACK, self.sequence, body)
    }

    pub fn encoded_len(&self) -> usize {
        self.session.len()
            + self.identifier.len()
            + self.sequence.to_string().len()
            + self.body.len()
            + Self::NUM_PARTS - 1
    }

    /// Encodes the message without any length check - see [Message::encode_checked] for that.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.session.as_bytes());
        buf.put_u8(Self::SEPARATOR);
        buf.put_slice(self.identifier.as_bytes());
        buf.put_u8(Self::SEPARATOR);
        buf.put_slice(self.sequence.to_string().as_bytes());
        buf.put_u8(Self::SEPARATOR);
        buf.put_u8(Self::SEPARATOR);
        buf.put_slice(self.body.as_bytes());
    }

    /// Encodes the message, failing with [PrtError::ContentOverflowed] if the result would not
    ///  fit into a single datagram of `max_transmit_size` bytes.
    pub fn encode_checked(&self, max_transmit_size: usize) -> Result<Bytes, PrtError> {
        let len = self.encoded_len();
        if len > max_transmit_size {
            return Err(PrtError::ContentOverflowed { len, max: max_transmit_size });
        }
        Ok(self.encode())
    }

    pub fn decode(raw: &[u8]) -> Result<Message, PrtError> {
        let raw = std::str::from_utf8(raw)
            .map_err(|e| PrtError::Decode(format!("frame is not valid UTF-8: {}", e)))?;

        let parts: Vec<&str> = raw.splitn(Self::NUM_PARTS, Self::SEPARATOR as char).collect();
        if parts.len() < Self::NUM_PARTS {
            return Err(PrtError::Decode(format!("expected {} fields, found {}", Self::NUM_PARTS, parts.len())));
        }

        let sequence = parts[2].parse::<i64>()
            .map_err(|_| PrtError::Decode(format!("invalid sequence number {:?}", parts[2])))?;

        Ok(Message {
            session: parts[0].to_string(),
            identifier: parts[1].to_string(),
            sequence,
            body: parts[4].to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::hello(Message::new("", "prt-hello", 0, ""), b"\nprt-hello\n0\n\n".as_slice())]
    #[case::fire_and_forget(Message::new("S1", "log", -1, "abc"), b"S1\nlog\n-1\n\nabc".as_slice())]
    #[case::multiline_body(Message::new("S1", "echo", 17, "a\nb\n\nc"), b"S1\necho\n17\n\na\nb\n\nc".as_slice())]
    #[case::hello_reply(Message::new("aB3dE6gH", "prt-hello", 0, "120000000"), b"aB3dE6gH\nprt-hello\n0\n\n120000000".as_slice())]
    fn test_encode(#[case] msg: Message, #[case] expected: &[u8]) {
        let encoded = msg.encode();
        assert_eq!(encoded.as_ref(), expected);
        assert_eq!(msg.encoded_len(), expected.len());
    }

    #[rstest]
    #[case::minimal(b"\nx\n0\n\n".as_slice(), Message::new("", "x", 0, ""))]
    #[case::body_with_newlines(b"S\nid\n3\n\nline 1\nline 2\n".as_slice(), Message::new("S", "id", 3, "line 1\nline 2\n"))]
    #[case::extension_field_ignored(b"S\nid\n3\nreserved\nbody".as_slice(), Message::new("S", "id", 3, "body"))]
    #[case::explicit_plus(b"S\nid\n+4\n\n".as_slice(), Message::new("S", "id", 4, ""))]
    #[case::no_ack(b"S\nid\n-1\n\nxyz".as_slice(), Message::new("S", "id", -1, "xyz"))]
    fn test_decode(#[case] raw: &[u8], #[case] expected: Message) {
        assert_eq!(Message::decode(raw).unwrap(), expected);
    }

    #[rstest]
    #[case::empty(b"".as_slice())]
    #[case::four_parts(b"S\nid\n3\n".as_slice())]
    #[case::no_separators(b"hello world".as_slice())]
    #[case::non_numeric_sequence(b"S\nid\nabc\n\nbody".as_slice())]
    #[case::empty_sequence(b"S\nid\n\n\nbody".as_slice())]
    #[case::sequence_overflow(b"S\nid\n99999999999999999999\n\n".as_slice())]
    #[case::invalid_utf8(b"S\nid\n3\n\n\xff\xfe".as_slice())]
    fn test_decode_malformed(#[case] raw: &[u8]) {
        assert!(matches!(Message::decode(raw), Err(PrtError::Decode(_))));
    }

    #[test]
    fn test_round_trip() {
        let msg = Message::new("tok12345", "some-handler", i64::MAX, "{\"a\": 1}\n\nend");
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[rstest]
    #[case::fits_exactly(10, 10, true)]
    #[case::below(10, 11, true)]
    #[case::one_over(11, 10, false)]
    fn test_encode_checked(#[case] encoded_len: usize, #[case] max: usize, #[case] expected_ok: bool) {
        // "\nx\n0\n\n" has 6 bytes, the remainder goes into the body
        let msg = Message::new("", "x", 0, "b".repeat(encoded_len - 6));
        assert_eq!(msg.encoded_len(), encoded_len);

        match msg.encode_checked(max) {
            Ok(buf) => {
                assert!(expected_ok);
                assert_eq!(buf.len(), encoded_len);
            }
            Err(PrtError::ContentOverflowed { len, max: actual_max }) => {
                assert!(!expected_ok);
                assert_eq!(len, encoded_len);
                assert_eq!(actual_max, max);
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[test]
    fn test_reply() {
        let request = Message::new("S1", "echo", 42, "hi");
        assert_eq!(request.reply("ho"), Message::new("S1", "prt-ack", 42, "ho"));
    }
}

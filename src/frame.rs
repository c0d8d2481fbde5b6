// Base Framing Protocol
// from https://www.rfc-editor.org/rfc/rfc6455#section-5.2
//
//      0                   1                   2                   3
//      0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//     +-+-+-+-+-------+-+-------------+-------------------------------+
//     |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//     |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//     |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//     | |1|2|3|       |K|             |                               |
//     +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//     |     Extended payload length continued, if payload len == 127  |
//     + - - - - - - - - - - - - - - - +-------------------------------+
//     |                               |Masking-key, if MASK set to 1  |
//     +-------------------------------+-------------------------------+
//     | Masking-key (continued)       |          Payload Data         |
//     +-------------------------------- - - - - - - - - - - - - - - - +
//     :                     Payload Data continued ...                :
//     +---------------------------------------------------------------+

use byteorder::BigEndian;
use byteorder::ByteOrder;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::Result;
use crate::error::WscaptureError;

static FIN_BIT: u8 = 0x80;
static MASK_BIT: u8 = 0x80;
static LEN_16_MARKER: u8 = 126;
static LEN_64_MARKER: u8 = 127;
/// Key every synthetic client frame is masked with.
pub const DEFAULT_MASK_KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl Opcode {
    pub fn to_u8(self) -> u8 {
        self as u8
    }
    pub fn from_u8(value: u8) -> Option<Self> {
        Opcode::iter().find(|&o| o as u8 == value)
    }
    /// Text for valid UTF-8, binary for everything else.
    pub fn for_payload(payload: &[u8]) -> Opcode {
        match std::str::from_utf8(payload) {
            Ok(_) => Opcode::Text,
            Err(_) => Opcode::Binary,
        }
    }
}

/// Size of the header `encode` produces for a payload of `len` bytes.
pub fn header_len(len: usize, masked: bool) -> usize {
    let len_field = if len < LEN_16_MARKER as usize {
        1
    } else if len < 65536 {
        3
    } else {
        9
    };
    let mask_len = if masked { 4 } else { 0 };
    1 + len_field + mask_len
}

/// Frame `payload` as a single unfragmented message.
///
/// Client to server frames are masked with `mask_key`, server to client frames are sent
/// in the clear. Any byte sequence, the empty one included, can be framed.
/// ```rust
/// use wscapture::frame;
///
/// let frame = frame::encode(b"hi", false, [0x12, 0x34, 0x56, 0x78]);
/// assert_eq!(frame, vec![0x81, 0x02, b'h', b'i']);
/// ```
pub fn encode(payload: &[u8], from_client: bool, mask_key: [u8; 4]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(header_len(len, from_client) + len);
    frame.push(FIN_BIT | Opcode::for_payload(payload).to_u8());

    let mask = if from_client { MASK_BIT } else { 0 };
    if len < LEN_16_MARKER as usize {
        frame.push(mask | len as u8);
    } else if len < 65536 {
        frame.push(mask | LEN_16_MARKER);
        let mut ext = [0u8; 2];
        BigEndian::write_u16(&mut ext, len as u16);
        frame.extend_from_slice(&ext);
    } else {
        frame.push(mask | LEN_64_MARKER);
        let mut ext = [0u8; 8];
        BigEndian::write_u64(&mut ext, len as u64);
        frame.extend_from_slice(&ext);
    }

    if from_client {
        frame.extend_from_slice(&mask_key);
        frame.extend(apply_mask(payload, mask_key));
    } else {
        frame.extend_from_slice(payload);
    }
    frame
}

/// XOR `data` with the key, cycling every four bytes. Applying it twice is a no-op.
pub fn apply_mask(data: &[u8], mask_key: [u8; 4]) -> impl Iterator<Item = u8> + '_ {
    data.iter()
        .enumerate()
        .map(move |(i, b)| b ^ mask_key[i % 4])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked application payload.
    pub payload: Vec<u8>,
    /// Bytes of input the frame occupied.
    pub consumed: usize,
}

fn malformed(reason: &str) -> WscaptureError {
    WscaptureError::MalformedFrame {
        reason: reason.to_string(),
    }
}

fn take<'a>(input: &'a [u8], at: usize, n: usize, what: &str) -> Result<&'a [u8]> {
    let end = match at.checked_add(n) {
        Some(end) => end,
        None => return Err(malformed("length overflows input")),
    };
    match input.get(at..end) {
        Some(s) => Ok(s),
        None => Err(malformed(&format!("truncated {what}"))),
    }
}

/// Parse one frame from the front of `input`, undoing the mask if present.
pub fn decode(input: &[u8]) -> Result<DecodedFrame> {
    let head = take(input, 0, 2, "header")?;
    let fin = head[0] & FIN_BIT != 0;
    let opcode = match Opcode::from_u8(head[0] & 0x0f) {
        Some(o) => o,
        None => return Err(malformed(&format!("reserved opcode {:#x}", head[0] & 0x0f))),
    };
    let masked = head[1] & MASK_BIT != 0;
    let mut pos = 2;
    let len = match head[1] & 0x7f {
        126 => {
            let ext = take(input, pos, 2, "16-bit length")?;
            pos += 2;
            BigEndian::read_u16(ext) as u64
        }
        127 => {
            let ext = take(input, pos, 8, "64-bit length")?;
            pos += 8;
            BigEndian::read_u64(ext)
        }
        l => l as u64,
    };
    let len = usize::try_from(len).map_err(|_| malformed("length overflows usize"))?;

    let mask_key = if masked {
        let key = take(input, pos, 4, "mask key")?;
        pos += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    let data = take(input, pos, len, "payload")?;
    // data lies inside input, so this cannot overflow
    let consumed = pos + data.len();
    let payload = match mask_key {
        Some(key) => apply_mask(data, key).collect(),
        None => data.to_vec(),
    };
    Ok(DecodedFrame {
        fin,
        opcode,
        mask_key,
        payload,
        consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = DEFAULT_MASK_KEY;

    #[test]
    fn text_and_binary_opcodes() {
        assert_eq!(encode(b"hello", false, KEY)[0], 0x81);
        assert_eq!(encode(&[0xff, 0xfe, 0x00], false, KEY)[0], 0x82);
        // empty is valid utf-8
        assert_eq!(encode(&[], false, KEY)[0], 0x81);
    }
    #[test]
    fn server_frame_is_unmasked() {
        let frame = encode(b"world", false, KEY);
        assert_eq!(frame, [&[0x81u8, 0x05][..], &b"world"[..]].concat());
    }
    #[test]
    fn client_frame_is_masked() {
        let frame = encode(b"hello", true, KEY);
        assert_eq!(frame[1], 0x80 | 5);
        assert_eq!(&frame[2..6], &KEY);
        let expected: Vec<u8> = b"hello"
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ KEY[i % 4])
            .collect();
        assert_eq!(&frame[6..], expected.as_slice());
        assert_ne!(&frame[6..], b"hello");
    }
    #[test]
    fn unmasking_restores_payload() {
        let payloads: Vec<Vec<u8>> = vec![
            vec![],
            b"a".to_vec(),
            b"json {\"id\":1}".to_vec(),
            (0..=255u8).collect(),
            vec![0xc3; 70_000],
        ];
        for p in payloads {
            let frame = encode(&p, true, KEY);
            let start = header_len(p.len(), true);
            let key: [u8; 4] = frame[start - 4..start].try_into().unwrap();
            let restored: Vec<u8> = apply_mask(&frame[start..], key).collect();
            assert_eq!(restored, p);
        }
    }
    #[test]
    fn length_tier_boundaries() {
        let f = encode(&vec![b'x'; 125], false, KEY);
        assert_eq!(f[1], 125);
        assert_eq!(f.len(), 2 + 125);

        let f = encode(&vec![b'x'; 126], false, KEY);
        assert_eq!(f[1], 126);
        assert_eq!(&f[2..4], &[0x00, 0x7e]);
        assert_eq!(f.len(), 4 + 126);

        let f = encode(&vec![b'x'; 65535], false, KEY);
        assert_eq!(f[1], 126);
        assert_eq!(&f[2..4], &[0xff, 0xff]);
        assert_eq!(f.len(), 4 + 65535);

        let f = encode(&vec![b'x'; 65536], false, KEY);
        assert_eq!(f[1], 127);
        assert_eq!(&f[2..10], &[0, 0, 0, 0, 0, 0x01, 0x00, 0x00]);
        assert_eq!(f.len(), 10 + 65536);

        let f = encode(&vec![b'x'; 65536], true, KEY);
        assert_eq!(f[1], 0x80 | 127);
        assert_eq!(&f[10..14], &KEY);
    }
    #[test]
    fn decode_inverts_encode() {
        for (payload, from_client) in [
            (b"hello".to_vec(), true),
            (b"world".to_vec(), false),
            (vec![0x80u8; 300], true),
            (vec![0u8; 65536], false),
        ] {
            let frame = encode(&payload, from_client, KEY);
            let decoded = decode(&frame).unwrap();
            assert!(decoded.fin);
            assert_eq!(decoded.payload, payload);
            assert_eq!(decoded.consumed, frame.len());
            assert_eq!(decoded.mask_key.is_some(), from_client);
        }
    }
    #[test]
    fn decode_rejects_truncation() {
        let frame = encode(&vec![b'y'; 200], true, KEY);
        for cut in [1, 3, 6, frame.len() - 1] {
            assert!(matches!(
                decode(&frame[..cut]),
                Err(WscaptureError::MalformedFrame { .. })
            ));
        }
    }
    #[test]
    fn decode_rejects_huge_length_field() {
        let mut input = vec![0x82, 0x7f];
        input.extend_from_slice(&[0xff; 8]);
        assert!(matches!(
            decode(&input),
            Err(WscaptureError::MalformedFrame { .. })
        ));
        // masked variant reads a key first, then overflows on the payload
        let mut input = vec![0x82, 0xff];
        input.extend_from_slice(&[0xff; 8]);
        input.extend_from_slice(&KEY);
        assert!(matches!(
            decode(&input),
            Err(WscaptureError::MalformedFrame { .. })
        ));
    }
    #[test]
    fn decode_rejects_reserved_opcode() {
        assert!(decode(&[0x83, 0x00]).is_err());
    }
}

//! OSC 1.0 message codec for the X32 wire dialect.
//!
//! The console speaks plain OSC 1.0 over UDP datagrams:
//!
//! ```text
//! address      ASCII, null-terminated, padded to a multiple of 4
//! type tags    ",ifsb..." null-terminated, padded to a multiple of 4
//! arguments    each 4-byte aligned, big-endian
//! ```
//!
//! Incoming traffic may also carry `#bundle` packets; the decoder flattens
//! them into their contained messages. Padding is validated strictly: any
//! nonzero byte past a terminator is a malformed packet.

use bytes::{BufMut, Bytes, BytesMut};

/// Marker string opening an OSC bundle packet.
pub const BUNDLE_MARKER: &[u8] = b"#bundle";

/// One typed OSC argument.
///
/// The X32 uses exactly these four types; anything else in a type-tag
/// string is rejected with [`OscError::UnsupportedType`].
#[derive(Debug, Clone, PartialEq)]
pub enum OscValue {
    /// 32-bit signed integer (`i`)
    Int(i32),
    /// 32-bit IEEE float (`f`)
    Float(f32),
    /// Null-terminated ASCII string (`s`)
    Str(String),
    /// Length-prefixed byte blob (`b`)
    Blob(Vec<u8>),
}

impl OscValue {
    /// The OSC type-tag character for this value.
    pub fn type_tag(&self) -> char {
        match self {
            OscValue::Int(_) => 'i',
            OscValue::Float(_) => 'f',
            OscValue::Str(_) => 's',
            OscValue::Blob(_) => 'b',
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            OscValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            OscValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OscValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A decoded OSC message: slash address plus typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    pub address: String,
    pub args: Vec<OscValue>,
}

impl OscMessage {
    pub fn new(address: impl Into<String>, args: Vec<OscValue>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// A query: an address with no arguments.
    pub fn query(address: impl Into<String>) -> Self {
        Self::new(address, Vec::new())
    }
}

/// Errors during datagram decoding.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum OscError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("unsupported type tag {0:?}")]
    UnsupportedType(char),
}

/// Encode a message into one datagram payload.
pub fn encode(address: &str, args: &[OscValue]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + address.len());
    put_padded_str(&mut buf, address);

    let mut tags = String::with_capacity(args.len() + 1);
    tags.push(',');
    for arg in args {
        tags.push(arg.type_tag());
    }
    put_padded_str(&mut buf, &tags);

    for arg in args {
        match arg {
            OscValue::Int(v) => buf.put_i32(*v),
            OscValue::Float(v) => buf.put_f32(*v),
            OscValue::Str(s) => put_padded_str(&mut buf, s),
            OscValue::Blob(b) => {
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
                while buf.len() % 4 != 0 {
                    buf.put_u8(0);
                }
            }
        }
    }

    buf.freeze()
}

/// Encode a prepared [`OscMessage`].
pub fn encode_message(msg: &OscMessage) -> Bytes {
    encode(&msg.address, &msg.args)
}

/// Decode one datagram payload as a single OSC message.
///
/// Rejects bundles; use [`decode_packet`] for traffic that may contain them.
pub fn decode(bytes: &[u8]) -> Result<OscMessage, OscError> {
    let mut cursor = Cursor::new(bytes);
    let msg = decode_inner(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(OscError::Malformed("trailing bytes after arguments"));
    }
    Ok(msg)
}

/// Decode one datagram payload, flattening any `#bundle` nesting into the
/// contained messages in order.
pub fn decode_packet(bytes: &[u8]) -> Result<Vec<OscMessage>, OscError> {
    let mut out = Vec::new();
    decode_packet_into(bytes, &mut out, 0)?;
    Ok(out)
}

const MAX_BUNDLE_DEPTH: usize = 8;

fn decode_packet_into(
    bytes: &[u8],
    out: &mut Vec<OscMessage>,
    depth: usize,
) -> Result<(), OscError> {
    if depth > MAX_BUNDLE_DEPTH {
        return Err(OscError::Malformed("bundle nesting too deep"));
    }
    if bytes.starts_with(BUNDLE_MARKER) {
        let mut cursor = Cursor::new(bytes);
        let marker = cursor.read_padded_str()?;
        if marker.as_bytes() != BUNDLE_MARKER {
            return Err(OscError::Malformed("bad bundle marker"));
        }
        // 8-byte NTP timetag; the console's bundles are immediate, so the
        // value is ignored.
        cursor.read_exact(8)?;
        while !cursor.is_empty() {
            let len = cursor.read_u32()? as usize;
            let element = cursor.read_exact(len)?;
            decode_packet_into(element, out, depth + 1)?;
        }
        Ok(())
    } else {
        out.push(decode(bytes)?);
        Ok(())
    }
}

fn decode_inner(cursor: &mut Cursor<'_>) -> Result<OscMessage, OscError> {
    let address = cursor.read_padded_str()?;
    if !address.starts_with('/') {
        return Err(OscError::Malformed("address must start with '/'"));
    }

    // Legacy messages may omit the type-tag string entirely.
    if cursor.is_empty() {
        return Ok(OscMessage::new(address, Vec::new()));
    }

    let tags = cursor.read_padded_str()?;
    let mut tag_chars = tags.chars();
    if tag_chars.next() != Some(',') {
        return Err(OscError::Malformed("type tags must start with ','"));
    }

    let mut args = Vec::new();
    for tag in tag_chars {
        let value = match tag {
            'i' => OscValue::Int(cursor.read_i32()?),
            'f' => OscValue::Float(f32::from_bits(cursor.read_u32()?)),
            's' => OscValue::Str(cursor.read_padded_str()?),
            'b' => {
                let len = cursor.read_u32()? as usize;
                let data = cursor.read_exact(len)?.to_vec();
                cursor.read_zero_padding(len)?;
                OscValue::Blob(data)
            }
            other => return Err(OscError::UnsupportedType(other)),
        };
        args.push(value);
    }

    Ok(OscMessage::new(address, args))
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
}

/// Byte reader enforcing the 4-byte alignment and zero-padding rules.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8], OscError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(OscError::Malformed("length overflow"))?;
        if end > self.bytes.len() {
            return Err(OscError::Malformed("length prefix overruns buffer"));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, OscError> {
        let b = self.read_exact(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, OscError> {
        Ok(self.read_u32()? as i32)
    }

    /// Read a null-terminated string and its alignment padding, verifying
    /// that every pad byte is zero.
    fn read_padded_str(&mut self) -> Result<String, OscError> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(OscError::Malformed("string missing terminator"))?;
        let text = std::str::from_utf8(&rest[..nul])
            .map_err(|_| OscError::Malformed("string is not valid UTF-8"))?
            .to_string();
        let consumed = (nul + 4) & !3;
        if self.pos + consumed > self.bytes.len() {
            return Err(OscError::Malformed("string padding overruns buffer"));
        }
        if rest[nul..consumed].iter().any(|&b| b != 0) {
            return Err(OscError::Malformed("nonzero byte in string padding"));
        }
        self.pos += consumed;
        Ok(text)
    }

    /// Consume the zero padding that aligns a blob of `len` bytes.
    fn read_zero_padding(&mut self, len: usize) -> Result<(), OscError> {
        let pad = (4 - len % 4) % 4;
        let bytes = self.read_exact(pad)?;
        if bytes.iter().any(|&b| b != 0) {
            return Err(OscError::Malformed("nonzero byte in blob padding"));
        }
        Ok(())
    }
}

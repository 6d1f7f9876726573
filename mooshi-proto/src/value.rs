//! Node types and the byte <-> value codec
//!
//! Numbers travel little-endian at their fixed width. `STR` and `BIN` carry
//! a `u16` little-endian length prefix. `PLAIN`, `LINK` and `CHOOSER` carry a
//! single selector byte.

use std::fmt;

use crate::ProtoError;
use crate::frame::MAX_VARIABLE_PAYLOAD;

/// Declared type of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Plain,
    Link,
    Chooser,
    U8,
    U16,
    U32,
    S8,
    S16,
    S32,
    Str,
    Bin,
    Float,
}

impl NodeType {
    pub const ALL: [NodeType; 12] = [
        NodeType::Plain,
        NodeType::Link,
        NodeType::Chooser,
        NodeType::U8,
        NodeType::U16,
        NodeType::U32,
        NodeType::S8,
        NodeType::S16,
        NodeType::S32,
        NodeType::Str,
        NodeType::Bin,
        NodeType::Float,
    ];

    /// Type code used in the serialized tree description
    pub fn code(self) -> u8 {
        match self {
            NodeType::Plain => 0,
            NodeType::Link => 1,
            NodeType::Chooser => 2,
            NodeType::U8 => 3,
            NodeType::U16 => 4,
            NodeType::U32 => 5,
            NodeType::S8 => 6,
            NodeType::S16 => 7,
            NodeType::S32 => 8,
            NodeType::Str => 9,
            NodeType::Bin => 10,
            NodeType::Float => 11,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtoError> {
        NodeType::ALL
            .get(code as usize)
            .copied()
            .ok_or(ProtoError::UnknownNodeType(code))
    }

    /// Fixed wire width, `None` for the length-prefixed types
    pub fn wire_width(self) -> Option<usize> {
        match self {
            NodeType::Plain | NodeType::Link | NodeType::Chooser => Some(1),
            NodeType::U8 | NodeType::S8 => Some(1),
            NodeType::U16 | NodeType::S16 => Some(2),
            NodeType::U32 | NodeType::S32 | NodeType::Float => Some(4),
            NodeType::Str | NodeType::Bin => None,
        }
    }

    /// Whether nodes of this type get an op-code and can be read or written
    pub fn is_addressable(self) -> bool {
        !matches!(self, NodeType::Plain | NodeType::Link)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Plain => "PLAIN",
            NodeType::Link => "LINK",
            NodeType::Chooser => "CHOOSER",
            NodeType::U8 => "U8",
            NodeType::U16 => "U16",
            NodeType::U32 => "U32",
            NodeType::S8 => "S8",
            NodeType::S16 => "S16",
            NodeType::S32 => "S32",
            NodeType::Str => "STR",
            NodeType::Bin => "BIN",
            NodeType::Float => "FLOAT",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded node value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Selector byte of a `PLAIN`, `LINK` or `CHOOSER` node
    Choice(u8),
    U8(u8),
    U16(u16),
    U32(u32),
    S8(i8),
    S16(i16),
    S32(i32),
    Str(String),
    Bin(Vec<u8>),
    Float(f32),
}

impl Value {
    /// Zero value of a type, what the meter reports before anything is set
    pub fn zero(node_type: NodeType) -> Self {
        match node_type {
            NodeType::Plain | NodeType::Link | NodeType::Chooser => Value::Choice(0),
            NodeType::U8 => Value::U8(0),
            NodeType::U16 => Value::U16(0),
            NodeType::U32 => Value::U32(0),
            NodeType::S8 => Value::S8(0),
            NodeType::S16 => Value::S16(0),
            NodeType::S32 => Value::S32(0),
            NodeType::Str => Value::Str(String::new()),
            NodeType::Bin => Value::Bin(Vec::new()),
            NodeType::Float => Value::Float(0.0),
        }
    }

    /// Whether this value can be stored in a node of `node_type`
    pub fn fits(&self, node_type: NodeType) -> bool {
        matches!(
            (self, node_type),
            (Value::Choice(_), NodeType::Plain | NodeType::Link | NodeType::Chooser)
                | (Value::U8(_), NodeType::U8)
                | (Value::U16(_), NodeType::U16)
                | (Value::U32(_), NodeType::U32)
                | (Value::S8(_), NodeType::S8)
                | (Value::S16(_), NodeType::S16)
                | (Value::S32(_), NodeType::S32)
                | (Value::Str(_), NodeType::Str)
                | (Value::Bin(_), NodeType::Bin)
                | (Value::Float(_), NodeType::Float)
        )
    }

    /// Parse a user-supplied literal for a node of `node_type`
    ///
    /// `BIN` literals are hex; everything else uses Rust's number syntax.
    pub fn parse(node_type: NodeType, literal: &str) -> Result<Self, ProtoError> {
        let invalid = || ProtoError::InvalidLiteral {
            node_type,
            literal: literal.to_string(),
        };
        let text = literal.trim();

        Ok(match node_type {
            NodeType::Plain | NodeType::Link | NodeType::Chooser => {
                Value::Choice(text.parse().map_err(|_| invalid())?)
            }
            NodeType::U8 => Value::U8(text.parse().map_err(|_| invalid())?),
            NodeType::U16 => Value::U16(text.parse().map_err(|_| invalid())?),
            NodeType::U32 => Value::U32(text.parse().map_err(|_| invalid())?),
            NodeType::S8 => Value::S8(text.parse().map_err(|_| invalid())?),
            NodeType::S16 => Value::S16(text.parse().map_err(|_| invalid())?),
            NodeType::S32 => Value::S32(text.parse().map_err(|_| invalid())?),
            NodeType::Float => Value::Float(text.parse().map_err(|_| invalid())?),
            NodeType::Str => Value::Str(literal.to_string()),
            NodeType::Bin => Value::Bin(
                data_encoding::HEXLOWER_PERMISSIVE
                    .decode(text.as_bytes())
                    .map_err(|_| invalid())?,
            ),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Choice(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::S8(v) => write!(f, "{v}"),
            Value::S16(v) => write!(f, "{v}"),
            Value::S32(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bin(b) => f.write_str(&data_encoding::HEXLOWER.encode(b)),
        }
    }
}

fn take<const N: usize>(node_type: NodeType, bytes: &[u8]) -> Result<[u8; N], ProtoError> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtoError::MalformedValue {
            node_type,
            needed: N,
            available: bytes.len(),
        })
}

/// Decode one value of `node_type` from the front of `bytes`
///
/// Returns the value and the number of bytes consumed.
pub fn decode(node_type: NodeType, bytes: &[u8]) -> Result<(Value, usize), ProtoError> {
    let value = match node_type {
        NodeType::Plain | NodeType::Link | NodeType::Chooser => {
            Value::Choice(take::<1>(node_type, bytes)?[0])
        }
        NodeType::U8 => Value::U8(take::<1>(node_type, bytes)?[0]),
        NodeType::S8 => Value::S8(i8::from_le_bytes(take(node_type, bytes)?)),
        NodeType::U16 => Value::U16(u16::from_le_bytes(take(node_type, bytes)?)),
        NodeType::S16 => Value::S16(i16::from_le_bytes(take(node_type, bytes)?)),
        NodeType::U32 => Value::U32(u32::from_le_bytes(take(node_type, bytes)?)),
        NodeType::S32 => Value::S32(i32::from_le_bytes(take(node_type, bytes)?)),
        NodeType::Float => Value::Float(f32::from_le_bytes(take(node_type, bytes)?)),
        NodeType::Str | NodeType::Bin => {
            let len = u16::from_le_bytes(take(node_type, bytes)?) as usize;
            let body = bytes.get(2..2 + len).ok_or(ProtoError::MalformedValue {
                node_type,
                needed: 2 + len,
                available: bytes.len(),
            })?;
            let value = if node_type == NodeType::Str {
                Value::Str(String::from_utf8_lossy(body).into_owned())
            } else {
                Value::Bin(body.to_vec())
            };
            return Ok((value, 2 + len));
        }
    };

    // fixed-width types consumed exactly their width
    let width = node_type.wire_width().unwrap_or(0);
    Ok((value, width))
}

/// Encode `value` for a node of `node_type`
pub fn encode(node_type: NodeType, value: &Value) -> Result<Vec<u8>, ProtoError> {
    if !value.fits(node_type) {
        return Err(ProtoError::TypeMismatch {
            node_type,
            value: value.to_string(),
        });
    }

    Ok(match value {
        Value::Choice(v) | Value::U8(v) => vec![*v],
        Value::S8(v) => v.to_le_bytes().to_vec(),
        Value::U16(v) => v.to_le_bytes().to_vec(),
        Value::S16(v) => v.to_le_bytes().to_vec(),
        Value::U32(v) => v.to_le_bytes().to_vec(),
        Value::S32(v) => v.to_le_bytes().to_vec(),
        Value::Float(v) => v.to_le_bytes().to_vec(),
        Value::Str(s) => length_prefixed(s.as_bytes())?,
        Value::Bin(b) => length_prefixed(b)?,
    })
}

/// Bodies the receive side would flush as corrupt are refused up front
fn length_prefixed(body: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if body.len() > MAX_VARIABLE_PAYLOAD {
        return Err(ProtoError::Oversized(body.len()));
    }
    let len = u16::try_from(body.len()).map_err(|_| ProtoError::Oversized(body.len()))?;
    let mut buf = Vec::with_capacity(2 + body.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(node_type: NodeType, value: Value) {
        let bytes = encode(node_type, &value).unwrap();
        if let Some(width) = node_type.wire_width() {
            assert_eq!(bytes.len(), width, "{node_type} width");
        }
        let (decoded, consumed) = decode(node_type, &bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn fixed_width_extremes() {
        for v in [0, 1, 0x7F, u8::MAX] {
            round_trip(NodeType::U8, Value::U8(v));
        }
        for v in [0, 0x1234, u16::MAX] {
            round_trip(NodeType::U16, Value::U16(v));
        }
        for v in [0, 0xDEAD_BEEF, u32::MAX] {
            round_trip(NodeType::U32, Value::U32(v));
        }
        for v in [i8::MIN, -1, 0, i8::MAX] {
            round_trip(NodeType::S8, Value::S8(v));
        }
        for v in [i16::MIN, -300, 0, i16::MAX] {
            round_trip(NodeType::S16, Value::S16(v));
        }
        for v in [i32::MIN, -70_000, 0, i32::MAX] {
            round_trip(NodeType::S32, Value::S32(v));
        }
        for v in [0.0f32, -1.5, 3.25, f32::MAX, f32::MIN_POSITIVE] {
            round_trip(NodeType::Float, Value::Float(v));
        }
        round_trip(NodeType::Chooser, Value::Choice(3));
    }

    #[test]
    fn little_endian_on_the_wire() {
        assert_eq!(encode(NodeType::U16, &Value::U16(0x1234)).unwrap(), vec![0x34, 0x12]);
        assert_eq!(
            decode(NodeType::S16, &[0xFE, 0xFF]).unwrap(),
            (Value::S16(-2), 2)
        );
        assert_eq!(
            decode(NodeType::U32, &[0x78, 0x56, 0x34, 0x12, 0xAA]).unwrap(),
            (Value::U32(0x1234_5678), 4)
        );
    }

    #[test]
    fn variable_length_payloads() {
        round_trip(NodeType::Str, Value::Str(String::new()));
        round_trip(NodeType::Str, Value::Str("Mooshimeter V.1".into()));
        round_trip(NodeType::Bin, Value::Bin(vec![]));
        round_trip(NodeType::Bin, Value::Bin((0u8..20).collect()));

        let bytes = encode(NodeType::Str, &Value::Str("ab".into())).unwrap();
        assert_eq!(bytes, vec![2, 0, b'a', b'b']);
    }

    #[test]
    fn bodies_above_frame_limit_are_refused() {
        let at_limit = Value::Bin(vec![0; MAX_VARIABLE_PAYLOAD]);
        assert_eq!(encode(NodeType::Bin, &at_limit).unwrap().len(), MAX_VARIABLE_PAYLOAD + 2);

        let over = Value::Bin(vec![0; MAX_VARIABLE_PAYLOAD + 1]);
        assert!(matches!(
            encode(NodeType::Bin, &over),
            Err(ProtoError::Oversized(n)) if n == MAX_VARIABLE_PAYLOAD + 1
        ));
        let long = Value::Str("x".repeat(MAX_VARIABLE_PAYLOAD + 1));
        assert!(matches!(encode(NodeType::Str, &long), Err(ProtoError::Oversized(_))));
    }

    #[test]
    fn undersized_buffers_are_malformed() {
        assert!(matches!(
            decode(NodeType::U32, &[1, 2, 3]),
            Err(ProtoError::MalformedValue { needed: 4, available: 3, .. })
        ));
        assert!(matches!(
            decode(NodeType::U8, &[]),
            Err(ProtoError::MalformedValue { .. })
        ));
        // length prefix claims more than is present
        assert!(matches!(
            decode(NodeType::Bin, &[5, 0, 1, 2]),
            Err(ProtoError::MalformedValue { needed: 7, available: 4, .. })
        ));
        assert!(matches!(
            decode(NodeType::Str, &[1]),
            Err(ProtoError::MalformedValue { .. })
        ));
    }

    #[test]
    fn encode_rejects_wrong_variant() {
        assert!(matches!(
            encode(NodeType::U16, &Value::U8(1)),
            Err(ProtoError::TypeMismatch { node_type: NodeType::U16, .. })
        ));
        assert!(encode(NodeType::Chooser, &Value::Choice(1)).is_ok());
    }

    #[test]
    fn type_codes() {
        for t in NodeType::ALL {
            assert_eq!(NodeType::from_code(t.code()).unwrap(), t);
        }
        assert_eq!(NodeType::from_code(12), Err(ProtoError::UnknownNodeType(12)));
    }

    #[test]
    fn parse_literals() {
        assert_eq!(Value::parse(NodeType::U16, "4660").unwrap(), Value::U16(0x1234));
        assert_eq!(Value::parse(NodeType::S8, "-5").unwrap(), Value::S8(-5));
        assert_eq!(Value::parse(NodeType::Float, "2.5").unwrap(), Value::Float(2.5));
        assert_eq!(Value::parse(NodeType::Bin, "dead").unwrap(), Value::Bin(vec![0xDE, 0xAD]));
        assert!(Value::parse(NodeType::U8, "300").is_err());
    }

    #[test]
    fn display() {
        assert_eq!(Value::Str("x".into()).to_string(), "\"x\"");
        assert_eq!(Value::Bin(vec![0x0A, 0xFF]).to_string(), "0aff");
        assert_eq!(Value::S32(-7).to_string(), "-7");
    }
}

use crate::value::NodeType;

/// Errors produced while encoding or decoding protocol data
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ProtoError {
    #[error("malformed {node_type} value: need {needed} bytes, have {available}")]
    MalformedValue {
        node_type: NodeType,
        needed: usize,
        available: usize,
    },

    #[error("value {value} does not fit a {node_type} node")]
    TypeMismatch { node_type: NodeType, value: String },

    #[error("unknown node type code {0}")]
    UnknownNodeType(u8),

    #[error("invalid tree description: {0}")]
    InvalidDescription(String),

    #[error("checksum mismatch: frame carries {received:#010x}, computed {computed:#010x}")]
    Checksum { received: u32, computed: u32 },

    #[error("no node registered for op-code {0:#04x}")]
    UnknownOpCode(u8),

    #[error("payload of {0} bytes exceeds the frame limit")]
    Oversized(usize),

    #[error("cannot parse {literal:?} as {node_type}")]
    InvalidLiteral { node_type: NodeType, literal: String },
}

//! Serialized tree description
//!
//! The meter describes its own tree as a zlib stream of pre-order node
//! records:
//!
//! ```text
//! [type u8][name_len u8][name bytes][child_count u8][child records ...]
//! ```
//!
//! The first record is the root. Op-codes are not on the wire; both sides
//! assign them in pre-order, starting at 0, to every node that is neither
//! `PLAIN` nor `LINK`.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::opcode::MAX_OP_CODES;
use crate::tree::{NodeId, Tree};
use crate::{NodeType, ProtoError};

/// Upper bound on an inflated description
const MAX_INFLATED: u64 = 64 * 1024;

/// Op-codes of the bootstrap `ADMIN` nodes
pub const OP_ADMIN_CRC32: u8 = 0;
pub const OP_ADMIN_TREE: u8 = 1;
pub const OP_ADMIN_DIAGNOSTIC: u8 = 2;

pub const PATH_ADMIN: &str = "ADMIN";
pub const PATH_ADMIN_CRC32: &str = "ADMIN:CRC32";
pub const PATH_ADMIN_TREE: &str = "ADMIN:TREE";

/// Owned description of a node and its subtree
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub node_type: NodeType,
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(name: &str, node_type: NodeType) -> Self {
        Self {
            name: name.to_string(),
            node_type,
            children: Vec::new(),
        }
    }

    pub fn plain(name: &str, children: Vec<NodeSpec>) -> Self {
        Self::new(name, NodeType::Plain).with_children(children)
    }

    /// A `CHOOSER` whose options are `PLAIN` children
    pub fn chooser(name: &str, options: &[&str]) -> Self {
        Self::new(name, NodeType::Chooser)
            .with_children(options.iter().map(|o| NodeSpec::new(o, NodeType::Plain)).collect())
    }

    pub fn with_children(mut self, children: Vec<NodeSpec>) -> Self {
        self.children = children;
        self
    }
}

/// The `ADMIN` subtree every meter starts with
pub fn admin_spec() -> NodeSpec {
    NodeSpec::plain(
        PATH_ADMIN,
        vec![
            NodeSpec::new("CRC32", NodeType::U32),
            NodeSpec::new("TREE", NodeType::Bin),
            NodeSpec::new("DIAGNOSTIC", NodeType::Bin),
        ],
    )
}

/// Tree known before discovery: just enough to fetch the real one
pub fn bootstrap_tree<H>() -> Tree<H> {
    let root = NodeSpec::plain("", vec![admin_spec()]);
    // the admin spec is static and always valid
    build_tree(&root).unwrap_or_default()
}

/// Build a tree from a spec, assigning op-codes in pre-order
pub fn build_tree<H>(root: &NodeSpec) -> Result<Tree<H>, ProtoError> {
    let mut tree = Tree::new();
    let mut next_op = 0usize;
    let root_id = tree.root();
    for child in &root.children {
        add_subtree(&mut tree, root_id, child, &mut next_op)?;
    }
    Ok(tree)
}

fn add_subtree<H>(
    tree: &mut Tree<H>,
    parent: NodeId,
    spec: &NodeSpec,
    next_op: &mut usize,
) -> Result<(), ProtoError> {
    let op_code = if spec.node_type.is_addressable() {
        if *next_op >= MAX_OP_CODES {
            return Err(ProtoError::InvalidDescription(format!(
                "more than {MAX_OP_CODES} addressable nodes"
            )));
        }
        let op = *next_op as u8;
        *next_op += 1;
        Some(op)
    } else {
        None
    };

    let id = tree.add_child(parent, &spec.name, spec.node_type, op_code)?;
    for child in &spec.children {
        add_subtree(tree, id, child, next_op)?;
    }
    Ok(())
}

/// Serialize a spec into uncompressed node records
pub fn serialize(root: &NodeSpec) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::new();
    serialize_into(&mut out, root)?;
    Ok(out)
}

fn serialize_into(out: &mut Vec<u8>, spec: &NodeSpec) -> Result<(), ProtoError> {
    let name_len = u8::try_from(spec.name.len())
        .map_err(|_| ProtoError::InvalidDescription(format!("name {:?} too long", spec.name)))?;
    let child_count = u8::try_from(spec.children.len()).map_err(|_| {
        ProtoError::InvalidDescription(format!("{:?} has too many children", spec.name))
    })?;

    out.push(spec.node_type.code());
    out.push(name_len);
    out.extend_from_slice(spec.name.as_bytes());
    out.push(child_count);
    for child in &spec.children {
        serialize_into(out, child)?;
    }
    Ok(())
}

/// Decode uncompressed node records back into a spec
pub fn deserialize(bytes: &[u8]) -> Result<NodeSpec, ProtoError> {
    let mut pos = 0;
    let spec = read_record(bytes, &mut pos, 0)?;
    if pos != bytes.len() {
        return Err(ProtoError::InvalidDescription(format!(
            "{} trailing bytes after root record",
            bytes.len() - pos
        )));
    }
    Ok(spec)
}

fn read_record(bytes: &[u8], pos: &mut usize, depth: usize) -> Result<NodeSpec, ProtoError> {
    if depth > 64 {
        return Err(ProtoError::InvalidDescription("tree nested too deep".into()));
    }

    let truncated = || ProtoError::InvalidDescription(format!("record truncated at byte {pos}"));

    let node_type = NodeType::from_code(*bytes.get(*pos).ok_or_else(truncated)?)?;
    let name_len = *bytes.get(*pos + 1).ok_or_else(truncated)? as usize;
    let name_start = *pos + 2;
    let name = bytes
        .get(name_start..name_start + name_len)
        .ok_or_else(truncated)?;
    let child_count = *bytes.get(name_start + name_len).ok_or_else(truncated)?;
    *pos = name_start + name_len + 1;

    let mut spec = NodeSpec::new(&String::from_utf8_lossy(name), node_type);
    for _ in 0..child_count {
        spec.children.push(read_record(bytes, pos, depth + 1)?);
    }
    Ok(spec)
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| ProtoError::InvalidDescription(format!("zlib: {e}")))
}

pub fn inflate(bytes: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .take(MAX_INFLATED)
        .read_to_end(&mut out)
        .map_err(|e| ProtoError::InvalidDescription(format!("zlib: {e}")))?;
    Ok(out)
}

/// Compressed description of a spec, as the meter sends it
pub fn encode(root: &NodeSpec) -> Result<Vec<u8>, ProtoError> {
    compress(&serialize(root)?)
}

/// Parse a compressed description received from the meter
pub fn parse<H>(compressed: &[u8]) -> Result<Tree<H>, ProtoError> {
    let spec = deserialize(&inflate(compressed)?)?;
    build_tree(&spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter() -> NodeSpec {
        NodeSpec::plain(
            "",
            vec![
                admin_spec(),
                NodeSpec::new("PCB_VERSION", NodeType::U8),
                NodeSpec::plain(
                    "CH1",
                    vec![
                        NodeSpec::chooser("MAPPING", &["CURRENT", "TEMP"]),
                        NodeSpec::new("SHARED", NodeType::Link),
                        NodeSpec::new("VALUE", NodeType::Float),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn bootstrap_op_codes() {
        let tree: Tree<()> = bootstrap_tree();
        let op = |path| tree.node(tree.find(path, None).unwrap()).op_code();
        assert_eq!(op(PATH_ADMIN_CRC32), Some(OP_ADMIN_CRC32));
        assert_eq!(op(PATH_ADMIN_TREE), Some(OP_ADMIN_TREE));
        assert_eq!(op("ADMIN:DIAGNOSTIC"), Some(OP_ADMIN_DIAGNOSTIC));
        assert_eq!(op(PATH_ADMIN), None);
    }

    #[test]
    fn parse_assigns_pre_order_op_codes() {
        let compressed = encode(&meter()).unwrap();
        let tree: Tree<()> = parse(&compressed).unwrap();

        let op = |path| tree.node(tree.find(path, None).unwrap()).op_code();
        assert_eq!(op(PATH_ADMIN_TREE), Some(1));
        assert_eq!(op("PCB_VERSION"), Some(3));
        assert_eq!(op("CH1"), None);
        assert_eq!(op("CH1:MAPPING"), Some(4));
        // chooser options are PLAIN, the link is not addressable
        assert_eq!(op("CH1:MAPPING:TEMP"), None);
        assert_eq!(op("CH1:SHARED"), None);
        assert_eq!(op("CH1:VALUE"), Some(5));
    }

    #[test]
    fn serialized_layout() {
        let spec = NodeSpec::plain("", vec![NodeSpec::new("AB", NodeType::U16)]);
        assert_eq!(serialize(&spec).unwrap(), vec![0, 0, 1, 4, 2, b'A', b'B', 0]);
        assert_eq!(deserialize(&serialize(&spec).unwrap()).unwrap(), spec);
    }

    #[test]
    fn rejects_broken_descriptions() {
        assert!(parse::<()>(b"not zlib at all").is_err());

        let mut bytes = serialize(&meter()).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(deserialize(&bytes).is_err());

        // unknown type code in the first record
        assert!(matches!(
            deserialize(&[42, 0, 0]),
            Err(ProtoError::UnknownNodeType(42))
        ));

        let dup = NodeSpec::plain(
            "",
            vec![NodeSpec::new("A", NodeType::U8), NodeSpec::new("A", NodeType::U8)],
        );
        assert!(parse::<()>(&encode(&dup).unwrap()).is_err());
    }

    #[test]
    fn too_many_addressable_nodes() {
        let children = (0..130)
            .map(|i| NodeSpec::new(&format!("N{i}"), NodeType::U8))
            .collect::<Vec<_>>();
        let root = NodeSpec::plain("", children);
        assert!(build_tree::<()>(&root).is_err());
    }
}

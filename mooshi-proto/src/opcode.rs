//! Flat op-code -> node index

use crate::tree::{NodeId, Tree};
use crate::ProtoError;

/// Op-codes occupy the low 7 bits of the op byte
pub const MAX_OP_CODES: usize = 128;

/// Set on the op byte of a client -> meter frame that carries a new value
pub const WRITE_FLAG: u8 = 0x80;

/// Dense array indexed by op-code, built once from a tree
#[derive(Debug, Clone)]
pub struct OpCodeTable {
    slots: Vec<Option<NodeId>>,
}

impl OpCodeTable {
    pub fn empty() -> Self {
        Self { slots: vec![None; MAX_OP_CODES] }
    }

    pub fn build<H>(tree: &Tree<H>) -> Result<Self, ProtoError> {
        let mut table = Self::empty();
        for id in tree.walk(tree.root()) {
            let Some(op) = tree.node(id).op_code() else {
                continue;
            };
            let slot = table
                .slots
                .get_mut(op as usize)
                .ok_or_else(|| ProtoError::InvalidDescription(format!("op-code {op} out of range")))?;
            if slot.is_some() {
                return Err(ProtoError::InvalidDescription(format!("op-code {op} assigned twice")));
            }
            *slot = Some(id);
        }
        Ok(table)
    }

    pub fn get(&self, op_code: u8) -> Option<NodeId> {
        self.slots.get(op_code as usize).copied().flatten()
    }

    /// Number of registered op-codes
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OpCodeTable {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeType;

    #[test]
    fn build_and_lookup() {
        let mut tree: Tree<()> = Tree::new();
        let root = tree.root();
        let admin = tree.add_child(root, "ADMIN", NodeType::Plain, None).unwrap();
        let crc = tree.add_child(admin, "CRC32", NodeType::U32, Some(0)).unwrap();
        let name = tree.add_child(root, "NAME", NodeType::Str, Some(5)).unwrap();

        let table = OpCodeTable::build(&tree).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0), Some(crc));
        assert_eq!(table.get(5), Some(name));
        assert_eq!(table.get(1), None);
        assert_eq!(table.get(0xFF), None);
    }

    #[test]
    fn duplicate_op_code_rejected() {
        let mut tree: Tree<()> = Tree::new();
        let root = tree.root();
        tree.add_child(root, "A", NodeType::U8, Some(3)).unwrap();
        tree.add_child(root, "B", NodeType::U8, Some(3)).unwrap();
        assert!(OpCodeTable::build(&tree).is_err());
    }

    #[test]
    fn out_of_range_op_code_rejected() {
        let mut tree: Tree<()> = Tree::new();
        let root = tree.root();
        tree.add_child(root, "A", NodeType::U8, Some(200)).unwrap();
        assert!(OpCodeTable::build(&tree).is_err());
    }
}

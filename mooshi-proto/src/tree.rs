//! Node tree arena
//!
//! Nodes live in a flat `Vec` and refer to each other by [`NodeId`]. A parent
//! owns the ordered list of its children; the `parent` link is only a back
//! reference. Nodes are never removed one by one: the whole tree is torn
//! down with [`Tree::clear`].
//!
//! The tree is generic over the subscriber handler type so the protocol
//! crate stays free of any session type.

use std::fmt::Write as _;

use crate::{NodeType, ProtoError, Value};

/// Path segment separators: the meter uses `:`, `/` is accepted too
pub const PATH_SEPARATORS: [char; 2] = [':', '/'];

/// Handle to a node inside one [`Tree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Handle returned by [`Tree::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u32);

impl SubscriptionId {
    pub fn get(self) -> u32 {
        self.0
    }
}

/// A registered change handler
///
/// `handler` is empty while the handler itself is running.
struct Subscriber<H> {
    id: SubscriptionId,
    handler: Option<H>,
}

/// One addressable configuration or measurement point
pub struct Node<H> {
    name: String,
    op_code: Option<u8>,
    node_type: NodeType,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    value: Option<Value>,
    subscribers: Vec<Subscriber<H>>,
}

impl<H> Node<H> {
    fn new(name: &str, node_type: NodeType, op_code: Option<u8>, parent: Option<NodeId>) -> Self {
        Self {
            name: name.to_string(),
            op_code,
            node_type,
            children: Vec::new(),
            parent,
            value: None,
            subscribers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_code(&self) -> Option<u8> {
        self.op_code
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Distinguishes "never received" from a received zero
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl<H> std::fmt::Debug for Node<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("op_code", &self.op_code)
            .field("node_type", &self.node_type)
            .field("children", &self.children)
            .field("value", &self.value)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// Ordered multi-child tree rooted at an unnamed `PLAIN` node
pub struct Tree<H> {
    nodes: Vec<Node<H>>,
    next_subscription: u32,
}

impl<H> Default for Tree<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Tree<H> {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new("", NodeType::Plain, None, None)],
            next_subscription: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when only the root is present
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn get(&self, id: NodeId) -> Option<&Node<H>> {
        self.nodes.get(id.0)
    }

    /// Access a node by id
    ///
    /// Ids are only handed out by this tree, so an unknown id is a caller bug.
    pub fn node(&self, id: NodeId) -> &Node<H> {
        &self.nodes[id.0]
    }

    /// Append a child under `parent`; sibling names must be unique
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: &str,
        node_type: NodeType,
        op_code: Option<u8>,
    ) -> Result<NodeId, ProtoError> {
        if self.get(parent).is_none() {
            return Err(ProtoError::InvalidDescription(format!(
                "parent {} does not exist",
                parent.0
            )));
        }
        if self.child_named(parent, name).is_some() {
            return Err(ProtoError::InvalidDescription(format!(
                "duplicate child {name:?} under {:?}",
                self.path(parent)
            )));
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(name, node_type, op_code, Some(parent)));
        self.nodes[parent.0].children.push(id);
        Ok(id)
    }

    fn child_named(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].name == name)
    }

    /// Resolve a `:`/`/` separated path relative to `start` (root if `None`)
    pub fn find(&self, path: &str, start: Option<NodeId>) -> Option<NodeId> {
        let mut current = start.unwrap_or(self.root());
        self.get(current)?;

        for segment in path.split(PATH_SEPARATORS).filter(|s| !s.is_empty()) {
            current = self.child_named(current, segment)?;
        }
        Some(current)
    }

    /// Full path of a node, segments joined with `:`
    pub fn path(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = &self.nodes[node_id.0];
            if node.parent.is_some() {
                segments.push(node.name.as_str());
            }
            current = node.parent;
        }
        segments.reverse();
        segments.join(":")
    }

    /// Node ids in pre-order starting at (and including) `start`
    pub fn walk(&self, start: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        out
    }

    /// Replace a node's value wholesale
    pub fn set_value(&mut self, id: NodeId, value: Value) -> Result<(), ProtoError> {
        let node = &mut self.nodes[id.0];
        if !value.fits(node.node_type) {
            return Err(ProtoError::TypeMismatch {
                node_type: node.node_type,
                value: value.to_string(),
            });
        }
        node.value = Some(value);
        Ok(())
    }

    /// If `id` is an option under a `CHOOSER`, the chooser and the option index
    pub fn chooser_option(&self, id: NodeId) -> Option<(NodeId, u8)> {
        let parent = self.nodes[id.0].parent?;
        let chooser = &self.nodes[parent.0];
        if chooser.node_type != NodeType::Chooser {
            return None;
        }
        let index = chooser.children.iter().position(|c| *c == id)?;
        Some((parent, u8::try_from(index).ok()?))
    }

    pub fn subscribe(&mut self, id: NodeId, handler: H) -> SubscriptionId {
        let sub = SubscriptionId(self.next_subscription);
        self.next_subscription = self.next_subscription.wrapping_add(1);
        self.nodes[id.0].subscribers.push(Subscriber {
            id: sub,
            handler: Some(handler),
        });
        sub
    }

    /// Remove a subscriber; returns whether it was registered on this node
    ///
    /// A handler removed while it runs is dropped once it returns.
    pub fn unsubscribe(&mut self, id: NodeId, sub: SubscriptionId) -> bool {
        let subscribers = &mut self.nodes[id.0].subscribers;
        match subscribers.iter().position(|s| s.id == sub) {
            Some(pos) => {
                subscribers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Ids of the subscribers registered on a node, in registration order
    ///
    /// A notification round walks this list; subscribers added during the
    /// round are first called on the next one.
    pub fn subscription_ids(&self, id: NodeId) -> Vec<SubscriptionId> {
        self.nodes
            .get(id.0)
            .map(|node| node.subscribers.iter().map(|s| s.id).collect())
            .unwrap_or_default()
    }

    /// Borrow a handler out of its slot to call it
    ///
    /// `None` when the subscription is gone or the handler is already
    /// running further up the stack. Hand it back with
    /// [`Tree::return_handler`].
    pub fn take_handler(&mut self, id: NodeId, sub: SubscriptionId) -> Option<H> {
        self.nodes
            .get_mut(id.0)?
            .subscribers
            .iter_mut()
            .find(|s| s.id == sub)?
            .handler
            .take()
    }

    /// Put a handler back; it is dropped if it was unsubscribed meanwhile
    pub fn return_handler(&mut self, id: NodeId, sub: SubscriptionId, handler: H) {
        let slot = self
            .nodes
            .get_mut(id.0)
            .and_then(|node| node.subscribers.iter_mut().find(|s| s.id == sub));
        if let Some(slot) = slot {
            slot.handler.get_or_insert(handler);
        }
    }

    /// Render a node's value for humans
    pub fn value_as_string(&self, id: NodeId) -> String {
        let node = &self.nodes[id.0];
        match &node.value {
            None => "<unset>".to_string(),
            Some(Value::Choice(index)) if node.node_type == NodeType::Chooser => node
                .children
                .get(*index as usize)
                .map(|c| self.nodes[c.0].name.clone())
                .unwrap_or_else(|| index.to_string()),
            Some(value) => value.to_string(),
        }
    }

    /// Indented listing of the subtree at `start`
    pub fn dump(&self, start: NodeId) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, start, 0);
        out
    }

    fn dump_into(&self, out: &mut String, id: NodeId, indent: usize) {
        let node = &self.nodes[id.0];
        let name = if node.parent.is_none() { "(root)" } else { node.name.as_str() };
        let _ = write!(out, "{:indent$}{name} [{}]", "", node.node_type, indent = indent * 2);
        if let Some(op) = node.op_code {
            let _ = write!(out, " (op {op})");
        }
        if node.value.is_some() {
            let _ = write!(out, " = {}", self.value_as_string(id));
        }
        out.push('\n');
        for child in &node.children {
            self.dump_into(out, *child, indent + 1);
        }
    }

    /// Tear the tree down to a bare root, dropping every subscriber
    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        let root = &mut self.nodes[0];
        root.children.clear();
        root.value = None;
        root.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>;

    fn sample() -> Tree<u32> {
        let mut tree = Tree::new();
        let root = tree.root();
        let ch1 = tree.add_child(root, "CH1", NodeType::Plain, None).unwrap();
        let mapping = tree.add_child(ch1, "MAPPING", NodeType::Chooser, Some(0)).unwrap();
        tree.add_child(mapping, "CURRENT", NodeType::Plain, None).unwrap();
        tree.add_child(mapping, "TEMP", NodeType::Plain, None).unwrap();
        tree.add_child(ch1, "VALUE", NodeType::Float, Some(1)).unwrap();
        tree.add_child(root, "PCB_VERSION", NodeType::U8, Some(2)).unwrap();
        tree
    }

    #[test]
    fn find_paths() {
        let tree = sample();
        let value = tree.find("CH1:VALUE", None).unwrap();
        assert_eq!(tree.node(value).name(), "VALUE");
        assert_eq!(tree.find("CH1/VALUE", None), Some(value));

        let ch1 = tree.find("CH1", None).unwrap();
        assert_eq!(tree.find("MAPPING:TEMP", Some(ch1)), tree.find("CH1:MAPPING:TEMP", None));
        assert_eq!(tree.find("", Some(ch1)), Some(ch1));

        assert_eq!(tree.find("CH1:NOPE", None), None);
        assert_eq!(tree.find("CH2", None), None);
        assert_eq!(tree.path(value), "CH1:VALUE");
    }

    #[test]
    fn find_in_empty_tree() {
        let tree: Tree<()> = Tree::new();
        assert!(tree.is_empty());
        assert_eq!(tree.find("ANYTHING", None), None);
        assert_eq!(tree.find("", None), Some(tree.root()));
    }

    #[test]
    fn duplicate_sibling_rejected() {
        let mut tree = sample();
        let root = tree.root();
        assert!(tree.add_child(root, "CH1", NodeType::Plain, None).is_err());
    }

    #[test]
    fn children_keep_insertion_order() {
        let tree = sample();
        let names: Vec<_> = tree
            .walk(tree.root())
            .into_iter()
            .map(|id| tree.node(id).name().to_string())
            .collect();
        assert_eq!(names, ["", "CH1", "MAPPING", "CURRENT", "TEMP", "VALUE", "PCB_VERSION"]);
    }

    #[test]
    fn set_value_checks_type() {
        let mut tree = sample();
        let pcb = tree.find("PCB_VERSION", None).unwrap();
        assert!(!tree.node(pcb).has_value());
        assert!(tree.set_value(pcb, Value::U16(1)).is_err());
        assert!(!tree.node(pcb).has_value());
        tree.set_value(pcb, Value::U8(8)).unwrap();
        assert_eq!(tree.node(pcb).value(), Some(&Value::U8(8)));
    }

    #[test]
    fn chooser_options() {
        let tree = sample();
        let temp = tree.find("CH1:MAPPING:TEMP", None).unwrap();
        let mapping = tree.find("CH1:MAPPING", None).unwrap();
        assert_eq!(tree.chooser_option(temp), Some((mapping, 1)));
        let value = tree.find("CH1:VALUE", None).unwrap();
        assert_eq!(tree.chooser_option(value), None);
    }

    fn notify(tree: &mut Tree<Box<dyn FnMut(&Log)>>, node: NodeId, log: &Log) {
        for sub in tree.subscription_ids(node) {
            if let Some(mut handler) = tree.take_handler(node, sub) {
                handler(log);
                tree.return_handler(node, sub, handler);
            }
        }
    }

    #[test]
    fn subscribers_notified_in_order_and_survive_mutation() {
        let log: Log = Default::default();
        let mut tree: Tree<Box<dyn FnMut(&Log)>> = Tree::new();
        let root = tree.root();
        let node = tree.add_child(root, "X", NodeType::U16, Some(0)).unwrap();

        let first = tree.subscribe(node, Box::new(|l: &Log| l.borrow_mut().push("first")));
        let second = tree.subscribe(node, Box::new(|l: &Log| l.borrow_mut().push("second")));

        // the running handler is out of its slot but still registered
        let mut handler = tree.take_handler(node, first).unwrap();
        handler(&log);
        assert!(tree.take_handler(node, first).is_none());
        assert!(tree.unsubscribe(node, second));
        tree.subscribe(node, Box::new(|l: &Log| l.borrow_mut().push("third")));
        tree.return_handler(node, first, handler);

        assert_eq!(*log.borrow(), ["first"]);
        assert_eq!(tree.node(node).subscriber_count(), 2);

        log.borrow_mut().clear();
        notify(&mut tree, node, &log);
        assert_eq!(*log.borrow(), ["first", "third"]);
    }

    #[test]
    fn handler_unsubscribed_while_running_is_dropped() {
        let log: Log = Default::default();
        let mut tree: Tree<Box<dyn FnMut(&Log)>> = Tree::new();
        let root = tree.root();
        let node = tree.add_child(root, "X", NodeType::U16, Some(0)).unwrap();
        let sub = tree.subscribe(node, Box::new(|l: &Log| l.borrow_mut().push("gone")));

        let handler = tree.take_handler(node, sub).unwrap();
        assert!(tree.unsubscribe(node, sub));
        tree.return_handler(node, sub, handler);

        assert_eq!(tree.node(node).subscriber_count(), 0);
        notify(&mut tree, node, &log);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn unsubscribe_unknown_id_while_running() {
        let mut tree: Tree<Box<dyn FnMut(&Log)>> = Tree::new();
        let root = tree.root();
        let node = tree.add_child(root, "X", NodeType::U16, Some(0)).unwrap();
        let other = tree.add_child(root, "Y", NodeType::U16, Some(1)).unwrap();
        let sub = tree.subscribe(node, Box::new(|_: &Log| {}));
        let elsewhere = tree.subscribe(other, Box::new(|_: &Log| {}));

        let handler = tree.take_handler(node, sub).unwrap();
        assert!(!tree.unsubscribe(node, elsewhere));
        tree.return_handler(node, sub, handler);
        assert_eq!(tree.node(other).subscriber_count(), 1);
    }

    #[test]
    fn dump_and_render() {
        let mut tree = sample();
        let mapping = tree.find("CH1:MAPPING", None).unwrap();
        tree.set_value(mapping, Value::Choice(1)).unwrap();
        assert_eq!(tree.value_as_string(mapping), "TEMP");

        let dump = tree.dump(tree.root());
        assert!(dump.starts_with("(root) [PLAIN]\n"));
        assert!(dump.contains("  CH1 [PLAIN]\n"));
        assert!(dump.contains("    MAPPING [CHOOSER] (op 0) = TEMP\n"));
        assert!(dump.contains("      CURRENT [PLAIN]\n"));
    }

    #[test]
    fn clear_drops_everything() {
        let mut tree = sample();
        let pcb = tree.find("PCB_VERSION", None).unwrap();
        tree.subscribe(pcb, 7);
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.find("PCB_VERSION", None), None);
    }
}

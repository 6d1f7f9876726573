//! Receive path: fragment reassembly and op-code dispatch

use log::{debug, warn};

use mooshi_proto::description::PATH_ADMIN_TREE;
use mooshi_proto::frame::{Frame, PayloadKind};
use mooshi_proto::{NodeId, Value};

use super::Session;
use crate::state::ConnectionState;

impl Session {
    /// Feed one notification fragment into the frame reader
    ///
    /// Malformed input never escapes: bad checksums, unknown op-codes and
    /// oversized lengths are logged and the reader resynchronizes.
    pub(crate) fn on_fragment(&mut self, fragment: &[u8]) {
        self.reader.push(fragment);
        loop {
            let op_codes = &self.op_codes;
            let tree = &self.tree;
            let next = self.reader.next_frame(&self.crc, |op| {
                op_codes
                    .get(op)
                    .map(|id| PayloadKind::Value(tree.node(id).node_type()))
            });
            match next {
                Ok(Some(frame)) => self.on_frame(frame),
                Ok(None) => break,
                Err(e) => warn!("dropping inbound bytes: {e}"),
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if let Some(previous) = self.recv_sequence {
            let expected = previous.wrapping_add(1);
            if frame.sequence != expected {
                warn!("sequence gap: expected {expected}, got {}", frame.sequence);
            }
        }
        self.recv_sequence = Some(frame.sequence);
        self.dispatch(frame.op, &frame.payload);
    }

    /// Decode `payload` for the node registered at `op_code`, store it and
    /// notify subscribers
    ///
    /// Returns whether a node was updated. Unknown op-codes and undecodable
    /// payloads are dropped.
    pub fn dispatch(&mut self, op_code: u8, payload: &[u8]) -> bool {
        let Some(node) = self.op_codes.get(op_code) else {
            warn!("no node for op-code {op_code:#04x}, dropping");
            return false;
        };
        let node_type = self.tree.node(node).node_type();
        let value = match mooshi_proto::decode(node_type, payload) {
            Ok((value, used)) => {
                if used < payload.len() {
                    debug!("{} trailing bytes after {node_type} value", payload.len() - used);
                }
                value
            }
            Err(e) => {
                warn!("{}: {e}", self.tree.path(node));
                return false;
            }
        };

        if self.pending_request == Some(node) {
            self.pending_request = None;
        }

        let description = match (&value, self.state) {
            (Value::Bin(bytes), ConnectionState::DiscoveringTree)
                if self.tree.find(PATH_ADMIN_TREE, None) == Some(node) =>
            {
                Some(bytes.clone())
            }
            _ => None,
        };

        self.apply(node, value);
        if let Some(compressed) = description {
            self.on_tree_received(&compressed);
        }
        true
    }

    fn apply(&mut self, node: NodeId, value: Value) {
        debug!("{} = {value}", self.tree.path(node));
        if let Err(e) = self.tree.set_value(node, value) {
            warn!("{e}");
            return;
        }
        self.notify_subscribers(node);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use mooshi_proto::description::PATH_ADMIN_CRC32;
    use mooshi_proto::Crc32;

    use super::*;
    use crate::config::SessionConfig;
    use crate::sim::SimMeter;

    fn session() -> Session {
        let (meter, _, events) = SimMeter::new().unwrap();
        Session::new(Box::new(meter), events, SessionConfig::default())
    }

    #[test]
    fn dispatch_decodes_and_notifies() {
        let mut session = session();
        let node = session.node(PATH_ADMIN_CRC32).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session
            .node_subscribe(node, move |session, node| {
                sink.lock().unwrap().push(session.node_value(node).cloned());
            })
            .unwrap();

        assert!(session.dispatch(0, &[0x78, 0x56, 0x34, 0x12]));
        assert_eq!(session.node_value(node), Some(&Value::U32(0x1234_5678)));
        assert_eq!(*seen.lock().unwrap(), vec![Some(Value::U32(0x1234_5678))]);
    }

    #[test]
    fn unknown_op_code_is_a_no_op() {
        let mut session = session();
        let before = session.dump_tree(None);
        assert!(!session.dispatch(0x42, &[1, 2, 3, 4]));
        assert_eq!(session.dump_tree(None), before);
    }

    #[test]
    fn short_payload_is_dropped() {
        let mut session = session();
        let node = session.node(PATH_ADMIN_CRC32).unwrap();
        assert!(!session.dispatch(0, &[1, 2]));
        assert_eq!(session.node_value(node), None);
    }

    #[test]
    fn reassembles_and_recovers_from_bad_checksum() {
        let mut session = session();
        let node = session.node(PATH_ADMIN_CRC32).unwrap();
        let crc = Crc32::new();

        let mut bad = Frame::value(0, 0, 7u32.to_le_bytes().to_vec()).to_bytes(&crc);
        bad[3] ^= 0x01;
        session.on_fragment(&bad);
        assert_eq!(session.node_value(node), None);
        assert_eq!(session.reader.buffered(), 0);

        let good = Frame::value(1, 0, 9u32.to_le_bytes().to_vec()).to_bytes(&crc);
        session.on_fragment(&good[..3]);
        assert_eq!(session.node_value(node), None);
        session.on_fragment(&good[3..]);
        assert_eq!(session.node_value(node), Some(&Value::U32(9)));
        assert_eq!(session.recv_sequence, Some(1));
    }

    #[test]
    fn sequence_gap_still_dispatches() {
        let mut session = session();
        let node = session.node(PATH_ADMIN_CRC32).unwrap();
        let crc = Crc32::new();
        session.on_fragment(&Frame::value(10, 0, vec![1, 0, 0, 0]).to_bytes(&crc));
        session.on_fragment(&Frame::value(20, 0, vec![2, 0, 0, 0]).to_bytes(&crc));
        assert_eq!(session.node_value(node), Some(&Value::U32(2)));
        assert_eq!(session.recv_sequence, Some(20));
    }

    #[test]
    fn answer_clears_pending_request() {
        let mut session = session();
        let node = session.node(PATH_ADMIN_CRC32).unwrap();
        session.node_request_value(node).unwrap();
        assert_eq!(session.pending_request(), Some(node));
        session.dispatch(0, &[0, 0, 0, 0]);
        assert_eq!(session.pending_request(), None);
    }
}

//! Meter session
//!
//! Owns the node tree, the op-code table and the framing state, and drives
//! the connection lifecycle:
//!
//! ```text
//! setup -> Scanning -> Connecting -> BindingCharacteristics
//!       -> EnablingNotify -> DiscoveringTree -> Ready
//! ```
//!
//! Node operations are synchronous. Outbound frames are queued and written
//! by [`Session::flush`], which [`Session::run`] calls after every event, so
//! callbacks can freely read and write nodes.

mod dispatch;

use std::collections::VecDeque;

use log::{debug, info, warn};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use mooshi_proto::description::{self, OP_ADMIN_TREE, PATH_ADMIN, PATH_ADMIN_CRC32};
use mooshi_proto::frame::{self, Frame, FrameReader};
use mooshi_proto::{Crc32, NodeId, NodeType, OpCodeTable, SubscriptionId, Tree, Value};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::state::ConnectionState;
use crate::transport::{
    AdapterInfo, CharacteristicId, DeviceId, EventReceiver, Property, SERIAL_IN, SERIAL_OUT,
    SERVICE, Transport, TransportEvent,
};

/// Called once, when the tree is discovered and the session is ready
pub type InitHandler = Box<dyn FnOnce(&mut Session) + Send>;

/// Called once, the first time a scan runs out without finding a meter
pub type ScanTimeoutHandler = Box<dyn FnOnce(&mut Session) + Send>;

/// Called with the node whenever its value changes
pub type NodeHandler = Box<dyn FnMut(&mut Session, NodeId) + Send>;

enum Step {
    Event(Option<TransportEvent>),
    ScanTimeout,
    DiscoveryTimeout,
    Heartbeat,
}

pub struct Session {
    transport: Box<dyn Transport>,
    events: EventReceiver,
    config: SessionConfig,
    state: ConnectionState,

    adapter: Option<AdapterInfo>,
    device: Option<DeviceId>,
    serial_in: Option<CharacteristicId>,
    serial_out: Option<CharacteristicId>,
    connect_failures: u32,

    crc: Crc32,
    reader: FrameReader,
    send_sequence: u8,
    recv_sequence: Option<u8>,
    outbox: VecDeque<Vec<u8>>,

    tree: Tree<NodeHandler>,
    op_codes: OpCodeTable,
    /// CRC of the description the current tree was built from
    tree_crc: Option<u32>,
    /// Last node a value was requested for
    pending_request: Option<NodeId>,

    scan_deadline: Option<Instant>,
    discovery_deadline: Option<Instant>,
    /// Tree requests sent for the current connection
    discovery_requests: u32,
    heartbeat: Option<Interval>,

    init_handler: Option<InitHandler>,
    scan_timeout_handler: Option<ScanTimeoutHandler>,
    set_up: bool,
    stop_requested: bool,
    rescan_requested: bool,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>, events: EventReceiver, config: SessionConfig) -> Self {
        let tree = description::bootstrap_tree();
        let op_codes = OpCodeTable::build(&tree).unwrap_or_default();
        Self {
            transport,
            events,
            config,
            state: ConnectionState::NoAdapter,
            adapter: None,
            device: None,
            serial_in: None,
            serial_out: None,
            connect_failures: 0,
            crc: Crc32::new(),
            reader: FrameReader::new(),
            send_sequence: 0,
            recv_sequence: None,
            outbox: VecDeque::new(),
            tree,
            op_codes,
            tree_crc: None,
            pending_request: None,
            scan_deadline: None,
            discovery_deadline: None,
            discovery_requests: 0,
            heartbeat: None,
            init_handler: None,
            scan_timeout_handler: None,
            set_up: false,
            stop_requested: false,
            rescan_requested: false,
        }
    }

    // === Lifecycle ===

    /// Acquire the adapter and start scanning
    ///
    /// Errors here are fatal for the session: `NoAdapterFound` or
    /// `ScanFailed`. The callbacks capture whatever user data they need.
    pub async fn setup<I, T>(&mut self, on_init: I, on_scan_timeout: T) -> Result<(), SessionError>
    where
        I: FnOnce(&mut Session) + Send + 'static,
        T: FnOnce(&mut Session) + Send + 'static,
    {
        if self.set_up {
            return Err(SessionError::AlreadySetUp);
        }
        self.set_up = true;
        self.init_handler = Some(Box::new(on_init));
        self.scan_timeout_handler = Some(Box::new(on_scan_timeout));

        let adapter = self
            .transport
            .find_adapter()
            .await
            .map_err(SessionError::NoAdapterFound)?;
        info!("using adapter {}", adapter.name);
        self.adapter = Some(adapter);

        self.begin_scan().await
    }

    /// Event loop; see [`ConnectionState::is_idle`] for when it returns
    pub async fn run(&mut self) -> Result<(), SessionError> {
        self.stop_requested = false;
        loop {
            self.flush().await;

            if self.stop_requested {
                debug!("stop requested");
                break;
            }
            if self.rescan_requested {
                self.rescan_requested = false;
                if matches!(
                    self.state,
                    ConnectionState::ScanTimedOut | ConnectionState::Disconnected
                ) {
                    self.connect_failures = 0;
                    self.begin_scan().await?;
                }
                continue;
            }
            if self.state.is_idle() {
                debug!("session idle in state {}", self.state);
                break;
            }

            let step = tokio::select! {
                event = self.events.recv() => Step::Event(event),
                _ = wait_until(self.scan_deadline) => Step::ScanTimeout,
                _ = wait_until(self.discovery_deadline) => Step::DiscoveryTimeout,
                _ = next_beat(self.heartbeat.as_mut()) => Step::Heartbeat,
            };

            match step {
                Step::Event(Some(event)) => self.handle_event(event).await?,
                Step::Event(None) => {
                    warn!("transport event stream closed");
                    break;
                }
                Step::ScanTimeout => self.on_scan_timeout().await,
                Step::DiscoveryTimeout => self.on_discovery_timeout(),
                Step::Heartbeat => self.send_heartbeat(),
            }
        }
        self.flush().await;
        Ok(())
    }

    /// Ask [`Session::run`] to return after the current event
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Scan again after a timeout or a disconnect
    pub fn rescan(&mut self) {
        self.rescan_requested = true;
    }

    /// Stop scanning, cancel timers, disconnect and drop the tree
    pub async fn shutdown(&mut self) {
        self.scan_deadline = None;
        self.heartbeat = None;
        if self.state.is_scanning() {
            if let Err(e) = self.transport.stop_scan().await {
                debug!("stop scan during shutdown: {e}");
            }
        }
        if self.state.is_connected() || self.state == ConnectionState::Connecting {
            if let Err(e) = self.transport.disconnect().await {
                debug!("disconnect during shutdown: {e}");
            }
        }
        self.reset_link();
        self.tree.clear();
        self.op_codes = OpCodeTable::empty();
        self.tree_crc = None;
        self.init_handler = None;
        self.scan_timeout_handler = None;
        self.set_state(ConnectionState::Closed);
    }

    /// Hand queued fragments to the transport
    ///
    /// Writes are fire-and-forget: a failed write drops the rest of the
    /// queue and the link loss, if that is what it was, arrives as an event.
    pub async fn flush(&mut self) {
        let Some(serial_in) = self.serial_in else {
            if !self.outbox.is_empty() {
                debug!("not connected, dropping {} queued writes", self.outbox.len());
                self.outbox.clear();
            }
            return;
        };
        while let Some(fragment) = self.outbox.pop_front() {
            if let Err(e) = self.transport.write(serial_in, &fragment).await {
                warn!("write failed, dropping {} queued writes: {e}", self.outbox.len());
                self.outbox.clear();
                return;
            }
        }
    }

    // === Queries ===

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.state.is_scanning()
    }

    pub fn is_listening(&self) -> bool {
        self.state.is_listening()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_initialized()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn adapter(&self) -> Option<&AdapterInfo> {
        self.adapter.as_ref()
    }

    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    pub fn tree(&self) -> &Tree<NodeHandler> {
        &self.tree
    }

    pub fn pending_request(&self) -> Option<NodeId> {
        self.pending_request
    }

    /// Frames written since the last flush, still fragmented
    pub fn queued_writes(&self) -> usize {
        self.outbox.len()
    }

    // === Node operations ===

    pub fn node_find(&self, path: &str, start: Option<NodeId>) -> Option<NodeId> {
        self.tree.find(path, start)
    }

    /// Like [`Session::node_find`], but a missing node is an error
    pub fn node(&self, path: &str) -> Result<NodeId, SessionError> {
        self.tree
            .find(path, None)
            .ok_or_else(|| SessionError::UnknownPath(path.to_string()))
    }

    pub fn node_value(&self, node: NodeId) -> Option<&Value> {
        self.tree.get(node)?.value()
    }

    /// Store a value locally, notify subscribers, and optionally write it
    /// to the meter
    pub fn node_set_value(
        &mut self,
        node: NodeId,
        value: Value,
        send_update: bool,
    ) -> Result<(), SessionError> {
        let (node_type, op_code) = self.checked(node)?;
        let payload = if send_update {
            let op = op_code.ok_or_else(|| self.not_addressable(node))?;
            Some((op, mooshi_proto::encode(node_type, &value)?))
        } else {
            None
        };

        self.tree.set_value(node, value)?;
        self.notify_subscribers(node);

        if let Some((op, payload)) = payload {
            debug!("write {} ({} bytes)", self.tree.path(node), payload.len());
            self.queue_frame(|sequence| Frame::write(sequence, op, payload));
        }
        Ok(())
    }

    /// Send a read request; the answer arrives through dispatch
    pub fn node_request_value(&mut self, node: NodeId) -> Result<(), SessionError> {
        let (_, op_code) = self.checked(node)?;
        let op = op_code.ok_or_else(|| self.not_addressable(node))?;
        if let Some(previous) = self.pending_request {
            if previous != node {
                debug!(
                    "request for {} replaces pending {}",
                    self.tree.path(node),
                    self.tree.path(previous)
                );
            }
        }
        self.pending_request = Some(node);
        self.queue_frame(|sequence| Frame::read_request(sequence, op));
        Ok(())
    }

    /// Select `node` in its parent chooser
    pub fn node_choose(&mut self, node: NodeId) -> Result<(), SessionError> {
        self.checked(node)?;
        let (chooser, index) = self
            .tree
            .chooser_option(node)
            .ok_or_else(|| SessionError::NotAChooser(self.tree.path(node)))?;
        self.node_choose_by_index(chooser, index)
    }

    pub fn node_choose_by_index(&mut self, node: NodeId, index: u8) -> Result<(), SessionError> {
        let (node_type, _) = self.checked(node)?;
        if node_type != NodeType::Chooser {
            return Err(SessionError::NotAChooser(self.tree.path(node)));
        }
        if usize::from(index) >= self.tree.node(node).children().len() {
            return Err(SessionError::NoSuchOption {
                path: self.tree.path(node),
                index,
            });
        }
        self.node_set_value(node, Value::Choice(index), true)
    }

    pub fn node_subscribe<F>(&mut self, node: NodeId, handler: F) -> Result<SubscriptionId, SessionError>
    where
        F: FnMut(&mut Session, NodeId) + Send + 'static,
    {
        self.checked(node)?;
        Ok(self.tree.subscribe(node, Box::new(handler)))
    }

    pub fn node_unsubscribe(&mut self, node: NodeId, subscription: SubscriptionId) -> bool {
        self.tree.get(node).is_some() && self.tree.unsubscribe(node, subscription)
    }

    pub fn value_as_string(&self, node: NodeId) -> String {
        match self.tree.get(node) {
            Some(_) => self.tree.value_as_string(node),
            None => "<unknown node>".to_string(),
        }
    }

    /// Indented listing of the tree (or the subtree at `start`)
    pub fn dump_tree(&self, start: Option<NodeId>) -> String {
        let start = start
            .filter(|id| self.tree.get(*id).is_some())
            .unwrap_or(self.tree.root());
        self.tree.dump(start)
    }

    /// Run every subscriber of `node` with the current value
    ///
    /// Handlers get the whole session; they may read, write and
    /// (un)subscribe, including on `node` itself. A write from inside a
    /// handler starts a nested round that reaches every other subscriber;
    /// a handler is never re-entered.
    pub fn notify_subscribers(&mut self, node: NodeId) {
        for sub in self.tree.subscription_ids(node) {
            let Some(mut handler) = self.tree.take_handler(node, sub) else {
                continue;
            };
            handler(self, node);
            self.tree.return_handler(node, sub, handler);
        }
    }

    fn checked(&self, node: NodeId) -> Result<(NodeType, Option<u8>), SessionError> {
        let n = self
            .tree
            .get(node)
            .ok_or(SessionError::UnknownNode(node.index()))?;
        Ok((n.node_type(), n.op_code()))
    }

    fn not_addressable(&self, node: NodeId) -> SessionError {
        SessionError::NodeNotAddressable(self.tree.path(node))
    }

    // === Outbound ===

    fn queue_frame(&mut self, build: impl FnOnce(u8) -> Frame) {
        let sequence = self.send_sequence;
        self.send_sequence = sequence.wrapping_add(1);
        let bytes = build(sequence).to_bytes(&self.crc);
        for chunk in frame::fragment(&bytes, self.config.fragment_size) {
            self.outbox.push_back(chunk.to_vec());
        }
    }

    fn send_heartbeat(&mut self) {
        let node = self
            .tree
            .find(&self.config.heartbeat_node, None)
            .filter(|id| self.tree.node(*id).op_code().is_some())
            .or_else(|| self.tree.find(PATH_ADMIN_CRC32, None));
        let Some(op) = node.and_then(|id| self.tree.node(id).op_code()) else {
            return;
        };
        debug!("heartbeat");
        self.queue_frame(|sequence| Frame::read_request(sequence, op));
    }

    /// Read every addressable node outside `ADMIN`
    fn request_all_values(&mut self) {
        let admin = self.tree.find(PATH_ADMIN, None);
        let skip: Vec<NodeId> = admin.map(|id| self.tree.walk(id)).unwrap_or_default();
        let ops: Vec<u8> = self
            .tree
            .walk(self.tree.root())
            .into_iter()
            .filter(|id| !skip.contains(id))
            .filter_map(|id| self.tree.node(id).op_code())
            .collect();
        debug!("requesting {} values", ops.len());
        for op in ops {
            self.queue_frame(|sequence| Frame::read_request(sequence, op));
        }
    }

    // === State machine ===

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("state {} -> {}", self.state, state);
            self.state = state;
        }
    }

    async fn begin_scan(&mut self) -> Result<(), SessionError> {
        self.transport
            .start_scan(SERVICE)
            .await
            .map_err(SessionError::ScanFailed)?;
        info!("scanning for meters ({}s)", self.config.scan_timeout);
        self.scan_deadline = Some(Instant::now() + self.config.scan_timeout());
        self.set_state(ConnectionState::Scanning);
        Ok(())
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Result<(), SessionError> {
        match event {
            TransportEvent::DeviceFound { device, name } => {
                if !self.state.is_scanning() {
                    return Ok(());
                }
                if !self.config.matches(&device, name.as_deref()) {
                    debug!("ignoring {device} ({})", name.as_deref().unwrap_or("unnamed"));
                    return Ok(());
                }
                info!("found {} at {device}", name.as_deref().unwrap_or("meter"));
                self.connect(device).await
            }
            TransportEvent::Notification {
                characteristic,
                value,
            } => {
                if Some(characteristic) == self.serial_out && self.is_listening() {
                    self.on_fragment(&value);
                } else {
                    debug!("ignoring notification from {}", characteristic.0);
                }
                Ok(())
            }
            TransportEvent::PropertyChanged(Property::Connected(false)) => self.on_disconnect().await,
            TransportEvent::PropertyChanged(property) => {
                debug!("property changed: {property:?}");
                Ok(())
            }
        }
    }

    async fn connect(&mut self, device: DeviceId) -> Result<(), SessionError> {
        self.scan_deadline = None;
        if let Err(e) = self.transport.stop_scan().await {
            warn!("failed to stop scan: {e}");
        }

        self.set_state(ConnectionState::Connecting);
        self.device = Some(device.clone());
        if let Err(e) = self.transport.connect(&device).await {
            return self.connect_failed(format!("connect to {device}: {e}")).await;
        }

        self.set_state(ConnectionState::BindingCharacteristics);
        let serial_in = self.resolve(SERIAL_IN).await?;
        let serial_out = self.resolve(SERIAL_OUT).await?;
        self.serial_in = Some(serial_in);
        self.serial_out = Some(serial_out);

        self.set_state(ConnectionState::EnablingNotify);
        if let Err(e) = self.transport.subscribe_notify(serial_out).await {
            return self.connect_failed(format!("enable notifications: {e}")).await;
        }

        info!("connected to {device}");
        self.connect_failures = 0;
        self.begin_discovery();
        Ok(())
    }

    async fn resolve(&mut self, uuid: uuid::Uuid) -> Result<CharacteristicId, SessionError> {
        match self.transport.resolve_characteristic(uuid).await {
            Ok(Some(characteristic)) => Ok(characteristic),
            Ok(None) => {
                self.abandon_link().await;
                Err(SessionError::TransportConnectionFailed(format!(
                    "characteristic {uuid} not found"
                )))
            }
            Err(e) => {
                self.abandon_link().await;
                Err(SessionError::TransportConnectionFailed(format!(
                    "resolve {uuid}: {e}"
                )))
            }
        }
    }

    /// Rescan after a failed connection attempt, or give up
    async fn connect_failed(&mut self, reason: String) -> Result<(), SessionError> {
        self.connect_failures += 1;
        warn!(
            "{reason} (attempt {}/{})",
            self.connect_failures, self.config.connect_attempts
        );
        if let Err(e) = self.transport.disconnect().await {
            debug!("disconnect after failure: {e}");
        }
        self.reset_link();

        if self.connect_failures >= self.config.connect_attempts {
            self.set_state(ConnectionState::Disconnected);
            return Err(SessionError::TransportConnectionFailed(reason));
        }
        self.begin_scan().await
    }

    async fn abandon_link(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!("disconnect: {e}");
        }
        self.reset_link();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Forget everything tied to the current connection
    fn reset_link(&mut self) {
        self.heartbeat = None;
        self.discovery_deadline = None;
        self.discovery_requests = 0;
        self.serial_in = None;
        self.serial_out = None;
        self.device = None;
        self.reader.clear();
        self.send_sequence = 0;
        self.recv_sequence = None;
        self.pending_request = None;
        self.outbox.clear();
    }

    fn begin_discovery(&mut self) {
        self.set_state(ConnectionState::DiscoveringTree);
        self.send_sequence = 0;
        self.discovery_requests = 0;
        self.request_tree();
    }

    fn request_tree(&mut self) {
        // a half-received description is useless once we ask again
        self.reader.clear();
        self.recv_sequence = None;
        self.discovery_requests += 1;
        self.discovery_deadline = Some(Instant::now() + self.config.discovery_timeout());
        self.queue_frame(|sequence| Frame::read_request(sequence, OP_ADMIN_TREE));
    }

    fn on_discovery_timeout(&mut self) {
        self.discovery_deadline = None;
        if self.state != ConnectionState::DiscoveringTree {
            return;
        }
        if self.discovery_requests < self.config.discovery_attempts {
            warn!(
                "no tree description after {}s, asking again ({}/{})",
                self.config.discovery_timeout,
                self.discovery_requests + 1,
                self.config.discovery_attempts
            );
            self.request_tree();
            return;
        }
        warn!(
            "no tree description after {} requests, continuing with a partial tree",
            self.discovery_requests
        );
        self.enter_ready();
    }

    /// The meter sent its tree description
    fn on_tree_received(&mut self, compressed: &[u8]) {
        self.discovery_deadline = None;
        let checksum = self.crc.calculate(compressed);

        if self.tree_crc == Some(checksum) {
            debug!("tree unchanged since last connection");
        } else {
            let parsed = description::parse::<NodeHandler>(compressed)
                .and_then(|tree| OpCodeTable::build(&tree).map(|table| (tree, table)));
            match parsed {
                Ok((tree, table)) => {
                    info!("discovered {} nodes, {} addressable", tree.len(), table.len());
                    self.tree = tree;
                    self.op_codes = table;
                    self.tree_crc = Some(checksum);
                }
                Err(e) => {
                    warn!("unusable tree description, continuing with a partial tree: {e}");
                    self.enter_ready();
                    return;
                }
            }
        }

        match self.tree.find(PATH_ADMIN_CRC32, None) {
            Some(node) => {
                if let Err(e) = self.node_set_value(node, Value::U32(checksum), true) {
                    warn!("failed to send tree checksum: {e}");
                }
            }
            None => warn!("tree has no {PATH_ADMIN_CRC32}, meter will stay locked"),
        }
        self.request_all_values();
        self.enter_ready();
    }

    fn enter_ready(&mut self) {
        self.set_state(ConnectionState::Ready);
        let period = self.config.heartbeat_period();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);

        if let Some(on_init) = self.init_handler.take() {
            on_init(self);
        }
    }

    async fn on_scan_timeout(&mut self) {
        self.scan_deadline = None;
        if !self.state.is_scanning() {
            return;
        }
        info!("no meter found within {}s", self.config.scan_timeout);
        if let Err(e) = self.transport.stop_scan().await {
            warn!("failed to stop scan: {e}");
        }
        self.set_state(ConnectionState::ScanTimedOut);

        if let Some(on_timeout) = self.scan_timeout_handler.take() {
            on_timeout(self);
        }
    }

    async fn on_disconnect(&mut self) -> Result<(), SessionError> {
        if !self.state.is_connected() && self.state != ConnectionState::Connecting {
            debug!("disconnect while {}", self.state);
            return Ok(());
        }
        warn!("meter disconnected");
        self.reset_link();

        if self.config.reconnect {
            self.begin_scan().await
        } else {
            self.set_state(ConnectionState::Disconnected);
            Ok(())
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_beat(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

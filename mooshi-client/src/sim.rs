//! In-process simulated meter
//!
//! Speaks the device side of the protocol behind the [`Transport`] trait:
//! serves a tree description, checks the CRC handshake, answers reads and
//! stores and echoes writes. Tests keep the [`SimHandle`] to push values,
//! drop the link or inject raw bytes while the session runs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::debug;
use uuid::Uuid;

use mooshi_proto::description::{self, NodeSpec, PATH_ADMIN_CRC32, PATH_ADMIN_TREE, admin_spec};
use mooshi_proto::frame::{self, Frame, FrameReader, PayloadKind};
use mooshi_proto::{Crc32, NodeType, OpCodeTable, Tree, Value, WRITE_FLAG};

use crate::error::{SessionError, TransportError};
use crate::transport::{
    AdapterInfo, CharacteristicId, DeviceId, EventReceiver, EventSender, Property, SERIAL_IN,
    SERIAL_OUT, SERVICE, Transport, TransportEvent, event_channel,
};

/// Address from the documentation MAC range
pub const SIM_ADDRESS: &str = "00:00:5E:00:53:01";
pub const SIM_NAME: &str = "Mooshimeter V.1";

/// Node layout of the simulated meter
pub fn default_tree() -> NodeSpec {
    use NodeType::*;

    let channel = |mapping: &[&str]| {
        vec![
            NodeSpec::chooser("MAPPING", mapping),
            NodeSpec::new("RANGE_I", U8),
            NodeSpec::chooser("ANALYSIS", &["MEAN", "RMS", "BUFFER"]),
            NodeSpec::new("VALUE", Float),
            NodeSpec::new("OFFSET", Float),
            NodeSpec::new("BUF", Bin),
            NodeSpec::new("BUF_BPS", U8),
            NodeSpec::new("BUF_LSB2NATIVE", Float),
            NodeSpec::new("SHARED", Link),
        ]
    };

    NodeSpec::plain(
        "",
        vec![
            admin_spec(),
            NodeSpec::new("PCB_VERSION", U8),
            NodeSpec::new("NAME", Str),
            NodeSpec::new("TIME_UTC", U32),
            NodeSpec::new("TIME_UTC_MS", U16),
            NodeSpec::new("BAT_V", Float),
            NodeSpec::chooser("REBOOT", &["NORMAL", "SHIPMODE"]),
            NodeSpec::plain(
                "SAMPLING",
                vec![
                    NodeSpec::chooser(
                        "RATE",
                        &["125", "250", "500", "1000", "2000", "4000", "8000"],
                    ),
                    NodeSpec::chooser("DEPTH", &["32", "64", "128", "256"]),
                    NodeSpec::chooser("TRIGGER", &["OFF", "SINGLE", "CONTINUOUS"]),
                ],
            ),
            NodeSpec::plain(
                "LOG",
                vec![
                    NodeSpec::new("ON", U8),
                    NodeSpec::new("INTERVAL", U16),
                    NodeSpec::new("STATUS", U8),
                    NodeSpec::new("POLLDIR", U8),
                    NodeSpec::plain(
                        "INFO",
                        vec![
                            NodeSpec::new("INDEX", U16),
                            NodeSpec::new("END_TIME", U32),
                            NodeSpec::new("N_BYTES", U32),
                        ],
                    ),
                ],
            ),
            NodeSpec::plain("CH1", channel(&["CURRENT", "TEMP", "SHARED"])),
            NodeSpec::plain("CH2", channel(&["VOLTAGE", "TEMP", "SHARED"])),
            NodeSpec::chooser("SHARED", &["AUX_V", "RESISTANCE", "DIODE"]),
            NodeSpec::new("REAL_PWR", Float),
            NodeSpec::plain(
                "CAL",
                vec![
                    NodeSpec::new("GAIN", S32),
                    NodeSpec::new("TRIM", S16),
                    NodeSpec::new("SKEW", S8),
                ],
            ),
        ],
    )
}

fn default_values() -> Vec<(String, Value)> {
    [
        ("PCB_VERSION", Value::U8(8)),
        ("NAME", Value::Str(SIM_NAME.to_string())),
        ("BAT_V", Value::Float(3.05)),
        ("LOG:INTERVAL", Value::U16(60)),
        ("CH1:BUF_BPS", Value::U8(24)),
        ("CH2:BUF_BPS", Value::U8(24)),
        ("CAL:GAIN", Value::S32(-1200)),
    ]
    .into_iter()
    .map(|(path, value)| (path.to_string(), value))
    .collect()
}

pub struct SimBuilder {
    spec: NodeSpec,
    values: Vec<(String, Value)>,
    adapter: bool,
    advertise: bool,
    serial: bool,
    notify_failures: u32,
    silent: Vec<String>,
    name: String,
    fragment_size: usize,
    raw_description: Option<Vec<u8>>,
}

impl Default for SimBuilder {
    fn default() -> Self {
        Self {
            spec: default_tree(),
            values: default_values(),
            adapter: true,
            advertise: true,
            serial: true,
            notify_failures: 0,
            silent: Vec::new(),
            name: SIM_NAME.to_string(),
            fragment_size: mooshi_proto::ble::DEFAULT_FRAGMENT_SIZE,
            raw_description: None,
        }
    }
}

impl SimBuilder {
    /// Serve a different tree; default values are dropped with the old one
    pub fn tree(mut self, spec: NodeSpec) -> Self {
        self.spec = spec;
        self.values.clear();
        self
    }

    /// Initial device-side value of a node
    pub fn value(mut self, path: &str, value: Value) -> Self {
        self.values.push((path.to_string(), value));
        self
    }

    pub fn without_adapter(mut self) -> Self {
        self.adapter = false;
        self
    }

    /// Do not answer scans until [`SimHandle::set_advertising`]
    pub fn hidden(mut self) -> Self {
        self.advertise = false;
        self
    }

    /// Expose no serial characteristics
    pub fn without_serial(mut self) -> Self {
        self.serial = false;
        self
    }

    /// Fail the next `times` notification enables
    pub fn failing_notify(mut self, times: u32) -> Self {
        self.notify_failures = times;
        self
    }

    /// Never answer read requests for this node
    pub fn ignore_reads(mut self, path: &str) -> Self {
        self.silent.push(path.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size.max(1);
        self
    }

    /// Serve these bytes as the tree description instead of the real one
    pub fn raw_description(mut self, bytes: Vec<u8>) -> Self {
        self.raw_description = Some(bytes);
        self
    }

    pub fn build(self) -> Result<(SimMeter, SimHandle, EventReceiver), SessionError> {
        let description = match self.raw_description {
            Some(bytes) => bytes,
            None => description::encode(&self.spec)?,
        };
        let mut tree: Tree<()> = description::build_tree(&self.spec)?;
        let op_codes = OpCodeTable::build(&tree)?;

        for (path, value) in self.values {
            let id = tree
                .find(&path, None)
                .ok_or_else(|| SessionError::UnknownPath(path.clone()))?;
            tree.set_value(id, value)?;
        }

        let mut silent = HashSet::new();
        for path in &self.silent {
            let id = tree
                .find(path, None)
                .ok_or_else(|| SessionError::UnknownPath(path.clone()))?;
            let op = tree
                .node(id)
                .op_code()
                .ok_or_else(|| SessionError::NodeNotAddressable(path.clone()))?;
            silent.insert(op);
        }

        let (events, receiver) = event_channel();
        let state = SimState {
            events,
            adapter: self.adapter,
            advertise: self.advertise,
            serial: self.serial,
            notify_failures: self.notify_failures,
            device: DeviceId(SIM_ADDRESS.to_string()),
            name: self.name,
            scanning: false,
            scan_starts: 0,
            scan_stops: 0,
            connected: false,
            notifying: false,
            tree,
            op_codes,
            description,
            crc: Crc32::new(),
            reader: FrameReader::new(),
            sequence: 0,
            unlocked: false,
            silent,
            received: Vec::new(),
            fragment_size: self.fragment_size,
        };

        let shared = Arc::new(Mutex::new(state));
        Ok((
            SimMeter {
                shared: Arc::clone(&shared),
            },
            SimHandle { shared },
            receiver,
        ))
    }
}

struct SimState {
    events: EventSender,
    adapter: bool,
    advertise: bool,
    serial: bool,
    notify_failures: u32,
    device: DeviceId,
    name: String,
    scanning: bool,
    scan_starts: u32,
    scan_stops: u32,
    connected: bool,
    notifying: bool,
    tree: Tree<()>,
    op_codes: OpCodeTable,
    description: Vec<u8>,
    crc: Crc32,
    reader: FrameReader,
    sequence: u8,
    unlocked: bool,
    silent: HashSet<u8>,
    received: Vec<Frame>,
    fragment_size: usize,
}

impl SimState {
    fn emit(&self, event: TransportEvent) {
        // the session may already be gone
        let _ = self.events.send(event);
    }

    fn advertise_now(&self) {
        if self.scanning && self.advertise {
            self.emit(TransportEvent::DeviceFound {
                device: self.device.clone(),
                name: Some(self.name.clone()),
            });
        }
    }

    fn notify(&self, fragment: Vec<u8>) {
        if self.connected && self.notifying {
            self.emit(TransportEvent::Notification {
                characteristic: CharacteristicId(SERIAL_OUT),
                value: fragment,
            });
        }
    }

    fn receive(&mut self, bytes: &[u8]) {
        self.reader.push(bytes);
        loop {
            let op_codes = &self.op_codes;
            let tree = &self.tree;
            let next = self.reader.next_frame(&self.crc, |op| {
                let id = op_codes.get(op & !WRITE_FLAG)?;
                if op & WRITE_FLAG != 0 {
                    Some(PayloadKind::Value(tree.node(id).node_type()))
                } else {
                    Some(PayloadKind::Empty)
                }
            });
            match next {
                Ok(Some(frame)) => self.handle(frame),
                Ok(None) => break,
                Err(e) => debug!("sim: dropping client bytes: {e}"),
            }
        }
    }

    fn handle(&mut self, frame: Frame) {
        self.received.push(frame.clone());
        let op = frame.op_code();
        let Some(id) = self.op_codes.get(op) else {
            return;
        };

        if frame.is_write() {
            let node_type = self.tree.node(id).node_type();
            let value = match mooshi_proto::decode(node_type, &frame.payload) {
                Ok((value, _)) => value,
                Err(e) => {
                    debug!("sim: bad write to op {op}: {e}");
                    return;
                }
            };
            if self.tree.find(PATH_ADMIN_CRC32, None) == Some(id) {
                self.unlocked = value == Value::U32(self.crc.calculate(&self.description));
                debug!("sim: handshake accepted={}", self.unlocked);
            }
            if let Err(e) = self.tree.set_value(id, value) {
                debug!("sim: {e}");
            }
            self.respond(op);
        } else if !self.silent.contains(&op) {
            self.respond(op);
        }
    }

    fn respond(&mut self, op: u8) {
        let Some(id) = self.op_codes.get(op) else {
            return;
        };
        let node = self.tree.node(id);
        let node_type = node.node_type();
        let value = if self.tree.find(PATH_ADMIN_TREE, None) == Some(id) {
            Value::Bin(self.description.clone())
        } else {
            node.value().cloned().unwrap_or_else(|| Value::zero(node_type))
        };
        if let Ok(bytes) = self.value_frame(op, node_type, &value) {
            self.send_fragments(&bytes);
        }
    }

    fn value_frame(
        &mut self,
        op: u8,
        node_type: NodeType,
        value: &Value,
    ) -> Result<Vec<u8>, SessionError> {
        let payload = mooshi_proto::encode(node_type, value)?;
        let frame = Frame::value(self.sequence, op, payload);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame.to_bytes(&self.crc))
    }

    fn send_fragments(&self, bytes: &[u8]) {
        for chunk in frame::fragment(bytes, self.fragment_size) {
            self.notify(chunk.to_vec());
        }
    }

    fn addressable(&self, path: &str) -> Result<(u8, NodeType), SessionError> {
        let id = self
            .tree
            .find(path, None)
            .ok_or_else(|| SessionError::UnknownPath(path.to_string()))?;
        let node = self.tree.node(id);
        let op = node
            .op_code()
            .ok_or_else(|| SessionError::NodeNotAddressable(path.to_string()))?;
        Ok((op, node.node_type()))
    }
}

fn lock(shared: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The simulated meter as seen by a session
pub struct SimMeter {
    shared: Arc<Mutex<SimState>>,
}

impl SimMeter {
    pub fn builder() -> SimBuilder {
        SimBuilder::default()
    }

    /// Default meter, plus its handle and the event receiver for the session
    pub fn new() -> Result<(SimMeter, SimHandle, EventReceiver), SessionError> {
        Self::builder().build()
    }
}

#[async_trait]
impl Transport for SimMeter {
    async fn find_adapter(&mut self) -> Result<AdapterInfo, TransportError> {
        if !lock(&self.shared).adapter {
            return Err(TransportError::NoAdapter);
        }
        Ok(AdapterInfo {
            name: "sim0".to_string(),
        })
    }

    async fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        state.scanning = true;
        state.scan_starts += 1;
        if service == SERVICE {
            state.advertise_now();
        }
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        state.scanning = false;
        state.scan_stops += 1;
        Ok(())
    }

    async fn connect(&mut self, device: &DeviceId) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        if *device != state.device {
            return Err(TransportError::Connection(format!("no device {device}")));
        }
        state.connected = true;
        state.notifying = false;
        state.unlocked = false;
        state.sequence = 0;
        state.reader.clear();
        Ok(())
    }

    async fn resolve_characteristic(
        &mut self,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicId>, TransportError> {
        let state = lock(&self.shared);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let known = state.serial && (uuid == SERIAL_IN || uuid == SERIAL_OUT);
        Ok(known.then_some(CharacteristicId(uuid)))
    }

    async fn subscribe_notify(
        &mut self,
        characteristic: CharacteristicId,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if characteristic.0 != SERIAL_OUT {
            return Err(TransportError::Gatt(format!(
                "{} does not notify",
                characteristic.0
            )));
        }
        if state.notify_failures > 0 {
            state.notify_failures -= 1;
            state.connected = false;
            return Err(TransportError::Gatt("notify enable failed".to_string()));
        }
        state.notifying = true;
        Ok(())
    }

    async fn write(
        &mut self,
        characteristic: CharacteristicId,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if characteristic.0 != SERIAL_IN {
            return Err(TransportError::Gatt(format!(
                "{} is not writable",
                characteristic.0
            )));
        }
        state.receive(bytes);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = lock(&self.shared);
        state.connected = false;
        state.notifying = false;
        Ok(())
    }
}

/// Test-side control of a [`SimMeter`]
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Change a value on the meter and notify the client, as a live
    /// reading would
    pub fn push_value(&self, path: &str, value: Value) -> Result<(), SessionError> {
        let mut state = lock(&self.shared);
        let (op, node_type) = state.addressable(path)?;
        if let Some(id) = state.tree.find(path, None) {
            state.tree.set_value(id, value.clone())?;
        }
        let bytes = state.value_frame(op, node_type, &value)?;
        state.send_fragments(&bytes);
        Ok(())
    }

    /// Encoded value frame for `path`, stamped with the next device sequence
    /// number but not sent
    pub fn value_frame(&self, path: &str, value: &Value) -> Result<Vec<u8>, SessionError> {
        let mut state = lock(&self.shared);
        let (op, node_type) = state.addressable(path)?;
        state.value_frame(op, node_type, value)
    }

    /// Deliver arbitrary bytes as one notification
    pub fn push_raw(&self, bytes: &[u8]) {
        lock(&self.shared).notify(bytes.to_vec());
    }

    /// Drop the link from the meter side
    pub fn drop_link(&self) {
        let mut state = lock(&self.shared);
        state.connected = false;
        state.notifying = false;
        state.emit(TransportEvent::PropertyChanged(Property::Connected(false)));
    }

    pub fn set_advertising(&self, advertise: bool) {
        let mut state = lock(&self.shared);
        state.advertise = advertise;
        state.advertise_now();
    }

    pub fn device(&self) -> DeviceId {
        lock(&self.shared).device.clone()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.shared).scanning
    }

    pub fn scan_starts(&self) -> u32 {
        lock(&self.shared).scan_starts
    }

    pub fn scan_stops(&self) -> u32 {
        lock(&self.shared).scan_stops
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).connected
    }

    /// The client wrote the matching tree CRC on this connection
    pub fn is_unlocked(&self) -> bool {
        lock(&self.shared).unlocked
    }

    /// Current device-side value
    pub fn value(&self, path: &str) -> Option<Value> {
        let state = lock(&self.shared);
        let id = state.tree.find(path, None)?;
        state.tree.node(id).value().cloned()
    }

    pub fn op_code(&self, path: &str) -> Option<u8> {
        let state = lock(&self.shared);
        let id = state.tree.find(path, None)?;
        state.tree.node(id).op_code()
    }

    /// Compressed tree description served by the meter
    pub fn description(&self) -> Vec<u8> {
        lock(&self.shared).description.clone()
    }

    /// Every frame received from the client, oldest first
    pub fn received(&self) -> Vec<Frame> {
        lock(&self.shared).received.clone()
    }

    /// Number of read requests received for `path`
    pub fn read_count(&self, path: &str) -> usize {
        let Some(op) = self.op_code(path) else {
            return 0;
        };
        lock(&self.shared)
            .received
            .iter()
            .filter(|f| !f.is_write() && f.op_code() == op)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_tree_and_checks_handshake() {
        let (mut meter, handle, mut events) = SimMeter::new().unwrap();
        meter.find_adapter().await.unwrap();
        meter.start_scan(SERVICE).await.unwrap();

        let Some(TransportEvent::DeviceFound { device, name }) = events.recv().await else {
            panic!("expected a scan result");
        };
        assert_eq!(name.as_deref(), Some(SIM_NAME));

        meter.connect(&device).await.unwrap();
        let serial_in = meter.resolve_characteristic(SERIAL_IN).await.unwrap().unwrap();
        let serial_out = meter.resolve_characteristic(SERIAL_OUT).await.unwrap().unwrap();
        meter.subscribe_notify(serial_out).await.unwrap();

        let crc = Crc32::new();
        let request = Frame::read_request(0, description::OP_ADMIN_TREE).to_bytes(&crc);
        meter.write(serial_in, &request).await.unwrap();

        let mut reader = FrameReader::new();
        let mut reply = None;
        while reply.is_none() {
            let Some(TransportEvent::Notification { value, .. }) = events.recv().await else {
                panic!("expected a notification");
            };
            assert!(value.len() <= 20);
            reader.push(&value);
            reply = reader
                .next_frame(&crc, |_| Some(PayloadKind::Value(NodeType::Bin)))
                .unwrap();
        }
        let (value, _) = mooshi_proto::decode(NodeType::Bin, &reply.unwrap().payload).unwrap();
        assert_eq!(value, Value::Bin(handle.description()));

        assert!(!handle.is_unlocked());
        let checksum = crc.calculate(&handle.description());
        let write = Frame::write(1, description::OP_ADMIN_CRC32, checksum.to_le_bytes().to_vec());
        meter.write(serial_in, &write.to_bytes(&crc)).await.unwrap();
        assert!(handle.is_unlocked());
        assert_eq!(handle.value(PATH_ADMIN_CRC32), Some(Value::U32(checksum)));
    }

    #[tokio::test]
    async fn missing_pieces() {
        let (mut meter, _, _events) = SimMeter::builder().without_adapter().build().unwrap();
        assert_eq!(meter.find_adapter().await, Err(TransportError::NoAdapter));

        let (mut meter, handle, _events) = SimMeter::builder().without_serial().build().unwrap();
        meter.connect(&handle.device()).await.unwrap();
        assert_eq!(meter.resolve_characteristic(SERIAL_IN).await, Ok(None));

        assert!(matches!(
            SimMeter::builder().ignore_reads("NO:SUCH").build(),
            Err(SessionError::UnknownPath(_))
        ));
    }

    #[test]
    fn default_tree_fits_the_op_code_space() {
        let tree: Tree<()> = description::build_tree(&default_tree()).unwrap();
        assert!(OpCodeTable::build(&tree).unwrap().len() < 128);
        assert!(description::encode(&default_tree()).unwrap().len() < 4096);
    }
}

//! Simulated ccTalk bus shared by the integration tests
//!
//! [`FakeBus`] is a half-duplex line: every frame the master writes comes
//! back as an echo (when enabled) followed by whatever the responder puts on
//! the wire. [`SimulatedMd100`] is a scripted MD-100 responder whose event
//! buffer advances by one event per poll.

#![allow(dead_code)]

use async_trait::async_trait;
use cctalk_core::core::device::md100::{Md100, Md100Options};
use cctalk_core::core::protocol::Message;
use cctalk_core::core::transport::{
    LineFactory, MasterDevice, SerialConfig, SerialLine, TransportError,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const MASTER: u8 = 1;
pub const DEVICE: u8 = 40;

pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(150);
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// What the simulated slave puts on the line for one request
pub enum Reply {
    /// A well-formed frame
    Frame(Message),
    /// Arbitrary bytes
    Raw(Vec<u8>),
    /// Nothing at all
    Silent,
}

/// ACK reply from the device carrying `data`
pub fn reply(data: &[u8]) -> Reply {
    Reply::Frame(ack(data))
}

pub fn ack(data: &[u8]) -> Message {
    Message::new(MASTER, DEVICE, 0)
        .with_data(data.to_vec())
        .unwrap()
}

type Responder = Box<dyn FnMut(&Message) -> Reply + Send>;

pub struct FakeBus {
    rx: Mutex<VecDeque<u8>>,
    notify: Notify,
    responder: Mutex<Responder>,
    requests: Mutex<Vec<Message>>,
    echo: bool,
}

impl FakeBus {
    pub fn new(echo: bool, responder: impl FnMut(&Message) -> Reply + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            rx: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            responder: Mutex::new(Box::new(responder)),
            requests: Mutex::new(Vec::new()),
            echo,
        })
    }

    /// Every request decoded from the line so far
    pub fn requests(&self) -> Vec<Message> {
        self.requests.lock().clone()
    }

    /// Requests carrying `header`
    pub fn requests_with(&self, header: u8) -> Vec<Message> {
        self.requests
            .lock()
            .iter()
            .filter(|m| m.header == header)
            .cloned()
            .collect()
    }

    fn transmit(&self, frame: &[u8]) {
        let mut outgoing = Vec::new();
        if self.echo {
            outgoing.extend_from_slice(frame);
        }
        if let Ok(request) = Message::decode(frame) {
            self.requests.lock().push(request.clone());
            let answer = {
                let mut responder = self.responder.lock();
                (*responder)(&request)
            };
            match answer {
                Reply::Frame(message) => outgoing.extend_from_slice(&message.encode()),
                Reply::Raw(bytes) => outgoing.extend_from_slice(&bytes),
                Reply::Silent => {}
            }
        }
        self.rx.lock().extend(outgoing);
        self.notify.notify_one();
    }
}

pub struct FakeLine(Arc<FakeBus>);

#[async_trait]
impl SerialLine for FakeLine {
    fn discard_buffers(&mut self) -> Result<(), TransportError> {
        self.0.rx.lock().clear();
        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.0.transmit(frame);
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, TransportError> {
        loop {
            let next = self.0.rx.lock().pop_front();
            if let Some(byte) = next {
                return Ok(byte);
            }
            self.0.notify.notified().await;
        }
    }

    fn describe(&self) -> String {
        "simulated bus".to_string()
    }
}

pub struct FakeFactory(pub Arc<FakeBus>);

#[async_trait]
impl LineFactory for FakeFactory {
    async fn open(&self, _config: &SerialConfig) -> Result<Box<dyn SerialLine>, TransportError> {
        Ok(Box::new(FakeLine(Arc::clone(&self.0))))
    }
}

/// Master connected to `bus` with no settle delay
pub async fn connected_master(bus: &Arc<FakeBus>) -> Arc<MasterDevice> {
    let master = MasterDevice::with_factory(MASTER, Arc::new(FakeFactory(Arc::clone(bus))))
        .settle_delay(Duration::ZERO);
    master.configure(SerialConfig::new("sim", 9600));
    master.connect().await.unwrap();
    Arc::new(master)
}

/// Number of bill types the simulated device knows
const BILL_TYPES: usize = 21;

/// Mutable state of the simulated MD-100
pub struct SimState {
    pub counter: u8,
    /// `(code, data)` pairs, newest first
    pub events: VecDeque<(u8, u8)>,
    /// Events released one per buffered-events poll
    pub pending: VecDeque<(u8, u8)>,
    pub inhibit: [u8; 3],
    pub master_accept: bool,
    pub mode: u8,
    /// `(country + value code, max fill)` per bill type
    pub bill_ids: Vec<(String, u16)>,
    pub fill_sizes: [u16; BILL_TYPES],
    pub clock: Option<String>,
    /// The inhibit mask write is acknowledged but not applied
    pub ignore_inhibit: bool,
    /// A dispense takes the bill but never presents it
    pub stall_dispense: bool,
    /// Payout code answered to every real dispense
    pub refuse_dispense: Option<u8>,
    /// Dispenses are acknowledged but the slot never empties
    pub jam_dispense: bool,
}

impl SimState {
    fn push_event(&mut self, code: u8, data: u8) {
        self.counter = match self.counter.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.events.push_front((code, data));
        self.events.truncate(5);
    }

    fn bill_id(&self, id: u8) -> String {
        match self.bill_ids.get(usize::from(id).wrapping_sub(1)) {
            Some((code, max_fill)) if !code.is_empty() => format!(
                "{}A{:04}{:04}2",
                code,
                self.fill_sizes[usize::from(id) - 1],
                max_fill
            ),
            _ => String::new(),
        }
    }

    fn event_buffer(&mut self) -> Vec<u8> {
        if let Some((code, data)) = self.pending.pop_front() {
            self.push_event(code, data);
        }
        let mut data = vec![self.counter];
        for i in 0..5 {
            let (code, value) = self.events.get(i).copied().unwrap_or((0, 0));
            data.extend([code, value]);
        }
        data
    }

    fn dispense(&mut self, request: &[u8]) -> Vec<u8> {
        let (count, slot) = (request[0], request[1]);
        if count == 0 {
            return vec![0];
        }
        if let Some(code) = self.refuse_dispense {
            return vec![code];
        }
        if self.jam_dispense {
            return vec![0];
        }
        let index = usize::from(slot).wrapping_sub(1);
        match self.fill_sizes.get_mut(index) {
            Some(fill) if *fill > 0 => {
                *fill -= 1;
                self.pending.push_back((0x30, 0));
                if !self.stall_dispense {
                    self.pending.extend([(0x2B, 0), (0x27, 0)]);
                }
                vec![0]
            }
            _ => vec![0xA7],
        }
    }

    fn respond(&mut self, request: &Message) -> Reply {
        let data = request.data();
        match request.header {
            254 => reply(&[]),
            1 => {
                for code in [0x20, 0x22, 0x27] {
                    self.push_event(code, 0);
                }
                reply(&[])
            }
            4 => reply(&[1, 4, 2]),
            242 => reply(&[0x01, 0x02, 0x03]),
            241 => {
                let revision = format!(
                    "{:<32}{:<32}{:<32}{:<32}",
                    "MD-100 V1.07", "ENC 2.1", "HEAD 3.4", "DISP 1.2"
                );
                reply(revision.as_bytes())
            }
            192 => reply(b"B01"),
            244 => reply(b"MD-100"),
            245 => reply(b"Bill Validator"),
            246 => reply(b"SUZO"),
            159 => {
                let buffer = self.event_buffer();
                reply(&buffer)
            }
            213 => reply(&[0x01]),
            156 => reply(&[0x01, 0x00, 0x02]),
            197 => reply(&[1, 2, 3, 4, 5, 6, 7, 8]),
            145 => reply(b"RU01"),
            157 => {
                let id = self.bill_id(data.first().copied().unwrap_or(0));
                reply(id.as_bytes())
            }
            158 => {
                let id = usize::from(data[0]);
                let value = String::from_utf8_lossy(&data[1..]).into_owned();
                let max_fill = value[11..15].parse().unwrap_or(0);
                self.bill_ids[id - 1] = (value[..6].to_string(), max_fill);
                self.pending.push_back((0x2F, 0));
                reply(&[])
            }
            153 => {
                self.mode = data[0];
                let event = match data[0] & 0x30 {
                    0x10 => 0x2D,
                    0x20 => 0x2C,
                    _ => 0x2E,
                };
                self.pending.push_back((event, 0));
                reply(&[])
            }
            152 => reply(&[self.mode]),
            231 => {
                if !self.ignore_inhibit {
                    self.inhibit.copy_from_slice(&data[..3]);
                }
                reply(&[])
            }
            230 => reply(&self.inhibit),
            228 => {
                self.master_accept = data[0] == 1;
                let settled = if self.master_accept { 0x29 } else { 0x28 };
                self.pending.extend([(0x27, 0), (settled, 0)]);
                reply(&[])
            }
            95 => {
                self.clock = Some(String::from_utf8_lossy(data).into_owned());
                reply(&[])
            }
            94 => {
                let sizes: Vec<u8> = self.fill_sizes.iter().flat_map(|s| s.to_be_bytes()).collect();
                reply(&sizes)
            }
            97 => {
                let result = self.dispense(data);
                reply(&result)
            }
            _ => reply(&[]),
        }
    }
}

impl Default for SimState {
    fn default() -> Self {
        let mut bill_ids = vec![(String::new(), 0); BILL_TYPES];
        for (id, value) in [(1, "0010"), (2, "0050"), (3, "0100"), (4, "0500"), (5, "1000"), (6, "5000")] {
            bill_ids[id - 1] = (format!("RU{value}"), 0);
        }
        for (id, value) in [(18, "0100"), (19, "0500"), (20, "1000")] {
            bill_ids[id - 1] = (format!("RU{value}"), 300);
        }
        let mut fill_sizes = [0; BILL_TYPES];
        fill_sizes[17] = 12;
        fill_sizes[18] = 5;

        let mut state = Self {
            counter: 0,
            events: VecDeque::new(),
            pending: VecDeque::new(),
            inhibit: [0; 3],
            master_accept: false,
            mode: 0,
            bill_ids,
            fill_sizes,
            clock: None,
            ignore_inhibit: false,
            stall_dispense: false,
            refuse_dispense: None,
            jam_dispense: false,
        };
        state.push_event(0x27, 0);
        state
    }
}

/// Scripted MD-100 on a simulated bus
#[derive(Clone, Default)]
pub struct SimulatedMd100 {
    pub state: Arc<Mutex<SimState>>,
}

impl SimulatedMd100 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue events the device reports on the following polls
    pub fn schedule(&self, events: &[(u8, u8)]) {
        self.state.lock().pending.extend(events.iter().copied());
    }

    /// Bus with echo on the line and this device answering
    pub fn bus(&self) -> Arc<FakeBus> {
        let sim = self.clone();
        FakeBus::new(true, move |request| sim.state.lock().respond(request))
    }

    pub fn fill_size(&self, id: u8) -> u16 {
        self.state.lock().fill_sizes[usize::from(id) - 1]
    }
}

/// Simulated MD-100 behind a connected master, device handle not yet polling
pub async fn md100_rig(sim: &SimulatedMd100) -> (Arc<FakeBus>, Arc<MasterDevice>, Arc<Md100>) {
    let bus = sim.bus();
    let master = connected_master(&bus).await;
    let slave = master.add_slave(DEVICE).with_timeout(COMMAND_TIMEOUT);
    let options = Md100Options {
        poll_interval: POLL_INTERVAL,
        ..Md100Options::default()
    };
    let device = Md100::new(slave, options);
    (bus, master, device)
}

/// Wait up to a second for `condition`
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

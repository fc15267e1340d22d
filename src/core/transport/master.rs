//! Bus master: the transport engine
//!
//! Every send/receive pair goes through one exchange lock so polling and
//! macro operations never interleave on the wire mid-frame. A separate lock
//! guards the line handle itself against concurrent open/close.

use super::{
    BusyFlag, LineFactory, MasterState, SerialConfig, SerialLine, SerialLineFactory,
    TransportError, TransportStats,
};
use crate::core::device::SlaveDevice;
use crate::core::protocol::{expected_frame_len, Message};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Default address of the master on the bus
pub const DEFAULT_MASTER_ADDRESS: u8 = 1;

/// Default per-command timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Pause between opening the port and the first exchange
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Direction of a message on the line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    /// Written by this master
    Sent,
    /// Read from the bus
    Received,
}

/// Last message seen on the line
#[derive(Debug, Clone)]
pub struct LineTraffic {
    /// Direction
    pub direction: TrafficDirection,
    /// The message (best-effort for truncated replies)
    pub message: Message,
}

/// ccTalk bus master
pub struct MasterDevice {
    address: u8,
    factory: Arc<dyn LineFactory>,
    settings: RwLock<Option<SerialConfig>>,
    settle_delay: Duration,
    /// Line-access lock: guards the handle for open/close and each I/O step
    line: tokio::sync::Mutex<Option<Box<dyn SerialLine>>>,
    /// Exchange lock: one send/receive pair at a time
    exchange: tokio::sync::Mutex<()>,
    busy: BusyFlag,
    connected: AtomicBool,
    last_sent: Mutex<Option<Bytes>>,
    stats: RwLock<TransportStats>,
    traffic_tx: broadcast::Sender<LineTraffic>,
    slaves: Mutex<Vec<u8>>,
    shutdown: CancellationToken,
}

impl MasterDevice {
    /// Create a master that opens real serial ports
    pub fn new(address: u8) -> Self {
        Self::with_factory(address, Arc::new(SerialLineFactory))
    }

    /// Create a master on top of a custom line factory
    pub fn with_factory(address: u8, factory: Arc<dyn LineFactory>) -> Self {
        let (traffic_tx, _) = broadcast::channel(256);
        Self {
            address,
            factory,
            settings: RwLock::new(None),
            settle_delay: DEFAULT_SETTLE_DELAY,
            line: tokio::sync::Mutex::new(None),
            exchange: tokio::sync::Mutex::new(()),
            busy: BusyFlag::default(),
            connected: AtomicBool::new(false),
            last_sent: Mutex::new(None),
            stats: RwLock::new(TransportStats::default()),
            traffic_tx,
            slaves: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the delay between opening the port and using it
    #[must_use]
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Master address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Current busy state
    pub fn state(&self) -> MasterState {
        self.busy.get()
    }

    /// Engine counters
    pub fn stats(&self) -> TransportStats {
        self.stats.read().clone()
    }

    /// Subscribe to every message sent or received
    pub fn subscribe(&self) -> broadcast::Receiver<LineTraffic> {
        self.traffic_tx.subscribe()
    }

    /// Store serial settings used by the next [`connect`](Self::connect)
    pub fn configure(&self, settings: SerialConfig) {
        *self.settings.write() = Some(settings);
    }

    /// Last stored serial settings
    pub fn settings(&self) -> Option<SerialConfig> {
        self.settings.read().clone()
    }

    /// Whether the line is open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Token cancelled by [`terminate`](Self::terminate)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// (Re)open the line with the last configured settings
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let settings = self.settings().ok_or(TransportError::NotConfigured)?;
        tracing::debug!("master connecting to {}", settings.connection_info());

        let mut line = self.line.lock().await;
        *line = None;
        tokio::time::sleep(self.settle_delay).await;
        let opened = self.factory.open(&settings).await?;
        tracing::info!("line open: {}", opened.describe());
        *line = Some(opened);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Close the line
    pub async fn disconnect(&self) {
        let mut line = self.line.lock().await;
        if line.take().is_some() {
            tracing::info!("line closed");
        }
        self.connected.store(false, Ordering::Release);
    }

    /// Register a slave at `address` on this bus
    pub fn add_slave(self: &Arc<Self>, address: u8) -> SlaveDevice {
        self.slaves.lock().push(address);
        SlaveDevice::new(address, Arc::clone(self))
    }

    /// Addresses of registered slaves
    pub fn slave_addresses(&self) -> Vec<u8> {
        self.slaves.lock().clone()
    }

    /// Stop every slave activity and close the line
    pub async fn terminate(&self) {
        self.shutdown.cancel();
        self.disconnect().await;
    }

    /// Write one message
    pub async fn send_command(&self, message: &Message, timeout: Duration) -> Result<(), TransportError> {
        let _exchange = self.exchange.lock().await;
        self.send_internal(message, timeout).await
    }

    /// Read one message
    pub async fn receive_message(&self, timeout: Duration) -> Result<Message, TransportError> {
        let _exchange = self.exchange.lock().await;
        self.receive_internal(timeout).await
    }

    /// Send a command to `address` and read its reply under one exclusive hold
    pub async fn exec_command(
        &self,
        address: u8,
        header: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let message = Message::new(address, self.address, header).with_data(data)?;
        let _exchange = self.exchange.lock().await;
        self.send_internal(&message, timeout).await?;
        self.receive_internal(timeout).await
    }

    async fn send_internal(&self, message: &Message, timeout: Duration) -> Result<(), TransportError> {
        let frame = message.encode();
        tracing::trace!("TX: {}", hex::encode_upper(&frame));
        let _busy = self.busy.begin(MasterState::Sending)?;

        *self.last_sent.lock() = Some(frame.clone());
        self.publish(TrafficDirection::Sent, message.clone());

        let mut guard = self.line.lock().await;
        let line = guard.as_mut().ok_or(TransportError::Unavailable)?;

        // a lost write only shows up as a receive timeout later
        let written = match line.discard_buffers() {
            Ok(()) => tokio::time::timeout(timeout, line.write_frame(&frame))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout))),
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => self.stats.write().frames_sent += 1,
            Err(e) => {
                tracing::debug!("write failed: {}", e);
                self.stats.write().write_errors += 1;
            }
        }
        Ok(())
    }

    async fn receive_internal(&self, timeout: Duration) -> Result<Message, TransportError> {
        tracing::trace!("receive, timeout {:?}", timeout);
        let _busy = self.busy.begin(MasterState::Receiving)?;
        let echo = self.last_sent.lock().clone();
        let mut buffer: Vec<u8> = Vec::with_capacity(64);

        let message = loop {
            let byte = match self.read_byte(timeout).await {
                Ok(byte) => byte,
                Err(TransportError::Timeout(_)) if buffer.is_empty() => {
                    tracing::debug!("slave device does not respond");
                    self.stats.write().no_response += 1;
                    return Err(TransportError::NoResponse);
                }
                Err(TransportError::Timeout(_)) => {
                    tracing::debug!("message is broken: {}", hex::encode_upper(&buffer));
                    self.stats.write().partial_frames += 1;
                    break Message::from_partial(&buffer);
                }
                Err(e) => return Err(e),
            };
            buffer.push(byte);

            if expected_frame_len(&buffer) != Some(buffer.len()) {
                continue;
            }
            if echo.as_deref() == Some(buffer.as_slice()) {
                tracing::trace!("echo skipped");
                self.stats.write().echoes_skipped += 1;
                buffer.clear();
                continue;
            }
            tracing::trace!("RX: {}", hex::encode_upper(&buffer));
            match Message::decode(&buffer) {
                Ok(message) => {
                    self.stats.write().frames_received += 1;
                    break message;
                }
                Err(e) => {
                    tracing::debug!("{}", e);
                    self.stats.write().checksum_errors += 1;
                    return Err(e);
                }
            }
        };

        self.publish(TrafficDirection::Received, message.clone());
        Ok(message)
    }

    async fn read_byte(&self, timeout: Duration) -> Result<u8, TransportError> {
        let mut guard = self.line.lock().await;
        let line = guard.as_mut().ok_or(TransportError::Unavailable)?;
        tokio::time::timeout(timeout, line.read_byte())
            .await
            .unwrap_or(Err(TransportError::Timeout(timeout)))
    }

    fn publish(&self, direction: TrafficDirection, message: Message) {
        // no subscribers is fine
        let _ = self.traffic_tx.send(LineTraffic { direction, message });
    }
}

impl std::fmt::Debug for MasterDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterDevice")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::super::MockSerialLine;
    use super::*;
    use async_trait::async_trait;

    struct MockFactory(Mutex<Option<MockSerialLine>>);

    #[async_trait]
    impl LineFactory for MockFactory {
        async fn open(&self, _config: &SerialConfig) -> Result<Box<dyn SerialLine>, TransportError> {
            self.0
                .lock()
                .take()
                .map(|line| Box::new(line) as Box<dyn SerialLine>)
                .ok_or(TransportError::ConnectionFailed("no line".into()))
        }
    }

    async fn connected_master(line: MockSerialLine) -> MasterDevice {
        let master = MasterDevice::with_factory(1, Arc::new(MockFactory(Mutex::new(Some(line)))))
            .settle_delay(Duration::ZERO);
        master.configure(SerialConfig::new("mock", 9600));
        master.connect().await.unwrap();
        master
    }

    fn quiet_line() -> MockSerialLine {
        let mut line = MockSerialLine::new();
        line.expect_describe().return_const("mock".to_string());
        line
    }

    #[tokio::test]
    async fn test_send_while_busy_fails_and_keeps_state() {
        let mut line = quiet_line();
        line.expect_write_frame().never();
        let master = connected_master(line).await;

        let _receiving = master.busy.begin(MasterState::Receiving).unwrap();
        let err = master
            .send_command(&Message::new(2, 1, 254), DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Busy(MasterState::Receiving)));
        assert_eq!(master.state(), MasterState::Receiving);

        let err = master.receive_message(DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, TransportError::Busy(MasterState::Receiving)));
        assert_eq!(master.state(), MasterState::Receiving);
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let mut line = quiet_line();
        line.expect_discard_buffers().times(1).returning(|| Ok(()));
        line.expect_write_frame()
            .times(1)
            .returning(|_| Err(TransportError::IoError(std::io::ErrorKind::BrokenPipe.into())));
        let master = connected_master(line).await;

        let result = master
            .send_command(&Message::new(2, 1, 254), DEFAULT_TIMEOUT)
            .await;
        assert!(result.is_ok());
        assert_eq!(master.state(), MasterState::Idle);
        assert_eq!(master.stats().write_errors, 1);
    }

    #[tokio::test]
    async fn test_send_discards_stale_input_first() {
        let mut seq = mockall::Sequence::new();
        let mut line = quiet_line();
        line.expect_discard_buffers()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        line.expect_write_frame()
            .withf(|frame| frame.to_vec() == vec![0x02, 0x00, 0x01, 0xFE, 0xFF])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let master = connected_master(line).await;

        master
            .send_command(&Message::new(2, 1, 254), DEFAULT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(master.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_unavailable_when_not_connected() {
        let master = MasterDevice::with_factory(1, Arc::new(MockFactory(Mutex::new(None))));
        let err = master
            .exec_command(2, 254, &[], DEFAULT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unavailable));
        assert_eq!(master.state(), MasterState::Idle);
    }

    #[tokio::test]
    async fn test_connect_requires_settings() {
        let master = MasterDevice::with_factory(1, Arc::new(MockFactory(Mutex::new(None))));
        assert!(matches!(
            master.connect().await,
            Err(TransportError::NotConfigured)
        ));
        assert!(!master.is_connected());
    }
}

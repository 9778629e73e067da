/// Modbus RTU slave server
///
/// The server owns one byte-duplex channel (a serial port in production, an
/// in-memory pipe in tests) and answers the requests a master sends over it.
/// Each cycle waits for a frame, validates it, dispatches it against the
/// shared register store and writes the response. Frames that fail the CRC,
/// are addressed to another unit or are malformed get no reply at all.
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use log::{debug, error, info, warn};

use crate::codec::{encode_response, FrameOutcome, IgnoreReason, RtuCodec, RtuFrameReader};
use crate::config::SimulatorConfig;
use crate::dispatcher::RequestDispatcher;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::{CallbackLogger, FrameDirection, LoggingMode};
use crate::protocol::SlaveId;
use crate::register_bank::{ModbusRegisterBank, RegisterBankStats};
use crate::transport::frame_gap;

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Start the server
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop the server
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;

    /// Get register bank reference
    fn get_register_bank(&self) -> Option<Arc<ModbusRegisterBank>>;
}

/// Where the slave is in its request cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    /// Waiting for the first byte of a frame
    #[default]
    Idle,
    /// Bytes of a frame are arriving, until the silence gap or its full length
    Receiving,
    /// Checking CRC, unit id and request shape
    Validating,
    /// Executing the request against the register store
    Dispatching,
    /// Writing the response frame
    Responding,
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub state: ServerState,
    /// Complete frames taken off the channel
    pub frames_received: u64,
    /// Requests that reached the dispatcher
    pub requests_dispatched: u64,
    /// Responses sent with the exception flag set
    pub exception_responses: u64,
    pub checksum_errors: u64,
    /// Frames dropped without reply (checksum, other unit, malformed)
    pub ignored_frames: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
    pub register_bank_stats: Option<RegisterBankStats>,
}

/// Modbus RTU server configuration
#[derive(Debug, Clone)]
pub struct ModbusRtuServerConfig {
    pub unit_id: SlaveId,
    /// Answer every unit id
    pub single: bool,
    /// Silence that ends a frame
    pub frame_gap: Duration,
    pub packet_logger: CallbackLogger,
}

impl Default for ModbusRtuServerConfig {
    fn default() -> Self {
        Self {
            unit_id: crate::DEFAULT_UNIT_ID,
            single: false,
            frame_gap: frame_gap(9600),
            packet_logger: CallbackLogger::disabled(),
        }
    }
}

impl From<&SimulatorConfig> for ModbusRtuServerConfig {
    fn from(config: &SimulatorConfig) -> Self {
        let packet_logger = if config.log_packets {
            CallbackLogger::console(LoggingMode::Both)
        } else {
            CallbackLogger::disabled()
        };

        Self {
            unit_id: config.unit_id,
            single: config.single,
            frame_gap: config.serial.frame_gap(),
            packet_logger,
        }
    }
}

/// Modbus RTU slave bound to one channel
pub struct ModbusRtuServer<C> {
    config: ModbusRtuServerConfig,
    register_bank: Arc<ModbusRegisterBank>,
    channel: Mutex<Option<C>>,
    stats: Arc<Mutex<ServerStats>>,
    running: Arc<AtomicBool>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    handle: Option<JoinHandle<ModbusResult<()>>>,
    start_time: Option<Instant>,
}

impl<C> ModbusRtuServer<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a server with default configuration answering to `unit_id`
    pub fn new(unit_id: SlaveId, channel: C, register_bank: Arc<ModbusRegisterBank>) -> Self {
        let config = ModbusRtuServerConfig {
            unit_id,
            ..Default::default()
        };
        Self::with_config(config, channel, register_bank)
    }

    /// Create a server with custom configuration
    pub fn with_config(config: ModbusRtuServerConfig, channel: C, register_bank: Arc<ModbusRegisterBank>) -> Self {
        Self {
            config,
            register_bank,
            channel: Mutex::new(Some(channel)),
            stats: Arc::new(Mutex::new(ServerStats::default())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            handle: None,
            start_time: None,
        }
    }

    /// Wait until the server loop ends
    ///
    /// Resolves with the loop's result: `Ok` after a shutdown, the transport
    /// error otherwise. Returns immediately if the server was never started.
    /// Cancelling this future leaves the loop running.
    pub async fn wait(&mut self) -> ModbusResult<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let result = handle.await;
        self.handle = None;
        self.running.store(false, Ordering::SeqCst);
        result.map_err(|e| ModbusError::internal(format!("Server task failed: {}", e)))?
    }
}

#[async_trait]
impl<C> ModbusServer for ModbusRtuServer<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&mut self) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(ModbusError::internal("Server is already running"));
        }

        let channel = self
            .channel
            .lock()
            .map_err(|_| ModbusError::internal("Failed to lock server channel"))?
            .take()
            .ok_or_else(|| ModbusError::internal("Server channel was already used"))?;

        info!("🚀 Starting Modbus RTU slave");
        if self.config.single {
            info!("   - Unit id: any (single mode)");
        } else {
            info!("   - Unit id: {}", self.config.unit_id);
        }
        info!("   - Frame gap: {:?}", self.config.frame_gap);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = RtuSession {
            channel,
            reader: RtuFrameReader::new(self.config.frame_gap),
            codec: RtuCodec::new(self.config.unit_id, self.config.single),
            dispatcher: RequestDispatcher::new(self.register_bank.clone()),
            stats: self.stats.clone(),
            packet_logger: self.config.packet_logger.clone(),
        };

        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);
        self.handle = Some(tokio::spawn(async move {
            let result = session.run(shutdown_rx).await;
            running.store(false, Ordering::SeqCst);
            result
        }));
        self.shutdown_tx = Some(shutdown_tx);
        self.start_time = Some(Instant::now());

        info!("✅ Modbus RTU slave started");
        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(());
        }

        if let Err(e) = self.wait().await {
            warn!("Server loop had ended with an error: {}", e);
        }

        info!("⏹️  Modbus RTU slave stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }

        stats.register_bank_stats = Some(self.register_bank.get_stats());
        stats
    }

    fn get_register_bank(&self) -> Option<Arc<ModbusRegisterBank>> {
        Some(self.register_bank.clone())
    }
}

/// State of one running slave loop
struct RtuSession<C> {
    channel: C,
    reader: RtuFrameReader,
    codec: RtuCodec,
    dispatcher: RequestDispatcher,
    stats: Arc<Mutex<ServerStats>>,
    packet_logger: CallbackLogger,
}

impl<C> RtuSession<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> ModbusResult<()> {
        loop {
            self.set_state(ServerState::Idle);

            // shutdown is only observed on an idle line, never mid-frame
            let arrived = tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received by RTU slave loop");
                    return Ok(());
                }
                result = self.reader.wait_for_data(&mut self.channel) => result,
            };

            let frame = match arrived {
                Ok(()) => {
                    self.set_state(ServerState::Receiving);
                    self.reader.read_frame(&mut self.channel).await
                }
                Err(e) => Err(e),
            };

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) if e.is_transport_error() => {
                    error!("Transport failure, stopping RTU slave: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Discarding frame: {}", e);
                    self.update_stats(|stats| stats.ignored_frames += 1);
                    continue;
                }
            };

            self.update_stats(|stats| {
                stats.frames_received += 1;
                stats.bytes_received += frame.len() as u64;
            });
            self.packet_logger.log_frame(FrameDirection::Rx, &frame);

            self.set_state(ServerState::Validating);
            let response = match self.codec.decode_request(&frame) {
                FrameOutcome::Request(request) => {
                    self.set_state(ServerState::Dispatching);
                    self.update_stats(|stats| stats.requests_dispatched += 1);
                    debug!(
                        "Request from master: unit {} {} address={} quantity={}",
                        request.slave_id, request.function, request.address, request.quantity
                    );
                    self.dispatcher.dispatch(&request)
                }
                FrameOutcome::Exception(response) => response,
                FrameOutcome::Ignore(reason) => {
                    self.record_ignored(&reason);
                    continue;
                }
            };

            self.set_state(ServerState::Responding);
            let bytes = encode_response(&response);
            self.channel
                .write_all(&bytes)
                .await
                .map_err(|e| ModbusError::io(format!("Serial write error: {}", e)))?;
            self.channel
                .flush()
                .await
                .map_err(|e| ModbusError::io(format!("Serial flush error: {}", e)))?;

            self.packet_logger.log_frame(FrameDirection::Tx, &bytes);
            self.update_stats(|stats| {
                stats.bytes_sent += bytes.len() as u64;
                if response.is_exception() {
                    stats.exception_responses += 1;
                }
            });
        }
    }

    fn record_ignored(&self, reason: &IgnoreReason) {
        match reason {
            IgnoreReason::ChecksumMismatch { .. } => {
                warn!("Dropping frame: {}", reason);
                self.update_stats(|stats| {
                    stats.checksum_errors += 1;
                    stats.ignored_frames += 1;
                });
            }
            IgnoreReason::NotAddressedToMe { .. } => {
                debug!("Ignoring frame {}", reason);
                self.update_stats(|stats| stats.ignored_frames += 1);
            }
            IgnoreReason::Malformed { .. } => {
                warn!("Dropping frame: {}", reason);
                self.update_stats(|stats| stats.ignored_frames += 1);
            }
        }
    }

    fn set_state(&self, state: ServerState) {
        self.update_stats(|stats| {
            if stats.state != state {
                debug!("RTU slave state: {:?} -> {:?}", stats.state, state);
                stats.state = state;
            }
        });
    }

    fn update_stats<F: FnOnce(&mut ServerStats)>(&self, update: F) {
        match self.stats.lock() {
            Ok(mut stats) => update(&mut *stats),
            Err(poisoned) => update(&mut *poisoned.into_inner()),
        }
    }
}

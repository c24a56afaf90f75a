use crate::{
    ble::{BleScanner, BleTransport},
    codec::codec_for,
    error::{Result, ScaleError},
    session::{Session, SessionEnv},
    transport::{Transport, TransportCommand, TransportEvent},
    types::{ConnectionParams, ConnectionStatus, DeviceInfo, TimeoutConfig},
};
use std::{collections::VecDeque, time::Duration};
use tokio::{
    sync::mpsc,
    time::{interval_at, sleep_until, timeout, Instant},
};
use tracing::{debug, error, info, warn};

/// Drives one protocol session against a transport
///
/// `ScaleDevice` owns the transport and the session. It connects when the
/// family needs a connection, executes the commands the session queues,
/// feeds every transport event back one at a time, and fires the keep-alive
/// hook for families that need one. The run ends when the session
/// terminates, when the scale stays silent for the idle timeout, or when the
/// transport fails.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use scalers::{
///     BleScanner, ChannelSink, ConnectionParams, MemorySettings, ScaleDevice, ScaleUser,
///     SessionEnv, TimeoutConfig,
/// };
///
/// # async fn run(user: ScaleUser) -> Result<(), Box<dyn std::error::Error>> {
/// let scanner = BleScanner::new().await?;
/// let params = ConnectionParams::default();
/// let device = scanner.scan(&params).await?.into_iter().next().ok_or("no scale")?;
///
/// let (sink, mut measurements) = ChannelSink::channel();
/// let env = SessionEnv::new(device.clone(), user, Arc::new(sink), Arc::new(MemorySettings::new()));
///
/// let scale = ScaleDevice::open(&scanner, &device, env, &params, TimeoutConfig::default()).await?;
/// let emitted = scale.run().await?;
/// println!("{emitted} measurement(s)");
/// while let Ok(event) = measurements.try_recv() {
///     println!("{event:?}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct ScaleDevice<T: Transport> {
    transport: T,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    session: Session,
    timeouts: TimeoutConfig,
    connect_retries: u32,
}

impl ScaleDevice<BleTransport> {
    /// Pick the codec for a scanned device and prepare its BLE transport
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::UnsupportedDevice`] if no family matches the
    /// device, or any error from [`BleScanner::transport`].
    pub async fn open(
        scanner: &BleScanner,
        device: &DeviceInfo,
        env: SessionEnv,
        params: &ConnectionParams,
        timeouts: TimeoutConfig,
    ) -> Result<Self> {
        let session = Session::new(codec_for(device)?, env);
        let (transport, events) = scanner
            .transport(device, params, !session.requires_connection())
            .await?;
        Ok(Self::new(transport, events, session, timeouts)
            .with_connect_retries(params.retry_attempts))
    }
}

impl<T: Transport> ScaleDevice<T> {
    /// Bind a session to a transport and the stream of its events
    #[must_use]
    pub const fn new(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        session: Session,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            transport,
            events,
            session,
            timeouts,
            connect_retries: 0,
        }
    }

    /// Try connecting this many more times after a failed attempt
    #[must_use]
    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// The session being driven
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Run the session to its end and return the number of measurements emitted
    ///
    /// # Errors
    ///
    /// Returns the last connection error if the link cannot be opened within the
    /// configured retries, or the first transport error while executing a
    /// command. The session is flushed and the link closed before a command
    /// error is returned.
    pub async fn run(mut self) -> Result<usize> {
        if self.session.requires_connection() {
            self.connect().await?;
        } else {
            debug!("Listening for advertisements only");
        }

        let commands = self.session.start();
        self.execute(commands).await?;

        let idle = Duration::from_millis(self.timeouts.idle_timeout_ms);
        let mut deadline = Instant::now() + idle;
        let keep_alive = self.session.keep_alive_interval();
        let period = keep_alive.unwrap_or(idle);
        let mut ticker = interval_at(Instant::now() + period, period);

        while !self.session.is_terminated() {
            let commands = tokio::select! {
                event = self.events.recv() => {
                    deadline = Instant::now() + idle;
                    if let Some(event) = event {
                        self.session.handle_event(event)
                    } else {
                        warn!("Transport event stream closed");
                        self.session
                            .handle_event(TransportEvent::Status(ConnectionStatus::Disconnected))
                    }
                }
                _ = ticker.tick(), if keep_alive.is_some() => self.session.keep_alive(),
                () = sleep_until(deadline) => {
                    warn!(
                        "Scale silent for {}ms, disconnecting",
                        self.timeouts.idle_timeout_ms
                    );
                    self.session.disconnect()
                }
            };
            self.execute(commands).await?;
        }

        info!(
            "Session with {} ended, {} measurement(s)",
            self.session.env().device.name,
            self.session.emitted()
        );
        Ok(self.session.emitted())
    }

    async fn connect(&mut self) -> Result<()> {
        let retries = self.connect_retries;
        let mut attempt = 0;

        loop {
            match self.transport.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        "Connecting failed on attempt {}/{}, retrying in {}ms: {}",
                        attempt,
                        retries + 1,
                        self.timeouts.retry_delay_ms,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(self.timeouts.retry_delay_ms)).await;
                }
                Err(e) => {
                    error!("Connecting failed after {} attempt(s): {}", attempt + 1, e);
                    return Err(e);
                }
            }
        }
    }

    async fn execute(&mut self, commands: Vec<TransportCommand>) -> Result<()> {
        let timeout_ms = self.timeouts.command_timeout_ms;
        let mut queue: VecDeque<TransportCommand> = commands.into();

        while let Some(command) = queue.pop_front() {
            debug!("Executing {:?}", command);
            let result = timeout(
                Duration::from_millis(timeout_ms),
                self.transport.execute(&command),
            )
            .await
            .unwrap_or(Err(ScaleError::Timeout { timeout_ms }));

            match result {
                Ok(Some(event)) => queue.extend(self.session.handle_event(event)),
                Ok(None) => {}
                Err(e) if command == TransportCommand::Disconnect => {
                    warn!("Disconnect failed: {}", e);
                }
                Err(e) => {
                    error!("{:?} failed: {}", command, e);
                    self.abort().await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn abort(&mut self) {
        // the flushed measurement is saved, the queued disconnect is done here
        let _ = self.session.disconnect();
        if let Err(e) = self.transport.disconnect().await {
            warn!("Disconnect after failure failed: {}", e);
        }
    }
}

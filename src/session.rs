//! One connection's protocol run, free of any I/O.
//!
//! A [`Session`] binds a codec to a step sequencer and the host's
//! collaborators. Every entry point returns the transport commands the
//! caller must execute, in order; inbound data is fed back through
//! [`Session::handle_event`] one event at a time.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bodycomp::BodyProfile;
use crate::codec::{CodecContext, Decoded, DeviceCodec, DeviceFamily};
use crate::measurement::Measurement;
use crate::sequencer::{SequencerState, StepSequencer};
use crate::settings::{RemoteUsers, SettingsStore};
use crate::sink::MeasurementSink;
use crate::transport::{TransportCommand, TransportEvent};
use crate::types::{ConnectionStatus, DeviceInfo, InfoCode, ScaleUser};

/// Collaborators and inputs a session runs against
#[derive(Clone)]
pub struct SessionEnv {
    /// The scale being talked to
    pub device: DeviceInfo,
    /// Profile selected in the host application
    pub user: ScaleUser,
    /// Every local profile, for scales that keep several users
    pub users: Vec<ScaleUser>,
    /// Receiver of measurements and info messages
    pub sink: Arc<dyn MeasurementSink>,
    /// Persistent key-value store
    pub settings: Arc<dyn SettingsStore>,
    /// Fixed clock, `None` for the system clock
    pub clock: Option<DateTime<Utc>>,
}

impl SessionEnv {
    /// Environment with the selected user as the only local profile
    #[must_use]
    pub fn new(
        device: DeviceInfo,
        user: ScaleUser,
        sink: Arc<dyn MeasurementSink>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            device,
            users: vec![user.clone()],
            user,
            sink,
            settings,
            clock: None,
        }
    }

    /// Replace the list of local profiles
    #[must_use]
    pub fn with_users(mut self, users: Vec<ScaleUser>) -> Self {
        self.users = users;
        self
    }

    /// Pin the clock
    #[must_use]
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.clock = Some(now);
        self
    }

    /// Current time
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    /// Slot map and secrets of this device
    #[must_use]
    pub fn remote_users(&self) -> RemoteUsers {
        RemoteUsers::new(self.settings.clone(), self.device.settings_key())
    }

    /// Body composition inputs for the selected user, as of today
    #[must_use]
    pub fn body_profile(&self) -> BodyProfile {
        BodyProfile::from_user(&self.user, self.user.age_on(self.now().date_naive()))
    }

    /// Local profile by id
    #[must_use]
    pub fn find_user(&self, id: u32) -> Option<&ScaleUser> {
        self.users.iter().find(|u| u.id == id)
    }
}

impl std::fmt::Debug for SessionEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEnv")
            .field("device", &self.device)
            .field("user", &self.user.id)
            .field("users", &self.users.len())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Protocol run for one connection
pub struct Session {
    codec: Box<dyn DeviceCodec>,
    env: SessionEnv,
    sequencer: StepSequencer,
    started: bool,
    terminated: bool,
    emitted: usize,
}

impl Session {
    /// Bind a codec to an environment
    #[must_use]
    pub fn new(codec: Box<dyn DeviceCodec>, env: SessionEnv) -> Self {
        Self {
            codec,
            env,
            sequencer: StepSequencer::new(),
            started: false,
            terminated: false,
            emitted: 0,
        }
    }

    /// Family of the codec
    #[must_use]
    pub fn family(&self) -> DeviceFamily {
        self.codec.family()
    }

    /// Whether the codec needs a GATT connection
    #[must_use]
    pub fn requires_connection(&self) -> bool {
        self.codec.requires_connection()
    }

    /// Interval at which [`keep_alive`](Self::keep_alive) should be called
    #[must_use]
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.codec.keep_alive_interval()
    }

    /// Environment the session runs against
    #[must_use]
    pub const fn env(&self) -> &SessionEnv {
        &self.env
    }

    /// Step that ran last
    #[must_use]
    pub const fn current_step(&self) -> Option<usize> {
        self.sequencer.control().current()
    }

    /// Whether the sequence waits for the device
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.sequencer.control().is_waiting()
    }

    /// Whether the session has ended
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Measurements handed to the sink so far
    #[must_use]
    pub const fn emitted(&self) -> usize {
        self.emitted
    }

    /// Run the sequence from step 0 until it first waits
    pub fn start(&mut self) -> Vec<TransportCommand> {
        let mut outbox = Vec::new();
        if self.started || self.terminated {
            warn!("Session already started");
            return outbox;
        }
        self.started = true;
        info!("Starting {} session with {}", self.family(), self.env.device.name);

        self.advance(&mut outbox);
        outbox
    }

    /// Feed one transport event
    pub fn handle_event(&mut self, event: TransportEvent) -> Vec<TransportCommand> {
        let mut outbox = Vec::new();
        if self.terminated {
            debug!("Ignoring {:?} after session end", event);
            return outbox;
        }

        match event {
            TransportEvent::Notify {
                characteristic,
                data,
            }
            | TransportEvent::Value {
                characteristic,
                data,
            } => {
                debug!("Received on {}: {:02X?}", characteristic, data);
                self.on_data(characteristic, &data, &mut outbox);
            }
            TransportEvent::Status(ConnectionStatus::Disconnected) => {
                info!("Link to {} lost", self.env.device.name);
                self.terminate(&mut outbox, false);
            }
            TransportEvent::Status(status) => debug!("Connection status {}", status),
        }

        outbox
    }

    /// Periodic hook for codecs that need one
    pub fn keep_alive(&mut self) -> Vec<TransportCommand> {
        let mut outbox = Vec::new();
        if self.terminated || !self.started {
            return outbox;
        }

        let mut ctx = CodecContext::new(self.sequencer.control_mut(), &mut outbox, &self.env);
        self.codec.on_keep_alive(&mut ctx);
        for measurement in ctx.into_released() {
            self.emit(measurement);
        }
        self.settle(&mut outbox);
        outbox
    }

    /// End the session now, flushing whatever the protocol allows saving
    pub fn disconnect(&mut self) -> Vec<TransportCommand> {
        let mut outbox = Vec::new();
        if !self.terminated {
            info!("Disconnect requested at step {:?}", self.current_step());
            self.terminate(&mut outbox, true);
        }
        outbox
    }

    fn on_data(
        &mut self,
        characteristic: uuid::Uuid,
        data: &[u8],
        outbox: &mut Vec<TransportCommand>,
    ) {
        let mut ctx = CodecContext::new(self.sequencer.control_mut(), outbox, &self.env);
        let decoded = self.codec.decode(characteristic, data, &mut ctx);
        for measurement in ctx.into_released() {
            self.emit(measurement);
        }

        match decoded {
            Ok(Decoded::Ready(measurement)) => self.emit(measurement),
            Ok(Decoded::Waiting) => {}
            Err(e) if e.is_packet_error() => {
                warn!("Discarding packet {:02X?}: {}", data, e);
            }
            Err(e) => {
                error!("Ending session: {}", e);
                let step = self.current_step().map_or(-1, |s| i64::try_from(s).unwrap_or(-1));
                self.env.sink.report_info(InfoCode::SessionFailed, step);
                self.sequencer.control_mut().finish();
            }
        }
        self.settle(outbox);
    }

    /// Continue the sequence if a codec call resumed it, end the session if it finished
    fn settle(&mut self, outbox: &mut Vec<TransportCommand>) {
        let control = self.sequencer.control();
        if control.is_finished() {
            self.terminate(outbox, true);
        } else if !control.is_waiting() {
            self.advance(outbox);
        }
    }

    fn advance(&mut self, outbox: &mut Vec<TransportCommand>) {
        let codec = &mut self.codec;
        let env = &self.env;
        let mut released = Vec::new();
        let state = self.sequencer.run(|step, control| {
            let mut ctx = CodecContext::new(control, outbox, env);
            let more = codec.on_step(step, &mut ctx);
            released.extend(ctx.into_released());
            more
        });
        for measurement in released {
            self.emit(measurement);
        }

        if state == SequencerState::Finished {
            self.terminate(outbox, true);
        }
    }

    fn terminate(&mut self, outbox: &mut Vec<TransportCommand>, link_up: bool) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        self.sequencer.control_mut().finish();

        if let Some(measurement) = self.codec.flush(&self.env) {
            info!("Saving unconfirmed measurement on disconnect");
            self.emit(measurement);
        }

        if link_up {
            outbox.push(TransportCommand::Disconnect);
        }
        info!(
            "Session with {} ended, {} measurement(s) emitted",
            self.env.device.name, self.emitted
        );
    }

    fn emit(&mut self, measurement: Measurement) {
        info!(
            "Measurement: {:.2} kg for user {:?}",
            measurement.weight_kg, measurement.user_id
        );
        self.emitted += 1;
        self.env.sink.emit(measurement);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("family", &self.codec.family())
            .field("control", self.sequencer.control())
            .field("terminated", &self.terminated)
            .field("emitted", &self.emitted)
            .finish_non_exhaustive()
    }
}

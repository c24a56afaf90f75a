//! Huawei AH100 (and the CH100 it is sold as elsewhere).
//!
//! Every command body is obfuscated with the device address; bodies carrying
//! user data are additionally AES-CTR encrypted with a key that only exists
//! after the scale accepted our authentication code. Frames look like
//! `[0xDB, body length, command, body...]`.
//!
//! The authentication code is created when the user is bound to the scale
//! (the user confirms on the scale itself) and kept in the settings store.
//! Without a stored code, or after repeated authentication failures, the
//! session falls back to binding.

use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cipher::{obfuscate, SessionKey};
use crate::codec::{CodecContext, Decoded, DeviceCodec, DeviceFamily};
use crate::error::{Result, ScaleError};
use crate::framing::{read_u16, read_u32, sum_checksum, Endian};
use crate::measurement::{Measurement, PendingMeasurement};
use crate::session::SessionEnv;
use crate::transport::uuid16;
use crate::types::InfoCode;

/// Primary service
pub const SERVICE: u16 = 0xFAA0;
const WRITE_CHARACTERISTIC: u16 = 0xFAA1;
const NOTIFY_CHARACTERISTIC: u16 = 0xFAA2;

const MAGIC: u8 = 0xDB;

const CMD_WAKEUP: u8 = 0x00;
const CMD_USER_INFO: u8 = 0x09;
const CMD_MEASUREMENT: u8 = 0x0E;
const CMD_HEARTBEAT: u8 = 0x20;
const CMD_AUTH: u8 = 0x24;
const CMD_BIND: u8 = 0x25;

const RESULT_SUCCESS: u8 = 0x01;

const INITIAL_KEY: [u8; 16] = [
    0x3D, 0xA2, 0x78, 0x4A, 0xFB, 0x87, 0xB1, 0x2A, 0x98, 0x0F, 0xDE, 0x34, 0x56, 0x73, 0x21,
    0x56,
];
const IV: [u8; 16] = [
    0x4E, 0xF7, 0x64, 0x32, 0x2F, 0xDA, 0x76, 0x32, 0x12, 0x3D, 0xEB, 0x87, 0x90, 0xFE, 0xA2,
    0x19,
];

const AUTH_CODE_LEN: usize = 8;
const AUTH_CODE_SECRET: &str = "auth_code";
const MEASUREMENT_LEN: usize = 16;

const STEP_HEARTBEAT: usize = 1;
const STEP_AUTH: usize = 2;
const STEP_USER_INFO: usize = 3;
const STEP_MEASURE: usize = 4;
const STEP_BIND: usize = 10;

/// Family constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuaweiConfig {
    /// Authentication failures before the session binds anew
    pub max_auth_attempts: u32,
    /// The scale sleeps if it hears nothing for a while
    pub keep_alive_interval: Duration,
}

impl Default for HuaweiConfig {
    fn default() -> Self {
        Self {
            max_auth_attempts: 3,
            keep_alive_interval: Duration::from_secs(5),
        }
    }
}

/// Compute the authentication code binding a user to a scale
///
/// The code is the first eight bytes of the MD5 digest over the device
/// address followed by the little-endian local user id. The same user on the
/// same scale always gets the same code, so a lost settings entry can be
/// recovered by binding again.
#[must_use]
pub fn auth_code(mac: &[u8; 6], user_id: u32) -> [u8; AUTH_CODE_LEN] {
    let mut hasher = md5::Context::new();
    hasher.consume(mac);
    hasher.consume(user_id.to_le_bytes());
    let digest = hasher.finalize().0;

    let mut code = [0u8; AUTH_CODE_LEN];
    code.copy_from_slice(&digest[..AUTH_CODE_LEN]);
    code
}

/// Codec for the encrypted Huawei scales
#[derive(Debug)]
pub struct HuaweiCodec {
    config: HuaweiConfig,
    mac: [u8; 6],
    auth_code: Option<Vec<u8>>,
    key: Option<SessionKey>,
    auth_failures: u32,
    enrolled: bool,
}

impl HuaweiCodec {
    /// Codec with the given constants
    #[must_use]
    pub const fn new(config: HuaweiConfig) -> Self {
        Self {
            config,
            mac: [0; 6],
            auth_code: None,
            key: None,
            auth_failures: 0,
            enrolled: false,
        }
    }

    /// Whether a session key has been derived
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }

    fn frame(&self, command: u8, body: &[u8]) -> Vec<u8> {
        let len = u8::try_from(body.len()).unwrap_or(u8::MAX);
        let mut frame = vec![MAGIC, len, command];
        frame.extend(obfuscate(body, &self.mac));
        frame
    }

    fn send(&self, ctx: &mut CodecContext<'_>, command: u8, body: &[u8]) {
        ctx.write(
            uuid16(SERVICE),
            uuid16(WRITE_CHARACTERISTIC),
            self.frame(command, body),
        );
    }

    /// Encrypt and send a command. Nothing is sent without a session key.
    fn send_encrypted(&self, ctx: &mut CodecContext<'_>, command: u8, plain: &[u8]) -> Result<()> {
        let key = self.key.as_ref().ok_or(ScaleError::NotAuthenticated)?;
        self.send(ctx, command, &key.encrypt(plain, &IV));
        Ok(())
    }

    fn user_info(env: &SessionEnv) -> Vec<u8> {
        let user = &env.user;
        let age = user.age_on(env.now().date_naive());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let (height, weight) = (
            user.height_cm.round().clamp(0.0, 255.0) as u8,
            (user.initial_weight_kg * 10.0).round().clamp(0.0, 65535.0) as u16,
        );

        let mut plain = vec![
            height,
            u8::try_from(age).unwrap_or(u8::MAX),
            u8::from(user.gender.is_male()),
        ];
        plain.extend_from_slice(&weight.to_be_bytes());
        plain
    }

    fn authenticate(&mut self, ctx: &mut CodecContext<'_>) {
        let env = ctx.env();
        let stored = env.remote_users().user_secret(env.user.id, AUTH_CODE_SECRET);
        match stored {
            Ok(Some(code)) if code.len() == AUTH_CODE_LEN => {
                debug!("Authenticating user {}", env.user.id);
                self.send(ctx, CMD_AUTH, &code);
                self.auth_code = Some(code);
                ctx.stop();
            }
            Ok(_) => {
                info!("No authentication code for user {}, binding", env.user.id);
                ctx.jump_to(STEP_BIND);
            }
            Err(e) => {
                warn!("Could not load the authentication code, binding: {}", e);
                ctx.jump_to(STEP_BIND);
            }
        }
    }

    fn bind(&mut self, ctx: &mut CodecContext<'_>) {
        let user_id = ctx.env().user.id;
        let code = auth_code(&self.mac, user_id);
        info!("Binding user {} to the scale", user_id);

        self.send(ctx, CMD_BIND, &code);
        self.auth_code = Some(code.to_vec());
        ctx.report_info(InfoCode::ConfirmOnScale, 0);
        ctx.stop();
    }

    fn on_auth_result(&mut self, result: u8, ctx: &mut CodecContext<'_>) -> Result<()> {
        if !ctx.is_at(STEP_AUTH) {
            debug!("Ignoring authentication result outside the handshake");
            return Ok(());
        }

        if result == RESULT_SUCCESS {
            let code = self.auth_code.as_deref().ok_or(ScaleError::NotAuthenticated)?;
            self.key = Some(SessionKey::derive(code, &self.mac, &INITIAL_KEY)?);
            self.auth_failures = 0;
            info!("Authenticated");
            ctx.resume();
            return Ok(());
        }

        self.auth_failures += 1;
        let attempt = i64::from(self.auth_failures);
        if self.enrolled {
            // a freshly bound code was refused, binding again will not help
            ctx.fail(InfoCode::AuthenticationFailed, attempt);
            return Ok(());
        }

        ctx.report_info(InfoCode::AuthenticationFailed, attempt);
        if self.auth_failures < self.config.max_auth_attempts {
            warn!("Authentication attempt {} failed, retrying", attempt);
            ctx.retry();
        } else {
            warn!("Authentication failed {} times, binding anew", attempt);
            ctx.resume_at(STEP_BIND);
        }
        Ok(())
    }

    fn on_bind_result(&mut self, result: u8, ctx: &mut CodecContext<'_>) -> Result<()> {
        if !ctx.is_at(STEP_BIND) {
            debug!("Ignoring bind result outside enrolment");
            return Ok(());
        }
        if result != RESULT_SUCCESS {
            ctx.fail(InfoCode::EnrollmentFailed, i64::from(result));
            return Ok(());
        }

        let env = ctx.env();
        let code = self.auth_code.as_deref().ok_or_else(|| {
            ScaleError::Protocol("bind confirmed without a pending code".to_string())
        })?;
        env.remote_users()
            .set_user_secret(env.user.id, AUTH_CODE_SECRET, code)?;

        self.enrolled = true;
        self.auth_failures = 0;
        ctx.report_info(InfoCode::PairingComplete, 0);
        ctx.resume_at(STEP_AUTH);
        Ok(())
    }

    fn on_measurement(&mut self, body: &[u8], ctx: &mut CodecContext<'_>) -> Result<Decoded> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| ScaleError::Cipher("measurement before authentication".to_string()))?;
        let plain = key.decrypt(body, &IV);
        if plain.len() < MEASUREMENT_LEN {
            return Err(ScaleError::Cipher(format!(
                "measurement has {} of {MEASUREMENT_LEN} bytes",
                plain.len()
            )));
        }
        let expected = sum_checksum(&plain, 0, MEASUREMENT_LEN - 1);
        if plain[MEASUREMENT_LEN - 1] != expected {
            return Err(ScaleError::Cipher(format!(
                "measurement checksum {:02X}, expected {expected:02X}",
                plain[MEASUREMENT_LEN - 1]
            )));
        }

        let seconds = read_u32(&plain, 7, Endian::Big)?;
        let pending = PendingMeasurement {
            device_user: Some(u64::from(plain[0])),
            weight_kg: Some(f32::from(read_u16(&plain, 1, Endian::Big)?) / 100.0),
            impedance: Some(f32::from(read_u16(&plain, 3, Endian::Big)?)),
            fat_percent: Some(f32::from(read_u16(&plain, 5, Endian::Big)?) / 10.0),
            timestamp: chrono::DateTime::from_timestamp(i64::from(seconds), 0)
                .filter(|_| seconds != 0),
            ..Default::default()
        };

        self.send_encrypted(ctx, CMD_MEASUREMENT, &[RESULT_SUCCESS])?;
        if ctx.is_at(STEP_MEASURE) {
            ctx.resume();
        }

        let env = ctx.env();
        Ok(pending
            .finalize(Some(env.user.id), env.now())
            .map_or(Decoded::Waiting, Decoded::Ready))
    }
}

impl DeviceCodec for HuaweiCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Huawei
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        Some(self.config.keep_alive_interval)
    }

    fn on_step(&mut self, step: usize, ctx: &mut CodecContext<'_>) -> bool {
        match step {
            0 => match ctx.env().device.mac_bytes() {
                Ok(mac) => {
                    self.mac = mac;
                    ctx.subscribe_notify(uuid16(SERVICE), uuid16(NOTIFY_CHARACTERISTIC));
                }
                Err(e) => {
                    error!("Cannot talk to the scale: {}", e);
                    ctx.finish();
                }
            },
            STEP_HEARTBEAT => {
                self.send(ctx, CMD_HEARTBEAT, &[]);
                ctx.stop();
            }
            STEP_AUTH => self.authenticate(ctx),
            STEP_USER_INFO => {
                let plain = Self::user_info(ctx.env());
                if let Err(e) = self.send_encrypted(ctx, CMD_USER_INFO, &plain) {
                    error!("User info not sent: {}", e);
                    ctx.fail(InfoCode::AuthenticationFailed, 0);
                } else {
                    ctx.stop();
                }
            }
            STEP_MEASURE => {
                ctx.report_info(InfoCode::StepOnScale, 0);
                ctx.stop();
            }
            STEP_BIND => self.bind(ctx),
            _ => return false,
        }
        true
    }

    fn decode(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        ctx: &mut CodecContext<'_>,
    ) -> Result<Decoded> {
        if characteristic != uuid16(NOTIFY_CHARACTERISTIC) {
            return Ok(Decoded::Waiting);
        }
        let (len, command) = match data {
            [MAGIC, len, command, ..] => (usize::from(*len), *command),
            _ => return Err(ScaleError::MalformedPacket(format!("{data:02X?}"))),
        };
        if data.len() - 3 != len {
            return Err(ScaleError::MalformedPacket(format!(
                "frame announces {len} body bytes, carries {}",
                data.len() - 3
            )));
        }
        let body = obfuscate(&data[3..], &self.mac);
        let result = body.first().copied().unwrap_or_default();

        match command {
            CMD_HEARTBEAT | CMD_WAKEUP => {
                if ctx.is_at(STEP_HEARTBEAT) {
                    ctx.resume();
                }
            }
            CMD_AUTH => self.on_auth_result(result, ctx)?,
            CMD_BIND => self.on_bind_result(result, ctx)?,
            CMD_USER_INFO => {
                if ctx.is_at(STEP_USER_INFO) {
                    ctx.resume();
                }
            }
            CMD_MEASUREMENT => return self.on_measurement(&body, ctx),
            _ => {
                return Err(ScaleError::UnexpectedPacket {
                    opcode: command,
                    step: ctx.current_step().unwrap_or_default(),
                })
            }
        }
        Ok(Decoded::Waiting)
    }

    fn on_keep_alive(&mut self, ctx: &mut CodecContext<'_>) {
        if ctx.current_step().is_some() {
            self.send(ctx, CMD_HEARTBEAT, &[]);
        }
    }

    fn flush(&mut self, _env: &SessionEnv) -> Option<Measurement> {
        self.key = None;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{self, fixture, Fixture};
    use crate::sequencer::StepControl;
    use crate::session::Session;
    use crate::settings::RemoteUsers;
    use crate::transport::{TransportCommand, TransportEvent};
    use crate::types::DeviceInfo;

    const MAC: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    fn session() -> (Session, Fixture) {
        let fixture = fixture(DeviceInfo::new("CH100".to_string(), -50));
        let session = Session::new(
            Box::new(HuaweiCodec::new(HuaweiConfig::default())),
            fixture.env.clone(),
        );
        (session, fixture)
    }

    fn remote(fixture: &Fixture) -> RemoteUsers {
        RemoteUsers::new(fixture.settings.clone(), fixture.env.device.settings_key())
    }

    fn reply(command: u8, body: &[u8]) -> TransportEvent {
        let mut data = vec![MAGIC, u8::try_from(body.len()).unwrap(), command];
        data.extend(obfuscate(body, &MAC));
        TransportEvent::Notify {
            characteristic: uuid16(NOTIFY_CHARACTERISTIC),
            data,
        }
    }

    fn session_key() -> SessionKey {
        SessionKey::derive(&auth_code(&MAC, 1), &MAC, &INITIAL_KEY).unwrap()
    }

    fn measurement(checksum_offset: u8) -> TransportEvent {
        let mut plain = vec![0u8; MEASUREMENT_LEN];
        plain[0] = 1;
        plain[1..3].copy_from_slice(&8020u16.to_be_bytes());
        plain[3..5].copy_from_slice(&480u16.to_be_bytes());
        plain[5..7].copy_from_slice(&215u16.to_be_bytes());
        plain[7..11].copy_from_slice(&1_709_280_000u32.to_be_bytes());
        plain[15] = sum_checksum(&plain, 0, 15).wrapping_add(checksum_offset);
        reply(CMD_MEASUREMENT, &session_key().encrypt(&plain, &IV))
    }

    fn decoded_frame(command: &TransportCommand) -> (u8, Vec<u8>) {
        let data = command.written_data().unwrap();
        assert_eq!(data[0], MAGIC);
        assert_eq!(usize::from(data[1]), data.len() - 3);
        (data[2], obfuscate(&data[3..], &MAC))
    }

    /// Drive a session with a stored code up to the authentication request
    fn to_auth(session: &mut Session, fixture: &Fixture) {
        remote(fixture)
            .set_user_secret(1, AUTH_CODE_SECRET, &auth_code(&MAC, 1))
            .unwrap();
        let commands = session.start();
        assert_eq!(decoded_frame(&commands[1]).0, CMD_HEARTBEAT);

        let commands = session.handle_event(reply(CMD_HEARTBEAT, &[]));
        assert_eq!(
            decoded_frame(&commands[0]),
            (CMD_AUTH, auth_code(&MAC, 1).to_vec())
        );
    }

    #[test]
    fn test_auth_code_is_stable() {
        assert_eq!(crate::types::parse_mac_address(testing::MAC).unwrap(), MAC);
        let code = auth_code(&MAC, 1);
        assert_eq!(code, auth_code(&MAC, 1));
        assert_ne!(code, auth_code(&MAC, 2));
        assert_ne!(code, auth_code(&[0; 6], 1));
    }

    #[test]
    fn test_first_connection_binds_then_measures() {
        let (mut session, fixture) = session();
        session.start();

        let commands = session.handle_event(reply(CMD_WAKEUP, &[]));
        assert_eq!(decoded_frame(&commands[0]).0, CMD_BIND);
        assert_eq!(fixture.sink.infos(), vec![(InfoCode::ConfirmOnScale, 0)]);

        let commands = session.handle_event(reply(CMD_BIND, &[RESULT_SUCCESS]));
        assert_eq!(decoded_frame(&commands[0]).0, CMD_AUTH);
        assert_eq!(
            remote(&fixture).user_secret(1, AUTH_CODE_SECRET).unwrap(),
            Some(auth_code(&MAC, 1).to_vec())
        );

        let commands = session.handle_event(reply(CMD_AUTH, &[RESULT_SUCCESS]));
        let (command, body) = decoded_frame(&commands[0]);
        assert_eq!(command, CMD_USER_INFO);
        assert_eq!(
            session_key().decrypt(&body, &IV),
            vec![180, 38, 1, 0x03, 0x20]
        );

        session.handle_event(reply(CMD_USER_INFO, &[RESULT_SUCCESS]));
        assert_eq!(session.current_step(), Some(STEP_MEASURE));

        let commands = session.handle_event(measurement(0));
        let (command, body) = decoded_frame(&commands[0]);
        assert_eq!(command, CMD_MEASUREMENT);
        assert_eq!(session_key().decrypt(&body, &IV), vec![RESULT_SUCCESS]);
        assert_eq!(commands.last(), Some(&TransportCommand::Disconnect));

        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 1);
        assert!((measurements[0].weight_kg - 80.2).abs() < 1e-4);
        assert_eq!(measurements[0].impedance, Some(480.0));
        assert_eq!(measurements[0].fat, Some(21.5));
        assert_eq!(measurements[0].timestamp.timestamp(), 1_709_280_000);
    }

    #[test]
    fn test_auth_failures_fall_back_to_binding() {
        let (mut session, fixture) = session();
        to_auth(&mut session, &fixture);

        for _ in 0..2 {
            let commands = session.handle_event(reply(CMD_AUTH, &[0x00]));
            assert_eq!(decoded_frame(&commands[0]).0, CMD_AUTH);
        }
        let commands = session.handle_event(reply(CMD_AUTH, &[0x00]));
        assert_eq!(decoded_frame(&commands[0]).0, CMD_BIND);

        let infos = fixture.sink.infos();
        assert_eq!(
            &infos[..3],
            &[
                (InfoCode::AuthenticationFailed, 1),
                (InfoCode::AuthenticationFailed, 2),
                (InfoCode::AuthenticationFailed, 3),
            ]
        );
    }

    #[test]
    fn test_refused_after_binding_is_terminal() {
        let (mut session, fixture) = session();
        session.start();
        session.handle_event(reply(CMD_HEARTBEAT, &[]));
        session.handle_event(reply(CMD_BIND, &[RESULT_SUCCESS]));

        let commands = session.handle_event(reply(CMD_AUTH, &[0x00]));
        assert_eq!(commands, vec![TransportCommand::Disconnect]);
        assert_eq!(
            fixture.sink.infos().last(),
            Some(&(InfoCode::AuthenticationFailed, 1))
        );
    }

    #[test]
    fn test_bad_checksum_is_discarded() {
        let (mut session, fixture) = session();
        to_auth(&mut session, &fixture);
        session.handle_event(reply(CMD_AUTH, &[RESULT_SUCCESS]));
        session.handle_event(reply(CMD_USER_INFO, &[RESULT_SUCCESS]));

        assert!(session.handle_event(measurement(1)).is_empty());
        assert!(fixture.sink.measurements().is_empty());
        assert!(!session.is_terminated());

        session.handle_event(measurement(0));
        assert_eq!(fixture.sink.measurements().len(), 1);
    }

    #[test]
    fn test_encrypted_commands_fail_closed() {
        let fixture = fixture(DeviceInfo::new("CH100".to_string(), -50));
        let codec = HuaweiCodec::new(HuaweiConfig::default());
        let mut control = StepControl::new();
        let mut outbox = Vec::new();
        let mut ctx = CodecContext::new(&mut control, &mut outbox, &fixture.env);

        assert!(!codec.is_authenticated());
        assert!(matches!(
            codec.send_encrypted(&mut ctx, CMD_USER_INFO, &[1, 2, 3]),
            Err(ScaleError::NotAuthenticated)
        ));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_measurement_before_auth_is_discarded() {
        let (mut session, fixture) = session();
        to_auth(&mut session, &fixture);
        assert!(session.handle_event(measurement(0)).is_empty());
        assert!(fixture.sink.measurements().is_empty());
    }

    #[test]
    fn test_keep_alive_sends_heartbeat() {
        let (mut session, _fixture) = session();
        assert_eq!(session.keep_alive_interval(), Some(Duration::from_secs(5)));
        assert!(session.keep_alive().is_empty());

        session.start();
        let commands = session.keep_alive();
        assert_eq!(commands.len(), 1);
        assert_eq!(decoded_frame(&commands[0]), (CMD_HEARTBEAT, Vec::new()));
    }

    #[test]
    fn test_frame_length_is_checked() {
        let (mut session, fixture) = session();
        session.start();
        session.handle_event(TransportEvent::Notify {
            characteristic: uuid16(NOTIFY_CHARACTERISTIC),
            data: vec![MAGIC, 4, CMD_HEARTBEAT, 0x00],
        });
        assert_eq!(session.current_step(), Some(STEP_HEARTBEAT));
        assert!(fixture.sink.infos().is_empty());
    }
}

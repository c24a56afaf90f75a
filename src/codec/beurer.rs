//! Beurer BF700/BF800 and Sanitas SBF70 multi-user scales.
//!
//! All traffic runs over one characteristic. Every packet opens with a
//! start byte whose high nibble tells the brand (`0xF_` Beurer, `0xE_`
//! Sanitas) and whose low nibble tells the packet class. Users live on the
//! scale under 64-bit remote ids; a local profile is matched to one by its
//! three-letter display name and birth year, or a new one is created.
//!
//! | step | action |
//! |---|---|
//! | 0 | subscribe |
//! | 1 | init, wait for ack |
//! | 2 | set clock |
//! | 3 | request user list, wait for all entries |
//! | 4 | match the selected user |
//! | 5 | create the user on the scale, wait for ack |
//! | 6 | scale status, wait for ack |
//! | 7 | request measurement, wait for the reading |
//! | 8 | disconnect |

use bytes::{BufMut, BytesMut};
use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{CodecContext, Decoded, DeviceCodec, DeviceFamily};
use crate::error::{Result, ScaleError};
use crate::framing::{put_u32, read_u16, read_u32, Endian, Fragment, Reassembler};
use crate::measurement::{Measurement, PendingMeasurement};
use crate::sequencer::RetryBudget;
use crate::session::SessionEnv;
use crate::transport::uuid16;
use crate::types::{InfoCode, ScaleUser};

const SERVICE: u16 = 0xFFE0;
const CHARACTERISTIC: u16 = 0xFFE1;

const NIBBLE_INIT: u8 = 0x06;
const NIBBLE_COMMAND: u8 = 0x07;
const NIBBLE_SET_TIME: u8 = 0x09;
const NIBBLE_DISCONNECT: u8 = 0x0A;

const CMD_USER_ADD: u8 = 0x31;
const CMD_USER_LIST: u8 = 0x33;
const CMD_USER_ENTRY: u8 = 0x34;
const CMD_DO_MEASUREMENT: u8 = 0x40;
const CMD_SCALE_STATUS: u8 = 0x4F;
const CMD_LIVE_WEIGHT: u8 = 0x58;
const CMD_MEASUREMENT: u8 = 0x59;
const CMD_SCALE_ACK: u8 = 0xF0;
const CMD_APP_ACK: u8 = 0xF1;

const INIT_ACK: u8 = 0x01;

const STATUS_OK: u8 = 0x00;
const STATUS_NO_USERS: u8 = 0x01;
const STATUS_MAX_USERS: u8 = 0x01;

const STEP_INIT: usize = 1;
const STEP_USER_LIST: usize = 3;
const STEP_MATCH: usize = 4;
const STEP_CREATE_USER: usize = 5;
const STEP_SCALE_STATUS: usize = 6;
const STEP_MEASURE: usize = 7;

const MEASUREMENT_LEN: usize = 30;

/// Brand of a scale in this family; only the start byte differs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BeurerVariant {
    /// Beurer BF700, BF710, BF800 and RT-Libra
    Beurer,
    /// Sanitas SBF70, SilverCrest SBF75
    Sanitas,
}

impl BeurerVariant {
    /// Variant for a lower-cased advertised name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        const BEURER: [&str; 7] = [
            "beurer bf700",
            "beurer bf710",
            "beurer bf800",
            "bf700",
            "bf800",
            "rt-libra-w",
            "libra-w",
        ];
        const SANITAS: [&str; 4] = ["sanitas sbf70", "sbf70", "sbf75", "aicdscale1"];

        if BEURER.iter().any(|prefix| name.starts_with(prefix)) {
            Some(Self::Beurer)
        } else if SANITAS.iter().any(|prefix| name.starts_with(prefix)) {
            Some(Self::Sanitas)
        } else {
            None
        }
    }

    /// Start byte for a packet class
    #[must_use]
    pub const fn start_byte(self, nibble: u8) -> u8 {
        let high = match self {
            Self::Beurer => 0xF0,
            Self::Sanitas => 0xE0,
        };
        high | (nibble & 0x0F)
    }
}

/// Family constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeurerConfig {
    /// Unexpected acknowledgements tolerated before giving up
    pub max_retries: u32,
    /// Remote ids of created users start here, offset by the local id
    pub remote_id_base: u64,
    /// Battery level at or below which the user is warned
    pub low_battery_percent: u8,
}

impl Default for BeurerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            remote_id_base: 1000,
            low_battery_percent: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteUser {
    id: u64,
    name: String,
    birth_year: i32,
}

/// Name as the scale shows it: first three ASCII alphanumerics, upper-cased
fn display_name(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .take(3)
        .collect()
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    let high = read_u32(data, offset, Endian::Big)?;
    let low = read_u32(data, offset + 4, Endian::Big)?;
    Ok((u64::from(high) << 32) | u64::from(low))
}

/// Weight fields count 50 g units
fn fifty_grams(data: &[u8], offset: usize) -> Result<f32> {
    Ok(f32::from(read_u16(data, offset, Endian::Big)?) * 50.0 / 1000.0)
}

fn tenths(data: &[u8], offset: usize) -> Result<f32> {
    Ok(f32::from(read_u16(data, offset, Endian::Big)?) / 10.0)
}

fn parse_measurement(payload: &[u8]) -> Result<PendingMeasurement> {
    if payload.len() < MEASUREMENT_LEN {
        return Err(ScaleError::MalformedPacket(format!(
            "measurement payload has {} of {MEASUREMENT_LEN} bytes",
            payload.len()
        )));
    }

    let seconds = read_u32(payload, 8, Endian::Big)?;
    let timestamp = (seconds != 0)
        .then(|| Utc.timestamp_opt(i64::from(seconds), 0).single())
        .flatten();
    debug!(
        "BMR {} AMR {} BMI {:.1}",
        read_u16(payload, 24, Endian::Big)?,
        read_u16(payload, 26, Endian::Big)?,
        tenths(payload, 28)?
    );

    Ok(PendingMeasurement {
        device_user: Some(read_u64(payload, 0)?),
        timestamp,
        weight_kg: Some(fifty_grams(payload, 12)?),
        impedance: Some(f32::from(read_u16(payload, 14, Endian::Big)?)),
        fat_percent: Some(tenths(payload, 16)?),
        water_percent: Some(tenths(payload, 18)?),
        muscle_percent: Some(tenths(payload, 20)?),
        bone_kg: Some(fifty_grams(payload, 22)?),
        ..Default::default()
    })
}

/// Codec for Beurer and Sanitas multi-user scales
#[derive(Debug)]
pub struct BeurerCodec {
    variant: BeurerVariant,
    config: BeurerConfig,
    awaiting: Option<u8>,
    retries: RetryBudget,
    measurement_retries: RetryBudget,
    remote_user_id: Option<u64>,
    scale_users: Vec<RemoteUser>,
    reassembler: Reassembler,
    held: Option<PendingMeasurement>,
}

impl BeurerCodec {
    /// Codec for one brand
    #[must_use]
    pub fn new(variant: BeurerVariant, config: BeurerConfig) -> Self {
        Self {
            variant,
            retries: RetryBudget::new(config.max_retries),
            measurement_retries: RetryBudget::new(1),
            config,
            awaiting: None,
            remote_user_id: None,
            scale_users: Vec::new(),
            reassembler: Reassembler::new(),
            held: None,
        }
    }

    fn send(&self, ctx: &mut CodecContext<'_>, nibble: u8, body: &[u8]) {
        let mut packet = BytesMut::with_capacity(body.len() + 1);
        packet.put_u8(self.variant.start_byte(nibble));
        packet.put_slice(body);
        ctx.write(uuid16(SERVICE), uuid16(CHARACTERISTIC), packet.to_vec());
    }

    /// Send a command and park until the scale acknowledges it
    fn send_command(&mut self, ctx: &mut CodecContext<'_>, command: u8, body: &[u8]) {
        let mut packet = vec![command];
        packet.extend_from_slice(body);
        self.send(ctx, NIBBLE_COMMAND, &packet);
        self.awaiting = Some(command);
        ctx.stop();
    }

    fn app_ack(&self, ctx: &mut CodecContext<'_>, command: u8, total: u8, part: u8) {
        self.send(ctx, NIBBLE_COMMAND, &[CMD_APP_ACK, command, total, part]);
    }

    /// Bind every local user found in the scale's list. A held reading whose
    /// slot gets bound here is released for that user.
    fn match_user(&mut self, ctx: &mut CodecContext<'_>) -> Result<bool> {
        let env = ctx.env();
        let remote = env.remote_users();

        for user in &env.users {
            let stored = remote.slot_for(user.id)?;
            let name = display_name(&user.name);
            let slot = self
                .scale_users
                .iter()
                .find(|entry| Some(entry.id) == stored)
                .or_else(|| {
                    self.scale_users
                        .iter()
                        .find(|entry| entry.name == name && entry.birth_year == user.birth_year())
                })
                .map(|entry| entry.id);

            let Some(slot) = slot else {
                continue;
            };
            if stored != Some(slot) {
                remote.bind(user.id, slot)?;
            }
            if user.id == env.user.id {
                info!("User {} is {} on the scale", user.id, slot);
                self.remote_user_id = Some(slot);
            }

            if self.held.as_ref().and_then(|p| p.device_user) == Some(slot) {
                if let Some(pending) = self.held.take() {
                    info!("Releasing held measurement of scale user {} for user {}", slot, user.id);
                    if let Some(measurement) = Self::finalize_for(pending, user.id, env) {
                        ctx.release(measurement);
                    }
                }
            }
        }
        Ok(self.remote_user_id.is_some())
    }

    fn new_remote_id(&self, user: &ScaleUser) -> u64 {
        let mut id = self.config.remote_id_base + u64::from(user.id);
        while self.scale_users.iter().any(|entry| entry.id == id) {
            id += 1;
        }
        id
    }

    fn create_user(&mut self, ctx: &mut CodecContext<'_>) {
        let user = &ctx.env().user;
        let id = self.new_remote_id(user);
        self.remote_user_id = Some(id);

        let name = format!("{:<3}", display_name(&user.name));
        let year = u8::try_from(user.birth_year() - 1900).unwrap_or(0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let height = user.height_cm.round().clamp(0.0, 255.0) as u8;
        let sex = if user.gender.is_male() { 0x80 } else { 0x00 };

        let mut body = BytesMut::with_capacity(14);
        body.put_u64(id);
        body.put_slice(name.as_bytes());
        body.put_u8(year);
        body.put_u8(height);
        body.put_u8(sex | (user.activity_level & 0x0F));

        info!("Creating user {} on the scale as {}", user.id, id);
        self.send_command(ctx, CMD_USER_ADD, &body);
    }

    fn finalize_for(
        pending: PendingMeasurement,
        user_id: u32,
        env: &SessionEnv,
    ) -> Option<Measurement> {
        PendingMeasurement {
            user_id: Some(user_id),
            ..pending
        }
        .finalize(Some(env.user.id), env.now())
    }

    /// Finish a held reading for whoever owns its slot now, the selected user if nobody does
    fn release_held(pending: PendingMeasurement, env: &SessionEnv) -> Option<Measurement> {
        let remote = env.remote_users();
        let owner = match pending.device_user.map(|id| remote.user_for(id)).transpose() {
            Ok(owner) => owner.flatten(),
            Err(e) => {
                warn!("Cannot look up the held reading's user: {}", e);
                None
            }
        };
        Self::finalize_for(pending, owner.unwrap_or(env.user.id), env)
    }

    fn on_ack(&mut self, data: &[u8], ctx: &mut CodecContext<'_>) -> Result<Decoded> {
        let (command, status) = match data.get(2..4) {
            Some(&[command, status]) => (command, status),
            _ => {
                return Err(ScaleError::MalformedPacket(
                    "acknowledgement too short".to_string(),
                ))
            }
        };
        let step = ctx.current_step().unwrap_or_default();

        if self.awaiting != Some(command) {
            if self.awaiting.is_none() {
                debug!("Ignoring ack for {:02X}, nothing outstanding", command);
            } else if self.retries.try_again() {
                warn!(
                    "Ack for {:02X} while waiting for {:02X?}, resending (attempt {})",
                    command,
                    self.awaiting,
                    self.retries.used()
                );
                ctx.retry();
            } else {
                ctx.fail(InfoCode::RetryLimitExceeded, i64::try_from(step).unwrap_or(-1));
            }
            return Ok(Decoded::Waiting);
        }
        self.awaiting = None;

        match command {
            CMD_USER_LIST => {
                let count = data.get(4).copied().unwrap_or(0);
                if status == STATUS_NO_USERS || count == 0 {
                    debug!("Scale has no users");
                    ctx.resume();
                } else {
                    debug!("Scale lists {} user(s)", count);
                }
            }
            CMD_USER_ADD => {
                if status == STATUS_MAX_USERS {
                    ctx.fail(InfoCode::MaxUsersReached, 0);
                    return Ok(Decoded::Waiting);
                } else if status != STATUS_OK {
                    ctx.fail(InfoCode::EnrollmentFailed, i64::from(status));
                    return Ok(Decoded::Waiting);
                }

                let env = ctx.env();
                let Some(id) = self.remote_user_id else {
                    return Err(ScaleError::Protocol("user created without an id".to_string()));
                };
                env.remote_users().bind(env.user.id, id)?;
                ctx.report_info(InfoCode::UserCreated, i64::try_from(id).unwrap_or(-1));
                ctx.resume();

                if self.held.as_ref().and_then(|p| p.device_user) == Some(id) {
                    info!("Releasing held measurement for new user {}", id);
                    if let Some(pending) = self.held.take() {
                        return Ok(Self::finalize_for(pending, env.user.id, env)
                            .map_or(Decoded::Waiting, Decoded::Ready));
                    }
                }
            }
            CMD_SCALE_STATUS => {
                let battery = data.get(4).copied().unwrap_or(100);
                debug!("Battery at {}%", battery);
                if battery <= self.config.low_battery_percent {
                    ctx.report_info(InfoCode::LowBattery, i64::from(battery));
                }
                ctx.resume();
            }
            CMD_DO_MEASUREMENT => {
                if status == STATUS_OK {
                    debug!("Measurement request accepted");
                } else if self.measurement_retries.try_again() {
                    ctx.report_info(InfoCode::MeasurementRejected, i64::from(status));
                    ctx.retry();
                } else {
                    ctx.fail(InfoCode::MeasurementRejected, i64::from(status));
                }
            }
            _ => debug!("Ack for {:02X} with status {:02X}", command, status),
        }
        Ok(Decoded::Waiting)
    }

    fn on_user_entry(&mut self, data: &[u8], ctx: &mut CodecContext<'_>) -> Result<Decoded> {
        let entry = data
            .get(2..16)
            .ok_or_else(|| ScaleError::MalformedPacket("user entry too short".to_string()))?;
        let (total, current) = (entry[0], entry[1]);
        let user = RemoteUser {
            id: read_u64(entry, 2)?,
            name: String::from_utf8_lossy(&entry[10..13]).trim().to_string(),
            birth_year: 1900 + i32::from(entry[13]),
        };
        debug!("Scale user {}/{}: {:?}", current, total, user);

        if !self.scale_users.iter().any(|u| u.id == user.id) {
            self.scale_users.push(user);
        }
        self.app_ack(ctx, CMD_USER_ENTRY, total, current);

        if current == total && ctx.is_at(STEP_USER_LIST) {
            ctx.resume();
        }
        Ok(Decoded::Waiting)
    }

    fn on_measurement_part(&mut self, data: &[u8], ctx: &mut CodecContext<'_>) -> Result<Decoded> {
        let (total, part) = match data.get(2..4) {
            Some(&[total, part]) => (total, part),
            _ => {
                return Err(ScaleError::MalformedPacket(
                    "measurement part too short".to_string(),
                ))
            }
        };
        self.app_ack(ctx, CMD_MEASUREMENT, total, part);

        let payload = match self.reassembler.push(part, total, &data[4..]) {
            Fragment::Complete(payload) => payload,
            Fragment::Incomplete | Fragment::Discarded => return Ok(Decoded::Waiting),
        };
        let pending = parse_measurement(&payload)?;
        let remote_id = pending.device_user.unwrap_or_default();
        let env = ctx.env();

        if ctx.is_at(STEP_MEASURE) {
            ctx.resume();
        }

        if let Some(user_id) = env.remote_users().user_for(remote_id)? {
            return Ok(Self::finalize_for(pending, user_id, env)
                .map_or(Decoded::Waiting, Decoded::Ready));
        }

        info!("Holding measurement for unknown scale user {}", remote_id);
        if let Some(previous) = self.held.replace(pending) {
            // a second unidentified reading pushes the first one out
            return Ok(Self::release_held(previous, env).map_or(Decoded::Waiting, Decoded::Ready));
        }
        Ok(Decoded::Waiting)
    }
}

impl DeviceCodec for BeurerCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Beurer(self.variant)
    }

    fn on_step(&mut self, step: usize, ctx: &mut CodecContext<'_>) -> bool {
        match step {
            0 => {
                ctx.subscribe_notify(uuid16(SERVICE), uuid16(CHARACTERISTIC));
                true
            }
            STEP_INIT => {
                self.send(ctx, NIBBLE_INIT, &[INIT_ACK]);
                ctx.stop();
                true
            }
            2 => {
                let mut body = BytesMut::with_capacity(4);
                let now = u32::try_from(ctx.env().now().timestamp()).unwrap_or(0);
                put_u32(&mut body, now, Endian::Big);
                self.send(ctx, NIBBLE_SET_TIME, &body);
                true
            }
            STEP_USER_LIST => {
                self.scale_users.clear();
                self.send_command(ctx, CMD_USER_LIST, &[]);
                true
            }
            STEP_MATCH => {
                match self.match_user(ctx) {
                    Ok(true) => ctx.jump_to(STEP_SCALE_STATUS),
                    Ok(false) => debug!("No scale user matches, creating one"),
                    Err(e) => warn!("User matching failed: {}", e),
                }
                true
            }
            STEP_CREATE_USER => {
                self.create_user(ctx);
                true
            }
            STEP_SCALE_STATUS | STEP_MEASURE => {
                let Some(id) = self.remote_user_id else {
                    ctx.fail(InfoCode::EnrollmentFailed, 0);
                    return true;
                };
                if step == STEP_MEASURE {
                    ctx.report_info(InfoCode::StepOnScale, 0);
                    self.send_command(ctx, CMD_DO_MEASUREMENT, &id.to_be_bytes());
                } else {
                    self.send_command(ctx, CMD_SCALE_STATUS, &id.to_be_bytes());
                }
                true
            }
            8 => {
                self.send(ctx, NIBBLE_DISCONNECT, &[]);
                false
            }
            _ => false,
        }
    }

    fn decode(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        ctx: &mut CodecContext<'_>,
    ) -> Result<Decoded> {
        if characteristic != uuid16(CHARACTERISTIC) {
            return Ok(Decoded::Waiting);
        }
        let (start, kind) = match data {
            [start, kind, ..] => (*start, *kind),
            _ => return Err(ScaleError::MalformedPacket(format!("{data:02X?}"))),
        };

        if start == self.variant.start_byte(NIBBLE_INIT) {
            if kind == INIT_ACK && ctx.is_at(STEP_INIT) {
                info!("Scale is ready");
                ctx.resume();
            }
            return Ok(Decoded::Waiting);
        }
        if start != self.variant.start_byte(NIBBLE_COMMAND) {
            return Err(ScaleError::MalformedPacket(format!(
                "unexpected start byte {start:02X}"
            )));
        }

        match kind {
            CMD_SCALE_ACK => self.on_ack(data, ctx),
            CMD_USER_ENTRY => self.on_user_entry(data, ctx),
            CMD_MEASUREMENT => self.on_measurement_part(data, ctx),
            CMD_LIVE_WEIGHT => {
                let weight = fifty_grams(data, 3)?;
                #[allow(clippy::cast_possible_truncation)]
                let grams = (weight * 1000.0).round() as i64;
                ctx.report_info(InfoCode::MeasurementInProgress, grams);
                Ok(Decoded::Waiting)
            }
            _ => Err(ScaleError::UnexpectedPacket {
                opcode: kind,
                step: ctx.current_step().unwrap_or_default(),
            }),
        }
    }

    fn flush(&mut self, env: &SessionEnv) -> Option<Measurement> {
        self.held
            .take()
            .and_then(|pending| Self::release_held(pending, env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{fixture, user, Fixture};
    use crate::session::Session;
    use crate::settings::RemoteUsers;
    use crate::transport::{TransportCommand, TransportEvent};
    use crate::types::DeviceInfo;

    const F7: u8 = 0xF7;

    fn session() -> (Session, Fixture) {
        let fixture = fixture(DeviceInfo::new("BEURER BF700".to_string(), -60));
        let session = Session::new(
            Box::new(BeurerCodec::new(BeurerVariant::Beurer, BeurerConfig::default())),
            fixture.env.clone(),
        );
        (session, fixture)
    }

    fn notify(data: &[u8]) -> TransportEvent {
        TransportEvent::Notify {
            characteristic: uuid16(CHARACTERISTIC),
            data: data.to_vec(),
        }
    }

    fn ack(command: u8, status: u8, extra: &[u8]) -> TransportEvent {
        let mut data = vec![F7, CMD_SCALE_ACK, command, status];
        data.extend_from_slice(extra);
        notify(&data)
    }

    fn remote(fixture: &Fixture) -> RemoteUsers {
        RemoteUsers::new(fixture.settings.clone(), fixture.env.device.settings_key())
    }

    fn measurement_payload(remote_id: u64) -> Vec<u8> {
        let mut payload = BytesMut::new();
        payload.put_u64(remote_id);
        payload.put_u32(1_709_280_000);
        payload.put_u16(1604); // 80.2 kg
        payload.put_u16(520);
        payload.put_u16(215);
        payload.put_u16(552);
        payload.put_u16(401);
        payload.put_u16(70); // 3.5 kg
        payload.put_u16(1800);
        payload.put_u16(2600);
        payload.put_u16(247);
        payload.to_vec()
    }

    fn parts(remote_id: u64) -> (TransportEvent, TransportEvent) {
        let payload = measurement_payload(remote_id);
        let mut first = vec![F7, CMD_MEASUREMENT, 2, 1];
        first.extend_from_slice(&payload[..16]);
        let mut second = vec![F7, CMD_MEASUREMENT, 2, 2];
        second.extend_from_slice(&payload[16..]);
        (notify(&first), notify(&second))
    }

    /// Runs the session up to the user list ack announcing `count` entries
    fn list_users(session: &mut Session, count: u8) {
        let commands = session.start();
        assert_eq!(commands[1].written_data(), Some(&[0xF6, INIT_ACK][..]));

        let commands = session.handle_event(notify(&[0xF6, INIT_ACK]));
        assert_eq!(commands[0].written_data().map(|d| d[0]), Some(0xF9));
        assert_eq!(commands[1].written_data(), Some(&[F7, CMD_USER_LIST][..]));

        let status = if count == 0 { STATUS_NO_USERS } else { STATUS_OK };
        session.handle_event(ack(CMD_USER_LIST, status, &[count, 8]));
    }

    fn user_entries(session: &mut Session, entries: &[(u64, &str, u8)]) {
        let count = u8::try_from(entries.len()).unwrap();
        for (i, (id, name, year)) in entries.iter().enumerate() {
            let current = u8::try_from(i + 1).unwrap();
            let mut entry = vec![F7, CMD_USER_ENTRY, count, current];
            entry.extend(id.to_be_bytes());
            entry.extend(name.as_bytes());
            entry.push(*year);
            let commands = session.handle_event(notify(&entry));
            assert_eq!(
                commands[0].written_data(),
                Some(&[F7, CMD_APP_ACK, CMD_USER_ENTRY, count, current][..])
            );
        }
    }

    /// Runs the session until the user list ack, with the given list entries
    fn to_user_list(session: &mut Session, entries: &[(u64, &str, u8)]) {
        list_users(session, u8::try_from(entries.len()).unwrap());
        user_entries(session, entries);
    }

    fn two_user_session(fixture: &Fixture) -> Session {
        let env = fixture
            .env
            .clone()
            .with_users(vec![user(1, "Max"), user(2, "Eva")]);
        Session::new(
            Box::new(BeurerCodec::new(BeurerVariant::Beurer, BeurerConfig::default())),
            env,
        )
    }

    #[test]
    fn test_start_bytes() {
        assert_eq!(BeurerVariant::Beurer.start_byte(NIBBLE_COMMAND), 0xF7);
        assert_eq!(BeurerVariant::Sanitas.start_byte(NIBBLE_DISCONNECT), 0xEA);
        assert_eq!(BeurerVariant::from_name("sbf75"), Some(BeurerVariant::Sanitas));
        assert_eq!(display_name("max mustermann"), "MAX");
        assert_eq!(display_name("Jo-Ann"), "JOA");
    }

    #[test]
    fn test_existing_user_matched_and_measured() {
        let (mut session, fixture) = session();
        // "MAX", born 1985
        to_user_list(&mut session, &[(42, "XYZ", 70), (77, "MAX", 85)]);

        assert_eq!(session.current_step(), Some(STEP_SCALE_STATUS));
        assert_eq!(remote(&fixture).slot_for(1).unwrap(), Some(77));

        let commands = session.handle_event(ack(CMD_SCALE_STATUS, STATUS_OK, &[5]));
        assert_eq!(fixture.sink.infos()[0], (InfoCode::LowBattery, 5));
        let mut request = vec![F7, CMD_DO_MEASUREMENT];
        request.extend(77u64.to_be_bytes());
        assert_eq!(commands[0].written_data(), Some(&request[..]));

        session.handle_event(ack(CMD_DO_MEASUREMENT, STATUS_OK, &[]));
        session.handle_event(notify(&[F7, CMD_LIVE_WEIGHT, 0, 0x06, 0x40]));

        let (first, second) = parts(77);
        session.handle_event(first);
        assert!(fixture.sink.measurements().is_empty());
        let commands = session.handle_event(second);

        assert_eq!(commands.last(), Some(&TransportCommand::Disconnect));
        assert_eq!(commands[commands.len() - 2].written_data(), Some(&[0xFA][..]));

        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 1);
        let m = &measurements[0];
        assert!((m.weight_kg - 80.2).abs() < 1e-4);
        assert_eq!(m.fat, Some(21.5));
        assert!((m.bone.unwrap() - 3.5).abs() < 1e-4);
        assert_eq!(m.user_id, Some(1));
        assert_eq!(m.timestamp.timestamp(), 1_709_280_000);
        assert!(fixture
            .sink
            .infos()
            .contains(&(InfoCode::MeasurementInProgress, 80_000)));
    }

    #[test]
    fn test_held_measurement_released_by_enrolment() {
        let (mut session, fixture) = session();
        to_user_list(&mut session, &[]);
        assert_eq!(session.current_step(), Some(STEP_CREATE_USER));

        // the scale reports a reading for the id about to be created
        let (first, second) = parts(1001);
        session.handle_event(first);
        session.handle_event(second);
        assert!(fixture.sink.measurements().is_empty());

        session.handle_event(ack(CMD_USER_ADD, STATUS_OK, &[]));
        assert_eq!(remote(&fixture).user_for(1001).unwrap(), Some(1));
        assert_eq!(fixture.sink.measurements().len(), 1);
        assert!(fixture.sink.infos().contains(&(InfoCode::UserCreated, 1001)));

        session.disconnect();
        assert_eq!(fixture.sink.measurements().len(), 1);
    }

    #[test]
    fn test_held_measurement_flushed_on_disconnect() {
        let (mut session, fixture) = session();
        to_user_list(&mut session, &[]);

        let (first, second) = parts(5555);
        session.handle_event(first);
        session.handle_event(second);
        assert!(fixture.sink.measurements().is_empty());

        assert_eq!(session.disconnect(), vec![TransportCommand::Disconnect]);
        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].user_id, Some(1));
    }

    #[test]
    fn test_out_of_order_part_is_discarded() {
        let (mut session, fixture) = session();
        to_user_list(&mut session, &[(77, "MAX", 85)]);
        session.handle_event(ack(CMD_SCALE_STATUS, STATUS_OK, &[80]));

        let (first, second) = parts(77);
        session.handle_event(second.clone());
        session.handle_event(first);
        assert!(fixture.sink.measurements().is_empty());
        session.handle_event(second);
        assert_eq!(fixture.sink.measurements().len(), 1);
    }

    #[test]
    fn test_max_users_reached() {
        let (mut session, fixture) = session();
        to_user_list(&mut session, &[]);

        let commands = session.handle_event(ack(CMD_USER_ADD, STATUS_MAX_USERS, &[]));
        assert_eq!(commands, vec![TransportCommand::Disconnect]);
        assert_eq!(fixture.sink.infos(), vec![(InfoCode::MaxUsersReached, 0)]);
    }

    #[test]
    fn test_unexpected_ack_retries_then_fails() {
        let (mut session, fixture) = session();
        session.start();
        session.handle_event(notify(&[0xF6, INIT_ACK]));

        for _ in 0..3 {
            let commands = session.handle_event(ack(CMD_SCALE_STATUS, STATUS_OK, &[50]));
            assert_eq!(commands[0].written_data(), Some(&[F7, CMD_USER_LIST][..]));
            assert_eq!(session.current_step(), Some(STEP_USER_LIST));
        }

        let commands = session.handle_event(ack(CMD_SCALE_STATUS, STATUS_OK, &[50]));
        assert_eq!(commands, vec![TransportCommand::Disconnect]);
        assert_eq!(
            fixture.sink.infos(),
            vec![(InfoCode::RetryLimitExceeded, 3)]
        );
    }

    #[test]
    fn test_remote_id_skips_taken_ids() {
        let mut codec = BeurerCodec::new(BeurerVariant::Sanitas, BeurerConfig::default());
        codec.scale_users.push(RemoteUser {
            id: 1001,
            name: "ABC".to_string(),
            birth_year: 1990,
        });
        assert_eq!(codec.new_remote_id(&user(1, "Max")), 1002);
        assert_eq!(codec.new_remote_id(&user(2, "Eva")), 1002);
    }

    #[test]
    fn test_second_local_user_is_bound_too() {
        let fixture = fixture(DeviceInfo::new("BF800".to_string(), -60));
        let mut session = two_user_session(&fixture);
        to_user_list(&mut session, &[(10, "EVA", 85), (11, "MAX", 85)]);

        let remote = remote(&fixture);
        assert_eq!(remote.slot_for(1).unwrap(), Some(11));
        assert_eq!(remote.slot_for(2).unwrap(), Some(10));
    }

    #[test]
    fn test_held_measurement_released_to_matched_user() {
        let fixture = fixture(DeviceInfo::new("BF800".to_string(), -60));
        let mut session = two_user_session(&fixture);
        list_users(&mut session, 2);

        // a reading for scale user 10 arrives before the list tells who that is
        let (first, second) = parts(10);
        session.handle_event(first);
        session.handle_event(second);
        assert!(fixture.sink.measurements().is_empty());

        user_entries(&mut session, &[(10, "EVA", 85), (11, "MAX", 85)]);
        assert_eq!(remote(&fixture).user_for(10).unwrap(), Some(2));
        assert_eq!(session.current_step(), Some(STEP_SCALE_STATUS));

        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].user_id, Some(2));

        session.disconnect();
        assert_eq!(fixture.sink.measurements().len(), 1);
    }

    #[test]
    fn test_held_measurement_follows_later_binding() {
        let (mut session, fixture) = session();
        to_user_list(&mut session, &[]);

        let (first, second) = parts(10);
        session.handle_event(first);
        session.handle_event(second);
        assert!(fixture.sink.measurements().is_empty());

        // slot 10 is bound to user 2 elsewhere while the reading is held
        remote(&fixture).bind(2, 10).unwrap();

        // a second unknown reading pushes the first one out, to its owner
        let (first, second) = parts(12);
        session.handle_event(first);
        session.handle_event(second);
        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].user_id, Some(2));

        // slot 12 stays unknown and falls back to the selected user
        session.disconnect();
        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 2);
        assert_eq!(measurements[1].user_id, Some(1));
    }

    #[test]
    fn test_flushed_measurement_goes_to_slot_owner() {
        let (mut session, fixture) = session();
        to_user_list(&mut session, &[]);

        let (first, second) = parts(10);
        session.handle_event(first);
        session.handle_event(second);
        remote(&fixture).bind(2, 10).unwrap();

        session.disconnect();
        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].user_id, Some(2));
    }
}

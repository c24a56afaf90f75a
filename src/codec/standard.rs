//! Scales following the Bluetooth SIG Weight Scale and Body Composition
//! profiles, with users registered through the User Data Service.
//!
//! One weighing usually arrives as two indications, a weight measurement and
//! a body composition measurement. They are paired up here before a record
//! is emitted.

use bytes::{BufMut, BytesMut};
use chrono::{Datelike, TimeZone, Timelike, Utc};
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bodycomp::ImpedanceBodyLib;
use crate::codec::{CodecContext, Decoded, DeviceCodec, DeviceFamily};
use crate::error::{Result, ScaleError};
use crate::framing::{put_u16, read_u16, Endian};
use crate::measurement::{Measurement, PendingMeasurement};
use crate::sequencer::RetryBudget;
use crate::session::SessionEnv;
use crate::transport::uuid16;
use crate::types::{InfoCode, WeightUnit};

/// Weight Scale service
pub const WEIGHT_SCALE_SERVICE: u16 = 0x181D;
/// Body Composition service
pub const BODY_COMPOSITION_SERVICE: u16 = 0x181B;

const USER_DATA_SERVICE: u16 = 0x181C;
const CURRENT_TIME_SERVICE: u16 = 0x1805;
const BATTERY_SERVICE: u16 = 0x180F;

const WEIGHT_MEASUREMENT: u16 = 0x2A9D;
const BODY_COMPOSITION_MEASUREMENT: u16 = 0x2A9C;
const USER_CONTROL_POINT: u16 = 0x2A9F;
const CURRENT_TIME: u16 = 0x2A2B;
const BATTERY_LEVEL: u16 = 0x2A19;
const DATE_OF_BIRTH: u16 = 0x2A85;
const GENDER: u16 = 0x2A8C;
const HEIGHT: u16 = 0x2A8E;

const UCP_REGISTER: u8 = 0x01;
const UCP_CONSENT: u8 = 0x02;
const UCP_RESPONSE: u8 = 0x20;
const UCP_SUCCESS: u8 = 0x01;

const UNSUCCESSFUL: u16 = 0xFFFF;
const UNKNOWN_USER: u8 = 0xFF;

const STEP_CONSENT: usize = 5;

const CONSENT_SECRET: &str = "consent";

/// Family constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardConfig {
    /// Failed consents tolerated before giving up
    pub max_retries: u32,
    /// Largest consent code handed to the scale on registration
    pub max_consent_code: u16,
    /// Battery level at or below which the user is warned
    pub low_battery_percent: u8,
}

impl Default for StandardConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_consent_code: 9999,
            low_battery_percent: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Weight,
    BodyComposition,
}

#[derive(Debug)]
struct Part {
    kind: PartKind,
    data: PendingMeasurement,
}

impl Part {
    fn pairs_with(&self, other: &Self) -> bool {
        self.kind != other.kind
            && (self.data.device_user == other.data.device_user
                || !self.data.is_tagged()
                || !other.data.is_tagged())
    }
}

/// Cursor over a little-endian characteristic value
struct FieldReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    const fn new(data: &'a [u8], offset: usize) -> Self {
        Self { data, offset }
    }

    fn u8(&mut self) -> Result<u8> {
        let value = self.data.get(self.offset).copied().ok_or_else(|| {
            ScaleError::MalformedPacket(format!("value ends at byte {}", self.offset))
        })?;
        self.offset += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16> {
        let value = read_u16(self.data, self.offset, Endian::Little)?;
        self.offset += 2;
        Ok(value)
    }

    fn timestamp(&mut self) -> Result<Option<chrono::DateTime<Utc>>> {
        let year = self.u16()?;
        let (month, day) = (self.u8()?, self.u8()?);
        let (hour, minute, second) = (self.u8()?, self.u8()?, self.u8()?);
        if year == 0 {
            return Ok(None);
        }
        Ok(Utc
            .with_ymd_and_hms(
                i32::from(year),
                u32::from(month),
                u32::from(day),
                u32::from(hour),
                u32::from(minute),
                u32::from(second),
            )
            .single())
    }

    fn user(&mut self) -> Result<Option<u64>> {
        let id = self.u8()?;
        Ok((id != UNKNOWN_USER).then_some(u64::from(id)))
    }
}

fn mass(raw: u16, imperial: bool) -> f32 {
    if imperial {
        WeightUnit::Pounds.to_kg(f32::from(raw) * 0.01)
    } else {
        f32::from(raw) * 0.005
    }
}

fn parse_weight(data: &[u8]) -> Result<Option<PendingMeasurement>> {
    let mut reader = FieldReader::new(data, 0);
    let flags = reader.u8()?;
    let imperial = flags & 0x01 != 0;

    let raw = reader.u16()?;
    if raw == UNSUCCESSFUL {
        debug!("Scale reported an unsuccessful weighing");
        return Ok(None);
    }
    let mut part = PendingMeasurement {
        weight_kg: Some(mass(raw, imperial)),
        ..Default::default()
    };

    if flags & 0x02 != 0 {
        part.timestamp = reader.timestamp()?;
    }
    if flags & 0x04 != 0 {
        part.device_user = reader.user()?;
    }
    if flags & 0x08 != 0 {
        let (bmi, height) = (reader.u16()?, reader.u16()?);
        debug!("BMI {:.1}, height {}", f32::from(bmi) / 10.0, height);
    }
    Ok(Some(part))
}

fn parse_body_composition(data: &[u8]) -> Result<Option<PendingMeasurement>> {
    let mut reader = FieldReader::new(data, 0);
    let flags = reader.u16()?;
    let imperial = flags & 0x0001 != 0;

    let fat = reader.u16()?;
    if fat == UNSUCCESSFUL {
        debug!("Scale reported an unsuccessful body composition");
        return Ok(None);
    }
    let mut part = PendingMeasurement {
        fat_percent: Some(f32::from(fat) / 10.0),
        ..Default::default()
    };

    if flags & 0x0002 != 0 {
        part.timestamp = reader.timestamp()?;
    }
    if flags & 0x0004 != 0 {
        part.device_user = reader.user()?;
    }
    if flags & 0x0008 != 0 {
        debug!("Basal metabolism {} kJ", reader.u16()?);
    }
    if flags & 0x0010 != 0 {
        part.muscle_percent = Some(f32::from(reader.u16()?) / 10.0);
    }
    if flags & 0x0020 != 0 {
        part.muscle_mass_kg = Some(mass(reader.u16()?, imperial));
    }
    if flags & 0x0040 != 0 {
        part.lbm_kg = Some(mass(reader.u16()?, imperial));
    }
    if flags & 0x0080 != 0 {
        debug!("Soft lean mass {:.2}", mass(reader.u16()?, imperial));
    }
    if flags & 0x0100 != 0 {
        part.water_mass_kg = Some(mass(reader.u16()?, imperial));
    }
    if flags & 0x0200 != 0 {
        part.impedance = Some(f32::from(reader.u16()?) / 10.0);
    }
    if flags & 0x0400 != 0 {
        part.weight_kg = Some(mass(reader.u16()?, imperial));
    }
    if flags & 0x0800 != 0 {
        debug!("Height {}", reader.u16()?);
    }
    if flags & 0x1000 != 0 {
        debug!("Body composition continues in another indication");
    }
    Ok(Some(part))
}

/// Codec for standard profile scales
#[derive(Debug)]
pub struct StandardCodec {
    config: StandardConfig,
    pending: Option<Part>,
    registering: Option<u16>,
    consent_retries: RetryBudget,
}

impl StandardCodec {
    /// Codec with the given constants
    #[must_use]
    pub const fn new(config: StandardConfig) -> Self {
        Self {
            consent_retries: RetryBudget::new(config.max_retries),
            config,
            pending: None,
            registering: None,
        }
    }

    fn write_time(ctx: &mut CodecContext<'_>) {
        let now = ctx.env().now();
        let mut value = BytesMut::with_capacity(10);
        put_u16(&mut value, u16::try_from(now.year()).unwrap_or(0), Endian::Little);
        #[allow(clippy::cast_possible_truncation)]
        let fields = [
            now.month() as u8,
            now.day() as u8,
            now.hour() as u8,
            now.minute() as u8,
            now.second() as u8,
            now.weekday().number_from_monday() as u8,
        ];
        value.put_slice(&fields);
        // fractions, adjust reason
        value.put_slice(&[0, 0]);
        ctx.write(uuid16(CURRENT_TIME_SERVICE), uuid16(CURRENT_TIME), value.to_vec());
    }

    fn write_user_data(ctx: &mut CodecContext<'_>) {
        let user = &ctx.env().user;
        let service = uuid16(USER_DATA_SERVICE);

        let mut birthday = BytesMut::with_capacity(4);
        put_u16(&mut birthday, u16::try_from(user.birth_year()).unwrap_or(0), Endian::Little);
        #[allow(clippy::cast_possible_truncation)]
        let month_day = [user.birthday.month() as u8, user.birthday.day() as u8];
        birthday.put_slice(&month_day);

        let mut height = BytesMut::with_capacity(2);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let centimetres = user.height_cm.round().clamp(0.0, f32::from(u16::MAX)) as u16;
        put_u16(&mut height, centimetres, Endian::Little);

        let gender = u8::from(!user.gender.is_male());

        ctx.write(service, uuid16(DATE_OF_BIRTH), birthday.to_vec());
        ctx.write(service, uuid16(GENDER), vec![gender]);
        ctx.write(service, uuid16(HEIGHT), height.to_vec());
    }

    fn request_consent(&mut self, ctx: &mut CodecContext<'_>) {
        let env = ctx.env();
        let remote = env.remote_users();
        let stored = remote.slot_for(env.user.id).and_then(|slot| {
            Ok(slot.zip(remote.user_secret(env.user.id, CONSENT_SECRET)?))
        });

        let control_point = (uuid16(USER_DATA_SERVICE), uuid16(USER_CONTROL_POINT));
        match stored {
            Ok(Some((slot, code))) if code.len() == 2 && slot <= u64::from(u8::MAX) => {
                debug!("Requesting consent for slot {}", slot);
                let mut value = vec![UCP_CONSENT];
                value.extend_from_slice(&slot.to_le_bytes()[..1]);
                value.extend_from_slice(&code);
                self.registering = None;
                ctx.write(control_point.0, control_point.1, value);
            }
            stored => {
                if let Err(e) = stored {
                    warn!("Could not load the consent, registering anew: {}", e);
                }
                let code = rand::thread_rng().gen_range(0..=self.config.max_consent_code);
                info!("Registering user {} on the scale", env.user.id);
                let mut value = BytesMut::with_capacity(3);
                value.put_u8(UCP_REGISTER);
                put_u16(&mut value, code, Endian::Little);
                self.registering = Some(code);
                ctx.write(control_point.0, control_point.1, value.to_vec());
            }
        }
        ctx.stop();
    }

    fn on_control_point(&mut self, data: &[u8], ctx: &mut CodecContext<'_>) -> Result<()> {
        let step = ctx.current_step().unwrap_or_default();
        let (opcode, result) = match data {
            [UCP_RESPONSE, opcode, result, ..] => (*opcode, *result),
            [opcode, ..] => return Err(ScaleError::UnexpectedPacket { opcode: *opcode, step }),
            [] => return Err(ScaleError::MalformedPacket("empty control point value".to_string())),
        };
        if !ctx.is_at(STEP_CONSENT) {
            debug!("Ignoring control point response {:02X} at step {}", opcode, step);
            return Ok(());
        }

        let env = ctx.env();
        let remote = env.remote_users();
        match opcode {
            UCP_REGISTER => {
                let (Some(code), UCP_SUCCESS, Some(&index)) =
                    (self.registering.take(), result, data.get(3))
                else {
                    ctx.fail(InfoCode::MaxUsersReached, i64::from(result));
                    return Ok(());
                };
                info!("Scale registered user {} at index {}", env.user.id, index);
                remote.bind(env.user.id, u64::from(index))?;
                remote.set_user_secret(env.user.id, CONSENT_SECRET, &code.to_le_bytes())?;
                ctx.report_info(InfoCode::UserCreated, i64::from(index));
                ctx.retry();
            }
            UCP_CONSENT if result == UCP_SUCCESS => {
                debug!("Consent given");
                ctx.resume();
            }
            UCP_CONSENT => {
                ctx.report_info(InfoCode::ConsentFailed, i64::from(result));
                remote.unbind(env.user.id)?;
                if self.consent_retries.try_again() {
                    warn!("Consent refused, registering again");
                    ctx.retry();
                } else {
                    ctx.fail(InfoCode::RetryLimitExceeded, i64::try_from(step).unwrap_or(-1));
                }
            }
            _ => debug!("Control point response {:02X}: {:02X}", opcode, result),
        }
        Ok(())
    }

    fn weight_only(env: &SessionEnv) -> bool {
        let services = &env.device.services;
        !services.is_empty() && !services.contains(&uuid16(BODY_COMPOSITION_SERVICE))
    }

    fn complete(mut part: PendingMeasurement, env: &SessionEnv) -> Option<Measurement> {
        if let Some(tag) = part.device_user {
            match env.remote_users().user_for(tag) {
                Ok(user) => part.user_id = user,
                Err(e) => warn!("Could not resolve scale user {}: {}", tag, e),
            }
        }
        if part.fat_percent.is_none() {
            ImpedanceBodyLib::new(env.body_profile()).complete(&mut part);
        }
        part.finalize(Some(env.user.id), env.now())
    }

    /// Pair a decoded part with the one held back, if it belongs to it
    fn accept(&mut self, part: Part, env: &SessionEnv) -> Option<Measurement> {
        if Self::weight_only(env) {
            return Self::complete(part.data, env);
        }

        match self.pending.take() {
            None => {
                self.pending = Some(part);
                None
            }
            Some(mut held) if held.pairs_with(&part) => {
                held.data.merge(part.data);
                Self::complete(held.data, env)
            }
            Some(held) => {
                debug!("Unpaired {:?} part, emitting it alone", held.kind);
                self.pending = Some(part);
                Self::complete(held.data, env)
            }
        }
    }
}

impl DeviceCodec for StandardCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Standard
    }

    fn on_step(&mut self, step: usize, ctx: &mut CodecContext<'_>) -> bool {
        match step {
            0 => Self::write_time(ctx),
            1 => ctx.subscribe_indicate(uuid16(WEIGHT_SCALE_SERVICE), uuid16(WEIGHT_MEASUREMENT)),
            2 => {
                if Self::weight_only(ctx.env()) {
                    debug!("No body composition service");
                } else {
                    ctx.subscribe_indicate(
                        uuid16(BODY_COMPOSITION_SERVICE),
                        uuid16(BODY_COMPOSITION_MEASUREMENT),
                    );
                }
            }
            3 => ctx.subscribe_indicate(uuid16(USER_DATA_SERVICE), uuid16(USER_CONTROL_POINT)),
            4 => ctx.read(uuid16(BATTERY_SERVICE), uuid16(BATTERY_LEVEL)),
            STEP_CONSENT => self.request_consent(ctx),
            6 => Self::write_user_data(ctx),
            7 => {
                ctx.report_info(InfoCode::StepOnScale, 0);
                ctx.stop();
            }
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
        let env = ctx.env();
        let part = if characteristic == uuid16(WEIGHT_MEASUREMENT) {
            parse_weight(data)?.map(|data| Part {
                kind: PartKind::Weight,
                data,
            })
        } else if characteristic == uuid16(BODY_COMPOSITION_MEASUREMENT) {
            parse_body_composition(data)?.map(|data| Part {
                kind: PartKind::BodyComposition,
                data,
            })
        } else if characteristic == uuid16(USER_CONTROL_POINT) {
            self.on_control_point(data, ctx)?;
            None
        } else if characteristic == uuid16(BATTERY_LEVEL) {
            let level = data.first().copied().unwrap_or(100);
            debug!("Battery at {}%", level);
            if level <= self.config.low_battery_percent {
                ctx.report_info(InfoCode::LowBattery, i64::from(level));
            }
            None
        } else {
            debug!("Ignoring value of {}", characteristic);
            None
        };

        Ok(part
            .and_then(|part| self.accept(part, env))
            .map_or(Decoded::Waiting, Decoded::Ready))
    }

    fn flush(&mut self, env: &SessionEnv) -> Option<Measurement> {
        self.pending
            .take()
            .and_then(|part| Self::complete(part.data, env))
    }
}

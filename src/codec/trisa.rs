//! Trisa Body Analyze 4.0.
//!
//! The scale hands out a password once, while in pairing mode. On every
//! later connection it sends a challenge which must be answered with the
//! challenge XOR the password, followed by the current time. Readings use
//! base-10 floats: a 24-bit little-endian mantissa and a signed exponent.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bodycomp::TrisaBodyLib;
use crate::codec::{CodecContext, Decoded, DeviceCodec, DeviceFamily};
use crate::error::{Result, ScaleError};
use crate::framing::{put_u32, read_u24, read_u32, xor_with_key, Endian};
use crate::measurement::PendingMeasurement;
use crate::transport::uuid16;
use crate::types::InfoCode;

/// Primary service
pub const SERVICE: u16 = 0x7802;
const MEASUREMENT: u16 = 0x8A21;
const DOWNLOAD_COMMAND: u16 = 0x8A81;
const UPLOAD_COMMAND: u16 = 0x8A82;

const UPLOAD_PASSWORD: u8 = 0xA0;
const UPLOAD_CHALLENGE: u8 = 0xA1;

const DOWNLOAD_DATE_TIME: u8 = 0x02;
const DOWNLOAD_CHALLENGE_RESPONSE: u8 = 0x20;
const DOWNLOAD_DISCONNECT: u8 = 0x22;

const PASSWORD_SETTING: &str = "password";

/// Device timestamps count seconds from 2010-01-01T00:00:00Z
const EPOCH_2010: i64 = 1_262_304_000;

const HAS_TIMESTAMP: u8 = 0x01;
const HAS_RESISTANCE1: u8 = 0x02;
const HAS_RESISTANCE2: u8 = 0x04;

const STEP_AWAIT_CHALLENGE: usize = 2;
const STEP_AWAIT_MEASUREMENT: usize = 3;
const STEP_DONE: usize = 4;

fn base10_float(data: &[u8], offset: usize) -> Result<f32> {
    let mantissa = read_u24(data, offset, Endian::Little)?;
    let exponent = data
        .get(offset + 3)
        .map(|b| i32::from(i8::from_le_bytes([*b])))
        .ok_or_else(|| ScaleError::MalformedPacket(format!("missing exponent at {}", offset + 3)))?;

    #[allow(clippy::cast_precision_loss)]
    let mantissa = mantissa as f32;
    Ok(mantissa * 10f32.powi(exponent))
}

fn device_time(data: &[u8], offset: usize) -> Result<Option<DateTime<Utc>>> {
    let seconds = read_u32(data, offset, Endian::Little)?;
    Ok(Utc
        .timestamp_opt(EPOCH_2010 + i64::from(seconds), 0)
        .single())
}

fn seconds_since_2010(now: DateTime<Utc>) -> u32 {
    u32::try_from(now.timestamp() - EPOCH_2010).unwrap_or(0)
}

/// Codec for Trisa Body Analyze scales
#[derive(Debug, Default)]
pub struct TrisaCodec {
    authenticated: bool,
}

impl TrisaCodec {
    /// Fresh codec
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn write_command(ctx: &mut CodecContext<'_>, command: Vec<u8>) {
        ctx.write(uuid16(SERVICE), uuid16(DOWNLOAD_COMMAND), command);
    }

    fn on_upload(&mut self, data: &[u8], ctx: &mut CodecContext<'_>) -> Result<Decoded> {
        let (&opcode, payload) = data
            .split_first()
            .ok_or_else(|| ScaleError::MalformedPacket("empty upload command".to_string()))?;
        let field = payload.get(..4).ok_or_else(|| {
            ScaleError::MalformedPacket(format!("upload {opcode:02X} needs 4 bytes"))
        })?;

        let remote = ctx.env().remote_users();
        match opcode {
            UPLOAD_PASSWORD => {
                remote.set_secret(PASSWORD_SETTING, field)?;
                info!("Stored pairing password");
                ctx.report_info(InfoCode::PairingComplete, 0);
            }
            UPLOAD_CHALLENGE => {
                let Some(password) = remote.secret(PASSWORD_SETTING)? else {
                    warn!("Challenge received but the scale was never paired");
                    ctx.fail(InfoCode::PairingRequired, 0);
                    return Ok(Decoded::Waiting);
                };

                let mut response = vec![DOWNLOAD_CHALLENGE_RESPONSE];
                response.extend(xor_with_key(field, &password));
                Self::write_command(ctx, response);

                let mut time = BytesMut::with_capacity(5);
                time.put_u8(DOWNLOAD_DATE_TIME);
                put_u32(&mut time, seconds_since_2010(ctx.env().now()), Endian::Little);
                Self::write_command(ctx, time.to_vec());

                self.authenticated = true;
                if ctx.is_at(STEP_AWAIT_CHALLENGE) {
                    ctx.resume();
                }
            }
            _ => {
                return Err(ScaleError::UnexpectedPacket {
                    opcode,
                    step: ctx.current_step().unwrap_or_default(),
                })
            }
        }
        Ok(Decoded::Waiting)
    }

    fn on_measurement(data: &[u8], ctx: &mut CodecContext<'_>) -> Result<Decoded> {
        let info_byte = *data
            .first()
            .ok_or_else(|| ScaleError::MalformedPacket("empty measurement".to_string()))?;
        let env = ctx.env();

        let weight = base10_float(data, 1)?;
        let mut offset = 5;
        let mut pending = PendingMeasurement {
            weight_kg: Some(weight),
            ..Default::default()
        };

        if info_byte & HAS_TIMESTAMP != 0 {
            pending.timestamp = device_time(data, offset)?;
            offset += 4;
        }
        if info_byte & HAS_RESISTANCE1 != 0 {
            let resistance = base10_float(data, offset)?;
            offset += 4;

            let impedance = TrisaBodyLib::impedance_from_resistance(resistance);
            let lib = TrisaBodyLib::new(env.body_profile());
            pending.impedance = Some(impedance);
            pending.fat_percent = Some(lib.fat(weight, impedance));
            pending.water_percent = Some(lib.water(weight, impedance));
            pending.muscle_percent = Some(lib.muscle(weight, impedance));
            pending.bone_kg = Some(lib.bone(weight, impedance));
        }
        if info_byte & HAS_RESISTANCE2 != 0 {
            debug!("Second resistance {:.1} ignored", base10_float(data, offset)?);
        }

        Self::write_command(ctx, vec![DOWNLOAD_DISCONNECT]);
        ctx.resume_at(STEP_DONE);

        Ok(pending
            .finalize(Some(env.user.id), env.now())
            .map_or(Decoded::Waiting, Decoded::Ready))
    }
}

impl DeviceCodec for TrisaCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Trisa
    }

    fn on_step(&mut self, step: usize, ctx: &mut CodecContext<'_>) -> bool {
        match step {
            0 => {
                ctx.subscribe_indicate(uuid16(SERVICE), uuid16(MEASUREMENT));
                true
            }
            1 => {
                ctx.subscribe_indicate(uuid16(SERVICE), uuid16(UPLOAD_COMMAND));
                true
            }
            STEP_AWAIT_CHALLENGE => {
                if !self.authenticated {
                    ctx.stop();
                }
                true
            }
            STEP_AWAIT_MEASUREMENT => {
                ctx.report_info(InfoCode::StepOnScale, 0);
                ctx.stop();
                true
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
        if characteristic == uuid16(UPLOAD_COMMAND) {
            self.on_upload(data, ctx)
        } else if characteristic == uuid16(MEASUREMENT) {
            Self::on_measurement(data, ctx)
        } else {
            debug!("Ignoring data on {}", characteristic);
            Ok(Decoded::Waiting)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::{fixture, now, Fixture};
    use crate::session::Session;
    use crate::settings::RemoteUsers;
    use crate::transport::{TransportCommand, TransportEvent};
    use crate::types::DeviceInfo;

    fn session() -> (Session, Fixture) {
        let fixture = fixture(DeviceInfo::new("01257B0012".to_string(), -60));
        let session = Session::new(Box::new(TrisaCodec::new()), fixture.env.clone());
        (session, fixture)
    }

    fn upload(data: &[u8]) -> TransportEvent {
        TransportEvent::Notify {
            characteristic: uuid16(UPLOAD_COMMAND),
            data: data.to_vec(),
        }
    }

    fn measurement(data: &[u8]) -> TransportEvent {
        TransportEvent::Notify {
            characteristic: uuid16(MEASUREMENT),
            data: data.to_vec(),
        }
    }

    fn store_password(fixture: &Fixture, password: &[u8]) {
        RemoteUsers::new(fixture.settings.clone(), fixture.env.device.settings_key())
            .set_secret(PASSWORD_SETTING, password)
            .unwrap();
    }

    #[test]
    fn test_base10_float() {
        // 7650 * 10^-2
        let data = [0xE2, 0x1D, 0x00, 0xFE];
        assert!((base10_float(&data, 0).unwrap() - 76.5).abs() < 1e-4);
        assert!(base10_float(&data[..3], 0).is_err());
    }

    #[test]
    fn test_challenge_response_and_measurement() {
        let (mut session, fixture) = session();
        store_password(&fixture, &[0x01, 0x02, 0x03, 0x04]);

        let commands = session.start();
        assert_eq!(commands.len(), 2);
        assert_eq!(session.current_step(), Some(STEP_AWAIT_CHALLENGE));

        let commands = session.handle_event(upload(&[UPLOAD_CHALLENGE, 0x10, 0x20, 0x30, 0x40]));
        assert_eq!(
            commands[0].written_data(),
            Some(&[DOWNLOAD_CHALLENGE_RESPONSE, 0x11, 0x22, 0x33, 0x44][..])
        );
        let mut time = vec![DOWNLOAD_DATE_TIME];
        time.extend(seconds_since_2010(now()).to_le_bytes());
        assert_eq!(commands[1].written_data(), Some(&time[..]));
        assert_eq!(session.current_step(), Some(STEP_AWAIT_MEASUREMENT));

        // weight 76.5, timestamp, resistance 2000
        let mut packet = vec![HAS_TIMESTAMP | HAS_RESISTANCE1, 0xE2, 0x1D, 0x00, 0xFE];
        packet.extend(450_000_000u32.to_le_bytes());
        packet.extend([0xD0, 0x07, 0x00, 0x00]);
        let commands = session.handle_event(measurement(&packet));

        assert_eq!(commands[0].written_data(), Some(&[DOWNLOAD_DISCONNECT][..]));
        assert_eq!(commands.last(), Some(&TransportCommand::Disconnect));

        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 1);
        let m = &measurements[0];
        assert!((m.weight_kg - 76.5).abs() < 1e-4);
        assert_eq!(m.impedance, Some(480.0));
        assert!(m.fat.is_some());
        assert_eq!(m.timestamp.timestamp(), EPOCH_2010 + 450_000_000);
    }

    #[test]
    fn test_pairing_stores_password() {
        let (mut session, fixture) = session();
        session.start();

        session.handle_event(upload(&[UPLOAD_PASSWORD, 0xAA, 0xBB, 0xCC, 0xDD]));
        assert_eq!(fixture.sink.infos(), vec![(InfoCode::PairingComplete, 0)]);

        let remote = RemoteUsers::new(fixture.settings.clone(), fixture.env.device.settings_key());
        assert_eq!(
            remote.secret(PASSWORD_SETTING).unwrap(),
            Some(vec![0xAA, 0xBB, 0xCC, 0xDD])
        );
    }

    #[test]
    fn test_challenge_without_password_fails() {
        let (mut session, fixture) = session();
        session.start();

        let commands = session.handle_event(upload(&[UPLOAD_CHALLENGE, 1, 2, 3, 4]));
        assert_eq!(commands, vec![TransportCommand::Disconnect]);
        assert_eq!(fixture.sink.infos(), vec![(InfoCode::PairingRequired, 0)]);
    }

    #[test]
    fn test_short_packets_are_discarded() {
        let (mut session, fixture) = session();
        session.start();

        assert!(session.handle_event(upload(&[UPLOAD_CHALLENGE, 1])).is_empty());
        assert!(session.handle_event(upload(&[0x55, 1, 2, 3, 4])).is_empty());
        assert!(session.handle_event(measurement(&[0x01, 0xE2])).is_empty());
        assert!(!session.is_terminated());
        assert!(fixture.sink.measurements().is_empty());
    }
}

//! OKOK (Chipsea) scales broadcast their reading in manufacturer data and
//! never accept a connection.
//!
//! Payload after the `0x20CA` company id:
//!
//! | offset | content |
//! |---|---|
//! | 6 | flags: bit 0 final, bits 1-2 divider index |
//! | 8..10 | weight, big endian |
//! | 10..12 | impedance, big endian |
//! | 12 | XOR of `0x20` and bytes 0..12 |

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bodycomp::ImpedanceBodyLib;
use crate::codec::{CodecContext, Decoded, DeviceCodec, DeviceFamily};
use crate::error::{Result, ScaleError};
use crate::framing::{read_u16, xor_checksum, Endian};
use crate::measurement::PendingMeasurement;
use crate::transport::MANUFACTURER_DATA;
use crate::types::InfoCode;

/// Company id the readings are advertised under
pub const MANUFACTURER_ID: u16 = 0x20CA;

const IDX_FLAGS: usize = 6;
const IDX_WEIGHT: usize = 8;
const IDX_IMPEDANCE: usize = 10;
const IDX_CHECKSUM: usize = 12;

/// The company id's high byte takes part in the checksum
const CHECKSUM_SEED: u8 = 0x20;

/// Family constants
#[derive(Debug, Clone, PartialEq)]
pub struct OkokConfig {
    /// Weight divider for each value of flag bits 1-2. Index 3 is not seen
    /// on known hardware and is treated like index 0.
    pub dividers: [f32; 4],
}

impl Default for OkokConfig {
    fn default() -> Self {
        Self {
            dividers: [10.0, 1.0, 100.0, 10.0],
        }
    }
}

/// Decoder for OKOK advertisements
#[derive(Debug)]
pub struct OkokCodec {
    config: OkokConfig,
    last_final: Option<(u16, u16)>,
}

impl OkokCodec {
    /// Codec with the given constants
    #[must_use]
    pub const fn new(config: OkokConfig) -> Self {
        Self {
            config,
            last_final: None,
        }
    }

    fn divider(&self, flags: u8) -> f32 {
        let index = usize::from((flags >> 1) & 0x03);
        if index == 3 {
            warn!("Unknown divider index 3, assuming {}", self.config.dividers[3]);
        }
        self.config.dividers[index]
    }
}

impl DeviceCodec for OkokCodec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Okok
    }

    fn requires_connection(&self) -> bool {
        false
    }

    fn on_step(&mut self, step: usize, ctx: &mut CodecContext<'_>) -> bool {
        match step {
            0 => {
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
        if characteristic != MANUFACTURER_DATA {
            return Ok(Decoded::Waiting);
        }

        let company = read_u16(data, 0, Endian::Little)?;
        if company != MANUFACTURER_ID {
            return Ok(Decoded::Waiting);
        }
        let payload = &data[2..];
        if payload.len() <= IDX_CHECKSUM {
            return Err(ScaleError::MalformedPacket(format!(
                "OKOK payload too short: {} bytes",
                payload.len()
            )));
        }

        let expected = CHECKSUM_SEED ^ xor_checksum(payload, 0, IDX_CHECKSUM);
        if payload[IDX_CHECKSUM] != expected {
            return Err(ScaleError::ChecksumMismatch {
                expected,
                actual: payload[IDX_CHECKSUM],
            });
        }

        let flags = payload[IDX_FLAGS];
        let raw_weight = read_u16(payload, IDX_WEIGHT, Endian::Big)?;
        let raw_impedance = read_u16(payload, IDX_IMPEDANCE, Endian::Big)?;
        let weight = f32::from(raw_weight) / self.divider(flags);

        if flags & 0x01 == 0 {
            debug!("Live weight {:.2}", weight);
            #[allow(clippy::cast_possible_truncation)]
            let grams = (weight * 1000.0) as i64;
            ctx.report_info(InfoCode::MeasurementInProgress, grams);
            return Ok(Decoded::Waiting);
        }

        if self.last_final == Some((raw_weight, raw_impedance)) {
            debug!("Ignoring repeated final advertisement");
            return Ok(Decoded::Waiting);
        }
        self.last_final = Some((raw_weight, raw_impedance));

        let env = ctx.env();
        let mut pending = PendingMeasurement {
            weight_kg: Some(weight),
            impedance: (raw_impedance > 0).then_some(f32::from(raw_impedance)),
            ..Default::default()
        };
        ImpedanceBodyLib::new(env.body_profile()).complete(&mut pending);

        let measurement = pending.finalize(Some(env.user.id), env.now());
        ctx.resume();
        Ok(measurement.map_or(Decoded::Waiting, Decoded::Ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::fixture;
    use crate::session::Session;
    use crate::transport::{TransportCommand, TransportEvent};
    use crate::types::DeviceInfo;

    fn advertisement(flags: u8, weight: u16, impedance: u16) -> Vec<u8> {
        let mut payload = vec![0u8; 13];
        payload[IDX_FLAGS] = flags;
        payload[IDX_WEIGHT..IDX_WEIGHT + 2].copy_from_slice(&weight.to_be_bytes());
        payload[IDX_IMPEDANCE..IDX_IMPEDANCE + 2].copy_from_slice(&impedance.to_be_bytes());
        payload[IDX_CHECKSUM] = CHECKSUM_SEED ^ xor_checksum(&payload, 0, IDX_CHECKSUM);

        let mut data = vec![0xCA, 0x20];
        data.extend(payload);
        data
    }

    fn event(data: Vec<u8>) -> TransportEvent {
        TransportEvent::Notify {
            characteristic: MANUFACTURER_DATA,
            data,
        }
    }

    fn session() -> (Session, crate::codec::testing::Fixture) {
        let fixture = fixture(DeviceInfo::new(String::new(), -70));
        let session = Session::new(
            Box::new(OkokCodec::new(OkokConfig::default())),
            fixture.env.clone(),
        );
        (session, fixture)
    }

    #[test]
    fn test_final_reading_with_divider_100() {
        let (mut session, fixture) = session();
        assert!(session.start().is_empty());
        assert!(!session.requires_connection());

        let commands = session.handle_event(event(advertisement(0x05, 7623, 0)));

        assert_eq!(commands, vec![TransportCommand::Disconnect]);
        let measurements = fixture.sink.measurements();
        assert_eq!(measurements.len(), 1);
        assert!((measurements[0].weight_kg - 76.23).abs() < 1e-4);
        assert_eq!(measurements[0].impedance, None);
        assert_eq!(fixture.sink.infos(), vec![(InfoCode::StepOnScale, 0)]);
    }

    #[test]
    fn test_dividers() {
        let codec = OkokCodec::new(OkokConfig::default());
        assert!((codec.divider(0x01) - 10.0).abs() < f32::EPSILON);
        assert!((codec.divider(0x03) - 1.0).abs() < f32::EPSILON);
        assert!((codec.divider(0x05) - 100.0).abs() < f32::EPSILON);
        assert!((codec.divider(0x07) - 10.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_live_weight_and_bad_checksum() {
        let (mut session, fixture) = session();
        session.start();

        assert!(session.handle_event(event(advertisement(0x04, 7000, 0))).is_empty());

        let mut corrupted = advertisement(0x05, 7623, 0);
        corrupted[2 + IDX_WEIGHT] ^= 0x01;
        assert!(session.handle_event(event(corrupted)).is_empty());

        assert!(fixture.sink.measurements().is_empty());
        assert!(fixture
            .sink
            .infos()
            .contains(&(InfoCode::MeasurementInProgress, 70_000)));
        assert!(!session.is_terminated());
    }

    #[test]
    fn test_impedance_feeds_body_composition() {
        let (mut session, fixture) = session();
        session.start();
        session.handle_event(event(advertisement(0x01, 802, 480)));

        let measurement = &fixture.sink.measurements()[0];
        assert!((measurement.weight_kg - 80.2).abs() < 1e-4);
        assert_eq!(measurement.impedance, Some(480.0));
        assert!(measurement.fat.is_some());
    }

    #[test]
    fn test_repeated_final_is_ignored() {
        let mut codec = OkokCodec::new(OkokConfig::default());
        let fixture = fixture(DeviceInfo::new(String::new(), -70));
        let mut control = crate::sequencer::StepControl::new();
        let mut outbox = Vec::new();
        let mut ctx = CodecContext::new(&mut control, &mut outbox, &fixture.env);

        let packet = advertisement(0x05, 7623, 0);
        assert!(matches!(
            codec.decode(MANUFACTURER_DATA, &packet, &mut ctx).unwrap(),
            Decoded::Ready(_)
        ));
        assert_eq!(
            codec.decode(MANUFACTURER_DATA, &packet, &mut ctx).unwrap(),
            Decoded::Waiting
        );
    }

    #[test]
    fn test_foreign_manufacturer_data_is_ignored() {
        let (mut session, fixture) = session();
        session.start();
        let mut data = advertisement(0x05, 7623, 0);
        data[0] = 0x4C;
        session.handle_event(event(data));
        assert!(fixture.sink.measurements().is_empty());
    }
}

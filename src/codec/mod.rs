//! Per-family wire protocols.
//!
//! Every family implements [`DeviceCodec`]: a step handler that queues the
//! outgoing packet for each numbered step, and a decoder that validates an
//! inbound packet, updates the codec's own session state and steers the
//! sequence through the [`CodecContext`]. Codec state lives in the codec
//! value itself, which a [`Session`](crate::session::Session) owns exclusively.

use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::Result;
use crate::measurement::Measurement;
use crate::sequencer::StepControl;
use crate::session::SessionEnv;
use crate::transport::{uuid16, TransportCommand};
use crate::types::{DeviceInfo, InfoCode};

/// Beurer BF700/BF800 and Sanitas SBF70 family
pub mod beurer;
/// Huawei AH100 encrypted family
pub mod huawei;
/// OKOK advertisement-only family
pub mod okok;
/// Bluetooth SIG weight scale and body composition profiles
pub mod standard;
/// Trisa Body Analyze family
pub mod trisa;

pub use beurer::{BeurerCodec, BeurerConfig, BeurerVariant};
pub use huawei::{HuaweiCodec, HuaweiConfig};
pub use okok::{OkokCodec, OkokConfig};
pub use standard::{StandardCodec, StandardConfig};
pub use trisa::TrisaCodec;

/// What a decoded packet amounted to
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// State updated, nothing to hand out yet
    Waiting,
    /// A finished measurement, to be emitted once
    Ready(Measurement),
}

/// Protocol implementation for one device family
pub trait DeviceCodec: Send {
    /// Family this codec speaks
    fn family(&self) -> DeviceFamily;

    /// Whether the scale needs a GATT connection (advertisement-only scales don't)
    fn requires_connection(&self) -> bool {
        true
    }

    /// Interval of the keep-alive hook, if the scale falls asleep without one
    fn keep_alive_interval(&self) -> Option<Duration> {
        None
    }

    /// Queue the packets for `step`. Returning `false` ends the sequence.
    fn on_step(&mut self, step: usize, ctx: &mut CodecContext<'_>) -> bool;

    /// Handle a notification or read value.
    ///
    /// # Errors
    ///
    /// Packet errors ([`ScaleError::is_packet_error`]) make the session drop
    /// the packet and keep waiting; any other error ends the session.
    ///
    /// [`ScaleError::is_packet_error`]: crate::error::ScaleError::is_packet_error
    fn decode(
        &mut self,
        characteristic: Uuid,
        data: &[u8],
        ctx: &mut CodecContext<'_>,
    ) -> Result<Decoded>;

    /// Periodic hook, called every [`keep_alive_interval`](Self::keep_alive_interval)
    fn on_keep_alive(&mut self, _ctx: &mut CodecContext<'_>) {}

    /// Hand out whatever partial reading the protocol allows saving when the
    /// session ends before it was confirmed
    fn flush(&mut self, _env: &SessionEnv) -> Option<Measurement> {
        None
    }
}

/// Everything a codec may touch while handling a step or a packet
pub struct CodecContext<'a> {
    steps: &'a mut StepControl,
    outbox: &'a mut Vec<TransportCommand>,
    env: &'a SessionEnv,
    released: Vec<Measurement>,
}

impl<'a> CodecContext<'a> {
    /// Bind a context to a session's step control, outbox and environment
    pub fn new(
        steps: &'a mut StepControl,
        outbox: &'a mut Vec<TransportCommand>,
        env: &'a SessionEnv,
    ) -> Self {
        Self {
            steps,
            outbox,
            env,
            released: Vec::new(),
        }
    }

    /// Measurements released through [`release`](Self::release), consuming the context
    #[must_use]
    pub fn into_released(self) -> Vec<Measurement> {
        self.released
    }

    /// Session environment
    #[must_use]
    pub const fn env(&self) -> &'a SessionEnv {
        self.env
    }

    /// Step that is running or was run last
    #[must_use]
    pub fn current_step(&self) -> Option<usize> {
        self.steps.current()
    }

    /// Whether the sequence sits at `step`
    #[must_use]
    pub fn is_at(&self, step: usize) -> bool {
        self.steps.current() == Some(step)
    }

    /// Park the sequence until the device answers
    pub fn stop(&mut self) {
        self.steps.stop();
    }

    /// Continue with the next step
    pub fn resume(&mut self) {
        self.steps.resume();
    }

    /// Continue at `step`
    pub fn resume_at(&mut self, step: usize) {
        self.steps.resume_at(step);
    }

    /// Redirect the next step
    pub fn jump_to(&mut self, step: usize) {
        self.steps.jump_to(step);
    }

    /// Redirect only while sitting at `only_if_at`
    pub fn jump_to_if(&mut self, step: usize, only_if_at: usize) -> bool {
        self.steps.jump_to_if(step, only_if_at)
    }

    /// Re-run the current step and resume
    pub fn retry(&mut self) {
        self.steps.retry_current();
        self.steps.resume();
    }

    /// End the sequence after the current call
    pub fn finish(&mut self) {
        self.steps.finish();
    }

    /// Write with response
    pub fn write(&mut self, service: Uuid, characteristic: Uuid, data: Vec<u8>) {
        debug!("Queue write {:02X?}", data);
        self.outbox.push(TransportCommand::Write {
            service,
            characteristic,
            data,
            with_response: true,
        });
    }

    /// Write without response
    pub fn write_without_response(&mut self, service: Uuid, characteristic: Uuid, data: Vec<u8>) {
        debug!("Queue write without response {:02X?}", data);
        self.outbox.push(TransportCommand::Write {
            service,
            characteristic,
            data,
            with_response: false,
        });
    }

    /// Enable notifications
    pub fn subscribe_notify(&mut self, service: Uuid, characteristic: Uuid) {
        self.outbox.push(TransportCommand::SubscribeNotify {
            service,
            characteristic,
        });
    }

    /// Enable indications
    pub fn subscribe_indicate(&mut self, service: Uuid, characteristic: Uuid) {
        self.outbox.push(TransportCommand::SubscribeIndicate {
            service,
            characteristic,
        });
    }

    /// Request a read; the value comes back through [`DeviceCodec::decode`]
    pub fn read(&mut self, service: Uuid, characteristic: Uuid) {
        self.outbox.push(TransportCommand::Read {
            service,
            characteristic,
        });
    }

    /// Hand out a measurement finished outside [`DeviceCodec::decode`]'s return
    /// value, such as a held reading whose user turned up during a step
    pub fn release(&mut self, measurement: Measurement) {
        debug!("Releasing measurement of {:.2} kg", measurement.weight_kg);
        self.released.push(measurement);
    }

    /// Show a progress message
    pub fn report_info(&self, code: InfoCode, arg: i64) {
        self.env.sink.report_info(code, arg);
    }

    /// Terminal failure: tell the user and end the session
    pub fn fail(&mut self, code: InfoCode, arg: i64) {
        error!("Session failed: {} ({})", code, arg);
        self.env.sink.report_info(code, arg);
        self.steps.finish();
    }
}

/// Supported device families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    /// OKOK / Chipsea advertisement scales
    Okok,
    /// Trisa Body Analyze 4.0
    Trisa,
    /// Beurer BF700/BF800 and Sanitas SBF70 relatives
    Beurer(BeurerVariant),
    /// Any scale implementing the SIG weight scale profile
    Standard,
    /// Huawei AH100
    Huawei,
}

impl DeviceFamily {
    /// Pick the family from advertised name, services and manufacturer data.
    ///
    /// Vendor names win over generic services, so a vendor scale that also
    /// advertises the SIG weight service gets its own codec.
    #[must_use]
    pub fn detect(device: &DeviceInfo) -> Option<Self> {
        let name = device.name.to_lowercase();
        let has_service = |short: u16| device.services.contains(&uuid16(short));

        if let Some(variant) = BeurerVariant::from_name(&name) {
            return Some(Self::Beurer(variant));
        }
        if name.starts_with("01257b") || name.starts_with("11257b") || has_service(trisa::SERVICE)
        {
            return Some(Self::Trisa);
        }
        if name.starts_with("ch100") || name.starts_with("ah100") || has_service(huawei::SERVICE)
        {
            return Some(Self::Huawei);
        }
        if device.manufacturer_ids.contains(&okok::MANUFACTURER_ID) {
            return Some(Self::Okok);
        }
        if has_service(standard::WEIGHT_SCALE_SERVICE)
            || has_service(standard::BODY_COMPOSITION_SERVICE)
        {
            return Some(Self::Standard);
        }
        None
    }

    /// Codec with the family's default configuration
    #[must_use]
    pub fn create_codec(self) -> Box<dyn DeviceCodec> {
        match self {
            Self::Okok => Box::new(OkokCodec::new(OkokConfig::default())),
            Self::Trisa => Box::new(TrisaCodec::new()),
            Self::Beurer(variant) => Box::new(BeurerCodec::new(variant, BeurerConfig::default())),
            Self::Standard => Box::new(StandardCodec::new(StandardConfig::default())),
            Self::Huawei => Box::new(HuaweiCodec::new(HuaweiConfig::default())),
        }
    }
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Okok => write!(f, "OKOK"),
            Self::Trisa => write!(f, "Trisa Body Analyze"),
            Self::Beurer(BeurerVariant::Beurer) => write!(f, "Beurer BF700/BF800"),
            Self::Beurer(BeurerVariant::Sanitas) => write!(f, "Sanitas SBF70"),
            Self::Standard => write!(f, "Bluetooth SIG weight scale"),
            Self::Huawei => write!(f, "Huawei AH100"),
        }
    }
}

/// Codec for a discovered device
///
/// # Errors
///
/// [`ScaleError::UnsupportedDevice`](crate::error::ScaleError::UnsupportedDevice)
/// if no family claims the device.
pub fn codec_for(device: &DeviceInfo) -> Result<Box<dyn DeviceCodec>> {
    DeviceFamily::detect(device)
        .map(DeviceFamily::create_codec)
        .ok_or_else(|| crate::error::ScaleError::UnsupportedDevice(device.name.clone()))
}


#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str) -> DeviceInfo {
        DeviceInfo::new(name.to_string(), -60)
    }

    #[test]
    fn test_detect_by_name() {
        assert_eq!(
            DeviceFamily::detect(&device("BEURER BF700")),
            Some(DeviceFamily::Beurer(BeurerVariant::Beurer))
        );
        assert_eq!(
            DeviceFamily::detect(&device("SANITAS SBF70")),
            Some(DeviceFamily::Beurer(BeurerVariant::Sanitas))
        );
        assert_eq!(DeviceFamily::detect(&device("01257B0012")), Some(DeviceFamily::Trisa));
        assert_eq!(DeviceFamily::detect(&device("CH100")), Some(DeviceFamily::Huawei));
        assert_eq!(DeviceFamily::detect(&device("Kitchen scale")), None);
    }

    #[test]
    fn test_detect_by_advertisement() {
        let mut okok = device("");
        okok.manufacturer_ids.push(okok::MANUFACTURER_ID);
        assert_eq!(DeviceFamily::detect(&okok), Some(DeviceFamily::Okok));

        let mut generic = device("Scale");
        generic.services.push(uuid16(standard::WEIGHT_SCALE_SERVICE));
        assert_eq!(DeviceFamily::detect(&generic), Some(DeviceFamily::Standard));

        // vendor name wins over the generic service
        let mut beurer = device("BF800");
        beurer.services.push(uuid16(standard::WEIGHT_SCALE_SERVICE));
        assert_eq!(
            DeviceFamily::detect(&beurer),
            Some(DeviceFamily::Beurer(BeurerVariant::Beurer))
        );
    }

    #[test]
    fn test_codec_for() {
        let codec = codec_for(&device("AH100")).unwrap();
        assert_eq!(codec.family(), DeviceFamily::Huawei);
        assert!(codec.keep_alive_interval().is_some());
        assert!(codec_for(&device("Toaster")).is_err());
        assert_eq!(DeviceFamily::Okok.to_string(), "OKOK");
    }
}

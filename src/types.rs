use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, ScaleError};

/// Pounds to kilograms
pub const KG_PER_LB: f32 = 0.453_592_37;

/// Weight unit shown on the scale display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WeightUnit {
    /// Kilograms
    #[default]
    Kilograms,
    /// Pounds
    Pounds,
    /// Stones
    Stones,
}

impl WeightUnit {
    /// Convert a value expressed in this unit to kilograms
    #[must_use]
    pub fn to_kg(self, value: f32) -> f32 {
        match self {
            Self::Kilograms => value,
            Self::Pounds => value * KG_PER_LB,
            Self::Stones => value * 14.0 * KG_PER_LB,
        }
    }
}

impl fmt::Display for WeightUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kilograms => write!(f, "kg"),
            Self::Pounds => write!(f, "lb"),
            Self::Stones => write!(f, "st"),
        }
    }
}

/// Biological sex used by the body composition formulas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    /// Male
    Male,
    /// Female
    Female,
}

impl Gender {
    /// Whether the profile is male
    #[must_use]
    pub const fn is_male(self) -> bool {
        matches!(self, Self::Male)
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Male => write!(f, "male"),
            Self::Female => write!(f, "female"),
        }
    }
}

/// Local user profile, owned by the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleUser {
    /// Local profile id
    pub id: u32,
    /// Display name
    pub name: String,
    /// Date of birth
    pub birthday: NaiveDate,
    /// Body height in centimetres
    pub height_cm: f32,
    /// Biological sex
    pub gender: Gender,
    /// Activity level, 1 (sedentary) to 5 (very active)
    pub activity_level: u8,
    /// Last known weight, used by scales that need a reference weight
    pub initial_weight_kg: f32,
    /// Preferred display unit
    pub unit: WeightUnit,
}

impl ScaleUser {
    /// Age in full years on the given day
    #[must_use]
    pub fn age_on(&self, day: NaiveDate) -> u32 {
        day.years_since(self.birthday).unwrap_or(0)
    }

    /// Year of birth
    #[must_use]
    pub fn birth_year(&self) -> i32 {
        self.birthday.year()
    }
}

/// Information about a discovered scale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Advertised device name
    pub name: String,
    /// Device MAC address
    pub mac_address: Option<String>,
    /// Signal strength (RSSI)
    pub rssi: i16,
    /// Advertised GATT services
    pub services: Vec<Uuid>,
    /// Company ids present in the manufacturer data
    pub manufacturer_ids: Vec<u16>,
}

impl DeviceInfo {
    /// Create new device info
    #[must_use]
    pub const fn new(name: String, rssi: i16) -> Self {
        Self {
            name,
            mac_address: None,
            rssi,
            services: Vec::new(),
            manufacturer_ids: Vec::new(),
        }
    }

    /// Attach a MAC address
    #[must_use]
    pub fn with_mac_address(mut self, mac_address: &str) -> Self {
        self.mac_address = Some(mac_address.to_uppercase());
        self
    }

    /// MAC address as six bytes in display order
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::InvalidParameters`] if no address is known or it
    /// is not in `XX:XX:XX:XX:XX:XX` form.
    pub fn mac_bytes(&self) -> Result<[u8; 6]> {
        let mac = self.mac_address.as_deref().ok_or_else(|| {
            ScaleError::InvalidParameters(format!("no MAC address known for {}", self.name))
        })?;
        parse_mac_address(mac)
    }

    /// Stable key identifying this device in the settings store
    #[must_use]
    pub fn settings_key(&self) -> String {
        self.mac_address
            .as_deref()
            .map_or_else(|| self.name.clone(), |mac| mac.replace(':', ""))
    }
}

/// Parse a `XX:XX:XX:XX:XX:XX` MAC address
///
/// # Errors
///
/// Returns [`ScaleError::InvalidParameters`] on a malformed address.
pub fn parse_mac_address(mac_address: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac_address.split(':').collect();
    if parts.len() != 6 {
        return Err(ScaleError::InvalidParameters(format!(
            "Invalid MAC address format: {mac_address}. Expected format: XX:XX:XX:XX:XX:XX"
        )));
    }

    let mut mac_bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(ScaleError::InvalidParameters(format!(
                "Invalid MAC address byte: {part}"
            )));
        }
        mac_bytes[i] = u8::from_str_radix(part, 16).map_err(|_| {
            ScaleError::InvalidParameters(format!("Invalid MAC address byte: {part}"))
        })?;
    }

    Ok(mac_bytes)
}

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Link is being established
    Connecting,
    /// Link is up and services are discovered
    Connected,
    /// Link is gone
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// User-facing progress and error messages passed to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoCode {
    /// The user should step on the scale
    StepOnScale,
    /// Live weight while the reading settles, argument in grams
    MeasurementInProgress,
    /// Battery is low, argument is the level in percent
    LowBattery,
    /// A device-side user slot was created, argument is the slot
    UserCreated,
    /// The scale has no free user slot
    MaxUsersReached,
    /// The scale must be put into pairing mode first
    PairingRequired,
    /// Pairing secret received and stored
    PairingComplete,
    /// The user must confirm on the scale (enrolment in progress)
    ConfirmOnScale,
    /// The scale rejected authentication, argument is the attempt count
    AuthenticationFailed,
    /// The scale rejected enrolment
    EnrollmentFailed,
    /// Consent for a device-side user was refused, argument is the slot
    ConsentFailed,
    /// Too many unexpected replies, argument is the step
    RetryLimitExceeded,
    /// The scale refused the measurement request, argument is the status
    MeasurementRejected,
    /// The session ended on an unrecoverable error, argument is the step
    SessionFailed,
}

impl fmt::Display for InfoCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepOnScale => write!(f, "Step on the scale"),
            Self::MeasurementInProgress => write!(f, "Measuring"),
            Self::LowBattery => write!(f, "Scale battery low"),
            Self::UserCreated => write!(f, "User created on scale"),
            Self::MaxUsersReached => write!(f, "Scale has no free user slot"),
            Self::PairingRequired => write!(f, "Put the scale into pairing mode"),
            Self::PairingComplete => write!(f, "Pairing complete"),
            Self::ConfirmOnScale => write!(f, "Confirm the user on the scale"),
            Self::AuthenticationFailed => write!(f, "Authentication failed"),
            Self::EnrollmentFailed => write!(f, "Enrollment failed"),
            Self::ConsentFailed => write!(f, "User consent refused"),
            Self::RetryLimitExceeded => write!(f, "Scale kept answering unexpectedly"),
            Self::MeasurementRejected => write!(f, "Measurement rejected"),
            Self::SessionFailed => write!(f, "Communication with the scale failed"),
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Connection timeout in milliseconds
    pub timeout_ms: u64,
    /// Extra connection attempts after the first one fails
    pub retry_attempts: u32,
    /// Scan timeout in milliseconds
    pub scan_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry_attempts: 3,
            scan_timeout_ms: 10_000,
        }
    }
}

/// Timeouts applied while a session runs
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Disconnect when the scale stays silent this long, in milliseconds
    pub idle_timeout_ms: u64,
    /// Timeout for a single transport command, in milliseconds
    pub command_timeout_ms: u64,
    /// Delay between connection attempts, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
            command_timeout_ms: 5_000,
            retry_delay_ms: 500,
        }
    }
}

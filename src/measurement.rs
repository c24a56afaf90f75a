//! Measurement records and the accumulator they are built in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A finished weighing, handed to the sink exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Body weight in kilograms
    pub weight_kg: f32,
    /// Raw impedance in ohm
    pub impedance: Option<f32>,
    /// Body fat in percent
    pub fat: Option<f32>,
    /// Body water in percent
    pub water: Option<f32>,
    /// Muscle in percent
    pub muscle: Option<f32>,
    /// Bone mass in kilograms
    pub bone: Option<f32>,
    /// Visceral fat rating
    pub visceral_fat: Option<f32>,
    /// Lean body mass in kilograms
    pub lbm: Option<f32>,
    /// Heart rate in beats per minute
    pub heart_rate: Option<u8>,
    /// Time of the weighing
    pub timestamp: DateTime<Utc>,
    /// Local profile the reading belongs to
    pub user_id: Option<u32>,
}

impl Measurement {
    /// Weight-only record
    #[must_use]
    pub const fn new(weight_kg: f32, timestamp: DateTime<Utc>) -> Self {
        Self {
            weight_kg,
            impedance: None,
            fat: None,
            water: None,
            muscle: None,
            bone: None,
            visceral_fat: None,
            lbm: None,
            heart_rate: None,
            timestamp,
            user_id: None,
        }
    }
}

/// Fields decoded so far for a weighing that is not final yet.
///
/// Protocols that spread one weighing over several notifications fill this
/// incrementally and turn it into a [`Measurement`] with [`finalize`].
/// Mass-valued composition fields are kept in kilograms until the weight is
/// known, then converted to percentages.
///
/// [`finalize`]: PendingMeasurement::finalize
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingMeasurement {
    /// Body weight in kilograms
    pub weight_kg: Option<f32>,
    /// Raw impedance in ohm
    pub impedance: Option<f32>,
    /// Body fat in percent
    pub fat_percent: Option<f32>,
    /// Body water in percent
    pub water_percent: Option<f32>,
    /// Body water in kilograms
    pub water_mass_kg: Option<f32>,
    /// Muscle in percent
    pub muscle_percent: Option<f32>,
    /// Muscle in kilograms
    pub muscle_mass_kg: Option<f32>,
    /// Bone mass in kilograms
    pub bone_kg: Option<f32>,
    /// Visceral fat rating
    pub visceral_fat: Option<f32>,
    /// Lean body mass in kilograms
    pub lbm_kg: Option<f32>,
    /// Heart rate in beats per minute
    pub heart_rate: Option<u8>,
    /// Device clock at the time of the weighing
    pub timestamp: Option<DateTime<Utc>>,
    /// Device-side user tag (slot, index or remote id)
    pub device_user: Option<u64>,
    /// Local profile resolved from the device-side tag
    pub user_id: Option<u32>,
}

impl PendingMeasurement {
    /// Whether the reading carries a device-side user tag
    #[must_use]
    pub const fn is_tagged(&self) -> bool {
        self.device_user.is_some()
    }

    /// Whether nothing has been decoded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fill every field still missing here from `other`
    pub fn merge(&mut self, other: Self) {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
            if slot.is_none() {
                *slot = value;
            }
        }

        fill(&mut self.weight_kg, other.weight_kg);
        fill(&mut self.impedance, other.impedance);
        fill(&mut self.fat_percent, other.fat_percent);
        fill(&mut self.water_percent, other.water_percent);
        fill(&mut self.water_mass_kg, other.water_mass_kg);
        fill(&mut self.muscle_percent, other.muscle_percent);
        fill(&mut self.muscle_mass_kg, other.muscle_mass_kg);
        fill(&mut self.bone_kg, other.bone_kg);
        fill(&mut self.visceral_fat, other.visceral_fat);
        fill(&mut self.lbm_kg, other.lbm_kg);
        fill(&mut self.heart_rate, other.heart_rate);
        fill(&mut self.timestamp, other.timestamp);
        fill(&mut self.device_user, other.device_user);
        fill(&mut self.user_id, other.user_id);
    }

    /// Turn the accumulated fields into a record.
    ///
    /// Returns `None` when no usable weight was decoded. `fallback_user` tags
    /// readings that could not be resolved to a profile, `now` stands in for
    /// a missing device timestamp.
    #[must_use]
    pub fn finalize(self, fallback_user: Option<u32>, now: DateTime<Utc>) -> Option<Measurement> {
        let weight_kg = self.weight_kg.filter(|w| *w > 0.0)?;
        let percent_of_weight = |mass: f32| mass / weight_kg * 100.0;

        Some(Measurement {
            weight_kg,
            impedance: self.impedance,
            fat: self.fat_percent,
            water: self
                .water_percent
                .or_else(|| self.water_mass_kg.map(percent_of_weight)),
            muscle: self
                .muscle_percent
                .or_else(|| self.muscle_mass_kg.map(percent_of_weight)),
            bone: self.bone_kg,
            visceral_fat: self.visceral_fat,
            lbm: self.lbm_kg,
            heart_rate: self.heart_rate,
            timestamp: self.timestamp.unwrap_or(now),
            user_id: self.user_id.or(fallback_user),
        })
    }
}

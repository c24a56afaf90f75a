//! Empirical body composition fits.
//!
//! Each family's firmware or companion app ships its own regression; these
//! are reproduced as-is and treated as opaque calculators.

use crate::measurement::PendingMeasurement;
use crate::types::{Gender, ScaleUser};

fn bmi(weight_kg: f32, height_cm: f32) -> f32 {
    let height_m = height_cm / 100.0;
    weight_kg / (height_m * height_m)
}

/// Inputs shared by every calculator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyProfile {
    /// Biological sex
    pub gender: Gender,
    /// Age in years
    pub age: u32,
    /// Height in centimetres
    pub height_cm: f32,
}

impl BodyProfile {
    /// Profile of a local user at the given age
    #[must_use]
    pub const fn from_user(user: &ScaleUser, age: u32) -> Self {
        Self {
            gender: user.gender,
            age,
            height_cm: user.height_cm,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn age_f(&self) -> f32 {
        self.age as f32
    }
}

/// Gallagher-style fat-free-mass fit driven by the impedance index (height²/R)
#[derive(Debug, Clone, Copy)]
pub struct ImpedanceBodyLib {
    profile: BodyProfile,
}

impl ImpedanceBodyLib {
    /// Calculator for one profile
    #[must_use]
    pub const fn new(profile: BodyProfile) -> Self {
        Self { profile }
    }

    fn impedance_index(&self, impedance: f32) -> f32 {
        self.profile.height_cm * self.profile.height_cm / impedance
    }

    /// Lean body mass in kilograms
    #[must_use]
    pub fn lbm(&self, weight_kg: f32, impedance: f32) -> f32 {
        let index = self.impedance_index(impedance);
        if self.profile.gender.is_male() {
            0.485 * index + 0.338 * weight_kg + 5.32
        } else {
            0.474 * index + 0.180 * weight_kg + 5.03
        }
    }

    /// Body fat in percent
    #[must_use]
    pub fn fat(&self, weight_kg: f32, impedance: f32) -> f32 {
        let fat = (weight_kg - self.lbm(weight_kg, impedance)) / weight_kg * 100.0;
        fat.clamp(3.0, 75.0)
    }

    /// Body water in percent
    #[must_use]
    pub fn water(&self, weight_kg: f32, impedance: f32) -> f32 {
        (self.lbm(weight_kg, impedance) * 0.73 / weight_kg * 100.0).clamp(35.0, 75.0)
    }

    /// Skeletal muscle in percent
    #[must_use]
    pub fn muscle(&self, weight_kg: f32, impedance: f32) -> f32 {
        let sex = if self.profile.gender.is_male() { 1.0 } else { 0.0 };
        let muscle_kg = 0.401 * self.impedance_index(impedance) + 3.825 * sex
            - 0.071 * self.profile.age_f()
            + 5.102;
        (muscle_kg / weight_kg * 100.0).clamp(10.0, 60.0)
    }

    /// Bone mass in kilograms
    #[must_use]
    pub fn bone(&self, weight_kg: f32, impedance: f32) -> f32 {
        self.lbm(weight_kg, impedance) * 0.05
    }

    /// Fill composition fields the device did not report
    pub fn complete(&self, pending: &mut PendingMeasurement) {
        let (Some(weight), Some(impedance)) = (pending.weight_kg, pending.impedance) else {
            return;
        };
        if weight <= 0.0 || impedance <= 0.0 {
            return;
        }

        pending.merge(PendingMeasurement {
            fat_percent: Some(self.fat(weight, impedance)),
            water_percent: Some(self.water(weight, impedance)),
            muscle_percent: Some(self.muscle(weight, impedance)),
            bone_kg: Some(self.bone(weight, impedance)),
            lbm_kg: Some(self.lbm(weight, impedance)),
            ..Default::default()
        });
    }
}

/// Regression shipped with the Trisa Body Analyze scales
#[derive(Debug, Clone, Copy)]
pub struct TrisaBodyLib {
    profile: BodyProfile,
}

impl TrisaBodyLib {
    /// Calculator for one profile
    #[must_use]
    pub const fn new(profile: BodyProfile) -> Self {
        Self { profile }
    }

    /// Impedance from the scale's first resistance reading
    #[must_use]
    pub fn impedance_from_resistance(resistance: f32) -> f32 {
        if resistance < 410.0 {
            3.0
        } else {
            (resistance - 400.0) * 3.0 / 10.0
        }
    }

    fn bmi(&self, weight_kg: f32) -> f32 {
        bmi(weight_kg, self.profile.height_cm)
    }

    /// Body water in percent
    #[must_use]
    pub fn water(&self, weight_kg: f32, impedance: f32) -> f32 {
        let bmi = self.bmi(weight_kg);
        let age = self.profile.age_f();
        if self.profile.gender.is_male() {
            87.51 + (-1.162 * bmi - 0.008_13 * impedance + 0.075_94 * age)
        } else {
            77.721 + (-1.148 * bmi - 0.005_73 * impedance + 0.064_48 * age)
        }
    }

    /// Body fat in percent
    #[must_use]
    pub fn fat(&self, weight_kg: f32, impedance: f32) -> f32 {
        let bmi = self.bmi(weight_kg);
        let age = self.profile.age_f();
        if self.profile.gender.is_male() {
            bmi * (1.479 + 4.4e-4 * impedance) + 0.1 * age - 21.764
        } else {
            bmi * (1.506 + 3.908e-4 * impedance) + 0.1 * age - 12.834
        }
    }

    /// Muscle in percent
    #[must_use]
    pub fn muscle(&self, weight_kg: f32, impedance: f32) -> f32 {
        let bmi = self.bmi(weight_kg);
        let age = self.profile.age_f();
        if self.profile.gender.is_male() {
            74.627 + (-0.811 * bmi - 0.005_65 * impedance - 0.367 * age)
        } else {
            57.0 + (-0.694 * bmi - 0.003_44 * impedance - 0.255 * age)
        }
    }

    /// Bone mass in kilograms
    #[must_use]
    pub fn bone(&self, weight_kg: f32, impedance: f32) -> f32 {
        let bmi = self.bmi(weight_kg);
        let age = self.profile.age_f();
        let percent = if self.profile.gender.is_male() {
            7.829 + (-0.0855 * bmi - 5.92e-4 * impedance - 0.0389 * age)
        } else {
            7.98 + (-0.0973 * bmi - 4.84e-4 * impedance - 0.036 * age)
        };
        percent * weight_kg / 100.0
    }
}

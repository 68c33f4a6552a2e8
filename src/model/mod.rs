use serde::{Deserialize, Serialize};

/// Desired light state as the automation platform expresses it: brightness
/// as a 0.0-1.0 fraction and RGB channels 0.0-1.0 with brightness already
/// multiplied in. The engine divides the brightness back out before
/// quantizing (see `engine::target_from_platform`).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DesiredLightState {
    pub on: bool,
    pub brightness: f32,
    pub red: f32,
    pub green: f32,
    pub blue: f32,
}

impl Default for DesiredLightState {
    fn default() -> Self {
        Self {
            on: false,
            brightness: 1.0,
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        }
    }
}

/// Integer state the dispatch engine converges the blade toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BladeTarget {
    pub power: bool,
    /// Percent, 0-100.
    pub brightness: u8,
    pub color: (u8, u8, u8),
}

/// Last state the saber reported via type-3 notifications. Owned by the BLE
/// session; the dispatch engine never reads it (it keeps its own sent-value
/// cache instead).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaberState {
    pub is_on: bool,
    pub battery_percent: u8,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub brightness: u8,
    pub volume: u8,
    pub sound_font: u16,
    pub total_sound_fonts: u16,
    pub light_effect: u8,
    pub hardware_version: String,
    pub software_version: String,
}

impl Default for SaberState {
    fn default() -> Self {
        Self {
            is_on: false,
            battery_percent: 0,
            red: 255,
            green: 255,
            blue: 255,
            brightness: 100,
            volume: 0,
            sound_font: 0,
            total_sound_fonts: 0,
            light_effect: 0,
            hardware_version: String::new(),
            software_version: String::new(),
        }
    }
}

use crate::model::SaberState;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

// Primary control service: notifications and the handshake write.
pub const SERVICE_CONTROL: Uuid = Uuid::from_u128(0x0000dae0_0000_1000_8000_00805f9b34fb);
pub const CHAR_CONTROL: Uuid = Uuid::from_u128(0x0000dae1_0000_1000_8000_00805f9b34fb);

// Secondary service: the write-no-response command channel.
pub const SERVICE_COMMAND: Uuid = Uuid::from_u128(0x00003ab0_0000_1000_8000_00805f9b34fb);
pub const CHAR_COMMAND: Uuid = Uuid::from_u128(0x00003ab1_0000_1000_8000_00805f9b34fb);

/// Message format is a JSON array `[type, {parameters}]`. Commands to the
/// saber use type 2, notifications from it use type 3.
pub const MSG_TYPE_COMMAND: i64 = 2;
pub const MSG_TYPE_STATUS: i64 = 3;

pub const PARAM_POWER_ON: &str = "PowerOn";
pub const PARAM_POWER: &str = "Power"; // battery percentage, status only
pub const PARAM_BACKGROUND_COLOR: &str = "BackgroundColor";
pub const PARAM_BRIGHTNESS: &str = "Brightness";
pub const PARAM_VOLUME: &str = "Volume";
pub const PARAM_SOUND_FONT: &str = "CurrentSoundPackageNo";
pub const PARAM_TOTAL_SOUND_FONTS: &str = "TotalSoundPackage";
pub const PARAM_LIGHT_EFFECT: &str = "CurrentLightEffect";
pub const PARAM_HARDWARE_VERSION: &str = "HardwareVersion";
pub const PARAM_SOFTWARE_VERSION: &str = "SoftwareVersion";
pub const PARAM_CLASH: &str = "Clash";
pub const PARAM_BLASTER: &str = "Blaster";
pub const PARAM_FORCE: &str = "Force";
pub const PARAM_LOCKUP: &str = "Lockup";
pub const PARAM_DRAG: &str = "Drag";

// The saber accepts commands only after this two-step exchange:
// `[2,{"HandShake":"HelloDamien"}]` written to 0xDAE1 with response, then
// `[2,{"Authorize":"SaberOfDamien"}]` written to 0x3AB1 without response.
// It answers `[3,{"Authorize":"AccessAllowed"}]` once access is granted.
pub const PARAM_HANDSHAKE: &str = "HandShake";
pub const HANDSHAKE_VALUE: &str = "HelloDamien";
pub const PARAM_AUTHORIZE: &str = "Authorize";
pub const AUTHORIZE_VALUE: &str = "SaberOfDamien";
pub const AUTHORIZE_RESPONSE: &str = "AccessAllowed";

pub const LIGHT_EFFECT_MIN: u8 = 1;
pub const LIGHT_EFFECT_MAX: u8 = 9;

fn command(param: &str, value: Value) -> Vec<u8> {
    let mut body = Map::new();
    body.insert(param.to_string(), value);
    Value::Array(vec![MSG_TYPE_COMMAND.into(), Value::Object(body)])
        .to_string()
        .into_bytes()
}

pub fn encode_handshake() -> Vec<u8> {
    command(PARAM_HANDSHAKE, HANDSHAKE_VALUE.into())
}

pub fn encode_authorize() -> Vec<u8> {
    command(PARAM_AUTHORIZE, AUTHORIZE_VALUE.into())
}

pub fn encode_power(on: bool) -> Vec<u8> {
    command(PARAM_POWER_ON, on.into())
}

pub fn encode_brightness(percent: u8) -> Vec<u8> {
    command(PARAM_BRIGHTNESS, percent.min(100).into())
}

pub fn encode_color(red: u8, green: u8, blue: u8) -> Vec<u8> {
    command(
        PARAM_BACKGROUND_COLOR,
        Value::Array(vec![red.into(), green.into(), blue.into()]),
    )
}

pub fn encode_volume(volume: u8) -> Vec<u8> {
    command(PARAM_VOLUME, volume.min(100).into())
}

pub fn encode_sound_font(font_no: u16) -> Vec<u8> {
    command(PARAM_SOUND_FONT, font_no.into())
}

pub fn encode_light_effect(effect: u8) -> Vec<u8> {
    command(
        PARAM_LIGHT_EFFECT,
        effect.clamp(LIGHT_EFFECT_MIN, LIGHT_EFFECT_MAX).into(),
    )
}

/// One-shot combat effects trigger once and produce no notification feedback;
/// lockup and drag stay active until explicitly turned off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuxCommand {
    Volume { value: u8 },
    SoundFont { value: u16 },
    LightEffect { value: u8 },
    Clash,
    Blaster,
    Force,
    Lockup { on: bool },
    Drag { on: bool },
}

impl AuxCommand {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            AuxCommand::Volume { value } => encode_volume(value),
            AuxCommand::SoundFont { value } => encode_sound_font(value),
            AuxCommand::LightEffect { value } => encode_light_effect(value),
            AuxCommand::Clash => command(PARAM_CLASH, true.into()),
            AuxCommand::Blaster => command(PARAM_BLASTER, true.into()),
            AuxCommand::Force => command(PARAM_FORCE, true.into()),
            AuxCommand::Lockup { on } => command(PARAM_LOCKUP, on.into()),
            AuxCommand::Drag { on } => command(PARAM_DRAG, on.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceMessage {
    pub msg_type: i64,
    pub params: Map<String, Value>,
}

/// Decode one message from the saber. Returns `None` for anything that is
/// not UTF-8 JSON of the form `[type, {params}]`.
pub fn decode_message(data: &[u8]) -> Option<DeviceMessage> {
    let parsed: Value = serde_json::from_slice(data).ok()?;
    let items = parsed.as_array()?;
    if items.len() < 2 {
        return None;
    }
    let msg_type = items[0].as_i64()?;
    let params = match &items[1] {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    Some(DeviceMessage { msg_type, params })
}

/// Whether a decoded message is the authorization grant.
pub fn is_authorize_granted(msg: &DeviceMessage) -> bool {
    msg.params.get(PARAM_AUTHORIZE).and_then(Value::as_str) == Some(AUTHORIZE_RESPONSE)
}

/// Merge the fields present in a status notification into the observed
/// state. Absent parameters leave their fields untouched.
pub fn apply_status(state: &mut SaberState, params: &Map<String, Value>) {
    if let Some(on) = params.get(PARAM_POWER_ON).and_then(Value::as_bool) {
        state.is_on = on;
    }
    if let Some(battery) = get_u8(params, PARAM_POWER) {
        state.battery_percent = battery;
    }
    if let Some(brightness) = get_u8(params, PARAM_BRIGHTNESS) {
        state.brightness = brightness;
    }
    if let Some(volume) = get_u8(params, PARAM_VOLUME) {
        state.volume = volume;
    }
    if let Some(font) = get_u16(params, PARAM_SOUND_FONT) {
        state.sound_font = font;
    }
    if let Some(total) = get_u16(params, PARAM_TOTAL_SOUND_FONTS) {
        state.total_sound_fonts = total;
    }
    if let Some(effect) = get_u8(params, PARAM_LIGHT_EFFECT) {
        state.light_effect = effect;
    }
    if let Some(version) = params.get(PARAM_HARDWARE_VERSION).and_then(Value::as_str) {
        state.hardware_version = version.to_string();
    }
    if let Some(version) = params.get(PARAM_SOFTWARE_VERSION).and_then(Value::as_str) {
        state.software_version = version.to_string();
    }
    if let Some(color) = params.get(PARAM_BACKGROUND_COLOR).and_then(Value::as_array) {
        if color.len() >= 3 {
            if let (Some(r), Some(g), Some(b)) = (
                value_u8(&color[0]),
                value_u8(&color[1]),
                value_u8(&color[2]),
            ) {
                state.red = r;
                state.green = g;
                state.blue = b;
            }
        }
    }
}

fn get_u8(params: &Map<String, Value>, key: &str) -> Option<u8> {
    params.get(key).and_then(value_u8)
}

fn get_u16(params: &Map<String, Value>, key: &str) -> Option<u16> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok())
}

fn value_u8(value: &Value) -> Option<u8> {
    value.as_u64().and_then(|v| u8::try_from(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_encode_compact_json() {
        assert_eq!(encode_power(true), br#"[2,{"PowerOn":true}]"#);
        assert_eq!(encode_power(false), br#"[2,{"PowerOn":false}]"#);
        assert_eq!(encode_brightness(50), br#"[2,{"Brightness":50}]"#);
        assert_eq!(
            encode_color(255, 0, 128),
            br#"[2,{"BackgroundColor":[255,0,128]}]"#
        );
        assert_eq!(encode_volume(30), br#"[2,{"Volume":30}]"#);
        assert_eq!(encode_sound_font(4), br#"[2,{"CurrentSoundPackageNo":4}]"#);
        assert_eq!(encode_light_effect(3), br#"[2,{"CurrentLightEffect":3}]"#);
    }

    #[test]
    fn handshake_and_authorize_encode_expected_secrets() {
        assert_eq!(encode_handshake(), br#"[2,{"HandShake":"HelloDamien"}]"#);
        assert_eq!(encode_authorize(), br#"[2,{"Authorize":"SaberOfDamien"}]"#);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        assert_eq!(encode_brightness(200), br#"[2,{"Brightness":100}]"#);
        assert_eq!(encode_volume(101), br#"[2,{"Volume":100}]"#);
        assert_eq!(encode_light_effect(0), br#"[2,{"CurrentLightEffect":1}]"#);
        assert_eq!(encode_light_effect(12), br#"[2,{"CurrentLightEffect":9}]"#);
    }

    #[test]
    fn aux_commands_encode_their_parameter() {
        assert_eq!(AuxCommand::Clash.encode(), br#"[2,{"Clash":true}]"#);
        assert_eq!(AuxCommand::Blaster.encode(), br#"[2,{"Blaster":true}]"#);
        assert_eq!(
            AuxCommand::Lockup { on: false }.encode(),
            br#"[2,{"Lockup":false}]"#
        );
        assert_eq!(
            AuxCommand::Volume { value: 40 }.encode(),
            br#"[2,{"Volume":40}]"#
        );
    }

    #[test]
    fn decode_accepts_status_messages() {
        let msg = decode_message(br#"[3,{"PowerOn":true,"Power":63}]"#).unwrap();
        assert_eq!(msg.msg_type, MSG_TYPE_STATUS);
        assert_eq!(msg.params.get("Power").and_then(Value::as_u64), Some(63));
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert!(decode_message(b"\xff\xfe").is_none());
        assert!(decode_message(b"not json").is_none());
        assert!(decode_message(br#"{"PowerOn":true}"#).is_none());
        assert!(decode_message(br#"[3]"#).is_none());
    }

    #[test]
    fn decode_tolerates_non_object_params() {
        let msg = decode_message(br#"[3,42]"#).unwrap();
        assert_eq!(msg.msg_type, 3);
        assert!(msg.params.is_empty());
    }

    #[test]
    fn status_merge_only_touches_present_fields() {
        let mut state = SaberState::default();
        let msg = decode_message(br#"[3,{"Power":63,"Volume":25}]"#).unwrap();
        apply_status(&mut state, &msg.params);
        assert_eq!(state.battery_percent, 63);
        assert_eq!(state.volume, 25);
        // untouched defaults
        assert_eq!((state.red, state.green, state.blue), (255, 255, 255));
        assert_eq!(state.brightness, 100);
    }

    #[test]
    fn status_merge_applies_background_color() {
        let mut state = SaberState::default();
        let msg = decode_message(br#"[3,{"BackgroundColor":[10,20,30]}]"#).unwrap();
        apply_status(&mut state, &msg.params);
        assert_eq!((state.red, state.green, state.blue), (10, 20, 30));
    }

    #[test]
    fn authorize_grant_is_detected() {
        let msg = decode_message(br#"[3,{"Authorize":"AccessAllowed"}]"#).unwrap();
        assert!(is_authorize_granted(&msg));
        let msg = decode_message(br#"[3,{"Authorize":"AccessDenied"}]"#).unwrap();
        assert!(!is_authorize_granted(&msg));
    }
}

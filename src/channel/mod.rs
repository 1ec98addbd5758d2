//! Client command protocol
//!
//! The bridge and its single client exchange discrete JSON text frames. Inbound frames carry
//! a `cmd` tag, outbound frames an `event` tag; the transport that moves the text (and its
//! framing) lives outside this crate. Parsing is strict about mandatory fields: a frame that
//! does not deserialize is answered with an `error` event and changes nothing.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::effects::EffectParamsUpdate;
use crate::UnicastAddress;

fn default_src_address() -> u16 {
    0x0001
}

fn default_sleep_mode() -> u8 {
    1
}

fn default_cct_kelvin() -> u32 {
    5600
}

/// Per-effect parameters of the `set_effect` frame
///
/// Flattened into the command object; every field is optional and effects read only what
/// they use.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EffectFields {
    pub intensity: Option<f32>,
    pub cct_kelvin: Option<u32>,
    pub hue: Option<u16>,
    pub saturation: Option<u8>,
    pub frequency: Option<u8>,
    pub trigger: Option<u8>,
    pub speed: Option<u8>,
    pub minimum: Option<u8>,
    pub color: Option<u8>,
    pub type_val: Option<u8>,
    pub color_mode: Option<String>,
    pub sleep_mode: Option<u8>,
}

/// Inbound command frames
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Initialise the crypto context; resets the sequence counter
    SetKeys {
        /// 32 hex characters
        network_key: String,
        /// 32 hex characters
        app_key: String,
        iv_index: u32,
        #[serde(default = "default_src_address")]
        src_address: u16,
    },

    /// Add or update a registry entry
    AddLight {
        id: String,
        unicast: UnicastAddress,
        #[serde(default)]
        name: String,
    },

    /// Start the proxy scan unless a session is already up
    Connect,

    /// Close the proxy and mark every light disconnected
    Disconnect,

    SetCct {
        unicast: UnicastAddress,
        /// Percent, 0..=100
        intensity: f32,
        cct_kelvin: u32,
        #[serde(default = "default_sleep_mode")]
        sleep_mode: u8,
    },

    SetHsi {
        unicast: UnicastAddress,
        intensity: f32,
        hue: u16,
        saturation: u8,
        #[serde(default = "default_cct_kelvin")]
        cct_kelvin: u32,
        #[serde(default = "default_sleep_mode")]
        sleep_mode: u8,
    },

    Sleep {
        unicast: UnicastAddress,
        on: bool,
    },

    /// Send one hardware effect frame
    SetEffect {
        unicast: UnicastAddress,
        effect_type: u8,
        #[serde(flatten)]
        fields: EffectFields,
    },

    /// Launch a software effect
    StartEffect {
        unicast: UnicastAddress,
        engine: String,
        #[serde(default)]
        params: EffectParamsUpdate,
    },

    /// Mutate a running software effect in place
    UpdateEffect {
        unicast: UnicastAddress,
        params: EffectParamsUpdate,
    },

    StopEffect {
        unicast: UnicastAddress,
    },

    StopAll,
}

/// Outbound event frames
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Emitted whenever a client attaches
    Ready {
        version: &'static str,
        max_lights: usize,
    },

    LightStatus {
        unicast: UnicastAddress,
        connected: bool,
    },

    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The frame was not valid JSON, had an unknown `cmd`, or missed a mandatory field
    Malformed(String),
    /// A key string was not exactly 32 hex characters
    InvalidKey(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ChannelError::Malformed(ref msg) => write!(f, "Malformed frame: {}", msg),
            ChannelError::InvalidKey(ref what) => {
                write!(f, "Invalid {}: expected 32 hex characters", what)
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Parse one inbound text frame
pub fn parse_frame(text: &str) -> Result<Command, ChannelError> {
    serde_json::from_str(text).map_err(|e| ChannelError::Malformed(e.to_string()))
}

/// Serialize one outbound event frame
pub fn serialize_event(event: &Event) -> String {
    // the Event derive contains nothing that can fail to serialize
    serde_json::to_string(event).unwrap_or_else(|e| {
        log::error!("event serialization failed: {}", e);

        String::from(r#"{"event":"error","message":"internal serialization failure"}"#)
    })
}

/// Decode a 128-bit key from its 32 hex character transport form
pub fn parse_key(hex: &str, what: &str) -> Result<[u8; 16], ChannelError> {
    let bytes = hex.as_bytes();

    if bytes.len() != 32 || !bytes.iter().all(u8::is_ascii_hexdigit) {
        return Err(ChannelError::InvalidKey(what.to_string()));
    }

    let mut key = [0u8; 16];

    for (i, chunk) in bytes.chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16).ok_or_else(|| ChannelError::InvalidKey(what.to_string()))?;
        let lo = (chunk[1] as char).to_digit(16).ok_or_else(|| ChannelError::InvalidKey(what.to_string()))?;

        key[i] = ((hi << 4) | lo) as u8;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_keys_parses_with_default_source() {
        let cmd = parse_frame(
            r#"{"cmd":"set_keys","network_key":"7DD7364CD842AD18C17C74656C696E6B","app_key":"63964771734FBD76E3B474656C696E6B","iv_index":305419896}"#,
        )
        .unwrap();

        match cmd {
            Command::SetKeys {
                network_key,
                iv_index,
                src_address,
                ..
            } => {
                assert_eq!("7DD7364CD842AD18C17C74656C696E6B", network_key);
                assert_eq!(0x12345678, iv_index);
                assert_eq!(0x0001, src_address);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn set_cct_defaults_the_sleep_mode() {
        let cmd = parse_frame(r#"{"cmd":"set_cct","unicast":2,"intensity":55.5,"cct_kelvin":5600}"#).unwrap();

        match cmd {
            Command::SetCct {
                unicast,
                intensity,
                cct_kelvin,
                sleep_mode,
            } => {
                assert_eq!(2, unicast);
                assert_eq!(55.5, intensity);
                assert_eq!(5600, cct_kelvin);
                assert_eq!(1, sleep_mode);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn missing_mandatory_fields_are_rejected() {
        // no intensity
        assert!(parse_frame(r#"{"cmd":"set_cct","unicast":2}"#).is_err());

        // no unicast
        assert!(parse_frame(r#"{"cmd":"stop_effect"}"#).is_err());
    }

    #[test]
    fn unknown_cmd_is_rejected() {
        assert!(parse_frame(r#"{"cmd":"warp_drive"}"#).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_frame("not json at all").is_err());
        assert!(parse_frame("").is_err());
    }

    #[test]
    fn set_effect_collects_flat_per_effect_fields() {
        let cmd = parse_frame(
            r#"{"cmd":"set_effect","unicast":2,"effect_type":6,"frequency":4,"trigger":1,"color_mode":"hsi","hue":120}"#,
        )
        .unwrap();

        match cmd {
            Command::SetEffect {
                unicast,
                effect_type,
                fields,
            } => {
                assert_eq!(2, unicast);
                assert_eq!(6, effect_type);
                assert_eq!(Some(4), fields.frequency);
                assert_eq!(Some(1), fields.trigger);
                assert_eq!(Some("hsi".to_string()), fields.color_mode);
                assert_eq!(Some(120), fields.hue);
                assert_eq!(None, fields.intensity);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn start_effect_carries_camel_case_params() {
        let cmd = parse_frame(
            r#"{"cmd":"start_effect","unicast":2,"engine":"strobe","params":{"intensity":100,"strobeHz":4}}"#,
        )
        .unwrap();

        match cmd {
            Command::StartEffect { engine, params, .. } => {
                assert_eq!("strobe", engine);
                assert_eq!(Some(100.0), params.intensity);
                assert_eq!(Some(4.0), params.strobe_hz);
                assert_eq!(None, params.frequency);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn start_effect_params_object_is_optional() {
        let cmd = parse_frame(r#"{"cmd":"start_effect","unicast":2,"engine":"fire"}"#).unwrap();

        match cmd {
            Command::StartEffect { params, .. } => assert!(params.intensity.is_none()),
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn events_serialize_with_their_tag() {
        let ready = serialize_event(&Event::Ready {
            version: "0.1.0",
            max_lights: 9,
        });

        let value: serde_json::Value = serde_json::from_str(&ready).unwrap();

        assert_eq!("ready", value["event"]);
        assert_eq!(9, value["max_lights"]);

        let status = serialize_event(&Event::LightStatus {
            unicast: 2,
            connected: true,
        });

        let value: serde_json::Value = serde_json::from_str(&status).unwrap();

        assert_eq!("light_status", value["event"]);
        assert_eq!(true, value["connected"]);

        let error = serialize_event(&Event::Error {
            message: "nope".to_string(),
        });

        let value: serde_json::Value = serde_json::from_str(&error).unwrap();

        assert_eq!("error", value["event"]);
        assert_eq!("nope", value["message"]);
    }

    #[test]
    fn keys_must_be_exactly_32_hex_characters() {
        assert!(parse_key("7DD7364CD842AD18C17C74656C696E6B", "network key").is_ok());

        // lower case accepted
        assert_eq!(
            parse_key("7DD7364CD842AD18C17C74656C696E6B", "k").unwrap(),
            parse_key("7dd7364cd842ad18c17c74656c696e6b", "k").unwrap()
        );

        // too short, too long, not hex
        assert!(parse_key("7DD7", "k").is_err());
        assert!(parse_key("7DD7364CD842AD18C17C74656C696E6B00", "k").is_err());
        assert!(parse_key("ZZD7364CD842AD18C17C74656C696E6B", "k").is_err());
    }

    #[test]
    fn parsed_key_bytes_are_big_endian_pairs() {
        let key = parse_key("7DD7364CD842AD18C17C74656C696E6B", "k").unwrap();

        assert_eq!(0x7D, key[0]);
        assert_eq!(0xD7, key[1]);
        assert_eq!(0x6B, key[15]);
    }
}

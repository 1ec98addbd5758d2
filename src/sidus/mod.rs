//! Sidus control payload encoder
//!
//! Application-level light control rides in a 10 byte payload behind the vendor access opcode
//! `0x26`. The payload is a packed 80-bit field; byte zero carries an arithmetic checksum of
//! the other nine. The packing order is idiosyncratic (see [`bits`]) and has to be reproduced
//! bit for bit.
//!
//! Four command families exist: CCT (white light with colour temperature), HSI (colour),
//! sleep (power state), and the hardware effect table the luminaires synthesise themselves.
//! Anything the encoder does not recognise is downgraded to the effect-off frame rather than
//! rejected, matching what the lights themselves do with unknown codes.

pub mod bits;

use core::fmt;
use core::str::FromStr;

use bits::{BitWriter, PAYLOAD_LEN};

/// Vendor access-layer opcode carried in front of every Sidus payload
pub const ACCESS_OPCODE: u8 = 0x26;

/// Length of a complete access message: opcode plus payload
pub const ACCESS_MESSAGE_LEN: usize = 1 + PAYLOAD_LEN;

const COMMAND_TYPE_HSI: u32 = 1;
const COMMAND_TYPE_CCT: u32 = 2;
const COMMAND_TYPE_EFFECT: u32 = 7;
const COMMAND_TYPE_SLEEP: u32 = 12;

/// Every payload terminates with this single opera-type bit set
const OPERA_TYPE: u32 = 1;

/// Green/magenta trim is pinned neutral; the bridge does not expose it
const GM_NEUTRAL: u32 = 100;
const GM_FLAG_NEUTRAL: u32 = 0;

/// Colour routing for commands that exist in both a CCT and an HSI rendition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Cct,
    Hsi,
}

impl Default for ColorMode {
    fn default() -> Self {
        ColorMode::Cct
    }
}

impl FromStr for ColorMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "cct" => Ok(ColorMode::Cct),
            "hsi" => Ok(ColorMode::Hsi),
            _ => Err(()),
        }
    }
}

/// The hardware effect table of the luminaires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEffect {
    Paparazzi,
    Lightning,
    TvFlicker,
    Candle,
    Fire,
    Strobe,
    Explosion,
    FaultyBulb,
    Pulsing,
    Welding,
    CopCar,
    Party,
    Fireworks,
    Off,
}

impl HardwareEffect {
    /// Map a wire code onto the table; unknown codes fall back to [`HardwareEffect::Off`]
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => HardwareEffect::Paparazzi,
            2 => HardwareEffect::Lightning,
            3 => HardwareEffect::TvFlicker,
            4 => HardwareEffect::Candle,
            5 => HardwareEffect::Fire,
            6 => HardwareEffect::Strobe,
            7 => HardwareEffect::Explosion,
            8 => HardwareEffect::FaultyBulb,
            9 => HardwareEffect::Pulsing,
            10 => HardwareEffect::Welding,
            11 => HardwareEffect::CopCar,
            13 => HardwareEffect::Party,
            14 => HardwareEffect::Fireworks,
            _ => HardwareEffect::Off,
        }
    }

    pub fn code(&self) -> u8 {
        match *self {
            HardwareEffect::Paparazzi => 1,
            HardwareEffect::Lightning => 2,
            HardwareEffect::TvFlicker => 3,
            HardwareEffect::Candle => 4,
            HardwareEffect::Fire => 5,
            HardwareEffect::Strobe => 6,
            HardwareEffect::Explosion => 7,
            HardwareEffect::FaultyBulb => 8,
            HardwareEffect::Pulsing => 9,
            HardwareEffect::Welding => 10,
            HardwareEffect::CopCar => 11,
            HardwareEffect::Party => 13,
            HardwareEffect::Fireworks => 14,
            HardwareEffect::Off => 15,
        }
    }
}

impl fmt::Display for HardwareEffect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HardwareEffect::Paparazzi => write!(f, "Paparazzi"),
            HardwareEffect::Lightning => write!(f, "Lightning"),
            HardwareEffect::TvFlicker => write!(f, "TV Flicker"),
            HardwareEffect::Candle => write!(f, "Candle"),
            HardwareEffect::Fire => write!(f, "Fire"),
            HardwareEffect::Strobe => write!(f, "Strobe"),
            HardwareEffect::Explosion => write!(f, "Explosion"),
            HardwareEffect::FaultyBulb => write!(f, "Faulty Bulb"),
            HardwareEffect::Pulsing => write!(f, "Pulsing"),
            HardwareEffect::Welding => write!(f, "Welding"),
            HardwareEffect::CopCar => write!(f, "Cop Car"),
            HardwareEffect::Party => write!(f, "Party"),
            HardwareEffect::Fireworks => write!(f, "Fireworks"),
            HardwareEffect::Off => write!(f, "Effect Off"),
        }
    }
}

/// Intensity in tenths of a percent, clamped to the 0..=1000 wire range
fn intensity_field(percent: f32) -> u32 {
    let tenths = (percent * 10.0).round();

    if tenths <= 0.0 {
        0
    } else if tenths >= 1000.0 {
        1000
    } else {
        tenths as u32
    }
}

/// Colour temperature in 10 K steps, clamped to the supported 1800..=20000 K span
fn cct_steps(kelvin: u32) -> u32 {
    (kelvin / 10).max(180).min(2000)
}

/// Split the 10 K step count into the 10-bit value and the high flag
///
/// Temperatures above 10000 K wrap: the field carries the excess and the flag marks it.
fn cct_field(kelvin: u32) -> (u32, u32) {
    let steps = cct_steps(kelvin);

    if steps > 1000 {
        (steps - 1000, 1)
    } else {
        (steps, 0)
    }
}

/// The 8-bit colour temperature used inside HSI payloads (50 K steps, same wrap rule)
fn cct_field_hsi(kelvin: u32) -> (u32, u32) {
    let steps = (kelvin / 50).max(36).min(400);

    if steps > 200 {
        (steps - 200, 1)
    } else {
        (steps, 0)
    }
}

/// Split the green/magenta trim into its high flag and 7-bit value
fn compute_gm(gm_flag: u32, gm: u32) -> (u32, u32) {
    if gm_flag == 0 {
        (0, (gm + 5) / 10)
    } else if gm > 100 {
        (1, gm - 100)
    } else {
        (0, gm)
    }
}

fn hue_field(hue: u16) -> u32 {
    u32::from(hue % 360)
}

fn saturation_field(saturation: u8) -> u32 {
    u32::from(saturation.min(100))
}

fn frequency_field(frequency: u8) -> u32 {
    u32::from(frequency.min(15))
}

/// Frame a packed payload as the 11 byte access message
pub fn access_message(payload: &[u8; PAYLOAD_LEN]) -> [u8; ACCESS_MESSAGE_LEN] {
    let mut msg = [0u8; ACCESS_MESSAGE_LEN];

    msg[0] = ACCESS_OPCODE;
    msg[1..].copy_from_slice(payload);

    msg
}

/// White light: intensity plus colour temperature
#[derive(Debug, Clone, Copy)]
pub struct CctCommand {
    /// Percent, 0.0..=100.0
    pub intensity: f32,
    pub cct_kelvin: u32,
    /// `false` renders the frame as a power-off
    pub awake: bool,
}

impl CctCommand {
    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let (gm_high, gm_value) = compute_gm(GM_FLAG_NEUTRAL, GM_NEUTRAL);
        let (cct_value, cct_high) = cct_field(self.cct_kelvin);

        let mut w = BitWriter::new();

        w.zeros(8);
        w.push(self.awake as u32, 1);
        w.zeros(20);
        w.zeros(12);
        w.push(0, 1); // autoPatch
        w.push(cct_high, 1);
        w.push(GM_FLAG_NEUTRAL, 1);
        w.push(gm_high, 1);
        w.push(gm_value, 7);
        w.push(cct_value, 10);
        w.push(intensity_field(self.intensity), 10);
        w.push(COMMAND_TYPE_CCT, 7);
        w.push(OPERA_TYPE, 1);

        w.finish()
    }
}

/// Colour light: hue, saturation, intensity
#[derive(Debug, Clone, Copy)]
pub struct HsiCommand {
    pub intensity: f32,
    /// Degrees on the colour wheel, taken modulo 360
    pub hue: u16,
    /// Percent, clamped to 100
    pub saturation: u8,
    pub cct_kelvin: u32,
    pub awake: bool,
}

impl HsiCommand {
    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let (gm_high, gm_value) = compute_gm(GM_FLAG_NEUTRAL, GM_NEUTRAL);
        let (cct_value, cct_high) = cct_field_hsi(self.cct_kelvin);

        let mut w = BitWriter::new();

        w.zeros(8);
        w.push(self.awake as u32, 1);
        w.zeros(18);
        w.push(0, 1); // autoPatch
        w.push(cct_high, 1);
        w.push(GM_FLAG_NEUTRAL, 1);
        w.push(gm_high, 1);
        w.push(gm_value, 7);
        w.push(cct_value, 8);
        w.push(saturation_field(self.saturation), 7);
        w.push(hue_field(self.hue), 9);
        w.push(intensity_field(self.intensity), 10);
        w.push(COMMAND_TYPE_HSI, 7);
        w.push(OPERA_TYPE, 1);

        w.finish()
    }
}

/// Power state frame
#[derive(Debug, Clone, Copy)]
pub struct SleepCommand {
    /// `true` wakes the light, `false` puts it to sleep
    pub awake: bool,
}

impl SleepCommand {
    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut w = BitWriter::new();

        w.zeros(8);
        w.push(self.awake as u32, 1);
        w.zeros(63);
        w.push(COMMAND_TYPE_SLEEP, 7);
        w.push(OPERA_TYPE, 1);

        w.finish()
    }
}

/// One hardware effect frame
///
/// Only the fields the selected effect actually encodes are read; the rest may stay at their
/// defaults. Two tail families exist on the wire: the simple effects close with
/// `frq, intensity, code`, the parameterised ones with `intensity, frq, mode, code`.
#[derive(Debug, Clone)]
pub struct EffectCommand {
    pub effect: HardwareEffect,
    pub color_mode: ColorMode,
    pub intensity: f32,
    pub cct_kelvin: u32,
    pub hue: u16,
    pub saturation: u8,
    /// Effect frequency step, 0..=15
    pub frequency: u8,
    /// Trigger source selector, 2 bits
    pub trigger: u8,
    /// Speed selector, 4 bits
    pub speed: u8,
    /// Welding minimum level, 7 bits
    pub minimum: u8,
    /// Cop-car colour scheme, 4 bits
    pub color: u8,
    /// Fireworks type selector
    pub type_val: u8,
    pub awake: bool,
}

impl Default for EffectCommand {
    fn default() -> Self {
        EffectCommand {
            effect: HardwareEffect::Off,
            color_mode: ColorMode::Cct,
            intensity: 100.0,
            cct_kelvin: 5600,
            hue: 0,
            saturation: 100,
            frequency: 5,
            trigger: 0,
            speed: 0,
            minimum: 0,
            color: 0,
            type_val: 0,
            awake: true,
        }
    }
}

impl EffectCommand {
    /// Tail of the simple effect family: `frq, intensity, effect code, command type, opera`
    fn push_simple_tail(&self, w: &mut BitWriter) {
        w.push(frequency_field(self.frequency), 4);
        w.push(intensity_field(self.intensity), 10);
        w.push(u32::from(self.effect.code()), 8);
        w.push(COMMAND_TYPE_EFFECT, 7);
        w.push(OPERA_TYPE, 1);
    }

    /// Tail of the parameterised family: `intensity, frq, mode, effect code, command type, opera`
    fn push_mode_tail(&self, w: &mut BitWriter) {
        w.push(intensity_field(self.intensity), 10);
        w.push(frequency_field(self.frequency), 4);
        w.push(self.color_mode as u32, 4);
        w.push(u32::from(self.effect.code()), 8);
        w.push(COMMAND_TYPE_EFFECT, 7);
        w.push(OPERA_TYPE, 1);
    }

    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let (gm_high, gm_value) = compute_gm(GM_FLAG_NEUTRAL, GM_NEUTRAL);
        let (cct_value, cct_high) = cct_field(self.cct_kelvin);

        let mut w = BitWriter::new();

        w.zeros(8);
        w.push(self.awake as u32, 1);

        match self.effect {
            HardwareEffect::TvFlicker | HardwareEffect::Candle | HardwareEffect::Fire => {
                w.zeros(31);
                w.push(cct_value, 10);
                self.push_simple_tail(&mut w);
            }

            HardwareEffect::Paparazzi => {
                w.zeros(21);
                w.push(cct_high, 1);
                w.push(GM_FLAG_NEUTRAL, 1);
                w.push(gm_high, 1);
                w.push(gm_value, 7);
                w.push(cct_value, 10);
                self.push_simple_tail(&mut w);
            }

            HardwareEffect::Lightning => {
                w.zeros(15);
                w.push(cct_high, 1);
                w.push(GM_FLAG_NEUTRAL, 1);
                w.push(gm_high, 1);
                w.push(u32::from(self.speed & 0x0F), 4);
                w.push(u32::from(self.trigger & 0x03), 2);
                w.push(gm_value, 7);
                w.push(cct_value, 10);
                self.push_simple_tail(&mut w);
            }

            HardwareEffect::CopCar => {
                w.zeros(37);
                w.push(u32::from(self.color & 0x0F), 4);
                self.push_simple_tail(&mut w);
            }

            HardwareEffect::Party => {
                w.zeros(34);
                w.push(saturation_field(self.saturation), 7);
                self.push_simple_tail(&mut w);
            }

            HardwareEffect::Fireworks => {
                w.zeros(33);
                w.push(u32::from(self.type_val), 8);
                self.push_simple_tail(&mut w);
            }

            HardwareEffect::Strobe | HardwareEffect::Explosion => {
                match self.color_mode {
                    ColorMode::Cct => {
                        w.zeros(15);
                        w.push(cct_high, 1);
                        w.push(GM_FLAG_NEUTRAL, 1);
                        w.push(gm_high, 1);
                        w.push(u32::from(self.trigger & 0x03), 2);
                        w.push(gm_value, 7);
                        w.push(cct_value, 10);
                    }
                    ColorMode::Hsi => {
                        let (hsi_cct, hsi_high) = cct_field_hsi(self.cct_kelvin);

                        w.zeros(1);
                        w.push(hsi_high, 1);
                        w.push(GM_FLAG_NEUTRAL, 1);
                        w.push(gm_high, 1);
                        w.push(u32::from(self.trigger & 0x03), 2);
                        w.push(gm_value, 7);
                        w.push(hsi_cct, 8);
                        w.push(saturation_field(self.saturation), 7);
                        w.push(hue_field(self.hue), 9);
                    }
                }
                self.push_mode_tail(&mut w);
            }

            HardwareEffect::FaultyBulb | HardwareEffect::Pulsing => {
                w.zeros(11);
                w.push(cct_high, 1);
                w.push(GM_FLAG_NEUTRAL, 1);
                w.push(gm_high, 1);
                w.push(u32::from(self.speed & 0x0F), 4);
                w.push(u32::from(self.trigger & 0x03), 2);
                w.push(gm_value, 7);
                w.push(cct_value, 10);
                self.push_mode_tail(&mut w);
            }

            HardwareEffect::Welding => {
                w.zeros(8);
                w.push(cct_high, 1);
                w.push(GM_FLAG_NEUTRAL, 1);
                w.push(gm_high, 1);
                w.push(u32::from(self.minimum) & 0x7F, 7);
                w.push(u32::from(self.trigger & 0x03), 2);
                w.push(gm_value, 7);
                w.push(cct_value, 10);
                self.push_mode_tail(&mut w);
            }

            HardwareEffect::Off => {
                w.zeros(55);
                w.push(u32::from(HardwareEffect::Off.code()), 8);
                w.push(COMMAND_TYPE_EFFECT, 7);
                w.push(OPERA_TYPE, 1);
            }
        }

        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_checksum(payload: &[u8; PAYLOAD_LEN]) {
        assert_eq!(bits::checksum(payload), payload[0], "checksum mismatch in {:02X?}", payload);
    }

    #[test]
    fn cct_full_intensity_daylight() {
        // intensity 100 % -> 1000, 5600 K -> 560 steps, sleep bit set, command type 2
        let payload = CctCommand {
            intensity: 100.0,
            cct_kelvin: 5600,
            awake: true,
        }
        .encode();

        assert_eq!(
            [0xE1, 0x01, 0x00, 0x00, 0x00, 0x40, 0x01, 0x23, 0xFA, 0x82],
            payload
        );

        assert_checksum(&payload);
    }

    #[test]
    fn cct_zero_intensity_power_off() {
        let payload = CctCommand {
            intensity: 0.0,
            cct_kelvin: 5600,
            awake: false,
        }
        .encode();

        // sleep bit clear, intensity field zero
        assert_eq!(0x00, payload[1]);
        assert_eq!(0x00, payload[8] & 0b1111_1010);

        assert_checksum(&payload);
    }

    #[test]
    fn cct_clamps_temperature_and_intensity() {
        let low = CctCommand { intensity: -3.0, cct_kelvin: 500, awake: true }.encode();
        let ref_low = CctCommand { intensity: 0.0, cct_kelvin: 1800, awake: true }.encode();

        assert_eq!(ref_low, low);

        let high = CctCommand { intensity: 250.0, cct_kelvin: 90_000, awake: true }.encode();
        let ref_high = CctCommand { intensity: 100.0, cct_kelvin: 20_000, awake: true }.encode();

        assert_eq!(ref_high, high);
    }

    #[test]
    fn cct_high_flag_wraps_above_ten_thousand_kelvin() {
        let wrapped = CctCommand { intensity: 50.0, cct_kelvin: 12_000, awake: true }.encode();
        let plain = CctCommand { intensity: 50.0, cct_kelvin: 2_000, awake: true }.encode();

        // 12000 K -> 1200 steps -> value 200 with the high flag; 2000 K -> value 200 without
        assert_ne!(wrapped, plain);
        assert_checksum(&wrapped);
    }

    #[test]
    fn sleep_frame() {
        let asleep = SleepCommand { awake: false }.encode();

        assert_eq!([0x8C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x8C], asleep);

        let awake = SleepCommand { awake: true }.encode();

        assert_eq!([0x8D, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x8C], awake);
    }

    #[test]
    fn hsi_packs_hue_saturation_and_checksums() {
        let payload = HsiCommand {
            intensity: 100.0,
            hue: 240,
            saturation: 100,
            cct_kelvin: 5600,
            awake: true,
        }
        .encode();

        assert_checksum(&payload);

        // sleep bit
        assert_eq!(0x01, payload[1]);

        // hue wraps modulo 360
        let wrapped = HsiCommand {
            intensity: 100.0,
            hue: 600,
            saturation: 100,
            cct_kelvin: 5600,
            awake: true,
        }
        .encode();

        let plain = HsiCommand {
            intensity: 100.0,
            hue: 240,
            saturation: 100,
            cct_kelvin: 5600,
            awake: true,
        }
        .encode();

        assert_eq!(plain, wrapped);
    }

    #[test]
    fn effect_off_frame() {
        let payload = EffectCommand {
            effect: HardwareEffect::Off,
            awake: true,
            ..Default::default()
        }
        .encode();

        // effect code 15 lands byte-aligned in byte 8, command type 7 and the opera bit in byte 9
        assert_eq!(0x0F, payload[8]);
        assert_eq!(0x87, payload[9]);
        assert_eq!([0x00; 6], payload[2..8]);

        assert_checksum(&payload);
    }

    #[test]
    fn unknown_effect_codes_downgrade_to_off() {
        let off = EffectCommand {
            effect: HardwareEffect::from_code(99),
            awake: true,
            ..Default::default()
        }
        .encode();

        let reference = EffectCommand {
            effect: HardwareEffect::Off,
            awake: true,
            ..Default::default()
        }
        .encode();

        assert_eq!(reference, off);
    }

    #[test]
    fn every_effect_layout_totals_eighty_bits_and_checksums() {
        for code in 1..=15u8 {
            for &mode in &[ColorMode::Cct, ColorMode::Hsi] {
                let payload = EffectCommand {
                    effect: HardwareEffect::from_code(code),
                    color_mode: mode,
                    intensity: 73.5,
                    cct_kelvin: 4300,
                    hue: 311,
                    saturation: 87,
                    frequency: 9,
                    trigger: 2,
                    speed: 11,
                    minimum: 40,
                    color: 3,
                    type_val: 6,
                    awake: true,
                }
                .encode();

                assert_checksum(&payload);

                // command type 7 sits in the same tail position for every effect
                assert_eq!(0x07, payload[9] & 0x7F, "effect code {} mode {:?}", code, mode);
                assert_eq!(0x80, payload[9] & 0x80);
            }
        }
    }

    #[test]
    fn strobe_cct_and_hsi_renditions_differ() {
        let base = EffectCommand {
            effect: HardwareEffect::Strobe,
            intensity: 100.0,
            frequency: 4,
            ..Default::default()
        };

        let cct = EffectCommand { color_mode: ColorMode::Cct, ..base.clone() }.encode();
        let hsi = EffectCommand { color_mode: ColorMode::Hsi, hue: 120, ..base }.encode();

        assert_ne!(cct, hsi);

        assert_checksum(&cct);
        assert_checksum(&hsi);
    }

    #[test]
    fn access_message_prefixes_the_opcode() {
        let payload = SleepCommand { awake: true }.encode();

        let msg = access_message(&payload);

        assert_eq!(ACCESS_OPCODE, msg[0]);
        assert_eq!(payload[..], msg[1..]);
        assert_eq!(ACCESS_MESSAGE_LEN, msg.len());
    }
}

//! Software-synthesised lighting effects
//!
//! Each running effect is a little state machine bound to one light. A machine is only ever
//! advanced by its own one-shot timer: every transition emits zero or more frames through the
//! [`FrameSink`], mutates its local state, and arms exactly one follow-up timer. Nothing here
//! blocks, and no state is shared between instances, so any number of lights can flicker
//! independently while the mesh writes serialise further down.
//!
//! The pool owns the instances; the light registry only keeps a weak slot index for display.
//! Stopping clears the `running` flag before the slot is released, and a timer that fires
//! into a stopped or replaced instance is recognised by its stale generation and dropped.

mod engine;

use core::fmt;
use core::str::FromStr;

use rand::rngs::StdRng;
use rand::SeedableRng;

use serde::Deserialize;

use crate::sidus::ColorMode;
use crate::timer::TimerId;
use crate::{UnicastAddress, MAX_LIGHTS};

pub(crate) use engine::Step;

/// Where effect frames leave the scheduler
///
/// The bridge implements this over the Sidus encoder, the mesh pipeline and the proxy write
/// path. Sends are fire-and-forget from the scheduler's point of view; transport problems are
/// handled (and logged) below this seam.
pub trait FrameSink {
    fn send_cct(&self, unicast: UnicastAddress, intensity: f32, cct_kelvin: u32, awake: bool);

    fn send_hsi(
        &self,
        unicast: UnicastAddress,
        intensity: f32,
        hue: f32,
        saturation: f32,
        cct_kelvin: u32,
        awake: bool,
    );
}

/// The software effect engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Paparazzi,
    FaultyBulb,
    Pulsing,
    Strobe,
    Fire,
    Candle,
    TvFlicker,
    Lightning,
    Explosion,
    Welding,
    Party,
}

impl FromStr for EngineKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "paparazzi" => Ok(EngineKind::Paparazzi),
            "faulty_bulb" => Ok(EngineKind::FaultyBulb),
            "pulsing" => Ok(EngineKind::Pulsing),
            "strobe" => Ok(EngineKind::Strobe),
            "fire" => Ok(EngineKind::Fire),
            "candle" => Ok(EngineKind::Candle),
            "tv_flicker" => Ok(EngineKind::TvFlicker),
            "lightning" => Ok(EngineKind::Lightning),
            "explosion" => Ok(EngineKind::Explosion),
            "welding" => Ok(EngineKind::Welding),
            "party" => Ok(EngineKind::Party),
            _ => Err(()),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            EngineKind::Paparazzi => "paparazzi",
            EngineKind::FaultyBulb => "faulty_bulb",
            EngineKind::Pulsing => "pulsing",
            EngineKind::Strobe => "strobe",
            EngineKind::Fire => "fire",
            EngineKind::Candle => "candle",
            EngineKind::TvFlicker => "tv_flicker",
            EngineKind::Lightning => "lightning",
            EngineKind::Explosion => "explosion",
            EngineKind::Welding => "welding",
            EngineKind::Party => "party",
        };

        write!(f, "{}", name)
    }
}

/// Parameter record shared by every engine
///
/// A single union-style record: each engine reads the fields it cares about and ignores the
/// rest, which keeps in-place updates trivial.
#[derive(Debug, Clone)]
pub struct EffectParams {
    pub color_mode: ColorMode,
    /// Peak intensity, percent
    pub intensity: f32,
    /// Low end of the working range, percent (faulty bulb, pulsing)
    pub min: f32,
    /// High end of the working range, percent (faulty bulb, pulsing)
    pub max: f32,
    /// Effect speed step, 0..=15
    pub frequency: u8,
    /// Colour temperature, Kelvin
    pub cct: u32,
    pub hue: f32,
    pub saturation: f32,
    /// Faulty bulb: probability weight of dropping out of the high level, percent
    pub bias: f32,
    /// Faulty bulb: probability weight of returning to the high level, percent
    pub recovery: f32,
    /// Faulty bulb: how far dips pull the colour temperature toward `warmest_cct`, percent
    pub warmth: f32,
    pub warmest_cct: u32,
    /// Faulty bulb: level transition time, milliseconds
    pub transition_ms: u32,
    /// Pulsing: waveform shaping, 0..=100 with 50 = pure sine
    pub shape: f32,
    /// Strobe: flash rate, Hertz
    pub strobe_hz: f32,
    /// Party: ordered hue stops, degrees
    pub party_colors: Vec<f32>,
    /// Party: share of each step spent sweeping instead of holding, percent
    pub party_transition: f32,
    /// Party: added to every hue stop, degrees
    pub party_hue_bias: f32,
}

impl Default for EffectParams {
    fn default() -> Self {
        EffectParams {
            color_mode: ColorMode::Cct,
            intensity: 100.0,
            min: 20.0,
            max: 100.0,
            frequency: 5,
            cct: 5600,
            hue: 0.0,
            saturation: 100.0,
            bias: 50.0,
            recovery: 50.0,
            warmth: 0.0,
            warmest_cct: 2200,
            transition_ms: 200,
            shape: 50.0,
            strobe_hz: 4.0,
            party_colors: vec![0.0, 120.0, 240.0],
            party_transition: 0.0,
            party_hue_bias: 0.0,
        }
    }
}

/// Partial parameter update as carried by `start_effect` and `update_effect` frames
///
/// Absent fields leave the current value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EffectParamsUpdate {
    #[serde(rename = "colorMode")]
    pub color_mode: Option<String>,
    pub intensity: Option<f32>,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub frequency: Option<u8>,
    pub cct: Option<u32>,
    pub hue: Option<f32>,
    pub saturation: Option<f32>,
    pub bias: Option<f32>,
    pub recovery: Option<f32>,
    pub warmth: Option<f32>,
    #[serde(rename = "warmestCct")]
    pub warmest_cct: Option<u32>,
    pub transition: Option<u32>,
    pub shape: Option<f32>,
    #[serde(rename = "strobeHz")]
    pub strobe_hz: Option<f32>,
    #[serde(rename = "partyColors")]
    pub party_colors: Option<Vec<f32>>,
    #[serde(rename = "partyTransition")]
    pub party_transition: Option<f32>,
    #[serde(rename = "partyHueBias")]
    pub party_hue_bias: Option<f32>,
}

impl EffectParamsUpdate {
    pub fn apply_to(&self, params: &mut EffectParams) {
        if let Some(ref mode) = self.color_mode {
            match mode.parse() {
                Ok(mode) => params.color_mode = mode,
                Err(()) => log::warn!("ignoring unknown colorMode {:?}", mode),
            }
        }

        if let Some(v) = self.intensity {
            params.intensity = v;
        }
        if let Some(v) = self.min {
            params.min = v;
        }
        if let Some(v) = self.max {
            params.max = v;
        }
        if let Some(v) = self.frequency {
            params.frequency = v.min(15);
        }
        if let Some(v) = self.cct {
            params.cct = v;
        }
        if let Some(v) = self.hue {
            params.hue = v;
        }
        if let Some(v) = self.saturation {
            params.saturation = v;
        }
        if let Some(v) = self.bias {
            params.bias = v;
        }
        if let Some(v) = self.recovery {
            params.recovery = v;
        }
        if let Some(v) = self.warmth {
            params.warmth = v;
        }
        if let Some(v) = self.warmest_cct {
            params.warmest_cct = v;
        }
        if let Some(v) = self.transition {
            params.transition_ms = v;
        }
        if let Some(v) = self.shape {
            params.shape = v;
        }
        if let Some(v) = self.strobe_hz {
            params.strobe_hz = v;
        }
        if let Some(ref v) = self.party_colors {
            params.party_colors = v.clone();
        }
        if let Some(v) = self.party_transition {
            params.party_transition = v;
        }
        if let Some(v) = self.party_hue_bias {
            params.party_hue_bias = v;
        }
    }
}

/// One running effect bound to one light
#[derive(Debug)]
pub struct EffectInstance {
    pub unicast: UnicastAddress,
    pub engine: EngineKind,
    pub params: EffectParams,
    /// Cleared before the slot is released; fired timers check it first
    pub running: bool,
    /// Distinguishes this instance from earlier ones on the same unicast
    pub generation: u64,
    pending_timer: Option<TimerId>,
    // engine state
    level: f32,
    phase: f32,
    party_index: usize,
    party_hue: f32,
    at_high: bool,
    current_cct: f32,
    strobe_running: bool,
}

impl EffectInstance {
    fn new(unicast: UnicastAddress, engine: EngineKind, params: EffectParams, generation: u64) -> Self {
        let current_cct = params.cct as f32;
        let party_hue = params.party_colors.first().copied().unwrap_or(0.0);

        EffectInstance {
            unicast,
            engine,
            params,
            running: true,
            generation,
            pending_timer: None,
            level: 0.0,
            phase: 0.0,
            party_index: 0,
            party_hue,
            at_high: false,
            current_cct,
            strobe_running: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectError {
    /// Every slot in the pool is in use
    PoolFull,
}

impl fmt::Display for EffectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            EffectError::PoolFull => write!(f, "Effect pool is full ({} instances)", MAX_LIGHTS),
        }
    }
}

impl std::error::Error for EffectError {}

/// Follow-up timer request produced by a transition
pub(crate) type NextTimer = Option<(std::time::Duration, Step)>;

/// Result of starting an effect, for the caller to wire into the timer service
pub(crate) struct StartOutcome {
    /// Pool slot the instance occupies (for the registry back-pointer)
    pub slot: usize,
    pub generation: u64,
    /// Timer of a replaced instance that must be cancelled
    pub cancelled: Option<TimerId>,
    pub next: NextTimer,
}

/// Result of stopping an effect
pub(crate) struct StopOutcome {
    pub slot: usize,
    pub cancelled: Option<TimerId>,
}

/// The fixed pool of effect instances
pub struct EffectPool {
    slots: [Option<EffectInstance>; MAX_LIGHTS],
    rng: StdRng,
    next_generation: u64,
}

impl EffectPool {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Seeded construction, for deterministic tests
    pub fn with_rng(rng: StdRng) -> Self {
        EffectPool {
            slots: Default::default(),
            rng,
            next_generation: 0,
        }
    }

    fn slot_of(&self, unicast: UnicastAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |inst| inst.unicast == unicast))
    }

    pub fn get(&self, unicast: UnicastAddress) -> Option<&EffectInstance> {
        self.slot_of(unicast).and_then(move |i| self.slots[i].as_ref())
    }

    pub fn running_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Allocate and enter a new effect, replacing whatever ran on that unicast before
    ///
    /// The entry transition runs inline (several engines flash on entry), so the sink is
    /// needed here already.
    pub(crate) fn start(
        &mut self,
        unicast: UnicastAddress,
        engine: EngineKind,
        params: EffectParams,
        sink: &dyn FrameSink,
    ) -> Result<StartOutcome, EffectError> {
        let cancelled = self.stop(unicast).and_then(|outcome| outcome.cancelled);

        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(EffectError::PoolFull)?;

        let generation = self.next_generation;

        self.next_generation += 1;

        let mut instance = EffectInstance::new(unicast, engine, params, generation);

        let next = engine::step(&mut instance, Step::Enter, &mut self.rng, sink);

        log::debug!("effect {} started on {:#06x} (slot {})", engine, unicast, slot);

        self.slots[slot] = Some(instance);

        Ok(StartOutcome {
            slot,
            generation,
            cancelled,
            next,
        })
    }

    /// Record the timer armed for an instance
    ///
    /// Ignored when the instance is gone or superseded, which can happen if a stop raced the
    /// caller between `start`/`fire` and the timer arm.
    pub(crate) fn set_pending(&mut self, unicast: UnicastAddress, generation: u64, timer: TimerId) {
        if let Some(instance) = self.instance_mut(unicast) {
            if instance.generation == generation && instance.running {
                instance.pending_timer = Some(timer);
            }
        }
    }

    fn instance_mut(&mut self, unicast: UnicastAddress) -> Option<&mut EffectInstance> {
        self.slot_of(unicast).and_then(move |i| self.slots[i].as_mut())
    }

    /// Advance an instance because its timer fired
    ///
    /// Stale fires (stopped instance, replaced instance) return `None` and have no side
    /// effects.
    pub(crate) fn fire(
        &mut self,
        unicast: UnicastAddress,
        generation: u64,
        step: Step,
        sink: &dyn FrameSink,
    ) -> NextTimer {
        let rng = &mut self.rng;

        let instance = match self.slots.iter_mut().flatten().find(|i| i.unicast == unicast) {
            Some(instance) => instance,
            None => return None,
        };

        if !instance.running || instance.generation != generation {
            return None;
        }

        instance.pending_timer = None;

        engine::step(instance, step, rng, sink)
    }

    /// Mutate the parameters of a running effect in place
    ///
    /// The next scheduled tick observes the new values. Counters survive, except that the
    /// party colour index is clamped into the new list. A unicast without a running effect is
    /// a silent no-op (`false`).
    pub fn update(&mut self, unicast: UnicastAddress, update: &EffectParamsUpdate) -> bool {
        let instance = match self.instance_mut(unicast) {
            Some(instance) if instance.running => instance,
            _ => return false,
        };

        update.apply_to(&mut instance.params);

        if instance.params.party_colors.is_empty() {
            instance.party_index = 0;
        } else if instance.party_index >= instance.params.party_colors.len() {
            instance.party_index = instance.params.party_colors.len() - 1;
        }

        if update.cct.is_some() {
            instance.current_cct = instance.params.cct as f32;
        }

        log::debug!("effect on {:#06x} updated", unicast);

        true
    }

    /// Stop and release the effect on a unicast
    pub(crate) fn stop(&mut self, unicast: UnicastAddress) -> Option<StopOutcome> {
        let slot = self.slot_of(unicast)?;

        let mut instance = self.slots[slot].take()?;

        instance.running = false;

        log::debug!("effect {} stopped on {:#06x}", instance.engine, unicast);

        Some(StopOutcome {
            slot,
            cancelled: instance.pending_timer.take(),
        })
    }

    /// Stop every running effect
    pub(crate) fn stop_all(&mut self) -> Vec<(UnicastAddress, StopOutcome)> {
        let unicasts: Vec<UnicastAddress> = self.slots.iter().flatten().map(|i| i.unicast).collect();

        unicasts
            .into_iter()
            .filter_map(|unicast| self.stop(unicast).map(|outcome| (unicast, outcome)))
            .collect()
    }
}

impl Default for EffectPool {
    fn default() -> Self {
        Self::new()
    }
}

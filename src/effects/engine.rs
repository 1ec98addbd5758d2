//! Effect engine transitions
//!
//! One function per fire: the dispatcher matches on the step tag and the engine kind, emits
//! through the sink, mutates the instance, and names the single follow-up timer. The tags
//! replace the closure captures of an async formulation, which bounds heap usage and keeps
//! every instance inspectable.
//!
//! Intensities are percent. Every emission goes through [`EffectInstance::emit`], which sets
//! the sleep bit for anything at or above one percent and clears it on zero frames so the
//! lights power down instead of dimming into quantisation flicker.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

use super::{EffectInstance, EngineKind, FrameSink, NextTimer};
use crate::sidus::ColorMode;

/// Step tags for the timer-chained state machines
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Step {
    /// Entry transition of every engine
    Enter,
    /// Paparazzi: the background gap elapsed, fire a flash
    PapFlash,
    /// Paparazzi: end of a flash; `allow_double` gates the double-burst roll
    PapOff { allow_double: bool },
    /// Paparazzi: the second flash of a double burst
    PapDouble,
    /// Lightning: the background gap elapsed
    LightningFlash,
    LightningOff,
    StrobeOn,
    StrobeOff,
    /// Pulsing, fire, candle and TV share a plain periodic tick
    Tick,
    /// Faulty bulb: decide the next level
    FaultyEvent,
    /// Faulty bulb: one 20 ms interpolation step toward the decided level
    FaultyRamp {
        remaining: u32,
        level_step: f32,
        cct_step: f32,
    },
    ExplosionDecay,
    /// Welding: flash `remaining` more times in this arc group after the current one
    WeldFlashOn { remaining: u8 },
    WeldFlashOff { remaining: u8 },
    /// Party: emit the current stop and schedule its hold or sweep
    PartyStep,
    /// Party: advance to the next stop, then behave like [`Step::PartyStep`]
    PartyAdvance,
    /// Party: one 30 ms sub-step of a hue sweep
    PartySweep { remaining: u32, hue_step: f32 },
}

const FLASH_FLOOR: f32 = 10.0;

const PULSE_TICK: Duration = Duration::from_millis(30);
const RAMP_TICK: Duration = Duration::from_millis(20);
const DECAY_TICK: Duration = Duration::from_millis(40);
const SWEEP_TICK: Duration = Duration::from_millis(30);

const STROBE_FLASH: Duration = Duration::from_millis(10);

/// Below this level an explosion is finished and restarts
const EXPLOSION_FLOOR: f32 = 2.0;

/// TV flicker snaps its output to these fractions of the configured intensity
const TV_LEVELS: [f32; 6] = [0.10, 0.30, 0.50, 0.70, 0.85, 1.00];

impl EffectInstance {
    /// Route one frame through the configured colour mode
    fn emit(&self, sink: &dyn FrameSink, level: f32) {
        let awake = level >= 1.0;

        match self.params.color_mode {
            ColorMode::Cct => {
                sink.send_cct(self.unicast, level, self.current_cct.round() as u32, awake)
            }
            ColorMode::Hsi => sink.send_hsi(
                self.unicast,
                level,
                self.params.hue,
                self.params.saturation,
                self.params.cct,
                awake,
            ),
        }
    }

    /// Party sweeps force HSI with an explicit hue
    fn emit_hue(&self, sink: &dyn FrameSink, level: f32, hue: f32) {
        sink.send_hsi(
            self.unicast,
            level,
            hue,
            self.params.saturation,
            self.params.cct,
            level >= 1.0,
        );
    }
}

fn secs(value: f32) -> Duration {
    Duration::from_secs_f32(value.max(0.0))
}

fn jitter(rng: &mut StdRng, low: f32, high: f32) -> f32 {
    rng.gen_range(low..high)
}

fn freq_decay(base: f32, decay: f32, frequency: u8) -> f32 {
    base * decay.powi(i32::from(frequency))
}

/// Wrap a hue into `[0, 360)`
fn normalize_hue(hue: f32) -> f32 {
    hue.rem_euclid(360.0)
}

/// Signed shortest-arc distance from one hue to another, in `(-180, 180]`
fn shortest_arc(from: f32, to: f32) -> f32 {
    let diff = (to - from).rem_euclid(360.0);

    if diff > 180.0 {
        diff - 360.0
    } else {
        diff
    }
}

/// Advance one instance by one fired timer
pub(crate) fn step(
    instance: &mut EffectInstance,
    step: Step,
    rng: &mut StdRng,
    sink: &dyn FrameSink,
) -> NextTimer {
    match instance.engine {
        EngineKind::Paparazzi => paparazzi(instance, step, rng, sink),
        EngineKind::Lightning => lightning(instance, step, rng, sink),
        EngineKind::Strobe => strobe(instance, step, sink),
        EngineKind::Pulsing => pulsing(instance, step, sink),
        EngineKind::Fire | EngineKind::Candle | EngineKind::TvFlicker => flicker(instance, step, rng, sink),
        EngineKind::FaultyBulb => faulty_bulb(instance, step, rng, sink),
        EngineKind::Explosion => explosion(instance, step, rng, sink),
        EngineKind::Welding => welding(instance, step, rng, sink),
        EngineKind::Party => party(instance, step, sink),
    }
}

/// Background gap of the paparazzi and lightning engines
fn background_gap(rng: &mut StdRng, frequency: u8) -> Duration {
    secs(freq_decay(3.0, 0.75, frequency) * jitter(rng, 0.5, 1.5))
}

fn paparazzi(
    instance: &mut EffectInstance,
    step: Step,
    rng: &mut StdRng,
    sink: &dyn FrameSink,
) -> NextTimer {
    match step {
        Step::Enter => Some((background_gap(rng, instance.params.frequency), Step::PapFlash)),

        Step::PapFlash => {
            instance.emit(sink, instance.params.intensity.max(FLASH_FLOOR));

            Some((secs(jitter(rng, 0.03, 0.08)), Step::PapOff { allow_double: true }))
        }

        Step::PapOff { allow_double } => {
            instance.emit(sink, 0.0);

            if allow_double && rng.gen::<f32>() < 0.3 {
                Some((secs(jitter(rng, 0.05, 0.15)), Step::PapDouble))
            } else {
                Some((background_gap(rng, instance.params.frequency), Step::PapFlash))
            }
        }

        Step::PapDouble => {
            instance.emit(sink, instance.params.intensity.max(FLASH_FLOOR));

            Some((secs(jitter(rng, 0.03, 0.08)), Step::PapOff { allow_double: false }))
        }

        _ => None,
    }
}

fn lightning(
    instance: &mut EffectInstance,
    step: Step,
    rng: &mut StdRng,
    sink: &dyn FrameSink,
) -> NextTimer {
    match step {
        Step::Enter => Some((background_gap(rng, instance.params.frequency), Step::LightningFlash)),

        Step::LightningFlash => {
            instance.emit(sink, instance.params.intensity);

            Some((secs(jitter(rng, 0.04, 0.12)), Step::LightningOff))
        }

        Step::LightningOff => {
            instance.emit(sink, 0.0);

            Some((background_gap(rng, instance.params.frequency), Step::LightningFlash))
        }

        _ => None,
    }
}

fn strobe(instance: &mut EffectInstance, step: Step, sink: &dyn FrameSink) -> NextTimer {
    match step {
        Step::Enter => {
            // parameter updates re-enter here; the cycle chain must not be duplicated
            if instance.strobe_running {
                return None;
            }

            instance.strobe_running = true;

            strobe(instance, Step::StrobeOn, sink)
        }

        Step::StrobeOn => {
            instance.emit(sink, instance.params.intensity);

            Some((STROBE_FLASH, Step::StrobeOff))
        }

        Step::StrobeOff => {
            instance.emit(sink, 0.0);

            let hz = instance.params.strobe_hz.max(0.2).min(50.0);

            Some((secs(1.0 / hz - STROBE_FLASH.as_secs_f32()), Step::StrobeOn))
        }

        _ => None,
    }
}

fn pulsing(instance: &mut EffectInstance, step: Step, sink: &dyn FrameSink) -> NextTimer {
    match step {
        Step::Enter | Step::Tick => {
            let params = &instance.params;

            let period = freq_decay(4.0, 0.80, params.frequency).max(0.05);

            let raw = 0.5 * ((core::f32::consts::TAU * instance.phase / period).sin() + 1.0);

            let exponent = 10f32.powf(-((params.shape - 50.0) / 50.0) * 0.8);

            let level = params.min + (params.max - params.min) * raw.powf(exponent);

            instance.emit(sink, level);

            instance.phase += PULSE_TICK.as_secs_f32();

            Some((PULSE_TICK, Step::Tick))
        }

        _ => None,
    }
}

/// Fire, candle and TV: a fresh random level every tick
fn flicker(
    instance: &mut EffectInstance,
    step: Step,
    rng: &mut StdRng,
    sink: &dyn FrameSink,
) -> NextTimer {
    match step {
        Step::Enter | Step::Tick => {
            let params = &instance.params;

            let (fraction, base_interval, jitter_lo, jitter_hi) = match instance.engine {
                EngineKind::Candle => (jitter(rng, 0.60, 1.00), 0.15, 0.5, 1.5),

                EngineKind::Fire => {
                    let fraction = if rng.gen::<f32>() < 0.15 {
                        1.0
                    } else {
                        jitter(rng, 0.15, 0.85)
                    };

                    (fraction, 0.10, 0.5, 1.5)
                }

                _ => {
                    let index = rng.gen_range(0..TV_LEVELS.len());

                    (TV_LEVELS[index], 0.08, 0.7, 1.3)
                }
            };

            instance.emit(sink, fraction * params.intensity);

            let interval = freq_decay(base_interval, 0.85, params.frequency) * jitter(rng, jitter_lo, jitter_hi);

            Some((secs(interval), Step::Tick))
        }

        _ => None,
    }
}

/// Discrete brightness levels of the faulty bulb, low to high
const FAULTY_LEVELS: usize = 5;

fn faulty_levels(min: f32, max: f32) -> [f32; FAULTY_LEVELS] {
    let mut levels = [0.0; FAULTY_LEVELS];

    for (i, level) in levels.iter_mut().enumerate() {
        *level = min + (max - min) * (i as f32) / ((FAULTY_LEVELS - 1) as f32);
    }

    levels
}

fn faulty_interval(rng: &mut StdRng, frequency: u8) -> Duration {
    if frequency >= 10 {
        secs(jitter(rng, 0.08, 2.0))
    } else {
        secs(1.5 * 0.65f32.powi(i32::from(frequency) - 1) * jitter(rng, 0.85, 1.15))
    }
}

fn faulty_bulb(
    instance: &mut EffectInstance,
    step: Step,
    rng: &mut StdRng,
    sink: &dyn FrameSink,
) -> NextTimer {
    match step {
        Step::Enter => {
            instance.at_high = true;
            instance.level = instance.params.max;
            instance.current_cct = instance.params.cct as f32;

            instance.emit(sink, instance.level);

            Some((faulty_interval(rng, instance.params.frequency), Step::FaultyEvent))
        }

        Step::FaultyEvent => {
            let params = instance.params.clone();

            let levels = faulty_levels(params.min, params.max);

            let bias = (params.bias / 100.0).max(0.0).powf(2.5);
            let recovery = 0.10 + 0.90 * (params.recovery / 100.0).max(0.0).powi(2);

            let target = if instance.at_high {
                if rng.gen::<f32>() < bias {
                    instance.at_high = false;

                    levels[rng.gen_range(0..FAULTY_LEVELS - 1)]
                } else {
                    instance.level
                }
            } else if rng.gen::<f32>() < recovery {
                instance.at_high = true;

                params.max
            } else {
                levels[rng.gen_range(0..FAULTY_LEVELS - 1)]
            };

            // dips pull the colour temperature toward the warm end
            let cct_target = if params.warmth > 0.0 && params.max > params.min {
                let dip = ((params.max - target) / (params.max - params.min)).max(0.0).min(1.0);

                let base = params.cct as f32;

                base + (params.warmest_cct as f32 - base) * dip * (params.warmth / 100.0)
            } else {
                params.cct as f32
            };

            if params.transition_ms >= 5 {
                let steps = (params.transition_ms as f32 / RAMP_TICK.as_millis() as f32)
                    .round()
                    .max(1.0) as u32;

                let level_step = (target - instance.level) / steps as f32;
                let cct_step = (cct_target - instance.current_cct) / steps as f32;

                Some((
                    RAMP_TICK,
                    Step::FaultyRamp {
                        remaining: steps,
                        level_step,
                        cct_step,
                    },
                ))
            } else {
                instance.level = target;
                instance.current_cct = cct_target;

                instance.emit(sink, instance.level);

                Some((faulty_interval(rng, params.frequency), Step::FaultyEvent))
            }
        }

        Step::FaultyRamp {
            remaining,
            level_step,
            cct_step,
        } => {
            instance.level += level_step;
            instance.current_cct += cct_step;

            instance.emit(sink, instance.level);

            if remaining > 1 {
                Some((
                    RAMP_TICK,
                    Step::FaultyRamp {
                        remaining: remaining - 1,
                        level_step,
                        cct_step,
                    },
                ))
            } else {
                Some((faulty_interval(rng, instance.params.frequency), Step::FaultyEvent))
            }
        }

        _ => None,
    }
}

fn explosion(
    instance: &mut EffectInstance,
    step: Step,
    rng: &mut StdRng,
    sink: &dyn FrameSink,
) -> NextTimer {
    match step {
        Step::Enter => {
            instance.level = instance.params.intensity;

            instance.emit(sink, instance.level);

            Some((DECAY_TICK, Step::ExplosionDecay))
        }

        Step::ExplosionDecay => {
            instance.level *= 0.88;

            if instance.level < EXPLOSION_FLOOR {
                instance.emit(sink, 0.0);

                let pause = freq_decay(2.0, 0.80, instance.params.frequency) * jitter(rng, 0.5, 1.5);

                Some((secs(pause), Step::Enter))
            } else {
                instance.emit(sink, instance.level);

                Some((DECAY_TICK, Step::ExplosionDecay))
            }
        }

        _ => None,
    }
}

fn welding(
    instance: &mut EffectInstance,
    step: Step,
    rng: &mut StdRng,
    sink: &dyn FrameSink,
) -> NextTimer {
    match step {
        Step::Enter => {
            let flashes = rng.gen_range(2..=5u8);

            welding(instance, Step::WeldFlashOn { remaining: flashes }, rng, sink)
        }

        Step::WeldFlashOn { remaining } => {
            instance.emit(sink, instance.params.intensity * jitter(rng, 0.7, 1.0));

            Some((
                secs(jitter(rng, 0.02, 0.08)),
                Step::WeldFlashOff {
                    remaining: remaining.saturating_sub(1),
                },
            ))
        }

        Step::WeldFlashOff { remaining } => {
            instance.emit(sink, 0.0);

            if remaining > 0 {
                Some((secs(jitter(rng, 0.01, 0.04)), Step::WeldFlashOn { remaining }))
            } else {
                let gap = freq_decay(1.5, 0.80, instance.params.frequency) * jitter(rng, 0.3, 1.0);

                Some((secs(gap), Step::Enter))
            }
        }

        _ => None,
    }
}

/// Interval of one party colour step
fn party_interval(frequency: u8) -> f32 {
    freq_decay(1.5, 0.80, frequency)
}

fn party(instance: &mut EffectInstance, step: Step, sink: &dyn FrameSink) -> NextTimer {
    match step {
        Step::Enter | Step::PartyStep => party_emit_stop(instance, sink),

        Step::PartyAdvance => {
            let len = instance.params.party_colors.len().max(1);

            instance.party_index = (instance.party_index + 1) % len;

            party_emit_stop(instance, sink)
        }

        Step::PartySweep { remaining, hue_step } => {
            instance.party_hue = normalize_hue(instance.party_hue + hue_step);

            instance.emit_hue(sink, instance.params.intensity, instance.party_hue);

            if remaining > 1 {
                Some((
                    SWEEP_TICK,
                    Step::PartySweep {
                        remaining: remaining - 1,
                        hue_step,
                    },
                ))
            } else {
                let len = instance.params.party_colors.len().max(1);

                instance.party_index = (instance.party_index + 1) % len;

                Some((SWEEP_TICK, Step::PartyStep))
            }
        }

        _ => None,
    }
}

/// Emit the current party stop and schedule either the snap or the sweep toward the next
fn party_emit_stop(instance: &mut EffectInstance, sink: &dyn FrameSink) -> NextTimer {
    let params = &instance.params;

    let stops = if params.party_colors.is_empty() {
        &[0.0][..]
    } else {
        &params.party_colors[..]
    };

    let index = instance.party_index.min(stops.len() - 1);

    let hue = normalize_hue(stops[index] + params.party_hue_bias);

    instance.party_hue = hue;

    instance.emit_hue(sink, params.intensity, hue);

    let interval = party_interval(params.frequency);

    let transition = params.party_transition.max(0.0).min(100.0);

    if transition <= 0.0 || stops.len() < 2 {
        return Some((secs(interval), Step::PartyAdvance));
    }

    let hold = interval * (1.0 - transition / 100.0);
    let sweep = interval * transition / 100.0;

    let steps = ((sweep / SWEEP_TICK.as_secs_f32()).round() as u32).max(1);

    let next_index = (index + 1) % stops.len();

    let target = normalize_hue(stops[next_index] + params.party_hue_bias);

    let hue_step = shortest_arc(hue, target) / steps as f32;

    Some((
        secs(hold),
        Step::PartySweep {
            remaining: steps,
            hue_step,
        },
    ))
}

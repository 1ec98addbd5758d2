//! Bridge orchestration
//!
//! The [`Bridge`] wires the command channel to the mesh pipeline, the proxy session, the
//! light registry and the effect scheduler. Two task contexts touch it: the command task
//! (inbound frames and controller events) and the timer dispatch task (effect ticks and the
//! scan timeout). They share state through mutexes with a fixed acquisition order of
//! effects, then mesh, then session, then controller; the registry is never held across any
//! of those.
//!
//! [`spawn`] is the startup glue: it builds the bridge, starts the command thread over an
//! mpsc inbox, and pumps outbound events as JSON text frames.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::channel::{self, ChannelError, Command, EffectFields, Event};
use crate::effects::{EffectParams, EffectParamsUpdate, EffectPool, EngineKind, FrameSink, Step};
use crate::mesh::{MeshError, NetworkContext};
use crate::proxy::{
    BleController, ControllerEvent, ProxyError, ProxySession, SessionEvent, SCAN_TIMEOUT,
};
use crate::registry::LightRegistry;
use crate::sidus::{
    access_message, CctCommand, ColorMode, EffectCommand, HardwareEffect, HsiCommand, SleepCommand,
};
use crate::timer::{TimerHandle, TimerService};
use crate::{UnicastAddress, MAX_LIGHTS, VERSION};

/// Messages carried by the timer dispatch task
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TimerMessage {
    Effect {
        unicast: UnicastAddress,
        generation: u64,
        step: Step,
    },
    ScanTimeout {
        generation: u64,
    },
}

#[derive(Debug)]
enum BridgeError {
    /// Crypto used before `set_keys`
    NotConfigured,
    /// A prior fatal condition is latched; only `set_keys` clears it
    Fatal(String),
    /// Effect commands need a registered unicast
    UnknownUnicast(UnicastAddress),
    /// Effects only run on reachable lights
    LightNotConnected(UnicastAddress),
    /// `start_effect` named an engine that does not exist
    UnknownEngine(String),
    Mesh(MeshError),
    Proxy(ProxyError),
    Channel(ChannelError),
    Registry(crate::registry::RegistryError),
    Effect(crate::effects::EffectError),
}

impl core::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match *self {
            BridgeError::NotConfigured => write!(f, "No keys configured, send set_keys first"),
            BridgeError::Fatal(ref msg) => write!(f, "{}", msg),
            BridgeError::UnknownUnicast(unicast) => write!(f, "Unknown unicast {:#06x}", unicast),
            BridgeError::LightNotConnected(unicast) => {
                write!(f, "Light {:#06x} is not connected", unicast)
            }
            BridgeError::UnknownEngine(ref name) => write!(f, "Unknown effect engine {:?}", name),
            BridgeError::Mesh(ref e) => write!(f, "{}", e),
            BridgeError::Proxy(ref e) => write!(f, "{}", e),
            BridgeError::Channel(ref e) => write!(f, "{}", e),
            BridgeError::Registry(ref e) => write!(f, "{}", e),
            BridgeError::Effect(ref e) => write!(f, "{}", e),
        }
    }
}

impl From<MeshError> for BridgeError {
    fn from(e: MeshError) -> Self {
        BridgeError::Mesh(e)
    }
}

impl From<ProxyError> for BridgeError {
    fn from(e: ProxyError) -> Self {
        BridgeError::Proxy(e)
    }
}

impl From<ChannelError> for BridgeError {
    fn from(e: ChannelError) -> Self {
        BridgeError::Channel(e)
    }
}

impl From<crate::registry::RegistryError> for BridgeError {
    fn from(e: crate::registry::RegistryError) -> Self {
        BridgeError::Registry(e)
    }
}

impl From<crate::effects::EffectError> for BridgeError {
    fn from(e: crate::effects::EffectError) -> Self {
        BridgeError::Effect(e)
    }
}

// Lock with poison recovery: a panicked peer thread must not silence the bridge forever.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the command task and the timer dispatch task
struct Shared {
    mesh: Mutex<Option<NetworkContext>>,
    registry: Mutex<LightRegistry>,
    session: Mutex<ProxySession>,
    effects: Mutex<EffectPool>,
    controller: Mutex<Box<dyn BleController>>,
    events: Mutex<mpsc::Sender<Event>>,
    /// Latched fatal condition (sequence exhaustion); cleared by `set_keys`
    fatal: Mutex<Option<String>>,
}

impl Shared {
    fn emit(&self, event: Event) {
        if lock(&self.events).send(event).is_err() {
            log::warn!("event channel closed, client event dropped");
        }
    }

    fn emit_error(&self, message: String) {
        log::warn!("{}", message);

        self.emit(Event::Error { message });
    }

    /// Wrap an access message and write it on the proxy link
    fn transmit(&self, access_msg: &[u8], dst: UnicastAddress) -> Result<(), BridgeError> {
        if let Some(msg) = lock(&self.fatal).clone() {
            return Err(BridgeError::Fatal(msg));
        }

        let pdu = {
            let mut mesh = lock(&self.mesh);

            let context = mesh.as_mut().ok_or(BridgeError::NotConfigured)?;

            match context.create_standard_pdu(access_msg, dst) {
                Ok(pdu) => pdu,
                Err(MeshError::SequenceExhausted) => {
                    let msg = "sequence counter exhausted, re-initialise with set_keys".to_string();

                    *lock(&self.fatal) = Some(msg.clone());

                    self.emit_error(msg.clone());

                    return Err(BridgeError::Fatal(msg));
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut session = lock(&self.session);
        let mut controller = lock(&self.controller);

        session.send(&mut **controller, pdu)?;

        Ok(())
    }

    /// Build the proxy filter setup, for the session to write right after discovery
    fn build_filter_pdu(&self) -> Option<Vec<u8>> {
        let mut mesh = lock(&self.mesh);

        let context = mesh.as_mut()?;

        match context.create_proxy_filter_setup() {
            Ok(pdu) => Some(pdu),
            Err(e) => {
                log::error!("filter setup assembly failed: {}", e);

                None
            }
        }
    }
}

// The seam the effect scheduler emits through. Transport problems on the autonomous path are
// logged rather than echoed to the client frame by frame; a dropping link stops the effects
// through the session event anyway.
impl FrameSink for Shared {
    fn send_cct(&self, unicast: UnicastAddress, intensity: f32, cct_kelvin: u32, awake: bool) {
        let payload = CctCommand {
            intensity,
            cct_kelvin,
            awake,
        }
        .encode();

        if let Err(e) = self.transmit(&access_message(&payload), unicast) {
            log::warn!("effect frame to {:#06x} dropped: {}", unicast, e);
        }
    }

    fn send_hsi(
        &self,
        unicast: UnicastAddress,
        intensity: f32,
        hue: f32,
        saturation: f32,
        cct_kelvin: u32,
        awake: bool,
    ) {
        let payload = HsiCommand {
            intensity,
            hue: hue.rem_euclid(360.0).round() as u16,
            saturation: saturation.max(0.0).min(100.0).round() as u8,
            cct_kelvin,
            awake,
        }
        .encode();

        if let Err(e) = self.transmit(&access_message(&payload), unicast) {
            log::warn!("effect frame to {:#06x} dropped: {}", unicast, e);
        }
    }
}

/// The bridge core
///
/// Owns the shared state and the timer service. [`Bridge::handle_frame`] and
/// [`Bridge::handle_controller_event`] are the two entry points the host glue calls; both are
/// synchronous and may be called from the same thread.
pub struct Bridge {
    shared: Arc<Shared>,
    timers: TimerHandle<TimerMessage>,
    // keeps the dispatch thread alive for the bridge's lifetime
    _timer_service: TimerService<TimerMessage>,
}

impl Bridge {
    pub fn new(controller: Box<dyn BleController>, events: mpsc::Sender<Event>) -> Self {
        let shared = Arc::new(Shared {
            mesh: Mutex::new(None),
            registry: Mutex::new(LightRegistry::new()),
            session: Mutex::new(ProxySession::new()),
            effects: Mutex::new(EffectPool::new()),
            controller: Mutex::new(controller),
            events: Mutex::new(events),
            fatal: Mutex::new(None),
        });

        let timer_shared = shared.clone();

        let timer_service = TimerService::new(move |handle, message| {
            on_timer(&timer_shared, handle, message);
        });

        let timers = timer_service.handle();

        log::info!("bridge core initialised (v{}, {} light slots)", VERSION, MAX_LIGHTS);

        Bridge {
            shared,
            timers,
            _timer_service: timer_service,
        }
    }

    /// A client attached (or re-attached); greet it
    pub fn client_ready(&self) {
        self.shared.emit(Event::Ready {
            version: VERSION,
            max_lights: MAX_LIGHTS,
        });
    }

    /// Process one inbound text frame
    pub fn handle_frame(&self, text: &str) {
        let command = match channel::parse_frame(text) {
            Ok(command) => command,
            Err(e) => {
                self.shared.emit_error(e.to_string());

                return;
            }
        };

        if let Err(e) = self.dispatch(command) {
            self.shared.emit_error(e.to_string());
        }
    }

    /// Route one BLE stack event through the proxy session
    pub fn handle_controller_event(&self, event: ControllerEvent) {
        // the filter setup is built up front so the session lock is not held across the
        // mesh lock
        let filter_pdu = match event {
            ControllerEvent::SubscriptionComplete(_) => self.shared.build_filter_pdu(),
            _ => None,
        };

        let outcome = {
            let mut session = lock(&self.shared.session);
            let mut controller = lock(&self.shared.controller);

            session.handle_event(event, &mut **controller, filter_pdu)
        };

        match outcome {
            Ok(Some(SessionEvent::Ready)) => self.publish_connected(true),

            Ok(Some(SessionEvent::Dropped)) => {
                self.stop_all_effects();

                self.publish_connected(false);

                self.shared.emit_error("proxy link dropped".to_string());
            }

            Ok(Some(SessionEvent::SetupFailed(reason))) => {
                self.shared.emit_error(format!("proxy setup failed: {}", reason));
            }

            Ok(None) => (),

            Err(e) => self.shared.emit_error(e.to_string()),
        }
    }

    fn dispatch(&self, command: Command) -> Result<(), BridgeError> {
        match command {
            Command::SetKeys {
                network_key,
                app_key,
                iv_index,
                src_address,
            } => {
                let net_key = channel::parse_key(&network_key, "network_key")?;
                let app_key = channel::parse_key(&app_key, "app_key")?;

                *lock(&self.shared.mesh) = Some(NetworkContext::new(net_key, app_key, iv_index, src_address));
                *lock(&self.shared.fatal) = None;

                log::info!("crypto context initialised for source {:#06x}", src_address);

                Ok(())
            }

            Command::AddLight { id, unicast, name } => {
                let ready = lock(&self.shared.session).is_ready();

                let mut registry = lock(&self.shared.registry);

                registry.add(&id, unicast, &name)?;

                // lights registered while the proxy is up become reachable immediately
                if ready {
                    if let Some(light) = registry.get_mut(unicast) {
                        light.connected = true;
                    }

                    drop(registry);

                    self.shared.emit(Event::LightStatus {
                        unicast,
                        connected: true,
                    });
                }

                Ok(())
            }

            Command::Connect => {
                if lock(&self.shared.mesh).is_none() {
                    // the filter setup at the end of the ladder needs the keys
                    return Err(BridgeError::NotConfigured);
                }

                let generation = {
                    let mut session = lock(&self.shared.session);
                    let mut controller = lock(&self.shared.controller);

                    session.connect(&mut **controller)?
                };

                if let Some(generation) = generation {
                    self.timers.schedule(SCAN_TIMEOUT, TimerMessage::ScanTimeout { generation });
                }

                Ok(())
            }

            Command::Disconnect => {
                let was_ready = {
                    let mut session = lock(&self.shared.session);
                    let mut controller = lock(&self.shared.controller);

                    session.disconnect(&mut **controller)
                };

                if was_ready {
                    self.stop_all_effects();

                    self.publish_connected(false);
                }

                Ok(())
            }

            Command::SetCct {
                unicast,
                intensity,
                cct_kelvin,
                sleep_mode,
            } => {
                let payload = CctCommand {
                    intensity,
                    cct_kelvin,
                    awake: sleep_mode != 0,
                }
                .encode();

                self.shared.transmit(&access_message(&payload), unicast)
            }

            Command::SetHsi {
                unicast,
                intensity,
                hue,
                saturation,
                cct_kelvin,
                sleep_mode,
            } => {
                let payload = HsiCommand {
                    intensity,
                    hue,
                    saturation,
                    cct_kelvin,
                    awake: sleep_mode != 0,
                }
                .encode();

                self.shared.transmit(&access_message(&payload), unicast)
            }

            Command::Sleep { unicast, on } => {
                let payload = SleepCommand { awake: on }.encode();

                self.shared.transmit(&access_message(&payload), unicast)
            }

            Command::SetEffect {
                unicast,
                effect_type,
                fields,
            } => {
                let payload = build_effect_command(effect_type, &fields).encode();

                self.shared.transmit(&access_message(&payload), unicast)
            }

            Command::StartEffect {
                unicast,
                engine,
                params,
            } => self.start_effect(unicast, &engine, &params),

            Command::UpdateEffect { unicast, params } => {
                // a non-running target is a silent no-op
                lock(&self.shared.effects).update(unicast, &params);

                Ok(())
            }

            Command::StopEffect { unicast } => {
                self.stop_effect(unicast);

                Ok(())
            }

            Command::StopAll => {
                self.stop_all_effects();

                Ok(())
            }
        }
    }

    fn start_effect(
        &self,
        unicast: UnicastAddress,
        engine: &str,
        params_update: &EffectParamsUpdate,
    ) -> Result<(), BridgeError> {
        let engine: EngineKind = engine
            .parse()
            .map_err(|()| BridgeError::UnknownEngine(engine.to_string()))?;

        // effects only run on lights known to be reachable
        {
            let registry = lock(&self.shared.registry);

            let light = registry.get(unicast).ok_or(BridgeError::UnknownUnicast(unicast))?;

            if !light.connected {
                return Err(BridgeError::LightNotConnected(unicast));
            }
        }

        let mut params = EffectParams::default();

        params_update.apply_to(&mut params);

        let outcome = {
            let mut effects = lock(&self.shared.effects);

            let outcome = effects.start(unicast, engine, params, self.shared.as_ref())?;

            if let Some((delay, step)) = outcome.next {
                let id = self.timers.schedule(
                    delay,
                    TimerMessage::Effect {
                        unicast,
                        generation: outcome.generation,
                        step,
                    },
                );

                effects.set_pending(unicast, outcome.generation, id);
            }

            outcome
        };

        if let Some(cancelled) = outcome.cancelled {
            self.timers.cancel(cancelled);
        }

        if let Some(light) = lock(&self.shared.registry).get_mut(unicast) {
            light.effect_slot = Some(outcome.slot);
        }

        Ok(())
    }

    fn stop_effect(&self, unicast: UnicastAddress) {
        let stopped = lock(&self.shared.effects).stop(unicast);

        if let Some(outcome) = stopped {
            if let Some(timer) = outcome.cancelled {
                self.timers.cancel(timer);
            }

            if let Some(light) = lock(&self.shared.registry).get_mut(unicast) {
                light.effect_slot = None;
            }
        }
    }

    fn stop_all_effects(&self) {
        let stopped = lock(&self.shared.effects).stop_all();

        for (unicast, outcome) in stopped {
            if let Some(timer) = outcome.cancelled {
                self.timers.cancel(timer);
            }

            if let Some(light) = lock(&self.shared.registry).get_mut(unicast) {
                light.effect_slot = None;
            }
        }
    }

    /// One batched pass over the registry, one status event per changed light
    fn publish_connected(&self, connected: bool) {
        let changed = lock(&self.shared.registry).set_all_connected(connected);

        for unicast in changed {
            self.shared.emit(Event::LightStatus { unicast, connected });
        }
    }
}

/// Map the flat `set_effect` fields onto an encoder command
fn build_effect_command(effect_type: u8, fields: &EffectFields) -> EffectCommand {
    let mut command = EffectCommand::default();

    command.effect = HardwareEffect::from_code(effect_type);

    if let Some(ref mode) = fields.color_mode {
        match mode.parse::<ColorMode>() {
            Ok(mode) => command.color_mode = mode,
            Err(()) => log::warn!("ignoring unknown color_mode {:?}", mode),
        }
    }

    if let Some(v) = fields.intensity {
        command.intensity = v;
    }
    if let Some(v) = fields.cct_kelvin {
        command.cct_kelvin = v;
    }
    if let Some(v) = fields.hue {
        command.hue = v;
    }
    if let Some(v) = fields.saturation {
        command.saturation = v;
    }
    if let Some(v) = fields.frequency {
        command.frequency = v;
    }
    if let Some(v) = fields.trigger {
        command.trigger = v;
    }
    if let Some(v) = fields.speed {
        command.speed = v;
    }
    if let Some(v) = fields.minimum {
        command.minimum = v;
    }
    if let Some(v) = fields.color {
        command.color = v;
    }
    if let Some(v) = fields.type_val {
        command.type_val = v;
    }
    if let Some(v) = fields.sleep_mode {
        command.awake = v != 0;
    }

    command
}

/// The timer dispatch task body
fn on_timer(shared: &Arc<Shared>, timers: &TimerHandle<TimerMessage>, message: TimerMessage) {
    match message {
        TimerMessage::Effect {
            unicast,
            generation,
            step,
        } => {
            let mut effects = lock(&shared.effects);

            if let Some((delay, next_step)) = effects.fire(unicast, generation, step, shared.as_ref()) {
                let id = timers.schedule(
                    delay,
                    TimerMessage::Effect {
                        unicast,
                        generation,
                        step: next_step,
                    },
                );

                effects.set_pending(unicast, generation, id);
            }
        }

        TimerMessage::ScanTimeout { generation } => {
            let timed_out = {
                let mut session = lock(&shared.session);
                let mut controller = lock(&shared.controller);

                session.scan_timed_out(generation, &mut **controller)
            };

            if timed_out {
                shared.emit_error("proxy scan timed out, no mesh proxy found".to_string());
            }
        }
    }
}

/// Inputs accepted by the spawned command task
pub enum BridgeInput {
    /// One inbound text frame from the client channel
    Frame(String),
    /// A client attached; answer with the ready event
    ClientReady,
    /// Feedback from the BLE stack
    Controller(ControllerEvent),
}

/// Handle to a running bridge
///
/// Dropping the input sender shuts the command thread (and with it the bridge) down.
pub struct BridgeHandle {
    /// Frames, client attachments and controller events go here
    pub input: mpsc::Sender<BridgeInput>,
    /// Serialized outbound event frames
    pub events: mpsc::Receiver<String>,
}

/// Startup glue: build a bridge and run it on its own command thread
pub fn spawn(controller: Box<dyn BleController>) -> BridgeHandle {
    let (input_tx, input_rx) = mpsc::channel::<BridgeInput>();
    let (event_tx, event_rx) = mpsc::channel::<Event>();
    let (frame_tx, frame_rx) = mpsc::channel::<String>();

    // event pump: structured events out as JSON text frames
    thread::Builder::new()
        .name("bridge-events".into())
        .spawn(move || {
            while let Ok(event) = event_rx.recv() {
                if frame_tx.send(channel::serialize_event(&event)).is_err() {
                    break;
                }
            }
        })
        .expect("failed to spawn the event pump thread");

    // command task: owns the bridge core
    thread::Builder::new()
        .name("bridge-command".into())
        .spawn(move || {
            let bridge = Bridge::new(controller, event_tx);

            while let Ok(input) = input_rx.recv() {
                match input {
                    BridgeInput::Frame(text) => bridge.handle_frame(&text),
                    BridgeInput::ClientReady => bridge.client_ready(),
                    BridgeInput::Controller(event) => bridge.handle_controller_event(event),
                }
            }

            log::info!("bridge command task exiting");
        })
        .expect("failed to spawn the bridge command thread");

    BridgeHandle {
        input: input_tx,
        events: frame_rx,
    }
}

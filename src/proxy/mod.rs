//! Mesh proxy session
//!
//! The bridge reaches its lights through a single shared GATT proxy link. The session walks a
//! fixed ladder: passive scan for an advertiser of the Mesh Proxy service, transport connect,
//! service discovery, subscription to the Data Out characteristic, then the proxy filter
//! write. Only after the filter write completes is the session `ready` and may PDUs flow.
//!
//! The BLE stack itself lives behind [`BleController`]; the session never talks to a radio.
//! Controller feedback is delivered as [`ControllerEvent`] values by whoever owns the stack,
//! and the session answers with controller calls plus at most one [`SessionEvent`] for the
//! layer above.

use core::fmt;
use std::collections::VecDeque;

use crate::BluetoothDeviceAddress;

/// 16-bit service UUID of the Mesh Proxy service
pub const MESH_PROXY_SERVICE: u16 = 0x1828;

/// Mesh Proxy Data In characteristic (write without response)
pub const MESH_PROXY_DATA_IN: u16 = 0x2ADD;

/// Mesh Proxy Data Out characteristic (notify)
pub const MESH_PROXY_DATA_OUT: u16 = 0x2ADE;

/// How long a proxy scan runs before giving up
pub const SCAN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Writes queued behind the in-flight one before the session starts shedding
const WRITE_QUEUE_DEPTH: usize = 32;

/// Transport-level connection identifier handed out by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle(pub u16);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// The controller cannot start the requested operation right now
    Busy,
    /// GATT discovery did not find the Mesh Proxy service or its characteristics
    ServiceNotFound,
    /// Anything the underlying stack reports verbatim
    Failed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ControllerError::Busy => write!(f, "Controller busy"),
            ControllerError::ServiceNotFound => write!(f, "Mesh Proxy service not found"),
            ControllerError::Failed(ref msg) => write!(f, "Controller failure: {}", msg),
        }
    }
}

impl std::error::Error for ControllerError {}

/// Attribute handles located by proxy service discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyCharacteristics {
    /// Value handle of Data In (0x2ADD)
    pub data_in: u16,
    /// Value handle of Data Out (0x2ADE)
    pub data_out: u16,
    /// Client characteristic configuration descriptor of Data Out
    pub data_out_cccd: u16,
}

/// One advertising report from the passive scan
#[derive(Debug, Clone)]
pub struct AdvertisementReport {
    pub address: BluetoothDeviceAddress,
    /// Raw AD structures exactly as received
    pub data: Vec<u8>,
}

/// The contract the host BLE stack fulfills for the bridge
///
/// All calls are asynchronous requests: they return once the controller has accepted the
/// operation, and the outcome arrives later as a [`ControllerEvent`]. The controller must
/// deliver `WriteComplete` when it can accept the next write on the link, which is how the
/// session keeps to one outstanding write at a time.
pub trait BleController: Send {
    fn start_scan(&mut self) -> Result<(), ControllerError>;

    fn stop_scan(&mut self) -> Result<(), ControllerError>;

    fn connect(&mut self, address: BluetoothDeviceAddress) -> Result<(), ControllerError>;

    /// Discover the Mesh Proxy service and locate both characteristics
    fn discover_proxy_service(&mut self, handle: ConnectionHandle) -> Result<(), ControllerError>;

    /// Enable notifications by writing the client characteristic configuration descriptor
    fn subscribe(&mut self, handle: ConnectionHandle, cccd: u16) -> Result<(), ControllerError>;

    fn write_without_response(
        &mut self,
        handle: ConnectionHandle,
        characteristic: u16,
        data: &[u8],
    ) -> Result<(), ControllerError>;

    fn disconnect(&mut self, handle: ConnectionHandle) -> Result<(), ControllerError>;
}

/// Feedback events the BLE stack delivers to the bridge
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    AdvertisementReport(AdvertisementReport),
    Connected(ConnectionHandle),
    ConnectFailed(ControllerError),
    DiscoveryComplete(ConnectionHandle, Result<ProxyCharacteristics, ControllerError>),
    SubscriptionComplete(ConnectionHandle),
    WriteComplete(ConnectionHandle),
    Notification(ConnectionHandle, u16, Vec<u8>),
    Disconnected(ConnectionHandle),
}

/// Scan an advertising payload for a 16-bit service UUID
///
/// Walks the AD structures (length, type, payload) looking at the complete and incomplete
/// 16-bit service class lists and at 16-bit service data records.
pub fn advertises_service(data: &[u8], uuid: u16) -> bool {
    const INCOMPLETE_16BIT_UUIDS: u8 = 0x02;
    const COMPLETE_16BIT_UUIDS: u8 = 0x03;
    const SERVICE_DATA_16BIT: u8 = 0x16;

    let target = uuid.to_le_bytes();

    let mut rest = data;

    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len);

        if len == 0 || len > tail.len() {
            break;
        }

        let (record, next) = tail.split_at(len);

        if let Some((&ad_type, payload)) = record.split_first() {
            match ad_type {
                INCOMPLETE_16BIT_UUIDS | COMPLETE_16BIT_UUIDS => {
                    if payload.chunks_exact(2).any(|uuid| uuid == target) {
                        return true;
                    }
                }
                SERVICE_DATA_16BIT => {
                    if payload.len() >= 2 && payload[..2] == target {
                        return true;
                    }
                }
                _ => (),
            }
        }

        rest = next;
    }

    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Subscribing,
    ConfiguringFilter,
    Ready,
}

/// What a controller event meant for the layer above
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The filter write completed; lights are reachable from now on
    Ready,
    /// A ready link dropped
    Dropped,
    /// The session never reached ready and has been torn back down
    SetupFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    /// No ready session to write on
    NotReady,
    /// The crypto context was missing when the filter setup had to be built
    NoFilterPdu,
    Controller(ControllerError),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ProxyError::NotReady => write!(f, "Proxy session is not ready"),
            ProxyError::NoFilterPdu => write!(f, "No crypto context to build the proxy filter from"),
            ProxyError::Controller(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<ControllerError> for ProxyError {
    fn from(e: ControllerError) -> Self {
        ProxyError::Controller(e)
    }
}

/// The single proxy link state machine
pub struct ProxySession {
    state: SessionState,
    peer: Option<BluetoothDeviceAddress>,
    handle: Option<ConnectionHandle>,
    characteristics: Option<ProxyCharacteristics>,
    write_busy: bool,
    write_queue: VecDeque<Vec<u8>>,
    /// Bumped on every scan start so stale timeout timers can be told apart
    scan_generation: u64,
}

impl ProxySession {
    pub fn new() -> Self {
        ProxySession {
            state: SessionState::Idle,
            peer: None,
            handle: None,
            characteristics: None,
            write_busy: false,
            write_queue: VecDeque::new(),
            scan_generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn scan_generation(&self) -> u64 {
        self.scan_generation
    }

    /// Address of the proxy node this session is attached to (or connecting to)
    pub fn peer(&self) -> Option<BluetoothDeviceAddress> {
        self.peer
    }

    /// Begin the scan-to-proxy ladder
    ///
    /// A no-op when a session is already being set up or is ready. Returns the scan
    /// generation for the caller's timeout timer.
    pub fn connect(&mut self, controller: &mut dyn BleController) -> Result<Option<u64>, ProxyError> {
        if self.state != SessionState::Idle {
            log::debug!("proxy connect ignored, session is {:?}", self.state);
            return Ok(None);
        }

        controller.start_scan()?;

        self.state = SessionState::Scanning;
        self.scan_generation += 1;

        log::info!("proxy scan started (generation {})", self.scan_generation);

        Ok(Some(self.scan_generation))
    }

    /// Tear the session down deliberately
    ///
    /// Returns `true` when a ready link was closed, in which case the caller marks every
    /// light disconnected.
    pub fn disconnect(&mut self, controller: &mut dyn BleController) -> bool {
        let was_ready = self.is_ready();

        match self.state {
            SessionState::Idle => (),
            SessionState::Scanning => {
                if let Err(e) = controller.stop_scan() {
                    log::warn!("stopping proxy scan failed: {}", e);
                }
            }
            _ => {
                if let Some(handle) = self.handle {
                    if let Err(e) = controller.disconnect(handle) {
                        log::warn!("closing proxy link failed: {}", e);
                    }
                }
            }
        }

        self.reset();

        was_ready
    }

    /// The scan timeout fired
    ///
    /// Stale generations (the scan already found a proxy, or a new scan started) are ignored.
    /// Returns `true` when the scan was actually abandoned.
    pub fn scan_timed_out(&mut self, generation: u64, controller: &mut dyn BleController) -> bool {
        if self.state != SessionState::Scanning || generation != self.scan_generation {
            return false;
        }

        log::warn!("proxy scan timed out after {:?}", SCAN_TIMEOUT);

        if let Err(e) = controller.stop_scan() {
            log::warn!("stopping proxy scan failed: {}", e);
        }

        self.reset();

        true
    }

    /// Feed one controller event through the state machine
    ///
    /// `filter_pdu` is consulted exactly once, when the subscription completes and the
    /// filter configuration has to be written; the caller builds it from the crypto context.
    pub fn handle_event(
        &mut self,
        event: ControllerEvent,
        controller: &mut dyn BleController,
        filter_pdu: Option<Vec<u8>>,
    ) -> Result<Option<SessionEvent>, ProxyError> {
        match event {
            ControllerEvent::AdvertisementReport(report) => {
                if self.state != SessionState::Scanning {
                    return Ok(None);
                }

                if !advertises_service(&report.data, MESH_PROXY_SERVICE) {
                    return Ok(None);
                }

                log::info!("proxy advertiser found: {:02X?}", report.address);

                if let Err(e) = controller.stop_scan() {
                    log::warn!("stopping proxy scan failed: {}", e);
                }

                controller.connect(report.address)?;

                self.peer = Some(report.address);
                self.state = SessionState::Connecting;

                Ok(None)
            }

            ControllerEvent::Connected(handle) => {
                if self.state != SessionState::Connecting {
                    return Ok(None);
                }

                controller.discover_proxy_service(handle)?;

                self.handle = Some(handle);
                self.state = SessionState::Discovering;

                Ok(None)
            }

            ControllerEvent::ConnectFailed(error) => {
                if self.state != SessionState::Connecting {
                    return Ok(None);
                }

                self.reset();

                Ok(Some(SessionEvent::SetupFailed(format!("connect failed: {}", error))))
            }

            ControllerEvent::DiscoveryComplete(handle, result) => {
                if self.state != SessionState::Discovering || self.handle != Some(handle) {
                    return Ok(None);
                }

                match result {
                    Ok(characteristics) => {
                        controller.subscribe(handle, characteristics.data_out_cccd)?;

                        self.characteristics = Some(characteristics);
                        self.state = SessionState::Subscribing;

                        Ok(None)
                    }
                    Err(error) => {
                        let _ = controller.disconnect(handle);

                        self.reset();

                        Ok(Some(SessionEvent::SetupFailed(format!("discovery failed: {}", error))))
                    }
                }
            }

            ControllerEvent::SubscriptionComplete(handle) => {
                if self.state != SessionState::Subscribing || self.handle != Some(handle) {
                    return Ok(None);
                }

                let pdu = match filter_pdu {
                    Some(pdu) => pdu,
                    None => {
                        let _ = controller.disconnect(handle);

                        self.reset();

                        return Err(ProxyError::NoFilterPdu);
                    }
                };

                let data_in = self.data_in_handle()?;

                controller.write_without_response(handle, data_in, &pdu)?;

                self.write_busy = true;
                self.state = SessionState::ConfiguringFilter;

                Ok(None)
            }

            ControllerEvent::WriteComplete(handle) => {
                if self.handle != Some(handle) {
                    return Ok(None);
                }

                self.write_busy = false;

                match self.state {
                    SessionState::ConfiguringFilter => {
                        self.state = SessionState::Ready;

                        log::info!("proxy session ready");

                        Ok(Some(SessionEvent::Ready))
                    }
                    SessionState::Ready => {
                        self.flush_queue(controller)?;

                        Ok(None)
                    }
                    _ => Ok(None),
                }
            }

            ControllerEvent::Notification(_, characteristic, data) => {
                // the bridge only originates; proxy status notifications are observed, not acted on
                log::debug!("proxy notification on {:#06x}: {:02X?}", characteristic, data);

                Ok(None)
            }

            ControllerEvent::Disconnected(handle) => {
                if self.handle != Some(handle) {
                    return Ok(None);
                }

                let was_ready = self.is_ready();

                self.reset();

                if was_ready {
                    log::warn!("proxy link dropped");

                    Ok(Some(SessionEvent::Dropped))
                } else {
                    Ok(Some(SessionEvent::SetupFailed("link dropped during setup".to_string())))
                }
            }
        }
    }

    /// Queue one proxy PDU for transmission on the ready link
    ///
    /// Writes are fire-and-forget, but at most one is outstanding per link; the rest wait in
    /// a bounded queue. When the queue overflows the newest PDU is shed, the client observes
    /// the missing frame and re-sends.
    pub fn send(&mut self, controller: &mut dyn BleController, pdu: Vec<u8>) -> Result<(), ProxyError> {
        if self.state != SessionState::Ready {
            return Err(ProxyError::NotReady);
        }

        if self.write_busy {
            if self.write_queue.len() >= WRITE_QUEUE_DEPTH {
                log::warn!("proxy write queue full, shedding a {} byte PDU", pdu.len());

                return Ok(());
            }

            self.write_queue.push_back(pdu);

            return Ok(());
        }

        self.write_now(controller, &pdu)
    }

    fn flush_queue(&mut self, controller: &mut dyn BleController) -> Result<(), ProxyError> {
        if let Some(pdu) = self.write_queue.pop_front() {
            self.write_now(controller, &pdu)?;
        }

        Ok(())
    }

    fn write_now(&mut self, controller: &mut dyn BleController, pdu: &[u8]) -> Result<(), ProxyError> {
        let handle = self.handle.ok_or(ProxyError::NotReady)?;

        let data_in = self.data_in_handle()?;

        controller.write_without_response(handle, data_in, pdu)?;

        self.write_busy = true;

        Ok(())
    }

    fn data_in_handle(&self) -> Result<u16, ProxyError> {
        self.characteristics
            .map(|c| c.data_in)
            .ok_or(ProxyError::NotReady)
    }

    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.peer = None;
        self.handle = None;
        self.characteristics = None;
        self.write_busy = false;
        self.write_queue.clear();
    }
}

impl Default for ProxySession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every controller call so tests can assert the exact sequence
    #[derive(Default)]
    pub struct MockController {
        pub calls: Vec<String>,
        pub written: Vec<Vec<u8>>,
    }

    impl BleController for MockController {
        fn start_scan(&mut self) -> Result<(), ControllerError> {
            self.calls.push("start_scan".into());
            Ok(())
        }

        fn stop_scan(&mut self) -> Result<(), ControllerError> {
            self.calls.push("stop_scan".into());
            Ok(())
        }

        fn connect(&mut self, address: BluetoothDeviceAddress) -> Result<(), ControllerError> {
            self.calls.push(format!("connect {:02X?}", address));
            Ok(())
        }

        fn discover_proxy_service(&mut self, handle: ConnectionHandle) -> Result<(), ControllerError> {
            self.calls.push(format!("discover {}", handle.0));
            Ok(())
        }

        fn subscribe(&mut self, handle: ConnectionHandle, cccd: u16) -> Result<(), ControllerError> {
            self.calls.push(format!("subscribe {} {:#06x}", handle.0, cccd));
            Ok(())
        }

        fn write_without_response(
            &mut self,
            _handle: ConnectionHandle,
            characteristic: u16,
            data: &[u8],
        ) -> Result<(), ControllerError> {
            self.calls.push(format!("write {:#06x} ({} bytes)", characteristic, data.len()));
            self.written.push(data.to_vec());
            Ok(())
        }

        fn disconnect(&mut self, handle: ConnectionHandle) -> Result<(), ControllerError> {
            self.calls.push(format!("disconnect {}", handle.0));
            Ok(())
        }
    }

    const PEER: BluetoothDeviceAddress = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    const CHARS: ProxyCharacteristics = ProxyCharacteristics {
        data_in: 0x0010,
        data_out: 0x0012,
        data_out_cccd: 0x0013,
    };

    fn proxy_adv() -> AdvertisementReport {
        AdvertisementReport {
            address: PEER,
            // flags record + complete 16-bit uuid list containing 0x1828
            data: vec![0x02, 0x01, 0x06, 0x03, 0x03, 0x28, 0x18],
        }
    }

    fn run_to_ready(session: &mut ProxySession, controller: &mut MockController) {
        session.connect(controller).unwrap();

        session
            .handle_event(ControllerEvent::AdvertisementReport(proxy_adv()), controller, None)
            .unwrap();

        session
            .handle_event(ControllerEvent::Connected(ConnectionHandle(4)), controller, None)
            .unwrap();

        session
            .handle_event(
                ControllerEvent::DiscoveryComplete(ConnectionHandle(4), Ok(CHARS)),
                controller,
                None,
            )
            .unwrap();

        session
            .handle_event(
                ControllerEvent::SubscriptionComplete(ConnectionHandle(4)),
                controller,
                Some(vec![0x02, 0x70, 0xAA]),
            )
            .unwrap();

        let ready = session
            .handle_event(ControllerEvent::WriteComplete(ConnectionHandle(4)), controller, None)
            .unwrap();

        assert_eq!(Some(SessionEvent::Ready), ready);
    }

    #[test]
    fn ad_record_matching() {
        // complete list of 16-bit uuids
        assert!(advertises_service(&[0x03, 0x03, 0x28, 0x18], 0x1828));

        // incomplete list, uuid second
        assert!(advertises_service(&[0x05, 0x02, 0x0F, 0x18, 0x28, 0x18], 0x1828));

        // service data record
        assert!(advertises_service(&[0x04, 0x16, 0x28, 0x18, 0x00], 0x1828));

        // some other service
        assert!(!advertises_service(&[0x03, 0x03, 0x0F, 0x18], 0x1828));

        // truncated record must not panic or match
        assert!(!advertises_service(&[0x09, 0x03, 0x28], 0x1828));

        // zero length record terminates the walk
        assert!(!advertises_service(&[0x00, 0x03, 0x28, 0x18], 0x1828));
    }

    #[test]
    fn full_ladder_reaches_ready_with_filter_first() {
        let mut session = ProxySession::new();
        let mut controller = MockController::default();

        run_to_ready(&mut session, &mut controller);

        assert!(session.is_ready());

        assert_eq!(
            vec![
                "start_scan".to_string(),
                "stop_scan".to_string(),
                format!("connect {:02X?}", PEER),
                "discover 4".to_string(),
                "subscribe 4 0x0013".to_string(),
                "write 0x0010 (3 bytes)".to_string(),
            ],
            controller.calls
        );

        // the filter setup must be the very first write
        assert_eq!(vec![vec![0x02, 0x70, 0xAA]], controller.written);
    }

    #[test]
    fn no_writes_before_ready() {
        let mut session = ProxySession::new();
        let mut controller = MockController::default();

        assert_eq!(
            Err(ProxyError::NotReady),
            session.send(&mut controller, vec![0x00, 0x70])
        );

        session.connect(&mut controller).unwrap();

        assert_eq!(
            Err(ProxyError::NotReady),
            session.send(&mut controller, vec![0x00, 0x70])
        );
    }

    #[test]
    fn writes_serialise_one_at_a_time() {
        let mut session = ProxySession::new();
        let mut controller = MockController::default();

        run_to_ready(&mut session, &mut controller);

        controller.written.clear();

        session.send(&mut controller, vec![1]).unwrap();
        session.send(&mut controller, vec![2]).unwrap();
        session.send(&mut controller, vec![3]).unwrap();

        // only the first hit the controller, the rest queued
        assert_eq!(vec![vec![1]], controller.written);

        session
            .handle_event(ControllerEvent::WriteComplete(ConnectionHandle(4)), &mut controller, None)
            .unwrap();

        assert_eq!(vec![vec![1], vec![2]], controller.written);

        session
            .handle_event(ControllerEvent::WriteComplete(ConnectionHandle(4)), &mut controller, None)
            .unwrap();

        session
            .handle_event(ControllerEvent::WriteComplete(ConnectionHandle(4)), &mut controller, None)
            .unwrap();

        assert_eq!(vec![vec![1], vec![2], vec![3]], controller.written);
    }

    #[test]
    fn ready_drop_reports_dropped_once() {
        let mut session = ProxySession::new();
        let mut controller = MockController::default();

        run_to_ready(&mut session, &mut controller);

        let outcome = session
            .handle_event(ControllerEvent::Disconnected(ConnectionHandle(4)), &mut controller, None)
            .unwrap();

        assert_eq!(Some(SessionEvent::Dropped), outcome);
        assert_eq!(SessionState::Idle, session.state());

        // a second disconnect for the same stale handle is ignored
        let outcome = session
            .handle_event(ControllerEvent::Disconnected(ConnectionHandle(4)), &mut controller, None)
            .unwrap();

        assert_eq!(None, outcome);
    }

    #[test]
    fn discovery_failure_tears_down() {
        let mut session = ProxySession::new();
        let mut controller = MockController::default();

        session.connect(&mut controller).unwrap();

        session
            .handle_event(ControllerEvent::AdvertisementReport(proxy_adv()), &mut controller, None)
            .unwrap();

        session
            .handle_event(ControllerEvent::Connected(ConnectionHandle(4)), &mut controller, None)
            .unwrap();

        let outcome = session
            .handle_event(
                ControllerEvent::DiscoveryComplete(ConnectionHandle(4), Err(ControllerError::ServiceNotFound)),
                &mut controller,
                None,
            )
            .unwrap();

        assert!(matches!(outcome, Some(SessionEvent::SetupFailed(_))));
        assert_eq!(SessionState::Idle, session.state());
        assert!(controller.calls.contains(&"disconnect 4".to_string()));
    }

    #[test]
    fn scan_timeout_abandons_only_the_matching_generation() {
        let mut session = ProxySession::new();
        let mut controller = MockController::default();

        let generation = session.connect(&mut controller).unwrap().unwrap();

        // stale generation: ignored
        assert!(!session.scan_timed_out(generation + 1, &mut controller));
        assert_eq!(SessionState::Scanning, session.state());

        assert!(session.scan_timed_out(generation, &mut controller));
        assert_eq!(SessionState::Idle, session.state());
    }

    #[test]
    fn non_proxy_advertisements_are_ignored() {
        let mut session = ProxySession::new();
        let mut controller = MockController::default();

        session.connect(&mut controller).unwrap();

        let report = AdvertisementReport {
            address: PEER,
            data: vec![0x03, 0x03, 0x0F, 0x18],
        };

        session
            .handle_event(ControllerEvent::AdvertisementReport(report), &mut controller, None)
            .unwrap();

        assert_eq!(SessionState::Scanning, session.state());
    }

    #[test]
    fn connect_is_idempotent_while_active() {
        let mut session = ProxySession::new();
        let mut controller = MockController::default();

        assert!(session.connect(&mut controller).unwrap().is_some());
        assert!(session.connect(&mut controller).unwrap().is_none());

        assert_eq!(1, controller.calls.iter().filter(|c| *c == "start_scan").count());
    }
}

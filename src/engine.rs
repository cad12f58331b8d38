use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::proto::{self, ServiceReply, ServiceStatus};
use crate::usb::{Setup, UsbTransport};
use crate::{DeviceError, Result};

/// Default logical-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_DELAYS_MS: [u64; 9] = [50, 50, 100, 100, 250, 250, 500, 500, 1000];

/// Time source for polling and deadline timers.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock; `sleep` blocks the calling thread.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Schedule of delays between successive CHECK polls of one request.
pub trait PollingSchedule {
    /// Delay before CHECK attempt number `attempt` (zero-based).
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Default backoff: 50, 50, 100, 100, 250, 250, 500 and 500 ms, then
/// saturating at one second.
pub struct DefaultSchedule;

impl PollingSchedule for DefaultSchedule {
    fn next_delay(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(DEFAULT_DELAYS_MS.len() - 1);
        Duration::from_millis(DEFAULT_DELAYS_MS[index])
    }
}

/// A fixed `Duration` polls at a constant interval.
impl PollingSchedule for Duration {
    fn next_delay(&self, _attempt: u32) -> Duration {
        *self
    }
}

/// Adapter turning a `Fn(attempt) -> Duration` closure into a schedule.
pub struct ScheduleFn<F>(pub F);

impl<F: Fn(u32) -> Duration> PollingSchedule for ScheduleFn<F> {
    fn next_delay(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }
}

/// Request or reply payload, tagged with how the caller supplied it.
///
/// The tag is sticky: a request submitted as text gets its reply payload
/// back as text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.as_bytes(),
        }
    }

    fn is_text(&self) -> bool {
        matches!(self, Payload::Text(_))
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.into_bytes(),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

/// Completed request outcome delivered to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestResult {
    /// Device-reported result code (see [`crate::result_codes`]).
    pub result: i32,
    /// Reply payload, if the device returned one.
    pub data: Option<Payload>,
}

/// Per-request submission options.
pub struct RequestOptions {
    /// Deadline for the whole request; the engine default applies when unset.
    pub timeout: Option<Duration>,
    /// Polling schedule override for this request.
    pub schedule: Option<Rc<dyn PollingSchedule>>,
    /// Fail the call when the device reports a non-OK result (default).
    /// When cleared, the reply is returned with `result` populated instead.
    pub check_result: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self { timeout: None, schedule: None, check_result: true }
    }
}

/// Lifecycle notifications emitted by a device handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Open,
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandleState {
    Closed,
    Opening,
    Open,
    Closing,
}

struct Request {
    id: u32,
    req_type: u16,
    data: Option<Vec<u8>>,
    text: bool,
    check_result: bool,
    proto_id: Option<u16>,
    data_sent: bool,
    check_count: u32,
    deadline: Instant,
    poll_at: Option<Instant>,
    schedule: Rc<dyn PollingSchedule>,
    done: bool,
    outcome: Option<Result<RequestResult>>,
}

pub(crate) struct EngineOptions {
    pub clock: Rc<dyn Clock>,
    pub default_timeout: Duration,
    pub default_schedule: Rc<dyn PollingSchedule>,
    pub concurrency_limit: Option<u32>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            clock: Rc::new(SystemClock),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_schedule: Rc::new(DefaultSchedule),
            concurrency_limit: None,
        }
    }
}

enum Pump {
    Worked,
    Sleep(Instant),
    Idle,
}

/// Multiplexed request engine.
///
/// The device services one control transfer at a time while callers keep
/// several logical requests in flight. Each request is INIT'd into a
/// device-side slot, its payload SEND'd, progress CHECK'd on a backoff
/// schedule, the reply RECV'd, and abandoned slots reclaimed with RESET.
/// A single pump routine owns every transition and advances one transfer
/// at a time; the `busy` flag guards the endpoint.
pub(crate) struct Engine<T: UsbTransport> {
    usb: T,
    clock: Rc<dyn Clock>,
    state: HandleState,
    requests: HashMap<u32, Request>,
    pending: VecDeque<u32>,
    checking: VecDeque<u32>,
    /// Slots of terminated requests, waiting for a per-slot RESET.
    resetting: VecDeque<u16>,
    active_count: u32,
    max_active: Option<u32>,
    reset_all: bool,
    want_close: bool,
    close_deadline: Option<Instant>,
    busy: bool,
    next_request_id: u32,
    default_timeout: Duration,
    default_schedule: Rc<dyn PollingSchedule>,
    events: VecDeque<DeviceEvent>,
}

impl<T: UsbTransport> Engine<T> {
    pub fn new(usb: T, options: EngineOptions) -> Self {
        Self {
            usb,
            clock: options.clock,
            state: HandleState::Closed,
            requests: HashMap::new(),
            pending: VecDeque::new(),
            checking: VecDeque::new(),
            resetting: VecDeque::new(),
            active_count: 0,
            max_active: options.concurrency_limit,
            reset_all: false,
            want_close: false,
            close_deadline: None,
            busy: false,
            next_request_id: 1,
            default_timeout: options.default_timeout,
            default_schedule: options.default_schedule,
            events: VecDeque::new(),
        }
    }

    pub fn usb_mut(&mut self) -> &mut T {
        &mut self.usb
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    #[cfg(test)]
    pub fn max_active(&self) -> Option<u32> {
        self.max_active
    }

    #[cfg(test)]
    pub fn active_count(&self) -> u32 {
        self.active_count
    }

    pub fn emit(&mut self, event: DeviceEvent) {
        self.events.push_back(event);
    }

    pub fn take_event(&mut self) -> Option<DeviceEvent> {
        self.events.pop_front()
    }

    /// Open the transport. Identity reads and the slot reclaim are layered
    /// on top by the device façade.
    pub fn open(&mut self) -> Result<()> {
        if self.state != HandleState::Closed {
            Err(DeviceError::State("Device is already open".to_string()))?
        }
        self.state = HandleState::Opening;
        if let Err(error) = self.usb.open() {
            self.state = HandleState::Closed;
            return Err(error);
        }
        self.state = HandleState::Open;
        Ok(())
    }

    /// Reclaim every device-side slot before the next piece of work runs.
    /// Armed once per open cycle, so slots leaked by a previous host
    /// session are returned before any request is admitted.
    pub fn arm_slot_reclaim(&mut self) {
        self.reset_all = true;
    }

    /// Admit a logical request; it is INIT'd in submission order.
    pub fn submit(
        &mut self,
        req_type: u16,
        data: Option<Payload>,
        options: &RequestOptions,
    ) -> Result<u32> {
        if self.state != HandleState::Open || self.want_close {
            let reason = if self.want_close {
                "Device is being closed"
            } else {
                "Device is not open"
            };
            Err(DeviceError::State(reason.to_string()))?
        }
        if let Some(payload) = &data {
            if payload.len() > proto::MAX_PAYLOAD_SIZE {
                Err(DeviceError::Device(format!(
                    "Request payload too large: {} bytes",
                    payload.len()
                )))?
            }
        }
        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let schedule = options
            .schedule
            .clone()
            .unwrap_or_else(|| self.default_schedule.clone());
        let id = self.next_request_id;
        self.next_request_id += 1;
        let text = data.as_ref().map_or(false, |payload| payload.is_text());
        trace!(
            "request {}: submitted (type: {}, payload: {} bytes)",
            id,
            req_type,
            data.as_ref().map_or(0, |payload| payload.len())
        );
        self.requests.insert(
            id,
            Request {
                id,
                req_type,
                data: data.map(Payload::into_bytes),
                text,
                check_result: options.check_result,
                proto_id: None,
                data_sent: false,
                check_count: 0,
                deadline: self.clock.now() + timeout,
                poll_at: None,
                schedule,
                done: false,
                outcome: None,
            },
        );
        self.pending.push_back(id);
        Ok(id)
    }

    /// Drive the pump until request `id` terminates, then hand back its
    /// outcome.
    pub fn wait(&mut self, id: u32) -> Result<RequestResult> {
        self.run_until(|engine| engine.outcome_ready(id))?;
        self.take_outcome(id)
    }

    /// Advance the pump by one turn without sleeping. Returns true when a
    /// transfer ran or a due timer fired, so callers drain ready work with
    /// a loop and come back once the next timer is due.
    pub fn pump_once(&mut self) -> bool {
        matches!(self.pump(), Pump::Worked)
    }

    /// Whether request `id` has terminated and its outcome can be taken.
    pub fn outcome_ready(&self, id: u32) -> bool {
        self.requests.get(&id).map_or(true, |request| request.done)
    }

    /// Whether request `id` was submitted with result checking enabled.
    pub fn checks_result(&self, id: u32) -> bool {
        self.requests.get(&id).map_or(true, |request| request.check_result)
    }

    pub fn take_outcome(&mut self, id: u32) -> Result<RequestResult> {
        let request = match self.requests.remove(&id) {
            Some(request) => request,
            None => Err(DeviceError::Internal(format!("Unknown request {}", id)))?,
        };
        match request.outcome {
            Some(outcome) => outcome,
            None => Err(DeviceError::Internal(format!("Request {} has no outcome", id)))?,
        }
    }

    /// Close the device. With `process_pending` cleared, every unfinished
    /// request is rejected up front; otherwise submitted work drains first.
    pub fn close(&mut self, process_pending: bool, timeout: Option<Duration>) -> Result<()> {
        if self.state == HandleState::Closed {
            return Ok(());
        }
        self.want_close = true;
        if !process_pending {
            self.reject_unfinished("Device is being closed");
        }
        if let Some(timeout) = timeout {
            self.close_deadline = Some(self.clock.now() + timeout);
        }
        self.run_until(|engine| engine.state == HandleState::Closed)
    }

    fn run_until<F: Fn(&Self) -> bool>(&mut self, done: F) -> Result<()> {
        loop {
            if done(self) {
                return Ok(());
            }
            match self.pump() {
                Pump::Worked => {}
                Pump::Sleep(until) => {
                    let now = self.clock.now();
                    if until > now {
                        self.clock.sleep(until - now);
                    }
                }
                Pump::Idle => {
                    if done(self) {
                        return Ok(());
                    }
                    Err(DeviceError::Internal("Request engine stalled".to_string()))?
                }
            }
        }
    }

    /// One pump turn: retire due timers, then take the highest-priority
    /// action. Priority order: reset-all, per-slot resets, checks, inits
    /// (gated by the concurrency cap), then the close handshake.
    fn pump(&mut self) -> Pump {
        let now = self.clock.now();
        self.expire_deadlines(now);
        self.promote_due_checks(now);

        if self.state == HandleState::Open && self.want_close {
            debug!("closing device");
            self.state = HandleState::Closing;
        }

        if self.reset_all {
            self.reset_all = false;
            self.active_count = 0;
            trace!("reclaiming all device slots");
            if let Err(error) = self.usb_out(proto::reset_setup(0), &[]) {
                self.fail_handle(error, None);
            }
            return Pump::Worked;
        }

        if let Some(proto_id) = self.resetting.pop_front() {
            trace!("reclaiming slot {}", proto_id);
            self.active_count = self.active_count.saturating_sub(1);
            if let Err(error) = self.usb_out(proto::reset_setup(proto_id), &[]) {
                self.fail_handle(error, None);
            }
            return Pump::Worked;
        }

        if let Some(id) = self.next_live_checking() {
            self.run_check(id);
            return Pump::Worked;
        }

        if self.max_active.map_or(true, |cap| self.active_count < cap) {
            if let Some(id) = self.next_live_pending() {
                self.run_init(id);
                return Pump::Worked;
            }
        }

        if self.state == HandleState::Closing && self.is_drained() {
            self.finish_close();
            return Pump::Worked;
        }

        match self.next_timer() {
            Some(at) if at <= now => Pump::Worked,
            Some(at) => Pump::Sleep(at),
            None => Pump::Idle,
        }
    }

    fn expire_deadlines(&mut self, now: Instant) {
        if let Some(at) = self.close_deadline {
            if at <= now {
                self.close_deadline = None;
                self.reject_unfinished("Device is being closed");
            }
        }
        let expired: Vec<u32> = self
            .requests
            .values()
            .filter(|request| !request.done && request.deadline <= now)
            .map(|request| request.id)
            .collect();
        for id in expired {
            debug!("request {}: timed out", id);
            let proto_id = self.requests.get(&id).and_then(|request| request.proto_id);
            self.reject(id, DeviceError::Timeout);
            if let Some(proto_id) = proto_id {
                self.resetting.push_back(proto_id);
            }
        }
    }

    fn promote_due_checks(&mut self, now: Instant) {
        let mut due: Vec<(Instant, u32)> = self
            .requests
            .values()
            .filter(|request| !request.done)
            .filter_map(|request| {
                request
                    .poll_at
                    .filter(|at| *at <= now)
                    .map(|at| (at, request.id))
            })
            .collect();
        due.sort();
        for (_, id) in due {
            if let Some(request) = self.requests.get_mut(&id) {
                request.poll_at = None;
            }
            self.checking.push_back(id);
        }
    }

    fn next_live_pending(&mut self) -> Option<u32> {
        while let Some(id) = self.pending.pop_front() {
            if self.requests.get(&id).map_or(false, |request| !request.done) {
                return Some(id);
            }
        }
        None
    }

    fn next_live_checking(&mut self) -> Option<u32> {
        while let Some(id) = self.checking.pop_front() {
            if self.requests.get(&id).map_or(false, |request| !request.done) {
                return Some(id);
            }
        }
        None
    }

    fn run_init(&mut self, id: u32) {
        let (req_type, payload_len) = match self.requests.get(&id) {
            Some(request) => (
                request.req_type,
                request.data.as_ref().map_or(0, |data| data.len()),
            ),
            None => return,
        };
        trace!("request {}: INIT (type: {}, size: {})", id, req_type, payload_len);
        let reply = match self.service_in(proto::init_setup(req_type, payload_len), id) {
            Some(reply) => reply,
            None => return,
        };
        match reply.status {
            ServiceStatus::Ok => {
                let proto_id = match self.require_proto_id(id, &reply) {
                    Some(proto_id) => proto_id,
                    None => return,
                };
                if let Some(request) = self.requests.get_mut(&id) {
                    request.proto_id = Some(proto_id);
                }
                self.active_count += 1;
                debug!("request {}: slot {} allocated", id, proto_id);
                if payload_len > 0 {
                    if !self.send_payload(id, proto_id) {
                        return;
                    }
                } else if let Some(request) = self.requests.get_mut(&id) {
                    request.data_sent = true;
                }
                self.arm_poll(id);
            }
            ServiceStatus::Pending => {
                // the device accepted the request but has not allocated a
                // payload buffer yet; only meaningful when a payload exists
                if payload_len == 0 {
                    self.reject(
                        id,
                        DeviceError::Protocol("Unexpected PENDING status".to_string()),
                    );
                    return;
                }
                let proto_id = match self.require_proto_id(id, &reply) {
                    Some(proto_id) => proto_id,
                    None => return,
                };
                if let Some(request) = self.requests.get_mut(&id) {
                    request.proto_id = Some(proto_id);
                }
                self.active_count += 1;
                self.arm_poll(id);
            }
            ServiceStatus::Busy => {
                // the device just told us its concurrency cap
                let learned = self
                    .max_active
                    .map_or(self.active_count, |cap| cap.min(self.active_count));
                debug!("concurrent request limit: {}", learned);
                self.max_active = Some(learned);
                self.pending.push_front(id);
            }
            ServiceStatus::NoMemory => self.reject(id, DeviceError::Memory),
            status => self.reject(
                id,
                DeviceError::Protocol(format!("Unexpected service status: {:?}", status)),
            ),
        }
    }

    fn run_check(&mut self, id: u32) {
        let proto_id = match self.requests.get(&id).and_then(|request| request.proto_id) {
            Some(proto_id) => proto_id,
            None => {
                self.reject(
                    id,
                    DeviceError::Internal("CHECK without an allocated slot".to_string()),
                );
                return;
            }
        };
        trace!("request {}: CHECK (slot {})", id, proto_id);
        if let Some(request) = self.requests.get_mut(&id) {
            request.check_count += 1;
        }
        let reply = match self.service_in(proto::check_setup(proto_id), id) {
            Some(reply) => reply,
            None => return,
        };
        let data_sent = self
            .requests
            .get(&id)
            .map_or(false, |request| request.data_sent);
        match reply.status {
            ServiceStatus::Ok if data_sent => self.finish_request(id, proto_id, &reply),
            ServiceStatus::Ok => {
                // the payload buffer is ready now
                if self.send_payload(id, proto_id) {
                    if let Some(request) = self.requests.get_mut(&id) {
                        request.check_count = 0;
                    }
                    self.arm_poll(id);
                }
            }
            ServiceStatus::Pending => self.arm_poll(id),
            ServiceStatus::NoMemory => {
                self.reject(id, DeviceError::Memory);
                self.resetting.push_back(proto_id);
            }
            ServiceStatus::NotFound => {
                // the slot is already gone on the device side
                self.reject(id, DeviceError::Device("Request was cancelled".to_string()));
                self.active_count = self.active_count.saturating_sub(1);
            }
            status => {
                self.reject(
                    id,
                    DeviceError::Protocol(format!("Unexpected service status: {:?}", status)),
                );
                self.resetting.push_back(proto_id);
            }
        }
    }

    fn finish_request(&mut self, id: u32, proto_id: u16, reply: &ServiceReply) {
        let result = match reply.result {
            Some(result) => result,
            None => {
                self.reject(
                    id,
                    DeviceError::Protocol("Service reply is missing a result code".to_string()),
                );
                self.resetting.push_back(proto_id);
                return;
            }
        };
        let size = reply.size.unwrap_or(0) as usize;
        if size > proto::MAX_PAYLOAD_SIZE {
            self.reject(
                id,
                DeviceError::Protocol(format!("Reply payload too large: {} bytes", size)),
            );
            self.resetting.push_back(proto_id);
            return;
        }
        let bytes = if size > 0 {
            trace!("request {}: RECV ({} bytes)", id, size);
            let bytes = match self.usb_in(proto::recv_setup(proto_id, size)) {
                Ok(bytes) => bytes,
                Err(error) => {
                    self.fail_handle(error, Some(id));
                    return;
                }
            };
            if bytes.len() != size {
                self.reject(
                    id,
                    DeviceError::Protocol(format!(
                        "Unexpected reply size: expected {}, read {}",
                        size,
                        bytes.len()
                    )),
                );
                self.resetting.push_back(proto_id);
                return;
            }
            Some(bytes)
        } else {
            None
        };
        let text = self.requests.get(&id).map_or(false, |request| request.text);
        let data = match bytes {
            Some(bytes) if text => match String::from_utf8(bytes) {
                Ok(text) => Some(Payload::Text(text)),
                Err(_) => {
                    self.reject(
                        id,
                        DeviceError::Protocol("Reply payload is not valid UTF-8".to_string()),
                    );
                    self.resetting.push_back(proto_id);
                    return;
                }
            },
            Some(bytes) => Some(Payload::Bytes(bytes)),
            None => None,
        };
        debug!("request {}: completed (result: {})", id, result);
        self.resolve(id, RequestResult { result, data });
        // the device releases the slot together with the terminal reply
        self.active_count = self.active_count.saturating_sub(1);
    }

    fn send_payload(&mut self, id: u32, proto_id: u16) -> bool {
        let data = match self.requests.get_mut(&id).and_then(|request| request.data.take()) {
            Some(data) => data,
            None => {
                self.reject(id, DeviceError::Internal("Request has no payload".to_string()));
                return false;
            }
        };
        trace!("request {}: SEND ({} bytes)", id, data.len());
        if let Err(error) = self.usb_out(proto::send_setup(proto_id, data.len()), &data) {
            self.fail_handle(error, Some(id));
            return false;
        }
        if let Some(request) = self.requests.get_mut(&id) {
            request.data_sent = true;
        }
        true
    }

    fn arm_poll(&mut self, id: u32) {
        let now = self.clock.now();
        if let Some(request) = self.requests.get_mut(&id) {
            let delay = request.schedule.next_delay(request.check_count);
            request.poll_at = Some(now + delay);
        }
    }

    fn require_proto_id(&mut self, id: u32, reply: &ServiceReply) -> Option<u16> {
        match reply.id {
            Some(proto_id) if proto_id != 0 => Some(proto_id),
            _ => {
                self.reject(
                    id,
                    DeviceError::Protocol("Service reply is missing a request handle".to_string()),
                );
                None
            }
        }
    }

    fn service_in(&mut self, setup: Setup, id: u32) -> Option<ServiceReply> {
        let data = match self.usb_in(setup) {
            Ok(data) => data,
            Err(error) => {
                self.fail_handle(error, Some(id));
                return None;
            }
        };
        match ServiceReply::parse(&data) {
            Ok(reply) => Some(reply),
            Err(error) => {
                self.reject_with(id, error);
                None
            }
        }
    }

    fn usb_in(&mut self, setup: Setup) -> Result<Vec<u8>> {
        debug_assert!(!self.busy, "control transfer already in flight");
        self.busy = true;
        let result = self.usb.transfer_in(setup);
        self.busy = false;
        result
    }

    fn usb_out(&mut self, setup: Setup, data: &[u8]) -> Result<()> {
        debug_assert!(!self.busy, "control transfer already in flight");
        self.busy = true;
        let result = self.usb.transfer_out(setup, data);
        self.busy = false;
        result
    }

    fn resolve(&mut self, id: u32, result: RequestResult) {
        if let Some(request) = self.requests.get_mut(&id) {
            if request.done {
                return;
            }
            request.done = true;
            request.poll_at = None;
            request.outcome = Some(Ok(result));
        }
    }

    fn reject(&mut self, id: u32, error: DeviceError) {
        self.reject_with(id, error.into());
    }

    fn reject_with(&mut self, id: u32, error: failure::Error) {
        if let Some(request) = self.requests.get_mut(&id) {
            if request.done {
                return;
            }
            request.done = true;
            request.poll_at = None;
            request.outcome = Some(Err(error));
        }
    }

    fn reject_unfinished(&mut self, reason: &str) {
        let live: Vec<u32> = self
            .requests
            .values()
            .filter(|request| !request.done)
            .map(|request| request.id)
            .collect();
        let mut had_active = false;
        for id in live {
            if self
                .requests
                .get(&id)
                .map_or(false, |request| request.proto_id.is_some())
            {
                had_active = true;
            }
            self.reject(id, DeviceError::State(reason.to_string()));
        }
        self.pending.clear();
        self.checking.clear();
        if had_active {
            // one global reset returns every slot at once
            self.resetting.clear();
            self.reset_all = true;
        }
    }

    /// A transport fault ends the open cycle: the involved request keeps
    /// the USB cause, everything else is rejected and the handle closes.
    fn fail_handle(&mut self, error: failure::Error, involved: Option<u32>) {
        debug!("transport fault: {}", error);
        if let Some(id) = involved {
            self.reject_with(id, error);
        }
        let live: Vec<u32> = self
            .requests
            .values()
            .filter(|request| !request.done)
            .map(|request| request.id)
            .collect();
        for id in live {
            self.reject(id, DeviceError::State("Device was closed".to_string()));
        }
        self.pending.clear();
        self.checking.clear();
        self.resetting.clear();
        self.reset_all = false;
        self.active_count = 0;
        self.close_deadline = None;
        self.want_close = false;
        self.usb.close().ok();
        self.state = HandleState::Closed;
        self.events.push_back(DeviceEvent::Closed);
    }

    fn is_drained(&self) -> bool {
        self.active_count == 0
            && !self.reset_all
            && self.resetting.is_empty()
            && self.requests.values().all(|request| request.done)
    }

    fn finish_close(&mut self) {
        if let Err(error) = self.usb.close() {
            debug!("Error closing device: {}", error);
        }
        self.state = HandleState::Closed;
        self.want_close = false;
        self.close_deadline = None;
        self.events.push_back(DeviceEvent::Closed);
    }

    fn next_timer(&self) -> Option<Instant> {
        let mut next = self.close_deadline;
        for request in self.requests.values().filter(|request| !request.done) {
            let mut candidate = request.deadline;
            if let Some(poll_at) = request.poll_at {
                candidate = candidate.min(poll_at);
            }
            next = Some(next.map_or(candidate, |at| at.min(candidate)));
        }
        next
    }
}

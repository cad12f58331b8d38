use std::time::Duration;

use log::{debug, info};

use crate::devices::{lookup_usb_ids, DeviceInfo, DeviceType};
use crate::dfu::DfuClient;
use crate::engine::{
    DeviceEvent, Engine, EngineOptions, HandleState, Payload, RequestOptions, RequestResult,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::proto::{result_codes, result_message};
use crate::usb::UsbTransport;
use crate::{DeviceError, Result};

/// Request-type codes implemented by current device firmware.
///
/// Callers may pass any `u16`; these are the codes the family ships today.
pub mod request_types {
    /// Echo the request payload back to the host.
    pub const ECHO: u16 = 1;
    /// Application-defined request, dispatched to user firmware.
    pub const APP_CUSTOM: u16 = 10;
    /// Read the device serial number as text.
    pub const GET_SERIAL_NUMBER: u16 = 21;
    /// Read the system firmware version as text.
    pub const GET_SYSTEM_VERSION: u16 = 30;
    /// Ask the firmware to reset the device.
    pub const RESET: u16 = 40;
    /// Read the device id as text.
    pub const GET_DEVICE_ID: u16 = 20;
}

/// Options accepted by [`Device::new`].
pub struct DeviceOptions {
    /// Upper bound on concurrent requests. When unset the cap is learned
    /// from the first BUSY reply and never raised afterwards.
    pub concurrency_limit: Option<u32>,
    /// Default logical-request timeout.
    pub request_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self { concurrency_limit: None, request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }
}

/// Options accepted by [`Device::close_with`].
pub struct CloseOptions {
    /// Let submitted requests finish before closing (default). When
    /// cleared they are rejected immediately.
    pub process_pending: bool,
    /// Give up on pending requests after this long.
    pub timeout: Option<Duration>,
}

impl Default for CloseOptions {
    fn default() -> Self {
        Self { process_pending: true, timeout: None }
    }
}

/// Handle to one Helio device.
///
/// Owns the transport and request engine for one attached unit, tracks its
/// identity while open, and emits `open`/`closed` notifications exactly
/// once per open cycle. Several logical requests can be in flight at once:
/// submit each with [`Device::submit_request`], then collect replies with
/// [`Device::wait_request`] or [`Device::poll_request`] in any order.
pub struct Device<T: UsbTransport> {
    engine: Engine<T>,
    info: &'static DeviceInfo,
    dfu_mode: bool,
    device_id: Option<String>,
    firmware_version: Option<String>,
    listeners: Vec<Box<dyn FnMut(DeviceEvent)>>,
}

impl<T: UsbTransport> std::fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("dfu_mode", &self.dfu_mode)
            .field("device_id", &self.device_id)
            .field("firmware_version", &self.firmware_version)
            .finish()
    }
}

impl<T: UsbTransport> Device<T> {
    /// Wrap a transport whose USB ids appear in the device table.
    pub fn new(usb: T, options: DeviceOptions) -> Result<Self> {
        Self::with_engine_options(
            usb,
            EngineOptions {
                default_timeout: options.request_timeout,
                concurrency_limit: options.concurrency_limit,
                ..EngineOptions::default()
            },
        )
    }

    #[cfg(test)]
    pub(crate) fn with_clock(
        usb: T,
        options: DeviceOptions,
        clock: std::rc::Rc<dyn crate::engine::Clock>,
    ) -> Result<Self> {
        Self::with_engine_options(
            usb,
            EngineOptions {
                clock,
                default_timeout: options.request_timeout,
                concurrency_limit: options.concurrency_limit,
                ..EngineOptions::default()
            },
        )
    }

    fn with_engine_options(usb: T, options: EngineOptions) -> Result<Self> {
        let (info, dfu_mode) = match lookup_usb_ids(usb.vendor_id(), usb.product_id()) {
            Some(matched) => matched,
            None => Err(DeviceError::NotFound(format!(
                "Unsupported USB device {:04x}:{:04x}",
                usb.vendor_id(),
                usb.product_id()
            )))?,
        };
        Ok(Self {
            engine: Engine::new(usb, options),
            info,
            dfu_mode,
            device_id: None,
            firmware_version: None,
            listeners: Vec::new(),
        })
    }

    /// Register a callback for `open`/`closed` notifications.
    pub fn subscribe<F: FnMut(DeviceEvent) + 'static>(&mut self, listener: F) {
        self.listeners.push(Box::new(listener));
    }

    /// Open the device and read its identity.
    ///
    /// Leftover device-side slots from a previous host session are
    /// reclaimed before the first request runs. The firmware version is
    /// queried opportunistically; a refusal leaves it unset.
    pub fn open(&mut self) -> Result<()> {
        self.engine.open()?;
        if let Err(error) = self.read_identity() {
            if self.engine.state() != HandleState::Closed {
                self.engine.close(false, None).ok();
            }
            // the open never completed, so no lifecycle events fire
            while self.engine.take_event().is_some() {}
            self.device_id = None;
            self.firmware_version = None;
            return Err(error);
        }
        self.engine.emit(DeviceEvent::Open);
        self.flush_events();
        Ok(())
    }

    fn read_identity(&mut self) -> Result<()> {
        let serial = self.engine.usb_mut().serial_number()?;
        self.device_id = Some(serial.to_lowercase());
        if self.dfu_mode {
            info!("device {} is in DFU mode", serial.to_lowercase());
            return Ok(());
        }
        self.engine.arm_slot_reclaim();
        let options = RequestOptions { check_result: false, ..Default::default() };
        let version = self
            .submit_request(request_types::GET_SYSTEM_VERSION, None, &options)
            .and_then(|id| self.wait_request(id));
        match version {
            Ok(reply) if reply.result == result_codes::OK => {
                if let Some(Payload::Bytes(bytes)) = reply.data {
                    self.firmware_version = String::from_utf8(bytes).ok();
                }
            }
            Ok(reply) => {
                debug!("version query refused (result: {})", reply.result);
            }
            Err(error) => {
                if self.engine.state() == HandleState::Closed {
                    return Err(error);
                }
                debug!("version query failed: {}", error);
            }
        }
        Ok(())
    }

    /// Lowercase device id, from the USB serial-number descriptor.
    pub fn id(&self) -> Option<&str> {
        if self.is_open() {
            self.device_id.as_deref()
        } else {
            None
        }
    }

    /// Firmware version reported at open time.
    pub fn firmware_version(&self) -> Option<&str> {
        if self.is_open() {
            self.firmware_version.as_deref()
        } else {
            None
        }
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        if self.is_open() {
            Some(self.info.device_type)
        } else {
            None
        }
    }

    pub fn platform_id(&self) -> Option<u16> {
        if self.is_open() {
            Some(self.info.platform_id)
        } else {
            None
        }
    }

    /// Whether the device enumerated as its DFU bootloader.
    pub fn is_in_dfu_mode(&self) -> Option<bool> {
        if self.is_open() {
            Some(self.dfu_mode)
        } else {
            None
        }
    }

    fn is_open(&self) -> bool {
        self.engine.state() == HandleState::Open
    }

    /// Submit a request and wait for the device's reply.
    ///
    /// Equivalent to [`Device::submit_request`] followed by
    /// [`Device::wait_request`]; requests submitted earlier keep making
    /// progress while this one is driven.
    pub fn send_request(
        &mut self,
        req_type: u16,
        data: Option<Payload>,
        options: &RequestOptions,
    ) -> Result<RequestResult> {
        let id = self.submit_request(req_type, data, options)?;
        self.wait_request(id)
    }

    /// Admit a request without driving it and return its id.
    ///
    /// Any number of requests may be outstanding at once, bounded only by
    /// the device's concurrency cap; the engine multiplexes them over the
    /// control endpoint as replies are awaited or polled.
    pub fn submit_request(
        &mut self,
        req_type: u16,
        data: Option<Payload>,
        options: &RequestOptions,
    ) -> Result<u32> {
        self.engine.submit(req_type, data, options)
    }

    /// Drive outstanding work until request `id` terminates, then return
    /// its reply.
    ///
    /// With `check_result` set at submission (the default), a reply whose
    /// result code is not OK fails the call with a request error.
    pub fn wait_request(&mut self, id: u32) -> Result<RequestResult> {
        let check = self.engine.checks_result(id);
        let result = self.engine.wait(id);
        // a transport fault mid-pump closes the handle
        self.flush_events();
        self.checked_reply(check, result?)
    }

    /// Advance outstanding work without sleeping and collect request `id`
    /// if it has terminated. Returns `Ok(None)` while the request is still
    /// in flight (for example between polling-timer firings).
    pub fn poll_request(&mut self, id: u32) -> Result<Option<RequestResult>> {
        while self.engine.pump_once() {}
        self.flush_events();
        if !self.engine.outcome_ready(id) {
            return Ok(None);
        }
        let check = self.engine.checks_result(id);
        let reply = self.engine.take_outcome(id)?;
        self.checked_reply(check, reply).map(Some)
    }

    fn checked_reply(&self, check: bool, reply: RequestResult) -> Result<RequestResult> {
        if check && reply.result != result_codes::OK {
            Err(DeviceError::Request {
                result: reply.result,
                message: result_message(reply.result),
            })?
        }
        Ok(reply)
    }

    /// Drive the bootloader out of DFU mode.
    ///
    /// After a successful leave the device manifests and resets; the USB
    /// handle is lost and should only be closed.
    pub fn leave_dfu_mode(&mut self) -> Result<()> {
        if !self.is_open() {
            Err(DeviceError::State("Device is not open".to_string()))?
        }
        if !self.dfu_mode {
            Err(DeviceError::State("Device is not in DFU mode".to_string()))?
        }
        DfuClient::new(self.engine.usb_mut()).leave()
    }

    /// Close the device after letting submitted requests finish.
    pub fn close(&mut self) -> Result<()> {
        self.close_with(CloseOptions::default())
    }

    /// Close the device, completing outstanding requests per `options`.
    pub fn close_with(&mut self, options: CloseOptions) -> Result<()> {
        if self.engine.state() == HandleState::Closed {
            return Ok(());
        }
        let result = self.engine.close(options.process_pending, options.timeout);
        self.device_id = None;
        self.firmware_version = None;
        self.flush_events();
        result
    }

    fn flush_events(&mut self) {
        while let Some(event) = self.engine.take_event() {
            for listener in &mut self.listeners {
                listener(event);
            }
        }
    }
}

impl<T: UsbTransport> Drop for Device<T> {
    /// Best-effort close so device-side slots are not leaked.
    fn drop(&mut self) {
        if self.engine.state() != HandleState::Closed {
            self.engine.close(false, None).ok();
        }
    }
}

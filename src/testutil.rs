use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::engine::Clock;
use crate::usb::{Setup, UsbTransport};
use crate::{DeviceError, Result};

/// One expected control transfer and its scripted outcome.
#[derive(Debug)]
pub enum Exchange {
    /// Expect an IN transfer with this setup; respond with these bytes.
    In(Setup, Vec<u8>),
    /// Expect an IN transfer with this setup; fail it at the USB level.
    InError(Setup, rusb::Error),
    /// Expect an OUT transfer with this setup and exactly this payload.
    Out(Setup, Vec<u8>),
    /// Expect an OUT transfer with this setup; fail it at the USB level.
    OutError(Setup, rusb::Error),
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub setup: Setup,
    /// OUT data stage; `None` for IN transfers.
    pub data: Option<Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    opened: bool,
    closed: u32,
}

/// Transport that plays back a script and records every transfer.
///
/// Any transfer that deviates from the script panics, so a passing test
/// proves the exact wire sequence.
pub struct MockTransport {
    script: Rc<RefCell<VecDeque<Exchange>>>,
    log: Rc<RefCell<Vec<LogEntry>>>,
    state: Rc<RefCell<MockState>>,
    pub serial: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Fail serial-number reads, as a vanished device would.
    pub fail_serial: bool,
}

impl MockTransport {
    pub fn new(script: Vec<Exchange>) -> Self {
        Self {
            script: Rc::new(RefCell::new(script.into())),
            log: Rc::new(RefCell::new(Vec::new())),
            state: Rc::new(RefCell::new(MockState::default())),
            serial: "E00FCE68A1B2C3D4".to_string(),
            vendor_id: 0x2bf4,
            product_id: 0xc006,
            fail_serial: false,
        }
    }

    /// Handle the test keeps after the transport moves into a device.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            script: self.script.clone(),
            log: self.log.clone(),
            state: self.state.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MockHandle {
    script: Rc<RefCell<VecDeque<Exchange>>>,
    log: Rc<RefCell<Vec<LogEntry>>>,
    state: Rc<RefCell<MockState>>,
}

impl MockHandle {
    pub fn log(&self) -> Vec<LogEntry> {
        self.log.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().opened
    }

    pub fn closed(&self) -> u32 {
        self.state.borrow().closed
    }

    /// True when the whole script has been consumed.
    pub fn exhausted(&self) -> bool {
        self.script.borrow().is_empty()
    }
}

impl UsbTransport for MockTransport {
    fn open(&mut self) -> Result<()> {
        self.state.borrow_mut().opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.opened = false;
        state.closed += 1;
        Ok(())
    }

    fn transfer_in(&mut self, setup: Setup) -> Result<Vec<u8>> {
        self.log.borrow_mut().push(LogEntry { setup, data: None });
        match self.script.borrow_mut().pop_front() {
            Some(Exchange::In(expected, reply)) => {
                assert_eq!(setup, expected, "unexpected IN transfer");
                Ok(reply)
            }
            Some(Exchange::InError(expected, error)) => {
                assert_eq!(setup, expected, "unexpected IN transfer");
                Err(DeviceError::Usb(error).into())
            }
            other => panic!("unscripted IN transfer {:?} (next: {:?})", setup, other),
        }
    }

    fn transfer_out(&mut self, setup: Setup, data: &[u8]) -> Result<()> {
        self.log
            .borrow_mut()
            .push(LogEntry { setup, data: Some(data.to_vec()) });
        match self.script.borrow_mut().pop_front() {
            Some(Exchange::Out(expected, expected_data)) => {
                assert_eq!(setup, expected, "unexpected OUT transfer");
                assert_eq!(data, &expected_data[..], "unexpected OUT payload");
                Ok(())
            }
            Some(Exchange::OutError(expected, error)) => {
                assert_eq!(setup, expected, "unexpected OUT transfer");
                Err(DeviceError::Usb(error).into())
            }
            other => panic!("unscripted OUT transfer {:?} (next: {:?})", setup, other),
        }
    }

    fn serial_number(&mut self) -> Result<String> {
        if self.fail_serial {
            Err(DeviceError::Usb(rusb::Error::NoDevice))?
        }
        Ok(self.serial.clone())
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }
}

/// Deterministic clock whose `sleep` advances virtual time instantly.
pub struct VirtualClock {
    base: Instant,
    offset: RefCell<Duration>,
}

impl VirtualClock {
    pub fn new() -> Rc<Self> {
        Rc::new(Self { base: Instant::now(), offset: RefCell::new(Duration::from_millis(0)) })
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.borrow()
    }

    /// Move virtual time forward without a sleep, as between polls.
    pub fn advance(&self, duration: Duration) {
        *self.offset.borrow_mut() += duration;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.borrow()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Build a full service reply frame, padded the way current firmware does.
pub fn reply_frame(status: u16, id: u16, size: u32, result: i32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16);
    frame.extend_from_slice(&status.to_le_bytes());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(&result.to_le_bytes());
    frame.extend_from_slice(&[0u8; 4]);
    frame
}

/// Build the short status-and-handle reply some frames carry.
pub fn status_frame(status: u16, id: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4);
    frame.extend_from_slice(&status.to_le_bytes());
    frame.extend_from_slice(&id.to_le_bytes());
    frame
}

/// Build a 6-byte DFU GETSTATUS response.
pub fn dfu_status_frame(status: u8, poll_timeout: u32, state: u8) -> Vec<u8> {
    vec![
        status,
        (poll_timeout & 0xff) as u8,
        ((poll_timeout >> 8) & 0xff) as u8,
        ((poll_timeout >> 16) & 0xff) as u8,
        state,
        0,
    ]
}

use failure_derive::Fail;

mod device;
mod devices;
mod dfu;
mod engine;
mod proto;
mod usb;

#[cfg(test)]
mod testutil;

pub use device::{request_types, CloseOptions, Device, DeviceOptions};
pub use devices::{lookup_usb_ids, DeviceInfo, DeviceType, UsbIds, DEVICES};
pub use dfu::{DfuClient, DfuState, DfuStatus, DfuStatusReport};
pub use engine::{
    Clock, DefaultSchedule, DeviceEvent, Payload, PollingSchedule, RequestOptions, RequestResult,
    ScheduleFn, SystemClock, DEFAULT_REQUEST_TIMEOUT,
};
pub use proto::{result_codes, result_message, ServiceReply, ServiceStatus, MAX_PAYLOAD_SIZE};
pub use usb::{list_devices, open_device_by_id, Setup, UsbDeviceHandle, UsbTransport};

#[derive(Fail, Debug)]
pub enum DeviceError {
    #[fail(display = "USB error: {}", _0)]
    Usb(#[cause] rusb::Error),

    #[fail(display = "{}", _0)]
    State(String),

    #[fail(display = "Request timeout")]
    Timeout,

    #[fail(display = "Device ran out of memory")]
    Memory,

    #[fail(display = "Protocol error: {}", _0)]
    Protocol(String),

    #[fail(display = "Request failed: {} (result: {})", message, result)]
    Request { result: i32, message: &'static str },

    #[fail(display = "{}", _0)]
    NotFound(String),

    #[fail(display = "DFU error: {}", _0)]
    Dfu(String),

    #[fail(display = "{}", _0)]
    Device(String),

    #[fail(display = "Internal error: {}", _0)]
    Internal(String),
}

impl From<rusb::Error> for DeviceError {
    fn from(error: rusb::Error) -> Self {
        DeviceError::Usb(error)
    }
}

pub type Result<T> = std::result::Result<T, failure::Error>;

/// Format an error and its chain of causes as a single line.
pub fn error_chain(error: &failure::Error) -> String {
    let mut message = error.to_string();
    for cause in error.iter_causes() {
        message.push_str(": ");
        message.push_str(&cause.to_string());
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use failure::ResultExt;

    #[test]
    fn error_chain_includes_causes() {
        let error: failure::Error = DeviceError::Usb(rusb::Error::NoDevice).into();
        let error: failure::Error = Err::<(), _>(error)
            .context("Error opening device")
            .unwrap_err()
            .into();
        let chain = error_chain(&error);
        assert!(chain.starts_with("Error opening device"));
        assert!(chain.contains("USB error"));
    }

    #[test]
    fn request_error_display_names_the_result() {
        let error = DeviceError::Request {
            result: crate::result_codes::NOT_ALLOWED,
            message: crate::result_message(crate::result_codes::NOT_ALLOWED),
        };
        let text = error.to_string();
        assert!(text.contains("not allowed"));
        assert!(text.contains("-130"));
    }
}

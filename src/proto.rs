use std::convert::TryFrom;

use num_enum::TryFromPrimitive;

use crate::usb::Setup;
use crate::{DeviceError, Result};

/// Vendor bRequest shared by every service frame.
pub const SERVICE_BREQUEST: u8 = 0x50;

/// bmRequestType for device-to-host service transfers.
pub const REQUEST_TYPE_IN: u8 = 0xc0;
/// bmRequestType for host-to-device service transfers.
pub const REQUEST_TYPE_OUT: u8 = 0x40;

/// Floor for the wLength of reply-bearing IN frames. The INIT frame also
/// advertises the request payload length through wLength, so the firmware
/// always allocates at least this much and replies within the same stage.
pub const MIN_WLENGTH: u16 = 64;

/// Upper bound on a request or reply payload, limited by the 16-bit
/// wLength of a control transfer.
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Service frame kinds, carried in wIndex.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceKind {
    Init = 1,
    Check = 2,
    Send = 3,
    Recv = 4,
    Reset = 5,
}

/// Device-reported status of a service transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u16)]
pub enum ServiceStatus {
    Ok = 0,
    Pending = 1,
    Busy = 2,
    NoMemory = 3,
    NotFound = 4,
}

/// Setup for an INIT frame opening a slot for a logical request.
pub fn init_setup(req_type: u16, payload_len: usize) -> Setup {
    Setup {
        request_type: REQUEST_TYPE_IN,
        request: SERVICE_BREQUEST,
        value: req_type,
        index: ServiceKind::Init as u16,
        length: (payload_len as u16).max(MIN_WLENGTH),
    }
}

/// Setup for a CHECK frame polling the slot `proto_id`.
pub fn check_setup(proto_id: u16) -> Setup {
    Setup {
        request_type: REQUEST_TYPE_IN,
        request: SERVICE_BREQUEST,
        value: proto_id,
        index: ServiceKind::Check as u16,
        length: MIN_WLENGTH,
    }
}

/// Setup for a SEND frame carrying the request payload as its data stage.
pub fn send_setup(proto_id: u16, payload_len: usize) -> Setup {
    Setup {
        request_type: REQUEST_TYPE_OUT,
        request: SERVICE_BREQUEST,
        value: proto_id,
        index: ServiceKind::Send as u16,
        length: payload_len as u16,
    }
}

/// Setup for a RECV frame downloading exactly `size` reply bytes.
pub fn recv_setup(proto_id: u16, size: usize) -> Setup {
    Setup {
        request_type: REQUEST_TYPE_IN,
        request: SERVICE_BREQUEST,
        value: proto_id,
        index: ServiceKind::Recv as u16,
        length: size as u16,
    }
}

/// Setup for a RESET frame releasing one slot, or every slot when
/// `proto_id` is zero.
pub fn reset_setup(proto_id: u16) -> Setup {
    Setup {
        request_type: REQUEST_TYPE_OUT,
        request: SERVICE_BREQUEST,
        value: proto_id,
        index: ServiceKind::Reset as u16,
        length: 0,
    }
}

/// Parsed service reply frame.
///
/// The firmware lays the frame out little-endian: `status: u16` at offset 0,
/// `id: u16` at 2, `size: u32` at 4 and `result: i32` at 8. Devices may pad
/// the frame; trailing bytes are ignored. Short frames lose trailing fields,
/// reflected here as `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceReply {
    pub status: ServiceStatus,
    pub id: Option<u16>,
    pub size: Option<u32>,
    pub result: Option<i32>,
}

impl ServiceReply {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            Err(DeviceError::Protocol(format!(
                "Service reply too short: {} bytes",
                data.len()
            )))?
        }
        let raw_status = u16::from_le_bytes([data[0], data[1]]);
        let status = ServiceStatus::try_from(raw_status).map_err(|_| {
            DeviceError::Protocol(format!("Unknown service status: {}", raw_status))
        })?;
        let id = if data.len() >= 4 {
            Some(u16::from_le_bytes([data[2], data[3]]))
        } else {
            None
        };
        let size = if data.len() >= 8 {
            Some(u32::from_le_bytes([data[4], data[5], data[6], data[7]]))
        } else {
            None
        };
        let result = if data.len() >= 12 {
            Some(i32::from_le_bytes([data[8], data[9], data[10], data[11]]))
        } else {
            None
        };
        Ok(ServiceReply { status, id, size, result })
    }
}

/// Result codes the device firmware reports in the reply `result` field.
pub mod result_codes {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = -100;
    pub const BUSY: i32 = -110;
    pub const NOT_SUPPORTED: i32 = -120;
    pub const NOT_ALLOWED: i32 = -130;
    pub const CANCELLED: i32 = -140;
    pub const ABORTED: i32 = -150;
    pub const TIMEOUT: i32 = -160;
    pub const NOT_FOUND: i32 = -170;
    pub const ALREADY_EXISTS: i32 = -180;
    pub const TOO_LARGE: i32 = -190;
    pub const INVALID_STATE: i32 = -210;
    pub const NO_MEMORY: i32 = -260;
    pub const INVALID_ARGUMENT: i32 = -270;
}

/// Human-readable description of a device result code.
pub fn result_message(result: i32) -> &'static str {
    use result_codes::*;
    match result {
        OK => "Operation succeeded",
        ERROR => "Unknown error",
        BUSY => "Device is busy",
        NOT_SUPPORTED => "Operation is not supported",
        NOT_ALLOWED => "Operation is not allowed",
        CANCELLED => "Operation was cancelled",
        ABORTED => "Operation was aborted",
        TIMEOUT => "Operation timed out",
        NOT_FOUND => "Entity was not found",
        ALREADY_EXISTS => "Entity already exists",
        TOO_LARGE => "Data is too large",
        INVALID_STATE => "Invalid device state",
        NO_MEMORY => "Device ran out of memory",
        INVALID_ARGUMENT => "Invalid argument",
        _ => "Request failed",
    }
}

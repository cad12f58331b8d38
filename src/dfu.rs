//! USB DFU client
//!
//! Reference: [DFU 1.1 Specification](https://www.usb.org/sites/default/files/DFU_1.1.pdf)

use std::convert::TryFrom;
use std::thread::sleep;
use std::time::Duration;

use failure::ResultExt;
use log::{debug, info};
use num_enum::TryFromPrimitive;

use crate::usb::{Setup, UsbTransport};
use crate::{DeviceError, Result};

/// bmRequestType for host-to-device DFU class requests.
const DFU_REQUEST_TYPE_OUT: u8 = 0x21;
/// bmRequestType for device-to-host DFU class requests.
const DFU_REQUEST_TYPE_IN: u8 = 0xa1;

/// Standard DFU class requests.
#[derive(Copy, Clone, Debug)]
#[allow(unused)]
#[repr(u8)]
enum DfuRequest {
    Detach = 0,
    Dnload = 1,
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

/// Device states from the DFU 1.1 specification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[allow(non_camel_case_types)] // names from the DFU spec
pub enum DfuState {
    appIDLE = 0,
    appDETACH = 1,
    dfuIDLE = 2,
    dfuDNLOAD_SYNC = 3,
    dfuDNBUSY = 4,
    dfuDNLOAD_IDLE = 5,
    dfuMANIFEST_SYNC = 6,
    dfuMANIFEST = 7,
    dfuMANIFEST_WAIT_RESET = 8,
    dfuUPLOAD_IDLE = 9,
    dfuERROR = 10,
}

/// Status codes from the DFU 1.1 specification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[allow(non_camel_case_types)] // names from the DFU spec
pub enum DfuStatus {
    OK = 0x00,
    errTARGET = 0x01,
    errFILE = 0x02,
    errWRITE = 0x03,
    errERASE = 0x04,
    errCHECK_ERASED = 0x05,
    errPROG = 0x06,
    errVERIFY = 0x07,
    errADDRESS = 0x08,
    errNOTDONE = 0x09,
    errFIRMWARE = 0x0a,
    errVENDOR = 0x0b,
    errUSBR = 0x0c,
    errPOR = 0x0d,
    errUNKNOWN = 0x0e,
    errSTALLEDPKT = 0x0f,
}

/// Parsed GETSTATUS response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DfuStatusReport {
    pub status: DfuStatus,
    /// Minimum time to wait before the next request, in milliseconds.
    pub poll_timeout: u32,
    pub state: DfuState,
}

impl DfuStatusReport {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 6 {
            Err(DeviceError::Protocol(format!(
                "GETSTATUS reply too short: {} bytes",
                data.len()
            )))?
        }
        let status = DfuStatus::try_from(data[0])
            .map_err(|_| DeviceError::Dfu(format!("Unknown DFU status: {}", data[0])))?;
        let poll_timeout =
            u32::from(data[1]) | u32::from(data[2]) << 8 | u32::from(data[3]) << 16;
        let state = DfuState::try_from(data[4])
            .map_err(|_| DeviceError::Dfu(format!("Unknown DFU state: {}", data[4])))?;
        Ok(Self { status, poll_timeout, state })
    }
}

/// Client for a device enumerated in DFU mode. Borrows an open transport,
/// which holds the DFU interface (interface 0, alternate setting 0).
pub struct DfuClient<'a, T: UsbTransport> {
    usb: &'a mut T,
}

impl<'a, T: UsbTransport> DfuClient<'a, T> {
    pub fn new(usb: &'a mut T) -> Self {
        Self { usb }
    }

    /// Read the 6-byte status report. As a side effect the bootloader
    /// advances dfuMANIFEST_SYNC to dfuMANIFEST.
    pub fn get_status(&mut self) -> Result<DfuStatusReport> {
        let data = self
            .usb
            .transfer_in(Setup {
                request_type: DFU_REQUEST_TYPE_IN,
                request: DfuRequest::GetStatus as u8,
                value: 0,
                index: 0,
                length: 6,
            })
            .context("Error reading DFU status")?;
        DfuStatusReport::parse(&data)
    }

    /// Clear an error condition, returning the device to dfuIDLE.
    pub fn clear_status(&mut self) -> Result<()> {
        self.usb
            .transfer_out(
                Setup {
                    request_type: DFU_REQUEST_TYPE_OUT,
                    request: DfuRequest::ClrStatus as u8,
                    value: 0,
                    index: 0,
                    length: 0,
                },
                &[],
            )
            .context("Error clearing DFU status")?;
        Ok(())
    }

    /// Send one firmware block. A zero-length block asks the device to
    /// start manifestation.
    pub fn download(&mut self, block_num: u16, data: &[u8]) -> Result<()> {
        self.usb
            .transfer_out(
                Setup {
                    request_type: DFU_REQUEST_TYPE_OUT,
                    request: DfuRequest::Dnload as u8,
                    value: block_num,
                    index: 0,
                    length: data.len() as u16,
                },
                data,
            )
            .context("Error sending DNLOAD block")?;
        Ok(())
    }

    /// Take the device out of bootloader mode.
    ///
    /// Walks the device to an idle state, triggers manifestation with a
    /// zero-length DNLOAD, and verifies the transition. The device then
    /// resets itself; the USB handle is lost and should only be closed.
    pub fn leave(&mut self) -> Result<()> {
        let report = self.normalize()?;
        info!("leaving DFU mode (state: {:?})", report.state);
        self.download(1, &[])?;
        if report.poll_timeout > 0 {
            sleep(Duration::from_millis(u64::from(report.poll_timeout)));
        }
        let report = self.get_status()?;
        match (report.status, report.state) {
            (_, DfuState::dfuMANIFEST) => Ok(()),
            // older bootloaders report a finished manifest as a completed
            // download instead
            (DfuStatus::OK, DfuState::dfuDNLOAD_IDLE) => Ok(()),
            (status, state) => Err(DeviceError::Dfu(format!(
                "Invalid DFU state: {:?} ({:?})",
                state, status
            ))
            .into()),
        }
    }

    /// Walk the device back to dfuIDLE or dfuDNLOAD_IDLE.
    fn normalize(&mut self) -> Result<DfuStatusReport> {
        let report = match self.get_status() {
            Ok(report) => report,
            Err(error) => {
                // a wedged bootloader may refuse GETSTATUS until its error
                // condition is cleared
                debug!("GETSTATUS failed: {}", error);
                self.clear_status()?;
                self.get_status()?
            }
        };
        let report = match report.state {
            DfuState::dfuIDLE | DfuState::dfuDNLOAD_IDLE => report,
            DfuState::dfuERROR => {
                debug!("clearing DFU error (status: {:?})", report.status);
                self.clear_status()?;
                self.get_status()?
            }
            state => {
                debug!("clearing non-idle DFU state ({:?})", state);
                if self.clear_status().is_err() {
                    // CLRSTATUS outside dfuERROR faults the device; the
                    // second one lands in dfuERROR and succeeds
                    self.clear_status()?;
                }
                self.get_status()?
            }
        };
        match report.state {
            DfuState::dfuIDLE | DfuState::dfuDNLOAD_IDLE => Ok(report),
            _ => Err(DeviceError::Dfu("Invalid state".to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{dfu_status_frame, Exchange, MockTransport};

    fn get_status_setup() -> Setup {
        Setup { request_type: 0xa1, request: 3, value: 0, index: 0, length: 6 }
    }

    fn clear_status_setup() -> Setup {
        Setup { request_type: 0x21, request: 4, value: 0, index: 0, length: 0 }
    }

    fn manifest_dnload_setup() -> Setup {
        Setup { request_type: 0x21, request: 1, value: 1, index: 0, length: 0 }
    }

    fn idle(state: DfuState) -> Vec<u8> {
        dfu_status_frame(DfuStatus::OK as u8, 0, state as u8)
    }

    #[test]
    fn leave_from_idle_takes_the_strict_path() {
        let mut usb = MockTransport::new(vec![
            Exchange::In(get_status_setup(), idle(DfuState::dfuIDLE)),
            Exchange::Out(manifest_dnload_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuMANIFEST)),
        ]);
        let handle = usb.handle();
        DfuClient::new(&mut usb).leave().unwrap();
        assert!(handle.exhausted());
    }

    #[test]
    fn leave_accepts_the_download_idle_quirk() {
        let mut usb = MockTransport::new(vec![
            Exchange::In(get_status_setup(), idle(DfuState::dfuDNLOAD_IDLE)),
            Exchange::Out(manifest_dnload_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuDNLOAD_IDLE)),
        ]);
        DfuClient::new(&mut usb).leave().unwrap();
    }

    #[test]
    fn leave_recovers_from_an_error_state() {
        let mut usb = MockTransport::new(vec![
            Exchange::In(
                get_status_setup(),
                dfu_status_frame(DfuStatus::errPROG as u8, 0, DfuState::dfuERROR as u8),
            ),
            Exchange::Out(clear_status_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuIDLE)),
            Exchange::Out(manifest_dnload_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuMANIFEST)),
        ]);
        DfuClient::new(&mut usb).leave().unwrap();
    }

    #[test]
    fn leave_clears_other_non_idle_states() {
        let mut usb = MockTransport::new(vec![
            Exchange::In(get_status_setup(), idle(DfuState::dfuDNBUSY)),
            Exchange::Out(clear_status_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuIDLE)),
            Exchange::Out(manifest_dnload_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuMANIFEST)),
        ]);
        DfuClient::new(&mut usb).leave().unwrap();
    }

    #[test]
    fn failed_clear_is_retried_through_the_error_state() {
        let mut usb = MockTransport::new(vec![
            Exchange::In(get_status_setup(), idle(DfuState::dfuUPLOAD_IDLE)),
            Exchange::OutError(clear_status_setup(), rusb::Error::Pipe),
            Exchange::Out(clear_status_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuIDLE)),
            Exchange::Out(manifest_dnload_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuMANIFEST)),
        ]);
        DfuClient::new(&mut usb).leave().unwrap();
    }

    #[test]
    fn unrecoverable_state_fails() {
        let mut usb = MockTransport::new(vec![
            Exchange::In(get_status_setup(), idle(DfuState::dfuMANIFEST_WAIT_RESET)),
            Exchange::Out(clear_status_setup(), vec![]),
            Exchange::In(get_status_setup(), idle(DfuState::dfuMANIFEST_WAIT_RESET)),
        ]);
        let error = DfuClient::new(&mut usb).leave().unwrap_err();
        match error.downcast_ref::<DeviceError>() {
            Some(DeviceError::Dfu(message)) => assert_eq!(message, "Invalid state"),
            other => panic!("expected DFU error, got {:?}", other),
        }
    }

    #[test]
    fn bad_manifest_transition_fails() {
        let mut usb = MockTransport::new(vec![
            Exchange::In(get_status_setup(), idle(DfuState::dfuIDLE)),
            Exchange::Out(manifest_dnload_setup(), vec![]),
            Exchange::In(
                get_status_setup(),
                dfu_status_frame(DfuStatus::errNOTDONE as u8, 0, DfuState::dfuERROR as u8),
            ),
        ]);
        let error = DfuClient::new(&mut usb).leave().unwrap_err();
        match error.downcast_ref::<DeviceError>() {
            Some(DeviceError::Dfu(message)) => {
                assert!(message.starts_with("Invalid DFU state"))
            }
            other => panic!("expected DFU error, got {:?}", other),
        }
    }

    #[test]
    fn status_report_parses_the_poll_timeout() {
        let report = DfuStatusReport::parse(&dfu_status_frame(0, 0x123456, 2)).unwrap();
        assert_eq!(report.status, DfuStatus::OK);
        assert_eq!(report.poll_timeout, 0x123456);
        assert_eq!(report.state, DfuState::dfuIDLE);
    }

    #[test]
    fn status_report_rejects_short_and_unknown_frames() {
        assert!(DfuStatusReport::parse(&[0, 0, 0]).is_err());
        // unknown status byte
        assert!(DfuStatusReport::parse(&[0x42, 0, 0, 0, 2, 0]).is_err());
        // unknown state byte
        assert!(DfuStatusReport::parse(&[0, 0, 0, 0, 0x42, 0]).is_err());
    }
}

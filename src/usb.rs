use std::time::Duration;

use failure::ResultExt;
use log::debug;
use rusb::UsbContext;

use crate::device::Device;
use crate::devices::lookup_usb_ids;
use crate::{DeviceError, Result};

/// Timeout applied to each individual control transfer. Logical-request
/// deadlines are layered on top of this by the engine.
pub const CONTROL_TRANSFER_TIMEOUT: Duration = Duration::from_millis(5000);

/// The six-field USB control-transfer setup header.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Setup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Capability the protocol layers use to reach one device.
///
/// At most one transfer is in flight per device; the engine's pump is the
/// only caller and upholds that.
pub trait UsbTransport {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    /// Run a control IN transfer, reading up to `setup.length` bytes.
    fn transfer_in(&mut self, setup: Setup) -> Result<Vec<u8>>;
    /// Run a control OUT transfer with `data` as its data stage.
    fn transfer_out(&mut self, setup: Setup, data: &[u8]) -> Result<()>;
    /// Read the string serial-number descriptor.
    fn serial_number(&mut self) -> Result<String>;
    fn vendor_id(&self) -> u16;
    fn product_id(&self) -> u16;
}

/// rusb-backed transport for one attached device.
pub struct UsbDeviceHandle {
    device: rusb::Device<rusb::Context>,
    handle: Option<rusb::DeviceHandle<rusb::Context>>,
    vendor_id: u16,
    product_id: u16,
    timeout: Duration,
}

impl UsbDeviceHandle {
    fn new(device: rusb::Device<rusb::Context>) -> Result<Self> {
        let descriptor = device
            .device_descriptor()
            .context("Error reading device descriptor")?;
        Ok(Self {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            device,
            handle: None,
            timeout: CONTROL_TRANSFER_TIMEOUT,
        })
    }

    fn handle(&self) -> Result<&rusb::DeviceHandle<rusb::Context>> {
        match &self.handle {
            Some(handle) => Ok(handle),
            None => Err(DeviceError::State("Device is not open".to_string()).into()),
        }
    }
}

impl UsbTransport for UsbDeviceHandle {
    fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            Err(DeviceError::State("Device is already open".to_string()))?
        }
        let mut handle = self.device.open().context("Error opening device")?;
        handle.claim_interface(0).context("Error claiming interface")?;
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            handle.release_interface(0).ok();
        }
        Ok(())
    }

    fn transfer_in(&mut self, setup: Setup) -> Result<Vec<u8>> {
        let handle = self.handle()?;
        let mut data = vec![0u8; setup.length as usize];
        let read = handle
            .read_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                &mut data,
                self.timeout,
            )
            .map_err(DeviceError::Usb)
            .context("Control IN transfer failed")?;
        data.truncate(read);
        Ok(data)
    }

    fn transfer_out(&mut self, setup: Setup, data: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        let written = handle
            .write_control(
                setup.request_type,
                setup.request,
                setup.value,
                setup.index,
                data,
                self.timeout,
            )
            .map_err(DeviceError::Usb)
            .context("Control OUT transfer failed")?;
        if written != data.len() {
            Err(DeviceError::Protocol(format!(
                "Short control write: {} of {} bytes",
                written,
                data.len()
            )))?
        }
        Ok(())
    }

    fn serial_number(&mut self) -> Result<String> {
        let descriptor = self
            .device
            .device_descriptor()
            .context("Error reading device descriptor")?;
        let serial = self
            .handle()?
            .read_serial_number_string_ascii(&descriptor)
            .map_err(DeviceError::Usb)
            .context("Error reading serial number")?;
        Ok(serial)
    }

    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }
}

/// List attached devices whose USB ids appear in the device table.
///
/// The returned handles are not yet open.
pub fn list_devices() -> Result<Vec<Device<UsbDeviceHandle>>> {
    let context = rusb::Context::new().context("Error creating USB context")?;
    let mut found = Vec::new();
    for device in context.devices().context("Error listing devices")?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(_) => continue,
        };
        if lookup_usb_ids(descriptor.vendor_id(), descriptor.product_id()).is_some() {
            found.push(Device::new(UsbDeviceHandle::new(device)?, Default::default())?);
        }
    }
    Ok(found)
}

/// Open the attached device whose id matches `id` (case-insensitive).
///
/// Every candidate is opened to read its serial number; non-matching
/// devices are closed again.
pub fn open_device_by_id(id: &str) -> Result<Device<UsbDeviceHandle>> {
    let id = id.to_lowercase();
    for mut device in list_devices()? {
        match device.open() {
            Ok(()) => {
                if device.id() == Some(id.as_str()) {
                    return Ok(device);
                }
                device.close().ok();
            }
            Err(error) => {
                debug!("skipping unopenable device: {}", error);
            }
        }
    }
    Err(DeviceError::NotFound(format!("Device {} not found", id)))?
}

//! FTDI device control
//!
//! This module wraps an opened `rusb::DeviceHandle` with the FTDI vendor
//! requests used to prepare a synchronous FIFO session.

use super::transfers::map_rusb_error;
use clap::ValueEnum;
use rusb::{Context, DeviceHandle, UsbContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use stream::{BitMode, ChipType, FifoDevice, TransportError};
use tracing::{debug, info, warn};

/// Host-to-device vendor request
const REQUEST_TYPE_OUT: u8 = 0x40;

const SIO_RESET: u8 = 0x00;
const SIO_SET_BITMODE: u8 = 0x0B;

const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

/// Timeout for vendor control requests
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Channel of a multi-interface FTDI chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum FtdiInterface {
    #[default]
    #[value(name = "A")]
    A,
    #[value(name = "B")]
    B,
}

impl FtdiInterface {
    /// USB interface number to claim
    pub fn number(self) -> u8 {
        match self {
            FtdiInterface::A => 0,
            FtdiInterface::B => 1,
        }
    }

    /// `wIndex` of vendor requests addressed to this channel
    pub fn control_index(self) -> u16 {
        match self {
            FtdiInterface::A => 1,
            FtdiInterface::B => 2,
        }
    }

    /// Bulk IN endpoint carrying the FIFO data
    pub fn read_endpoint(self) -> u8 {
        match self {
            FtdiInterface::A => 0x81,
            FtdiInterface::B => 0x83,
        }
    }
}

/// Value of the `SIO_SET_BITMODE` request
pub fn bitmode_value(mask: u8, mode: BitMode) -> u16 {
    ((mode as u16) << 8) | mask as u16
}

/// Re-encode a decoded device release number as the raw `bcdDevice` field
pub fn bcd_device(version: rusb::Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16) << 4)
        | version.sub_minor() as u16
}

/// Opened FTDI device with one claimed interface
pub struct FtdiDevice {
    handle: Arc<DeviceHandle<Context>>,
    interface: FtdiInterface,
    chip: ChipType,
    max_packet_size: usize,
    read_timeout: Duration,
    kernel_driver_detached: bool,
}

impl FtdiDevice {
    /// Open the first device matching `vendor_id:product_id`
    ///
    /// Detaches a bound kernel driver and claims `interface`.
    pub fn open(
        context: &Context,
        vendor_id: u16,
        product_id: u16,
        interface: FtdiInterface,
        read_timeout: Duration,
    ) -> Result<Self, common::Error> {
        let devices = context.devices().map_err(map_rusb_error)?;

        let (device, descriptor) = devices
            .iter()
            .find_map(|device| {
                let descriptor = device.device_descriptor().ok()?;
                (descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id)
                    .then_some((device, descriptor))
            })
            .ok_or(common::Error::Usb(TransportError::NotFound))?;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {:04x}:{:04x}: {}", vendor_id, product_id, e);
            map_rusb_error(e)
        })?;

        let chip = ChipType::from_bcd_device(bcd_device(descriptor.device_version()));
        debug!(
            "Opened {:04x}:{:04x} on bus {:03} address {:03}, chip {}",
            vendor_id,
            product_id,
            device.bus_number(),
            device.address(),
            chip
        );

        let number = interface.number();
        let kernel_driver_detached = match handle.kernel_driver_active(number) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", number);
                handle.detach_kernel_driver(number).map_err(map_rusb_error)?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    number, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(number) {
            warn!("Failed to claim interface {}: {}", number, e);
            if kernel_driver_detached {
                let _ = handle.attach_kernel_driver(number);
            }
            return Err(map_rusb_error(e).into());
        }

        let endpoint = interface.read_endpoint();
        let max_packet_size = device
            .active_config_descriptor()
            .ok()
            .and_then(|config| {
                config
                    .interfaces()
                    .flat_map(|iface| iface.descriptors())
                    .flat_map(|setting| setting.endpoint_descriptors())
                    .find(|ep| ep.address() == endpoint)
                    .map(|ep| ep.max_packet_size() as usize)
            })
            .filter(|size| *size > 0)
            .unwrap_or_else(|| chip.default_packet_size());

        info!(
            "Claimed interface {:?} of {} ({} byte packets)",
            interface, chip, max_packet_size
        );

        Ok(Self {
            handle: Arc::new(handle),
            interface,
            chip,
            max_packet_size,
            read_timeout,
            kernel_driver_detached,
        })
    }

    /// Shared handle for the transfer engine
    pub fn handle(&self) -> Arc<DeviceHandle<Context>> {
        Arc::clone(&self.handle)
    }

    pub fn interface(&self) -> FtdiInterface {
        self.interface
    }

    fn vendor_request(&self, request: u8, value: u16) -> Result<(), TransportError> {
        self.handle
            .write_control(
                REQUEST_TYPE_OUT,
                request,
                value,
                self.interface.control_index(),
                &[],
                CONTROL_TIMEOUT,
            )
            .map(|_| ())
            .map_err(map_rusb_error)
    }
}

impl FifoDevice for FtdiDevice {
    fn chip_type(&self) -> ChipType {
        self.chip
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<(), TransportError> {
        debug!("Setting bit mode {:?} (mask {:#04x})", mode, mask);
        self.vendor_request(SIO_SET_BITMODE, bitmode_value(mask, mode))
    }

    fn flush_buffers(&mut self) -> Result<(), TransportError> {
        self.vendor_request(SIO_RESET, SIO_RESET_PURGE_RX)?;
        self.vendor_request(SIO_RESET, SIO_RESET_PURGE_TX)
    }
}

impl Drop for FtdiDevice {
    fn drop(&mut self) {
        let number = self.interface.number();
        if let Err(e) = self.handle.release_interface(number) {
            warn!("Failed to release interface {}: {}", number, e);
        }

        if self.kernel_driver_detached {
            match self.handle.attach_kernel_driver(number) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", number),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    number, e
                ),
            }
        }
    }
}

//! Serial line helpers shared by the printer link, the serial client listener
//! and the relay board.
//!
//! All three talk 9600-8N1 without flow control.

use serde::Serialize;
use std::time::Duration;
use tracing::info;

pub const BAUD_RATE: u32 = 9600;

/// One entry of [`list_ports`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub name: String,
    pub port_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(p: serialport::SerialPortInfo) -> Self {
        let mut info = PortInfo {
            name: p.port_name,
            port_type: "unknown",
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
        };
        match p.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.port_type = "usb";
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.manufacturer = usb.manufacturer;
                info.product = usb.product;
            }
            serialport::SerialPortType::BluetoothPort => info.port_type = "bluetooth",
            serialport::SerialPortType::PciPort => info.port_type = "pci",
            serialport::SerialPortType::Unknown => {}
        }
        info
    }
}

/// Serial ports present on this machine.
pub fn list_ports() -> Result<Vec<PortInfo>, serialport::Error> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(PortInfo::from)
        .collect())
}

/// Open `name` at 9600-8N1. `timeout` bounds each individual read.
pub fn open_port(
    name: &str,
    timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>, serialport::Error> {
    let port = serialport::new(name, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .flow_control(serialport::FlowControl::None)
        .timeout(timeout)
        .open()?;
    info!(port = name, baud = BAUD_RATE, "Serial port opened");
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usb_port_info() {
        let raw = serialport::SerialPortInfo {
            port_name: "/dev/ttyUSB0".into(),
            port_type: serialport::SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid: 0x1a86,
                pid: 0x7523,
                serial_number: None,
                manufacturer: Some("QinHeng".into()),
                product: Some("CH340".into()),
            }),
        };
        let info = PortInfo::from(raw);
        assert_eq!(info.port_type, "usb");
        assert_eq!(info.vid, Some(0x1a86));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["name"], "/dev/ttyUSB0");
        assert_eq!(json["portType"], "usb");
        assert_eq!(json["product"], "CH340");
    }

    #[test]
    fn test_plain_port_info_omits_usb_fields() {
        let raw = serialport::SerialPortInfo {
            port_name: "COM1".into(),
            port_type: serialport::SerialPortType::PciPort,
        };
        let json = serde_json::to_value(PortInfo::from(raw)).unwrap();
        assert_eq!(json["portType"], "pci");
        assert!(json.get("vid").is_none());
    }

    #[test]
    fn test_open_missing_port_fails() {
        assert!(open_port("/dev/definitely-not-a-port", Duration::from_millis(50)).is_err());
    }
}

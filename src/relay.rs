//! Relay board used for the paper-feed pulse.
//!
//! The board sits on its own serial line and takes AT-style commands for
//! channel 1. Everything here is best-effort: a missing board never stops the
//! gateway, callers check [`Relay::is_ready`] and move on.

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const CMD_ON: &[u8] = b"AT+CH1=1\r\n";
const CMD_OFF: &[u8] = b"AT+CH1=0\r\n";

/// Write timeout for the relay line.
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay not available")]
    NotReady,

    #[error("relay write failed: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Relay: Send + Sync {
    fn on(&self) -> Result<(), RelayError>;

    fn off(&self) -> Result<(), RelayError>;

    /// Switch on, hold for `duration`, switch off.
    fn pulse(&self, duration: Duration) -> Result<(), RelayError> {
        self.on()?;
        std::thread::sleep(duration);
        self.off()
    }

    fn is_ready(&self) -> bool;
}

/// Placeholder when no relay board is configured.
#[derive(Debug, Default)]
pub struct NoRelay;

impl Relay for NoRelay {
    fn on(&self) -> Result<(), RelayError> {
        Err(RelayError::NotReady)
    }

    fn off(&self) -> Result<(), RelayError> {
        Err(RelayError::NotReady)
    }

    fn is_ready(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Serial relay
// ---------------------------------------------------------------------------

pub struct SerialRelay {
    port_name: String,
    line: Mutex<Option<Box<dyn Write + Send>>>,
}

impl SerialRelay {
    /// Open the relay port. Failure is logged and leaves the relay not ready.
    pub fn init(port_name: &str) -> Self {
        let line = match crate::serial::open_port(port_name, WRITE_TIMEOUT) {
            Ok(port) => {
                info!(port = port_name, "Relay board ready");
                Some(Box::new(port) as Box<dyn Write + Send>)
            }
            Err(e) => {
                warn!(port = port_name, error = %e, "Relay board not available, FEED disabled");
                None
            }
        };
        Self {
            port_name: port_name.to_string(),
            line: Mutex::new(line),
        }
    }

    /// Relay driven through an arbitrary writer.
    pub fn with_writer(port_name: &str, writer: Box<dyn Write + Send>) -> Self {
        Self {
            port_name: port_name.to_string(),
            line: Mutex::new(Some(writer)),
        }
    }

    /// Write one command. A failed write drops the line, so the relay
    /// reports not ready until the gateway restarts.
    fn send(&self, line: &mut Option<Box<dyn Write + Send>>, cmd: &[u8]) -> Result<(), RelayError> {
        let writer = line.as_mut().ok_or(RelayError::NotReady)?;
        if let Err(e) = writer.write_all(cmd).and_then(|_| writer.flush()) {
            warn!(port = %self.port_name, error = %e, "Relay write failed, FEED disabled");
            *line = None;
            return Err(RelayError::Io(e));
        }
        Ok(())
    }

    fn command(&self, cmd: &[u8]) -> Result<(), RelayError> {
        let mut line = self.line.lock().unwrap_or_else(|e| e.into_inner());
        self.send(&mut line, cmd)
    }
}

impl Relay for SerialRelay {
    fn on(&self) -> Result<(), RelayError> {
        self.command(CMD_ON)
    }

    fn off(&self) -> Result<(), RelayError> {
        self.command(CMD_OFF)
    }

    /// Holds the line for the whole pulse so concurrent FEEDs do not overlap.
    fn pulse(&self, duration: Duration) -> Result<(), RelayError> {
        let mut line = self.line.lock().unwrap_or_else(|e| e.into_inner());
        self.send(&mut line, CMD_ON)?;
        std::thread::sleep(duration);
        let result = self.send(&mut line, CMD_OFF);
        debug!(port = %self.port_name, ?duration, "Relay pulsed");
        result
    }

    fn is_ready(&self) -> bool {
        self.line
            .lock()
            .map(|l| l.is_some())
            .unwrap_or(false)
    }
}

impl Drop for SerialRelay {
    fn drop(&mut self) {
        if self.is_ready() {
            if let Err(e) = self.off() {
                warn!(port = %self.port_name, error = %e, "Failed to switch relay off");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Unplugged;

    impl Write for Unplugged {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device removed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_no_relay_is_not_ready() {
        let r = NoRelay;
        assert!(!r.is_ready());
        assert!(matches!(r.pulse(Duration::ZERO), Err(RelayError::NotReady)));
    }

    #[test]
    fn test_pulse_sends_on_then_off() {
        let cap = Capture::default();
        let r = SerialRelay::with_writer("COM5", Box::new(cap.clone()));
        assert!(r.is_ready());
        r.pulse(Duration::from_millis(1)).unwrap();
        assert_eq!(*cap.0.lock().unwrap(), b"AT+CH1=1\r\nAT+CH1=0\r\n".to_vec());
    }

    #[test]
    fn test_drop_switches_off() {
        let cap = Capture::default();
        {
            let r = SerialRelay::with_writer("COM5", Box::new(cap.clone()));
            r.on().unwrap();
        }
        assert_eq!(*cap.0.lock().unwrap(), b"AT+CH1=1\r\nAT+CH1=0\r\n".to_vec());
    }

    #[test]
    fn test_missing_port_leaves_relay_not_ready() {
        let r = SerialRelay::init("/dev/definitely-not-a-relay");
        assert!(!r.is_ready());
        assert!(r.on().is_err());
    }

    #[test]
    fn test_write_failure_takes_relay_offline() {
        let r = SerialRelay::with_writer("COM5", Box::new(Unplugged));
        assert!(r.is_ready());

        assert!(matches!(r.pulse(Duration::ZERO), Err(RelayError::Io(_))));
        assert!(!r.is_ready());
        assert!(matches!(r.on(), Err(RelayError::NotReady)));
    }
}

//! In-process printer used for bench testing without hardware.
//!
//! Understands just enough of the device protocol to exercise the gateway:
//! `=K` (reset) succeeds, an empty payload and anything else are reported
//! with the generic error codes.

use tracing::debug;

use super::frame::{self, ClientId};
use super::status::{CoreError, StatusError, StatusPayload};
use super::transport::{DispatchError, PrinterTransport};

/// Reset command understood by the simulated device.
pub const RESET_COMMAND: &[u8] = b"=K";

#[derive(Debug, Default)]
pub struct SimulatedPrinter;

impl SimulatedPrinter {
    pub fn new() -> Self {
        Self
    }

    fn respond(&self, request: &[u8]) -> Result<Vec<u8>, StatusError> {
        let decoded = match frame::decode(request) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "Simulated printer got an undecodable frame");
                return CoreError::FrameConstruction.frame(ClientId::from_counter(0));
            }
        };

        let id = decoded.client_id;
        if decoded.payload.is_empty() {
            CoreError::EmptyCommand.frame(id)
        } else if decoded.payload == RESET_COMMAND {
            let ok = StatusPayload::success("Reset completato")?;
            super::status::encode_status(id, &ok)
        } else {
            CoreError::UnrecognizedCommand.frame(id)
        }
    }
}

impl PrinterTransport for SimulatedPrinter {
    fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>, DispatchError> {
        self.respond(frame)
            .map_err(|e| DispatchError::Io(format!("simulated printer: {e}")))
    }

    fn description(&self) -> String {
        "Simulated".to_string()
    }
}

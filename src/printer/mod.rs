//! Fiscal printer protocol engine.
//!
//! Frame codec, the `TYPE|FAMILY|CODE|MESSAGE` status sub-protocol, byte
//! transports (serial, TCP, simulated) and the dispatcher that serializes
//! access to the single physical device.

pub mod dispatcher;
pub mod frame;
pub mod simulator;
pub mod status;
pub mod transport;

pub use dispatcher::{DispatcherOptions, PrinterDispatcher};
pub use frame::{ClientId, Frame, FrameError};
pub use status::{CoreError, Family, StatusKind, StatusPayload};
pub use transport::{DispatchError, PrinterTransport};

//! Spinel transports between a host and a radio co-processor (RCP).
//!
//! Every transport implements [`SpinelInterface`] and is picked at startup from a
//! radio URL by [`TransportFactory`]:
//! - `spinel+hdlc+uart` / `spinel+hdlc+forkpty`: HDLC-lite over a serial port or a
//!   child process ([`HdlcInterface`])
//! - `spinel+spi`: a Linux `spidev` bus with optional interrupt and reset GPIOs
//!   ([`SpiInterface`])
//! - `spinel+cpc`: an endpoint of a CPC multiplexer daemon ([`CpcInterface`])
//! - `spinel+vendor`: a vendor chip service ([`VendorInterface`])
//!
//! Recoverable conditions come back as [`TransportError`]. Channel failures the
//! transport cannot reason about end the process through [`die_now`] with an
//! [`ExitCode`].

pub mod cpc;
pub mod error;
pub mod exit;
pub mod factory;
pub mod hdlc_interface;
#[cfg(feature = "libcpc")]
pub mod libcpc;
pub mod reset;
pub mod spi;
#[cfg(target_os = "linux")]
pub mod spidev;
pub mod spinel;
pub mod traits;
pub mod url;
pub mod vendor;

pub use cpc::{CpcConfig, CpcDriver, CpcInterface};
pub use error::{Result, TransportError};
pub use exit::{die_now, die_now_with, verify_or_die, ExitCode};
pub use factory::{TransportFactory, TransportKind};
pub use hdlc_interface::{HdlcConfig, HdlcDevice, HdlcInterface, Parity};
#[cfg(feature = "libcpc")]
pub use libcpc::LibCpcDriver;
pub use reset::{reconnect, ResetRegistry, ResetSignal, RetryPolicy};
pub use spi::{GpioPin, SpiConfig, SpiHeader, SpiInterface, SpiLink, SpiStats};
pub use traits::{InterfaceType, RcpInterfaceMetrics, ReceiveFrameCallback, SpinelInterface};
pub use url::RadioUrl;
pub use vendor::{ChipConnector, ChipError, ThreadChip, VendorConfig, VendorInterface};

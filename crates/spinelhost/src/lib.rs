//! Host-side spinel transport layer for Thread radio co-processors.
//!
//! spinelhost moves spinel frames between a host process and an RCP over UART/HDLC, SPI,
//! a CPC multiplexer daemon or a vendor chip service, driven by one single-threaded
//! `select()` loop.
//!
//! # Crate Structure
//!
//! - [`frame`]: frame queue, receive buffer and HDLC-lite framing
//! - [`mainloop`]: the cooperative `select()` loop and its sources
//! - [`transport`]: the transports, radio URLs, reset handling and exit codes
//! - [`RadioSource`]: a mainloop source driving one transport with a send backlog

/// Re-export frame types.
pub mod frame {
    pub use spinelhost_frame::*;
}

/// Re-export mainloop types.
pub mod mainloop {
    pub use spinelhost_mainloop::*;
}

/// Re-export transport types.
pub mod transport {
    pub use spinelhost_transport::*;
}

mod driver;

pub use driver::RadioSource;

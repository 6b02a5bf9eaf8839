use std::fmt;

use tracing::debug;

use crate::cpc::{CpcDriver, CpcInterface, SCHEME_CPC};
use crate::error::{Result, TransportError};
use crate::hdlc_interface::{HdlcInterface, SCHEME_FORKPTY, SCHEME_UART};
use crate::spi::{SpiInterface, SCHEME_SPI};
use crate::traits::{ReceiveFrameCallback, SpinelInterface};
use crate::url::RadioUrl;
use crate::vendor::{ChipConnector, VendorInterface, SCHEME_VENDOR};

pub const SCHEME_TREL: &str = "trel";

/// Transport selected by a radio URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    HdlcUart,
    HdlcForkPty,
    Spi,
    Cpc,
    Vendor,
    Trel,
}

impl TransportKind {
    pub fn from_url(url: &RadioUrl) -> Result<Self> {
        match url.scheme() {
            SCHEME_UART => Ok(TransportKind::HdlcUart),
            SCHEME_FORKPTY => Ok(TransportKind::HdlcForkPty),
            SCHEME_SPI => Ok(TransportKind::Spi),
            SCHEME_CPC => Ok(TransportKind::Cpc),
            SCHEME_VENDOR => Ok(TransportKind::Vendor),
            SCHEME_TREL => Ok(TransportKind::Trel),
            other => Err(TransportError::Unsupported(format!("unknown scheme {other:?}"))),
        }
    }

    pub fn scheme(self) -> &'static str {
        match self {
            TransportKind::HdlcUart => SCHEME_UART,
            TransportKind::HdlcForkPty => SCHEME_FORKPTY,
            TransportKind::Spi => SCHEME_SPI,
            TransportKind::Cpc => SCHEME_CPC,
            TransportKind::Vendor => SCHEME_VENDOR,
            TransportKind::Trel => SCHEME_TREL,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Builds the one transport a process uses from its radio URL.
///
/// Transports that talk to an external service need a way to reach it: vendor URLs
/// need a [`ChipConnector`], CPC URLs need a [`CpcDriver`] unless the crate is built
/// with the `libcpc` feature.
#[derive(Default)]
pub struct TransportFactory {
    chip_connector: Option<Box<dyn ChipConnector>>,
    cpc_driver: Option<Box<dyn CpcDriver>>,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chip_connector(mut self, connector: Box<dyn ChipConnector>) -> Self {
        self.chip_connector = Some(connector);
        self
    }

    pub fn with_cpc_driver(mut self, driver: Box<dyn CpcDriver>) -> Self {
        self.cpc_driver = Some(driver);
        self
    }

    /// Construct the transport for `url` without opening it.
    pub fn create(
        self,
        url: &RadioUrl,
        callback: ReceiveFrameCallback,
    ) -> Result<Box<dyn SpinelInterface>> {
        let kind = TransportKind::from_url(url)?;
        debug!(%kind, url = %url, "creating transport");

        let interface: Box<dyn SpinelInterface> = match kind {
            TransportKind::HdlcUart | TransportKind::HdlcForkPty => {
                Box::new(HdlcInterface::new(callback))
            }
            TransportKind::Cpc => {
                let driver = match self.cpc_driver {
                    Some(driver) => driver,
                    None => default_cpc_driver()?,
                };
                Box::new(CpcInterface::new(driver, callback))
            }
            TransportKind::Vendor => {
                let connector = self.chip_connector.ok_or_else(|| {
                    TransportError::Unsupported(format!("{kind} needs a chip connector"))
                })?;
                Box::new(VendorInterface::new(connector, callback))
            }
            TransportKind::Spi => Box::new(SpiInterface::new(callback)),
            TransportKind::Trel => return Err(TransportError::Unsupported(kind.to_string())),
        };
        Ok(interface)
    }

    /// Construct and initialize the transport for `url`.
    pub fn open(
        self,
        url: &RadioUrl,
        callback: ReceiveFrameCallback,
    ) -> Result<Box<dyn SpinelInterface>> {
        let mut interface = self.create(url, callback)?;
        interface.init(url)?;
        Ok(interface)
    }
}

impl fmt::Debug for TransportFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFactory")
            .field("chip_connector", &self.chip_connector.is_some())
            .field("cpc_driver", &self.cpc_driver.is_some())
            .finish()
    }
}

#[cfg(feature = "libcpc")]
fn default_cpc_driver() -> Result<Box<dyn CpcDriver>> {
    Ok(Box::new(crate::libcpc::LibCpcDriver::new()))
}

#[cfg(not(feature = "libcpc"))]
fn default_cpc_driver() -> Result<Box<dyn CpcDriver>> {
    Err(TransportError::Unsupported(format!(
        "{SCHEME_CPC} (built without libcpc)"
    )))
}

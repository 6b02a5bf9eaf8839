//! Spinel through a vendor chip service (the `IThreadChip` HAL contract).
//!
//! The service is reached through a [`ChipConnector`] and driven through a
//! [`ThreadChip`] handle. Inbound frames arrive as callbacks while the service's
//! polled fd is being serviced.
//!
//! No production [`ChipConnector`] ships with this crate: reaching a vendor service
//! depends on the platform's IPC stack. Embedders supply one through
//! [`TransportFactory::with_chip_connector`](crate::TransportFactory::with_chip_connector).
//! Without it the factory reports `spinel+vendor` URLs as
//! [`Unsupported`](crate::TransportError::Unsupported), which the `spinelhost` CLI
//! turns into a usage error.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use spinelhost_frame::{FrameWrite, RxFrameBuffer};
use spinelhost_mainloop::{deadline_after, wait_fd, Context, Interest};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::exit::{die_now_with, ExitCode};
use crate::reset::ResetSignal;
use crate::traits::{check_tx_frame, InterfaceType, ReceiveFrameCallback, SpinelInterface};
use crate::url::RadioUrl;

pub const SCHEME_VENDOR: &str = "spinel+vendor";

/// Interface descriptor the chip services register under.
pub const THREAD_CHIP_DESCRIPTOR: &str = "android.hardware.threadnetwork.IThreadChip";

const VENDOR_BUS_SPEED: u32 = 1_000_000;

/// Errors reported by a chip service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChipError {
    #[error("chip has no buffers")]
    NoBufs,

    #[error("chip busy")]
    Busy,

    #[error("chip failure: {0}")]
    Failed(String),
}

impl From<ChipError> for TransportError {
    fn from(err: ChipError) -> Self {
        match err {
            ChipError::NoBufs => TransportError::NoBufs,
            ChipError::Busy => TransportError::Busy,
            ChipError::Failed(reason) => TransportError::Failed(reason),
        }
    }
}

/// One Thread radio chip exposed by a vendor service.
pub trait ThreadChip {
    fn open(&mut self) -> std::result::Result<(), ChipError>;

    fn close(&mut self) -> std::result::Result<(), ChipError>;

    /// Hardware reset of the radio.
    fn reset(&mut self) -> std::result::Result<(), ChipError>;

    fn send_spinel_frame(&mut self, frame: &[u8]) -> std::result::Result<(), ChipError>;

    /// Descriptor that becomes readable when the service has pending callbacks.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Run pending service callbacks, handing every received frame to `on_frame`.
    fn handle_polled(&mut self, on_frame: &mut dyn FnMut(&[u8]));
}

/// Finds chip services by name.
pub trait ChipConnector {
    /// Connect to `service_name`. The connector raises `death` if the service dies.
    fn connect(
        &mut self,
        service_name: &str,
        death: ResetSignal,
    ) -> std::result::Result<Box<dyn ThreadChip>, ChipError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VendorConfig {
    pub id: u32,
}

impl VendorConfig {
    pub fn from_url(url: &RadioUrl) -> Result<Self> {
        Ok(Self {
            id: url.parse_value("id")?.unwrap_or(0),
        })
    }

    pub fn service_name(&self) -> String {
        format!("{THREAD_CHIP_DESCRIPTOR}/chip{}", self.id)
    }
}

pub struct VendorInterface {
    connector: Box<dyn ChipConnector>,
    chip: Option<Box<dyn ThreadChip>>,
    config: VendorConfig,
    death: ResetSignal,
    rx: Box<RxFrameBuffer>,
    callback: ReceiveFrameCallback,
}

impl VendorInterface {
    pub fn new(connector: Box<dyn ChipConnector>, callback: ReceiveFrameCallback) -> Self {
        Self {
            connector,
            chip: None,
            config: VendorConfig::default(),
            death: ResetSignal::new(),
            rx: Box::default(),
            callback,
        }
    }

    pub fn config(&self) -> &VendorConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.chip.is_some()
    }

    fn chip(&mut self) -> Result<&mut Box<dyn ThreadChip>> {
        self.chip
            .as_mut()
            .ok_or_else(|| TransportError::Failed("thread chip not open".into()))
    }

    /// The service is gone; there is nothing left to talk to.
    fn check_alive(&self) {
        if self.death.is_raised() {
            die_now_with(ExitCode::Failure, "thread chip service died");
        }
    }

    fn handle_polled(&mut self) {
        let Self {
            chip, rx, callback, ..
        } = self;
        let Some(chip) = chip.as_mut() else {
            return;
        };

        chip.handle_polled(&mut |frame: &[u8]| {
            if rx.write_all(frame).is_err() {
                warn!(len = frame.len(), "receive buffer full, dropping chip frame");
                rx.discard_frame();
                return;
            }
            trace!(len = frame.len(), frame = ?frame, "vendor rx frame");
            callback(rx.as_mut());
        });
    }
}

impl SpinelInterface for VendorInterface {
    fn init(&mut self, url: &RadioUrl) -> Result<()> {
        if self.chip.is_some() {
            return Err(TransportError::Already);
        }
        let config = VendorConfig::from_url(url)?;
        let service = config.service_name();

        self.death.clear();
        let mut chip = self
            .connector
            .connect(&service, self.death.clone())
            .map_err(|err| TransportError::Failed(format!("connect to {service}: {err}")))?;
        chip.open()?;

        info!(service = %service, "thread chip open");
        self.chip = Some(chip);
        self.config = config;
        Ok(())
    }

    fn deinit(&mut self) {
        let Some(mut chip) = self.chip.take() else {
            return;
        };
        if let Err(err) = chip.close() {
            warn!(error = %err, "closing thread chip failed");
        }
        debug!("thread chip closed");
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        check_tx_frame(frame)?;
        self.check_alive();
        self.chip()?.send_spinel_frame(frame)?;
        trace!(len = frame.len(), frame = ?frame, "vendor tx frame");
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<()> {
        self.check_alive();
        let fd = self
            .chip()?
            .poll_fd()
            .ok_or_else(|| TransportError::Failed("thread chip has no poll fd".into()))?;
        let deadline = deadline_after(timeout);

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match wait_fd(fd, Interest::Read, left) {
                Ok(true) => break,
                Ok(false) => return Err(TransportError::ResponseTimeout),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => die_now_with(ExitCode::ErrorErrno, &format!("vendor wait: {err}")),
            }
        }

        self.handle_polled();
        self.check_alive();
        Ok(())
    }

    fn update_fd_set(&mut self, ctx: &mut Context) {
        let Some(fd) = self.chip.as_ref().and_then(|chip| chip.poll_fd()) else {
            return;
        };
        if let Err(err) = ctx.add_read_fd(fd) {
            warn!(fd, error = %err, "cannot poll thread chip");
        }
    }

    fn process(&mut self, ctx: &Context) {
        self.check_alive();
        let readable = self
            .chip
            .as_ref()
            .and_then(|chip| chip.poll_fd())
            .is_some_and(|fd| ctx.is_readable(fd));
        if readable {
            self.handle_polled();
        }
    }

    fn bus_speed(&self) -> u32 {
        VENDOR_BUS_SPEED
    }

    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Vendor
    }

    fn reset_connection(&mut self) -> Result<()> {
        self.chip()?.reset()?;
        info!("thread chip hardware reset");
        Ok(())
    }
}

impl Drop for VendorInterface {
    fn drop(&mut self) {
        self.deinit();
    }
}


#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::loopback::LoopbackConnector;
    use super::*;

    type Received = Rc<RefCell<Vec<Vec<u8>>>>;

    fn interface() -> (VendorInterface, LoopbackConnector, Received) {
        let connector = LoopbackConnector::default();
        let received: Received = Rc::default();
        let sink = Rc::clone(&received);
        let callback: ReceiveFrameCallback = Box::new(move |rx: &mut RxFrameBuffer| {
            sink.borrow_mut().push(rx.frame().to_vec());
            rx.discard_frame();
        });
        let vendor = VendorInterface::new(Box::new(connector.clone()), callback);
        (vendor, connector, received)
    }

    fn url(id: u32) -> RadioUrl {
        RadioUrl::parse(&format!("spinel+vendor://?id={id}")).unwrap()
    }

    #[test]
    fn service_name_comes_from_id() {
        let (mut vendor, connector, _) = interface();
        vendor.init(&url(3)).unwrap();
        assert_eq!(
            connector.log.borrow().service.as_deref(),
            Some("android.hardware.threadnetwork.IThreadChip/chip3")
        );
        assert_eq!(VendorConfig::default().service_name(), format!("{THREAD_CHIP_DESCRIPTOR}/chip0"));
    }

    #[test]
    fn second_init_is_already() {
        let (mut vendor, connector, _) = interface();
        vendor.init(&url(0)).unwrap();
        assert!(matches!(vendor.init(&url(0)), Err(TransportError::Already)));
        assert_eq!(connector.log.borrow().opened, 1);
    }

    #[test]
    fn frames_round_trip_through_the_chip() {
        let (mut vendor, connector, received) = interface();
        vendor.init(&url(0)).unwrap();

        vendor.send_frame(&[0x81, 0x02, 0x00]).unwrap();
        vendor.wait_for_frame(Duration::from_secs(1)).unwrap();

        assert_eq!(connector.log.borrow().sent, vec![vec![0x81, 0x02, 0x00]]);
        assert_eq!(*received.borrow(), vec![vec![0x81, 0x02, 0x00]]);
    }

    #[test]
    fn wait_accepts_unbounded_timeout() {
        let (mut vendor, _, received) = interface();
        vendor.init(&url(0)).unwrap();
        vendor.send_frame(&[0x81, 0x02]).unwrap();
        vendor.wait_for_frame(Duration::MAX).unwrap();
        assert_eq!(*received.borrow(), vec![vec![0x81, 0x02]]);
    }

    #[test]
    fn oversized_chip_frame_is_dropped() {
        let (mut vendor, connector, received) = interface();
        vendor.init(&url(0)).unwrap();
        connector.log.borrow_mut().unsolicited =
            vec![vec![0xAA; spinelhost_frame::MAX_FRAME_SIZE + 1], vec![0x80, 0x06, 0x00]];

        vendor.handle_polled();

        assert_eq!(*received.borrow(), vec![vec![0x80, 0x06, 0x00]]);
        assert_eq!(vendor.rx.length(), 0);
    }

    #[test]
    fn wait_times_out_without_traffic() {
        let (mut vendor, _, _) = interface();
        vendor.init(&url(0)).unwrap();
        assert!(matches!(
            vendor.wait_for_frame(Duration::from_millis(10)),
            Err(TransportError::ResponseTimeout)
        ));
    }

    #[test]
    fn chip_errors_map_to_transport_errors() {
        let (mut vendor, connector, _) = interface();
        vendor.init(&url(0)).unwrap();
        connector.log.borrow_mut().busy = true;
        assert!(matches!(vendor.send_frame(&[0x81]), Err(TransportError::Busy)));
        assert!(matches!(vendor.send_frame(&[]), Err(TransportError::InvalidArgs(_))));
    }

    #[test]
    fn process_delivers_when_poll_fd_is_ready() {
        let (mut vendor, _, received) = interface();
        vendor.init(&url(0)).unwrap();
        vendor.send_frame(&[0x80, 0x06]).unwrap();

        let mut ctx = Context::new(Duration::from_secs(1));
        vendor.update_fd_set(&mut ctx);
        spinelhost_mainloop::select::select(&mut ctx).unwrap();
        vendor.process(&ctx);

        assert_eq!(*received.borrow(), vec![vec![0x80, 0x06]]);
    }

    #[test]
    fn reset_connection_resets_the_chip() {
        let (mut vendor, connector, _) = interface();
        assert!(vendor.reset_connection().is_err());
        vendor.init(&url(0)).unwrap();
        vendor.reset_connection().unwrap();
        assert_eq!(connector.log.borrow().resets, 1);
        assert_eq!(vendor.bus_speed(), 1_000_000);
    }

    #[test]
    fn deinit_closes_once() {
        let (mut vendor, connector, _) = interface();
        vendor.init(&url(0)).unwrap();
        vendor.deinit();
        vendor.deinit();
        drop(vendor);
        assert_eq!(connector.log.borrow().closed, 1);
    }
}

//! Spinel over a CPC (co-processor communication) multiplexer endpoint.
//!
//! The CPC daemon owns the physical link and the RCP reset. This transport only
//! talks to one daemon endpoint, and it hides daemon restarts from the upper layer:
//! a lost daemon is reconnected with a bounded retry loop, and spinel RESET commands
//! are answered locally with a synthesized reset notification.

use std::io;
use std::os::fd::RawFd;
use std::thread;
use std::time::Duration;

use spinelhost_frame::{FrameWrite, RxFrameBuffer, MAX_FRAME_SIZE};
use spinelhost_mainloop::Context;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::exit::{die_now_with, ExitCode};
use crate::reset::{reconnect, ResetSignal, RetryPolicy};
use crate::spinel;
use crate::traits::{check_tx_frame, InterfaceType, ReceiveFrameCallback, SpinelInterface};
use crate::url::RadioUrl;

pub const SCHEME_CPC: &str = "spinel+cpc";

/// CPC endpoint carrying 802.15.4 spinel traffic.
pub const ENDPOINT_15_4: u8 = 12;

/// Access to the CPC client library.
///
/// Reads are message oriented: one successful read returns exactly one frame.
pub trait CpcDriver {
    /// Connect to daemon `instance`. The driver raises `reset` whenever the daemon
    /// connection is lost, possibly from another thread.
    fn init(&mut self, instance: &str, reset: ResetSignal) -> io::Result<()>;

    /// Re-establish the daemon connection after a reset.
    fn restart(&mut self) -> io::Result<()>;

    /// Open endpoint `id` and return a descriptor that polls readable on input.
    fn open_endpoint(&mut self, id: u8, tx_window: u8) -> io::Result<RawFd>;

    fn close_endpoint(&mut self) -> io::Result<()>;

    /// Read one frame. `None` means do not block.
    ///
    /// `ConnectionReset` reports a lost daemon. `WouldBlock`, `TimedOut` and
    /// `Interrupted` mean nothing arrived.
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize>;

    /// Write one whole frame.
    fn write(&mut self, frame: &[u8]) -> io::Result<()>;
}

impl<D: CpcDriver + ?Sized> CpcDriver for Box<D> {
    fn init(&mut self, instance: &str, reset: ResetSignal) -> io::Result<()> {
        (**self).init(instance, reset)
    }

    fn restart(&mut self) -> io::Result<()> {
        (**self).restart()
    }

    fn open_endpoint(&mut self, id: u8, tx_window: u8) -> io::Result<RawFd> {
        (**self).open_endpoint(id, tx_window)
    }

    fn close_endpoint(&mut self) -> io::Result<()> {
        (**self).close_endpoint()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        (**self).write(frame)
    }
}

/// Settings taken from a `spinel+cpc://<instance>?iid=<n>` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpcConfig {
    pub instance_name: String,
    pub iid: Option<u8>,
    pub endpoint_id: u8,
    pub tx_window_size: u8,
    pub bus_speed: u32,
    pub retry: RetryPolicy,
}

impl CpcConfig {
    pub const DEFAULT_INSTANCE: &'static str = "cpcd_0";
    pub const DEFAULT_BUS_SPEED: u32 = 115_200;

    pub fn from_url(url: &RadioUrl) -> Result<Self> {
        let mut config = Self::default();
        if !url.path().is_empty() {
            config.instance_name = url.path().to_string();
        }

        if let Some(iid) = url.parse_value::<u8>("iid")? {
            if !(1..=3).contains(&iid) {
                return Err(TransportError::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("iid {iid} out of range 1..=3"),
                });
            }
            config.iid = Some(iid);
        }
        if let Some(speed) = url.parse_value::<u32>("cpc-bus-speed")? {
            config.bus_speed = speed;
        }
        Ok(config)
    }
}

impl Default for CpcConfig {
    fn default() -> Self {
        Self {
            instance_name: Self::DEFAULT_INSTANCE.to_string(),
            iid: None,
            endpoint_id: ENDPOINT_15_4,
            tx_window_size: 1,
            bus_speed: Self::DEFAULT_BUS_SPEED,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct CpcInterface<D: CpcDriver> {
    driver: D,
    config: CpcConfig,
    sock_fd: Option<RawFd>,
    reset: ResetSignal,
    rx: Box<RxFrameBuffer>,
    callback: ReceiveFrameCallback,
}

impl<D: CpcDriver> CpcInterface<D> {
    pub fn new(driver: D, callback: ReceiveFrameCallback) -> Self {
        Self {
            driver,
            config: CpcConfig::default(),
            sock_fd: None,
            reset: ResetSignal::new(),
            rx: Box::default(),
            callback,
        }
    }

    /// The flag the driver raises when the daemon goes away.
    pub fn reset_signal(&self) -> &ResetSignal {
        &self.reset
    }

    pub fn config(&self) -> &CpcConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.sock_fd.is_some()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Reconnect if the daemon went away since the last call. Exits the process when
    /// the retry budget runs out. A closed endpoint stays closed.
    fn check_and_reinit(&mut self) {
        if !self.reset.is_raised() || self.sock_fd.is_none() {
            return;
        }
        warn!(instance = %self.config.instance_name, "cpc daemon reset, reconnecting");

        let driver = &mut self.driver;
        if let Err(err) = reconnect(&self.config.retry, thread::sleep, |_| driver.restart()) {
            die_now_with(ExitCode::ErrorErrno, &err.to_string());
        }

        match self
            .driver
            .open_endpoint(self.config.endpoint_id, self.config.tx_window_size)
        {
            Ok(fd) => self.sock_fd = Some(fd),
            Err(err) => die_now_with(ExitCode::ErrorErrno, &format!("reopen cpc endpoint: {err}")),
        }
        self.reset.clear();
        info!(
            instance = %self.config.instance_name,
            endpoint = self.config.endpoint_id,
            "cpc connection restored"
        );
    }

    fn ensure_open(&self) -> Result<()> {
        if self.sock_fd.is_none() {
            return Err(TransportError::Failed("cpc endpoint not open".into()));
        }
        Ok(())
    }

    /// Deliver the frame the RCP would have sent after a software reset.
    fn send_reset_response(&mut self) {
        if self.rx.write_all(&spinel::RESET_RESPONSE).is_err() {
            warn!("no room for synthesized reset response");
            self.rx.discard_frame();
            return;
        }
        debug!("answered spinel reset locally");
        (self.callback)(self.rx.as_mut());
    }

    /// Read at most one frame into the receive buffer.
    fn read(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        match self.driver.read(&mut buf, timeout) {
            Ok(0) => Ok(()),
            Ok(len) => {
                let frame = &buf[..len];
                trace!(len, frame = ?frame, "cpc rx");
                if self.rx.write_all(frame).is_err() {
                    warn!(len, "receive buffer full, dropping cpc frame");
                    self.rx.discard_frame();
                    return Ok(());
                }
                (self.callback)(self.rx.as_mut());
                Ok(())
            }
            Err(err) => match err.kind() {
                io::ErrorKind::ConnectionReset => {
                    self.reset.raise();
                    self.check_and_reinit();
                    Ok(())
                }
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    Err(TransportError::ResponseTimeout)
                }
                io::ErrorKind::Interrupted => Ok(()),
                _ => die_now_with(ExitCode::ErrorErrno, &format!("cpc read: {err}")),
            },
        }
    }
}

impl<D: CpcDriver> SpinelInterface for CpcInterface<D> {
    fn init(&mut self, url: &RadioUrl) -> Result<()> {
        if self.sock_fd.is_some() {
            return Err(TransportError::Already);
        }
        let config = CpcConfig::from_url(url)?;

        self.driver
            .init(&config.instance_name, self.reset.clone())
            .map_err(|err| {
                TransportError::Failed(format!("connect to cpc daemon {}: {err}", config.instance_name))
            })?;
        let fd = self
            .driver
            .open_endpoint(config.endpoint_id, config.tx_window_size)
            .map_err(|err| {
                TransportError::Failed(format!("open cpc endpoint {}: {err}", config.endpoint_id))
            })?;

        info!(
            instance = %config.instance_name,
            endpoint = config.endpoint_id,
            fd,
            "opened cpc endpoint"
        );
        self.sock_fd = Some(fd);
        self.config = config;
        Ok(())
    }

    fn deinit(&mut self) {
        if self.sock_fd.take().is_none() {
            return;
        }
        self.reset.clear();
        if let Err(err) = self.driver.close_endpoint() {
            warn!(error = %err, "closing cpc endpoint failed");
        }
        debug!("cpc endpoint closed");
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        check_tx_frame(frame)?;
        self.ensure_open()?;
        self.check_and_reinit();

        // The daemon resets the RCP itself when it restarts.
        if spinel::is_reset_command(frame) {
            self.send_reset_response();
            return Ok(());
        }

        let mut reconnected = false;
        loop {
            match self.driver.write(frame) {
                Ok(()) => {
                    trace!(len = frame.len(), frame = ?frame, "cpc tx");
                    return Ok(());
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => return Err(TransportError::Busy),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                        self.reset.raise();
                        if reconnected {
                            warn!(len = frame.len(), error = %err, "cpc write failed after reconnect, dropping frame");
                            return Err(TransportError::Failed(format!("cpc write: {err}")));
                        }
                        self.check_and_reinit();
                        reconnected = true;
                    }
                    _ => die_now_with(ExitCode::ErrorErrno, &format!("cpc write: {err}")),
                },
            }
        }
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        self.check_and_reinit();
        self.read(Some(timeout))
    }

    fn update_fd_set(&mut self, ctx: &mut Context) {
        if self.reset.is_raised() && self.sock_fd.is_some() {
            ctx.set_timeout_if_earlier(Duration::ZERO);
        }
        if let Some(fd) = self.sock_fd {
            if let Err(err) = ctx.add_read_fd(fd) {
                warn!(fd, error = %err, "cannot poll cpc endpoint");
            }
        }
    }

    fn process(&mut self, ctx: &Context) {
        self.check_and_reinit();
        let Some(fd) = self.sock_fd else {
            return;
        };
        if ctx.is_readable(fd) {
            match self.read(None) {
                Ok(()) | Err(TransportError::ResponseTimeout) => {}
                Err(err) => warn!(error = %err, "cpc read failed"),
            }
        }
    }

    fn bus_speed(&self) -> u32 {
        self.config.bus_speed
    }

    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Cpc
    }
}

impl<D: CpcDriver> Drop for CpcInterface<D> {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    const FAKE_FD: RawFd = 42;

    #[derive(Default)]
    struct MockState {
        instance: Option<String>,
        signal: Option<ResetSignal>,
        writes: Vec<Vec<u8>>,
        write_errors: VecDeque<io::ErrorKind>,
        writes_always_break: bool,
        inbox: VecDeque<io::Result<Vec<u8>>>,
        failing_restarts: u32,
        restart_calls: u32,
        opened: u32,
        closed: u32,
    }

    #[derive(Clone, Default)]
    struct MockDriver(Rc<RefCell<MockState>>);

    impl CpcDriver for MockDriver {
        fn init(&mut self, instance: &str, reset: ResetSignal) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            state.instance = Some(instance.to_string());
            state.signal = Some(reset);
            Ok(())
        }

        fn restart(&mut self) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            state.restart_calls += 1;
            if state.failing_restarts > 0 {
                state.failing_restarts -= 1;
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            Ok(())
        }

        fn open_endpoint(&mut self, id: u8, tx_window: u8) -> io::Result<RawFd> {
            assert_eq!(id, ENDPOINT_15_4);
            assert_eq!(tx_window, 1);
            self.0.borrow_mut().opened += 1;
            Ok(FAKE_FD)
        }

        fn close_endpoint(&mut self) -> io::Result<()> {
            self.0.borrow_mut().closed += 1;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Option<Duration>) -> io::Result<usize> {
            match self.0.borrow_mut().inbox.pop_front() {
                Some(Ok(frame)) => {
                    buf[..frame.len()].copy_from_slice(&frame);
                    Ok(frame.len())
                }
                Some(Err(err)) => Err(err),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn write(&mut self, frame: &[u8]) -> io::Result<()> {
            let mut state = self.0.borrow_mut();
            if state.writes_always_break {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            if let Some(kind) = state.write_errors.pop_front() {
                return Err(io::Error::from(kind));
            }
            state.writes.push(frame.to_vec());
            Ok(())
        }
    }

    type Received = Rc<RefCell<Vec<Vec<u8>>>>;

    fn interface() -> (CpcInterface<MockDriver>, MockDriver, Received) {
        let driver = MockDriver::default();
        let received: Received = Rc::default();
        let sink = Rc::clone(&received);
        let callback: ReceiveFrameCallback = Box::new(move |rx: &mut RxFrameBuffer| {
            sink.borrow_mut().push(rx.frame().to_vec());
            rx.discard_frame();
        });
        (CpcInterface::new(driver.clone(), callback), driver, received)
    }

    fn url() -> RadioUrl {
        RadioUrl::parse("spinel+cpc://cpcd_1?iid=1").unwrap()
    }

    #[test]
    fn second_init_is_already() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        assert!(matches!(cpc.init(&url()), Err(TransportError::Already)));
        assert_eq!(driver.0.borrow().opened, 1);
        assert_eq!(driver.0.borrow().instance.as_deref(), Some("cpcd_1"));
        assert_eq!(cpc.config().iid, Some(1));
    }

    #[test]
    fn deinit_is_idempotent() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        cpc.deinit();
        cpc.deinit();
        assert!(!cpc.is_open());
        assert_eq!(driver.0.borrow().closed, 1);
        drop(cpc);
        assert_eq!(driver.0.borrow().closed, 1);
    }

    #[test]
    fn reset_command_is_answered_locally() {
        let (mut cpc, driver, received) = interface();
        cpc.init(&url()).unwrap();

        cpc.send_frame(&[0x80, spinel::CMD_RESET, 0x02]).unwrap();

        assert!(driver.0.borrow().writes.is_empty());
        assert_eq!(*received.borrow(), vec![vec![0x80, 0x06, 0x00, 0x72]]);
    }

    #[test]
    fn other_frames_are_written_through() {
        let (mut cpc, driver, received) = interface();
        cpc.init(&url()).unwrap();

        cpc.send_frame(&[0x81, spinel::CMD_RESET]).unwrap();
        cpc.send_frame(&[0x80]).unwrap();

        assert_eq!(driver.0.borrow().writes, vec![vec![0x81, 0x01], vec![0x80]]);
        assert!(received.borrow().is_empty());
    }

    #[test]
    fn frame_size_is_checked() {
        let (mut cpc, _, _) = interface();
        cpc.init(&url()).unwrap();
        assert!(matches!(cpc.send_frame(&[]), Err(TransportError::InvalidArgs(_))));
        assert!(matches!(
            cpc.send_frame(&[0u8; MAX_FRAME_SIZE + 1]),
            Err(TransportError::NoBufs)
        ));
    }

    #[test]
    fn send_before_init_fails() {
        let (mut cpc, _, _) = interface();
        assert!(matches!(cpc.send_frame(&[0x80, 0x02]), Err(TransportError::Failed(_))));
    }

    #[test]
    fn raised_signal_reconnects_before_next_send() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        driver.0.borrow_mut().failing_restarts = 2;

        let signal = driver.0.borrow().signal.clone().unwrap();
        signal.raise();
        assert!(cpc.reset_signal().is_raised());

        cpc.send_frame(&[0x81, 0x02]).unwrap();

        let state = driver.0.borrow();
        assert_eq!(state.restart_calls, 3);
        assert_eq!(state.opened, 2);
        assert_eq!(state.writes.len(), 1);
        assert!(!cpc.reset_signal().is_raised());
    }

    #[test]
    fn broken_pipe_on_write_reconnects_and_retries() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        driver
            .0
            .borrow_mut()
            .write_errors
            .push_back(io::ErrorKind::BrokenPipe);

        cpc.send_frame(&[0x82, 0x02]).unwrap();

        let state = driver.0.borrow();
        assert_eq!(state.restart_calls, 1);
        assert_eq!(state.writes, vec![vec![0x82, 0x02]]);
    }

    #[test]
    fn write_that_keeps_breaking_gives_up_after_one_reconnect() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        driver.0.borrow_mut().writes_always_break = true;

        assert!(matches!(cpc.send_frame(&[0x81, 0x02]), Err(TransportError::Failed(_))));

        let state = driver.0.borrow();
        assert_eq!(state.restart_calls, 1);
        assert_eq!(state.opened, 2);
        assert!(state.writes.is_empty());
        assert!(cpc.reset_signal().is_raised());
    }

    #[test]
    fn reset_after_deinit_does_not_reopen() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        cpc.deinit();

        cpc.reset_signal().raise();
        let mut ctx = Context::new(Duration::from_secs(1));
        cpc.update_fd_set(&mut ctx);
        assert_eq!(ctx.timeout(), Duration::from_secs(1));
        cpc.process(&Context::default());

        assert!(!cpc.is_open());
        let state = driver.0.borrow();
        assert_eq!(state.restart_calls, 0);
        assert_eq!(state.opened, 1);
        assert_eq!(state.closed, 1);
    }

    #[test]
    fn deinit_clears_a_pending_reset() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        cpc.reset_signal().raise();
        cpc.deinit();
        assert!(!cpc.reset_signal().is_raised());

        cpc.init(&url()).unwrap();
        cpc.send_frame(&[0x81, 0x02]).unwrap();
        assert_eq!(driver.0.borrow().restart_calls, 0);
        assert_eq!(driver.0.borrow().opened, 2);
    }

    #[test]
    fn would_block_on_write_is_busy() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        driver
            .0
            .borrow_mut()
            .write_errors
            .push_back(io::ErrorKind::WouldBlock);
        assert!(matches!(cpc.send_frame(&[0x82, 0x02]), Err(TransportError::Busy)));
    }

    #[test]
    fn wait_delivers_one_frame_per_read() {
        let (mut cpc, driver, received) = interface();
        cpc.init(&url()).unwrap();
        {
            let mut state = driver.0.borrow_mut();
            state.inbox.push_back(Ok(vec![0x80, 0x06, 0x00, 0x00]));
            state.inbox.push_back(Ok(vec![0x81, 0x06]));
        }

        cpc.wait_for_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(received.borrow().len(), 1);
        cpc.wait_for_frame(Duration::from_millis(10)).unwrap();
        assert_eq!(
            *received.borrow(),
            vec![vec![0x80, 0x06, 0x00, 0x00], vec![0x81, 0x06]]
        );

        assert!(matches!(
            cpc.wait_for_frame(Duration::from_millis(10)),
            Err(TransportError::ResponseTimeout)
        ));
    }

    #[test]
    fn connection_reset_on_read_reconnects() {
        let (mut cpc, driver, _) = interface();
        cpc.init(&url()).unwrap();
        driver
            .0
            .borrow_mut()
            .inbox
            .push_back(Err(io::Error::from(io::ErrorKind::ConnectionReset)));

        cpc.wait_for_frame(Duration::from_millis(10)).unwrap();

        assert_eq!(driver.0.borrow().restart_calls, 1);
        assert!(!cpc.reset_signal().is_raised());
    }

    #[test]
    fn update_registers_endpoint_fd() {
        let (mut cpc, _, _) = interface();
        cpc.init(&url()).unwrap();

        let mut ctx = Context::new(Duration::from_secs(1));
        cpc.update_fd_set(&mut ctx);
        assert!(ctx.is_readable(FAKE_FD));
        assert_eq!(ctx.timeout(), Duration::from_secs(1));

        cpc.reset_signal().raise();
        let mut ctx = Context::new(Duration::from_secs(1));
        cpc.update_fd_set(&mut ctx);
        assert_eq!(ctx.timeout(), Duration::ZERO);
    }

    #[test]
    fn config_from_url() {
        let config = CpcConfig::from_url(&RadioUrl::parse("spinel+cpc://?cpc-bus-speed=921600").unwrap())
            .unwrap();
        assert_eq!(config.instance_name, "cpcd_0");
        assert_eq!(config.bus_speed, 921_600);
        assert_eq!(config.endpoint_id, ENDPOINT_15_4);

        let bad = RadioUrl::parse("spinel+cpc://cpcd_0?iid=4").unwrap();
        assert!(matches!(
            CpcConfig::from_url(&bad),
            Err(TransportError::InvalidUrl { .. })
        ));
    }
}

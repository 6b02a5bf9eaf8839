//! Spinel over a full-duplex SPI bus with the RCP as slave.
//!
//! `spinel+spi:///dev/spidev0.0?gpio-int-device=/dev/gpiochip0&gpio-int-line=21`
//!
//! Every exchange clocks a 5-byte header each way, followed by payload:
//!
//! ```text
//! ┌──────────┬────────────────┬──────────────┬─────────────┐
//! │ Flags    │ Accept len (2B)│ Data len (2B)│ Payload     │
//! │ 1B       │ LE             │ LE           │             │
//! └──────────┴────────────────┴──────────────┴─────────────┘
//! ```
//!
//! The host is the only side that can start a transfer. It does so when it has a
//! frame queued or the RCP pulls its interrupt line; without an interrupt line the
//! bus is polled. The RCP may answer a few bytes late, in which case the answer is
//! preceded by up to `spi-align-allowance` bytes of `0xFF` fill.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use spinelhost_frame::{RxFrameBuffer, MAX_FRAME_SIZE};
use spinelhost_mainloop::select::select;
use spinelhost_mainloop::{deadline_after, Context};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::exit::{die_now_with, ExitCode};
use crate::traits::{
    check_tx_frame, InterfaceType, RcpInterfaceMetrics, ReceiveFrameCallback, SpinelInterface,
};
use crate::url::RadioUrl;

pub const SCHEME_SPI: &str = "spinel+spi";

pub const SPI_HEADER_SIZE: usize = 5;

/// Largest number of `0xFF` fill bytes tolerated ahead of the RCP's header.
pub const MAX_ALIGN_ALLOWANCE: u8 = 16;

pub const MAX_SPI_MODE: u8 = 3;

/// Poll interval without an interrupt line.
const POLL_PERIOD: Duration = Duration::from_micros(1_000_000 / 30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);

const IMMEDIATE_RETRY_COUNT: u32 = 5;
const FAST_RETRY_COUNT: u32 = 15;
const IMMEDIATE_RETRY_TIMEOUT: Duration = Duration::from_millis(1);
const FAST_RETRY_TIMEOUT: Duration = Duration::from_millis(10);
const SLOW_RETRY_TIMEOUT: Duration = Duration::from_millis(33);
const TX_REFUSE_WARN_COUNT: u32 = 30;
const TX_REFUSE_EXIT_COUNT: u32 = 100;

/// The 5-byte header exchanged in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiHeader {
    pub flags: u8,
    /// How many payload bytes the sender is able to receive in this transfer.
    pub accept_len: u16,
    /// How many payload bytes the sender has to send.
    pub data_len: u16,
}

impl SpiHeader {
    pub const FLAG_RESET: u8 = 0x80;
    pub const FLAG_PATTERN: u8 = 0x02;
    pub const FLAG_PATTERN_MASK: u8 = 0x03;

    /// A host header. `reset` tells the RCP the host is starting from scratch.
    pub fn new(reset: bool, accept_len: u16, data_len: u16) -> Self {
        let flags = if reset {
            Self::FLAG_PATTERN | Self::FLAG_RESET
        } else {
            Self::FLAG_PATTERN
        };
        Self {
            flags,
            accept_len,
            data_len,
        }
    }

    pub fn encode(&self) -> [u8; SPI_HEADER_SIZE] {
        let accept = self.accept_len.to_le_bytes();
        let data = self.data_len.to_le_bytes();
        [self.flags, accept[0], accept[1], data[0], data[1]]
    }

    pub fn decode(bytes: [u8; SPI_HEADER_SIZE]) -> Self {
        Self {
            flags: bytes[0],
            accept_len: u16::from_le_bytes([bytes[1], bytes[2]]),
            data_len: u16::from_le_bytes([bytes[3], bytes[4]]),
        }
    }

    /// Whether the fixed flag pattern is present.
    pub fn is_valid(&self) -> bool {
        self.flags & Self::FLAG_PATTERN_MASK == Self::FLAG_PATTERN
    }

    pub fn is_reset(&self) -> bool {
        self.flags & Self::FLAG_RESET != 0
    }
}

/// Count the leading `0xFF` fill bytes, looking at no more than `allowance` bytes.
pub fn align_skip(rx: &[u8], allowance: usize) -> usize {
    rx.iter()
        .take(allowance)
        .take_while(|&&byte| byte == 0xFF)
        .count()
}

/// A GPIO line on a character device, e.g. line 21 of `/dev/gpiochip0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioPin {
    pub chip: PathBuf,
    pub line: u8,
}

/// Settings taken from a `spinel+spi://<spidev>?...` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiConfig {
    pub device: PathBuf,
    /// Interrupt line the RCP pulls low when it has a frame. `None` polls.
    pub int_gpio: Option<GpioPin>,
    /// Line that resets the RCP. `None` skips hardware resets.
    pub reset_gpio: Option<GpioPin>,
    pub mode: u8,
    pub speed_hz: u32,
    /// Wait after a hardware reset before talking to the RCP.
    pub reset_delay: Duration,
    /// Delay between chip select and the first clock edge.
    pub cs_delay_us: u16,
    pub align_allowance: u8,
    /// Minimum payload room offered in every transfer.
    pub small_packet_size: u8,
}

impl SpiConfig {
    pub const DEFAULT_SPEED_HZ: u32 = 1_000_000;
    pub const DEFAULT_CS_DELAY_US: u16 = 20;
    pub const DEFAULT_SMALL_PACKET_SIZE: u8 = 32;

    pub fn from_url(url: &RadioUrl) -> Result<Self> {
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        if url.path().is_empty() {
            return Err(invalid("missing spidev path".into()));
        }
        let mut config = Self {
            device: PathBuf::from(url.path()),
            ..Self::default()
        };

        config.int_gpio = gpio_pin(url, "gpio-int-device", "gpio-int-line")?;
        config.reset_gpio = gpio_pin(url, "gpio-reset-device", "gpio-reset-line")?;

        if let Some(mode) = url.parse_value::<u8>("spi-mode")? {
            if mode > MAX_SPI_MODE {
                return Err(invalid(format!("spi mode {mode} above {MAX_SPI_MODE}")));
            }
            config.mode = mode;
        }
        if let Some(speed) = url.parse_value("spi-speed")? {
            config.speed_hz = speed;
        }
        if let Some(ms) = url.parse_value::<u64>("spi-reset-delay")? {
            config.reset_delay = Duration::from_millis(ms);
        }
        if let Some(delay) = url.parse_value("spi-cs-delay")? {
            config.cs_delay_us = delay;
        }
        if let Some(allowance) = url.parse_value::<u8>("spi-align-allowance")? {
            if allowance > MAX_ALIGN_ALLOWANCE {
                return Err(invalid(format!(
                    "align allowance {allowance} above {MAX_ALIGN_ALLOWANCE}"
                )));
            }
            config.align_allowance = allowance;
        }
        if let Some(size) = url.parse_value("spi-small-packet")? {
            config.small_packet_size = size;
        }
        Ok(config)
    }
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::new(),
            int_gpio: None,
            reset_gpio: None,
            mode: 0,
            speed_hz: Self::DEFAULT_SPEED_HZ,
            reset_delay: Duration::ZERO,
            cs_delay_us: Self::DEFAULT_CS_DELAY_US,
            align_allowance: MAX_ALIGN_ALLOWANCE,
            small_packet_size: Self::DEFAULT_SMALL_PACKET_SIZE,
        }
    }
}

fn gpio_pin(url: &RadioUrl, device_key: &str, line_key: &str) -> Result<Option<GpioPin>> {
    match (url.get_value(device_key), url.parse_value::<u8>(line_key)?) {
        (None, None) => Ok(None),
        (Some(chip), Some(line)) => Ok(Some(GpioPin {
            chip: PathBuf::from(chip),
            line,
        })),
        _ => Err(TransportError::InvalidUrl {
            url: url.to_string(),
            reason: format!("{device_key} and {line_key} go together"),
        }),
    }
}

/// The bus and side-band lines to one RCP.
pub trait SpiLink {
    /// Clock `tx` out while clocking `rx.len() == tx.len()` bytes in.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()>;

    /// Descriptor that turns readable when the interrupt line falls.
    fn interrupt_fd(&self) -> Option<RawFd> {
        None
    }

    /// Whether the RCP is asking to be serviced. Always true without an interrupt
    /// line.
    fn interrupt_asserted(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    /// Consume a pending interrupt edge.
    fn clear_interrupt(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Pulse the RCP's reset line.
    fn trigger_reset(&mut self) -> io::Result<()>;
}

/// SPI-specific counters on top of [`RcpInterfaceMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpiStats {
    pub slave_resets: u64,
    pub duplex_frames: u64,
    pub unresponsive_frames: u64,
}

pub struct SpiInterface {
    link: Option<Box<dyn SpiLink>>,
    config: SpiConfig,
    rx: Box<RxFrameBuffer>,
    callback: ReceiveFrameCallback,
    tx: Vec<u8>,
    tx_ready: bool,
    tx_payload_len: u16,
    tx_refused_count: u32,
    slave_data_len: u16,
    valid_since_reset: u64,
    did_rx_frame: bool,
    did_log_rate_limit: bool,
    stats: SpiStats,
    metrics: RcpInterfaceMetrics,
}

impl SpiInterface {
    pub fn new(callback: ReceiveFrameCallback) -> Self {
        Self {
            link: None,
            config: SpiConfig::default(),
            rx: Box::default(),
            callback,
            tx: vec![0; MAX_FRAME_SIZE],
            tx_ready: false,
            tx_payload_len: 0,
            tx_refused_count: 0,
            slave_data_len: 0,
            valid_since_reset: 0,
            did_rx_frame: false,
            did_log_rate_limit: false,
            stats: SpiStats::default(),
            metrics: RcpInterfaceMetrics::new(InterfaceType::Spi),
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn config(&self) -> &SpiConfig {
        &self.config
    }

    pub fn stats(&self) -> &SpiStats {
        &self.stats
    }

    fn attach(&mut self, link: Box<dyn SpiLink>, config: SpiConfig) {
        self.link = Some(link);
        self.config = config;
        self.clear_link_state();
        self.rx.discard_frame();
    }

    fn clear_link_state(&mut self) {
        self.valid_since_reset = 0;
        self.tx_ready = false;
        self.tx_refused_count = 0;
        self.tx_payload_len = 0;
        self.did_log_rate_limit = false;
        self.slave_data_len = 0;
        self.tx.fill(0);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.link.is_none() {
            return Err(TransportError::Failed("spi link not open".into()));
        }
        Ok(())
    }

    /// Pulse the reset line and give the RCP time to boot.
    fn hardware_reset(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Err(err) = link.trigger_reset() {
            die_now_with(ExitCode::ErrorErrno, &format!("spi reset: {err}"));
        }
        if !self.config.reset_delay.is_zero() {
            thread::sleep(self.config.reset_delay);
        }
    }

    fn interrupt_asserted(&mut self) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match link.interrupt_asserted() {
            Ok(asserted) => asserted,
            Err(err) => die_now_with(ExitCode::ErrorErrno, &format!("spi interrupt line: {err}")),
        }
    }

    /// Run one transfer. The current receive frame is discarded unless it was handed
    /// to the callback.
    fn push_pull(&mut self) -> Result<()> {
        let result = self.exchange();
        if !matches!(result, Ok(true)) {
            self.rx.discard_frame();
        }
        result.map(|_| ())
    }

    /// Returns whether a received frame went to the callback.
    fn exchange(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let align = usize::from(self.config.align_allowance);

        if usize::from(self.slave_data_len) > MAX_FRAME_SIZE {
            self.slave_data_len = 0;
        }

        let data_len = if self.tx_ready { self.tx_payload_len } else { 0 };
        let mut transfer_len = data_len;
        if self.slave_data_len != 0 {
            transfer_len = transfer_len.max(self.slave_data_len);
        } else {
            transfer_len = transfer_len.max(u16::from(self.config.small_packet_size));
        }
        let tx_header = SpiHeader::new(self.valid_since_reset == 0, transfer_len, data_len);
        self.tx[..SPI_HEADER_SIZE].copy_from_slice(&tx_header.encode());

        // The bus header lands in the reserved region ahead of the frame.
        self.rx.set_skip_length(SPI_HEADER_SIZE)?;
        if self.rx.frame_max_length() < usize::from(transfer_len) + align {
            debug!(transfer_len, "no receive room for an spi transfer");
            return Err(TransportError::NoBufs);
        }
        let total = SPI_HEADER_SIZE + align + usize::from(transfer_len);

        let Self { link, rx, tx, .. } = &mut *self;
        let link = link
            .as_mut()
            .ok_or_else(|| TransportError::Failed("spi link not open".into()))?;
        if let Err(err) = link.transfer(&tx[..total], &mut rx.reserved_and_frame_mut()[..total]) {
            error!(error = %err, "spi transfer failed");
            if self.config.cs_delay_us != 0 && err.raw_os_error() == Some(libc::EINVAL) {
                warn!("spi ioctl rejected the chip-select delay, try spi-cs-delay=0");
            }
            self.log_stats();
            die_now_with(ExitCode::Failure, &format!("spi transfer: {err}"));
        }
        self.metrics.transferred_frame_count += 1;

        let received = &self.rx.reserved_and_frame_mut()[..total];
        let skip = align_skip(received, align);
        let mut raw = [0u8; SPI_HEADER_SIZE];
        raw.copy_from_slice(&received[skip..skip + SPI_HEADER_SIZE]);
        let rx_header = SpiHeader::decode(raw);

        debug!(
            flags = tx_header.flags,
            accept = tx_header.accept_len,
            data = tx_header.data_len,
            "spi tx header"
        );
        debug!(
            flags = rx_header.flags,
            accept = rx_header.accept_len,
            data = rx_header.data_len,
            "spi rx header"
        );

        if raw[0] == 0xFF || raw[0] == 0x00 {
            if raw.iter().all(|&byte| byte == raw[0]) {
                if self.slave_data_len == 0 {
                    debug!(fill = raw[0], "rcp did not respond to spi transfer");
                } else {
                    warn!(fill = raw[0], "rcp did not respond to spi transfer");
                }
                self.stats.unresponsive_frames += 1;
            } else {
                self.metrics.transferred_garbage_frame_count += 1;
                warn!(header = ?raw, "garbage in spi header");
            }
            self.tx_refused_count += 1;
            return Ok(false);
        }

        let slave_accept_len = rx_header.accept_len;
        self.slave_data_len = rx_header.data_len;
        if !rx_header.is_valid()
            || usize::from(slave_accept_len) > MAX_FRAME_SIZE
            || usize::from(self.slave_data_len) > MAX_FRAME_SIZE
        {
            self.metrics.transferred_garbage_frame_count += 1;
            self.tx_refused_count += 1;
            self.slave_data_len = 0;
            warn!(header = ?raw, "garbage in spi header");
            return Ok(false);
        }

        self.valid_since_reset += 1;
        self.metrics.transferred_valid_frame_count += 1;
        if rx_header.is_reset() {
            self.stats.slave_resets += 1;
            info!(resets = self.stats.slave_resets, "rcp did reset");
            self.log_stats();
        }

        let mut exchanges = 0;
        let mut delivered = false;
        if self.slave_data_len != 0 && self.slave_data_len <= tx_header.accept_len {
            let len = usize::from(self.slave_data_len);
            self.metrics.rx_frame_count += 1;
            self.metrics.rx_frame_byte_count += len as u64;
            self.slave_data_len = 0;
            exchanges += 1;

            self.rx.set_skip_length(skip + SPI_HEADER_SIZE)?;
            self.rx.set_length(len)?;
            trace!(len, frame = ?self.rx.frame(), "spi rx frame");
            self.did_rx_frame = true;
            delivered = true;
            (self.callback)(self.rx.as_mut());
        }

        if self.tx_ready && self.tx_payload_len == tx_header.data_len {
            if tx_header.data_len <= slave_accept_len {
                exchanges += 1;
                self.metrics.tx_frame_count += 1;
                self.metrics.tx_frame_byte_count += u64::from(self.tx_payload_len);
                self.tx_ready = false;
                self.tx_payload_len = 0;
                self.tx_refused_count = 0;
            } else {
                self.tx_refused_count += 1;
            }
        }
        if !self.tx_ready {
            self.tx_refused_count = 0;
        }
        if exchanges == 2 {
            self.stats.duplex_frames += 1;
        }
        Ok(delivered)
    }

    fn log_stats(&self) {
        info!(
            slave_resets = self.stats.slave_resets,
            transfers = self.metrics.transferred_frame_count,
            valid = self.metrics.transferred_valid_frame_count,
            duplex = self.stats.duplex_frames,
            unresponsive = self.stats.unresponsive_frames,
            garbage = self.metrics.transferred_garbage_frame_count,
            rx_frames = self.metrics.rx_frame_count,
            rx_bytes = self.metrics.rx_frame_byte_count,
            tx_frames = self.metrics.tx_frame_count,
            tx_bytes = self.metrics.tx_frame_byte_count,
            "spi link stats"
        );
    }
}

#[cfg(target_os = "linux")]
fn open_link(config: &SpiConfig) -> Result<Box<dyn SpiLink>> {
    let link = crate::spidev::LinuxSpiLink::open(config).map_err(|err| {
        TransportError::Failed(format!("open spi link {}: {err}", config.device.display()))
    })?;
    Ok(Box::new(link))
}

#[cfg(not(target_os = "linux"))]
fn open_link(_config: &SpiConfig) -> Result<Box<dyn SpiLink>> {
    Err(TransportError::Unsupported(format!(
        "{SCHEME_SPI} (spidev is linux only)"
    )))
}

impl SpinelInterface for SpiInterface {
    fn init(&mut self, url: &RadioUrl) -> Result<()> {
        if self.link.is_some() {
            return Err(TransportError::Already);
        }
        let config = SpiConfig::from_url(url)?;
        let link = open_link(&config)?;

        info!(
            device = %config.device.display(),
            mode = config.mode,
            speed_hz = config.speed_hz,
            polling = config.int_gpio.is_none(),
            "spi link open"
        );
        self.attach(link, config);
        self.hardware_reset();
        Ok(())
    }

    fn deinit(&mut self) {
        if self.link.take().is_none() {
            return;
        }
        self.clear_link_state();
        debug!("spi link closed");
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        check_tx_frame(frame)?;
        self.ensure_open()?;
        if frame.len() >= MAX_FRAME_SIZE - SPI_HEADER_SIZE {
            return Err(TransportError::NoBufs);
        }
        if self.tx_ready {
            return Err(TransportError::Busy);
        }

        self.tx[SPI_HEADER_SIZE..SPI_HEADER_SIZE + frame.len()].copy_from_slice(frame);
        self.tx_ready = true;
        self.tx_payload_len = frame.len() as u16;
        trace!(len = frame.len(), frame = ?frame, "spi tx frame queued");

        if let Err(err) = self.push_pull() {
            debug!(error = %err, "spi transfer deferred");
        }
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        let deadline = deadline_after(timeout);
        self.did_rx_frame = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::ResponseTimeout);
            }
            let mut ctx = Context::new(deadline - now);
            self.update_fd_set(&mut ctx);
            if let Err(err) = select(&mut ctx) {
                die_now_with(ExitCode::ErrorErrno, &format!("spi wait: {err}"));
            }
            self.process(&ctx);
            if self.did_rx_frame {
                return Ok(());
            }
        }
    }

    fn update_fd_set(&mut self, ctx: &mut Context) {
        let Some(int_fd) = self.link.as_ref().map(|link| link.interrupt_fd()) else {
            return;
        };
        let mut timeout = if self.tx_ready {
            Duration::ZERO
        } else {
            IDLE_TIMEOUT
        };

        match int_fd {
            Some(fd) => {
                if self.interrupt_asserted() {
                    trace!("spi interrupt asserted");
                    timeout = Duration::ZERO;
                } else if let Err(err) = ctx.add_read_fd(fd) {
                    warn!(fd, error = %err, "cannot poll spi interrupt line");
                }
            }
            None => timeout = timeout.min(POLL_PERIOD),
        }

        if self.tx_refused_count > 0 {
            let min_timeout = if self.tx_refused_count < IMMEDIATE_RETRY_COUNT {
                IMMEDIATE_RETRY_TIMEOUT
            } else if self.tx_refused_count < FAST_RETRY_COUNT {
                FAST_RETRY_TIMEOUT
            } else {
                SLOW_RETRY_TIMEOUT
            };
            timeout = timeout.max(min_timeout);

            if self.tx_ready && !self.did_log_rate_limit && self.tx_refused_count > 1 {
                info!("rcp is rate limiting spi transactions");
                self.did_log_rate_limit = true;
            }
            if self.tx_refused_count == TX_REFUSE_WARN_COUNT {
                warn!(refused = self.tx_refused_count, "rcp seems stuck");
            } else if self.tx_refused_count == TX_REFUSE_EXIT_COUNT {
                die_now_with(ExitCode::Failure, "rcp seems really stuck");
            }
        } else {
            self.did_log_rate_limit = false;
        }

        ctx.set_timeout_if_earlier(timeout);
    }

    fn process(&mut self, ctx: &Context) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if let Some(fd) = link.interrupt_fd() {
            if ctx.is_readable(fd) {
                trace!("spi interrupt event");
                if let Err(err) = link.clear_interrupt() {
                    die_now_with(ExitCode::ErrorErrno, &format!("spi interrupt line: {err}"));
                }
            }
        }

        if self.tx_ready || self.interrupt_asserted() {
            if let Err(err) = self.push_pull() {
                debug!(error = %err, "spi transfer skipped");
            }
        }
    }

    fn bus_speed(&self) -> u32 {
        self.config.speed_hz
    }

    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Spi
    }

    fn on_rcp_reset(&mut self) {
        self.clear_link_state();
        self.hardware_reset();
    }

    fn rcp_interface_metrics(&self) -> Option<&RcpInterfaceMetrics> {
        Some(&self.metrics)
    }
}

impl Drop for SpiInterface {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    struct BusState {
        replies: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
        resets: u32,
        interrupt_fd: Option<RawFd>,
        interrupt: bool,
        cleared: u32,
    }

    /// Answers each transfer with the next scripted reply, `0xFF` fill after it.
    #[derive(Clone, Default)]
    struct ScriptedBus(Rc<RefCell<BusState>>);

    impl ScriptedBus {
        fn reply(&self, bytes: Vec<u8>) {
            self.0.borrow_mut().replies.push_back(bytes);
        }

        fn sent(&self, index: usize) -> Vec<u8> {
            self.0.borrow().sent[index].clone()
        }
    }

    impl SpiLink for ScriptedBus {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
            assert_eq!(tx.len(), rx.len());
            let mut state = self.0.borrow_mut();
            state.sent.push(tx.to_vec());
            rx.fill(0xFF);
            if let Some(reply) = state.replies.pop_front() {
                let len = reply.len().min(rx.len());
                rx[..len].copy_from_slice(&reply[..len]);
            }
            Ok(())
        }

        fn interrupt_fd(&self) -> Option<RawFd> {
            self.0.borrow().interrupt_fd
        }

        fn interrupt_asserted(&mut self) -> io::Result<bool> {
            let state = self.0.borrow();
            Ok(state.interrupt_fd.is_none() || state.interrupt)
        }

        fn clear_interrupt(&mut self) -> io::Result<()> {
            self.0.borrow_mut().cleared += 1;
            Ok(())
        }

        fn trigger_reset(&mut self) -> io::Result<()> {
            self.0.borrow_mut().resets += 1;
            Ok(())
        }
    }

    /// An RCP header followed by `payload`.
    fn rcp_reply(flags: u8, accept_len: u16, data_len: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = SpiHeader {
            flags,
            accept_len,
            data_len,
        }
        .encode()
        .to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    type Received = Rc<RefCell<Vec<Vec<u8>>>>;

    fn collecting_callback(keep: bool) -> (ReceiveFrameCallback, Received) {
        let received: Received = Rc::default();
        let sink = Rc::clone(&received);
        let callback: ReceiveFrameCallback = Box::new(move |rx: &mut RxFrameBuffer| {
            sink.borrow_mut().push(rx.frame().to_vec());
            if keep {
                rx.save_frame();
            } else {
                rx.discard_frame();
            }
        });
        (callback, received)
    }

    fn attach_with(callback: ReceiveFrameCallback) -> (SpiInterface, ScriptedBus) {
        let bus = ScriptedBus::default();
        let mut spi = SpiInterface::new(callback);
        spi.attach(Box::new(bus.clone()), SpiConfig::default());
        (spi, bus)
    }

    fn attached() -> (SpiInterface, ScriptedBus, Received) {
        let (callback, received) = collecting_callback(false);
        let (spi, bus) = attach_with(callback);
        (spi, bus, received)
    }

    fn header_of(transfer: &[u8]) -> SpiHeader {
        let mut raw = [0u8; SPI_HEADER_SIZE];
        raw.copy_from_slice(&transfer[..SPI_HEADER_SIZE]);
        SpiHeader::decode(raw)
    }

    #[test]
    fn header_lengths_are_little_endian() {
        let header = SpiHeader::new(true, 0x0120, 7);
        assert_eq!(header.encode(), [0x82, 0x20, 0x01, 0x07, 0x00]);
        assert_eq!(SpiHeader::decode(header.encode()), header);
        assert_eq!(SpiHeader::new(false, 0, 0).encode(), [0x02, 0, 0, 0, 0]);
    }

    #[test]
    fn header_pattern_and_reset_flag() {
        let reset = SpiHeader::decode([0x82, 0, 0, 0, 0]);
        assert!(reset.is_valid());
        assert!(reset.is_reset());

        let plain = SpiHeader::decode([0x02, 0, 0, 0, 0]);
        assert!(plain.is_valid());
        assert!(!plain.is_reset());

        assert!(!SpiHeader::decode([0x81, 0, 0, 0, 0]).is_valid());
        assert!(!SpiHeader::decode([0x03, 0, 0, 0, 0]).is_valid());
    }

    #[test]
    fn fill_bytes_are_skipped_up_to_the_allowance() {
        assert_eq!(align_skip(&[0xFF, 0xFF, 0x02, 0xFF], 16), 2);
        assert_eq!(align_skip(&[0x02, 0xFF], 16), 0);
        assert_eq!(align_skip(&[0xFF; 8], 3), 3);
        assert_eq!(align_skip(&[0xFF; 8], 0), 0);
    }

    #[test]
    fn config_reads_every_param() {
        let url = RadioUrl::parse(
            "spinel+spi:///dev/spidev0.1?gpio-int-device=/dev/gpiochip0&gpio-int-line=21\
             &gpio-reset-device=/dev/gpiochip1&gpio-reset-line=5&spi-mode=3&spi-speed=4000000\
             &spi-reset-delay=200&spi-cs-delay=0&spi-align-allowance=4&spi-small-packet=64",
        )
        .unwrap();
        let config = SpiConfig::from_url(&url).unwrap();
        assert_eq!(config.device, PathBuf::from("/dev/spidev0.1"));
        assert_eq!(
            config.int_gpio,
            Some(GpioPin {
                chip: PathBuf::from("/dev/gpiochip0"),
                line: 21
            })
        );
        assert_eq!(
            config.reset_gpio,
            Some(GpioPin {
                chip: PathBuf::from("/dev/gpiochip1"),
                line: 5
            })
        );
        assert_eq!(config.mode, 3);
        assert_eq!(config.speed_hz, 4_000_000);
        assert_eq!(config.reset_delay, Duration::from_millis(200));
        assert_eq!(config.cs_delay_us, 0);
        assert_eq!(config.align_allowance, 4);
        assert_eq!(config.small_packet_size, 64);
    }

    #[test]
    fn config_defaults_poll_without_gpio() {
        let config = SpiConfig::from_url(&RadioUrl::parse("spinel+spi:///dev/spidev0.0").unwrap())
            .unwrap();
        assert_eq!(config.int_gpio, None);
        assert_eq!(config.reset_gpio, None);
        assert_eq!(config.speed_hz, SpiConfig::DEFAULT_SPEED_HZ);
        assert_eq!(config.cs_delay_us, 20);
        assert_eq!(config.align_allowance, MAX_ALIGN_ALLOWANCE);
        assert_eq!(config.small_packet_size, 32);
    }

    #[test]
    fn config_rejects_bad_params() {
        for raw in [
            "spinel+spi://",
            "spinel+spi:///dev/spidev0.0?spi-mode=4",
            "spinel+spi:///dev/spidev0.0?spi-align-allowance=17",
            "spinel+spi:///dev/spidev0.0?gpio-int-device=/dev/gpiochip0",
            "spinel+spi:///dev/spidev0.0?gpio-reset-line=3",
            "spinel+spi:///dev/spidev0.0?spi-speed=fast",
        ] {
            let url = RadioUrl::parse(raw).unwrap();
            assert!(
                matches!(SpiConfig::from_url(&url), Err(TransportError::InvalidUrl { .. })),
                "{raw}"
            );
        }
    }

    #[test]
    fn first_transfer_announces_host_reset() {
        let (mut spi, bus, _) = attached();
        bus.reply(rcp_reply(0x02, 64, 0, &[]));
        bus.reply(rcp_reply(0x02, 64, 0, &[]));

        spi.send_frame(&[0x81, 0x02, 0x03]).unwrap();
        spi.send_frame(&[0x82, 0x02]).unwrap();

        let first = bus.sent(0);
        assert_eq!(header_of(&first), SpiHeader::new(true, 32, 3));
        assert_eq!(&first[SPI_HEADER_SIZE..SPI_HEADER_SIZE + 3], &[0x81, 0x02, 0x03]);
        assert_eq!(first.len(), SPI_HEADER_SIZE + 16 + 32);

        assert_eq!(header_of(&bus.sent(1)), SpiHeader::new(false, 32, 2));
        let metrics = spi.rcp_interface_metrics().unwrap();
        assert_eq!(metrics.tx_frame_count, 2);
        assert_eq!(metrics.tx_frame_byte_count, 5);
        assert_eq!(metrics.transferred_valid_frame_count, 2);
    }

    #[test]
    fn refused_frame_keeps_the_slot_busy() {
        let (mut spi, bus, _) = attached();
        bus.reply(rcp_reply(0x02, 0, 0, &[]));

        spi.send_frame(&[0x81, 0x02]).unwrap();
        assert!(matches!(spi.send_frame(&[0x81, 0x03]), Err(TransportError::Busy)));
        assert_eq!(spi.rcp_interface_metrics().unwrap().tx_frame_count, 0);

        bus.reply(rcp_reply(0x02, 64, 0, &[]));
        spi.process(&Context::default());

        assert_eq!(header_of(&bus.sent(1)).data_len, 2);
        assert_eq!(spi.rcp_interface_metrics().unwrap().tx_frame_count, 1);
        spi.send_frame(&[0x81, 0x03]).unwrap();
    }

    #[test]
    fn received_frame_skips_alignment_fill() {
        let (mut spi, bus, received) = attached();
        let mut reply = vec![0xFF, 0xFF];
        reply.extend(rcp_reply(0x02, 0, 3, &[0xAA, 0xBB, 0xCC]));
        bus.reply(reply);

        spi.process(&Context::default());

        assert_eq!(*received.borrow(), vec![vec![0xAA, 0xBB, 0xCC]]);
        let metrics = spi.rcp_interface_metrics().unwrap();
        assert_eq!(metrics.rx_frame_count, 1);
        assert_eq!(metrics.rx_frame_byte_count, 3);
    }

    #[test]
    fn saved_frame_keeps_its_bytes() {
        let (callback, received) = collecting_callback(true);
        let (mut spi, bus) = attach_with(callback);
        bus.reply(rcp_reply(0x02, 0, 2, &[0x80, 0x06]));
        bus.reply(vec![0xFF, 0x02, 0, 0, 3, 0, 0x81, 0x06, 0x02]);

        spi.process(&Context::default());
        spi.process(&Context::default());

        let saved: Vec<Vec<u8>> = spi.rx.saved_frames().map(<[u8]>::to_vec).collect();
        assert_eq!(saved, vec![vec![0x80, 0x06], vec![0x81, 0x06, 0x02]]);
        assert_eq!(*received.borrow(), saved);
    }

    #[test]
    fn large_rcp_frame_is_pulled_on_the_next_transfer() {
        let (mut spi, bus, received) = attached();
        bus.reply(rcp_reply(0x02, 0, 40, &[]));
        spi.process(&Context::default());
        assert!(received.borrow().is_empty());

        let payload: Vec<u8> = (0..40).collect();
        bus.reply(rcp_reply(0x02, 0, 40, &payload));
        spi.process(&Context::default());

        let second = bus.sent(1);
        assert_eq!(header_of(&second).accept_len, 40);
        assert_eq!(second.len(), SPI_HEADER_SIZE + 16 + 40);
        assert_eq!(*received.borrow(), vec![payload]);
    }

    #[test]
    fn garbage_and_silence_deliver_nothing() {
        let (mut spi, bus, received) = attached();
        bus.reply(vec![0x55, 1, 2, 3, 4]);
        bus.reply(vec![0x00, 0x00, 0x01, 0x00, 0x00]);
        spi.process(&Context::default());
        spi.process(&Context::default());
        // No scripted reply: the bus reads back all 0xFF.
        spi.process(&Context::default());

        assert!(received.borrow().is_empty());
        let metrics = spi.rcp_interface_metrics().unwrap();
        assert_eq!(metrics.transferred_frame_count, 3);
        assert_eq!(metrics.transferred_garbage_frame_count, 2);
        assert_eq!(metrics.transferred_valid_frame_count, 0);
        assert_eq!(spi.stats().unresponsive_frames, 1);
        assert_eq!(spi.rx.length(), 0);
    }

    #[test]
    fn rcp_reset_flag_is_counted() {
        let (mut spi, bus, _) = attached();
        bus.reply(rcp_reply(0x82, 32, 0, &[]));
        spi.process(&Context::default());
        assert_eq!(spi.stats().slave_resets, 1);
    }

    #[test]
    fn polling_bounds_the_mainloop_timeout() {
        let (mut spi, bus, _) = attached();
        let mut ctx = Context::new(Duration::from_secs(10));
        spi.update_fd_set(&mut ctx);
        assert_eq!(ctx.timeout(), POLL_PERIOD);

        bus.reply(rcp_reply(0x02, 0, 0, &[]));
        spi.send_frame(&[0x81, 0x02]).unwrap();
        let mut ctx = Context::new(Duration::from_secs(10));
        spi.update_fd_set(&mut ctx);
        assert_eq!(ctx.timeout(), IMMEDIATE_RETRY_TIMEOUT);
    }

    #[test]
    fn interrupt_line_gates_transfers() {
        let (mut spi, bus, _) = attached();
        let (_edge, line) = UnixStream::pair().unwrap();
        bus.0.borrow_mut().interrupt_fd = Some(line.as_raw_fd());

        let mut ctx = Context::new(Duration::from_secs(10));
        spi.update_fd_set(&mut ctx);
        assert!(ctx.is_readable(line.as_raw_fd()));
        assert_eq!(ctx.timeout(), Duration::from_secs(10));
        spi.process(&Context::default());
        assert!(bus.0.borrow().sent.is_empty());

        bus.0.borrow_mut().interrupt = true;
        let mut ctx = Context::new(Duration::from_secs(10));
        spi.update_fd_set(&mut ctx);
        assert_eq!(ctx.timeout(), Duration::ZERO);
        spi.process(&ctx);
        assert_eq!(bus.0.borrow().sent.len(), 1);
        assert_eq!(bus.0.borrow().cleared, 0);
    }

    #[test]
    fn wait_for_frame_returns_once_a_frame_arrives() {
        let (mut spi, bus, received) = attached();
        bus.reply(rcp_reply(0x02, 0, 2, &[0x80, 0x06]));
        spi.wait_for_frame(Duration::MAX).unwrap();
        assert_eq!(*received.borrow(), vec![vec![0x80, 0x06]]);
    }

    #[test]
    fn wait_for_frame_times_out_on_a_silent_bus() {
        let (mut spi, _, received) = attached();
        let start = Instant::now();
        assert!(matches!(
            spi.wait_for_frame(Duration::from_millis(20)),
            Err(TransportError::ResponseTimeout)
        ));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(received.borrow().is_empty());
    }

    #[test]
    fn rcp_reset_pulses_the_line_and_frees_the_slot() {
        let (mut spi, bus, _) = attached();
        bus.reply(rcp_reply(0x02, 0, 0, &[]));
        spi.send_frame(&[0x81, 0x02]).unwrap();
        assert!(matches!(spi.send_frame(&[0x81, 0x02]), Err(TransportError::Busy)));

        spi.on_rcp_reset();
        assert_eq!(bus.0.borrow().resets, 1);

        spi.send_frame(&[0x81, 0x03]).unwrap();
        assert!(header_of(&bus.sent(1)).is_reset());
    }

    #[test]
    fn send_checks_size_and_state() {
        let (callback, _) = collecting_callback(false);
        let mut closed = SpiInterface::new(callback);
        assert!(matches!(closed.send_frame(&[0x80]), Err(TransportError::Failed(_))));

        let (mut spi, bus, _) = attached();
        assert!(matches!(spi.send_frame(&[]), Err(TransportError::InvalidArgs(_))));
        assert!(matches!(
            spi.send_frame(&vec![0u8; MAX_FRAME_SIZE - SPI_HEADER_SIZE]),
            Err(TransportError::NoBufs)
        ));
        assert!(bus.0.borrow().sent.is_empty());
    }

    #[test]
    fn init_twice_is_already_and_deinit_is_idempotent() {
        let (mut spi, _, _) = attached();
        let url = RadioUrl::parse("spinel+spi:///dev/spidev0.0").unwrap();
        assert!(matches!(spi.init(&url), Err(TransportError::Already)));
        assert_eq!(spi.interface_type(), InterfaceType::Spi);
        assert_eq!(spi.bus_speed(), SpiConfig::DEFAULT_SPEED_HZ);

        spi.deinit();
        assert!(!spi.is_open());
        spi.deinit();
        assert!(matches!(spi.send_frame(&[0x80]), Err(TransportError::Failed(_))));
    }
}

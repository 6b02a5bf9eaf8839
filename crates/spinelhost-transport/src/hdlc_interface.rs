//! Spinel over an HDLC-lite byte stream.
//!
//! Two link flavours share this transport:
//! - `spinel+hdlc+uart:///dev/ttyACM0` opens a serial device in raw mode
//! - `spinel+hdlc+forkpty:///path/to/ot-rcp?forkpty-arg=1` runs a simulated RCP as a
//!   child process talking over a Unix socket pair

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use spinelhost_frame::hdlc::{self, Decoder};
use spinelhost_frame::{RxFrameBuffer, MAX_FRAME_SIZE};
use spinelhost_mainloop::{deadline_after, wait_fd, Context, Interest};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::exit::{die_now_with, ExitCode};
use crate::traits::{
    check_tx_frame, InterfaceType, RcpInterfaceMetrics, ReceiveFrameCallback, SpinelInterface,
};
use crate::url::RadioUrl;

pub const SCHEME_UART: &str = "spinel+hdlc+uart";
pub const SCHEME_FORKPTY: &str = "spinel+hdlc+forkpty";

/// How long `send_frame` waits for the link to drain before giving up.
const MAX_WAIT_WRITABLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HdlcDevice {
    Uart { path: PathBuf },
    ForkPty { program: PathBuf, args: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdlcConfig {
    pub device: HdlcDevice,
    pub baudrate: u32,
    pub flow_control: bool,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl HdlcConfig {
    pub const DEFAULT_BAUDRATE: u32 = 115_200;

    pub fn from_url(url: &RadioUrl) -> Result<Self> {
        let invalid = |reason: String| TransportError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        if url.path().is_empty() {
            return Err(invalid("missing device path".into()));
        }
        let device = match url.scheme() {
            SCHEME_UART => HdlcDevice::Uart {
                path: PathBuf::from(url.path()),
            },
            SCHEME_FORKPTY => HdlcDevice::ForkPty {
                program: PathBuf::from(url.path()),
                args: url.get_values("forkpty-arg").map(str::to_string).collect(),
            },
            other => return Err(TransportError::Unsupported(other.to_string())),
        };

        let parity = match url.get_value("uart-parity") {
            None | Some("none") => Parity::None,
            Some("even") => Parity::Even,
            Some("odd") => Parity::Odd,
            Some(other) => return Err(invalid(format!("unknown parity {other:?}"))),
        };
        let stop_bits = url.parse_value::<u8>("uart-stop")?.unwrap_or(1);
        if !matches!(stop_bits, 1 | 2) {
            return Err(invalid(format!("stop bits must be 1 or 2, got {stop_bits}")));
        }

        Ok(Self {
            device,
            baudrate: url
                .parse_value("uart-baudrate")?
                .unwrap_or(Self::DEFAULT_BAUDRATE),
            flow_control: url.has_param("uart-flow-control"),
            parity,
            stop_bits,
        })
    }
}

struct Link {
    file: File,
    child: Option<Child>,
}

impl Link {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

pub struct HdlcInterface {
    link: Option<Link>,
    baudrate: u32,
    decoder: Decoder,
    rx: Box<RxFrameBuffer>,
    callback: ReceiveFrameCallback,
    metrics: RcpInterfaceMetrics,
}

impl HdlcInterface {
    pub fn new(callback: ReceiveFrameCallback) -> Self {
        Self {
            link: None,
            baudrate: HdlcConfig::DEFAULT_BAUDRATE,
            decoder: Decoder::new(),
            rx: Box::default(),
            callback,
            metrics: RcpInterfaceMetrics::new(InterfaceType::Hdlc),
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn attach(&mut self, file: File, child: Option<Child>) {
        self.decoder.reset();
        self.rx.discard_frame();
        self.link = Some(Link { file, child });
    }

    fn link(&self) -> Result<&Link> {
        self.link
            .as_ref()
            .ok_or_else(|| TransportError::Failed("hdlc link not open".into()))
    }

    /// Read whatever is available and feed it to the decoder.
    fn read(&mut self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let mut buf = [0u8; MAX_FRAME_SIZE];
        match (&link.file).read(&mut buf) {
            Ok(0) => die_now_with(ExitCode::Failure, "rcp closed the hdlc link"),
            Ok(len) => {
                trace!(len, "hdlc rx bytes");
                self.decode(&buf[..len]);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => die_now_with(ExitCode::ErrorErrno, &format!("hdlc read: {err}")),
        }
    }

    fn decode(&mut self, data: &[u8]) {
        let Self {
            decoder,
            rx,
            callback,
            metrics,
            ..
        } = self;

        decoder.decode(data, rx.as_mut(), |rx, result| {
            metrics.transferred_frame_count += 1;
            match result {
                Ok(()) => {
                    metrics.transferred_valid_frame_count += 1;
                    metrics.rx_frame_count += 1;
                    metrics.rx_frame_byte_count += rx.length() as u64;
                    trace!(len = rx.length(), frame = ?rx.frame(), "hdlc rx frame");
                    callback(rx);
                }
                Err(err) => {
                    metrics.transferred_garbage_frame_count += 1;
                    debug!(error = %err, "dropping hdlc frame");
                    rx.discard_frame();
                }
            }
        });
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let link = self.link()?;
        let deadline = deadline_after(MAX_WAIT_WRITABLE);
        let mut remaining = data;

        while !remaining.is_empty() {
            match (&link.file).write(remaining) {
                Ok(0) => return Err(TransportError::Failed("hdlc link accepted no bytes".into())),
                Ok(written) => remaining = &remaining[written..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    match wait_fd(link.fd(), Interest::Write, left) {
                        Ok(true) => {}
                        Ok(false) => {
                            return Err(TransportError::Failed(
                                "timed out waiting for the hdlc link to drain".into(),
                            ))
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => {
                            die_now_with(ExitCode::ErrorErrno, &format!("hdlc wait: {err}"))
                        }
                    }
                }
                Err(err) => die_now_with(ExitCode::ErrorErrno, &format!("hdlc write: {err}")),
            }
        }
        Ok(())
    }
}

fn open_uart(path: &Path, config: &HdlcConfig) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
        .map_err(|err| TransportError::Failed(format!("open {}: {err}", path.display())))?;

    let speed = baud_constant(config.baudrate)?;
    configure_tty(file.as_raw_fd(), speed, config).map_err(|err| {
        TransportError::Failed(format!("configure {}: {err}", path.display()))
    })?;
    Ok(file)
}

fn configure_tty(fd: RawFd, speed: libc::speed_t, config: &HdlcConfig) -> io::Result<()> {
    let mut tios = MaybeUninit::<libc::termios>::uninit();
    // SAFETY: tcgetattr fills the termios struct on success.
    if unsafe { libc::tcgetattr(fd, tios.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: tcgetattr returned success, so the struct is initialized.
    let mut tios = unsafe { tios.assume_init() };
    // SAFETY: `tios` is a valid termios struct.
    unsafe { libc::cfmakeraw(&mut tios) };

    tios.c_cflag = libc::CS8 | libc::HUPCL | libc::CREAD | libc::CLOCAL;
    match config.parity {
        Parity::None => {}
        Parity::Even => tios.c_cflag |= libc::PARENB,
        Parity::Odd => tios.c_cflag |= libc::PARENB | libc::PARODD,
    }
    if config.stop_bits == 2 {
        tios.c_cflag |= libc::CSTOPB;
    }
    if config.flow_control {
        tios.c_cflag |= libc::CRTSCTS;
    }

    // SAFETY: `tios` is a valid termios struct and `fd` an open tty.
    unsafe {
        if libc::cfsetispeed(&mut tios, speed) != 0 || libc::cfsetospeed(&mut tios, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tios) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn baud_constant(baudrate: u32) -> Result<libc::speed_t> {
    let speed = match baudrate {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        #[cfg(target_os = "linux")]
        460800 => libc::B460800,
        #[cfg(target_os = "linux")]
        921600 => libc::B921600,
        #[cfg(target_os = "linux")]
        1000000 => libc::B1000000,
        other => {
            return Err(TransportError::InvalidArgs(format!(
                "unsupported baud rate {other}"
            )))
        }
    };
    Ok(speed)
}

fn spawn_rcp(program: &Path, args: &[String]) -> Result<(File, Child)> {
    let (host, rcp) = UnixStream::pair()?;
    let rcp_out = rcp.try_clone()?;

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::from(OwnedFd::from(rcp)))
        .stdout(Stdio::from(OwnedFd::from(rcp_out)))
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| TransportError::Failed(format!("spawn {}: {err}", program.display())))?;

    host.set_nonblocking(true)?;
    Ok((File::from(OwnedFd::from(host)), child))
}

impl SpinelInterface for HdlcInterface {
    fn init(&mut self, url: &RadioUrl) -> Result<()> {
        if self.link.is_some() {
            return Err(TransportError::Already);
        }
        let config = HdlcConfig::from_url(url)?;

        let (file, child) = match &config.device {
            HdlcDevice::Uart { path } => (open_uart(path, &config)?, None),
            HdlcDevice::ForkPty { program, args } => {
                let (file, child) = spawn_rcp(program, args)?;
                (file, Some(child))
            }
        };

        info!(
            device = ?config.device,
            baudrate = config.baudrate,
            fd = file.as_raw_fd(),
            "hdlc link open"
        );
        self.baudrate = config.baudrate;
        self.attach(file, child);
        Ok(())
    }

    fn deinit(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        if let Some(child) = link.child.as_mut() {
            if let Err(err) = child.kill() {
                debug!(error = %err, "rcp child already gone");
            }
            match child.wait() {
                Ok(status) => debug!(%status, "rcp child reaped"),
                Err(err) => warn!(error = %err, "waiting for rcp child failed"),
            }
        }
        self.decoder.reset();
        debug!(fd = link.fd(), "hdlc link closed");
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        check_tx_frame(frame)?;
        self.link()?;

        let mut encoded = BytesMut::new();
        hdlc::encode_frame(frame, &mut encoded);
        self.write_all(&encoded)?;

        self.metrics.tx_frame_count += 1;
        self.metrics.tx_frame_byte_count += frame.len() as u64;
        trace!(len = frame.len(), frame = ?frame, "hdlc tx frame");
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Duration) -> Result<()> {
        let fd = self.link()?.fd();
        let deadline = deadline_after(timeout);

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match wait_fd(fd, Interest::Read, left) {
                Ok(true) => {
                    self.read();
                    return Ok(());
                }
                Ok(false) => return Err(TransportError::ResponseTimeout),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => die_now_with(ExitCode::ErrorErrno, &format!("hdlc wait: {err}")),
            }
        }
    }

    fn update_fd_set(&mut self, ctx: &mut Context) {
        if let Some(link) = &self.link {
            if let Err(err) = ctx.add_read_fd(link.fd()) {
                warn!(fd = link.fd(), error = %err, "cannot poll hdlc link");
            }
        }
    }

    fn process(&mut self, ctx: &Context) {
        let readable = self
            .link
            .as_ref()
            .is_some_and(|link| ctx.is_readable(link.fd()));
        if readable {
            self.read();
        }
    }

    fn bus_speed(&self) -> u32 {
        self.baudrate
    }

    fn interface_type(&self) -> InterfaceType {
        InterfaceType::Hdlc
    }

    fn on_rcp_reset(&mut self) {
        self.decoder.reset();
        self.rx.discard_frame();
    }

    fn rcp_interface_metrics(&self) -> Option<&RcpInterfaceMetrics> {
        Some(&self.metrics)
    }
}

impl Drop for HdlcInterface {
    fn drop(&mut self) {
        self.deinit();
    }
}

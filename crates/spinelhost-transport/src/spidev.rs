//! Linux `spidev` and GPIO character device access for [`SpiInterface`](crate::SpiInterface).

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::spi::{GpioPin, SpiConfig, SpiLink};

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

const SPI_IOC_MAGIC: u8 = b'k';
const SPI_IOC_WR_MODE: u32 = ioc(IOC_WRITE, SPI_IOC_MAGIC, 1, size_of::<u8>());
const SPI_IOC_WR_BITS_PER_WORD: u32 = ioc(IOC_WRITE, SPI_IOC_MAGIC, 3, size_of::<u8>());
const SPI_IOC_WR_MAX_SPEED_HZ: u32 = ioc(IOC_WRITE, SPI_IOC_MAGIC, 4, size_of::<u32>());

const fn spi_ioc_message(count: usize) -> u32 {
    ioc(IOC_WRITE, SPI_IOC_MAGIC, 0, count * size_of::<SpiIocTransfer>())
}

const SPI_BITS_PER_WORD: u8 = 8;

/// `struct spi_ioc_transfer` from `linux/spi/spidev.h`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

const GPIO_IOC_MAGIC: u8 = 0xB4;
const GPIOHANDLES_MAX: usize = 64;
const GPIO_LABEL_LEN: usize = 32;

const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;
const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
const GPIOEVENT_REQUEST_FALLING_EDGE: u32 = 1 << 1;

/// `struct gpiohandle_request` (GPIO character device ABI v1).
#[repr(C)]
struct GpioHandleRequest {
    lineoffsets: [u32; GPIOHANDLES_MAX],
    flags: u32,
    default_values: [u8; GPIOHANDLES_MAX],
    consumer_label: [u8; GPIO_LABEL_LEN],
    lines: u32,
    fd: libc::c_int,
}

/// `struct gpioevent_request`.
#[repr(C)]
struct GpioEventRequest {
    lineoffset: u32,
    handleflags: u32,
    eventflags: u32,
    consumer_label: [u8; GPIO_LABEL_LEN],
    fd: libc::c_int,
}

/// `struct gpiohandle_data`.
#[repr(C)]
struct GpioHandleData {
    values: [u8; GPIOHANDLES_MAX],
}

/// Size of `struct gpioevent_data` (u64 timestamp, u32 id, padded).
const GPIO_EVENT_DATA_SIZE: usize = 16;

const GPIO_GET_LINEHANDLE_IOCTL: u32 = ioc(
    IOC_READ | IOC_WRITE,
    GPIO_IOC_MAGIC,
    0x03,
    size_of::<GpioHandleRequest>(),
);
const GPIO_GET_LINEEVENT_IOCTL: u32 = ioc(
    IOC_READ | IOC_WRITE,
    GPIO_IOC_MAGIC,
    0x04,
    size_of::<GpioEventRequest>(),
);
const GPIOHANDLE_GET_LINE_VALUES_IOCTL: u32 = ioc(
    IOC_READ | IOC_WRITE,
    GPIO_IOC_MAGIC,
    0x08,
    size_of::<GpioHandleData>(),
);
const GPIOHANDLE_SET_LINE_VALUES_IOCTL: u32 = ioc(
    IOC_READ | IOC_WRITE,
    GPIO_IOC_MAGIC,
    0x09,
    size_of::<GpioHandleData>(),
);

const INT_LABEL: &str = "THREAD_SOC_INT";
const RESET_LABEL: &str = "SOC_THREAD_RESET";

/// How long the reset line is held low.
const RESET_HOLD: Duration = Duration::from_millis(10);

/// The interrupt line is active low.
const INT_ASSERTED: u8 = 0;

fn consumer_label(label: &str) -> [u8; GPIO_LABEL_LEN] {
    let mut out = [0u8; GPIO_LABEL_LEN];
    let len = label.len().min(GPIO_LABEL_LEN - 1);
    out[..len].copy_from_slice(&label.as_bytes()[..len]);
    out
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|err| io::Error::new(err.kind(), format!("open {}: {err}", path.display())))
}

fn check_ioctl(rc: libc::c_int, what: &str) -> io::Result<()> {
    if rc < 0 {
        let err = io::Error::last_os_error();
        return Err(io::Error::new(err.kind(), format!("{what}: {err}")));
    }
    Ok(())
}

/// One requested GPIO line: an output handle or a falling-edge event source.
#[derive(Debug)]
pub struct GpioLine {
    file: File,
}

impl GpioLine {
    /// Request `pin` as an output driven high.
    pub fn output(pin: &GpioPin, label: &str) -> io::Result<Self> {
        debug!(chip = %pin.chip.display(), line = pin.line, "requesting gpio output");
        let chip = open_rw(&pin.chip)?;
        let mut req = GpioHandleRequest {
            lineoffsets: [0; GPIOHANDLES_MAX],
            flags: GPIOHANDLE_REQUEST_OUTPUT,
            default_values: [0; GPIOHANDLES_MAX],
            consumer_label: consumer_label(label),
            lines: 1,
            fd: -1,
        };
        req.lineoffsets[0] = u32::from(pin.line);
        req.default_values[0] = 1;

        // SAFETY: `req` is a valid gpiohandle_request that outlives the call.
        let rc = unsafe { libc::ioctl(chip.as_raw_fd(), GPIO_GET_LINEHANDLE_IOCTL as _, &mut req) };
        check_ioctl(rc, "GPIO_GET_LINEHANDLE_IOCTL")?;
        // SAFETY: on success the kernel returned a new descriptor owned by us.
        let fd = unsafe { OwnedFd::from_raw_fd(req.fd) };
        Ok(Self { file: File::from(fd) })
    }

    /// Request `pin` as an input reporting falling edges.
    pub fn falling_edge_input(pin: &GpioPin, label: &str) -> io::Result<Self> {
        debug!(chip = %pin.chip.display(), line = pin.line, "requesting gpio interrupt");
        let chip = open_rw(&pin.chip)?;
        let mut req = GpioEventRequest {
            lineoffset: u32::from(pin.line),
            handleflags: GPIOHANDLE_REQUEST_INPUT,
            eventflags: GPIOEVENT_REQUEST_FALLING_EDGE,
            consumer_label: consumer_label(label),
            fd: -1,
        };

        // SAFETY: `req` is a valid gpioevent_request that outlives the call.
        let rc = unsafe { libc::ioctl(chip.as_raw_fd(), GPIO_GET_LINEEVENT_IOCTL as _, &mut req) };
        check_ioctl(rc, "GPIO_GET_LINEEVENT_IOCTL")?;
        // SAFETY: on success the kernel returned a new descriptor owned by us.
        let fd = unsafe { OwnedFd::from_raw_fd(req.fd) };
        Ok(Self { file: File::from(fd) })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn get(&self) -> io::Result<u8> {
        let mut data = GpioHandleData {
            values: [0; GPIOHANDLES_MAX],
        };
        // SAFETY: `data` is a valid gpiohandle_data that outlives the call.
        let rc = unsafe { libc::ioctl(self.fd(), GPIOHANDLE_GET_LINE_VALUES_IOCTL as _, &mut data) };
        check_ioctl(rc, "GPIOHANDLE_GET_LINE_VALUES_IOCTL")?;
        Ok(data.values[0])
    }

    pub fn set(&self, value: u8) -> io::Result<()> {
        let mut data = GpioHandleData {
            values: [0; GPIOHANDLES_MAX],
        };
        data.values[0] = value;
        // SAFETY: `data` is a valid gpiohandle_data that outlives the call.
        let rc = unsafe { libc::ioctl(self.fd(), GPIOHANDLE_SET_LINE_VALUES_IOCTL as _, &mut data) };
        check_ioctl(rc, "GPIOHANDLE_SET_LINE_VALUES_IOCTL")
    }

    /// Consume one pending edge event.
    pub fn read_event(&self) -> io::Result<()> {
        let mut event = [0u8; GPIO_EVENT_DATA_SIZE];
        (&self.file).read(&mut event).map(|_| ())
    }
}

/// An open, exclusively locked `spidev` device.
#[derive(Debug)]
pub struct SpiDev {
    file: File,
    speed_hz: u32,
    cs_delay_us: u16,
}

impl SpiDev {
    pub fn open(path: &Path, mode: u8, speed_hz: u32, cs_delay_us: u16) -> io::Result<Self> {
        debug!(path = %path.display(), mode, speed_hz, "opening spidev");
        let file = open_rw(path)?;
        let fd = file.as_raw_fd();
        let bits = SPI_BITS_PER_WORD;

        // SAFETY: each ioctl reads one value of the documented size from a live local.
        unsafe {
            check_ioctl(libc::ioctl(fd, SPI_IOC_WR_MODE as _, &mode), "SPI_IOC_WR_MODE")?;
            check_ioctl(
                libc::ioctl(fd, SPI_IOC_WR_MAX_SPEED_HZ as _, &speed_hz),
                "SPI_IOC_WR_MAX_SPEED_HZ",
            )?;
            check_ioctl(
                libc::ioctl(fd, SPI_IOC_WR_BITS_PER_WORD as _, &bits),
                "SPI_IOC_WR_BITS_PER_WORD",
            )?;
        }
        // SAFETY: `fd` is open for the lifetime of `file`.
        if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = io::Error::last_os_error();
            return Err(io::Error::new(err.kind(), format!("flock {}: {err}", path.display())));
        }

        Ok(Self {
            file,
            speed_hz,
            cs_delay_us,
        })
    }

    /// Clock `tx` out while clocking the same number of bytes into `rx`.
    ///
    /// With a chip-select delay configured, a zero-length leading transfer carries
    /// the delay. Not every SPI controller driver accepts that.
    pub fn transfer(&self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        if tx.len() != rx.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "spi tx and rx lengths differ",
            ));
        }
        let len = u32::try_from(tx.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "spi transfer too long"))?;

        let transfers = [
            SpiIocTransfer {
                speed_hz: self.speed_hz,
                delay_usecs: self.cs_delay_us,
                bits_per_word: SPI_BITS_PER_WORD,
                ..SpiIocTransfer::default()
            },
            SpiIocTransfer {
                tx_buf: tx.as_ptr() as u64,
                rx_buf: rx.as_mut_ptr() as u64,
                len,
                speed_hz: self.speed_hz,
                bits_per_word: SPI_BITS_PER_WORD,
                ..SpiIocTransfer::default()
            },
        ];

        let fd = self.file.as_raw_fd();
        // SAFETY: the transfer structs point at `tx` and `rx`, which are valid for
        // `len` bytes and outlive the call.
        let rc = unsafe {
            if self.cs_delay_us > 0 {
                libc::ioctl(fd, spi_ioc_message(2) as _, transfers.as_ptr())
            } else {
                libc::ioctl(fd, spi_ioc_message(1) as _, &transfers[1])
            }
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        trace!(tx = ?tx, rx = ?rx, "spi transfer");
        Ok(())
    }
}

/// spidev plus the optional interrupt and reset lines.
#[derive(Debug)]
pub struct LinuxSpiLink {
    dev: SpiDev,
    interrupt: Option<GpioLine>,
    reset: Option<GpioLine>,
}

impl LinuxSpiLink {
    pub fn open(config: &SpiConfig) -> io::Result<Self> {
        let interrupt = config
            .int_gpio
            .as_ref()
            .map(|pin| GpioLine::falling_edge_input(pin, INT_LABEL))
            .transpose()?;
        if interrupt.is_none() {
            info!("no interrupt line, polling the spi bus");
        }
        let reset = config
            .reset_gpio
            .as_ref()
            .map(|pin| GpioLine::output(pin, RESET_LABEL))
            .transpose()?;
        let dev = SpiDev::open(
            &config.device,
            config.mode,
            config.speed_hz,
            config.cs_delay_us,
        )?;
        Ok(Self {
            dev,
            interrupt,
            reset,
        })
    }
}

impl SpiLink for LinuxSpiLink {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        self.dev.transfer(tx, rx)
    }

    fn interrupt_fd(&self) -> Option<RawFd> {
        self.interrupt.as_ref().map(GpioLine::fd)
    }

    fn interrupt_asserted(&mut self) -> io::Result<bool> {
        match &self.interrupt {
            Some(line) => Ok(line.get()? == INT_ASSERTED),
            None => Ok(true),
        }
    }

    fn clear_interrupt(&mut self) -> io::Result<()> {
        match &self.interrupt {
            Some(line) => line.read_event(),
            None => Ok(()),
        }
    }

    fn trigger_reset(&mut self) -> io::Result<()> {
        let Some(line) = &self.reset else {
            debug!("no reset line, skipping hardware reset");
            return Ok(());
        };
        line.set(0)?;
        thread::sleep(RESET_HOLD);
        line.set(1)?;
        info!("triggered rcp hardware reset");
        Ok(())
    }
}

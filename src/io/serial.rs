//! Serial line client
//!
//! Opens a tty device through `serialport` in raw 8N1 mode: no parity, one
//! stop bit, no flow control. Reads return after a 4 second quiet period or
//! as soon as any byte arrives; a quiet period with no data reads as zero
//! bytes.
//!
//! `serialport` only opens devices read/write, so read-only and write-only
//! descriptors are opened here, switched to raw mode and then handed to a
//! [`TTYPort`] for the line settings.
//!
//! When the device path cannot be opened, the generic input-event nodes
//! (`/dev/input/event0..39`) are scanned and the first one whose reported
//! name equals the requested path is adopted instead. Such nodes are not
//! ttys, so no line settings are applied to them.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};
use tracing::{debug, info};

use crate::error::{CommError, Result};
use crate::io::client::{Client, ClientCore, Mode, ZeroRead};

/// Line rates accepted by [`SerialClient::open_port`]
pub const SUPPORTED_BAUD_RATES: [u32; 10] = [
    9600, 19200, 38400, 57600, 115200, 230400, 460800, 500000, 921600, 1000000,
];

/// Quiet period after which a read gives up
const READ_QUIET: Duration = Duration::from_secs(4);

/// Number of `/dev/input/event*` nodes scanned by the fallback
const INPUT_EVENT_SCAN: usize = 40;

/// Access mode for the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Read and write
    #[default]
    ReadWrite,
    /// Read only
    ReadOnly,
    /// Write only
    WriteOnly,
}

impl OpenMode {
    /// Map raw `O_*` flags to an access mode
    pub fn from_flags(flags: i32) -> Self {
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => OpenMode::WriteOnly,
            libc::O_RDONLY => OpenMode::ReadOnly,
            _ => OpenMode::ReadWrite,
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            OpenMode::ReadWrite => "rw",
            OpenMode::ReadOnly => "ro",
            OpenMode::WriteOnly => "wo",
        }
    }

    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            OpenMode::ReadWrite => options.read(true).write(true),
            OpenMode::ReadOnly => options.read(true),
            OpenMode::WriteOnly => options.write(true),
        };
        options.custom_flags(libc::O_NOCTTY);
        options
    }
}

/// Check `baud` against [`SUPPORTED_BAUD_RATES`]
pub fn check_baud_rate(baud: u32) -> Result<u32> {
    if SUPPORTED_BAUD_RATES.contains(&baud) {
        Ok(baud)
    } else {
        Err(CommError::UnsupportedBaudRate(baud))
    }
}

/// Descriptor owned by an open [`SerialClient`]
pub enum SerialLine {
    /// A configured tty
    Tty(TTYPort),
    /// An adopted input-event node
    InputEvent(File),
}

impl SerialLine {
    fn raw_fd(&self) -> RawFd {
        match self {
            SerialLine::Tty(port) => port.as_raw_fd(),
            SerialLine::InputEvent(file) => file.as_raw_fd(),
        }
    }
}

impl Read for SerialLine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SerialLine::Tty(port) => match port.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                other => other,
            },
            SerialLine::InputEvent(file) => file.read(buf),
        }
    }
}

impl Write for SerialLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SerialLine::Tty(port) => port.write(buf),
            SerialLine::InputEvent(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SerialLine::Tty(port) => port.flush(),
            SerialLine::InputEvent(file) => file.flush(),
        }
    }
}

/// Serial port client
///
/// # Examples
///
/// ```no_run
/// use comms_rust::io::serial::{OpenMode, SerialClient};
/// use comms_rust::io::Client;
///
/// let port = SerialClient::new();
/// port.open_port("/dev/ttyUSB0", 115200, OpenMode::ReadWrite)?;
///
/// let mut sample = [0u8; 130];
/// port.write(b"\n", false)?;
/// port.read(&mut sample, true, true)?;
/// # Ok::<(), comms_rust::error::CommError>(())
/// ```
pub struct SerialClient {
    core: ClientCore<SerialLine>,
}

impl std::fmt::Debug for SerialClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialClient").finish_non_exhaustive()
    }
}

impl Default for SerialClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialClient {
    /// Create a closed client
    pub fn new() -> Self {
        SerialClient {
            core: ClientCore::new(Mode::Serial, "Serial-Client"),
        }
    }

    /// Open and configure `path`
    ///
    /// The baud rate is validated before the device is touched, so an
    /// unsupported rate never leaves a descriptor open.
    ///
    /// # Errors
    ///
    /// - [`CommError::UnsupportedBaudRate`] - `baud` is not in [`SUPPORTED_BAUD_RATES`]
    /// - [`CommError::SerialOpen`] - neither the path nor a matching input device opened
    /// - [`CommError::SerialConfig`] - the line settings could not be read or applied
    pub fn open_port(&self, path: &str, baud: u32, mode: OpenMode) -> Result<()> {
        let baud = check_baud_rate(baud)?;
        info!(path, baud, mode = mode.short_name(), "Connection in progress...");

        let opened = match mode {
            OpenMode::ReadWrite => open_read_write(path, baud),
            OpenMode::ReadOnly | OpenMode::WriteOnly => open_one_way(path, baud, mode),
        };
        let line = match opened {
            Ok(port) => {
                info!(path, baud, "Serial port settings saved");
                SerialLine::Tty(port)
            }
            Err(Opened::Config(e)) => return Err(e),
            Err(Opened::Unreachable(source)) => match find_input_device(path) {
                Some(file) => SerialLine::InputEvent(file),
                None => {
                    return Err(CommError::SerialOpen {
                        path: path.to_string(),
                        source,
                    })
                }
            },
        };

        debug!(path, fd = line.raw_fd(), "Check connection");
        self.core
            .install(line, &format!("{path}:{}", mode.short_name()));
        Ok(())
    }
}

/// Why a tty could not be set up
enum Opened {
    /// The path itself could not be opened
    Unreachable(io::Error),
    /// The path opened but is not a usable tty
    Config(CommError),
}

fn config_error(path: &str, stage: &'static str, source: io::Error) -> Opened {
    Opened::Config(CommError::SerialConfig {
        path: path.to_string(),
        stage,
        source,
    })
}

fn open_read_write(path: &str, baud: u32) -> std::result::Result<TTYPort, Opened> {
    serialport::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_QUIET)
        .open_native()
        .map_err(|e| {
            let unreachable = !Path::new(path).exists()
                || matches!(
                    e.kind(),
                    serialport::ErrorKind::NoDevice
                        | serialport::ErrorKind::Io(io::ErrorKind::NotFound)
                        | serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied)
                );
            if unreachable {
                Opened::Unreachable(e.into())
            } else {
                config_error(path, "configure", e.into())
            }
        })
}

fn open_one_way(path: &str, baud: u32, mode: OpenMode) -> std::result::Result<TTYPort, Opened> {
    let file = mode.options().open(path).map_err(Opened::Unreachable)?;
    make_raw(&file).map_err(|(stage, e)| config_error(path, stage, e))?;

    // SAFETY: the descriptor was just released by `file`, so the port is its only owner.
    let mut port = unsafe { TTYPort::from_raw_fd(file.into_raw_fd()) };
    apply_line(&mut port, baud).map_err(|e| config_error(path, "configure", e.into()))?;
    Ok(port)
}

/// Raw mode for a descriptor `serialport` did not open itself
fn make_raw(file: &File) -> std::result::Result<(), (&'static str, io::Error)> {
    let fd = file.as_raw_fd();
    let mut tty: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tty) } != 0 {
        return Err(("get", io::Error::last_os_error()));
    }
    unsafe { libc::cfmakeraw(&mut tty) };
    tty.c_cflag |= libc::CREAD | libc::CLOCAL;
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tty) } != 0 {
        return Err(("set", io::Error::last_os_error()));
    }
    Ok(())
}

fn apply_line(port: &mut TTYPort, baud: u32) -> serialport::Result<()> {
    port.set_baud_rate(baud)?;
    port.set_data_bits(DataBits::Eight)?;
    port.set_parity(Parity::None)?;
    port.set_stop_bits(StopBits::One)?;
    port.set_flow_control(FlowControl::None)?;
    port.set_timeout(READ_QUIET)
}

/// `EVIOCGNAME(len)` ioctl request number
fn eviocgname(len: usize) -> libc::c_ulong {
    const IOC_READ: libc::c_ulong = 2;
    (IOC_READ << 30) | ((len as libc::c_ulong) << 16) | ((b'E' as libc::c_ulong) << 8) | 0x06
}

fn input_device_name(file: &File) -> Option<String> {
    let mut name = [0u8; 256];
    let ret = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            eviocgname(name.len()) as _,
            name.as_mut_ptr(),
        )
    };
    if ret < 0 {
        return None;
    }
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    Some(String::from_utf8_lossy(&name[..end]).into_owned())
}

fn find_input_device(wanted: &str) -> Option<File> {
    debug!(name = wanted, "Scanning input devices");
    (0..INPUT_EVENT_SCAN).find_map(|i| {
        let node = format!("/dev/input/event{i}");
        let file = OpenOptions::new().read(true).write(true).open(&node).ok()?;
        match input_device_name(&file) {
            Some(name) if name == wanted => {
                info!(node = %node, name = %name, "Adopted input device");
                Some(file)
            }
            _ => None,
        }
    })
}

impl Client for SerialClient {
    fn mode(&self) -> Mode {
        self.core.mode()
    }

    fn label(&self) -> String {
        self.core.label()
    }

    fn open(&self, address: &str, option: u32, flags: i32) -> Result<()> {
        self.open_port(address, option, OpenMode::from_flags(flags))
    }

    fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }

    fn read(&self, buf: &mut [u8], has_crc: bool, read_until: bool) -> Result<usize> {
        self.core
            .read_frame(buf, has_crc, read_until, ZeroRead::Retry, |line, chunk| {
                line.read(chunk)
            })
    }

    fn write(&self, data: &[u8], add_crc: bool) -> Result<usize> {
        self.core
            .write_frame(data, add_crc, |line, frame| line.write(frame))
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}

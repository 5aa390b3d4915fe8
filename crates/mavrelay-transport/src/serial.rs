use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, TransportError};
use crate::traits::{Transport, TransportKind};

/// A serial device in raw, non-blocking mode.
#[derive(Debug)]
pub struct SerialTransport {
    file: File,
    path: PathBuf,
    baudrate: u32,
}

impl SerialTransport {
    /// Open `path` at `baudrate` without hardware flow control.
    pub fn open(path: impl AsRef<Path>, baudrate: u32) -> Result<Self> {
        Self::open_with_flow_control(path, baudrate, false)
    }

    /// Open `path` at `baudrate`, optionally enabling RTS/CTS flow control.
    pub fn open_with_flow_control(
        path: impl AsRef<Path>,
        baudrate: u32,
        flow_control: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let speed = speed_for(baudrate).ok_or(TransportError::UnsupportedBaudrate(baudrate))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&path)
            .map_err(|source| TransportError::Open {
                path: path.clone(),
                source,
            })?;

        configure_raw(file.as_raw_fd(), speed, flow_control).map_err(|source| {
            TransportError::Configure {
                path: path.clone(),
                source,
            }
        })?;

        info!(?path, baudrate, flow_control, "opened serial device");

        Ok(Self {
            file,
            path,
            baudrate,
        })
    }

    /// Device path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured baud rate.
    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }
}

impl AsRawFd for SerialTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }

    fn write_raw(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn peer(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}

fn configure_raw(fd: RawFd, speed: libc::speed_t, flow_control: bool) -> std::io::Result<()> {
    // SAFETY: termios is a plain C struct; all-zero is a valid value that
    // tcgetattr overwrites before use.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is an open descriptor owned by the caller and `tio` is a
    // valid writable termios.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: `tio` is a valid termios obtained from tcgetattr.
    unsafe { libc::cfmakeraw(&mut tio) };

    tio.c_cflag |= libc::CLOCAL | libc::CREAD;
    if flow_control {
        tio.c_cflag |= libc::CRTSCTS;
    } else {
        tio.c_cflag &= !libc::CRTSCTS;
    }
    tio.c_cc[libc::VMIN] = 0;
    tio.c_cc[libc::VTIME] = 0;

    // SAFETY: `tio` is a valid termios; speed comes from the libc constant table.
    let rc = unsafe {
        libc::cfsetispeed(&mut tio, speed) | libc::cfsetospeed(&mut tio, speed)
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: `fd` is open and `tio` is fully initialized.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // Discard anything queued before we took over the line.
    // SAFETY: `fd` is an open terminal descriptor.
    if unsafe { libc::tcflush(fd, libc::TCIOFLUSH) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

fn speed_for(baudrate: u32) -> Option<libc::speed_t> {
    let speed = match baudrate {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        #[cfg(target_os = "linux")]
        460800 => libc::B460800,
        #[cfg(target_os = "linux")]
        500000 => libc::B500000,
        #[cfg(target_os = "linux")]
        921600 => libc::B921600,
        #[cfg(target_os = "linux")]
        1000000 => libc::B1000000,
        #[cfg(target_os = "linux")]
        1500000 => libc::B1500000,
        #[cfg(target_os = "linux")]
        2000000 => libc::B2000000,
        #[cfg(target_os = "linux")]
        3000000 => libc::B3000000,
        #[cfg(target_os = "linux")]
        4000000 => libc::B4000000,
        _ => return None,
    };
    Some(speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_baudrate() {
        let result = SerialTransport::open("/dev/null", 12345);
        assert!(matches!(
            result,
            Err(TransportError::UnsupportedBaudrate(12345))
        ));
    }

    #[test]
    fn test_missing_device() {
        let result = SerialTransport::open("/dev/mavrelay-does-not-exist", 57600);
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    #[test]
    fn test_non_terminal_rejected() {
        // /dev/null opens fine but is not a tty, so tcgetattr fails.
        let result = SerialTransport::open("/dev/null", 57600);
        assert!(matches!(result, Err(TransportError::Configure { .. })));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_pseudo_terminal_roundtrip() {
        use std::ffi::CStr;
        use std::os::fd::FromRawFd;

        // SAFETY: plain libc calls on a freshly allocated pty master.
        let master = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY) };
        assert!(master >= 0, "posix_openpt failed");
        // SAFETY: `master` is a valid pty master descriptor.
        unsafe {
            assert_eq!(libc::grantpt(master), 0);
            assert_eq!(libc::unlockpt(master), 0);
        }
        let mut name = [0 as libc::c_char; 128];
        // SAFETY: `name` is a writable buffer of the given length.
        let rc = unsafe { libc::ptsname_r(master, name.as_mut_ptr(), name.len()) };
        assert_eq!(rc, 0);
        // SAFETY: ptsname_r wrote a NUL-terminated path into `name`.
        let slave_path = unsafe { CStr::from_ptr(name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        // SAFETY: `master` is owned by this test from here on.
        let mut master = unsafe { File::from_raw_fd(master) };

        let mut serial = SerialTransport::open(&slave_path, 57600).unwrap();
        assert_eq!(serial.kind(), TransportKind::Serial);
        assert_eq!(serial.baudrate(), 57600);

        master.write_all(b"\xfe\x09telemetry").unwrap();

        let mut buf = [0u8; 32];
        let mut got = 0;
        for _ in 0..100 {
            match serial.read_raw(&mut buf[got..]) {
                Ok(n) => got += n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("unexpected read error: {err}"),
            }
            if got >= 11 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(&buf[..got], b"\xfe\x09telemetry");
    }
}

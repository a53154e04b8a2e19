//! Opens a tty with the quirks Marlin-family firmware expects: exclusive
//! access, no DTR pulse on reopen, and clean buffers to start from.

use std::time::Duration;

use tokio_serial::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortBuilderExt, StopBits};

use crate::error::Error;

/// An open serial connection to a printer.
pub type Port = tokio_serial::SerialStream;

/// Opens `path` at `baud`, 8N1, and applies the reconnect-friendly quirks
/// described by the adapter's contract.
///
/// - Exclusive access (`TIOCEXCL`) is requested fail-soft: if the platform or
///   kernel refuses it, that's logged and ignored rather than treated as a
///   fatal open error.
/// - `HUPCL` is cleared on the raw termios so that closing and reopening the
///   port does not toggle DTR, which would otherwise reset an AVR bootloader
///   on every reconnect attempt.
/// - Both buffers are flushed once the port is open.
pub fn open(path: &str, baud: u32) -> Result<Port, Error> {
    let mut port = tokio_serial::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .open_native_async()?;

    if let Err(e) = port.set_exclusive(true) {
        tracing::debug!("could not request exclusive access on {path}: {e}");
    }

    clear_hupcl(&port, path);

    if let Err(e) = port.clear(ClearBuffer::All) {
        tracing::debug!("could not flush buffers on {path}: {e}");
    }

    Ok(port)
}

#[cfg(unix)]
fn clear_hupcl(port: &Port, path: &str) {
    use std::os::unix::io::AsRawFd;

    use nix::sys::termios::{tcgetattr, tcsetattr, ControlFlags, SetArg};

    let fd = port.as_raw_fd();
    match tcgetattr(fd) {
        Ok(mut term) => {
            if term.control_flags.contains(ControlFlags::HUPCL) {
                term.control_flags.remove(ControlFlags::HUPCL);
                if let Err(e) = tcsetattr(fd, SetArg::TCSANOW, &term) {
                    tracing::debug!("could not clear HUPCL on {path}: {e}");
                }
            }
        }
        Err(e) => tracing::debug!("could not read termios for {path}: {e}"),
    }
}

#[cfg(not(unix))]
fn clear_hupcl(_port: &Port, _path: &str) {
    // HUPCL is a POSIX termios concept; non-unix targets have no DTR-on-reopen
    // behavior to guard against here.
}

/// How long a command waits for a reply before the link is declared dead.
pub const DATA_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the supervisor waits between failed connection attempts.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(1);

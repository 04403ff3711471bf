//! The serial transport contract.
//!
//! The driver never assumes a concrete transport. It only needs an open
//! byte-stream with modem control lines and a configurable baud rate; how
//! that stream is backed (a real USB-CDC serial port, a Unix PTY, a test
//! double) is a concern for the caller. See `SerialTransport` (behind the
//! `serial` feature) for the real-world implementation, and `MockTransport`
//! (test-only) for a scripted in-memory double.
//!
//! [`Reader`](crate::reader::Reader) needs to own a read handle on a
//! background thread while the command layer independently writes outbound
//! frames, so a `Transport` must be splittable into two handles over the
//! same underlying connection via [`Transport::try_clone`] — the same shape
//! real serial port libraries expose (a duplicated file descriptor/handle).

use std::io;
use std::time::Duration;

/// Required of any backing serial connection used by [`crate::reader::Reader`]
/// and [`crate::loader::Loader`].
pub trait Transport: Send + 'static {
    /// Pull up to `buf.len()` bytes. Returns `Ok(0)` on a benign "nothing
    /// available within the timeout" condition, mirroring a blocking read
    /// that simply timed out.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the entire buffer.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush any buffered output.
    fn flush(&mut self) -> io::Result<()>;

    /// Drive the DTR / RTS / BREAK modem control lines. `None` leaves a line
    /// untouched.
    fn set_signals(
        &mut self,
        dtr: Option<bool>,
        rts: Option<bool>,
        brk: Option<bool>,
    ) -> io::Result<()>;

    /// Change the baud rate of the underlying connection.
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;

    /// Current baud rate.
    fn baud_rate(&self) -> io::Result<u32>;

    /// Bound how long a call to [`Transport::read`] may block.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Produce an independent handle onto the same underlying connection, so
    /// the reader thread and the command layer can each hold one without
    /// contending on a single `&mut self`.
    fn try_clone(&self) -> io::Result<Box<dyn Transport>>;
}

#[cfg(feature = "serial")]
pub use real::SerialTransport;

#[cfg(feature = "serial")]
mod real {
    use super::Transport;
    use serialport::SerialPort;
    use std::io;
    use std::time::Duration;

    /// A [`Transport`] backed by a real USB-CDC serial port via `serialport`.
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
    }

    impl SerialTransport {
        /// Open `path` at 115200 baud (the ROM bootloader's fixed initial rate).
        pub fn open(path: &str) -> io::Result<Self> {
            let port = serialport::new(path, crate::command::ESP_ROM_BAUD)
                .timeout(Duration::from_secs(3))
                .open()
                .map_err(io::Error::other)?;
            Ok(SerialTransport { port })
        }
    }

    impl Transport for SerialTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e),
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            io::Write::write_all(&mut self.port, buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            io::Write::flush(&mut self.port)
        }

        fn set_signals(
            &mut self,
            dtr: Option<bool>,
            rts: Option<bool>,
            _brk: Option<bool>,
        ) -> io::Result<()> {
            if let Some(dtr) = dtr {
                self.port
                    .write_data_terminal_ready(dtr)
                    .map_err(io::Error::other)?;
            }
            if let Some(rts) = rts {
                self.port
                    .write_request_to_send(rts)
                    .map_err(io::Error::other)?;
            }
            Ok(())
        }

        fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
            self.port.set_baud_rate(baud).map_err(io::Error::other)
        }

        fn baud_rate(&self) -> io::Result<u32> {
            self.port.baud_rate().map_err(io::Error::other)
        }

        fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
            self.port.set_timeout(timeout).map_err(io::Error::other)
        }

        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            let cloned = self.port.try_clone().map_err(io::Error::other)?;
            Ok(Box::new(SerialTransport { port: cloned }))
        }
    }
}

#[cfg(test)]
pub use mock::MockTransport;

#[cfg(test)]
mod mock {
    use super::Transport;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Inner {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        dtr: Option<bool>,
        rts: Option<bool>,
        baud: u32,
    }

    /// A scripted in-memory [`Transport`] for tests: bytes pushed onto
    /// `inbound` are handed back by `read`, and everything written is
    /// captured in `outbound` for assertions. Cloning (via `try_clone` or
    /// `clone_handle`) shares the same underlying state, mirroring a
    /// duplicated serial port handle.
    #[derive(Clone)]
    pub struct MockTransport {
        inner: Arc<Mutex<Inner>>,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            MockTransport::new()
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            MockTransport {
                inner: Arc::new(Mutex::new(Inner {
                    baud: 115200,
                    ..Default::default()
                })),
            }
        }

        pub fn push_inbound(&self, bytes: &[u8]) {
            self.inner.lock().unwrap().inbound.extend(bytes);
        }

        pub fn take_outbound(&self) -> Vec<u8> {
            std::mem::take(&mut self.inner.lock().unwrap().outbound)
        }

        pub fn dtr(&self) -> Option<bool> {
            self.inner.lock().unwrap().dtr
        }

        pub fn rts(&self) -> Option<bool> {
            self.inner.lock().unwrap().rts
        }

        pub fn clone_handle(&self) -> MockTransport {
            self.clone()
        }
    }

    impl Transport for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            let mut n = 0;
            while n < buf.len() {
                match inner.inbound.pop_front() {
                    Some(byte) => {
                        buf[n] = byte;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.inner.lock().unwrap().outbound.extend_from_slice(buf);
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn set_signals(
            &mut self,
            dtr: Option<bool>,
            rts: Option<bool>,
            _brk: Option<bool>,
        ) -> io::Result<()> {
            let mut inner = self.inner.lock().unwrap();
            if let Some(dtr) = dtr {
                inner.dtr = Some(dtr);
            }
            if let Some(rts) = rts {
                inner.rts = Some(rts);
            }
            Ok(())
        }

        fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
            self.inner.lock().unwrap().baud = baud;
            Ok(())
        }

        fn baud_rate(&self) -> io::Result<u32> {
            Ok(self.inner.lock().unwrap().baud)
        }

        fn set_read_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
            Ok(())
        }

        fn try_clone(&self) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(self.clone()))
        }
    }
}

//! Background byte demultiplexer.
//!
//! A dedicated thread owns the transport's read half for as long as the
//! reader is running and is the only thing that ever calls
//! [`Transport::read`]. Bytes are only retained in the shared buffer while
//! at least one [`ListenGuard`] is alive; this is what lets the command
//! layer register interest in a response *before* writing the request
//! without racing the reader thread. See the module-level note in
//! `transport.rs` for why the transport needs to be cloned rather than
//! shared by reference: this thread needs to own a read handle outright.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::transport::Transport;

const CHUNK_SIZE: usize = 1024;
const PACKET_RETRY_CAP: u32 = 1000;

struct State {
    buffer: Buffer,
    listen_ref: usize,
    running: bool,
    closing: bool,
    reading: bool,
    error: Option<Error>,
}

impl State {
    fn new() -> Self {
        State {
            buffer: Buffer::new(),
            listen_ref: 0,
            running: false,
            closing: false,
            reading: false,
            error: None,
        }
    }
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

/// Owns the inbound half of a [`Transport`] on a background thread.
pub struct Reader {
    shared: Arc<Shared>,
    transport_slot: Arc<Mutex<Option<Box<dyn Transport>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps a [`Reader`] appending inbound bytes to its buffer for as long as
/// it is alive. Dropping the last guard resets the buffer so stale bytes
/// from a prior exchange can't bleed into the next one.
pub struct ListenGuard {
    shared: Arc<Shared>,
}

impl Drop for ListenGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.listen_ref = state.listen_ref.saturating_sub(1);
        if state.listen_ref == 0 {
            state.buffer.clear();
        }
    }
}

/// Held for the duration of a blocking `read`/`packet`/`wait_silent` call so
/// a second call on the same reader fails fast instead of racing the first
/// one's view of the buffer.
struct ReadingGuard {
    shared: Arc<Shared>,
}

impl Drop for ReadingGuard {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().reading = false;
    }
}

impl Reader {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Reader {
            shared: Arc::new(Shared {
                state: Mutex::new(State::new()),
                condvar: Condvar::new(),
            }),
            transport_slot: Arc::new(Mutex::new(Some(transport))),
            handle: Mutex::new(None),
        }
    }

    /// Begin pulling bytes on a background thread. Fails if already running.
    pub fn start(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.running {
            return Err(Error::AlreadyRunning);
        }
        let mut transport = self
            .transport_slot
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyRunning)?;

        state.running = true;
        state.closing = false;
        state.error = None;
        drop(state);

        let shared = self.shared.clone();
        let slot = self.transport_slot.clone();
        let join = thread::spawn(move || {
            let mut chunk = [0u8; CHUNK_SIZE];
            loop {
                if shared.state.lock().unwrap().closing {
                    break;
                }
                match transport.read(&mut chunk) {
                    Ok(0) => thread::sleep(Duration::from_millis(1)),
                    Ok(n) => {
                        let mut state = shared.state.lock().unwrap();
                        if state.closing {
                            break;
                        }
                        if state.listen_ref > 0 {
                            state.buffer.push(&chunk[..n]);
                        }
                        shared.condvar.notify_all();
                    }
                    Err(e) if is_transient(&e) => continue,
                    Err(e) => {
                        let mut state = shared.state.lock().unwrap();
                        state.error = Some(Error::Io(e));
                        state.running = false;
                        shared.condvar.notify_all();
                        break;
                    }
                }
            }
            *slot.lock().unwrap() = Some(transport);
            let mut state = shared.state.lock().unwrap();
            state.running = false;
            shared.condvar.notify_all();
        });

        *self.handle.lock().unwrap() = Some(join);
        Ok(())
    }

    /// Signal shutdown, join the background thread and return whatever
    /// error it ended on, if any. Always succeeds as far as the caller is
    /// concerned: stopping is not itself a fallible operation.
    pub fn stop(&self) -> Option<Error> {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.closing = true;
        }
        self.shared.condvar.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        let mut state = self.shared.state.lock().unwrap();
        state.running = false;
        state.error.take()
    }

    /// Register interest in inbound bytes. Bytes arriving before any guard
    /// exists are silently discarded by the background thread.
    pub fn listen(&self) -> Result<ListenGuard> {
        let mut state = self.shared.state.lock().unwrap();
        if !state.running {
            return Err(Error::NotRunning);
        }
        state.listen_ref += 1;
        Ok(ListenGuard {
            shared: self.shared.clone(),
        })
    }

    /// Mark a blocking read operation as in progress, failing fast if
    /// another one is already running on this reader.
    fn begin_reading(&self) -> Result<ReadingGuard> {
        let mut state = self.shared.state.lock().unwrap();
        if state.reading {
            return Err(Error::ReadAlreadyInProgress);
        }
        state.reading = true;
        Ok(ReadingGuard {
            shared: self.shared.clone(),
        })
    }

    /// Repeatedly clear the buffer and wait for any byte to arrive,
    /// treating a clean timeout with no data as a successful "line is
    /// quiet" result.
    pub fn wait_silent(&self, retries: u32, timeout: Duration) -> Result<bool> {
        let _reading = self.begin_reading()?;
        let _guard = self.listen()?;
        for _ in 0..retries.max(1) {
            let mut state = self.shared.state.lock().unwrap();
            state.buffer.clear();
            let (mut state, result) = self
                .shared
                .condvar
                .wait_timeout_while(state, timeout, |s| s.buffer.is_empty() && s.error.is_none())
                .unwrap();
            if let Some(err) = state.error.take() {
                return Err(err);
            }
            if result.timed_out() && state.buffer.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Wait until at least `min_len` bytes are buffered, then snapshot and
    /// clear the buffer. Requires an active listener.
    pub fn read(&self, min_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let _reading = self.begin_reading()?;
        let mut state = self.wait_for_len(min_len, timeout)?;
        let data = state.buffer.view().to_vec();
        state.buffer.clear();
        Ok(data)
    }

    /// Wait until at least `min_len` bytes are buffered, then extract one
    /// SLIP packet, retrying as more bytes trickle in up to a fixed
    /// iteration cap. Requires an active listener.
    pub fn packet(&self, min_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let _reading = self.begin_reading()?;
        let deadline = Instant::now() + timeout;
        let mut state = self.wait_for_len(min_len, timeout)?;

        for _ in 0..PACKET_RETRY_CAP {
            if let Some(packet) = state.buffer.packet() {
                return Ok(packet);
            }
            let current_len = state.buffer.len();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            let (next_state, result) = self
                .shared
                .condvar
                .wait_timeout_while(state, remaining, |s| {
                    s.buffer.len() <= current_len && s.error.is_none()
                })
                .unwrap();
            state = next_state;
            if let Some(err) = state.error.take() {
                return Err(err);
            }
            if result.timed_out() && state.buffer.len() <= current_len {
                return Err(Error::Timeout);
            }
        }
        Err(Error::Timeout)
    }

    fn wait_for_len(
        &self,
        min_len: usize,
        timeout: Duration,
    ) -> Result<std::sync::MutexGuard<'_, State>> {
        let state = self.shared.state.lock().unwrap();
        if state.listen_ref == 0 {
            return Err(Error::NotListening);
        }
        let (mut state, result) = self
            .shared
            .condvar
            .wait_timeout_while(state, timeout, |s| {
                s.buffer.len() < min_len && s.error.is_none()
            })
            .unwrap();
        if let Some(err) = state.error.take() {
            return Err(err);
        }
        if result.timed_out() && state.buffer.len() < min_len {
            return Err(Error::Timeout);
        }
        Ok(state)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use pretty_assertions::assert_eq;

    fn started() -> (Reader, MockTransport) {
        let transport = MockTransport::new();
        let reader = Reader::new(Box::new(transport.clone_handle()));
        reader.start().unwrap();
        (reader, transport)
    }

    #[test]
    fn start_twice_fails_with_already_running() {
        let (reader, _transport) = started();
        assert!(matches!(reader.start(), Err(Error::AlreadyRunning)));
        reader.stop();
    }

    #[test]
    fn bytes_before_any_listener_are_discarded() {
        let (reader, transport) = started();
        transport.push_inbound(b"stale");
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            reader.read(1, Duration::from_millis(50)),
            Err(Error::NotListening)
        ));
        reader.stop();
    }

    #[test]
    fn read_waits_for_minimum_length_then_clears_buffer() {
        let (reader, transport) = started();
        let guard = reader.listen().unwrap();
        transport.push_inbound(&[1, 2, 3]);
        let data = reader.read(3, Duration::from_millis(500)).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert!(matches!(
            reader.read(1, Duration::from_millis(20)),
            Err(Error::Timeout)
        ));
        drop(guard);
        reader.stop();
    }

    #[test]
    fn dropping_last_guard_resets_buffer() {
        let (reader, transport) = started();
        let guard = reader.listen().unwrap();
        transport.push_inbound(&[9, 9, 9]);
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        let guard = reader.listen().unwrap();
        assert!(matches!(
            reader.read(1, Duration::from_millis(20)),
            Err(Error::Timeout)
        ));
        drop(guard);
        reader.stop();
    }

    #[test]
    fn wait_silent_succeeds_on_clean_timeout() {
        let (reader, _transport) = started();
        assert_eq!(reader.wait_silent(3, Duration::from_millis(20)).unwrap(), true);
        reader.stop();
    }

    #[test]
    fn wait_silent_fails_when_data_keeps_arriving() {
        let (reader, transport) = started();
        transport.push_inbound(&[1]);
        assert_eq!(
            reader.wait_silent(2, Duration::from_millis(30)).unwrap(),
            false
        );
        reader.stop();
    }

    #[test]
    fn packet_extracts_one_slip_frame_from_buffered_bytes() {
        let (reader, transport) = started();
        let guard = reader.listen().unwrap();
        transport.push_inbound(&[0xC0, 1, 2, 3, 0xC0]);
        let packet = reader.packet(2, Duration::from_millis(500)).unwrap();
        assert_eq!(packet, vec![1, 2, 3]);
        drop(guard);
        reader.stop();
    }

    #[test]
    fn concurrent_read_calls_fail_fast_with_read_already_in_progress() {
        let (reader, _transport) = started();
        let guard = reader.listen().unwrap();
        thread::scope(|scope| {
            let first = scope.spawn(|| reader.read(5, Duration::from_millis(200)));
            thread::sleep(Duration::from_millis(20));
            let second = reader.packet(5, Duration::from_millis(20));
            assert!(matches!(second, Err(Error::ReadAlreadyInProgress)));
            assert!(matches!(first.join().unwrap(), Err(Error::Timeout)));
        });
        drop(guard);
        reader.stop();
    }

    #[test]
    fn stop_is_idempotent_and_allows_restart() {
        let (reader, _transport) = started();
        assert!(reader.stop().is_none());
        reader.start().unwrap();
        assert!(reader.stop().is_none());
    }
}

//! In-memory transport
//!
//! [`MemoryTransport`] is handed to the engine, [`MemoryDevice`] stays with
//! the caller and plays the device: it sees every line the host wrote and
//! injects status lines, either by hand or through a responder closure.
//! Used by tests and dry runs.

use super::{ConnectionParams, Transport};
use gcodestream_core::TransportError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Produces device replies for each line the host writes
pub type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct DeviceState {
    open: bool,
    hung_up: bool,
    fail_next_open: bool,
    fail_writes: bool,
    greeting: Vec<String>,
    to_host: VecDeque<String>,
    from_host: Vec<String>,
    responder: Option<Responder>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<DeviceState>,
    changed: Condvar,
}

/// Host side of an in-memory link
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Device side of an in-memory link
#[derive(Clone)]
pub struct MemoryDevice {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    /// Create a connected transport/device pair
    pub fn pair() -> (MemoryTransport, MemoryDevice) {
        let shared = Arc::new(Shared::default());
        (
            MemoryTransport {
                shared: shared.clone(),
            },
            MemoryDevice { shared },
        )
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, params: &ConnectionParams) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock();
        if state.fail_next_open {
            state.fail_next_open = false;
            return Err(TransportError::OpenFailed {
                path: params.port.clone(),
                reason: "device refused the connection".to_string(),
            });
        }

        state.open = true;
        state.hung_up = false;
        state.to_host.clear();
        let greeting = state.greeting.clone();
        state.to_host.extend(greeting);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if state.fail_writes {
            return Err(TransportError::io("write failed"));
        }

        let text = String::from_utf8_lossy(line).to_string();
        if let Some(responder) = state.responder.as_mut() {
            let replies = responder(&text);
            state.to_host.extend(replies);
        }
        state.from_host.push(text);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            if let Some(line) = state.to_host.pop_front() {
                return Ok(Some(line));
            }
            if state.hung_up {
                return Err(TransportError::Closed {
                    reason: "device hung up".to_string(),
                });
            }
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Ok(state.to_host.pop_front());
            }
        }
    }

    fn close(&mut self) {
        let mut state = self.shared.state.lock();
        state.open = false;
        self.shared.changed.notify_all();
    }

    fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl MemoryDevice {
    /// Queue a status line for the host
    pub fn send(&self, line: impl Into<String>) {
        let mut state = self.shared.state.lock();
        state.to_host.push_back(line.into());
        self.shared.changed.notify_all();
    }

    /// Lines queued by the device every time the host opens the link
    pub fn set_greeting<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared.state.lock().greeting = lines.into_iter().map(Into::into).collect();
    }

    /// Reply to every host line through `responder`
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.shared.state.lock().responder = Some(Box::new(responder));
    }

    /// Answer every host line with a bare `ok`
    pub fn acknowledge_all(&self) {
        self.set_responder(|_| vec!["ok".to_string()]);
    }

    /// Stop replying automatically
    pub fn clear_responder(&self) {
        self.shared.state.lock().responder = None;
    }

    /// Make the next `open` fail
    pub fn fail_next_open(&self) {
        self.shared.state.lock().fail_next_open = true;
    }

    /// Make writes fail until cleared
    pub fn fail_writes(&self, fail: bool) {
        self.shared.state.lock().fail_writes = fail;
    }

    /// Close the device end; pending lines are still delivered first
    pub fn hang_up(&self) {
        let mut state = self.shared.state.lock();
        state.hung_up = true;
        self.shared.changed.notify_all();
    }

    /// Whether the host currently has the link open
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    /// Every line the host wrote, in order
    pub fn sent(&self) -> Vec<String> {
        self.shared.state.lock().from_host.clone()
    }

    /// Only the numbered lines the host wrote
    pub fn sent_numbered(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|line| line.starts_with('N'))
            .collect()
    }

    /// Wait until the host has written at least `count` lines
    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.from_host.len() < count {
            if self
                .shared
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.from_host.len() >= count;
            }
        }
        true
    }

    /// Async variant of [`MemoryDevice::wait_for_sent`]
    pub async fn wait_for_sent_async(&self, count: usize, timeout: Duration) -> bool {
        let device = self.clone();
        tokio::task::spawn_blocking(move || device.wait_for_sent(count, timeout))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_reply() {
        let (mut transport, device) = MemoryTransport::pair();
        device.acknowledge_all();
        transport.open(&ConnectionParams::default()).unwrap();

        transport.write_line(b"N1 G28*18").unwrap();
        assert_eq!(device.sent(), vec!["N1 G28*18".to_string()]);
        assert_eq!(
            transport.read_line(Duration::from_millis(10)).unwrap().as_deref(),
            Some("ok")
        );
        assert_eq!(transport.read_line(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_greeting_on_open() {
        let (mut transport, device) = MemoryTransport::pair();
        device.set_greeting(["start", "echo:Marlin"]);
        transport.open(&ConnectionParams::default()).unwrap();
        assert_eq!(
            transport.read_line(Duration::from_millis(10)).unwrap().as_deref(),
            Some("start")
        );
    }

    #[test]
    fn test_failures() {
        let (mut transport, device) = MemoryTransport::pair();
        assert_eq!(transport.write_line(b"M105"), Err(TransportError::NotOpen));

        device.fail_next_open();
        assert!(matches!(
            transport.open(&ConnectionParams::default()),
            Err(TransportError::OpenFailed { .. })
        ));
        transport.open(&ConnectionParams::default()).unwrap();

        device.fail_writes(true);
        assert!(matches!(
            transport.write_line(b"M105"),
            Err(TransportError::Io { .. })
        ));

        device.send("ok");
        device.hang_up();
        assert_eq!(
            transport.read_line(Duration::from_millis(10)).unwrap().as_deref(),
            Some("ok")
        );
        assert!(matches!(
            transport.read_line(Duration::from_millis(10)),
            Err(TransportError::Closed { .. })
        ));
    }

    #[test]
    fn test_read_wakes_on_send() {
        let (mut transport, device) = MemoryTransport::pair();
        transport.open(&ConnectionParams::default()).unwrap();

        let sender = device.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.send("ok N1");
        });

        let line = transport.read_line(Duration::from_secs(2)).unwrap();
        assert_eq!(line.as_deref(), Some("ok N1"));
        handle.join().unwrap();
    }
}

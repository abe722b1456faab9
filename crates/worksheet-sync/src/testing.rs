//! Scripted transport and virtual clock for driving a session without a
//! server or real timers.
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.respond(Command::Eval, r#"{"id":5}"#);
//! transport.respond(Command::CellUpdate, r#"{"id":5,"status":"d","output":"4"}"#);
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::protocol::{Command, Params};
use crate::transport::{Transport, TransportError};

type Responder = Arc<dyn Fn(&Params) -> Result<String, TransportError> + Send + Sync>;

enum Scripted {
    Body(String),
    Failure(String),
}

#[derive(Default)]
struct MockState {
    queued: HashMap<Command, VecDeque<Scripted>>,
    fallback: HashMap<Command, Responder>,
    requests: Vec<RecordedRequest>,
}

/// A request observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub command: Command,
    pub params: Params,
}

/// In-memory transport answering from per-command scripts.
///
/// Queued responses are consumed in order; once a command's queue is empty
/// its fallback (if any) answers. A request with neither fails with
/// [`TransportError::Unscripted`]. Every request is recorded.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one response body for `command`.
    pub fn respond(&self, command: Command, body: impl Into<String>) -> &Self {
        self.lock()
            .queued
            .entry(command)
            .or_default()
            .push_back(Scripted::Body(body.into()));
        self
    }

    /// Queue one transport failure for `command`.
    pub fn fail(&self, command: Command, message: impl Into<String>) -> &Self {
        self.lock()
            .queued
            .entry(command)
            .or_default()
            .push_back(Scripted::Failure(message.into()));
        self
    }

    /// Answer `command` with `body` whenever nothing is queued for it.
    pub fn respond_always(&self, command: Command, body: impl Into<String>) -> &Self {
        let body = body.into();
        self.respond_with(command, move |_| Ok(body.clone()))
    }

    /// Answer `command` by calling `responder` whenever nothing is queued.
    pub fn respond_with<F>(&self, command: Command, responder: F) -> &Self
    where
        F: Fn(&Params) -> Result<String, TransportError> + Send + Sync + 'static,
    {
        self.lock().fallback.insert(command, Arc::new(responder));
        self
    }

    /// Fail `command` whenever nothing is queued for it.
    pub fn fail_always(&self, command: Command) -> &Self {
        self.respond_with(command, |_| {
            Err(TransportError::Failed("connection refused".into()))
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Commands in the order they were issued.
    pub fn commands(&self) -> Vec<Command> {
        self.lock().requests.iter().map(|r| r.command).collect()
    }

    pub fn count(&self, command: Command) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.command == command)
            .count()
    }

    /// Whether every queued response has been consumed.
    pub fn exhausted(&self) -> bool {
        self.lock().queued.values().all(|q| q.is_empty())
    }

    fn answer(&self, command: Command, params: Params) -> Result<String, TransportError> {
        let mut state = self.lock();
        state.requests.push(RecordedRequest {
            command,
            params: params.clone(),
        });

        if let Some(scripted) = state.queued.get_mut(&command).and_then(|q| q.pop_front()) {
            return match scripted {
                Scripted::Body(body) => Ok(body),
                Scripted::Failure(message) => Err(TransportError::Failed(message)),
            };
        }

        let responder = state.fallback.get(&command).cloned();
        drop(state);
        match responder {
            Some(responder) => responder(&params),
            None => Err(TransportError::Unscripted(command)),
        }
    }
}

impl Transport for MockTransport {
    fn request(
        &self,
        command: Command,
        params: Params,
    ) -> impl Future<Output = Result<String, TransportError>> + Send {
        std::future::ready(self.answer(command, params))
    }
}

struct ClockState {
    base: Instant,
    offset: Duration,
    sleeps: Vec<Duration>,
}

/// Virtual clock: `sleep` advances time instantly and records the duration.
#[derive(Clone)]
pub struct ManualClock {
    state: Arc<Mutex<ClockState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                base: Instant::now(),
                offset: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move virtual time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.lock().offset += duration;
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.lock().offset
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.lock();
        state.base + state.offset
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        {
            let mut state = self.lock();
            state.offset += duration;
            state.sleeps.push(duration);
        }
        std::future::ready(())
    }
}

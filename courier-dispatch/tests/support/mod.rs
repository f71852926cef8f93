//! Scripted collaborators for dispatch tests
//!
//! - [`MockClientFactory`] hands out protocol clients that answer from a
//!   shared script (per-recipient reply queues, session open failures) and
//!   record what they were asked to do
//! - [`RecordingSink`] keeps every progress record in memory and can be told
//!   to fail
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{
    collections::VecDeque,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use courier_common::Domain;
use courier_dispatch::{
    BatchHandle, BatchResult, ClientFactory, DispatchError, EnvelopeStep, MessageContent,
    PersistenceError, ProgressRecord, ProtocolClient, Response, ResultSink, SessionOpenError,
    TransportError,
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
struct Script {
    open_failures: Mutex<VecDeque<SessionOpenError>>,
    rcpt_replies: Mutex<AHashMap<String, VecDeque<u16>>>,
    payload_replies: Mutex<VecDeque<u16>>,
    gate: Option<Arc<Semaphore>>,
    sessions: Mutex<Vec<(Domain, IpAddr)>>,
    rcpt_attempts: Mutex<AHashMap<String, usize>>,
    payloads: AtomicUsize,
}

/// Factory for scripted protocol clients
///
/// Every reply not scripted is a 250.
#[derive(Debug, Clone, Default)]
pub struct MockClientFactory {
    script: Arc<Script>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block every payload transfer until [`Self::release`] is called
    pub fn gated() -> Self {
        Self {
            script: Arc::new(Script {
                gate: Some(Arc::new(Semaphore::new(0))),
                ..Script::default()
            }),
        }
    }

    /// Let `n` blocked payload transfers through
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.script.gate {
            gate.add_permits(n);
        }
    }

    /// Fail the next session open
    pub fn fail_next_open(&self, code: Option<u16>, message: &str) -> &Self {
        self.script
            .open_failures
            .lock()
            .push_back(SessionOpenError::new(code, message));
        self
    }

    /// Reply to successive envelope steps for `address` with `codes`
    pub fn rcpt_replies(&self, address: &str, codes: &[u16]) -> &Self {
        self.script
            .rcpt_replies
            .lock()
            .entry(address.to_string())
            .or_default()
            .extend(codes);
        self
    }

    /// Reply to successive payload transfers with `codes`
    pub fn payload_replies(&self, codes: &[u16]) -> &Self {
        self.script.payload_replies.lock().extend(codes);
        self
    }

    /// Sessions opened so far, in order
    pub fn sessions(&self) -> Vec<(Domain, IpAddr)> {
        self.script.sessions.lock().clone()
    }

    pub fn rcpt_attempts(&self, address: &str) -> usize {
        self.script
            .rcpt_attempts
            .lock()
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn payloads(&self) -> usize {
        self.script.payloads.load(Ordering::SeqCst)
    }
}

impl ClientFactory for MockClientFactory {
    fn create(&self) -> Box<dyn ProtocolClient> {
        Box::new(MockClient {
            script: self.script.clone(),
            valid: false,
        })
    }
}

struct MockClient {
    script: Arc<Script>,
    valid: bool,
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn open_session(
        &mut self,
        domain: &Domain,
        source: IpAddr,
    ) -> Result<(), SessionOpenError> {
        self.script.sessions.lock().push((domain.clone(), source));

        if let Some(failure) = self.script.open_failures.lock().pop_front() {
            return Err(failure);
        }

        self.valid = true;
        Ok(())
    }

    fn is_session_valid(&self) -> bool {
        self.valid
    }

    async fn send_envelope_step(
        &mut self,
        step: EnvelopeStep<'_>,
    ) -> Result<Response, TransportError> {
        let EnvelopeStep::RcptTo(address) = step else {
            return Ok(Response::new(250, "OK"));
        };

        *self
            .script
            .rcpt_attempts
            .lock()
            .entry(address.to_string())
            .or_default() += 1;

        let code = self
            .script
            .rcpt_replies
            .lock()
            .get_mut(address)
            .and_then(VecDeque::pop_front)
            .unwrap_or(250);

        if code == 421 {
            self.valid = false;
            return Ok(Response::new(code, "Service not available, closing channel"));
        }

        Ok(Response::new(code, format!("{code} for {address}")))
    }

    async fn send_payload(&mut self, _content: &MessageContent) -> Result<Response, TransportError> {
        if let Some(gate) = &self.script.gate {
            gate.acquire()
                .await
                .map_err(|e| TransportError::ConnectionLost(e.to_string()))?
                .forget();
        }

        self.script.payloads.fetch_add(1, Ordering::SeqCst);
        let code = self.script.payload_replies.lock().pop_front().unwrap_or(250);
        Ok(Response::new(code, "Queued"))
    }

    async fn reset(&mut self) -> Result<Response, TransportError> {
        Ok(Response::new(250, "Reset"))
    }

    async fn close(&mut self) {
        self.valid = false;
    }
}

/// In-memory result sink
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<ProgressRecord>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A sink that rejects every record
    pub fn failing() -> Arc<Self> {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn records(&self) -> Vec<ProgressRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn record(&self, record: ProgressRecord) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::new("result store unavailable"));
        }

        self.records.lock().push(record);
        Ok(())
    }
}

/// Await a batch, failing the test if it takes unreasonably long
pub async fn outcome(handle: BatchHandle) -> Result<BatchResult, DispatchError> {
    tokio::time::timeout(Duration::from_secs(60), handle)
        .await
        .expect("batch did not resolve in time")
}

/// Await a batch that is expected to succeed
pub async fn result(handle: BatchHandle) -> BatchResult {
    outcome(handle).await.expect("batch failed")
}

//! Drives one batch attempt through a protocol session
//!
//! A batch is one message to many recipients at one domain, sent over a
//! single session: open, envelope sender, one envelope step per recipient,
//! then the payload to every accepted recipient. The sender classifies each
//! recipient; persistence and retry decisions belong to the caller.

use std::{
    fmt::Debug,
    net::IpAddr,
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use courier_common::{Domain, outgoing};
use serde::{Deserialize, Serialize};

use crate::{
    error::DispatchError,
    transport::{ClientFactory, EnvelopeStep, ProtocolClient, Response},
    types::{BatchId, MessageContent, Recipient, RecipientResult},
};

/// How recipient status codes are interpreted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientPolicy {
    /// Failure codes that are never retried.
    ///
    /// Default: 550-554
    #[serde(default = "defaults::retry_excluded_codes")]
    pub retry_excluded_codes: Vec<u16>,

    /// Code reported when a session breaks without a usable reply, and the
    /// reply code that marks a session as closing.
    ///
    /// Default: 421
    #[serde(default = "defaults::session_failure_code")]
    pub session_failure_code: u16,

    /// Code given to recipients submitted with the invalid-domain sentinel.
    ///
    /// Default: 550
    #[serde(default = "defaults::invalid_domain_code")]
    pub invalid_domain_code: u16,
}

impl Default for RecipientPolicy {
    fn default() -> Self {
        Self {
            retry_excluded_codes: defaults::retry_excluded_codes(),
            session_failure_code: defaults::session_failure_code(),
            invalid_domain_code: defaults::invalid_domain_code(),
        }
    }
}

impl RecipientPolicy {
    #[must_use]
    pub fn is_retryable(&self, code: u16) -> bool {
        !self.retry_excluded_codes.contains(&code)
    }
}

mod defaults {
    pub fn retry_excluded_codes() -> Vec<u16> {
        vec![550, 551, 552, 553, 554]
    }

    pub const fn session_failure_code() -> u16 {
        421
    }

    pub const fn invalid_domain_code() -> u16 {
        550
    }
}

/// What should happen to a recipient after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    /// Failed, but may succeed on a later attempt
    Retryable,
    /// Failed for good
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientOutcome {
    pub recipient: Recipient,
    pub code: u16,
    pub message: String,
    pub disposition: Disposition,
}

impl RecipientOutcome {
    /// The terminal result for this recipient
    #[must_use]
    pub fn to_result(&self) -> RecipientResult {
        if self.disposition == Disposition::Delivered {
            RecipientResult::delivered(&self.recipient, self.code, &self.message)
        } else {
            RecipientResult::failed(&self.recipient, self.code, &self.message)
        }
    }
}

/// Result of one attempt at a batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub recipients: Vec<RecipientOutcome>,
    /// Set when the session failed to open or broke mid-batch
    pub session_failure: Option<u16>,
}

impl AttemptOutcome {
    #[must_use]
    pub fn had_any_success(&self) -> bool {
        self.recipients
            .iter()
            .any(|r| r.disposition == Disposition::Delivered)
    }

    /// The code that best describes how the attempt went, for cooldown tracking
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        self.session_failure.or_else(|| {
            self.recipients
                .iter()
                .find(|r| r.disposition != Disposition::Delivered)
                .map(|r| r.code)
        })
    }

    #[must_use]
    pub fn delivered(&self) -> usize {
        self.recipients
            .iter()
            .filter(|r| r.disposition == Disposition::Delivered)
            .count()
    }

    /// Split into terminal results and recipients to retry.
    ///
    /// Without retry budget, retryable failures become terminal.
    #[must_use]
    pub fn partition(self, can_retry: bool) -> (Vec<RecipientResult>, Vec<Recipient>) {
        let mut terminal = Vec::with_capacity(self.recipients.len());
        let mut retry = Vec::new();

        for outcome in self.recipients {
            if can_retry && outcome.disposition == Disposition::Retryable {
                retry.push(outcome.recipient);
            } else {
                terminal.push(outcome.to_result());
            }
        }

        (terminal, retry)
    }

    fn push(&mut self, recipient: Recipient, code: u16, message: String, disposition: Disposition) {
        self.recipients.push(RecipientOutcome {
            recipient,
            code,
            message,
            disposition,
        });
    }
}

/// Everything a worker needs to run one attempt
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub batch_id: BatchId,
    pub domain: Domain,
    pub recipients: Vec<Recipient>,
    pub content: MessageContent,
    /// Source address leased for this attempt
    pub source: IpAddr,
}

/// Performs one batch attempt
#[async_trait]
pub trait BatchSender: Send + Sync + Debug {
    /// Attempt delivery of a batch.
    ///
    /// Per-recipient failures are part of the [`AttemptOutcome`]; an error
    /// means the attempt could not produce per-recipient results at all.
    async fn send(&self, request: SendRequest) -> Result<AttemptOutcome, DispatchError>;
}

/// [`BatchSender`] that drives a fresh [`ProtocolClient`] per attempt
#[derive(Debug)]
pub struct SessionSender {
    factory: Arc<dyn ClientFactory>,
    policy: RecipientPolicy,
}

impl SessionSender {
    #[must_use]
    pub fn new(factory: Arc<dyn ClientFactory>, policy: RecipientPolicy) -> Self {
        Self { factory, policy }
    }

    fn disposition(&self, code: u16) -> Disposition {
        if self.policy.is_retryable(code) {
            Disposition::Retryable
        } else {
            Disposition::Permanent
        }
    }

    fn fail(&self, outcome: &mut AttemptOutcome, recipient: Recipient, code: u16, message: String) {
        let disposition = self.disposition(code);
        outcome.push(recipient, code, message, disposition);
    }

    fn fail_all<'a>(
        &self,
        outcome: &mut AttemptOutcome,
        recipients: impl IntoIterator<Item = &'a Recipient>,
        code: u16,
        message: &str,
    ) {
        for recipient in recipients {
            self.fail(outcome, recipient.clone(), code, message.to_string());
        }
    }

    fn break_session(&self, outcome: &mut AttemptOutcome, domain: &Domain, code: u16) {
        outcome.session_failure = Some(code);
        if let Some(metrics) = courier_metrics::try_metrics() {
            metrics.dispatch.record_session_failure(domain.as_str(), code);
        }
    }

    /// Run the envelope and payload exchange on an open session
    async fn converse(
        &self,
        client: &mut dyn ProtocolClient,
        request: &SendRequest,
        outcome: &mut AttemptOutcome,
    ) {
        let session_code = self.policy.session_failure_code;
        let domain = &request.domain;

        match timed(
            "mail_from",
            client.send_envelope_step(EnvelopeStep::MailFrom(&request.content.sender)),
        )
        .await
        {
            Ok(response) if response.is_positive() => {}
            Ok(response) => {
                outgoing!(level = WARN, %domain, code = response.code, "Envelope sender rejected: {}", response.message);
                if response.code == session_code {
                    self.break_session(outcome, domain, session_code);
                } else {
                    let _ = client.reset().await;
                }
                self.fail_all(outcome, &request.recipients, response.code, &response.message);
                return;
            }
            Err(e) => {
                outgoing!(level = WARN, %domain, "Envelope sender failed: {e}");
                self.break_session(outcome, domain, session_code);
                self.fail_all(outcome, &request.recipients, session_code, &e.to_string());
                return;
            }
        }

        let mut accepted = Vec::with_capacity(request.recipients.len());
        let mut broken: Option<Response> = None;

        for recipient in &request.recipients {
            if let Some(reason) = &broken {
                self.fail(outcome, recipient.clone(), reason.code, reason.message.clone());
                continue;
            }

            if !client.is_session_valid() {
                let reason = Response::new(session_code, "Session no longer valid");
                self.break_session(outcome, domain, session_code);
                self.fail(outcome, recipient.clone(), reason.code, reason.message.clone());
                broken = Some(reason);
                continue;
            }

            match timed(
                "rcpt_to",
                client.send_envelope_step(EnvelopeStep::RcptTo(&recipient.address)),
            )
            .await
            {
                Ok(response) if response.is_positive() => accepted.push(recipient.clone()),
                Ok(response) => {
                    outgoing!(
                        level = DEBUG,
                        %domain,
                        recipient = %recipient.address,
                        code = response.code,
                        "Recipient rejected: {}",
                        response.message
                    );
                    self.fail(outcome, recipient.clone(), response.code, response.message.clone());
                    if response.code == session_code {
                        self.break_session(outcome, domain, session_code);
                        broken = Some(response);
                    }
                }
                Err(e) => {
                    let reason = Response::new(session_code, e.to_string());
                    self.break_session(outcome, domain, session_code);
                    self.fail(outcome, recipient.clone(), reason.code, reason.message.clone());
                    broken = Some(reason);
                }
            }
        }

        if let Some(reason) = broken {
            self.fail_all(outcome, &accepted, reason.code, &reason.message);
            return;
        }

        if accepted.is_empty() {
            let _ = client.reset().await;
            return;
        }

        match timed("payload", client.send_payload(&request.content)).await {
            Ok(response) if response.is_positive() => {
                for recipient in accepted {
                    outcome.push(
                        recipient,
                        response.code,
                        response.message.clone(),
                        Disposition::Delivered,
                    );
                }
            }
            Ok(response) => {
                outgoing!(level = WARN, %domain, code = response.code, "Payload rejected: {}", response.message);
                if response.code == session_code {
                    self.break_session(outcome, domain, session_code);
                } else {
                    let _ = client.reset().await;
                }
                self.fail_all(outcome, &accepted, response.code, &response.message);
            }
            Err(e) => {
                outgoing!(level = WARN, %domain, "Payload transfer failed: {e}");
                self.break_session(outcome, domain, session_code);
                self.fail_all(outcome, &accepted, session_code, &e.to_string());
            }
        }
    }
}

#[async_trait]
impl BatchSender for SessionSender {
    #[tracing::instrument(level = "debug", skip_all, fields(batch = %request.batch_id, domain = %request.domain))]
    async fn send(&self, request: SendRequest) -> Result<AttemptOutcome, DispatchError> {
        let mut client = self.factory.create();
        let mut outcome = AttemptOutcome::default();

        if let Err(e) = timed("connect", client.open_session(&request.domain, request.source)).await
        {
            let code = e.code.unwrap_or(self.policy.session_failure_code);
            outgoing!(
                level = WARN,
                domain = %request.domain,
                source = %request.source,
                code,
                "Failed to open session: {}",
                e.message
            );
            self.break_session(&mut outcome, &request.domain, code);
            self.fail_all(&mut outcome, &request.recipients, code, &e.message);
            return Ok(outcome);
        }

        self.converse(client.as_mut(), &request, &mut outcome).await;
        client.close().await;

        tracing::debug!(
            batch = %request.batch_id,
            delivered = outcome.delivered(),
            attempted = request.recipients.len(),
            "Batch attempt finished"
        );

        Ok(outcome)
    }
}

/// Await a protocol step, recording its latency
async fn timed<F: Future>(step: &'static str, future: F) -> F::Output {
    let start = Instant::now();
    let output = future.await;
    if let Some(metrics) = courier_metrics::try_metrics() {
        metrics
            .dispatch
            .record_response_latency(step, start.elapsed().as_secs_f64() * 1000.0);
    }
    output
}

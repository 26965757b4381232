use std::collections::VecDeque;
use std::time::Duration;

use cdh_core::protocol::Request;
use tokio::time::Instant;

/// Single-flight request queue.
///
/// The vendor answers a second concurrent request with fault 2006 instead of
/// queueing it, so at most one request may be outstanding at a time. Two flags
/// track the wait:
///
/// - `outstanding`: we sent a request and have not heard back. Cleared by a
///   response, a fault other than 2006, or the local timeout.
/// - `in_progress`: the vendor told us (fault 2006) it is still computing a
///   response. Cleared only by a substantive response or a fault other than
///   2006. The local timeout leaves it alone so the next poll, not an
///   immediate retry, decides what happens.
#[derive(Debug)]
pub struct RequestSequencer {
    queue: VecDeque<Request>,
    outstanding: bool,
    in_progress: bool,
    deadline: Option<Instant>,
    timeout: Duration,
}

impl RequestSequencer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            outstanding: false,
            in_progress: false,
            deadline: None,
            timeout,
        }
    }

    pub fn enqueue(&mut self, request: Request) {
        self.queue.push_back(request);
    }

    /// Pops the next request if it may be sent now and marks it outstanding.
    ///
    /// With the socket closed, queued requests are dropped: they must not be
    /// replayed on a later connection.
    pub fn next_to_send(&mut self, socket_open: bool, now: Instant) -> Option<Request> {
        if !socket_open {
            if !self.queue.is_empty() {
                tracing::debug!(dropped = self.queue.len(), "Socket closed, dropping queued requests");
                self.queue.clear();
            }
            return None;
        }

        if self.outstanding {
            return None;
        }

        let request = self.queue.pop_front()?;
        self.outstanding = true;
        self.deadline = Some(now + self.timeout);
        Some(request)
    }

    /// The send itself failed; the slot is free again.
    pub fn send_failed(&mut self) {
        self.outstanding = false;
        self.deadline = None;
    }

    /// A substantive response (an event) arrived.
    pub fn on_response(&mut self) {
        self.outstanding = false;
        self.in_progress = false;
        self.deadline = None;
    }

    /// A fault arrived for the outstanding request.
    pub fn on_fault(&mut self, response_in_progress: bool) {
        if response_in_progress {
            self.in_progress = true;
        } else {
            self.on_response();
        }
    }

    /// The request timer fired without a response.
    pub fn on_timeout(&mut self) {
        self.outstanding = false;
        self.deadline = None;
    }

    /// Forget everything. Used when the connection goes away.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.outstanding = false;
        self.in_progress = false;
        self.deadline = None;
    }

    /// Whether a new poll should be skipped.
    pub fn is_busy(&self) -> bool {
        !self.queue.is_empty() || self.outstanding || self.in_progress
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }
}

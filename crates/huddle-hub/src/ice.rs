//! Per-user ICE buffering.
//!
//! A candidate must never reach a peer before the session description it
//! belongs to. Candidates that show up early are parked here, one FIFO per
//! direction, and replayed exactly once after the offer or answer has gone out.

use std::collections::VecDeque;

/// Signaling bookkeeping for one user, kept for the lifetime of the Hub.
///
/// Frames are stored fully encoded so a flush is a plain replay.
#[derive(Debug, Default)]
pub struct IceBuffer {
    /// SFU → client candidates waiting for the offer.
    to_client: VecDeque<String>,
    /// Client → SFU candidates waiting for the answer.
    to_sfu: VecDeque<String>,
    /// Offer that arrived while the user had no live connection.
    pending_offer: Option<String>,
    offer_sent: bool,
    answer_sent: bool,
}

impl IceBuffer {
    /// True once either side of the exchange has seen its description.
    pub fn negotiated(&self) -> bool {
        self.offer_sent || self.answer_sent
    }

    pub fn offer_sent(&self) -> bool {
        self.offer_sent
    }

    pub fn answer_sent(&self) -> bool {
        self.answer_sent
    }

    pub fn mark_offer_sent(&mut self) {
        self.offer_sent = true;
    }

    pub fn mark_answer_sent(&mut self) {
        self.answer_sent = true;
    }

    pub fn buffer_for_client(&mut self, frame: String) {
        self.to_client.push_back(frame);
    }

    pub fn buffer_for_sfu(&mut self, frame: String) {
        self.to_sfu.push_back(frame);
    }

    /// Take every parked SFU → client candidate in arrival order.
    pub fn drain_for_client(&mut self) -> Vec<String> {
        self.to_client.drain(..).collect()
    }

    /// Take every parked client → SFU candidate in arrival order.
    pub fn drain_for_sfu(&mut self) -> Vec<String> {
        self.to_sfu.drain(..).collect()
    }

    /// Park an offer for later delivery. A newer offer replaces an older one.
    pub fn stash_offer(&mut self, frame: String) {
        if self.pending_offer.replace(frame).is_some() {
            tracing::debug!("Replacing previously buffered offer");
        }
    }

    pub fn take_offer(&mut self) -> Option<String> {
        self.pending_offer.take()
    }

    pub fn has_pending_offer(&self) -> bool {
        self.pending_offer.is_some()
    }

    pub fn queued(&self) -> (usize, usize) {
        (self.to_client.len(), self.to_sfu.len())
    }

    /// Forget the negotiation state of a finished session.
    ///
    /// Candidates parked for that session are useless to the next one, so the
    /// queues go too. A pending offer survives: it was produced after the
    /// session ended and belongs to whatever comes next.
    pub fn end_session(&mut self) {
        self.offer_sent = false;
        self.answer_sent = false;
        self.to_client.clear();
        self.to_sfu.clear();
    }
}

//! Remote ICE candidates that arrive before a remote description
//!
//! The buffer is shared between the mailbox poller and the session actor so
//! that candidates are queued the moment they are read, even while the actor
//! is busy inside a slow description operation. The open flag and the queue
//! sit under one lock, which makes "queue or apply" and "open and drain"
//! mutually atomic: no candidate can slip between a drain and the flag flip.

use parking_lot::Mutex;
use std::collections::VecDeque;

use peerlink_signaling::IceCandidate;

/// What the caller should do with an admitted candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A remote description is set; apply now
    ApplyNow(IceCandidate),
    /// Queued until the remote description is set
    Buffered,
}

#[derive(Debug, Default)]
struct BufferState {
    remote_description_set: bool,
    pending: VecDeque<IceCandidate>,
}

/// FIFO of not-yet-applicable remote candidates
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    state: Mutex<BufferState>,
}

impl CandidateBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, candidate: IceCandidate) -> Admission {
        let mut state = self.state.lock();
        if state.remote_description_set {
            Admission::ApplyNow(candidate)
        } else {
            state.pending.push_back(candidate);
            Admission::Buffered
        }
    }

    /// Mark the remote description as set and take everything queued, oldest first
    pub fn open(&self) -> Vec<IceCandidate> {
        let mut state = self.state.lock();
        state.remote_description_set = true;
        state.pending.drain(..).collect()
    }

    /// Drop queued candidates and close the buffer again. Returns how many were dropped.
    pub fn reset(&self) -> usize {
        let mut state = self.state.lock();
        state.remote_description_set = false;
        let dropped = state.pending.len();
        state.pending.clear();
        dropped
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.lock().remote_description_set
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

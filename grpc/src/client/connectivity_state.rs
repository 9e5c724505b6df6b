/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use tokio::sync::oneshot;
use tonic::Status;

use super::ConnectivityState;

/// Tracks the connectivity state of a single unit (an LB policy or a
/// subchannel) and wakes at most one observer when it changes.
///
/// The tracker is owned by the unit it describes and is only mutated from that
/// unit's serialized context, so it holds no locks.
pub struct ConnectivityStateTracker {
    name: &'static str,
    state: ConnectivityState,
    status: Option<Status>,
    watcher: Option<oneshot::Sender<ConnectivityState>>,
}

impl ConnectivityStateTracker {
    pub fn new(name: &'static str, initial: ConnectivityState) -> Self {
        Self {
            name,
            state: initial,
            status: None,
            watcher: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Returns the status associated with the current state, set for failure
    /// states.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Records a new state.  Returns true if the state changed, in which case
    /// the waiting observer, if any, is notified.
    pub fn set(&mut self, state: ConnectivityState, status: Option<Status>, reason: &str) -> bool {
        self.status = status;
        if self.state == state {
            return false;
        }
        tracing::debug!(
            tracker = self.name,
            from = %self.state,
            to = %state,
            reason,
            "connectivity state change"
        );
        self.state = state;
        if let Some(watcher) = self.watcher.take() {
            // The observer may have stopped waiting.
            let _ = watcher.send(state);
        }
        true
    }

    /// Returns a receiver that resolves with the new state the next time the
    /// state differs from `current`.  If the tracked state already differs,
    /// the receiver resolves immediately.
    ///
    /// Only one observer is supported.  Registering a new one drops the
    /// previous sender, closing that receiver.
    pub fn notify_on_state_change(
        &mut self,
        current: ConnectivityState,
    ) -> oneshot::Receiver<ConnectivityState> {
        let (tx, rx) = oneshot::channel();
        if current != self.state {
            let _ = tx.send(self.state);
            self.watcher = None;
        } else {
            self.watcher = Some(tx);
        }
        rx
    }
}

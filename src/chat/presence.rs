//! Typing and display-name presence.
//!
//! Presence frames are fire-and-forget hints sent in the clear. The local side
//! debounces keystrokes into typing bursts: the first keystroke of a burst
//! sends `Typing`, every keystroke re-arms an idle timer, and when the timer
//! fires the burst ends with `StopTyping`.
//!
//! The timer never touches the channel itself. When it fires it posts its
//! generation number to the session's event queue, and the session sends
//! `StopTyping` only if that generation is still the armed one. A firing that
//! raced a cancel carries an old generation and is ignored.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::runtime::Handle;
use tracing::{trace, warn};

/// What the local side knows about the peer's presence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceState {
    /// Display name announced by the peer, if any.
    pub remote_display_name: Option<String>,
    /// Whether the peer is currently typing.
    pub is_remote_typing: bool,
}

struct IdleTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Owns presence state and the single idle-typing timer.
pub struct PresenceSignaling {
    state: PresenceState,
    idle_timeout: Duration,
    remote_placeholder: String,
    timer: Option<IdleTimer>,
    next_generation: u64,
    timer_tx: mpsc::UnboundedSender<u64>,
}

impl PresenceSignaling {
    /// Create presence signaling that reports timer firings on `timer_tx`.
    pub fn new(
        idle_timeout: Duration,
        remote_placeholder: impl Into<String>,
        timer_tx: mpsc::UnboundedSender<u64>,
    ) -> Self {
        Self {
            state: PresenceState::default(),
            idle_timeout,
            remote_placeholder: remote_placeholder.into(),
            timer: None,
            next_generation: 0,
            timer_tx,
        }
    }

    /// Current presence state.
    pub fn state(&self) -> &PresenceState {
        &self.state
    }

    /// Whether a local typing burst is in progress (timer armed).
    pub fn is_burst_active(&self) -> bool {
        self.timer.is_some()
    }

    /// Register a local keystroke.
    ///
    /// Returns `true` when this keystroke starts a new burst, meaning a
    /// `Typing` frame should be sent. The idle timer is (re)armed either way.
    ///
    /// Outside a tokio runtime no timer can be armed, so the keystroke is
    /// ignored and `false` is returned.
    pub fn on_keystroke(&mut self) -> bool {
        let starts_burst = self.timer.is_none();
        self.arm() && starts_burst
    }

    /// Handle a timer firing.
    ///
    /// Returns `true` when the firing belongs to the armed timer; the burst
    /// ends and a `StopTyping` frame should be sent.
    pub fn on_idle_timeout(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation == generation => {
                self.timer = None;
                true
            }
            _ => {
                trace!(generation, "ignoring stale typing timer");
                false
            }
        }
    }

    /// A message is about to be sent.
    ///
    /// Cancels the idle timer and returns `true` if a burst was active, in
    /// which case an explicit `StopTyping` should be sent.
    pub fn on_message_sent(&mut self) -> bool {
        self.cancel_timer()
    }

    /// Cancel the idle timer. Returns whether one was armed.
    pub fn cancel_timer(&mut self) -> bool {
        match self.timer.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Peer sent `Typing`.
    pub fn receive_typing(&mut self, user: &str) {
        let name = if user.trim().is_empty() {
            self.remote_placeholder.clone()
        } else {
            user.to_string()
        };
        self.state.remote_display_name = Some(name);
        self.state.is_remote_typing = true;
    }

    /// Peer sent `StopTyping`.
    pub fn receive_stop_typing(&mut self) {
        self.state.is_remote_typing = false;
    }

    /// Peer sent `UserInfo`.
    pub fn receive_user_info(&mut self, name: &str) {
        self.state.remote_display_name = Some(name.to_string());
    }

    /// Channel went away: cancel the timer and clear the typing flag.
    ///
    /// The peer's display name is kept for the log.
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.state.is_remote_typing = false;
    }

    fn arm(&mut self) -> bool {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "no tokio runtime, typing presence disabled");
                return false;
            }
        };
        self.cancel_timer();

        let generation = self.next_generation;
        self.next_generation += 1;

        let tx = self.timer_tx.clone();
        let timeout = self.idle_timeout;
        let handle = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(generation);
        });

        self.timer = Some(IdleTimer { generation, handle });
        true
    }
}

impl Drop for PresenceSignaling {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

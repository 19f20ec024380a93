//! Shell-command confirmation.
//!
//! Shell execution is gated on an out-of-band confirmation: the handler
//! asks the broker, the broker forwards to whichever listener the UI
//! registered, and the listener answers through a oneshot. With no
//! listener the request is denied, and the daemon never runs a command
//! nobody approved.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

/// How long a listener may take to answer before the request is denied.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

/// A pending confirmation carrying the responder.
pub struct ConfirmRequest {
    pub command: String,
    pub cwd: String,
    pub respond: oneshot::Sender<bool>,
}

/// Routes confirmation requests to the registered listener, if any.
pub struct ConfirmBroker {
    listener: Mutex<Option<mpsc::Sender<ConfirmRequest>>>,
}

impl ConfirmBroker {
    pub fn new() -> Self {
        Self {
            listener: Mutex::new(None),
        }
    }

    /// Register the (single) listener. Replaces any previous one.
    pub fn set_listener(&self) -> mpsc::Receiver<ConfirmRequest> {
        let (tx, rx) = mpsc::channel(8);
        *self.listener.lock() = Some(tx);
        rx
    }

    pub fn clear_listener(&self) {
        *self.listener.lock() = None;
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().is_some()
    }

    /// Ask for approval. `false` when there is no listener, the
    /// listener went away, or it did not answer in time.
    pub async fn request(&self, command: &str, cwd: &str) -> bool {
        let sender = self.listener.lock().clone();
        let Some(sender) = sender else {
            return false;
        };
        let (tx, rx) = oneshot::channel();
        let request = ConfirmRequest {
            command: command.to_string(),
            cwd: cwd.to_string(),
            respond: tx,
        };
        if sender.send(request).await.is_err() {
            self.clear_listener();
            return false;
        }
        match tokio::time::timeout(CONFIRM_TIMEOUT, rx).await {
            Ok(Ok(approved)) => approved,
            _ => false,
        }
    }
}

impl Default for ConfirmBroker {
    fn default() -> Self {
        Self::new()
    }
}

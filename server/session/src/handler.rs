//! Callbacks exposed to the owning server.

use std::sync::Arc;

use crate::session::Session;

/// Receiver of session events.
///
/// Callbacks are synchronous: `payload` borrows the session's accumulation
/// buffer and is only valid for the duration of the call, so implementations
/// must copy it or fully consume it before returning. Spawn a task for any
/// follow-up I/O.
pub trait SessionHandler: Send + Sync {
    /// One decoded frame arrived on `session`.
    fn on_frame(&self, session: &Arc<Session>, payload: &[u8]);

    /// `session` finished its teardown. Fired exactly once per session,
    /// after all pooled buffers have been returned.
    fn on_disconnected(&self, session: &Arc<Session>);
}

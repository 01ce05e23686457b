//! Call context: cancellation, deadline and propagated tags.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::message::RpcTags;

/// Carries cancellation, an optional deadline and RPC tags across a call.
///
/// Cloning shares the same cancellation; [`Context::child`] derives a
/// context that is canceled with its parent but can also be canceled alone.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    tags: Option<RpcTags>,
    fire_now: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context that is never canceled on its own.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            tags: None,
            fire_now: false,
        }
    }

    /// Derives a cancelable child.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            tags: self.tags.clone(),
            fire_now: self.fire_now,
        }
    }

    /// Derives a child whose deadline is `timeout` from now (or the parent's,
    /// whichever is sooner).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        });
        child
    }

    /// Replaces the propagated tags.
    pub fn with_tags(mut self, tags: RpcTags) -> Self {
        self.tags = Some(tags);
        self
    }

    /// Marks the context so a pending initial reconnect backoff fires
    /// immediately.
    pub fn with_fire_now(mut self) -> Self {
        self.fire_now = true;
        self
    }

    pub fn tags(&self) -> Option<&RpcTags> {
        self.tags.as_ref()
    }

    pub fn is_fire_now(&self) -> bool {
        self.fire_now
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The error this context ended with, if it has ended.
    pub fn err(&self) -> Option<RpcError> {
        if self.token.is_cancelled() {
            return Some(RpcError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(RpcError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is canceled or its deadline passes.
    pub async fn done(&self) -> RpcError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => RpcError::Canceled,
                _ = tokio::time::sleep_until(deadline) => RpcError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                RpcError::Canceled
            }
        }
    }

    pub(crate) fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
            tags: None,
            fire_now: false,
        }
    }
}

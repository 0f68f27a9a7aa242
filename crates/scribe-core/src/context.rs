//! Per-request execution context and the hand-off observer hook

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Context carried through one dispatched request.
///
/// The cancellation token is owned by the caller: cancelling it (for example
/// when a client disconnects) tells routing and stream producers to stop.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    cancel: CancellationToken,
    attributes: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            cancel,
            attributes: BTreeMap::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the caller abandons the request
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Attach an attribute such as a trace correlation id
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// What the router decided for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOffInfo {
    pub to_agent: String,
    pub argument: String,
}

/// Hook fired on every successful hand-off.
///
/// Runs inline on the request's own path, so implementations must return
/// quickly; spawn a task for anything slow.
pub trait HandOffObserver: Send + Sync {
    fn on_hand_off(&self, ctx: RequestContext, info: &HandOffInfo) -> RequestContext;
}

/// Observer that logs each hand-off
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandOff;

impl HandOffObserver for LogHandOff {
    fn on_hand_off(&self, ctx: RequestContext, info: &HandOffInfo) -> RequestContext {
        info!(
            request_id = %ctx.request_id(),
            agent = %info.to_agent,
            argument = %info.argument,
            "Hand-off"
        );
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestContext::new();
        let b = RequestContext::new();
        assert_ne!(a.request_id(), b.request_id());
    }

    #[test]
    fn test_attributes() {
        let ctx = RequestContext::new()
            .with_attribute("trace_id", "abc")
            .with_attribute("trace_id", "def");
        assert_eq!(ctx.attribute("trace_id"), Some("def"));
        assert_eq!(ctx.attribute("missing"), None);
        assert_eq!(ctx.attributes().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_is_shared_with_clones() {
        let ctx = RequestContext::new();
        let clone = ctx.clone();
        ctx.cancellation().cancel();
        clone.cancelled().await;
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_log_observer_passes_context_through() {
        let ctx = RequestContext::new().with_attribute("k", "v");
        let id = ctx.request_id().to_string();
        let info = HandOffInfo {
            to_agent: "meeting_chat".to_string(),
            argument: "hi".to_string(),
        };
        let out = LogHandOff.on_hand_off(ctx, &info);
        assert_eq!(out.request_id(), id);
        assert_eq!(out.attribute("k"), Some("v"));
    }
}

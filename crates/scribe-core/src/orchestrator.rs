//! Multi-agent façade: one router, a fixed set of specialists, and a single
//! streaming entry point.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::context::{HandOffInfo, HandOffObserver, LogHandOff, RequestContext};
use crate::error::{AgentError, AgentResult};
use crate::pipe::{concat_messages, StreamReader};
use crate::router::Router;
use crate::specialist::{AgentMeta, Specialist};
use crate::types::Message;

/// Routes each request to one specialist and streams the answer back.
///
/// The specialist registry is fixed at construction. Share one instance
/// across requests behind an `Arc`.
pub struct Orchestrator {
    router: Router,
    metas: Vec<AgentMeta>,
    specialists: HashMap<String, Specialist>,
    observer: Arc<dyn HandOffObserver>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("router", &self.router)
            .field("specialists", &self.metas)
            .finish()
    }
}

pub struct OrchestratorBuilder {
    router: Router,
    specialists: Vec<Specialist>,
    observer: Option<Arc<dyn HandOffObserver>>,
}

impl OrchestratorBuilder {
    pub fn specialist(mut self, specialist: Specialist) -> Self {
        self.specialists.push(specialist);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn HandOffObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> AgentResult<Orchestrator> {
        if self.specialists.is_empty() {
            return Err(AgentError::Validation(
                "at least one specialist is required".to_string(),
            ));
        }

        let mut metas = Vec::with_capacity(self.specialists.len());
        let mut specialists = HashMap::with_capacity(self.specialists.len());
        for specialist in self.specialists {
            let name = specialist.name().to_string();
            if name.trim().is_empty() {
                return Err(AgentError::Validation("specialist name is empty".to_string()));
            }
            if specialists.contains_key(&name) {
                return Err(AgentError::Validation(format!(
                    "duplicate specialist name '{}'",
                    name
                )));
            }
            metas.push(specialist.meta().clone());
            specialists.insert(name, specialist);
        }

        Ok(Orchestrator {
            router: self.router,
            metas,
            specialists,
            observer: self.observer.unwrap_or_else(|| Arc::new(LogHandOff)),
        })
    }
}

impl Orchestrator {
    pub fn builder(router: Router) -> OrchestratorBuilder {
        OrchestratorBuilder {
            router,
            specialists: Vec::new(),
            observer: None,
        }
    }

    /// Registered specialists, in registration order
    pub fn specialists(&self) -> &[AgentMeta] {
        &self.metas
    }

    /// Route the conversation and stream the chosen specialist's answer.
    ///
    /// Every failure, including validation and routing, arrives as the
    /// stream's terminal error.
    pub async fn dispatch(
        &self,
        ctx: RequestContext,
        messages: &[Message],
    ) -> StreamReader<Message> {
        if let Err(e) = validate(messages) {
            return StreamReader::failed(e);
        }

        let decision = match self.router.route(&ctx, messages, &self.metas).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(request_id = %ctx.request_id(), "Routing failed: {}", e);
                return StreamReader::failed(e);
            }
        };

        let Some(specialist) = self.specialists.get(&decision.target) else {
            return StreamReader::failed(AgentError::ClassificationFailed(format!(
                "unknown specialist '{}'",
                decision.target
            )));
        };

        let info = HandOffInfo {
            to_agent: decision.target,
            argument: decision.argument,
        };
        let ctx = self.observer.on_hand_off(ctx, &info);
        debug!(request_id = %ctx.request_id(), "Invoking specialist {}", specialist.name());

        specialist.invoke(&ctx, messages).await
    }

    /// Dispatch and collect the whole answer into one message
    pub async fn generate(
        &self,
        ctx: RequestContext,
        messages: &[Message],
    ) -> AgentResult<Message> {
        let fragments = self.dispatch(ctx, messages).await.collect().await?;
        Ok(concat_messages(&fragments))
    }
}

fn validate(messages: &[Message]) -> AgentResult<()> {
    match messages.last() {
        None => Err(AgentError::Validation("conversation is empty".to_string())),
        Some(last) if last.content.trim().is_empty() => Err(AgentError::Validation(
            "newest message is empty".to_string(),
        )),
        Some(_) => Ok(()),
    }
}

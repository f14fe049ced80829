//! 传输层与链路之间的边界。
//!
//! # 教案式说明
//! - **意图（Why）**：传输层收到一条报文时只需要“把它交出去”；由谁构建链、从哪里开始执行，
//!   都由观察者决定。Handler 中止改道的合成响应也经由同一入口进入入站路径。
//! - **逻辑（How）**：[`ChainInitiationObserver`] 持有入站链模板，每条报文构建一条新链；
//!   报文带有 `braid.chain.starting_after`/`starting_at` 属性时从对应拦截器处开始。
//! - **契约（What）**：`dispatch` 返回 [`ChainRun`]，挂起的运行可以移交给其他任务后 `resume`；
//!   通过 [`MessageObserver::on_message`] 进入时，挂起的运行交给可选的挂起回调，未配置则记录告警后丢弃。

use std::{fmt, sync::Arc};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    chain::{ChainError, ChainOutcome, PhaseInterceptorChain},
    message::{Message, keys as message_keys},
    observability::keys,
    template::ChainTemplate,
};

/// 接收报文的观察者。
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, message: Message);
}

/// 一次链路运行：链实例、报文与最近一次的结果。
pub struct ChainRun {
    chain: PhaseInterceptorChain,
    message: Message,
    outcome: ChainOutcome,
}

impl ChainRun {
    pub fn chain(&self) -> &PhaseInterceptorChain {
        &self.chain
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn outcome(&self) -> &ChainOutcome {
        &self.outcome
    }

    pub fn is_suspended(&self) -> bool {
        self.outcome == ChainOutcome::Suspended
    }

    /// 恢复挂起的运行。
    pub fn resume(&mut self) -> Result<&ChainOutcome, ChainError> {
        self.outcome = self.chain.resume(&mut self.message)?;
        Ok(&self.outcome)
    }

    pub fn into_parts(self) -> (PhaseInterceptorChain, Message, ChainOutcome) {
        (self.chain, self.message, self.outcome)
    }
}

impl fmt::Debug for ChainRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRun")
            .field("chain", &self.chain)
            .field("message", &self.message.id())
            .field("outcome", &self.outcome)
            .finish()
    }
}

type SuspensionHandler = dyn Fn(ChainRun) + Send + Sync;

/// 为每条入站报文构建并驱动新链。
pub struct ChainInitiationObserver {
    template: ChainTemplate,
    on_suspend: Option<Arc<SuspensionHandler>>,
}

impl ChainInitiationObserver {
    pub fn new(template: ChainTemplate) -> Self {
        Self {
            template,
            on_suspend: None,
        }
    }

    /// 接管经由 `on_message` 进入后挂起的运行。
    pub fn with_suspension_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ChainRun) + Send + Sync + 'static,
    {
        self.on_suspend = Some(Arc::new(handler));
        self
    }

    pub fn template(&self) -> &ChainTemplate {
        &self.template
    }

    /// 构建新链并驱动报文。
    pub fn dispatch(&self, mut message: Message) -> Result<ChainRun, ChainError> {
        let mut chain = self.template.build()?;
        let starting_after = take_id(&mut message, message_keys::STARTING_AFTER);
        let starting_at = take_id(&mut message, message_keys::STARTING_AT);

        let outcome = match (starting_after, starting_at) {
            (Some(id), _) if chain.contains(&id) => {
                debug!({ keys::INTERCEPTOR_ID } = %id, "chain starts after interceptor");
                chain.do_intercept_starting_after(&mut message, &id)?
            }
            (_, Some(id)) if chain.contains(&id) => {
                debug!({ keys::INTERCEPTOR_ID } = %id, "chain starts at interceptor");
                chain.do_intercept_starting_at(&mut message, &id)?
            }
            (None, None) => chain.do_intercept(&mut message)?,
            _ => {
                debug!("start marker names an interceptor outside this chain, running from the beginning");
                chain.do_intercept(&mut message)?
            }
        };
        Ok(ChainRun {
            chain,
            message,
            outcome,
        })
    }
}

impl MessageObserver for ChainInitiationObserver {
    fn on_message(&self, message: Message) {
        match self.dispatch(message) {
            Ok(run) if run.is_suspended() => match &self.on_suspend {
                Some(handler) => handler(run),
                None => warn!(
                    { keys::CHAIN_LEG } = self.template.leg(),
                    "chain suspended without a suspension handler, run dropped"
                ),
            },
            Ok(run) => debug!(
                { keys::CHAIN_LEG } = self.template.leg(),
                { keys::CHAIN_STATE } = run.chain().state().as_str(),
                "inbound chain finished"
            ),
            Err(err) => warn!(
                { keys::CHAIN_LEG } = self.template.leg(),
                { keys::ERROR_CODE } = err.code(),
                "inbound chain could not run: {err}"
            ),
        }
    }
}

impl fmt::Debug for ChainInitiationObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainInitiationObserver")
            .field("template", &self.template)
            .field("suspension_handler", &self.on_suspend.is_some())
            .finish()
    }
}

fn take_id(message: &mut Message, key: &str) -> Option<String> {
    match message.remove_property(key) {
        Some(Value::String(id)) => Some(id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        exchange::Exchange,
        interceptor::{FnInterceptor, Flow, InterceptorRegistration},
        message::{Direction, Role},
        phase::PhaseRegistry,
    };

    fn template(journal: &Arc<Mutex<Vec<&'static str>>>) -> ChainTemplate {
        let phases = Arc::new(PhaseRegistry::from_pairs([("receive", 0), ("invoke", 10)]).unwrap());
        let mut template = ChainTemplate::new("requestor-inbound", phases);
        for (id, phase) in [("first", "receive"), ("second", "receive"), ("third", "invoke")] {
            let journal = Arc::clone(journal);
            template.push(InterceptorRegistration::of(
                id,
                phase,
                FnInterceptor::new(move |_, _| {
                    journal.lock().unwrap().push(id);
                    Ok(Flow::Continue)
                }),
            ));
        }
        template
    }

    #[test]
    fn starting_after_marker_is_honoured_and_consumed() {
        let journal = Arc::default();
        let observer = ChainInitiationObserver::new(template(&journal));
        let mut message = Message::new(Exchange::new(), Direction::Inbound, Role::Requestor);
        message.set_property(message_keys::STARTING_AFTER, "first");

        let run = observer.dispatch(message).unwrap();
        assert_eq!(run.outcome(), &ChainOutcome::Completed);
        assert!(run.message().property(message_keys::STARTING_AFTER).is_none());
        assert_eq!(journal.lock().unwrap().as_slice(), ["second", "third"]);
    }

    #[test]
    fn foreign_marker_runs_whole_chain() {
        let journal = Arc::default();
        let observer = ChainInitiationObserver::new(template(&journal));
        let mut message = Message::new(Exchange::new(), Direction::Inbound, Role::Requestor);
        message.set_property(message_keys::STARTING_AT, "elsewhere");
        observer.on_message(message);
        assert_eq!(journal.lock().unwrap().as_slice(), ["first", "second", "third"]);
    }
}

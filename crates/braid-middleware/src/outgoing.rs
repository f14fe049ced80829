//! 入站腿结束后接力出站链。
//!
//! # 教案式说明
//! - **意图（Why）**：服务端的一次交换由两条腿组成，入站腿在 `invoke` 之后需要把响应交给新建的出站链；
//!   这一步本身就是一个拦截器，放在 `post-invoke` 阶段。
//! - **逻辑（How）**：取出交换出站槽中的响应（没有时以请求的回复报文兜底），按模板构建出站链并驱动；
//!   出站链结束后把响应放回出站槽，传输层或测试可从中读取最终载荷。
//! - **契约（What）**：
//!   - 单向交换或请求方腿直接放行；
//!   - 出站链构建失败转换为接收方故障，由入站链回卷并派发；
//!   - 出站链自身的故障由出站链处理，入站链照常结束，半成品响应被丢弃，只留下故障报文；
//!   - 出站链挂起时记录告警，恢复由持有链的传输层负责，此处不保留句柄。

use std::sync::Arc;

use braid_core::{
    ChainOutcome, ChainTemplate, Fault, Interceptor, InterceptorRegistration, Message,
    interceptor::{ChainControl, Flow, InterceptResult, WILDCARD},
    observability::keys,
    phase::names,
};
use tracing::{debug, warn};

/// 构建并驱动出站响应链的拦截器。
pub struct OutgoingChainInterceptor {
    template: Arc<ChainTemplate>,
}

impl OutgoingChainInterceptor {
    pub const ID: &'static str = "braid.outgoing";

    pub fn new(template: ChainTemplate) -> Self {
        Self {
            template: Arc::new(template),
        }
    }

    pub fn template(&self) -> &ChainTemplate {
        &self.template
    }

    /// 放入 `post-invoke` 阶段的最后。
    pub fn registration(self) -> InterceptorRegistration {
        InterceptorRegistration::of(Self::ID, names::POST_INVOKE, self).after(WILDCARD)
    }
}

impl Interceptor for OutgoingChainInterceptor {
    fn handle_message(&self, message: &mut Message, _chain: &mut ChainControl) -> InterceptResult {
        let exchange = message.exchange().clone();
        if message.is_requestor() || exchange.is_one_way() {
            return Ok(Flow::Continue);
        }

        let mut chain = self.template.build().map_err(|err| {
            Fault::receiver(format!("outbound chain could not be built: {err}"))
        })?;
        let mut response = exchange.take_out_message().unwrap_or_else(|| message.reply());

        let outcome = chain.do_intercept(&mut response).map_err(|err| {
            Fault::receiver(format!("outbound chain could not run: {err}"))
        })?;
        match &outcome {
            ChainOutcome::Suspended => warn!(
                { keys::CHAIN_LEG } = chain.leg(),
                "outbound chain suspended; the transport owns its resumption"
            ),
            ChainOutcome::Faulted { fault, .. } => debug!(
                { keys::CHAIN_LEG } = chain.leg(),
                { keys::FAULT_CODE } = fault.code().as_str(),
                "outbound chain dispatched its own fault"
            ),
            _ => debug!(
                { keys::CHAIN_LEG } = chain.leg(),
                { keys::CHAIN_STATE } = chain.state().as_str(),
                "outbound chain finished"
            ),
        }
        match outcome {
            ChainOutcome::Completed
            | ChainOutcome::Suspended
            | ChainOutcome::Aborted
            | ChainOutcome::Redirected => {
                exchange.set_out_message(response);
            }
            // 故障报文取代半成品载荷；取消或拆除后不再有响应。
            ChainOutcome::Faulted { .. } | ChainOutcome::Cancelled | ChainOutcome::TornDown(_) => {
                drop(response)
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use braid_core::{
        Exchange, PhaseInterceptorChain, PhaseRegistry,
        interceptor::FnInterceptor,
        message::{Direction, Role},
    };

    use super::*;

    fn outbound(tag: &'static str) -> ChainTemplate {
        ChainTemplate::new("responder-outbound", Arc::new(PhaseRegistry::default_outbound())).with(
            InterceptorRegistration::of(
                "tag",
                names::PRE_MARSHAL,
                FnInterceptor::new(move |message, _| {
                    let mut body = message.content().to_vec();
                    body.extend_from_slice(tag.as_bytes());
                    message.set_content(body);
                    Ok(Flow::Continue)
                }),
            ),
        )
    }

    fn inbound_with(interceptor: OutgoingChainInterceptor) -> PhaseInterceptorChain {
        let mut chain = PhaseInterceptorChain::new(Arc::new(PhaseRegistry::default_inbound()));
        chain.add(interceptor.registration()).unwrap();
        chain
    }

    #[test]
    fn drives_outbound_chain_with_reply_when_slot_is_empty() {
        let exchange = Exchange::new();
        let mut chain = inbound_with(OutgoingChainInterceptor::new(outbound("<ack/>")));
        let mut request = Message::new(exchange.clone(), Direction::Inbound, Role::Responder);

        assert_eq!(chain.do_intercept(&mut request).unwrap(), ChainOutcome::Completed);
        let response = exchange.take_out_message().unwrap();
        assert_eq!(response.direction(), Direction::Outbound);
        assert_eq!(response.content().as_ref(), b"<ack/>");
    }

    #[test]
    fn outbound_fault_discards_partial_response() {
        let template = outbound("<half-built").with(InterceptorRegistration::of(
            "marshal-fails",
            names::MARSHAL,
            FnInterceptor::new(|_, _| Err(Fault::receiver("cannot marshal"))),
        ));
        let exchange = Exchange::new();
        let mut chain = inbound_with(OutgoingChainInterceptor::new(template));
        let mut request = Message::new(exchange.clone(), Direction::Inbound, Role::Responder);

        assert_eq!(chain.do_intercept(&mut request).unwrap(), ChainOutcome::Completed);
        assert!(exchange.take_out_message().is_none(), "半成品载荷不得留在出站槽");
        assert!(exchange.has_out_fault_message());
        exchange.release();
    }

    #[test]
    fn one_way_exchange_builds_no_outbound_chain() {
        let exchange = Exchange::one_way();
        let mut chain = inbound_with(OutgoingChainInterceptor::new(outbound("<ack/>")));
        let mut request = Message::new(exchange.clone(), Direction::Inbound, Role::Responder);

        chain.do_intercept(&mut request).unwrap();
        assert!(exchange.take_out_message().is_none());
    }

    #[test]
    fn unbuildable_template_becomes_receiver_fault() {
        let broken = ChainTemplate::new("responder-outbound", Arc::new(PhaseRegistry::default_outbound()))
            .with(InterceptorRegistration::of(
                "misplaced",
                names::INVOKE,
                FnInterceptor::new(|_, _| Ok(Flow::Continue)),
            ));
        let exchange = Exchange::new();
        let mut chain = inbound_with(OutgoingChainInterceptor::new(broken));
        let mut request = Message::new(exchange.clone(), Direction::Inbound, Role::Responder);

        match chain.do_intercept(&mut request).unwrap() {
            ChainOutcome::Faulted { fault, .. } => {
                assert_eq!(fault.raised_by(), Some(OutgoingChainInterceptor::ID));
                assert!(fault.reason().contains("unknown phase"));
            }
            other => panic!("expected fault, got {other:?}"),
        }
        exchange.release();
    }
}

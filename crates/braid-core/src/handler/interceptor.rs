//! 把 Handler 调用器接入拦截器链。
//!
//! # 教案式说明
//! - **意图（Why）**：Handler 链本身不知道拦截器链的存在；这里的三个拦截器把
//!   “Handler 中止”翻译为拦截器链上的动作，并落实方向性表：
//!
//!   | 请求方 | 出站 | 中止时 |
//!   |---|---|---|
//!   | 是 | 是 | 中止链路，以当前报文内容合成响应，改道交给入站路径 |
//!   | 是 | 否 | 关闭本次调用（跳过后续逻辑层 Handler），链路继续 |
//!   | 否 | 任意 | 不做处理，仅记录调试日志 |
//!
//! - **契约（What）**：
//!   - 协议层 Handler 为空时直接返回，不向 [`HandlerContextFactory`] 请求上下文；
//!   - Handler 故障转换为 [`Fault`]，由链路进入故障模式；
//!   - 响应腿、单向交换或发生中止/故障后，对被调用过的 Handler 逆序执行 `close`。

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace};

use super::{
    HandlerChainInvoker,
    context::{
        DefaultContextFactory, HandlerContextFactory, HandlerInvocation, InvocationAccess,
        invocation_mut,
    },
};
use crate::{
    fault::Fault,
    interceptor::{ChainControl, Flow, InterceptResult, Interceptor, InterceptorRegistration},
    message::{Message, keys as message_keys},
    observability::keys,
};

/// 是否应在本次遍历后通知 `close`。
fn invocation_finished<C: InvocationAccess>(ctx: &mut C) -> bool {
    let invocation = ctx.invocation();
    invocation.is_closed()
        || invocation.is_aborted()
        || invocation.is_fault_raised()
        || !invocation.is_response_expected()
}

/// 中止后按方向性表决定链路动作。
fn apply_abort(message: &mut Message, chain: &mut ChainControl, resume_after: &str) -> Flow {
    match (message.is_requestor(), message.is_outbound()) {
        (true, true) => {
            if message.exchange().is_one_way() {
                debug!("handler aborted a one-way request, chain aborted without response");
                return Flow::Abort;
            }
            let mut response = message.reply().with_content(message.content().clone());
            response.set_property(message_keys::STARTING_AFTER, resume_after);
            response.set_property(message_keys::REDIRECTED_RESPONSE, Value::Bool(true));
            let mut invocation = HandlerInvocation::for_message(&response);
            invocation.close();
            response.extensions_mut().insert(invocation);
            debug!(
                { keys::MESSAGE_ID } = response.id(),
                "handler aborted outbound request, redirecting synthesized response"
            );
            chain.redirect(response);
            Flow::Abort
        }
        (true, false) => {
            invocation_mut(message).close();
            debug!("handler aborted inbound response, remaining logical handlers skipped");
            Flow::Continue
        }
        (false, outbound) => {
            debug!(outbound, "handler abort on responder side ignored");
            Flow::Continue
        }
    }
}

/// 运行协议层 Handler 的拦截器。
pub struct ProtocolHandlerInterceptor {
    invoker: Arc<HandlerChainInvoker>,
    factory: Arc<dyn HandlerContextFactory>,
}

impl ProtocolHandlerInterceptor {
    pub const ID: &'static str = "braid.handler.protocol";

    pub fn new(invoker: Arc<HandlerChainInvoker>) -> Self {
        Self {
            invoker,
            factory: Arc::new(DefaultContextFactory),
        }
    }

    pub fn with_context_factory(mut self, factory: Arc<dyn HandlerContextFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// 以固定 id 放入指定阶段。
    pub fn registration(self, phase: impl Into<String>) -> InterceptorRegistration {
        InterceptorRegistration::of(Self::ID, phase, self)
    }
}

impl Interceptor for ProtocolHandlerInterceptor {
    fn handle_message(&self, message: &mut Message, chain: &mut ChainControl) -> InterceptResult {
        if self.invoker.protocol_handlers().is_empty() {
            trace!("no protocol handlers configured");
            return Ok(Flow::Continue);
        }
        if message
            .extensions()
            .get::<HandlerInvocation>()
            .is_some_and(HandlerInvocation::is_closed)
        {
            trace!("handler invocation already closed");
            return Ok(Flow::Continue);
        }

        let is_requestor = message.is_requestor();
        let result = {
            let mut ctx = self.factory.protocol_context(message);
            let result = self.invoker.invoke_protocol_handlers(is_requestor, &mut ctx);
            if invocation_finished(&mut ctx) {
                self.invoker.close_protocol_handlers(&mut ctx);
            }
            result
        };

        match result {
            Ok(true) => Ok(Flow::Continue),
            Ok(false) => Ok(apply_abort(message, chain, Self::ID)),
            Err(fault) => Err(Fault::from(fault)),
        }
    }
}

/// 故障链上回调协议层 Handler `handle_fault` 的拦截器。
pub struct ProtocolHandlerFaultInterceptor {
    invoker: Arc<HandlerChainInvoker>,
    factory: Arc<dyn HandlerContextFactory>,
}

impl ProtocolHandlerFaultInterceptor {
    pub const ID: &'static str = "braid.handler.protocol.fault";

    pub fn new(invoker: Arc<HandlerChainInvoker>) -> Self {
        Self {
            invoker,
            factory: Arc::new(DefaultContextFactory),
        }
    }

    pub fn with_context_factory(mut self, factory: Arc<dyn HandlerContextFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn registration(self, phase: impl Into<String>) -> InterceptorRegistration {
        InterceptorRegistration::of(Self::ID, phase, self)
    }
}

impl Interceptor for ProtocolHandlerFaultInterceptor {
    fn handle_message(&self, message: &mut Message, _chain: &mut ChainControl) -> InterceptResult {
        if self.invoker.protocol_handlers().is_empty() {
            return Ok(Flow::Continue);
        }
        let is_requestor = message.is_requestor();
        let mut ctx = self.factory.protocol_context(message);
        let proceed = self
            .invoker
            .invoke_protocol_handlers_handle_fault(is_requestor, &mut ctx);
        self.invoker.close_protocol_handlers(&mut ctx);
        if proceed {
            Ok(Flow::Continue)
        } else {
            debug!("protocol handler stopped fault processing, fault chain aborted");
            Ok(Flow::Abort)
        }
    }
}

/// 运行逻辑层 Handler 的拦截器；调用已关闭时跳过。
pub struct LogicalHandlerInterceptor {
    invoker: Arc<HandlerChainInvoker>,
    factory: Arc<dyn HandlerContextFactory>,
}

impl LogicalHandlerInterceptor {
    pub const ID: &'static str = "braid.handler.logical";

    pub fn new(invoker: Arc<HandlerChainInvoker>) -> Self {
        Self {
            invoker,
            factory: Arc::new(DefaultContextFactory),
        }
    }

    pub fn with_context_factory(mut self, factory: Arc<dyn HandlerContextFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn registration(self, phase: impl Into<String>) -> InterceptorRegistration {
        InterceptorRegistration::of(Self::ID, phase, self)
    }
}

impl Interceptor for LogicalHandlerInterceptor {
    fn handle_message(&self, message: &mut Message, chain: &mut ChainControl) -> InterceptResult {
        if self.invoker.logical_handlers().is_empty() {
            return Ok(Flow::Continue);
        }
        let is_requestor = message.is_requestor();
        let result = {
            let mut ctx = self.factory.logical_context(message);
            let result = self.invoker.invoke_logical_handlers(is_requestor, &mut ctx);
            if invocation_finished(&mut ctx) {
                self.invoker.close_logical_handlers(&mut ctx);
            }
            result
        };

        match result {
            Ok(true) => Ok(Flow::Continue),
            Ok(false) => Ok(apply_abort(message, chain, Self::ID)),
            Err(fault) => Err(Fault::from(fault)),
        }
    }
}

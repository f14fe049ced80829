//! 嵌套的 Handler 链。
//!
//! # 教案式说明
//! - **意图（Why）**：协议层 Handler（可看到整条报文）与逻辑层 Handler（只看载荷）是应用可插拔的
//!   第二层处理链，挂在拦截器链的某个阶段里执行，其中止行为随“请求方/响应方”与“出站/入站”而不同。
//! - **结构（How）**：
//!   - [`ProtocolHandler`] / [`LogicalHandler`]：应用实现的契约；
//!   - [`context`]：Handler 上下文与逐报文调用状态 [`HandlerInvocation`]；
//!   - [`invoker`]：[`HandlerChainInvoker`]，负责正向遍历、中止后的反向遍历、故障回调与 `close`；
//!   - [`interceptor`]：把调用器接入拦截器链的三个拦截器，并落实方向性表。
//! - **契约（What）**：调用器本身无逐报文状态，可被多条链共享；方向翻转与调用进度都记录在报文扩展槽中。

pub mod context;
pub mod interceptor;
pub mod invoker;

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::fault::{Fault, FaultCode};

pub use context::{
    DefaultContextFactory, HandlerContextFactory, HandlerInvocation, LogicalContext,
    ProtocolContext,
};
pub use interceptor::{
    LogicalHandlerInterceptor, ProtocolHandlerFaultInterceptor, ProtocolHandlerInterceptor,
};
pub use invoker::HandlerChainInvoker;

/// Handler 对一条报文的处理结论。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerFlow {
    Continue,
    /// 停止后续 Handler；在期待响应的请求腿上会触发反向遍历。
    Abort,
}

/// Handler 抛出的协议故障。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("handler fault ({code}): {reason}")]
pub struct HandlerFault {
    code: FaultCode,
    reason: String,
    detail: Option<String>,
}

impl HandlerFault {
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn sender(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::Sender, reason)
    }

    pub fn receiver(reason: impl Into<String>) -> Self {
        Self::new(FaultCode::Receiver, reason)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn code(&self) -> FaultCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<HandlerFault> for Fault {
    fn from(fault: HandlerFault) -> Self {
        let converted = Fault::new(fault.code, fault.reason);
        match fault.detail {
            Some(detail) => converted.with_detail(detail),
            None => converted,
        }
    }
}

/// 协议层 Handler：可读写整条报文（载荷与属性）。
pub trait ProtocolHandler: Send + Sync + 'static {
    /// 日志中显示的名称。
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn handle_message(&self, ctx: &mut ProtocolContext<'_>) -> Result<HandlerFlow, HandlerFault>;

    /// 故障路径回调；返回 `Abort` 时停止后续 Handler 的故障回调。
    fn handle_fault(&self, ctx: &mut ProtocolContext<'_>) -> HandlerFlow {
        let _ = ctx;
        HandlerFlow::Continue
    }

    /// 本次调用结束时的通知，每个被调用过的 Handler 至多收到一次。
    fn close(&self, ctx: &mut ProtocolContext<'_>) {
        let _ = ctx;
    }
}

/// 逻辑层 Handler：只接触载荷。
pub trait LogicalHandler: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn handle_message(&self, ctx: &mut LogicalContext<'_>) -> Result<HandlerFlow, HandlerFault>;

    fn handle_fault(&self, ctx: &mut LogicalContext<'_>) -> HandlerFlow {
        let _ = ctx;
        HandlerFlow::Continue
    }

    fn close(&self, ctx: &mut LogicalContext<'_>) {
        let _ = ctx;
    }
}

/// 配置中的一个 Handler。
#[derive(Clone)]
pub enum Handler {
    Protocol(Arc<dyn ProtocolHandler>),
    Logical(Arc<dyn LogicalHandler>),
}

impl Handler {
    pub fn protocol(handler: impl ProtocolHandler) -> Self {
        Handler::Protocol(Arc::new(handler))
    }

    pub fn logical(handler: impl LogicalHandler) -> Self {
        Handler::Logical(Arc::new(handler))
    }

    pub fn name(&self) -> &str {
        match self {
            Handler::Protocol(handler) => handler.name(),
            Handler::Logical(handler) => handler.name(),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Protocol(handler) => f.debug_tuple("Protocol").field(&handler.name()).finish(),
            Handler::Logical(handler) => f.debug_tuple("Logical").field(&handler.name()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_fault_converts_into_fault() {
        let fault: Fault = HandlerFault::sender("bad header").with_detail("wsa:To").into();
        assert_eq!(fault.code(), FaultCode::Sender);
        assert_eq!(fault.reason(), "bad header");
        assert_eq!(fault.detail(), Some("wsa:To"));
        assert!(fault.raised_by().is_none());
    }
}

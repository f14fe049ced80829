//! Handler 上下文与逐报文调用状态。

use bytes::Bytes;
use serde_json::Value;

use crate::message::Message;

/// 一条报文上的 Handler 调用进度，存放在 [`Message::extensions_mut`] 中。
///
/// # 契约说明（What）
/// - `outbound` 初值取报文方向，请求腿上的中止或故障会把它翻转，反向遍历中的 Handler
///   据此看到“响应方向”；
/// - `closed` 表示本次调用已关闭，后续的逻辑层 Handler 不再执行；
/// - `*_invoked` 记录被调用过的 Handler 前缀长度，`close` 只通知这些 Handler。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerInvocation {
    outbound: bool,
    response_expected: bool,
    closed: bool,
    aborted: bool,
    fault_raised: bool,
    protocol_invoked: usize,
    logical_invoked: usize,
    protocol_closed: bool,
    logical_closed: bool,
}

impl HandlerInvocation {
    /// 按报文方向、角色与交换模式初始化。只有双向交换的请求腿才期待响应。
    pub fn for_message(message: &Message) -> Self {
        let request_leg = message.is_requestor() == message.is_outbound();
        Self {
            outbound: message.is_outbound(),
            response_expected: request_leg && !message.exchange().is_one_way(),
            closed: false,
            aborted: false,
            fault_raised: false,
            protocol_invoked: 0,
            logical_invoked: 0,
            protocol_closed: false,
            logical_closed: false,
        }
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_response_expected(&self) -> bool {
        self.response_expected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_fault_raised(&self) -> bool {
        self.fault_raised
    }

    pub fn protocol_invoked(&self) -> usize {
        self.protocol_invoked
    }

    pub fn logical_invoked(&self) -> usize {
        self.logical_invoked
    }

    /// 关闭本次调用。
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn reverse_direction(&mut self) {
        self.outbound = !self.outbound;
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    pub(crate) fn mark_fault_raised(&mut self) {
        self.fault_raised = true;
    }

    pub(crate) fn record_invoked(&mut self, kind: HandlerKind, count: usize) {
        let slot = match kind {
            HandlerKind::Protocol => &mut self.protocol_invoked,
            HandlerKind::Logical => &mut self.logical_invoked,
        };
        *slot = (*slot).max(count);
    }

    pub(crate) fn invoked(&self, kind: HandlerKind) -> usize {
        match kind {
            HandlerKind::Protocol => self.protocol_invoked,
            HandlerKind::Logical => self.logical_invoked,
        }
    }

    /// 标记某一层已执行 `close`；返回此前是否已执行过。
    pub(crate) fn take_close(&mut self, kind: HandlerKind) -> bool {
        let slot = match kind {
            HandlerKind::Protocol => &mut self.protocol_closed,
            HandlerKind::Logical => &mut self.logical_closed,
        };
        std::mem::replace(slot, true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    Protocol,
    Logical,
}

impl HandlerKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            HandlerKind::Protocol => "protocol",
            HandlerKind::Logical => "logical",
        }
    }
}

/// 读取或创建报文上的调用状态。
pub(crate) fn invocation_mut(message: &mut Message) -> &mut HandlerInvocation {
    let fresh = HandlerInvocation::for_message(message);
    message.extensions_mut().get_or_insert_with(|| fresh)
}

/// 调用器访问调用状态的统一入口。
pub(crate) trait InvocationAccess {
    fn invocation(&mut self) -> &mut HandlerInvocation;
}

/// 协议层 Handler 的上下文。
#[derive(Debug)]
pub struct ProtocolContext<'m> {
    message: &'m mut Message,
}

impl<'m> ProtocolContext<'m> {
    pub fn new(message: &'m mut Message) -> Self {
        Self { message }
    }

    pub fn message(&self) -> &Message {
        &*self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut *self.message
    }

    /// 当前视角下的方向；反向遍历时与报文原始方向相反。
    pub fn is_outbound(&self) -> bool {
        self.message
            .extensions()
            .get::<HandlerInvocation>()
            .map_or_else(|| self.message.is_outbound(), HandlerInvocation::is_outbound)
    }

    pub fn is_requestor(&self) -> bool {
        self.message.is_requestor()
    }

    pub fn content(&self) -> &Bytes {
        self.message.content()
    }

    pub fn set_content(&mut self, content: impl Into<Bytes>) -> Bytes {
        self.message.set_content(content)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.message.property(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.message.set_property(key, value)
    }
}

impl InvocationAccess for ProtocolContext<'_> {
    fn invocation(&mut self) -> &mut HandlerInvocation {
        invocation_mut(self.message)
    }
}

/// 逻辑层 Handler 的上下文：只暴露载荷与方向。
#[derive(Debug)]
pub struct LogicalContext<'m> {
    message: &'m mut Message,
}

impl<'m> LogicalContext<'m> {
    pub fn new(message: &'m mut Message) -> Self {
        Self { message }
    }

    pub fn is_outbound(&self) -> bool {
        self.message
            .extensions()
            .get::<HandlerInvocation>()
            .map_or_else(|| self.message.is_outbound(), HandlerInvocation::is_outbound)
    }

    pub fn payload(&self) -> &Bytes {
        self.message.content()
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) -> Bytes {
        self.message.set_content(payload)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.message.property(key)
    }
}

impl InvocationAccess for LogicalContext<'_> {
    fn invocation(&mut self) -> &mut HandlerInvocation {
        invocation_mut(self.message)
    }
}

/// 创建 Handler 上下文的工厂；替换它可以观察上下文的构造时机。
pub trait HandlerContextFactory: Send + Sync + 'static {
    fn protocol_context<'m>(&self, message: &'m mut Message) -> ProtocolContext<'m> {
        ProtocolContext::new(message)
    }

    fn logical_context<'m>(&self, message: &'m mut Message) -> LogicalContext<'m> {
        LogicalContext::new(message)
    }
}

/// 直接包装报文的默认工厂。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultContextFactory;

impl HandlerContextFactory for DefaultContextFactory {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::Exchange,
        message::{Direction, Role},
    };

    #[test]
    fn only_two_way_request_legs_expect_a_response() {
        let cases = [
            (Exchange::new(), Direction::Outbound, Role::Requestor, true),
            (Exchange::new(), Direction::Inbound, Role::Responder, true),
            (Exchange::new(), Direction::Inbound, Role::Requestor, false),
            (Exchange::new(), Direction::Outbound, Role::Responder, false),
            (Exchange::one_way(), Direction::Outbound, Role::Requestor, false),
        ];
        for (exchange, direction, role, expected) in cases {
            let message = Message::new(exchange, direction, role);
            assert_eq!(
                HandlerInvocation::for_message(&message).is_response_expected(),
                expected,
                "{direction:?}/{role:?}"
            );
        }
    }

    #[test]
    fn context_reports_flipped_direction() {
        let mut message = Message::new(Exchange::new(), Direction::Outbound, Role::Requestor);
        let mut ctx = ProtocolContext::new(&mut message);
        assert!(ctx.is_outbound());
        ctx.invocation().reverse_direction();
        assert!(!ctx.is_outbound());
        assert!(message.is_outbound(), "报文本身的方向不变");
    }

    #[test]
    fn close_is_taken_once_per_kind() {
        let message = Message::new(Exchange::new(), Direction::Inbound, Role::Responder);
        let mut invocation = HandlerInvocation::for_message(&message);
        assert!(!invocation.take_close(HandlerKind::Protocol));
        assert!(invocation.take_close(HandlerKind::Protocol));
        assert!(!invocation.take_close(HandlerKind::Logical));
    }
}

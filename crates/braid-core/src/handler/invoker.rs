//! Handler 链调用器。
//!
//! # 教案式说明
//! - **意图（Why）**：协议层与逻辑层 Handler 的遍历规则相同，只是上下文类型不同；
//!   遍历逻辑写成一份泛型实现，两层共用。
//! - **逻辑（How）**：
//!   1. 按注册顺序正向调用 `handle_message`，每调用一个就把“已调用前缀长度”写入报文上的
//!      [`HandlerInvocation`]；
//!   2. 某个 Handler 返回 `Abort`：若本腿期待响应，翻转方向，对它之前的 Handler 逆序再调用一次
//!      `handle_message`（它们此时处理的是响应），遇到再次 `Abort` 即停；
//!   3. 某个 Handler 抛出故障：若本腿期待响应，翻转方向，对之前的 Handler 逆序调用 `handle_fault`，
//!      然后把故障返回给调用方；
//!   4. `close` 对被调用过的 Handler 逆序通知，每层每条报文至多一次。
//! - **契约（What）**：调用器不保存逐报文状态；`is_requestor` 与报文方向一起决定当前是请求腿还是响应腿。

use std::{fmt, sync::Arc};

use tracing::{debug, trace};

use super::{
    Handler, HandlerFault, HandlerFlow, LogicalHandler, ProtocolHandler,
    context::{HandlerKind, InvocationAccess, LogicalContext, ProtocolContext},
};
use crate::observability::keys;

/// 持有两层 Handler 的调用器。
#[derive(Clone, Default)]
pub struct HandlerChainInvoker {
    protocol: Vec<Arc<dyn ProtocolHandler>>,
    logical: Vec<Arc<dyn LogicalHandler>>,
}

impl HandlerChainInvoker {
    /// 按类别拆分，类别内保持配置顺序。
    pub fn new(handlers: Vec<Handler>) -> Self {
        let mut invoker = Self::default();
        for handler in handlers {
            match handler {
                Handler::Protocol(handler) => invoker.protocol.push(handler),
                Handler::Logical(handler) => invoker.logical.push(handler),
            }
        }
        invoker
    }

    pub fn protocol_handlers(&self) -> &[Arc<dyn ProtocolHandler>] {
        &self.protocol
    }

    pub fn logical_handlers(&self) -> &[Arc<dyn LogicalHandler>] {
        &self.logical
    }

    pub fn is_empty(&self) -> bool {
        self.protocol.is_empty() && self.logical.is_empty()
    }

    /// 正向调用协议层 Handler；返回 `Ok(false)` 表示有 Handler 中止。
    pub fn invoke_protocol_handlers(
        &self,
        is_requestor: bool,
        ctx: &mut ProtocolContext<'_>,
    ) -> Result<bool, HandlerFault> {
        traverse(
            &self.protocol,
            HandlerKind::Protocol,
            is_requestor,
            ctx,
            |handler, ctx| handler.handle_message(ctx),
            |handler, ctx| handler.handle_fault(ctx),
        )
    }

    /// 正向调用协议层 Handler 的 `handle_fault`；返回 `false` 表示有 Handler 中止了故障回调。
    pub fn invoke_protocol_handlers_handle_fault(
        &self,
        is_requestor: bool,
        ctx: &mut ProtocolContext<'_>,
    ) -> bool {
        traverse_faults(
            &self.protocol,
            HandlerKind::Protocol,
            is_requestor,
            ctx,
            |handler, ctx| handler.handle_fault(ctx),
        )
    }

    /// 正向调用逻辑层 Handler；调用已关闭时直接返回 `Ok(true)`。
    pub fn invoke_logical_handlers(
        &self,
        is_requestor: bool,
        ctx: &mut LogicalContext<'_>,
    ) -> Result<bool, HandlerFault> {
        if ctx.invocation().is_closed() {
            trace!("handler invocation closed, logical handlers skipped");
            return Ok(true);
        }
        traverse(
            &self.logical,
            HandlerKind::Logical,
            is_requestor,
            ctx,
            |handler, ctx| handler.handle_message(ctx),
            |handler, ctx| handler.handle_fault(ctx),
        )
    }

    pub fn invoke_logical_handlers_handle_fault(
        &self,
        is_requestor: bool,
        ctx: &mut LogicalContext<'_>,
    ) -> bool {
        traverse_faults(
            &self.logical,
            HandlerKind::Logical,
            is_requestor,
            ctx,
            |handler, ctx| handler.handle_fault(ctx),
        )
    }

    /// 逆序通知被调用过的协议层 Handler。
    pub fn close_protocol_handlers(&self, ctx: &mut ProtocolContext<'_>) {
        close_invoked(&self.protocol, HandlerKind::Protocol, ctx, |handler, ctx| {
            handler.close(ctx)
        });
    }

    /// 逆序通知被调用过的逻辑层 Handler。
    pub fn close_logical_handlers(&self, ctx: &mut LogicalContext<'_>) {
        close_invoked(&self.logical, HandlerKind::Logical, ctx, |handler, ctx| {
            handler.close(ctx)
        });
    }
}

impl fmt::Debug for HandlerChainInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChainInvoker")
            .field("protocol", &self.protocol.len())
            .field("logical", &self.logical.len())
            .finish()
    }
}

fn traverse<H, C>(
    handlers: &[Arc<H>],
    kind: HandlerKind,
    is_requestor: bool,
    ctx: &mut C,
    handle_message: impl Fn(&H, &mut C) -> Result<HandlerFlow, HandlerFault>,
    handle_fault: impl Fn(&H, &mut C) -> HandlerFlow,
) -> Result<bool, HandlerFault>
where
    H: ?Sized,
    C: InvocationAccess,
{
    for (index, handler) in handlers.iter().enumerate() {
        ctx.invocation().record_invoked(kind, index + 1);
        trace!(
            { keys::HANDLER_INDEX } = index,
            is_requestor,
            "invoking {} handler",
            kind.as_str()
        );
        match handle_message(handler.as_ref(), &mut *ctx) {
            Ok(HandlerFlow::Continue) => {}
            Ok(HandlerFlow::Abort) => {
                debug!(
                    { keys::HANDLER_INDEX } = index,
                    "{} handler aborted the invocation",
                    kind.as_str()
                );
                let invocation = ctx.invocation();
                invocation.mark_aborted();
                if invocation.is_response_expected() {
                    invocation.reverse_direction();
                    for (back, earlier) in handlers[..index].iter().enumerate().rev() {
                        match handle_message(earlier.as_ref(), &mut *ctx) {
                            Ok(HandlerFlow::Continue) => {}
                            Ok(HandlerFlow::Abort) => break,
                            Err(fault) => {
                                debug!(
                                    { keys::HANDLER_INDEX } = back,
                                    "fault while reversing after abort: {fault}"
                                );
                                break;
                            }
                        }
                    }
                }
                return Ok(false);
            }
            Err(fault) => {
                debug!(
                    { keys::HANDLER_INDEX } = index,
                    "{} handler raised a fault: {fault}",
                    kind.as_str()
                );
                let invocation = ctx.invocation();
                invocation.mark_fault_raised();
                if invocation.is_response_expected() {
                    invocation.reverse_direction();
                    for earlier in handlers[..index].iter().rev() {
                        if handle_fault(earlier.as_ref(), &mut *ctx) == HandlerFlow::Abort {
                            break;
                        }
                    }
                }
                return Err(fault);
            }
        }
    }
    Ok(true)
}

fn traverse_faults<H, C>(
    handlers: &[Arc<H>],
    kind: HandlerKind,
    is_requestor: bool,
    ctx: &mut C,
    handle_fault: impl Fn(&H, &mut C) -> HandlerFlow,
) -> bool
where
    H: ?Sized,
    C: InvocationAccess,
{
    for (index, handler) in handlers.iter().enumerate() {
        ctx.invocation().record_invoked(kind, index + 1);
        trace!(
            { keys::HANDLER_INDEX } = index,
            is_requestor,
            "invoking {} handler fault callback",
            kind.as_str()
        );
        if handle_fault(handler.as_ref(), &mut *ctx) == HandlerFlow::Abort {
            debug!(
                { keys::HANDLER_INDEX } = index,
                "{} handler stopped fault processing",
                kind.as_str()
            );
            ctx.invocation().mark_aborted();
            return false;
        }
    }
    true
}

fn close_invoked<H, C>(handlers: &[Arc<H>], kind: HandlerKind, ctx: &mut C, close: impl Fn(&H, &mut C))
where
    H: ?Sized,
    C: InvocationAccess,
{
    let invocation = ctx.invocation();
    if invocation.take_close(kind) {
        return;
    }
    let invoked = invocation.invoked(kind).min(handlers.len());
    for handler in handlers[..invoked].iter().rev() {
        close(handler.as_ref(), &mut *ctx);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        exchange::Exchange,
        handler::HandlerInvocation,
        message::{Direction, Message, Role},
    };

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Scripted {
        name: &'static str,
        journal: Journal,
        on_message: Result<HandlerFlow, HandlerFault>,
    }

    impl Scripted {
        fn handler(name: &'static str, journal: &Journal, on_message: Result<HandlerFlow, HandlerFault>) -> Handler {
            Handler::protocol(Scripted {
                name,
                journal: Arc::clone(journal),
                on_message,
            })
        }
    }

    impl ProtocolHandler for Scripted {
        fn handle_message(&self, ctx: &mut ProtocolContext<'_>) -> Result<HandlerFlow, HandlerFault> {
            let leg = if ctx.is_outbound() { "out" } else { "in" };
            self.journal.lock().unwrap().push(format!("{}:{leg}", self.name));
            self.on_message.clone()
        }

        fn handle_fault(&self, _ctx: &mut ProtocolContext<'_>) -> HandlerFlow {
            self.journal.lock().unwrap().push(format!("{}:fault", self.name));
            HandlerFlow::Continue
        }

        fn close(&self, _ctx: &mut ProtocolContext<'_>) {
            self.journal.lock().unwrap().push(format!("{}:close", self.name));
        }
    }

    fn request() -> Message {
        Message::new(Exchange::new(), Direction::Outbound, Role::Requestor)
    }

    #[test]
    fn partitions_by_kind_preserving_order() {
        struct Payload;
        impl LogicalHandler for Payload {
            fn handle_message(&self, _ctx: &mut LogicalContext<'_>) -> Result<HandlerFlow, HandlerFault> {
                Ok(HandlerFlow::Continue)
            }
        }
        let journal = Journal::default();
        let invoker = HandlerChainInvoker::new(vec![
            Scripted::handler("a", &journal, Ok(HandlerFlow::Continue)),
            Handler::logical(Payload),
            Scripted::handler("b", &journal, Ok(HandlerFlow::Continue)),
        ]);
        assert_eq!(invoker.protocol_handlers().len(), 2);
        assert_eq!(invoker.logical_handlers().len(), 1);
        assert_eq!(invoker.protocol_handlers()[1].name(), invoker.protocol_handlers()[0].name());
    }

    #[test]
    fn abort_on_request_leg_reverses_through_earlier_handlers() {
        let journal = Journal::default();
        let invoker = HandlerChainInvoker::new(vec![
            Scripted::handler("a", &journal, Ok(HandlerFlow::Continue)),
            Scripted::handler("b", &journal, Ok(HandlerFlow::Continue)),
            Scripted::handler("c", &journal, Ok(HandlerFlow::Abort)),
            Scripted::handler("d", &journal, Ok(HandlerFlow::Continue)),
        ]);
        let mut message = request();
        let mut ctx = ProtocolContext::new(&mut message);
        assert!(!invoker.invoke_protocol_handlers(true, &mut ctx).unwrap());
        invoker.close_protocol_handlers(&mut ctx);
        invoker.close_protocol_handlers(&mut ctx);

        assert_eq!(
            journal.lock().unwrap().as_slice(),
            ["a:out", "b:out", "c:out", "b:in", "a:in", "c:close", "b:close", "a:close"]
        );
        let invocation = message.extensions().get::<HandlerInvocation>().unwrap();
        assert!(invocation.is_aborted());
        assert_eq!(invocation.protocol_invoked(), 3);
    }

    #[test]
    fn abort_on_response_leg_just_stops() {
        let journal = Journal::default();
        let invoker = HandlerChainInvoker::new(vec![
            Scripted::handler("a", &journal, Ok(HandlerFlow::Continue)),
            Scripted::handler("b", &journal, Ok(HandlerFlow::Abort)),
            Scripted::handler("c", &journal, Ok(HandlerFlow::Continue)),
        ]);
        let mut message = Message::new(Exchange::new(), Direction::Inbound, Role::Requestor);
        let mut ctx = ProtocolContext::new(&mut message);
        assert!(!invoker.invoke_protocol_handlers(true, &mut ctx).unwrap());
        assert_eq!(journal.lock().unwrap().as_slice(), ["a:in", "b:in"]);
    }

    #[test]
    fn fault_unwinds_earlier_handlers_in_reverse() {
        let journal = Journal::default();
        let invoker = HandlerChainInvoker::new(vec![
            Scripted::handler("a", &journal, Ok(HandlerFlow::Continue)),
            Scripted::handler("b", &journal, Ok(HandlerFlow::Continue)),
            Scripted::handler("c", &journal, Err(HandlerFault::sender("rejected"))),
        ]);
        let mut message = Message::new(Exchange::new(), Direction::Inbound, Role::Responder);
        let mut ctx = ProtocolContext::new(&mut message);
        let fault = invoker.invoke_protocol_handlers(false, &mut ctx).unwrap_err();
        assert_eq!(fault.reason(), "rejected");
        assert_eq!(
            journal.lock().unwrap().as_slice(),
            ["a:in", "b:in", "c:in", "b:fault", "a:fault"]
        );
    }

    #[test]
    fn fault_callbacks_visit_every_handler() {
        let journal = Journal::default();
        let invoker = HandlerChainInvoker::new(vec![
            Scripted::handler("a", &journal, Ok(HandlerFlow::Continue)),
            Scripted::handler("b", &journal, Ok(HandlerFlow::Continue)),
        ]);
        let mut message = Message::new(Exchange::new(), Direction::Outbound, Role::Responder);
        let mut ctx = ProtocolContext::new(&mut message);
        assert!(invoker.invoke_protocol_handlers_handle_fault(false, &mut ctx));
        assert_eq!(journal.lock().unwrap().as_slice(), ["a:fault", "b:fault"]);
    }
}

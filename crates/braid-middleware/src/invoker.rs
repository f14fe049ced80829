//! `invoke` 阶段的服务派发。
//!
//! # 教案式说明
//! - **意图（Why）**：数据绑定与业务方法都在引擎之外；引擎只需要在 `invoke` 阶段把请求交给一个
//!   [`Service`]，再把结果放回交换，让后续的出站链接力。
//! - **契约（What）**：
//!   - 只在响应方的入站腿上派发，其余腿直接放行；
//!   - 服务返回的 [`Fault`] 原样抛出，由链路回卷并派发故障；
//!   - 单向交换不产生响应，服务结果被丢弃；
//!   - 双向交换的响应写入交换的出站报文槽，供 [`crate::OutgoingChainInterceptor`] 取用。

use std::sync::Arc;

use braid_core::{
    Fault, Interceptor, InterceptorRegistration, Message,
    interceptor::{ChainControl, Flow, InterceptResult},
    observability::keys,
    phase::names,
};
use bytes::Bytes;
use tracing::{debug, trace};

/// 业务服务：接收请求报文，返回响应载荷。
pub trait Service: Send + Sync + 'static {
    fn invoke(&self, request: &Message) -> Result<Bytes, Fault>;
}

impl<F> Service for F
where
    F: Fn(&Message) -> Result<Bytes, Fault> + Send + Sync + 'static,
{
    fn invoke(&self, request: &Message) -> Result<Bytes, Fault> {
        self(request)
    }
}

/// 调用 [`Service`] 的拦截器。
pub struct ServiceInvokerInterceptor {
    service: Arc<dyn Service>,
}

impl ServiceInvokerInterceptor {
    pub const ID: &'static str = "braid.service.invoker";

    pub fn new(service: impl Service) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    pub fn shared(service: Arc<dyn Service>) -> Self {
        Self { service }
    }

    /// 放入 `invoke` 阶段。
    pub fn registration(self) -> InterceptorRegistration {
        InterceptorRegistration::of(Self::ID, names::INVOKE, self)
    }
}

impl Interceptor for ServiceInvokerInterceptor {
    fn handle_message(&self, message: &mut Message, _chain: &mut ChainControl) -> InterceptResult {
        if message.is_requestor() || message.is_outbound() {
            trace!("service dispatch skipped outside the responder inbound leg");
            return Ok(Flow::Continue);
        }

        let body = self.service.invoke(message)?;
        let exchange = message.exchange().clone();
        if exchange.is_one_way() {
            debug!(
                { keys::EXCHANGE_ID } = exchange.id(),
                "one-way exchange, service result discarded"
            );
            return Ok(Flow::Continue);
        }

        let response = message.reply().with_content(body);
        debug!(
            { keys::EXCHANGE_ID } = exchange.id(),
            { keys::MESSAGE_ID } = response.id(),
            "service produced response"
        );
        exchange.set_out_message(response);
        Ok(Flow::Continue)
    }
}

//! 日志字段键。
//!
//! 所有 `tracing` 事件统一使用这里的键名，便于日志后端按字段聚合；键名保持低基数、点分小写。

pub mod keys {
    pub const CHAIN_LEG: &str = "chain.leg";
    pub const CHAIN_STATE: &str = "chain.state";
    pub const EXCHANGE_ID: &str = "exchange.id";
    pub const MESSAGE_ID: &str = "message.id";
    pub const INTERCEPTOR_ID: &str = "interceptor.id";
    pub const PHASE: &str = "phase";
    pub const FAULT_CODE: &str = "fault.code";
    pub const FAULT_STATE: &str = "fault.state";
    pub const HANDLER_INDEX: &str = "handler.index";
    pub const ERROR_CODE: &str = "error.code";
}

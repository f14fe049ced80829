#![deny(unsafe_code)]

//! braid-middleware: 基于 `braid-core` 契约的可复用拦截器。
//!
//! # 教案式概览
//! - **意图（Why）**：为服务端与客户端提供现成的日志、服务派发与出站接力拦截器，避免在每个工程重复编写样板代码。
//! - **结构（How）**：按关注点拆分为 [`logging`]、[`invoker`] 与 [`outgoing`] 三个模块，
//!   每个拦截器都提供 `registration` 方法，给出默认的阶段与 id。
//! - **契约（What）**：拦截器均无逐报文状态，可在多条链之间共享；结构化日志统一经由 `tracing` 输出。

pub mod invoker;
pub mod logging;
pub mod outgoing;

pub use invoker::{Service, ServiceInvokerInterceptor};
pub use logging::{LoggingConfig, LoggingInterceptor};
pub use outgoing::OutgoingChainInterceptor;

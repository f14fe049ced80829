#![deny(unsafe_code)]

//! braid-core: 按阶段排序的拦截器链引擎。
//!
//! # 教案式概览
//! - **意图（Why）**：把 SOAP/REST 服务栈中“阶段 + 拦截器 + Handler 链 + 故障回卷”这一套与语言无关的
//!   运行时语义抽离出来，数据绑定、传输、令牌处理等全部作为外部协作者挂在拦截器里。
//! - **结构（How）**：
//!   - [`phase`]：阶段注册表与内置阶段目录；
//!   - [`interceptor`]：拦截器契约、放置描述与执行期控制面；
//!   - [`chain`]：链实例（排序、中止、挂起/恢复、故障回卷），[`template`] 与 [`registry`] 负责装配；
//!   - [`handler`]：协议层/逻辑层 Handler 调用器及其拦截器；
//!   - [`fault`]：故障值、故障控制器状态机与故障报文合成；
//!   - [`message`]、[`exchange`]、[`observer`]：报文、交换与传输层入口；
//!   - [`config`]：由 TOML/JSON 描述的链路配置。
//! - **契约（What）**：同一输入总是解析出同一执行顺序；拦截器是共享的 `Send + Sync` 对象，
//!   逐报文状态只存放在报文上；链实例可在挂起后跨线程恢复。

pub mod chain;
pub mod config;
pub mod exchange;
pub mod fault;
pub mod handler;
pub mod interceptor;
pub mod message;
pub mod observability;
pub mod observer;
mod ordering;
pub mod phase;
pub mod registry;
pub mod template;

pub use chain::{ChainError, ChainOutcome, ChainState, PhaseInterceptorChain, ResolvedOrder};
pub use config::{ChainConfig, ConfigError, InterceptorCatalog, PhaseCatalog, PhaseConfig};
pub use exchange::{CancellationToken, Exchange};
pub use fault::{
    Fault, FaultCode, FaultController, FaultState, FaultSynthesizer, SoapFaultSynthesizer,
    SoapVersion, SynthesisError,
};
pub use handler::{
    Handler, HandlerChainInvoker, HandlerFault, HandlerFlow, LogicalHandler, ProtocolHandler,
};
pub use interceptor::{
    ChainControl, FnInterceptor, Flow, InterceptResult, Interceptor, InterceptorRegistration,
    Placement,
};
pub use message::{Direction, Message, Role};
pub use observer::{ChainInitiationObserver, ChainRun, MessageObserver};
pub use phase::{Phase, PhaseError, PhaseRegistry};
pub use registry::{ChainRegistry, InterceptorList, InterceptorProvider};
pub use template::ChainTemplate;

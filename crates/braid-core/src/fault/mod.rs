//! 故障载体、故障/中止控制器与故障报文合成。
//!
//! # 教案式说明
//! - **意图（Why）**：业务逻辑或编组过程抛出的协议故障不能以语言级异常跨越链路边界，
//!   而应作为显式的值沿回卷路径传递，再由控制器转换为结构化响应。
//! - **结构（How）**：
//!   - [`Fault`]：协议故障的值类型，携带故障码、原因、可选细节与触发者标识；
//!   - [`controller`]：`Normal → FaultPending → FaultDispatched → Terminated` 状态机；
//!   - [`synthesis`]：把故障合成为故障报文体（默认 SOAP 信封）。
//! - **契约（What）**：普通故障一律转换为响应报文，只有合成失败是致命的。

pub mod controller;
pub mod synthesis;

use std::{borrow::Cow, fmt};

use thiserror::Error;

pub use controller::{FaultController, FaultState};
pub use synthesis::{FaultSynthesizer, SoapFaultSynthesizer, SoapVersion, SynthesisError};

/// 故障码，按责任方划分。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// 请求方的报文有误（SOAP 1.1 `Client` / 1.2 `Sender`）。
    Sender,
    /// 处理方内部失败（SOAP 1.1 `Server` / 1.2 `Receiver`）。
    Receiver,
    /// 信封版本不匹配。
    VersionMismatch,
    /// 必须理解的头部未被处理。
    MustUnderstand,
}

impl FaultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultCode::Sender => "sender",
            FaultCode::Receiver => "receiver",
            FaultCode::VersionMismatch => "version-mismatch",
            FaultCode::MustUnderstand => "must-understand",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 协议故障。
///
/// # 教案式说明
/// - **意图（Why）**：拦截器以 `Err(Fault)` 触发链路的故障模式；故障值随后被附着到报文上，
///   供回卷阶段的 `handle_fault` 与故障链读取。
/// - **契约（What）**：`Fault` 可克隆、可跨线程移动；`raised_by` 由链路在捕获时自动补齐，
///   拦截器无需自行填写。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{code} fault: {reason}")]
pub struct Fault {
    code: FaultCode,
    reason: Cow<'static, str>,
    detail: Option<String>,
    raised_by: Option<String>,
}

impl Fault {
    pub fn new(code: FaultCode, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: None,
            raised_by: None,
        }
    }

    /// 请求方责任的故障。
    pub fn sender(reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(FaultCode::Sender, reason)
    }

    /// 处理方责任的故障。
    pub fn receiver(reason: impl Into<Cow<'static, str>>) -> Self {
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

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// 抛出该故障的拦截器标识。
    pub fn raised_by(&self) -> Option<&str> {
        self.raised_by.as_deref()
    }

    pub(crate) fn mark_raised_by(&mut self, id: &str) {
        if self.raised_by.is_none() {
            self.raised_by = Some(id.to_owned());
        }
    }
}

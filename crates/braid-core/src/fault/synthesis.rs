//! 故障报文合成。
//!
//! # 教案式说明
//! - **意图（Why）**：故障进入派发阶段前，控制器需要一份可直接写回传输层的报文体；
//!   合成步骤独立成 trait，方便绑定层替换为 JSON、REST problem-details 等其他表示。
//! - **逻辑（How）**：默认实现 [`SoapFaultSynthesizer`] 依据 SOAP 版本生成信封，并对文本做 XML 转义；
//!   XML 1.0 不允许的控制字符无法转义，直接判定为合成失败。
//! - **契约（What）**：合成失败是整个故障处理路径中唯一的致命错误，调用方必须拆除交换。

use bytes::Bytes;
use thiserror::Error;

use super::{Fault, FaultCode};
use crate::message::Message;

/// 合成故障报文时的致命错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SynthesisError {
    /// 文本中含有无法在 XML 1.0 中表示的字符。
    #[error("fault text contains character U+{codepoint:04X} that cannot be encoded")]
    UnencodableCharacter { codepoint: u32 },

    /// 绑定层自定义合成器的失败。
    #[error("fault synthesis failed: {detail}")]
    Failed { detail: String },
}

impl SynthesisError {
    pub fn code(&self) -> &'static str {
        match self {
            SynthesisError::UnencodableCharacter { .. } => "braid.fault.unencodable",
            SynthesisError::Failed { .. } => "braid.fault.synthesis_failed",
        }
    }
}

/// 由故障与原始报文构造故障报文体。
pub trait FaultSynthesizer: Send + Sync + 'static {
    fn synthesize(&self, fault: &Fault, original: &Message) -> Result<Bytes, SynthesisError>;
}

/// SOAP 信封版本。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SoapVersion {
    #[default]
    Soap11,
    Soap12,
}

impl SoapVersion {
    pub fn namespace(self) -> &'static str {
        match self {
            SoapVersion::Soap11 => "http://schemas.xmlsoap.org/soap/envelope/",
            SoapVersion::Soap12 => "http://www.w3.org/2003/05/soap-envelope",
        }
    }

    fn code_name(self, code: FaultCode) -> &'static str {
        match (self, code) {
            (SoapVersion::Soap11, FaultCode::Sender) => "Client",
            (SoapVersion::Soap11, FaultCode::Receiver) => "Server",
            (SoapVersion::Soap12, FaultCode::Sender) => "Sender",
            (SoapVersion::Soap12, FaultCode::Receiver) => "Receiver",
            (_, FaultCode::VersionMismatch) => "VersionMismatch",
            (_, FaultCode::MustUnderstand) => "MustUnderstand",
        }
    }
}

/// 生成 SOAP 故障信封；原报文中已部分构造的载荷会被整体替换。
#[derive(Clone, Copy, Debug, Default)]
pub struct SoapFaultSynthesizer {
    version: SoapVersion,
}

impl SoapFaultSynthesizer {
    pub fn new(version: SoapVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> SoapVersion {
        self.version
    }
}

impl FaultSynthesizer for SoapFaultSynthesizer {
    fn synthesize(&self, fault: &Fault, _original: &Message) -> Result<Bytes, SynthesisError> {
        let code = self.version.code_name(fault.code());
        let reason = escape_xml(fault.reason())?;
        let detail = fault.detail().map(escape_xml).transpose()?;

        let mut out = String::with_capacity(256 + reason.len());
        out.push_str("<soap:Envelope xmlns:soap=\"");
        out.push_str(self.version.namespace());
        out.push_str("\"><soap:Body><soap:Fault>");
        match self.version {
            SoapVersion::Soap11 => {
                out.push_str(&format!(
                    "<faultcode>soap:{code}</faultcode><faultstring>{reason}</faultstring>"
                ));
                if let Some(detail) = &detail {
                    out.push_str(&format!("<detail>{detail}</detail>"));
                }
            }
            SoapVersion::Soap12 => {
                out.push_str(&format!(
                    "<soap:Code><soap:Value>soap:{code}</soap:Value></soap:Code>\
                     <soap:Reason><soap:Text xml:lang=\"en\">{reason}</soap:Text></soap:Reason>"
                ));
                if let Some(detail) = &detail {
                    out.push_str(&format!("<soap:Detail>{detail}</soap:Detail>"));
                }
            }
        }
        out.push_str("</soap:Fault></soap:Body></soap:Envelope>");
        Ok(Bytes::from(out))
    }
}

fn escape_xml(text: &str) -> Result<String, SynthesisError> {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(ch),
            c if (c as u32) < 0x20 || c == '\u{FFFE}' || c == '\u{FFFF}' => {
                return Err(SynthesisError::UnencodableCharacter {
                    codepoint: c as u32,
                });
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

use std::{borrow::Cow, sync::Arc};

use braid_core::{
    Interceptor, InterceptorRegistration, Message, Placement,
    interceptor::{ChainControl, Flow, InterceptResult, WILDCARD},
    observability::keys,
    phase::names,
};
use tracing::Level;

/// 日志字段键常量，保持入站/出站记录的命名一致。
const ATTR_DIRECTION: &str = "braid.middleware.logging.direction";
const ATTR_ROLE: &str = "braid.middleware.logging.role";
const ATTR_MESSAGE_BYTES: &str = "braid.middleware.logging.message_bytes";
const ATTR_CONTENT: &str = "braid.middleware.logging.content";
const ATTR_EVENT: &str = "braid.middleware.logging.event";

/// 按运行期级别发出事件；`tracing` 的宏要求级别为常量，故逐一展开。
macro_rules! event_at {
    ($level:expr, $($rest:tt)+) => {{
        let level: Level = $level;
        if level == Level::ERROR {
            tracing::event!(Level::ERROR, $($rest)+)
        } else if level == Level::WARN {
            tracing::event!(Level::WARN, $($rest)+)
        } else if level == Level::INFO {
            tracing::event!(Level::INFO, $($rest)+)
        } else if level == Level::DEBUG {
            tracing::event!(Level::DEBUG, $($rest)+)
        } else {
            tracing::event!(Level::TRACE, $($rest)+)
        }
    }};
}

/// 日志拦截器的配置。
///
/// # 教案式说明
/// - **意图（Why）**：不同部署对日志量的容忍度不同，级别与载荷预览长度都外部化，拦截器本身保持无状态。
/// - **契约（What）**：
///   - `id`：拦截器在链上的 id，同一条链内唯一；
///   - `level`：普通报文事件的级别，故障回卷事件固定为 `WARN`；
///   - `max_content_bytes`：载荷预览的字节上限，`0` 表示不记录载荷。
/// - **风险提示（Trade-offs）**：高频链路使用 `INFO` 可能造成日志风暴，生产环境建议保持 `DEBUG`
///   并关闭载荷预览。
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub id: Cow<'static, str>,
    pub level: Level,
    pub max_content_bytes: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            id: Cow::Borrowed(LoggingInterceptor::DEFAULT_ID),
            level: Level::INFO,
            max_content_bytes: 0,
        }
    }
}

/// 在 `receive`/`send` 阶段为每条报文输出一条结构化事件。
#[derive(Clone, Debug, Default)]
pub struct LoggingInterceptor {
    config: LoggingConfig,
}

impl LoggingInterceptor {
    pub const DEFAULT_ID: &'static str = "braid.logging";

    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    /// 放入入站 `receive` 阶段的最前面。
    pub fn inbound(self) -> InterceptorRegistration {
        self.registration(names::RECEIVE)
    }

    /// 放入出站 `send` 阶段的最前面，即交给传输层之前。
    pub fn outbound(self) -> InterceptorRegistration {
        self.registration(names::SEND)
    }

    pub fn registration(self, phase: impl Into<String>) -> InterceptorRegistration {
        let placement = Placement::new(self.config.id.clone().into_owned(), phase).before(WILDCARD);
        InterceptorRegistration::new(placement, Arc::new(self))
    }

    fn preview(&self, message: &Message) -> Option<String> {
        if self.config.max_content_bytes == 0 {
            return None;
        }
        let content = message.content();
        let end = content.len().min(self.config.max_content_bytes);
        let mut preview = String::from_utf8_lossy(&content[..end]).into_owned();
        if end < content.len() {
            preview.push_str("...");
        }
        Some(preview)
    }
}

impl Interceptor for LoggingInterceptor {
    fn handle_message(&self, message: &mut Message, _chain: &mut ChainControl) -> InterceptResult {
        let direction = message.direction().as_str();
        let preview = self.preview(message);
        event_at!(
            self.config.level,
            { ATTR_EVENT } = "message",
            { ATTR_DIRECTION } = direction,
            { ATTR_ROLE } = message.role().as_str(),
            { ATTR_MESSAGE_BYTES } = message.content().len(),
            { ATTR_CONTENT } = preview.as_deref(),
            { keys::EXCHANGE_ID } = message.exchange().id(),
            { keys::MESSAGE_ID } = message.id(),
            "{direction} message passed logging interceptor"
        );
        Ok(Flow::Continue)
    }

    fn handle_fault(&self, message: &mut Message) {
        let code = message.fault().map(|fault| fault.code().as_str());
        tracing::warn!(
            { ATTR_EVENT } = "fault_unwind",
            { ATTR_DIRECTION } = message.direction().as_str(),
            { keys::FAULT_CODE } = code,
            { keys::MESSAGE_ID } = message.id(),
            "message unwound with fault"
        );
    }
}

#[cfg(test)]
mod tests {
    use braid_core::{
        Exchange, PhaseInterceptorChain, PhaseRegistry,
        message::{Direction, Role},
    };
    use tracing_test::traced_test;

    use super::*;

    fn chain_with(interceptor: LoggingInterceptor) -> PhaseInterceptorChain {
        let mut chain = PhaseInterceptorChain::new(Arc::new(PhaseRegistry::default_inbound()));
        chain.add(interceptor.inbound()).unwrap();
        chain
    }

    #[test]
    fn registration_pins_interceptor_first_in_phase() {
        let registration = LoggingInterceptor::default().inbound();
        assert_eq!(registration.id(), LoggingInterceptor::DEFAULT_ID);
        assert_eq!(registration.phase(), names::RECEIVE);
        assert!(registration.placement().before.contains(WILDCARD));
    }

    #[test]
    #[traced_test]
    fn logs_each_message_at_configured_level() {
        let mut chain = chain_with(LoggingInterceptor::new(LoggingConfig {
            level: Level::INFO,
            max_content_bytes: 8,
            ..LoggingConfig::default()
        }));
        let mut message = Message::new(Exchange::new(), Direction::Inbound, Role::Responder)
            .with_content("<envelope>payload</envelope>");
        chain.do_intercept(&mut message).unwrap();

        assert!(logs_contain("inbound message passed logging interceptor"));
        assert!(logs_contain("INFO"));
        assert!(logs_contain("<envelop..."));
    }

    #[test]
    #[traced_test]
    fn content_is_omitted_by_default() {
        let mut chain = chain_with(LoggingInterceptor::default());
        let mut message = Message::new(Exchange::new(), Direction::Inbound, Role::Responder)
            .with_content("secret-token");
        chain.do_intercept(&mut message).unwrap();

        assert!(logs_contain("inbound message passed logging interceptor"));
        assert!(!logs_contain("secret-token"));
    }
}

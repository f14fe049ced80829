//! 拦截器契约与链路注册信息。
//!
//! # 教案式说明
//! - **意图（Why）**：拦截器是链路上最小的处理单元。行为（`handle_message` / `handle_fault`）
//!   与放置信息（所属阶段、before/after 约束）分离：同一个实现可以按不同配置放进不同的链。
//! - **结构（How）**：
//!   - [`Interceptor`]：行为契约，返回 [`Flow`] 或 [`Fault`]；
//!   - [`Placement`]：纯数据的放置描述 `{id, phase, before, after}`，可由配置层反序列化；
//!   - [`InterceptorRegistration`]：放置描述 + 实现，是链路接受的注册单元；
//!   - [`ChainControl`]：执行期间交给拦截器的受限控制面，用于动态插入和响应改道。
//! - **契约（What）**：拦截器必须 `Send + Sync`。被多条链共享的实例不得在自身字段中保存逐报文状态，
//!   需要时写入 [`Message::extensions_mut`]。

use std::{collections::BTreeSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{fault::Fault, message::Message};

/// 约束中的通配符：`before` 含 `*` 表示排在同阶段所有其他拦截器之前，`after` 含 `*` 表示之后。
pub const WILDCARD: &str = "*";

/// 拦截器处理完一条报文后对链路的指示。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// 继续执行下一个拦截器。
    Continue,
    /// 立即停止本条报文的后续处理，不视为错误。
    Abort,
    /// 在异步边界挂起；恢复时重新进入当前拦截器，由它根据报文上的状态判断是否已就绪。
    Suspend,
}

/// 单次拦截的结果。
pub type InterceptResult = Result<Flow, Fault>;

/// 拦截器行为契约。
///
/// # 契约说明（What）
/// - `handle_message`：正常路径；`Err(Fault)` 使链路进入故障模式；
/// - `handle_fault`：故障回卷时按执行的逆序被调用，只会作用于已经成功执行过的拦截器，
///   默认不做任何事。
pub trait Interceptor: Send + Sync + 'static {
    fn handle_message(&self, message: &mut Message, chain: &mut ChainControl) -> InterceptResult;

    fn handle_fault(&self, message: &mut Message) {
        let _ = message;
    }
}

/// 拦截器在链上的放置描述。
///
/// 约束只在同阶段内生效；引用了链中不存在的 id 的约束会被忽略。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub id: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub before: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub after: BTreeSet<String>,
}

impl Placement {
    pub fn new(id: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: phase.into(),
            before: BTreeSet::new(),
            after: BTreeSet::new(),
        }
    }

    pub fn before(mut self, id: impl Into<String>) -> Self {
        self.before.insert(id.into());
        self
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.after.insert(id.into());
        self
    }

    /// 排在同阶段所有其他拦截器之前。
    pub fn first(self) -> Self {
        self.before(WILDCARD)
    }

    /// 排在同阶段所有其他拦截器之后。
    pub fn last(self) -> Self {
        self.after(WILDCARD)
    }

    pub(crate) fn wants_first(&self) -> bool {
        self.before.contains(WILDCARD)
    }

    pub(crate) fn wants_last(&self) -> bool {
        self.after.contains(WILDCARD)
    }
}

/// 链路注册单元：放置描述 + 实现。
#[derive(Clone)]
pub struct InterceptorRegistration {
    placement: Placement,
    interceptor: Arc<dyn Interceptor>,
}

impl InterceptorRegistration {
    pub fn new(placement: Placement, interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            placement,
            interceptor,
        }
    }

    /// 便捷入口：以 id 与阶段注册一个拥有所有权的实现。
    pub fn of(
        id: impl Into<String>,
        phase: impl Into<String>,
        interceptor: impl Interceptor,
    ) -> Self {
        Self::new(Placement::new(id, phase), Arc::new(interceptor))
    }

    pub fn before(mut self, id: impl Into<String>) -> Self {
        self.placement.before.insert(id.into());
        self
    }

    pub fn after(mut self, id: impl Into<String>) -> Self {
        self.placement.after.insert(id.into());
        self
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    pub fn id(&self) -> &str {
        &self.placement.id
    }

    pub fn phase(&self) -> &str {
        &self.placement.phase
    }

    pub fn interceptor(&self) -> &Arc<dyn Interceptor> {
        &self.interceptor
    }
}

impl fmt::Debug for InterceptorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorRegistration")
            .field("placement", &self.placement)
            .finish_non_exhaustive()
    }
}

/// 执行期交给拦截器的受限控制面。
///
/// # 教案式说明
/// - **意图（Why）**：拦截器运行时链路正被独占借用，无法直接修改；控制面先收集请求，
///   待当前拦截器返回后由链路统一落实。
/// - **契约（What）**：
///   - `add`：动态插入；插入位置早于当前拦截器的条目不会在本次执行中运行；
///   - `redirect`：仅在随后返回 [`Flow::Abort`] 时生效，把合成的响应交给交换上的观察者。
#[derive(Debug)]
pub struct ChainControl {
    current: String,
    pending: Vec<InterceptorRegistration>,
    redirect: Option<Message>,
}

impl ChainControl {
    pub(crate) fn new(current: &str) -> Self {
        Self {
            current: current.to_owned(),
            pending: Vec::new(),
            redirect: None,
        }
    }

    /// 当前正在执行的拦截器 id。
    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn add(&mut self, registration: InterceptorRegistration) {
        self.pending.push(registration);
    }

    pub fn redirect(&mut self, response: Message) {
        self.redirect = Some(response);
    }

    pub(crate) fn into_parts(self) -> (Vec<InterceptorRegistration>, Option<Message>) {
        (self.pending, self.redirect)
    }
}

/// 以闭包实现的拦截器，适合轻量逻辑与测试。
pub struct FnInterceptor<F> {
    handler: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(&mut Message, &mut ChainControl) -> InterceptResult + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> Interceptor for FnInterceptor<F>
where
    F: Fn(&mut Message, &mut ChainControl) -> InterceptResult + Send + Sync + 'static,
{
    fn handle_message(&self, message: &mut Message, chain: &mut ChainControl) -> InterceptResult {
        (self.handler)(message, chain)
    }
}

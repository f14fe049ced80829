//! 按阶段排序的拦截器链。
//!
//! # 教案式说明
//! - **意图（Why）**：一条链对应交换中的一条腿（出站请求、入站响应……），按解析好的顺序驱动
//!   一条报文穿过全部拦截器，并把“中止 / 挂起 / 故障”三种偏离正常路径的情况显式建模为状态转换，
//!   而不依赖语言级异常展开。
//! - **逻辑（How）**：
//!   - 条目列表始终保持解析后的顺序；每次 `add` 以插入序重新解析整条链，再把游标锚定到
//!     “当前拦截器之后”，因此执行中的动态插入不会让已运行的拦截器重跑；
//!   - 游标在调用拦截器之前前移，挂起时回退一格，恢复时重新进入同一拦截器；
//!   - 故障模式：对已成功执行的拦截器按逆序调用 `handle_fault`，再交由故障策略合成故障报文并驱动故障链；
//!   - 每个拦截器边界检查交换的取消标记。
//! - **契约（What）**：链为 `Send`，挂起后可连同报文一起移交到其他线程或任务再 `resume`；
//!   对已结束（`Complete`/`Aborted`）的链再次驱动返回 [`ChainError::AlreadyTerminated`] 且不产生副作用。

use std::{borrow::Cow, collections::HashSet, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    fault::{
        Fault, FaultController, FaultState, FaultSynthesizer, SoapFaultSynthesizer,
        SynthesisError,
    },
    interceptor::{ChainControl, Flow, Interceptor, InterceptorRegistration, Placement},
    message::{Direction, Message},
    observability::keys,
    ordering::{self, OrderingFailure},
    phase::PhaseRegistry,
    template::ChainTemplate,
};

/// 链实例的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainState {
    /// 可驱动（尚未开始或正在执行）。
    Running,
    /// 在异步边界挂起，等待 `resume`。
    Paused,
    /// 因中止、取消或故障而提前结束。
    Aborted,
    /// 全部拦截器执行完毕。
    Complete,
}

impl ChainState {
    pub fn is_terminated(self) -> bool {
        matches!(self, ChainState::Aborted | ChainState::Complete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChainState::Running => "running",
            ChainState::Paused => "paused",
            ChainState::Aborted => "aborted",
            ChainState::Complete => "complete",
        }
    }
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次驱动的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    /// 全部拦截器正常执行完毕。
    Completed,
    /// 拦截器请求中止。
    Aborted,
    /// 拦截器中止并把合成的响应交给了交换上的观察者。
    Redirected,
    /// 交换被取消，链在拦截器边界停下。
    Cancelled,
    /// 在异步边界挂起。
    Suspended,
    /// 故障已回卷并派发；`fault_chain` 为故障链的最终状态（未配置故障链时为 `None`）。
    Faulted {
        fault: Fault,
        fault_chain: Option<ChainState>,
    },
    /// 合成故障报文失败，交换已被拆除，不产生任何响应。
    TornDown(SynthesisError),
}

/// 链路操作错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    /// 对已结束的链再次驱动。
    #[error("interceptor chain already terminated in state `{state}`")]
    AlreadyTerminated { state: ChainState },

    /// 链处于挂起状态，只能通过 `resume` 继续。
    #[error("interceptor chain is paused; call resume instead")]
    Paused,

    /// 对未挂起的链调用 `resume`。
    #[error("interceptor chain is not paused (state `{state}`)")]
    NotPaused { state: ChainState },

    /// 拦截器声明的阶段不在注册表中。
    #[error("interceptor `{id}` targets unknown phase `{phase}`")]
    UnknownPhase { id: String, phase: String },

    /// before/after 约束成环，变更被拒绝。
    #[error("ordering constraints in phase `{phase}` form a cycle among {ids:?}")]
    OrderingCycle { phase: String, ids: Vec<String> },

    /// 按 id 定位拦截器失败。
    #[error("interceptor `{id}` is not part of the chain")]
    UnknownInterceptor { id: String },
}

impl ChainError {
    pub fn code(&self) -> &'static str {
        match self {
            ChainError::AlreadyTerminated { .. } => "braid.chain.terminated",
            ChainError::Paused => "braid.chain.paused",
            ChainError::NotPaused { .. } => "braid.chain.not_paused",
            ChainError::UnknownPhase { .. } => "braid.chain.unknown_phase",
            ChainError::OrderingCycle { .. } => "braid.chain.ordering_cycle",
            ChainError::UnknownInterceptor { .. } => "braid.chain.unknown_interceptor",
        }
    }
}

impl From<OrderingFailure> for ChainError {
    fn from(failure: OrderingFailure) -> Self {
        match failure {
            OrderingFailure::UnknownPhase { id, phase } => ChainError::UnknownPhase { id, phase },
            OrderingFailure::Cycle { phase, ids } => ChainError::OrderingCycle { phase, ids },
        }
    }
}

/// 解析后的执行顺序（拦截器 id 列表），可序列化以便比对与复现。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedOrder(Vec<String>);

impl ResolvedOrder {
    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn into_ids(self) -> Vec<String> {
        self.0
    }
}

impl<S: Into<String>> FromIterator<S> for ResolvedOrder {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// 故障发生后的处置策略。
#[derive(Clone)]
pub(crate) enum FaultPolicy {
    /// 合成故障报文并驱动故障链（可选）。
    Dispatch {
        synthesizer: Arc<dyn FaultSynthesizer>,
        fault_chain: Option<Arc<ChainTemplate>>,
    },
    /// 故障链自身：只回卷、不再派发，避免递归。
    UnwindOnly,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        FaultPolicy::Dispatch {
            synthesizer: Arc::new(SoapFaultSynthesizer::default()),
            fault_chain: None,
        }
    }
}

#[derive(Clone)]
struct ChainEntry {
    seq: u64,
    placement: Placement,
    interceptor: Arc<dyn Interceptor>,
}

struct Executed {
    id: String,
    interceptor: Arc<dyn Interceptor>,
}

/// 拦截器链实例。
pub struct PhaseInterceptorChain {
    leg: Cow<'static, str>,
    phases: Arc<PhaseRegistry>,
    entries: Vec<ChainEntry>,
    next_seq: u64,
    cursor: usize,
    ran: HashSet<u64>,
    executed: Vec<Executed>,
    state: ChainState,
    controller: FaultController,
    fault_policy: FaultPolicy,
}

impl PhaseInterceptorChain {
    pub fn new(phases: Arc<PhaseRegistry>) -> Self {
        Self {
            leg: Cow::Borrowed("chain"),
            phases,
            entries: Vec::new(),
            next_seq: 0,
            cursor: 0,
            ran: HashSet::new(),
            executed: Vec::new(),
            state: ChainState::Running,
            controller: FaultController::new(),
            fault_policy: FaultPolicy::default(),
        }
    }

    /// 设置日志中使用的链路腿标签，如 `requestor-outbound`。
    pub fn with_leg(mut self, leg: impl Into<Cow<'static, str>>) -> Self {
        self.leg = leg.into();
        self
    }

    /// 配置故障报文合成器与故障链模板。
    pub fn with_fault_handling(
        mut self,
        synthesizer: Arc<dyn FaultSynthesizer>,
        fault_chain: Option<Arc<ChainTemplate>>,
    ) -> Self {
        self.fault_policy = FaultPolicy::Dispatch {
            synthesizer,
            fault_chain,
        };
        self
    }

    pub(crate) fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }

    pub fn leg(&self) -> &str {
        &self.leg
    }

    pub fn phases(&self) -> &Arc<PhaseRegistry> {
        &self.phases
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn fault_state(&self) -> FaultState {
        self.controller.state()
    }

    /// 故障控制器经历的全部状态。
    pub fn fault_history(&self) -> &[FaultState] {
        self.controller.history()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position_of(id).is_some()
    }

    /// 按执行顺序遍历放置描述。
    pub fn iter(&self) -> impl Iterator<Item = &Placement> {
        self.entries.iter().map(|entry| &entry.placement)
    }

    pub fn resolved_order(&self) -> ResolvedOrder {
        self.iter().map(|placement| placement.id.clone()).collect()
    }

    /// 插入拦截器。
    ///
    /// # 契约说明（What）
    /// - 返回 `Ok(true)` 表示已插入；同 id 已存在时忽略并返回 `Ok(false)`；
    /// - 阶段未登记返回 [`ChainError::UnknownPhase`]，约束成环返回 [`ChainError::OrderingCycle`]，
    ///   两种情况下链保持原样。
    pub fn add(&mut self, registration: InterceptorRegistration) -> Result<bool, ChainError> {
        let placement = registration.placement().clone();
        let interceptor = Arc::clone(registration.interceptor());
        if !self.phases.contains(&placement.phase) {
            return Err(ChainError::UnknownPhase {
                id: placement.id,
                phase: placement.phase,
            });
        }
        if self.contains(&placement.id) {
            debug!(
                { keys::CHAIN_LEG } = %self.leg,
                { keys::INTERCEPTOR_ID } = %placement.id,
                "duplicate interceptor id ignored"
            );
            return Ok(false);
        }

        let anchor = self
            .cursor
            .checked_sub(1)
            .and_then(|index| self.entries.get(index))
            .map(|entry| entry.seq);

        let mut candidate = self.entries.clone();
        candidate.push(ChainEntry {
            seq: self.next_seq,
            placement,
            interceptor,
        });
        candidate.sort_by_key(|entry| entry.seq);
        let placements: Vec<&Placement> = candidate.iter().map(|entry| &entry.placement).collect();
        let order = match ordering::resolve(&self.phases, &placements) {
            Ok(order) => order,
            Err(failure) => {
                let err = ChainError::from(failure);
                warn!(
                    { keys::CHAIN_LEG } = %self.leg,
                    { keys::ERROR_CODE } = err.code(),
                    "interceptor rejected: {err}"
                );
                return Err(err);
            }
        };

        let mut slots: Vec<Option<ChainEntry>> = candidate.into_iter().map(Some).collect();
        self.entries = order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect();
        self.next_seq += 1;
        self.cursor = match anchor {
            Some(seq) => self
                .entries
                .iter()
                .position(|entry| entry.seq == seq)
                .map_or(0, |position| position + 1),
            None => 0,
        };
        Ok(true)
    }

    /// 批量插入，遇到第一个错误即停止。
    pub fn add_all<I>(&mut self, registrations: I) -> Result<(), ChainError>
    where
        I: IntoIterator<Item = InterceptorRegistration>,
    {
        for registration in registrations {
            self.add(registration)?;
        }
        Ok(())
    }

    /// 移除拦截器；返回是否找到。
    ///
    /// 只影响尚未遍历到的位置：已执行过的拦截器仍留在回卷记录中，故障时照常收到 `handle_fault`。
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(position) = self.position_of(id) else {
            return false;
        };
        self.entries.remove(position);
        if position < self.cursor {
            self.cursor -= 1;
        }
        true
    }

    /// 从头驱动报文。
    pub fn do_intercept(&mut self, message: &mut Message) -> Result<ChainOutcome, ChainError> {
        self.ensure_startable()?;
        self.run(message)
    }

    /// 从指定拦截器开始驱动，之前的拦截器不会执行，也不会参与故障回卷。
    pub fn do_intercept_starting_at(
        &mut self,
        message: &mut Message,
        id: &str,
    ) -> Result<ChainOutcome, ChainError> {
        self.ensure_startable()?;
        self.cursor = self.require_position(id)?;
        self.run(message)
    }

    /// 从指定拦截器之后开始驱动；用于 Handler 中止改道后继续处理合成的响应。
    pub fn do_intercept_starting_after(
        &mut self,
        message: &mut Message,
        id: &str,
    ) -> Result<ChainOutcome, ChainError> {
        self.ensure_startable()?;
        self.cursor = self.require_position(id)? + 1;
        self.run(message)
    }

    /// 在两次驱动之间挂起链。
    pub fn pause(&mut self) -> Result<(), ChainError> {
        match self.state {
            ChainState::Running => {
                self.state = ChainState::Paused;
                debug!({ keys::CHAIN_LEG } = %self.leg, "chain paused");
                Ok(())
            }
            ChainState::Paused => Err(ChainError::Paused),
            state => Err(ChainError::AlreadyTerminated { state }),
        }
    }

    /// 恢复挂起的链；挂起时所在的拦截器会被重新调用。
    pub fn resume(&mut self, message: &mut Message) -> Result<ChainOutcome, ChainError> {
        match self.state {
            ChainState::Paused => {
                debug!(
                    { keys::CHAIN_LEG } = %self.leg,
                    { keys::MESSAGE_ID } = message.id(),
                    "chain resumed"
                );
                self.run(message)
            }
            state if state.is_terminated() => Err(ChainError::AlreadyTerminated { state }),
            state => Err(ChainError::NotPaused { state }),
        }
    }

    fn ensure_startable(&self) -> Result<(), ChainError> {
        match self.state {
            ChainState::Running => Ok(()),
            ChainState::Paused => Err(ChainError::Paused),
            state => Err(ChainError::AlreadyTerminated { state }),
        }
    }

    fn position_of(&self, id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.placement.id == id)
    }

    fn require_position(&self, id: &str) -> Result<usize, ChainError> {
        self.position_of(id)
            .ok_or_else(|| ChainError::UnknownInterceptor { id: id.to_owned() })
    }

    fn run(&mut self, message: &mut Message) -> Result<ChainOutcome, ChainError> {
        let span = debug_span!(
            "braid.chain",
            { keys::CHAIN_LEG } = %self.leg,
            { keys::EXCHANGE_ID } = message.exchange().id(),
            { keys::MESSAGE_ID } = message.id(),
        );
        let _entered = span.enter();
        self.state = ChainState::Running;

        while let Some(entry) = self.entries.get(self.cursor).cloned() {
            if message.exchange().is_cancelled() {
                debug!(
                    { keys::INTERCEPTOR_ID } = %entry.placement.id,
                    "exchange cancelled, chain stops at interceptor boundary"
                );
                self.state = ChainState::Aborted;
                self.controller.advance(FaultState::Terminated);
                return Ok(ChainOutcome::Cancelled);
            }
            self.cursor += 1;
            if self.ran.contains(&entry.seq) {
                continue;
            }

            trace!(
                { keys::INTERCEPTOR_ID } = %entry.placement.id,
                { keys::PHASE } = %entry.placement.phase,
                "invoking interceptor"
            );
            let mut control = ChainControl::new(&entry.placement.id);
            let result = entry.interceptor.handle_message(message, &mut control);
            let (additions, redirect) = control.into_parts();

            match result {
                Ok(Flow::Continue) => {
                    self.record_executed(&entry);
                    if let Err(err) = self.add_all(additions) {
                        let mut fault = Fault::receiver(format!("chain mutation rejected: {err}"));
                        fault.mark_raised_by(&entry.placement.id);
                        return Ok(self.enter_fault_mode(message, fault));
                    }
                }
                Ok(Flow::Abort) => {
                    debug!(
                        { keys::INTERCEPTOR_ID } = %entry.placement.id,
                        "interceptor requested abort"
                    );
                    return Ok(self.abort(message, redirect));
                }
                Ok(Flow::Suspend) => {
                    if let Err(err) = self.add_all(additions) {
                        let mut fault = Fault::receiver(format!("chain mutation rejected: {err}"));
                        fault.mark_raised_by(&entry.placement.id);
                        return Ok(self.enter_fault_mode(message, fault));
                    }
                    self.rewind_to(entry.seq);
                    self.state = ChainState::Paused;
                    debug!(
                        { keys::INTERCEPTOR_ID } = %entry.placement.id,
                        "chain suspended at interceptor"
                    );
                    return Ok(ChainOutcome::Suspended);
                }
                Err(mut fault) => {
                    fault.mark_raised_by(&entry.placement.id);
                    return Ok(self.enter_fault_mode(message, fault));
                }
            }
        }

        self.state = ChainState::Complete;
        self.controller.advance(FaultState::Terminated);
        trace!("chain complete");
        Ok(ChainOutcome::Completed)
    }

    fn record_executed(&mut self, entry: &ChainEntry) {
        self.ran.insert(entry.seq);
        self.executed.push(Executed {
            id: entry.placement.id.clone(),
            interceptor: Arc::clone(&entry.interceptor),
        });
    }

    fn rewind_to(&mut self, seq: u64) {
        if let Some(position) = self.entries.iter().position(|entry| entry.seq == seq) {
            self.cursor = position;
        }
    }

    fn abort(&mut self, message: &Message, redirect: Option<Message>) -> ChainOutcome {
        self.state = ChainState::Aborted;
        let Some(response) = redirect else {
            self.controller.advance(FaultState::Terminated);
            return ChainOutcome::Aborted;
        };

        let exchange = message.exchange();
        match exchange.observer() {
            Some(observer) if !exchange.is_one_way() => {
                self.controller.begin_abort_redirect();
                self.controller.advance(FaultState::FaultDispatched);
                debug!(
                    { keys::MESSAGE_ID } = response.id(),
                    "redirecting synthesized response to the inbound path"
                );
                observer.on_message(response);
                self.controller.advance(FaultState::Terminated);
                ChainOutcome::Redirected
            }
            _ => {
                debug!("redirect dropped: exchange is one-way or has no observer");
                self.controller.advance(FaultState::Terminated);
                ChainOutcome::Aborted
            }
        }
    }

    fn enter_fault_mode(&mut self, message: &mut Message, fault: Fault) -> ChainOutcome {
        debug!(
            { keys::FAULT_CODE } = fault.code().as_str(),
            { keys::INTERCEPTOR_ID } = fault.raised_by().unwrap_or_default(),
            "fault raised, unwinding {} interceptor(s)",
            self.executed.len()
        );
        self.state = ChainState::Aborted;
        self.controller.advance(FaultState::FaultPending);
        message.set_fault(fault.clone());

        for executed in self.executed.iter().rev() {
            trace!({ keys::INTERCEPTOR_ID } = %executed.id, "handle_fault");
            executed.interceptor.handle_fault(message);
        }

        match self.fault_policy.clone() {
            FaultPolicy::Dispatch {
                synthesizer,
                fault_chain,
            } => self.dispatch_fault(message, fault, synthesizer.as_ref(), fault_chain),
            FaultPolicy::UnwindOnly => {
                warn!(
                    { keys::FAULT_CODE } = fault.code().as_str(),
                    "fault raised while running the fault chain: {fault}"
                );
                self.controller.advance(FaultState::Terminated);
                ChainOutcome::Faulted {
                    fault,
                    fault_chain: None,
                }
            }
        }
    }

    fn dispatch_fault(
        &mut self,
        message: &Message,
        fault: Fault,
        synthesizer: &dyn FaultSynthesizer,
        fault_chain: Option<Arc<ChainTemplate>>,
    ) -> ChainOutcome {
        let exchange = message.exchange().clone();
        let body = match synthesizer.synthesize(&fault, message) {
            Ok(body) => body,
            Err(err) => {
                error!(
                    { keys::ERROR_CODE } = err.code(),
                    { keys::EXCHANGE_ID } = exchange.id(),
                    "fault synthesis failed, tearing down exchange: {err}"
                );
                exchange.terminate();
                self.controller.advance(FaultState::Terminated);
                return ChainOutcome::TornDown(err);
            }
        };

        // 服务端的故障沿出站方向返回请求方；客户端的故障作为入站故障交付给调用者。
        let direction = if message.is_requestor() {
            Direction::Inbound
        } else {
            Direction::Outbound
        };
        let mut fault_message =
            Message::new(exchange.clone(), direction, message.role()).with_content(body);
        fault_message.set_fault(fault.clone());
        self.controller.advance(FaultState::FaultDispatched);

        let fault_chain_state = fault_chain.and_then(|template| {
            let mut chain = match template.build_fault_leg() {
                Ok(chain) => chain,
                Err(err) => {
                    warn!(
                        { keys::ERROR_CODE } = err.code(),
                        "fault chain could not be built: {err}"
                    );
                    return None;
                }
            };
            match chain.do_intercept(&mut fault_message) {
                Ok(ChainOutcome::Suspended) => {
                    warn!("fault chain suspended; it will not be resumed");
                }
                Ok(_) => {}
                Err(err) => warn!({ keys::ERROR_CODE } = err.code(), "fault chain failed: {err}"),
            }
            Some(chain.state())
        });

        match direction {
            Direction::Inbound => exchange.set_in_fault_message(fault_message),
            Direction::Outbound => exchange.set_out_fault_message(fault_message),
        };
        self.controller.advance(FaultState::Terminated);
        ChainOutcome::Faulted {
            fault,
            fault_chain: fault_chain_state,
        }
    }
}

impl fmt::Debug for PhaseInterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseInterceptorChain")
            .field("leg", &self.leg)
            .field("order", &self.resolved_order())
            .field("cursor", &self.cursor)
            .field("state", &self.state)
            .field("fault_state", &self.controller.state())
            .finish()
    }
}

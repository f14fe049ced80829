//! 故障/中止控制器状态机。
//!
//! # 教案式说明
//! - **意图（Why）**：每条链路腿都要能回答“当前处于正常处理、等待派发故障、故障已派发还是已终结”，
//!   并在测试与排障时复原完整的转换序列。
//! - **逻辑（How）**：控制器只保存当前状态与历史；合法转换表由 [`FaultState::can_advance_to`]
//!   给出，非法转换属于引擎自身缺陷，以 `debug_assert!` 捕获并在发布构建中记录告警后忽略。
//! - **契约（What）**：
//!   - `Normal → FaultPending`：拦截器抛出故障，或请求方出站 Handler 中止并改道；
//!   - `FaultPending → FaultDispatched`：故障报文已合成并交给故障链；
//!   - `FaultPending → Terminated`：合成失败，交换被拆除；
//!   - `FaultDispatched → Terminated`：故障链结束（无论成败）；
//!   - `Normal → Terminated`：正常完成或无故障中止。

use tracing::warn;

use crate::observability::keys;

/// 控制器状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultState {
    Normal,
    FaultPending,
    FaultDispatched,
    Terminated,
}

impl FaultState {
    /// 判断是否允许从当前状态前进到 `next`。
    pub fn can_advance_to(self, next: FaultState) -> bool {
        matches!(
            (self, next),
            (FaultState::Normal, FaultState::FaultPending)
                | (FaultState::Normal, FaultState::Terminated)
                | (FaultState::FaultPending, FaultState::FaultDispatched)
                | (FaultState::FaultPending, FaultState::Terminated)
                | (FaultState::FaultDispatched, FaultState::Terminated)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultState::Normal => "normal",
            FaultState::FaultPending => "fault-pending",
            FaultState::FaultDispatched => "fault-dispatched",
            FaultState::Terminated => "terminated",
        }
    }
}

/// 单条链路腿的故障状态机。
#[derive(Clone, Debug)]
pub struct FaultController {
    state: FaultState,
    history: Vec<FaultState>,
}

impl FaultController {
    pub fn new() -> Self {
        Self {
            state: FaultState::Normal,
            history: vec![FaultState::Normal],
        }
    }

    pub fn state(&self) -> FaultState {
        self.state
    }

    /// 自构造以来经历的全部状态，首元素恒为 `Normal`。
    pub fn history(&self) -> &[FaultState] {
        &self.history
    }

    pub fn is_terminated(&self) -> bool {
        self.state == FaultState::Terminated
    }

    /// 请求方出站 Handler 中止并改道：`Normal → FaultPending`。
    pub(crate) fn begin_abort_redirect(&mut self) -> bool {
        self.advance(FaultState::FaultPending)
    }

    /// 推进状态；返回是否真正发生了转换。
    pub(crate) fn advance(&mut self, next: FaultState) -> bool {
        if !self.state.can_advance_to(next) {
            debug_assert!(
                false,
                "illegal fault transition {:?} -> {:?}",
                self.state, next
            );
            warn!(
                { keys::FAULT_STATE } = self.state.as_str(),
                "ignored illegal fault transition to {}",
                next.as_str()
            );
            return false;
        }
        self.state = next;
        self.history.push(next);
        true
    }
}

impl Default for FaultController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_path_is_recorded_in_order() {
        let mut controller = FaultController::new();
        assert!(controller.advance(FaultState::FaultPending));
        assert!(controller.advance(FaultState::FaultDispatched));
        assert!(controller.advance(FaultState::Terminated));
        assert_eq!(
            controller.history(),
            [
                FaultState::Normal,
                FaultState::FaultPending,
                FaultState::FaultDispatched,
                FaultState::Terminated
            ]
        );
        assert!(controller.is_terminated());
    }

    #[test]
    fn terminated_is_absorbing() {
        for next in [
            FaultState::Normal,
            FaultState::FaultPending,
            FaultState::FaultDispatched,
            FaultState::Terminated,
        ] {
            assert!(!FaultState::Terminated.can_advance_to(next));
        }
        assert!(!FaultState::Normal.can_advance_to(FaultState::FaultDispatched));
    }
}

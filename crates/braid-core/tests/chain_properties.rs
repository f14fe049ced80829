//! 拦截器链排序与执行的性质验证。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：链路顺序必须是输入的纯函数，同一组放置描述无论构建多少次、是否经过配置序列化，
//!   都得到相同的执行顺序；中止必须截断后续拦截器。
//! - **设计手法 (How)**：使用 Proptest 随机生成“阶段 + after 约束”组合。约束只指向更早出现的拦截器，
//!   保证输入无环，从而每个样本都应成功解析。
//! - **合同 (What)**：
//!   - 性质 1：两次独立构建得到相同的 `ResolvedOrder`；
//!   - 性质 2：`ChainConfig` → 顺序 → JSON → 反序列化 → 重新解析，结果一致；
//!   - 性质 3：第 `i` 个拦截器中止后，`i+1..` 从未执行，链状态为 `Aborted`。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use braid_core::{
    ChainConfig, ChainOutcome, ChainState, Exchange, FaultState, Flow, Interceptor,
    InterceptorRegistration, Message, PhaseInterceptorChain, PhaseRegistry, Placement,
    ResolvedOrder,
    interceptor::{ChainControl, InterceptResult},
    message::{Direction, Role},
};
use proptest::{prelude::*, sample::Index};

const PHASES: [&str; 3] = ["receive", "unmarshal", "invoke"];

fn registry() -> Arc<PhaseRegistry> {
    Arc::new(PhaseRegistry::from_pairs([("receive", 10), ("unmarshal", 20), ("invoke", 30)]).unwrap())
}

struct Counting {
    calls: Arc<AtomicUsize>,
    flow: Flow,
}

impl Counting {
    fn new(flow: Flow) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
                flow,
            },
            calls,
        )
    }
}

impl Interceptor for Counting {
    fn handle_message(&self, _message: &mut Message, _chain: &mut ChainControl) -> InterceptResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.flow)
    }
}

fn inbound_message() -> Message {
    Message::new(Exchange::new(), Direction::Inbound, Role::Responder)
}

/// 由随机样本构造无环的放置描述：约束只指向下标更小的拦截器。
fn placements(sample: &[(usize, Vec<Index>)]) -> Vec<Placement> {
    sample
        .iter()
        .enumerate()
        .map(|(i, (phase, afters))| {
            let mut placement = Placement::new(format!("i{i}"), PHASES[*phase]);
            if i > 0 {
                for after in afters {
                    placement = placement.after(format!("i{}", after.index(i)));
                }
            }
            placement
        })
        .collect()
}

fn build(placements: &[Placement]) -> PhaseInterceptorChain {
    let mut chain = PhaseInterceptorChain::new(registry());
    for placement in placements {
        let (interceptor, _) = Counting::new(Flow::Continue);
        chain
            .add(InterceptorRegistration::new(placement.clone(), Arc::new(interceptor)))
            .unwrap();
    }
    chain
}

fn sample_strategy() -> impl Strategy<Value = Vec<(usize, Vec<Index>)>> {
    prop::collection::vec((0usize..PHASES.len(), prop::collection::vec(any::<Index>(), 0..3)), 1..12)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_resolution_is_deterministic(sample in sample_strategy()) {
        let placements = placements(&sample);
        let first = build(&placements).resolved_order();
        let second = build(&placements).resolved_order();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.ids().len(), placements.len());

        // 阶段次序优先于一切约束。
        let position = |id: &str| PHASES.iter().position(|phase| {
            placements.iter().any(|p| p.id == id && p.phase == *phase)
        });
        let phases: Vec<_> = first.ids().iter().map(|id| position(id)).collect();
        prop_assert!(phases.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn prop_config_round_trip_preserves_order(sample in sample_strategy()) {
        let config = ChainConfig {
            phases: PHASES
                .iter()
                .zip([10, 20, 30])
                .map(|(name, order)| braid_core::PhaseConfig { name: (*name).to_owned(), order })
                .collect(),
            interceptors: placements(&sample),
            ..ChainConfig::default()
        };
        let resolved = config.resolve_order().unwrap();

        let order_json = serde_json::to_string(&resolved).unwrap();
        let restored: ResolvedOrder = serde_json::from_str(&order_json).unwrap();
        prop_assert_eq!(&restored, &resolved);

        let config_json = serde_json::to_string(&config).unwrap();
        let rebuilt = ChainConfig::from_json_str(&config_json).unwrap();
        prop_assert_eq!(&rebuilt, &config);
        prop_assert_eq!(rebuilt.resolve_order().unwrap(), resolved.clone());
        prop_assert_eq!(build(&config.interceptors).resolved_order(), resolved);
    }

    #[test]
    fn prop_abort_stops_remaining_interceptors(len in 1usize..8, abort_at in any::<Index>()) {
        let abort_at = abort_at.index(len);
        let mut chain = PhaseInterceptorChain::new(registry());
        let mut counters = Vec::with_capacity(len);
        for i in 0..len {
            let flow = if i == abort_at { Flow::Abort } else { Flow::Continue };
            let (interceptor, calls) = Counting::new(flow);
            chain.add(InterceptorRegistration::of(format!("i{i}"), "receive", interceptor)).unwrap();
            counters.push(calls);
        }

        let outcome = chain.do_intercept(&mut inbound_message()).unwrap();
        prop_assert_eq!(outcome, ChainOutcome::Aborted);
        prop_assert_eq!(chain.state(), ChainState::Aborted);
        for (i, calls) in counters.iter().enumerate() {
            let expected = usize::from(i <= abort_at);
            prop_assert_eq!(calls.load(Ordering::SeqCst), expected, "interceptor i{}", i);
        }
    }
}

#[test]
fn phase_then_constraint_order() {
    let mut chain = PhaseInterceptorChain::new(Arc::new(
        PhaseRegistry::from_pairs([("P1", 1), ("P2", 2)]).unwrap(),
    ));
    for registration in [
        InterceptorRegistration::of("C", "P2", Counting::new(Flow::Continue).0),
        InterceptorRegistration::of("B", "P1", Counting::new(Flow::Continue).0).after("A"),
        InterceptorRegistration::of("A", "P1", Counting::new(Flow::Continue).0),
    ] {
        chain.add(registration).unwrap();
    }
    assert_eq!(chain.resolved_order().ids(), ["A", "B", "C"]);
}

#[test]
fn log_auth_body_scenario_runs_each_once() {
    let phases = PhaseRegistry::from_pairs([("receive", 0), ("marshal", 10), ("send", 20)]).unwrap();
    let mut chain = PhaseInterceptorChain::new(Arc::new(phases)).with_leg("responder-inbound");
    let (log, log_calls) = Counting::new(Flow::Continue);
    let (auth, auth_calls) = Counting::new(Flow::Continue);
    let (body, body_calls) = Counting::new(Flow::Continue);
    chain
        .add(InterceptorRegistration::of("body", "marshal", body))
        .unwrap();
    chain
        .add(InterceptorRegistration::of("auth", "receive", auth).after("log"))
        .unwrap();
    chain
        .add(InterceptorRegistration::of("log", "receive", log))
        .unwrap();

    let outcome = chain.do_intercept(&mut inbound_message()).unwrap();
    assert_eq!(outcome, ChainOutcome::Completed);
    assert_eq!(chain.state(), ChainState::Complete);
    assert_eq!(chain.fault_state(), FaultState::Terminated);
    assert_eq!(chain.resolved_order().ids(), ["log", "auth", "body"]);
    for calls in [log_calls, auth_calls, body_calls] {
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

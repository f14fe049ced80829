//! 链路装配上下文。
//!
//! # 教案式说明
//! - **意图（Why）**：一条链上的拦截器来自多个层级（全局、端点、绑定、单次调用）。
//!   它们通过显式传入的 [`ChainRegistry`] 汇总，不依赖进程级的全局总线。
//! - **逻辑（How）**：每个层级实现 [`InterceptorProvider`]，按四条腿（入站、出站、入站故障、
//!   出站故障）提供注册列表；`template` 依据方向与角色挑选阶段表与列表，并为其挂上故障腿模板。
//! - **契约（What）**：
//!   - 服务端（`Responder`）的故障腿使用出站阶段表与 `out_fault` 列表；
//!   - 客户端（`Requestor`）的故障腿使用入站阶段表与 `in_fault` 列表；
//!   - 列表按“注册表自带 provider → 调用方额外 provider”的顺序拼接，重复 id 以先出现者为准。

use std::{fmt, sync::Arc};

use crate::{
    fault::{FaultSynthesizer, SoapFaultSynthesizer},
    interceptor::InterceptorRegistration,
    message::{Direction, Role},
    phase::PhaseRegistry,
    template::ChainTemplate,
};

/// 按四条腿提供拦截器的层级。
pub trait InterceptorProvider: Send + Sync {
    fn in_interceptors(&self) -> &[InterceptorRegistration];
    fn out_interceptors(&self) -> &[InterceptorRegistration];
    fn in_fault_interceptors(&self) -> &[InterceptorRegistration];
    fn out_fault_interceptors(&self) -> &[InterceptorRegistration];
}

/// 最基础的 provider：四个可变列表。
#[derive(Clone, Debug, Default)]
pub struct InterceptorList {
    inbound: Vec<InterceptorRegistration>,
    outbound: Vec<InterceptorRegistration>,
    in_fault: Vec<InterceptorRegistration>,
    out_fault: Vec<InterceptorRegistration>,
}

impl InterceptorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_in(&mut self, registration: InterceptorRegistration) -> &mut Self {
        self.inbound.push(registration);
        self
    }

    pub fn add_out(&mut self, registration: InterceptorRegistration) -> &mut Self {
        self.outbound.push(registration);
        self
    }

    pub fn add_in_fault(&mut self, registration: InterceptorRegistration) -> &mut Self {
        self.in_fault.push(registration);
        self
    }

    pub fn add_out_fault(&mut self, registration: InterceptorRegistration) -> &mut Self {
        self.out_fault.push(registration);
        self
    }
}

impl InterceptorProvider for InterceptorList {
    fn in_interceptors(&self) -> &[InterceptorRegistration] {
        &self.inbound
    }

    fn out_interceptors(&self) -> &[InterceptorRegistration] {
        &self.outbound
    }

    fn in_fault_interceptors(&self) -> &[InterceptorRegistration] {
        &self.in_fault
    }

    fn out_fault_interceptors(&self) -> &[InterceptorRegistration] {
        &self.out_fault
    }
}

/// 链路装配上下文：阶段表、故障合成器与各层级 provider。
#[derive(Clone)]
pub struct ChainRegistry {
    inbound_phases: Arc<PhaseRegistry>,
    outbound_phases: Arc<PhaseRegistry>,
    synthesizer: Arc<dyn FaultSynthesizer>,
    providers: Vec<Arc<dyn InterceptorProvider>>,
}

impl ChainRegistry {
    pub fn new(inbound_phases: Arc<PhaseRegistry>, outbound_phases: Arc<PhaseRegistry>) -> Self {
        Self {
            inbound_phases,
            outbound_phases,
            synthesizer: Arc::new(SoapFaultSynthesizer::default()),
            providers: Vec::new(),
        }
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn FaultSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn InterceptorProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn phases(&self, direction: Direction) -> &Arc<PhaseRegistry> {
        match direction {
            Direction::Inbound => &self.inbound_phases,
            Direction::Outbound => &self.outbound_phases,
        }
    }

    /// 为某一方的某条腿生成链模板（含故障腿）。
    pub fn template(
        &self,
        direction: Direction,
        role: Role,
        extra: &[&dyn InterceptorProvider],
    ) -> ChainTemplate {
        let mut template = ChainTemplate::new(
            format!("{}-{}", role.as_str(), direction.as_str()),
            Arc::clone(self.phases(direction)),
        )
        .with_synthesizer(Arc::clone(&self.synthesizer));
        let fault_direction = if role.is_requestor() {
            Direction::Inbound
        } else {
            Direction::Outbound
        };
        let mut fault_template = ChainTemplate::new(
            format!("{}-{}-fault", role.as_str(), fault_direction.as_str()),
            Arc::clone(self.phases(fault_direction)),
        );

        let mut absorb = |provider: &dyn InterceptorProvider| {
            let regular = match direction {
                Direction::Inbound => provider.in_interceptors(),
                Direction::Outbound => provider.out_interceptors(),
            };
            let fault = match fault_direction {
                Direction::Inbound => provider.in_fault_interceptors(),
                Direction::Outbound => provider.out_fault_interceptors(),
            };
            regular.iter().cloned().for_each(|r| template.push(r));
            fault.iter().cloned().for_each(|r| fault_template.push(r));
        };
        for provider in &self.providers {
            absorb(provider.as_ref());
        }
        for provider in extra {
            absorb(*provider);
        }

        template.with_fault_chain(fault_template)
    }
}

impl Default for ChainRegistry {
    fn default() -> Self {
        Self::new(
            Arc::new(PhaseRegistry::default_inbound()),
            Arc::new(PhaseRegistry::default_outbound()),
        )
    }
}

impl fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRegistry")
            .field("inbound_phases", &self.inbound_phases.len())
            .field("outbound_phases", &self.outbound_phases.len())
            .field("providers", &self.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interceptor::{FnInterceptor, Flow},
        phase::names,
    };

    fn noop(id: &str, phase: &str) -> InterceptorRegistration {
        InterceptorRegistration::of(id, phase, FnInterceptor::new(|_, _| Ok(Flow::Continue)))
    }

    #[test]
    fn responder_fault_leg_uses_outbound_catalog() {
        let mut bus = InterceptorList::new();
        bus.add_in(noop("bus-in", names::RECEIVE))
            .add_out_fault(noop("bus-out-fault", names::SEND));
        let mut endpoint = InterceptorList::new();
        endpoint
            .add_in(noop("endpoint-in", names::INVOKE))
            .add_in_fault(noop("never", names::RECEIVE));

        let registry = ChainRegistry::default().with_provider(Arc::new(bus));
        let template = registry.template(Direction::Inbound, Role::Responder, &[&endpoint]);
        let chain = template.build().unwrap();
        assert_eq!(chain.leg(), "responder-inbound");
        assert_eq!(chain.resolved_order().ids(), ["bus-in", "endpoint-in"]);

        let fault_leg = template.fault_chain().unwrap();
        assert_eq!(fault_leg.leg(), "responder-outbound-fault");
        let ids: Vec<&str> = fault_leg.registrations().iter().map(|r| r.id()).collect();
        assert_eq!(ids, ["bus-out-fault"]);
    }

    #[test]
    fn requestor_fault_leg_uses_inbound_catalog() {
        let mut list = InterceptorList::new();
        list.add_in_fault(noop("client-fault", names::RECEIVE));
        let registry = ChainRegistry::default();
        let template = registry.template(Direction::Outbound, Role::Requestor, &[&list]);
        let fault_leg = template.fault_chain().unwrap();
        assert!(fault_leg.phases().contains(names::RECEIVE));
        assert_eq!(fault_leg.registrations().len(), 1);
    }
}

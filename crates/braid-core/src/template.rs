//! 链模板：按需构建新链的工厂。
//!
//! 链实例逐报文创建、逐报文丢弃；模板保存阶段表、注册列表与故障处置配置，每次 `build`
//! 都得到一条全新的、游标归零的链。

use std::{borrow::Cow, fmt, sync::Arc};

use crate::{
    chain::{ChainError, FaultPolicy, PhaseInterceptorChain},
    fault::{FaultSynthesizer, SoapFaultSynthesizer},
    interceptor::InterceptorRegistration,
    phase::PhaseRegistry,
};

/// 链工厂。
#[derive(Clone)]
pub struct ChainTemplate {
    leg: Cow<'static, str>,
    phases: Arc<PhaseRegistry>,
    registrations: Vec<InterceptorRegistration>,
    synthesizer: Arc<dyn FaultSynthesizer>,
    fault_chain: Option<Arc<ChainTemplate>>,
}

impl ChainTemplate {
    pub fn new(leg: impl Into<Cow<'static, str>>, phases: Arc<PhaseRegistry>) -> Self {
        Self {
            leg: leg.into(),
            phases,
            registrations: Vec::new(),
            synthesizer: Arc::new(SoapFaultSynthesizer::default()),
            fault_chain: None,
        }
    }

    pub fn with(mut self, registration: InterceptorRegistration) -> Self {
        self.registrations.push(registration);
        self
    }

    pub fn push(&mut self, registration: InterceptorRegistration) {
        self.registrations.push(registration);
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn FaultSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// 故障发生后驱动故障报文的链模板。
    pub fn with_fault_chain(mut self, fault_chain: ChainTemplate) -> Self {
        self.fault_chain = Some(Arc::new(fault_chain));
        self
    }

    pub fn leg(&self) -> &str {
        &self.leg
    }

    pub fn phases(&self) -> &Arc<PhaseRegistry> {
        &self.phases
    }

    pub fn registrations(&self) -> &[InterceptorRegistration] {
        &self.registrations
    }

    pub fn fault_chain(&self) -> Option<&ChainTemplate> {
        self.fault_chain.as_deref()
    }

    /// 构建一条正常腿的链：故障会被合成为故障报文并交给故障链。
    pub fn build(&self) -> Result<PhaseInterceptorChain, ChainError> {
        self.assemble(FaultPolicy::Dispatch {
            synthesizer: Arc::clone(&self.synthesizer),
            fault_chain: self.fault_chain.clone(),
        })
    }

    /// 构建故障腿：其中再抛出的故障只回卷，不再派发。
    pub(crate) fn build_fault_leg(&self) -> Result<PhaseInterceptorChain, ChainError> {
        self.assemble(FaultPolicy::UnwindOnly)
    }

    fn assemble(&self, policy: FaultPolicy) -> Result<PhaseInterceptorChain, ChainError> {
        let mut chain = PhaseInterceptorChain::new(Arc::clone(&self.phases))
            .with_leg(self.leg.clone())
            .with_fault_policy(policy);
        chain.add_all(self.registrations.iter().cloned())?;
        Ok(chain)
    }
}

impl fmt::Debug for ChainTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainTemplate")
            .field("leg", &self.leg)
            .field("registrations", &self.registrations)
            .field("fault_chain", &self.fault_chain)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{FnInterceptor, Flow};

    #[test]
    fn every_build_yields_a_fresh_chain() {
        let phases = Arc::new(PhaseRegistry::from_pairs([("receive", 0)]).unwrap());
        let template = ChainTemplate::new("inbound", phases).with(InterceptorRegistration::of(
            "noop",
            "receive",
            FnInterceptor::new(|_, _| Ok(Flow::Continue)),
        ));
        let first = template.build().unwrap();
        let second = template.build().unwrap();
        assert_eq!(first.resolved_order(), second.resolved_order());
        assert_eq!(first.leg(), "inbound");
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn invalid_registration_fails_build() {
        let phases = Arc::new(PhaseRegistry::from_pairs([("receive", 0)]).unwrap());
        let template = ChainTemplate::new("inbound", phases).with(InterceptorRegistration::of(
            "lost",
            "send",
            FnInterceptor::new(|_, _| Ok(Flow::Continue)),
        ));
        assert!(matches!(
            template.build(),
            Err(ChainError::UnknownPhase { .. })
        ));
    }
}

//! 链路配置：由容器层提供的纯数据元组列表。
//!
//! # 教案式说明
//! - **意图（Why）**：容器、注解扫描与依赖注入都不属于本引擎；它们最终只需交出
//!   “阶段表 + `{id, phase, before, after}` 列表”，实现则按 id 从目录中查找。
//! - **逻辑（How）**：[`ChainConfig`] 可由 TOML 或 JSON 反序列化；`resolve_order` 不需要任何实现即可
//!   计算执行顺序，便于离线校验；`template`/`build_chain` 再结合 [`InterceptorCatalog`] 装配链路。
//! - **契约（What）**：
//!   - `phases` 为空时使用 `catalog` 指定的内置阶段表（默认入站）；
//!   - 重复 id 以首次出现者为准，与链路的去重规则一致；
//!   - 目录缺少某个 id 的实现时返回 [`ConfigError::UnknownInterceptor`]。
//!
//! ```toml
//! catalog = "inbound"
//!
//! [[interceptors]]
//! id = "auth"
//! phase = "pre-protocol"
//! after = ["log"]
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    chain::{ChainError, PhaseInterceptorChain, ResolvedOrder},
    interceptor::{Interceptor, InterceptorRegistration, Placement},
    ordering,
    phase::{PhaseError, PhaseRegistry},
    template::ChainTemplate,
};

/// 配置中的一条拦截器放置描述。
pub type RegistrationConfig = Placement;

/// 配置中的阶段。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    pub order: i32,
}

/// 内置阶段表。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseCatalog {
    #[default]
    Inbound,
    Outbound,
}

/// 配置错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TOML chain configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON chain configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error("interceptor `{id}` has no implementation in the catalog")]
    UnknownInterceptor { id: String },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Toml(_) => "braid.config.toml",
            ConfigError::Json(_) => "braid.config.json",
            ConfigError::Phase(err) => err.code(),
            ConfigError::UnknownInterceptor { .. } => "braid.config.unknown_interceptor",
            ConfigError::Chain(err) => err.code(),
        }
    }
}

/// 一条链路腿的配置。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leg: Option<String>,
    #[serde(default)]
    pub catalog: PhaseCatalog,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub interceptors: Vec<RegistrationConfig>,
}

impl ChainConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn phase_registry(&self) -> Result<PhaseRegistry, ConfigError> {
        if self.phases.is_empty() {
            return Ok(match self.catalog {
                PhaseCatalog::Inbound => PhaseRegistry::default_inbound(),
                PhaseCatalog::Outbound => PhaseRegistry::default_outbound(),
            });
        }
        let mut builder = PhaseRegistry::builder();
        for phase in &self.phases {
            builder.register(phase.name.clone(), phase.order)?;
        }
        Ok(builder.build())
    }

    /// 不装配实现，直接计算执行顺序。
    pub fn resolve_order(&self) -> Result<ResolvedOrder, ConfigError> {
        let phases = self.phase_registry()?;
        let mut seen = Vec::with_capacity(self.interceptors.len());
        for placement in &self.interceptors {
            if !seen.iter().any(|existing: &&Placement| existing.id == placement.id) {
                seen.push(placement);
            }
        }
        let order = ordering::resolve(&phases, &seen).map_err(ChainError::from)?;
        Ok(order.into_iter().map(|index| seen[index].id.clone()).collect())
    }

    /// 结合实现目录生成链模板。
    pub fn template(&self, catalog: &InterceptorCatalog) -> Result<ChainTemplate, ConfigError> {
        let phases = Arc::new(self.phase_registry()?);
        let leg = self.leg.clone().unwrap_or_else(|| match self.catalog {
            PhaseCatalog::Inbound => "inbound".to_owned(),
            PhaseCatalog::Outbound => "outbound".to_owned(),
        });
        let mut template = ChainTemplate::new(leg, phases);
        for placement in &self.interceptors {
            let interceptor = catalog.get(&placement.id).ok_or_else(|| {
                ConfigError::UnknownInterceptor {
                    id: placement.id.clone(),
                }
            })?;
            template.push(InterceptorRegistration::new(placement.clone(), interceptor));
        }
        Ok(template)
    }

    pub fn build_chain(
        &self,
        catalog: &InterceptorCatalog,
    ) -> Result<PhaseInterceptorChain, ConfigError> {
        Ok(self.template(catalog)?.build()?)
    }
}

/// 拦截器 id 到实现的目录。
#[derive(Clone, Default)]
pub struct InterceptorCatalog {
    entries: HashMap<String, Arc<dyn Interceptor>>,
}

impl InterceptorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, interceptor: impl Interceptor) -> &mut Self {
        self.entries.insert(id.into(), Arc::new(interceptor));
        self
    }

    pub fn insert_shared(&mut self, id: impl Into<String>, interceptor: Arc<dyn Interceptor>) -> &mut Self {
        self.entries.insert(id.into(), interceptor);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Interceptor>> {
        self.entries.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for InterceptorCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("InterceptorCatalog").field("ids", &ids).finish()
    }
}

//! 阶段注册表：为拦截器链提供严格全序的处理阶段目录。
//!
//! # 教案式说明
//! - **意图（Why）**：拦截器之间的跨阶段顺序只由阶段序决定。把阶段目录集中在一个不可变注册表中，
//!   所有链路共享同一份只读视图，避免每条链各自维护排序规则。
//! - **逻辑（How）**：[`PhaseRegistryBuilder`] 在构造期逐个登记 `(name, order)`，重复名称或重复序号
//!   立即拒绝；`build` 后按序号排序并建立名称索引，之后注册表不再提供任何可变接口。
//! - **契约（What）**：任意两个阶段的比较结果不可能为 `Equal`（除非比较同一阶段）；
//!   注册表以 `Arc<PhaseRegistry>` 形式在链路间共享。

use std::{borrow::Cow, cmp::Ordering, collections::HashMap};

use thiserror::Error;

/// 标准阶段名称常量。
///
/// 入站与出站目录共享部分名称（如 `pre-logical`），但序号只在各自的注册表内有意义。
pub mod names {
    pub const RECEIVE: &str = "receive";
    pub const PRE_STREAM: &str = "pre-stream";
    pub const USER_STREAM: &str = "user-stream";
    pub const POST_STREAM: &str = "post-stream";
    pub const READ: &str = "read";
    pub const PRE_PROTOCOL: &str = "pre-protocol";
    pub const PRE_PROTOCOL_FRONTEND: &str = "pre-protocol-frontend";
    pub const USER_PROTOCOL: &str = "user-protocol";
    pub const POST_PROTOCOL: &str = "post-protocol";
    pub const UNMARSHAL: &str = "unmarshal";
    pub const PRE_LOGICAL: &str = "pre-logical";
    pub const USER_LOGICAL: &str = "user-logical";
    pub const POST_LOGICAL: &str = "post-logical";
    pub const PRE_INVOKE: &str = "pre-invoke";
    pub const INVOKE: &str = "invoke";
    pub const POST_INVOKE: &str = "post-invoke";

    pub const SETUP: &str = "setup";
    pub const PREPARE_SEND: &str = "prepare-send";
    pub const WRITE: &str = "write";
    pub const PRE_MARSHAL: &str = "pre-marshal";
    pub const MARSHAL: &str = "marshal";
    pub const POST_MARSHAL: &str = "post-marshal";
    pub const SEND: &str = "send";
    pub const SEND_ENDING: &str = "send-ending";
    pub const POST_STREAM_ENDING: &str = "post-stream-ending";
    pub const USER_STREAM_ENDING: &str = "user-stream-ending";
    pub const POST_PROTOCOL_ENDING: &str = "post-protocol-ending";
    pub const USER_PROTOCOL_ENDING: &str = "user-protocol-ending";
    pub const MARSHAL_ENDING: &str = "marshal-ending";
    pub const WRITE_ENDING: &str = "write-ending";
    pub const PRE_PROTOCOL_ENDING: &str = "pre-protocol-ending";
    pub const PRE_STREAM_ENDING: &str = "pre-stream-ending";
    pub const PREPARE_SEND_ENDING: &str = "prepare-send-ending";
    pub const POST_LOGICAL_ENDING: &str = "post-logical-ending";
    pub const SETUP_ENDING: &str = "setup-ending";
}

/// 标准入站目录，按执行先后排列。
const DEFAULT_INBOUND: &[&str] = &[
    names::RECEIVE,
    names::PRE_STREAM,
    names::USER_STREAM,
    names::POST_STREAM,
    names::READ,
    names::PRE_PROTOCOL,
    names::PRE_PROTOCOL_FRONTEND,
    names::USER_PROTOCOL,
    names::POST_PROTOCOL,
    names::UNMARSHAL,
    names::PRE_LOGICAL,
    names::USER_LOGICAL,
    names::POST_LOGICAL,
    names::PRE_INVOKE,
    names::INVOKE,
    names::POST_INVOKE,
];

/// 标准出站目录；`*-ending` 阶段用于在流关闭前以逆序收尾。
const DEFAULT_OUTBOUND: &[&str] = &[
    names::SETUP,
    names::PRE_LOGICAL,
    names::USER_LOGICAL,
    names::POST_LOGICAL,
    names::PREPARE_SEND,
    names::PRE_STREAM,
    names::PRE_PROTOCOL,
    names::PRE_PROTOCOL_FRONTEND,
    names::WRITE,
    names::PRE_MARSHAL,
    names::MARSHAL,
    names::POST_MARSHAL,
    names::USER_PROTOCOL,
    names::POST_PROTOCOL,
    names::USER_STREAM,
    names::POST_STREAM,
    names::SEND,
    names::SEND_ENDING,
    names::POST_STREAM_ENDING,
    names::USER_STREAM_ENDING,
    names::POST_PROTOCOL_ENDING,
    names::USER_PROTOCOL_ENDING,
    names::MARSHAL_ENDING,
    names::WRITE_ENDING,
    names::PRE_PROTOCOL_ENDING,
    names::PRE_STREAM_ENDING,
    names::PREPARE_SEND_ENDING,
    names::POST_LOGICAL_ENDING,
    names::SETUP_ENDING,
];

/// 标准目录中相邻阶段的序号间隔，留出空位给自定义阶段。
const DEFAULT_ORDER_STEP: i32 = 100;

/// 阶段注册与比较过程中的错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    /// 名称已存在。
    #[error("phase `{name}` is already registered")]
    DuplicatePhase { name: String },

    /// 序号已被其他阶段占用，两个阶段不得比较相等。
    #[error("phase order {order} is already taken by `{existing}`, cannot register `{name}`")]
    DuplicateOrder {
        name: String,
        order: i32,
        existing: String,
    },

    /// 查询了未登记的阶段。
    #[error("phase `{name}` is not registered")]
    UnknownPhase { name: String },
}

impl PhaseError {
    /// 稳定错误码，遵循 `<领域>.<语义>` 约定。
    pub fn code(&self) -> &'static str {
        match self {
            PhaseError::DuplicatePhase { .. } => "braid.phase.duplicate",
            PhaseError::DuplicateOrder { .. } => "braid.phase.duplicate_order",
            PhaseError::UnknownPhase { .. } => "braid.phase.unknown",
        }
    }
}

/// 具名处理阶段。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Phase {
    name: Cow<'static, str>,
    order: i32,
}

impl Phase {
    pub fn new(name: impl Into<Cow<'static, str>>, order: i32) -> Self {
        Self {
            name: name.into(),
            order,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> i32 {
        self.order
    }
}

impl PartialOrd for Phase {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Phase {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order
            .cmp(&other.order)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// 构造期使用的可变登记器。
///
/// # 教案式说明
/// - **意图（Why）**：注册表在构造完成后必须只读；把写操作隔离到 Builder，编译器即可保证
///   共享后的注册表不会被修改。
/// - **契约（What）**：`register` 在名称或序号冲突时返回 [`PhaseError`]，且不修改已登记内容。
#[derive(Debug, Default)]
pub struct PhaseRegistryBuilder {
    phases: Vec<Phase>,
}

impl PhaseRegistryBuilder {
    /// 登记一个阶段。
    pub fn register(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        order: i32,
    ) -> Result<&mut Self, PhaseError> {
        let name = name.into();
        if self.phases.iter().any(|phase| phase.name == name) {
            return Err(PhaseError::DuplicatePhase {
                name: name.into_owned(),
            });
        }
        if let Some(existing) = self.phases.iter().find(|phase| phase.order == order) {
            return Err(PhaseError::DuplicateOrder {
                name: name.into_owned(),
                order,
                existing: existing.name.to_string(),
            });
        }
        self.phases.push(Phase::new(name, order));
        Ok(self)
    }

    /// 冻结登记结果。
    pub fn build(self) -> PhaseRegistry {
        let mut phases = self.phases;
        phases.sort();
        let index = phases
            .iter()
            .enumerate()
            .map(|(position, phase)| (phase.name.to_string(), position))
            .collect();
        PhaseRegistry { phases, index }
    }
}

/// 不可变的阶段目录。
///
/// # 契约说明（What）
/// - `phases()` 按执行顺序返回；
/// - `position` 返回阶段在目录中的下标，拦截器链以该下标作为分桶键；
/// - `order(a, b)` 对任意两个已登记阶段给出全序结果。
#[derive(Clone, Debug)]
pub struct PhaseRegistry {
    phases: Vec<Phase>,
    index: HashMap<String, usize>,
}

impl PhaseRegistry {
    pub fn builder() -> PhaseRegistryBuilder {
        PhaseRegistryBuilder::default()
    }

    /// 从 `(name, order)` 列表一次性构造注册表。
    pub fn from_pairs<I, N>(pairs: I) -> Result<Self, PhaseError>
    where
        I: IntoIterator<Item = (N, i32)>,
        N: Into<Cow<'static, str>>,
    {
        let mut builder = Self::builder();
        for (name, order) in pairs {
            builder.register(name, order)?;
        }
        Ok(builder.build())
    }

    /// 标准入站目录（`receive` … `post-invoke`）。
    pub fn default_inbound() -> Self {
        Self::from_catalog(DEFAULT_INBOUND)
    }

    /// 标准出站目录（`setup` … `send` 及其 `*-ending` 收尾阶段）。
    pub fn default_outbound() -> Self {
        Self::from_catalog(DEFAULT_OUTBOUND)
    }

    fn from_catalog(catalog: &'static [&'static str]) -> Self {
        // 目录常量中名称互不相同、序号单调递增，逐个追加不会触发冲突分支。
        let phases: Vec<Phase> = catalog
            .iter()
            .zip(1..)
            .map(|(name, step)| Phase::new(*name, step * DEFAULT_ORDER_STEP))
            .collect();
        PhaseRegistryBuilder { phases }.build()
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Phase> {
        self.position(name).map(|position| &self.phases[position])
    }

    /// 阶段在执行顺序中的下标。
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// 比较两个阶段的先后。
    pub fn order(&self, a: &str, b: &str) -> Result<Ordering, PhaseError> {
        let left = self.require(a)?;
        let right = self.require(b)?;
        Ok(left.cmp(&right))
    }

    fn require(&self, name: &str) -> Result<usize, PhaseError> {
        self.position(name).ok_or_else(|| PhaseError::UnknownPhase {
            name: name.to_owned(),
        })
    }
}

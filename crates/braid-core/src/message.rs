//! 在途报文：可变属性袋 + 不透明载荷。
//!
//! # 教案式说明
//! - **意图（Why）**：拦截器之间只通过报文交换信息。拦截器实例可能被多条链共享，
//!   所以任何“单次请求”的状态都必须挂在报文上，而不是拦截器字段里。
//! - **结构（How）**：
//!   - 方向 [`Direction`] 与角色 [`Role`] 决定 Handler 调用器的分支；
//!   - `properties` 是字符串键的 JSON 值属性袋，便于配置层与日志读取；
//!   - [`Extensions`] 是按类型索引的扩展槽，存放强类型的逐报文状态（如 Handler 调用进度）；
//!   - `content` 为不透明字节载荷，链路引擎本身从不解析。
//! - **契约（What）**：`Message` 为 `Send`，可随暂停的链路一起跨线程移动。

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, HashMap},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use serde_json::Value;

use crate::{exchange::Exchange, fault::Fault};

/// 约定的报文属性键。
pub mod keys {
    /// 从指定拦截器之后开始执行入站链，值为拦截器 id。
    pub const STARTING_AFTER: &str = "braid.chain.starting_after";
    /// 从指定拦截器开始执行，值为拦截器 id。
    pub const STARTING_AT: &str = "braid.chain.starting_at";
    /// 报文由 Handler 中止改道合成，值为布尔。
    pub const REDIRECTED_RESPONSE: &str = "braid.handler.redirected_response";
}

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// 报文流向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_outbound(self) -> bool {
        self == Direction::Outbound
    }

    pub fn reversed(self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// 报文所属一侧。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// 客户端：发出请求、接收响应。
    Requestor,
    /// 服务端：接收请求、发出响应。
    Responder,
}

impl Role {
    pub fn is_requestor(self) -> bool {
        self == Role::Requestor
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Requestor => "requestor",
            Role::Responder => "responder",
        }
    }
}

/// 按类型索引的扩展槽。
#[derive(Default)]
pub struct Extensions {
    slots: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.slots
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok().map(|boxed| *boxed))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.slots
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.slots
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn get_or_insert_with<T, F>(&mut self, init: F) -> &mut T
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let slot = self
            .slots
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(init()));
        match slot.downcast_mut::<T>() {
            Some(value) => value,
            // 键由 `TypeId::of::<T>()` 决定，槽中值的类型必然为 `T`。
            None => unreachable!("extension slot type mismatch"),
        }
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.slots
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok().map(|boxed| *boxed))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.slots.len())
            .finish()
    }
}

/// 一次在途的请求或响应。
#[derive(Debug)]
pub struct Message {
    id: u64,
    direction: Direction,
    role: Role,
    exchange: Exchange,
    properties: BTreeMap<String, Value>,
    content: Bytes,
    fault: Option<Fault>,
    extensions: Extensions,
}

impl Message {
    pub fn new(exchange: Exchange, direction: Direction, role: Role) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            role,
            exchange,
            properties: BTreeMap::new(),
            content: Bytes::new(),
            fault: None,
            extensions: Extensions::default(),
        }
    }

    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = content.into();
        self
    }

    /// 在同一交换内为本报文创建反向报文（请求 → 响应）。
    pub fn reply(&self) -> Message {
        Message::new(self.exchange.clone(), self.direction.reversed(), self.role)
    }

    /// 进程内唯一的报文序号，用于日志关联。
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_outbound(&self) -> bool {
        self.direction.is_outbound()
    }

    pub fn is_requestor(&self) -> bool {
        self.role.is_requestor()
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// 替换载荷，返回旧值。
    pub fn set_content(&mut self, content: impl Into<Bytes>) -> Bytes {
        std::mem::replace(&mut self.content, content.into())
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.properties.insert(key.into(), value.into())
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &BTreeMap<String, Value> {
        &self.properties
    }

    /// 当前附着的故障；链路进入故障模式时写入。
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    pub fn set_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

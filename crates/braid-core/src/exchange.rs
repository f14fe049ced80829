//! 交换：关联一次调用的请求与响应报文。
//!
//! # 教案式说明
//! - **意图（Why）**：请求腿与响应腿各有一条链路，但取消、单向标记、改道观察者以及故障报文
//!   需要在两条腿之间共享；交换是它们唯一的汇合点。
//! - **逻辑（How）**：`Exchange` 是 `Arc` 句柄，可随报文廉价克隆。取消与终止标记使用原子量，
//!   报文槽与观察者以 `parking_lot::Mutex` 保护，临界区内不调用任何外部代码。
//! - **契约（What）**：
//!   - `cancel()` 只设置标记，链路在下一个拦截器边界观察到后转为 `Aborted`；
//!   - 报文槽持有 `Message` 的所有权，而报文又持有交换句柄；调用方读取结果应使用 `take_*`
//!     取走报文，或在结束时调用 [`Exchange::release`] 解开引用环。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{message::Message, observer::MessageObserver};

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);

/// 交换上的取消信号，可单独克隆给传输层。
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Slots {
    in_message: Option<Message>,
    out_message: Option<Message>,
    in_fault_message: Option<Message>,
    out_fault_message: Option<Message>,
}

struct ExchangeInner {
    id: u64,
    one_way: bool,
    cancellation: CancellationToken,
    terminated: AtomicBool,
    slots: Mutex<Slots>,
    observer: Mutex<Option<Arc<dyn MessageObserver>>>,
}

/// 请求/响应关联对象。
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

impl Exchange {
    /// 双向交换：请求之后期待响应。
    pub fn new() -> Self {
        Self::build(false)
    }

    /// 单向交换：不产生响应，Handler 中止时也不会改道。
    pub fn one_way() -> Self {
        Self::build(true)
    }

    fn build(one_way: bool) -> Self {
        Self {
            inner: Arc::new(ExchangeInner {
                id: NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed),
                one_way,
                cancellation: CancellationToken::default(),
                terminated: AtomicBool::new(false),
                slots: Mutex::new(Slots::default()),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_one_way(&self) -> bool {
        self.inner.one_way
    }

    /// 请求取消；不会打断正在进行的传输 I/O。
    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    /// 拆除交换：之后不会再有拦截器在任何一条腿上运行。
    ///
    /// 已放入槽中的报文一并清空，拆除后的交换不产生任何响应。
    pub fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::Release);
        self.inner.cancellation.cancel();
        self.release();
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    /// 注册接收改道响应的观察者（通常是客户端的入站链发起者）。
    pub fn set_observer(&self, observer: Arc<dyn MessageObserver>) {
        *self.inner.observer.lock() = Some(observer);
    }

    pub fn observer(&self) -> Option<Arc<dyn MessageObserver>> {
        self.inner.observer.lock().clone()
    }

    pub fn set_in_message(&self, message: Message) -> Option<Message> {
        self.inner.slots.lock().in_message.replace(message)
    }

    pub fn take_in_message(&self) -> Option<Message> {
        self.inner.slots.lock().in_message.take()
    }

    pub fn set_out_message(&self, message: Message) -> Option<Message> {
        self.inner.slots.lock().out_message.replace(message)
    }

    pub fn take_out_message(&self) -> Option<Message> {
        self.inner.slots.lock().out_message.take()
    }

    pub fn set_in_fault_message(&self, message: Message) -> Option<Message> {
        self.inner.slots.lock().in_fault_message.replace(message)
    }

    pub fn take_in_fault_message(&self) -> Option<Message> {
        self.inner.slots.lock().in_fault_message.take()
    }

    pub fn set_out_fault_message(&self, message: Message) -> Option<Message> {
        self.inner.slots.lock().out_fault_message.replace(message)
    }

    pub fn take_out_fault_message(&self) -> Option<Message> {
        self.inner.slots.lock().out_fault_message.take()
    }

    pub fn has_out_fault_message(&self) -> bool {
        self.inner.slots.lock().out_fault_message.is_some()
    }

    pub fn has_in_fault_message(&self) -> bool {
        self.inner.slots.lock().in_fault_message.is_some()
    }

    /// 清空所有报文槽与观察者，解开报文与交换之间的引用环。
    pub fn release(&self) {
        let slots = std::mem::take(&mut *self.inner.slots.lock());
        let observer = self.inner.observer.lock().take();
        // 在锁外析构，避免报文析构时重入本交换。
        drop(slots);
        drop(observer);
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.inner.id)
            .field("one_way", &self.inner.one_way)
            .field("cancelled", &self.is_cancelled())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

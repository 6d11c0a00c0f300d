//! flash 累加：用 log-sum-exp 递推合并两个 (max, sum, 向量) 状态。
//!
//! 递推满足交换律和结合律（在 `sum == 0` 的保护下），因此 chunk 和 group
//! 可以以任意顺序合并。

use num_traits::Float;
use std::{
    hint::spin_loop,
    iter::zip,
    sync::atomic::{AtomicU64, Ordering},
};

/// 一行的 softmax 统计量
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stat<T> {
    pub max: T,
    pub sum: T,
}

impl<T: Float> Stat<T> {
    /// 无贡献状态：max 取最小可表示值，sum 为 0
    pub fn empty() -> Self {
        Self {
            max: T::min_value(),
            sum: T::zero(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sum == T::zero()
    }

    /// 根据新元素更新状态
    pub fn push(&mut self, x: T) {
        self.sum = if x > self.max {
            let old_max = std::mem::replace(&mut self.max, x);
            self.sum * (old_max - x).exp() + T::one()
        } else {
            self.sum + (x - self.max).exp()
        }
    }

    /// 合并两个状态，返回新状态和两侧向量的系数
    pub fn merge(self, curr: Self) -> (Self, Weights<T>) {
        if curr.is_empty() {
            return (self, Weights::Keep);
        }
        if self.is_empty() {
            return (curr, Weights::Replace);
        }

        let max = self.max.max(curr.max);
        let prev_w = (self.max - max).exp();
        let curr_w = (curr.max - max).exp();
        let sum = prev_w * self.sum + curr_w * curr.sum;
        let inv = sum.recip();
        (
            Self { max, sum },
            Weights::Scale {
                prev: prev_w * (self.sum * inv),
                curr: curr_w * (curr.sum * inv),
            },
        )
    }
}

/// 输出向量的合并方式
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Weights<T> {
    /// 当前侧无贡献，保持原向量
    Keep,
    /// 原侧无贡献，直接覆盖，原向量不读
    Replace,
    Scale { prev: T, curr: T },
}

impl<T: Float> Weights<T> {
    pub fn apply(self, prev: &mut [T], curr: &[T]) {
        debug_assert_eq!(prev.len(), curr.len());
        match self {
            Self::Keep => {}
            Self::Replace => prev.copy_from_slice(curr),
            Self::Scale { prev: a, curr: b } => {
                zip(prev, curr).for_each(|(p, &c)| *p = a * *p + b * c)
            }
        }
    }
}

/// group 局部累加器
#[derive(Clone, Debug)]
pub struct RowAcc<T> {
    pub stat: Stat<T>,
    pub out: Vec<T>,
}

impl<T: Float> RowAcc<T> {
    pub fn new(d: usize) -> Self {
        Self {
            stat: Stat::empty(),
            out: vec![T::zero(); d],
        }
    }

    pub fn reset(&mut self) {
        self.stat = Stat::empty();
        self.out.fill(T::zero())
    }

    /// 局部合并一个 chunk 的部分结果
    pub fn merge(&mut self, stat: Stat<T>, out: &[T]) {
        let (stat, weights) = self.stat.merge(stat);
        weights.apply(&mut self.out, out);
        self.stat = stat
    }
}

/// 全局 (max, sum) 槽位，兼作自旋锁。
///
/// 编码：高 32 位为 `max` 的 f32 位模式，低 32 位为 `sum` 的 f32 位模式。
/// [`FlashSlot::LOCKED`] (`u64::MAX`，两半都是全 1 的 NaN) 是保留值，
/// 表示某个 group 正在更新这一行；合法状态的 sum 永远不是 NaN。
#[derive(Debug)]
#[repr(transparent)]
pub struct FlashSlot(AtomicU64);

impl FlashSlot {
    pub const LOCKED: u64 = u64::MAX;

    pub fn new(stat: Stat<f32>) -> Self {
        Self(AtomicU64::new(pack(stat)))
    }

    pub fn empty() -> Self {
        Self::new(Stat::empty())
    }

    /// 读取当前状态，调用方需保证没有并发的合并
    pub fn load(&self) -> Stat<f32> {
        let bits = self.0.load(Ordering::Acquire);
        debug_assert_ne!(bits, Self::LOCKED);
        unpack(bits)
    }

    /// 独占写入（write-once 模式）
    pub fn store(&self, stat: Stat<f32>) {
        self.0.store(pack(stat), Ordering::Release)
    }

    pub fn bits(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set_bits(&self, bits: u64) {
        self.0.store(bits, Ordering::Release)
    }

    /// 原子合并：加锁后由 `apply` 按系数更新输出向量，再以新状态释放锁。
    ///
    /// `stat` 为空时不触碰槽位，已有内容保持不变。
    pub fn merge(&self, stat: Stat<f32>, apply: impl FnOnce(Weights<f32>)) {
        if stat.is_empty() {
            return;
        }
        let prev = self.lock();
        let (stat, weights) = prev.merge(stat);
        apply(weights);
        self.0.store(pack(stat), Ordering::Release)
    }

    fn lock(&self) -> Stat<f32> {
        let mut backoff = Backoff::default();
        loop {
            let bits = self.0.load(Ordering::Relaxed);
            if bits != Self::LOCKED
                && self
                    .0
                    .compare_exchange_weak(bits, Self::LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return unpack(bits);
            }
            backoff.snooze()
        }
    }
}

impl Default for FlashSlot {
    fn default() -> Self {
        Self::empty()
    }
}

/// 生成 `n` 个无贡献槽位
pub fn empty_slots(n: usize) -> Box<[FlashSlot]> {
    (0..n).map(|_| FlashSlot::empty()).collect()
}

const fn pack(Stat { max, sum }: Stat<f32>) -> u64 {
    ((max.to_bits() as u64) << 32) | sum.to_bits() as u64
}

const fn unpack(bits: u64) -> Stat<f32> {
    Stat {
        max: f32::from_bits((bits >> 32) as u32),
        sum: f32::from_bits(bits as u32),
    }
}

/// 指数退避
#[derive(Default)]
struct Backoff(u32);

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    fn snooze(&mut self) {
        if self.0 <= Self::SPIN_LIMIT {
            for _ in 0..1 << self.0 {
                spin_loop()
            }
            self.0 += 1
        } else {
            std::thread::yield_now()
        }
    }
}

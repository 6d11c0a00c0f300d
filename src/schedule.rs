//! chunk 调度：每个 group 反复领取 `[start, end)` 个 chunk，领到空区间即结束。
//!
//! 实现必须保证同一行内的 claim 互不相交，且最终覆盖 `[0, chunks)`。

use crate::error::{Error, Result};
use std::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::trace;

/// 一个 group 在一行上的调度上下文
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Task {
    /// 行号（序列 × 头组）
    pub row: usize,
    /// group 在行内的序号
    pub group: usize,
    /// 行内 group 总数
    pub groups: usize,
    /// 行内 chunk 总数
    pub chunks: usize,
}

/// group 侧的领取接口
pub trait Worker {
    /// 由 group 的首个 lane 调用，空区间表示没有更多工作
    fn claim(&mut self) -> Range<usize>;

    /// 把首个 lane 领到的区间广播给 group 内所有 lane
    fn broadcast(&self, claim: &Range<usize>, lanes: &mut [Range<usize>]) {
        lanes.fill(claim.clone())
    }
}

/// 调度策略
pub trait Schedule: Sync {
    type Worker<'a>: Worker
    where
        Self: 'a;

    /// 每次启动前调用：检查调度器与本次调用的行数和 group 数是否匹配，并重置内部状态
    fn prepare(&self, rows: usize, groups: usize) -> Result<()> {
        let _ = (rows, groups);
        Ok(())
    }

    fn worker(&self, task: Task) -> Self::Worker<'_>;
}

/// 静态均分：每个 group 一次领走自己那一份
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticPartition;

pub struct StaticWorker(pub(crate) Option<Range<usize>>);

impl Worker for StaticWorker {
    fn claim(&mut self) -> Range<usize> {
        self.0.take().unwrap_or(0..0)
    }
}

impl Schedule for StaticPartition {
    type Worker<'a> = StaticWorker;

    fn worker(&self, task: Task) -> StaticWorker {
        StaticWorker(Some(even_slice(task)))
    }
}

/// 第 `group` 份均分区间
fn even_slice(task: Task) -> Range<usize> {
    let Task {
        group,
        groups,
        chunks,
        ..
    } = task;
    chunks * group / groups..chunks * (group + 1) / groups
}

/// 带窃取的动态队列。
///
/// 每个 (行, group) 有一个打包成 `u64` 的区间 `[start, end)`（高 32 位 start，低 32 位 end）。
/// 所有者从队首按批领取；自己的队列空了之后，从同一行其他 group 的队尾窃取一半。
pub struct WorkStealing {
    queues: Box<[AtomicU64]>,
    groups: usize,
    batch: usize,
}

/// 队列尚未由所有者初始化
const UNINIT: u64 = u64::MAX;

impl WorkStealing {
    pub fn new(rows: usize, groups: usize, batch: usize) -> Self {
        assert!(groups > 0 && batch > 0);
        Self {
            queues: (0..rows * groups).map(|_| AtomicU64::new(UNINIT)).collect(),
            groups,
            batch,
        }
    }

    fn queue(&self, row: usize, group: usize) -> &AtomicU64 {
        &self.queues[row * self.groups + group]
    }
}

pub struct StealingWorker<'a> {
    owner: &'a WorkStealing,
    task: Task,
}

impl Schedule for WorkStealing {
    type Worker<'a> = StealingWorker<'a>;

    fn prepare(&self, rows: usize, groups: usize) -> Result<()> {
        for (what, expected, actual) in [
            ("schedule groups", groups, self.groups),
            ("schedule rows", rows, self.queues.len() / self.groups),
        ] {
            if expected != actual {
                return Err(Error::Mismatch {
                    what,
                    expected,
                    actual,
                });
            }
        }
        // 上一次启动留下的队列已经排空，全部重新交给所有者初始化
        for queue in &self.queues {
            queue.store(UNINIT, Ordering::Relaxed)
        }
        Ok(())
    }

    fn worker(&self, task: Task) -> StealingWorker<'_> {
        debug_assert_eq!(task.groups, self.groups);
        assert!(task.chunks < u32::MAX as usize);
        let Range { start, end } = even_slice(task);
        let queue = self.queue(task.row, task.group);
        let _ = queue.compare_exchange(
            UNINIT,
            pack(start, end),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
        StealingWorker { owner: self, task }
    }
}

impl Worker for StealingWorker<'_> {
    fn claim(&mut self) -> Range<usize> {
        let Self { owner, task } = *self;
        let Task { row, group, .. } = task;

        if let Some(claim) = pop_front(owner.queue(row, group), owner.batch) {
            return claim;
        }
        for i in 1..owner.groups {
            let victim = (group + i) % owner.groups;
            if let Some(claim) = steal_back(owner.queue(row, victim)) {
                trace!(row, group, victim, ?claim, "stolen");
                return claim;
            }
        }
        0..0
    }
}

fn pop_front(queue: &AtomicU64, batch: usize) -> Option<Range<usize>> {
    update(queue, |start, end| {
        let mid = end.min(start + batch);
        (start..mid, pack(mid, end))
    })
}

fn steal_back(queue: &AtomicU64) -> Option<Range<usize>> {
    update(queue, |start, end| {
        let mid = end - (end - start).div_ceil(2);
        (mid..end, pack(start, mid))
    })
}

/// 对非空队列做一次 CAS 更新，`f` 返回领到的区间和新的队列值
fn update(
    queue: &AtomicU64,
    f: impl Fn(usize, usize) -> (Range<usize>, u64),
) -> Option<Range<usize>> {
    let mut current = queue.load(Ordering::Acquire);
    loop {
        if current == UNINIT {
            return None;
        }
        let (start, end) = unpack(current);
        if start >= end {
            return None;
        }
        let (claim, next) = f(start, end);
        match queue.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Some(claim),
            Err(actual) => current = actual,
        }
    }
}

const fn pack(start: usize, end: usize) -> u64 {
    ((start as u64) << 32) | end as u64
}

const fn unpack(bits: u64) -> (usize, usize) {
    ((bits >> 32) as usize, bits as u32 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    /// 收集一个 worker 的全部 claim，直到空区间
    fn drain(mut worker: impl Worker) -> Vec<usize> {
        let mut ans = Vec::new();
        loop {
            let claim = worker.claim();
            if claim.is_empty() {
                break ans;
            }
            ans.extend(claim)
        }
    }

    fn task(row: usize, group: usize, groups: usize, chunks: usize) -> Task {
        Task {
            row,
            group,
            groups,
            chunks,
        }
    }

    #[test]
    fn test_static_partition() {
        let schedule = StaticPartition;
        let mut all = (0..3)
            .flat_map(|group| drain(schedule.worker(task(0, group, 3, 10))))
            .collect::<Vec<_>>();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        // 均分后为空的 group 第一次就拿到空区间
        let mut worker = schedule.worker(task(0, 0, 4, 2));
        assert!(worker.claim().is_empty())
    }

    #[test]
    fn test_broadcast() {
        let mut worker = StaticPartition.worker(task(0, 1, 2, 8));
        let claim = worker.claim();
        let mut lanes = vec![0..0; 4];
        worker.broadcast(&claim, &mut lanes);
        assert!(lanes.iter().all(|lane| *lane == (4..8)))
    }

    #[test]
    fn test_work_stealing_single_thread() {
        // group 0 把自己的份做完后会偷 group 1 的
        let schedule = WorkStealing::new(1, 2, 2);
        let w0 = schedule.worker(task(0, 0, 2, 9));
        let w1 = schedule.worker(task(0, 1, 2, 9));
        let mut got = drain(w0);
        assert!(drain(w1).is_empty());
        got.sort_unstable();
        assert_eq!(got, (0..9).collect::<Vec<_>>())
    }

    #[test]
    fn test_work_stealing_concurrent() {
        const ROWS: usize = 5;
        const GROUPS: usize = 8;
        const CHUNKS: usize = 1000;

        let schedule = WorkStealing::new(ROWS, GROUPS, 3);
        let claims = (0..ROWS * GROUPS)
            .into_par_iter()
            .map(|i| {
                let (row, group) = (i / GROUPS, i % GROUPS);
                (row, drain(schedule.worker(task(row, group, GROUPS, CHUNKS))))
            })
            .collect::<Vec<_>>();

        for row in 0..ROWS {
            let mut all = claims
                .iter()
                .filter(|(r, _)| *r == row)
                .flat_map(|(_, c)| c.iter().copied())
                .collect::<Vec<_>>();
            all.sort_unstable();
            // 不重不漏
            assert_eq!(all, (0..CHUNKS).collect::<Vec<_>>())
        }
    }

    #[test]
    fn test_prepare_rearms() {
        let schedule = WorkStealing::new(1, 1, 4);
        schedule.prepare(1, 1).unwrap();
        assert_eq!(drain(schedule.worker(task(0, 0, 1, 6))).len(), 6);
        assert!(drain(schedule.worker(task(0, 0, 1, 6))).is_empty());
        schedule.prepare(1, 1).unwrap();
        assert_eq!(drain(schedule.worker(task(0, 0, 1, 6))).len(), 6)
    }

    #[test]
    fn test_prepare_mismatch() {
        let schedule = WorkStealing::new(1, 2, 1);
        assert_eq!(
            schedule.prepare(4, 2),
            Err(Error::Mismatch {
                what: "schedule rows",
                expected: 4,
                actual: 1
            })
        );
        assert_eq!(
            schedule.prepare(1, 3),
            Err(Error::Mismatch {
                what: "schedule groups",
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(StaticPartition.prepare(7, 3), Ok(()))
    }
}

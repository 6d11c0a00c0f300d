use super::{KernelCfg, Tdata};
use crate::{
    cache::{Dequant, KvCache},
    flash::{FlashSlot, RowAcc, Stat},
    page::{PageGroup, PagePrefetch, PageTable},
    schedule::{Schedule, Task, Worker},
    softmax::local_softmax,
};
use std::{iter::zip, marker::PhantomData, ops::Range};
use tracing::trace;

/// 全局输出，多个 group 共享
pub(super) struct Output<'a> {
    o: *mut Tdata,
    ms: Option<&'a [FlashSlot]>,
    _o: PhantomData<&'a mut [Tdata]>,
}

unsafe impl Send for Output<'_> {}
unsafe impl Sync for Output<'_> {}

impl<'a> Output<'a> {
    pub fn new(o: &'a mut [Tdata], ms: Option<&'a [FlashSlot]>) -> Self {
        Self {
            o: o.as_mut_ptr(),
            ms,
            _o: PhantomData,
        }
    }

    /// 定位输出行。
    ///
    /// # Safety
    ///
    /// 调用方必须独占这一行：要么该行只属于一个 group，要么持有该行槽位的锁。
    #[allow(clippy::mut_from_ref)]
    unsafe fn row(&self, cfg: &KernelCfg, seq: usize, head: usize) -> &mut [Tdata] {
        let offset = (seq * cfg.h + head) * cfg.d;
        unsafe { std::slice::from_raw_parts_mut(self.o.add(offset), cfg.d) }
    }
}

/// 所有 group 只读共享的参数
pub(super) struct Shared<'a, Q: Dequant<Tdata>> {
    pub cfg: KernelCfg,
    pub q: &'a [Tdata],
    pub q_stride: usize,
    pub cache: KvCache<'a, Q::Elem>,
    pub quant: &'a Q,
    pub page_table: PageTable<'a>,
    pub num_tokens: &'a [usize],
    pub alibi: Option<&'a [Tdata]>,
    pub scale: Tdata,
    pub out: Output<'a>,
}

/// group 的片上暂存，线程间复用
pub(super) struct Scratch {
    /// shape = {lanes}
    claims: Vec<Range<usize>>,
    /// shape = {chunk}
    locs: Vec<Option<(usize, usize)>>,
    /// shape = {chunk}
    valid: Vec<bool>,
    /// shape = {qg, chunk}
    scores: Vec<Tdata>,
    /// shape = {qg}
    max: Vec<Tdata>,
    /// shape = {qg}
    sum: Vec<Tdata>,
    /// shape = {d}
    kv: Vec<Tdata>,
    /// shape = {qg, d}
    partial: Vec<Tdata>,
    /// shape = {qg}
    acc: Vec<RowAcc<Tdata>>,
}

impl Scratch {
    pub fn new(cfg: &KernelCfg) -> Self {
        let &KernelCfg {
            qg, d, chunk, lanes, ..
        } = cfg;
        Self {
            claims: vec![0..0; lanes],
            locs: vec![None; chunk],
            valid: vec![false; chunk],
            scores: vec![0.; qg * chunk],
            max: vec![Tdata::MIN; qg],
            sum: vec![0.; qg],
            kv: vec![0.; d],
            partial: vec![0.; qg * d],
            acc: (0..qg).map(|_| RowAcc::new(d)).collect(),
        }
    }
}

/// 一个 group 在一行上的全部工作
pub(super) struct Block<'a, 'b, Q: Dequant<Tdata>> {
    pub shared: &'a Shared<'b, Q>,
    pub scratch: &'a mut Scratch,
    pub row: usize,
    pub group: usize,
}

impl<Q: Dequant<Tdata>> Block<'_, '_, Q> {
    pub fn launch<S: Schedule>(self, schedule: &S) {
        let Self {
            shared,
            scratch,
            row,
            group,
        } = self;
        let cfg = &shared.cfg;
        let &KernelCfg {
            g,
            qg,
            hg,
            page_size,
            chunk,
            groups,
            single,
            ..
        } = cfg;

        let seq = row / hg;
        let heads = row % hg * qg..(row % hg + 1) * qg;
        let n = shared.num_tokens[seq];
        let stage = Stage {
            shared,
            seq,
            kv_head: heads.start / g,
            heads,
            n,
        };

        let mut worker = schedule.worker(Task {
            row,
            group,
            groups,
            chunks: n.div_ceil(chunk),
        });
        let mut prefetch = PagePrefetch::new(shared.page_table.row(seq), page_size, chunk);
        scratch.acc.iter_mut().for_each(RowAcc::reset);

        loop {
            // lane 0 领取，广播给所有 lane
            let claim = worker.claim();
            worker.broadcast(&claim, &mut scratch.claims);
            debug_assert!(scratch.claims.iter().all(|lane| *lane == claim));
            trace!(seq, row, group, ?claim, "claim");
            // 空 claim 是唯一的结束信号，所有 lane 一起退出
            if claim.is_empty() {
                break;
            }
            for c in claim {
                // barrier 1: 页表预取
                let pages = prefetch.fetch(c);
                stage.chunk(scratch, pages, c * chunk)
            }
            if single {
                break;
            }
        }

        stage.publish(scratch)
    }
}

/// 一个 group 固定的行参数
struct Stage<'a, 'b, Q: Dequant<Tdata>> {
    shared: &'a Shared<'b, Q>,
    seq: usize,
    heads: Range<usize>,
    kv_head: usize,
    n: usize,
}

impl<Q: Dequant<Tdata>> Stage<'_, '_, Q> {
    /// 处理一个 chunk：score → softmax → value → 局部 flash 合并
    fn chunk(&self, scratch: &mut Scratch, pages: &PageGroup, start: usize) {
        let cfg = &self.shared.cfg;
        let &KernelCfg {
            qg, d, page_size, chunk, ..
        } = cfg;
        let n = self.n;

        // 越界或落在空洞上的 token 无效
        for (i, (loc, valid)) in zip(&mut scratch.locs, &mut scratch.valid).enumerate() {
            let t = start + i;
            *loc = if t < n { pages.locate(t, page_size) } else { None };
            *valid = loc.is_some()
        }

        self.score(scratch, start);
        // barrier 2: 所有 score 写入可见
        for qi in 0..qg {
            let scores = &mut scratch.scores[qi * chunk..][..chunk];
            scratch.sum[qi] = local_softmax(scores, &scratch.valid, scratch.max[qi])
        }

        scratch.partial.fill(0.);
        self.value_pages(scratch, pages, start);
        // barrier 4/5: 局部合并
        for qi in 0..qg {
            let stat = Stat {
                max: scratch.max[qi],
                sum: scratch.sum[qi],
            };
            scratch.acc[qi].merge(stat, &scratch.partial[qi * d..][..d])
        }
    }

    /// score = scale · (q · k) [+ alibi · (t − n + 1)]
    fn score(&self, scratch: &mut Scratch, start: usize) {
        let shared = self.shared;
        let &KernelCfg {
            d, chunk, lanes, ..
        } = &shared.cfg;
        let Scratch {
            locs,
            scores,
            max,
            kv: key,
            ..
        } = scratch;
        let layout = &shared.cache.layout;
        let n = self.n as isize;

        max.fill(Tdata::MIN);
        // thread
        for lane in 0..lanes {
            for i in (lane..chunk).step_by(lanes) {
                let Some((page, slot)) = locs[i] else {
                    // 无效位置写 0，不参与最大值
                    for qi in 0..self.heads.len() {
                        scores[qi * chunk + i] = 0.
                    }
                    continue;
                };
                // 一个 key 只加载一次，供组内所有 query 头使用
                for (dd, k) in key.iter_mut().enumerate() {
                    let raw = shared.cache.k[layout.k_offset(page, self.kv_head, dd, slot)];
                    *k = shared.quant.key(raw, page, self.kv_head, dd, slot)
                }
                let t = (start + i) as isize;
                for (qi, head) in self.heads.clone().enumerate() {
                    let q = &shared.q[self.seq * shared.q_stride + head * d..][..d];
                    let mut s = zip(q, &*key).map(|(q, k)| q * k).sum::<Tdata>() * shared.scale;
                    if let Some(alibi) = shared.alibi {
                        s += alibi[head] * (t - n + 1) as Tdata
                    }
                    scores[qi * chunk + i] = s;
                    max[qi] = max[qi].max(s)
                }
            }
        }
    }

    /// 逐页加权求和。整页有效时不检查掩码，chunk 首尾的残页逐 token 检查。
    fn value_pages(&self, scratch: &mut Scratch, pages: &PageGroup, start: usize) {
        let &KernelCfg {
            page_size, chunk, ..
        } = &self.shared.cfg;
        let end = start + chunk;

        for lp in pages.logical() {
            // 空洞不贡献任何 token
            let Some(page) = pages.physical(lp) else {
                continue;
            };
            let lo = (lp * page_size).max(start);
            let hi = ((lp + 1) * page_size).min(end);
            if lo >= hi {
                continue;
            }
            // barrier 3
            if hi <= self.n {
                for t in lo..hi {
                    self.accumulate(scratch, page, t - start, t % page_size)
                }
            } else {
                for t in lo..hi {
                    if scratch.valid[t - start] {
                        self.accumulate(scratch, page, t - start, t % page_size)
                    }
                }
            }
        }
    }

    /// 加载一个 value，按权重累加到组内每个 query 头的部分输出
    fn accumulate(&self, scratch: &mut Scratch, page: usize, i: usize, slot: usize) {
        let shared = self.shared;
        let &KernelCfg { d, chunk, .. } = &shared.cfg;
        let layout = &shared.cache.layout;
        let Scratch {
            scores,
            kv: value,
            partial,
            ..
        } = scratch;

        for (dd, v) in value.iter_mut().enumerate() {
            let raw = shared.cache.v[layout.v_offset(page, self.kv_head, dd, slot)];
            *v = shared.quant.value(raw, page, self.kv_head, dd, slot)
        }
        for (qi, partial) in partial.chunks_exact_mut(d).enumerate() {
            let w = scores[qi * chunk + i];
            zip(partial, &*value).for_each(|(o, v)| *o += w * v)
        }
    }

    /// 把 group 局部累加器发布到全局
    fn publish(&self, scratch: &Scratch) {
        let shared = self.shared;
        let cfg = &shared.cfg;
        let num_seqs = shared.num_tokens.len();

        for (acc, head) in zip(&scratch.acc, self.heads.clone()) {
            let slot = shared
                .out
                .ms
                .map(|ms| &ms[cfg.order.index(self.seq, head, num_seqs, cfg.h)]);
            match slot {
                // barrier 5 之后原子合并，空状态不触碰全局
                Some(slot) if cfg.inplace => slot.merge(acc.stat, |weights| {
                    let row = unsafe { shared.out.row(cfg, self.seq, head) };
                    weights.apply(row, &acc.out)
                }),
                // 该行只属于本 group，直接写出
                _ if !acc.stat.is_empty() => {
                    let row = unsafe { shared.out.row(cfg, self.seq, head) };
                    row.copy_from_slice(&acc.out);
                    if let Some(slot) = slot {
                        slot.store(acc.stat)
                    }
                }
                _ => {}
            }
        }
    }
}

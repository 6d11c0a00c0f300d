use super::{
    PagedAttn, PagedAttnCfg, Tdata,
    kernel::{Block, Output, Scratch, Shared},
};
use crate::{cache::Dequant, error::Result, schedule::Schedule};
use rayon::prelude::*;
use tracing::debug;

impl PagedAttnCfg {
    /// 在 CPU 上计算分页注意力。
    ///
    /// 每个 (行, group) 是一个 rayon 任务，任务之间除全局槽位的锁外互不等待。
    pub fn compute_cpu<Q, S>(&self, req: PagedAttn<'_, Q>, schedule: &S) -> Result<()>
    where
        Q: Dequant<Tdata>,
        S: Schedule,
    {
        let cfg = self.to_kernel_cfg()?;
        req.check(&cfg)?;

        let PagedAttn {
            o,
            ms,
            q,
            q_stride,
            cache,
            quant,
            page_table,
            num_tokens,
            alibi,
            scale,
        } = req;

        let rows = num_tokens.len() * cfg.hg;
        schedule.prepare(rows, cfg.groups)?;
        debug!(
            rows,
            groups = cfg.groups,
            chunk = cfg.chunk,
            inplace = cfg.inplace,
            single = cfg.single,
            "paged attention"
        );

        let shared = Shared {
            cfg,
            q,
            q_stride,
            cache,
            quant: &quant,
            page_table,
            num_tokens,
            alibi,
            scale,
            out: Output::new(o, ms),
        };
        // group 之间完全无关，可以以任意方式并行
        (0..rows * cfg.groups).into_par_iter().for_each_init(
            || Scratch::new(&cfg),
            |scratch, i| {
                Block {
                    shared: &shared,
                    scratch,
                    row: i / cfg.groups,
                    group: i % cfg.groups,
                }
                .launch(schedule)
            },
        );
        Ok(())
    }
}

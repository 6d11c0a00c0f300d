pub mod cpu;
mod kernel;

#[cfg(cuda)]
pub mod cuda;

use crate::{
    cache::{Dequant, KvCache},
    error::{Error, Result, check_len, check_nonzero},
    flash::FlashSlot,
    page::PageTable,
};

pub type Tdata = f32;

/// (max, sum) 副缓冲区的行排布
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RowOrder {
    /// `[num_seqs, num_heads]`
    #[default]
    SeqMajor,
    /// `[num_heads, num_seqs]`
    HeadMajor,
}

impl RowOrder {
    pub const fn index(self, seq: usize, head: usize, num_seqs: usize, num_heads: usize) -> usize {
        match self {
            Self::SeqMajor => seq * num_heads + head,
            Self::HeadMajor => head * num_seqs + seq,
        }
    }
}

/// 部署时确定的 kernel 配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PagedAttnCfg {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub page_size: usize,
    /// 每个 chunk 的 token 数
    pub chunk_stride: usize,
    /// 每个 group 同时处理的 query 头数，这些头共享同一个 kv 头
    pub queries_per_group: usize,
    /// 每行由几个 group 协作
    pub groups_per_row: usize,
    /// 每个 group 的 lane 数
    pub lanes: usize,
    /// 是否以原子合并的方式累加到全局状态
    pub inplace_flash_acc: bool,
    /// 每个 group 只执行一次 claim
    pub single_chunk: bool,
    pub order: RowOrder,
}

/// 校验后的配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelCfg {
    pub h: usize,
    pub kvh: usize,
    /// 每个 kv 头对应的 query 头数
    pub g: usize,
    /// 每个 group 处理的 query 头数
    pub qg: usize,
    /// 头组数 = h / qg
    pub hg: usize,
    pub d: usize,
    pub page_size: usize,
    pub chunk: usize,
    pub groups: usize,
    pub lanes: usize,
    pub inplace: bool,
    pub single: bool,
    pub order: RowOrder,
}

impl PagedAttnCfg {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_size: usize, page_size: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_size,
            page_size,
            chunk_stride: 4 * page_size,
            queries_per_group: 1,
            groups_per_row: 1,
            lanes: 32,
            inplace_flash_acc: false,
            single_chunk: false,
            order: RowOrder::SeqMajor,
        }
    }

    pub fn to_kernel_cfg(&self) -> Result<KernelCfg> {
        let &Self {
            num_heads,
            num_kv_heads,
            head_size,
            page_size,
            chunk_stride,
            queries_per_group,
            groups_per_row,
            lanes,
            inplace_flash_acc,
            single_chunk,
            order,
        } = self;

        check_nonzero("num_heads", num_heads)?;
        check_nonzero("num_kv_heads", num_kv_heads)?;
        check_nonzero("head_size", head_size)?;
        check_nonzero("page_size", page_size)?;
        check_nonzero("chunk_stride", chunk_stride)?;
        check_nonzero("queries_per_group", queries_per_group)?;
        check_nonzero("groups_per_row", groups_per_row)?;
        check_nonzero("lanes", lanes)?;

        if num_heads % num_kv_heads != 0 {
            return Err(Error::HeadGroup {
                num_heads,
                num_kv_heads,
            });
        }
        let g = num_heads / num_kv_heads;
        if g % queries_per_group != 0 {
            return Err(Error::QueriesPerGroup {
                queries: queries_per_group,
                group: g,
            });
        }
        if groups_per_row > 1 && !inplace_flash_acc {
            return Err(Error::SplitRow(groups_per_row));
        }

        Ok(KernelCfg {
            h: num_heads,
            kvh: num_kv_heads,
            g,
            qg: queries_per_group,
            hg: num_heads / queries_per_group,
            d: head_size,
            page_size,
            chunk: chunk_stride,
            groups: groups_per_row,
            lanes,
            inplace: inplace_flash_acc,
            single: single_chunk,
            order,
        })
    }
}

/// 一次调用的全部参数
pub struct PagedAttn<'a, Q: Dequant<Tdata>> {
    /// shape = {num_seqs, num_heads, head_size}
    pub o: &'a mut [Tdata],
    /// shape = {num_seqs, num_heads} 或 {num_heads, num_seqs}，见 [`RowOrder`]
    pub ms: Option<&'a [FlashSlot]>,
    /// shape = {num_seqs, num_heads, head_size}，序列维步长为 `q_stride`
    pub q: &'a [Tdata],
    pub q_stride: usize,
    pub cache: KvCache<'a, Q::Elem>,
    pub quant: Q,
    pub page_table: PageTable<'a>,
    /// shape = {num_seqs}
    pub num_tokens: &'a [usize],
    /// shape = {num_heads}
    pub alibi: Option<&'a [Tdata]>,
    pub scale: Tdata,
}

impl<Q: Dequant<Tdata>> PagedAttn<'_, Q> {
    pub fn num_seqs(&self) -> usize {
        self.num_tokens.len()
    }

    fn check(&self, cfg: &KernelCfg) -> Result<()> {
        let &KernelCfg {
            h,
            kvh,
            d,
            page_size,
            inplace,
            ..
        } = cfg;
        let num_seqs = self.num_seqs();

        self.cache.check()?;
        let layout = &self.cache.layout;
        for (what, expected, actual) in [
            ("num_kv_heads", kvh, layout.num_kv_heads),
            ("head_size", d, layout.head_size),
            ("page_size", page_size, layout.page_size),
        ] {
            if expected != actual {
                return Err(Error::Mismatch {
                    what,
                    expected,
                    actual,
                });
            }
        }
        self.quant.check(layout, self.cache.num_pages())?;

        check_len("page table", self.page_table.num_seqs(), num_seqs)?;
        check_len("o", self.o.len(), num_seqs * h * d)?;
        check_len("q stride", self.q_stride, h * d)?;
        if num_seqs > 0 {
            check_len("q", self.q.len(), (num_seqs - 1) * self.q_stride + h * d)?;
        }
        match self.ms {
            Some(ms) => check_len("ms", ms.len(), num_seqs * h)?,
            None if inplace => return Err(Error::MissingSideBuffer),
            None => {}
        }
        if let Some(alibi) = self.alibi {
            check_len("alibi", alibi.len(), h)?
        }

        let capacity = self.page_table.max_num_pages_per_seq() * page_size;
        for (seq, &num_tokens) in self.num_tokens.iter().enumerate() {
            if num_tokens > capacity {
                return Err(Error::SeqCapacity {
                    seq,
                    num_tokens,
                    capacity,
                });
            }
        }
        Ok(())
    }
}

//! 页表：把序列内的逻辑页映射到共享 cache 中的物理页。

use std::ops::Range;
use tracing::trace;

/// 页表中"尚未分配"的标记
pub const HOLE: i32 = -1;

/// 页表，shape = {num_seqs, max_num_pages_per_seq}
#[derive(Clone, Copy, Debug)]
pub struct PageTable<'a> {
    table: &'a [i32],
    max_pages: usize,
}

impl<'a> PageTable<'a> {
    pub fn new(table: &'a [i32], max_num_pages_per_seq: usize) -> Self {
        assert!(max_num_pages_per_seq > 0);
        assert_eq!(table.len() % max_num_pages_per_seq, 0);
        Self {
            table,
            max_pages: max_num_pages_per_seq,
        }
    }

    pub const fn max_num_pages_per_seq(&self) -> usize {
        self.max_pages
    }

    pub const fn as_slice(&self) -> &'a [i32] {
        self.table
    }

    pub const fn num_seqs(&self) -> usize {
        self.table.len() / self.max_pages
    }

    /// 一个序列的整行页表
    pub fn row(&self, seq: usize) -> &'a [i32] {
        &self.table[seq * self.max_pages..][..self.max_pages]
    }

    /// 解析物理页号，空洞或越界返回 `None`
    pub fn resolve(&self, seq: usize, logical: usize) -> Option<usize> {
        resolve(self.row(seq), logical)
    }
}

fn resolve(row: &[i32], logical: usize) -> Option<usize> {
    match row.get(logical) {
        Some(&page) if page != HOLE => {
            debug_assert!(page >= 0, "invalid page id {page}");
            Some(page as usize)
        }
        _ => None,
    }
}

/// 一个 chunk 覆盖的若干页
#[derive(Clone, Debug, Default)]
pub struct PageGroup {
    chunk: Option<usize>,
    /// 第一个逻辑页
    first: usize,
    pages: Vec<Option<usize>>,
}

impl PageGroup {
    /// 逻辑页范围
    pub fn logical(&self) -> Range<usize> {
        self.first..self.first + self.pages.len()
    }

    /// 指定逻辑页的物理页号
    pub fn physical(&self, logical: usize) -> Option<usize> {
        self.pages.get(logical.checked_sub(self.first)?).copied().flatten()
    }

    /// 定位 token 所在的 (物理页, 页内偏移)
    pub fn locate(&self, token: usize, page_size: usize) -> Option<(usize, usize)> {
        self.physical(token / page_size)
            .map(|page| (page, token % page_size))
    }
}

/// 页表预取：消费一个 chunk 的页时，下一个 chunk 的页已经解析好。
///
/// 按 chunk 递增顺序消费时每次只解析一组新页；乱序消费会丢弃预取结果重新解析。
pub struct PagePrefetch<'a> {
    row: &'a [i32],
    page_size: usize,
    chunk_stride: usize,
    current: PageGroup,
    next: PageGroup,
}

impl<'a> PagePrefetch<'a> {
    pub fn new(row: &'a [i32], page_size: usize, chunk_stride: usize) -> Self {
        Self {
            row,
            page_size,
            chunk_stride,
            current: PageGroup::default(),
            next: PageGroup::default(),
        }
    }

    /// 取 chunk 对应的页组，并预取下一个 chunk
    pub fn fetch(&mut self, chunk: usize) -> &PageGroup {
        if self.next.chunk == Some(chunk) {
            std::mem::swap(&mut self.current, &mut self.next)
        } else if self.current.chunk != Some(chunk) {
            trace!(chunk, "page prefetch miss");
            self.load(chunk, false)
        }
        self.load(chunk + 1, true);
        &self.current
    }

    fn load(&mut self, chunk: usize, next: bool) {
        let Self {
            row,
            page_size,
            chunk_stride,
            ..
        } = *self;
        let group = if next {
            &mut self.next
        } else {
            &mut self.current
        };
        let start = chunk * chunk_stride;
        let first = start / page_size;
        let last = (start + chunk_stride).div_ceil(page_size);

        group.chunk = Some(chunk);
        group.first = first;
        group.pages.clear();
        group.pages.extend((first..last).map(|i| resolve(row, i)))
    }
}

//! 分页 KV cache 的布局、写入与反量化。

use crate::{
    error::{Error, Result, check_len, check_nonzero},
    page::PageTable,
};
use num_traits::{AsPrimitive, Float};
use std::{iter::zip, marker::PhantomData};

/// KV cache 布局
///
/// - k: `[num_pages, num_kv_heads, head_size / x, page_size, x]`
/// - v: `[num_pages, num_kv_heads, head_size, page_size]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KvLayout {
    pub num_kv_heads: usize,
    pub head_size: usize,
    pub page_size: usize,
    /// key 最内维的打包因子
    pub x: usize,
}

impl KvLayout {
    /// 按元素宽度选择打包因子
    pub fn new<E>(num_kv_heads: usize, head_size: usize, page_size: usize) -> Self {
        Self {
            num_kv_heads,
            head_size,
            page_size,
            x: packing::<E>(head_size),
        }
    }

    pub fn check(&self) -> Result<()> {
        let &Self {
            num_kv_heads,
            head_size,
            page_size,
            x,
        } = self;
        check_nonzero("num_kv_heads", num_kv_heads)?;
        check_nonzero("head_size", head_size)?;
        check_nonzero("page_size", page_size)?;
        check_nonzero("x", x)?;
        if head_size % x != 0 {
            return Err(Error::HeadSize {
                head_size,
                what: "key packing factor",
                factor: x,
            });
        }
        Ok(())
    }

    /// 一页的元素数（k 和 v 相同）
    pub const fn page_elements(&self) -> usize {
        self.num_kv_heads * self.head_size * self.page_size
    }

    #[inline]
    pub const fn k_offset(&self, page: usize, head: usize, d: usize, slot: usize) -> usize {
        let &Self {
            num_kv_heads,
            head_size,
            page_size,
            x,
        } = self;
        (((page * num_kv_heads + head) * (head_size / x) + d / x) * page_size + slot) * x + d % x
    }

    #[inline]
    pub const fn v_offset(&self, page: usize, head: usize, d: usize, slot: usize) -> usize {
        let &Self {
            num_kv_heads,
            head_size,
            page_size,
            ..
        } = self;
        ((page * num_kv_heads + head) * head_size + d) * page_size + slot
    }
}

/// 打包因子：一次访存 16 字节，且必须整除 head_size
pub fn packing<E>(head_size: usize) -> usize {
    let mut x = (16 / size_of::<E>()).max(1);
    while x > 1 && head_size % x != 0 {
        x /= 2
    }
    x
}

/// 只读的 KV cache
#[derive(Clone, Copy, Debug)]
pub struct KvCache<'a, E> {
    pub k: &'a [E],
    pub v: &'a [E],
    pub layout: KvLayout,
}

impl<E> KvCache<'_, E> {
    pub fn num_pages(&self) -> usize {
        self.k.len() / self.layout.page_elements()
    }

    pub fn check(&self) -> Result<()> {
        self.layout.check()?;
        let need = self.num_pages() * self.layout.page_elements();
        check_len("v cache", self.v.len(), need)
    }
}

/// 可写的 KV cache，用于把新 token 散射到页中
pub struct KvCacheMut<'a, E> {
    pub k: &'a mut [E],
    pub v: &'a mut [E],
    pub layout: KvLayout,
}

impl<E: Copy> KvCacheMut<'_, E> {
    pub fn as_ref(&self) -> KvCache<'_, E> {
        KvCache {
            k: &*self.k,
            v: &*self.v,
            layout: self.layout,
        }
    }

    /// 写入一个 token 一个 kv 头的 k/v，返回写入的物理页；目标页是空洞时返回 `None`
    pub fn write(
        &mut self,
        table: &PageTable,
        seq: usize,
        pos: usize,
        head: usize,
        k: &[E],
        v: &[E],
    ) -> Option<usize> {
        let layout = self.layout;
        debug_assert_eq!(k.len(), layout.head_size);
        debug_assert_eq!(v.len(), layout.head_size);

        let page = table.resolve(seq, pos / layout.page_size)?;
        let slot = pos % layout.page_size;
        for (d, (&k, &v)) in zip(k, v).enumerate() {
            self.k[layout.k_offset(page, head, d, slot)] = k;
            self.v[layout.v_offset(page, head, d, slot)] = v;
        }
        Some(page)
    }
}

impl KvCacheMut<'_, u8> {
    /// 量化写入，同时填写 scale/bias 表
    #[allow(clippy::too_many_arguments)]
    pub fn write_quantized(
        &mut self,
        sb: &mut ScaleBiasMut<f32>,
        table: &PageTable,
        seq: usize,
        pos: usize,
        head: usize,
        k: &[f32],
        v: &[f32],
    ) -> Option<usize> {
        let layout = self.layout;
        let chunk = sb.chunk;
        let page = table.resolve(seq, pos / layout.page_size)?;
        let slot = pos % layout.page_size;

        for (kv, src) in [k, v].into_iter().enumerate() {
            for (c, src) in src.chunks_exact(chunk).enumerate() {
                let (scale, bias) = quant_params(src);
                sb.set(page, kv, head, c, slot, scale, bias);
                for (i, &x) in src.iter().enumerate() {
                    let d = c * chunk + i;
                    let q = quantize_one(x, scale, bias);
                    match kv {
                        0 => self.k[layout.k_offset(page, head, d, slot)] = q,
                        _ => self.v[layout.v_offset(page, head, d, slot)] = q,
                    }
                }
            }
        }
        Some(page)
    }
}

/// 非对称 8 位量化：`q · scale + bias ≈ x`
pub fn quantize(src: &[f32], dst: &mut [u8]) -> (f32, f32) {
    debug_assert_eq!(src.len(), dst.len());
    let (scale, bias) = quant_params(src);
    for (q, &x) in zip(dst, src) {
        *q = quantize_one(x, scale, bias)
    }
    (scale, bias)
}

/// 一段数据的 (scale, bias)，常数段取 scale = 1
fn quant_params(src: &[f32]) -> (f32, f32) {
    let (min, max) = src
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        });
    if !(max > min) {
        return (1., if min.is_finite() { min } else { 0. });
    }
    ((max - min) / u8::MAX as f32, min)
}

#[inline]
fn quantize_one(x: f32, scale: f32, bias: f32) -> u8 {
    ((x - bias) / scale).round().clamp(0., u8::MAX as f32) as u8
}

/// KV 元素的反量化能力。
///
/// [`Plain`] 不做任何变换，单态化后不产生额外开销；
/// [`ScaleBias`] 按量化块查 `(scale, bias)`，计算 `raw · scale + bias`。
pub trait Dequant<T>: Sync {
    type Elem: Copy + Send + Sync;

    fn key(&self, raw: Self::Elem, page: usize, head: usize, d: usize, slot: usize) -> T;

    fn value(&self, raw: Self::Elem, page: usize, head: usize, d: usize, slot: usize) -> T;

    /// 启动前检查附加表与 cache 是否匹配
    fn check(&self, _layout: &KvLayout, _num_pages: usize) -> Result<()> {
        Ok(())
    }
}

/// 未量化的 cache
#[derive(Clone, Copy, Debug, Default)]
pub struct Plain;

impl<T: Copy + Send + Sync> Dequant<T> for Plain {
    type Elem = T;

    #[inline(always)]
    fn key(&self, raw: T, _: usize, _: usize, _: usize, _: usize) -> T {
        raw
    }

    #[inline(always)]
    fn value(&self, raw: T, _: usize, _: usize, _: usize, _: usize) -> T {
        raw
    }
}

/// 量化 cache 的 scale/bias 表，
/// shape = `[num_pages, 2 (k|v), num_kv_heads, 2 (scale|bias), head_size / chunk, page_size]`
#[derive(Clone, Copy, Debug)]
pub struct ScaleBias<'a, E, T> {
    table: &'a [T],
    layout: KvLayout,
    chunk: usize,
    _elem: PhantomData<E>,
}

impl<'a, E, T> ScaleBias<'a, E, T> {
    pub fn new(table: &'a [T], layout: KvLayout, chunk: usize) -> Result<Self> {
        check_chunk(&layout, chunk)?;
        Ok(Self {
            table,
            layout,
            chunk,
            _elem: PhantomData,
        })
    }
}

impl<E, T: Copy> ScaleBias<'_, E, T> {
    #[inline]
    fn pair(&self, page: usize, kv: usize, head: usize, d: usize, slot: usize) -> (T, T) {
        // 只有一个量化块时 d / chunk 恒为 0，整个头向量共用一对 (scale, bias)
        let i = table_offset(&self.layout, self.chunk, page, kv, head, 0, d / self.chunk, slot);
        let stride = table_sb_stride(&self.layout, self.chunk);
        (self.table[i], self.table[i + stride])
    }
}

impl<E, T> Dequant<T> for ScaleBias<'_, E, T>
where
    E: AsPrimitive<T> + Send + Sync,
    T: Float + Send + Sync + 'static,
{
    type Elem = E;

    #[inline]
    fn key(&self, raw: E, page: usize, head: usize, d: usize, slot: usize) -> T {
        let (scale, bias) = self.pair(page, 0, head, d, slot);
        raw.as_() * scale + bias
    }

    #[inline]
    fn value(&self, raw: E, page: usize, head: usize, d: usize, slot: usize) -> T {
        let (scale, bias) = self.pair(page, 1, head, d, slot);
        raw.as_() * scale + bias
    }

    fn check(&self, layout: &KvLayout, num_pages: usize) -> Result<()> {
        if self.layout.head_size != layout.head_size {
            return Err(Error::Mismatch {
                what: "scale/bias head_size",
                expected: layout.head_size,
                actual: self.layout.head_size,
            });
        }
        if self.layout.num_kv_heads != layout.num_kv_heads {
            return Err(Error::Mismatch {
                what: "scale/bias num_kv_heads",
                expected: layout.num_kv_heads,
                actual: self.layout.num_kv_heads,
            });
        }
        if self.layout.page_size != layout.page_size {
            return Err(Error::Mismatch {
                what: "scale/bias page_size",
                expected: layout.page_size,
                actual: self.layout.page_size,
            });
        }
        check_len(
            "scale/bias",
            self.table.len(),
            num_pages * table_page_elements(&self.layout, self.chunk),
        )
    }
}

/// 可写的 scale/bias 表
pub struct ScaleBiasMut<'a, T> {
    table: &'a mut [T],
    layout: KvLayout,
    chunk: usize,
}

impl<'a, T: Copy> ScaleBiasMut<'a, T> {
    pub fn new(table: &'a mut [T], layout: KvLayout, chunk: usize) -> Result<Self> {
        check_chunk(&layout, chunk)?;
        Ok(Self {
            table,
            layout,
            chunk,
        })
    }

    pub fn as_ref<E>(&self) -> ScaleBias<'_, E, T> {
        ScaleBias {
            table: &*self.table,
            layout: self.layout,
            chunk: self.chunk,
            _elem: PhantomData,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &mut self,
        page: usize,
        kv: usize,
        head: usize,
        c: usize,
        slot: usize,
        scale: T,
        bias: T,
    ) {
        let i = table_offset(&self.layout, self.chunk, page, kv, head, 0, c, slot);
        let stride = table_sb_stride(&self.layout, self.chunk);
        self.table[i] = scale;
        self.table[i + stride] = bias
    }
}

/// scale/bias 表一页的元素数
pub const fn table_page_elements(layout: &KvLayout, chunk: usize) -> usize {
    2 * layout.num_kv_heads * 2 * (layout.head_size / chunk) * layout.page_size
}

const fn table_sb_stride(layout: &KvLayout, chunk: usize) -> usize {
    (layout.head_size / chunk) * layout.page_size
}

#[allow(clippy::too_many_arguments)]
const fn table_offset(
    layout: &KvLayout,
    chunk: usize,
    page: usize,
    kv: usize,
    head: usize,
    sb: usize,
    c: usize,
    slot: usize,
) -> usize {
    let chunks = layout.head_size / chunk;
    ((((page * 2 + kv) * layout.num_kv_heads + head) * 2 + sb) * chunks + c) * layout.page_size
        + slot
}

fn check_chunk(layout: &KvLayout, chunk: usize) -> Result<()> {
    check_nonzero("quant chunk", chunk)?;
    if layout.head_size % chunk != 0 {
        return Err(Error::HeadSize {
            head_size: layout.head_size,
            what: "quant chunk",
            factor: chunk,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use any_tensor::digit_layout::types;

    type Tensor<T> = any_tensor::Tensor<T, 6>;

    /// 用 any-tensor 的 index 变换求元素偏移
    fn tensor_offset<const N: usize>(shape: [usize; N], index: [usize; N]) -> usize {
        let mut t = Tensor::from_dim_slice(types::F32, shape);
        for i in index {
            t = t.transform(|l| l.index(0, i))
        }
        t.offset() as usize / size_of::<f32>()
    }

    #[test]
    fn test_layout_matches_tensor() {
        const P: usize = 3;
        const H: usize = 2;
        const D: usize = 8;
        const B: usize = 5;

        let layout = KvLayout::new::<f32>(H, D, B);
        assert_eq!(layout.x, 4);
        let x = layout.x;

        for page in 0..P {
            for head in 0..H {
                for d in 0..D {
                    for slot in 0..B {
                        assert_eq!(
                            layout.k_offset(page, head, d, slot),
                            tensor_offset([P, H, D / x, B, x], [page, head, d / x, slot, d % x])
                        );
                        assert_eq!(
                            layout.v_offset(page, head, d, slot),
                            tensor_offset([P, H, D, B], [page, head, d, slot])
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_scale_bias_offset_matches_tensor() {
        const P: usize = 2;
        const H: usize = 3;
        const D: usize = 8;
        const B: usize = 4;
        const C: usize = 4;

        let layout = KvLayout::new::<u8>(H, D, B);
        let shape = [P, 2, H, 2, D / C, B];
        for page in 0..P {
            for kv in 0..2 {
                for head in 0..H {
                    for sb in 0..2 {
                        for c in 0..D / C {
                            for slot in 0..B {
                                assert_eq!(
                                    table_offset(&layout, C, page, kv, head, sb, c, slot),
                                    tensor_offset(shape, [page, kv, head, sb, c, slot])
                                )
                            }
                        }
                    }
                }
            }
        }
        assert_eq!(table_page_elements(&layout, C) * P, shape.iter().product::<usize>())
    }

    #[test]
    fn test_packing() {
        assert_eq!(packing::<f32>(64), 4);
        assert_eq!(packing::<f64>(64), 2);
        assert_eq!(packing::<u8>(64), 16);
        assert_eq!(packing::<u8>(4), 4);
        assert_eq!(packing::<f32>(6), 2);
        assert_eq!(packing::<f32>(3), 1)
    }

    #[test]
    fn test_write_through_page_table() {
        let layout = KvLayout::new::<f32>(1, 4, 2);
        let mut k = vec![0f32; 3 * layout.page_elements()];
        let mut v = k.clone();
        let table = [2, crate::page::HOLE, 0];
        let table = PageTable::new(&table, 3);

        let mut cache = KvCacheMut {
            k: &mut k,
            v: &mut v,
            layout,
        };
        assert_eq!(cache.write(&table, 0, 1, 0, &[1., 2., 3., 4.], &[5., 6., 7., 8.]), Some(2));
        assert_eq!(cache.write(&table, 0, 2, 0, &[0.; 4], &[0.; 4]), None);
        assert_eq!(cache.write(&table, 0, 5, 0, &[9.; 4], &[9.; 4]), Some(0));

        let cache = cache.as_ref();
        for d in 0..4 {
            assert_eq!(cache.k[layout.k_offset(2, 0, d, 1)], (d + 1) as f32);
            assert_eq!(cache.v[layout.v_offset(2, 0, d, 1)], (d + 5) as f32);
            assert_eq!(cache.k[layout.k_offset(0, 0, d, 1)], 9.);
        }
    }

    #[test]
    fn test_quantize_error_bound() {
        let src = (0..32)
            .map(|_| (rand::random::<f32>() - 0.5) * 4.)
            .collect::<Vec<_>>();
        let mut dst = vec![0u8; src.len()];
        let (scale, bias) = quantize(&src, &mut dst);
        for (&x, &q) in zip(&src, &dst) {
            let y = q as f32 * scale + bias;
            assert!((x - y).abs() <= scale / 2. + 1e-6, "{x} vs {y}")
        }

        // 常数块
        let (scale, bias) = quantize(&[1.5; 4], &mut dst[..4]);
        assert_eq!(dst[..4], [0; 4]);
        assert_eq!(0. * scale + bias, 1.5)
    }

    #[test]
    fn test_write_quantized_dequant() {
        const C: usize = 4;
        let layout = KvLayout::new::<u8>(2, 8, 2);
        let mut k = vec![0u8; 2 * layout.page_elements()];
        let mut v = k.clone();
        let mut sb = vec![0f32; 2 * table_page_elements(&layout, C)];
        let table = [1, 0];
        let table = PageTable::new(&table, 2);

        let key = (0..8).map(|i| i as f32 * 0.25 - 1.).collect::<Vec<_>>();
        let val = (0..8).map(|i| (i * i) as f32 / 10.).collect::<Vec<_>>();

        let mut sb_mut = ScaleBiasMut::new(&mut sb, layout, C).unwrap();
        let mut cache = KvCacheMut {
            k: &mut k,
            v: &mut v,
            layout,
        };
        assert_eq!(
            cache.write_quantized(&mut sb_mut, &table, 0, 3, 1, &key, &val),
            Some(0)
        );

        let dequant = sb_mut.as_ref::<u8>();
        let cache = cache.as_ref();
        for d in 0..8 {
            let kq = cache.k[layout.k_offset(0, 1, d, 1)];
            let vq = cache.v[layout.v_offset(0, 1, d, 1)];
            let k: f32 = dequant.key(kq, 0, 1, d, 1);
            let v: f32 = dequant.value(vq, 0, 1, d, 1);
            assert!((k - key[d]).abs() < 1e-2, "{k} vs {}", key[d]);
            assert!((v - val[d]).abs() < 1e-2, "{v} vs {}", val[d]);
        }
    }
}

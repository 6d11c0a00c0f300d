use super::{PagedAttn, PagedAttnCfg, RowOrder, Tdata};
use crate::{
    cache::Plain,
    error::{Error, Result},
    flash::FlashSlot,
};
use cuda::{CurrentCtx, Device, Ptx, memcpy_d2h};
use std::ffi::{c_float, c_int, c_uint, c_ulonglong};
use tracing::debug;

impl PagedAttnCfg {
    /// 在 CUDA 上计算分页注意力，只支持未量化的 f32 cache。
    ///
    /// `work_queue` 为真时同一行的 group 从共享计数器上逐个领取 chunk，否则静态均分。
    pub fn compute_cuda(&self, req: PagedAttn<'_, Plain>, work_queue: bool) -> Result<()> {
        let cfg = self.to_kernel_cfg()?;
        req.check(&cfg)?;
        if cfg.qg != 1 {
            return Err(Error::Unsupported("queries_per_group > 1 on cuda"));
        }
        if cfg.chunk > 1024 {
            return Err(Error::Unsupported("chunk_stride > 1024 on cuda"));
        }

        let PagedAttn {
            o,
            ms,
            q,
            q_stride,
            cache,
            quant: Plain,
            page_table,
            num_tokens,
            alibi,
            scale,
        } = req;
        let num_seqs = num_tokens.len();
        if num_seqs == 0 {
            return Ok(());
        }
        let rows = num_seqs * cfg.h;

        // 生成 cuda 环境
        if cuda::init().is_err() {
            return Err(Error::Unsupported("cuda driver"));
        }
        let device = Device::new(0);

        const CODE: &str = include_str!("kernel.cu");
        let (ptx, log) = Ptx::compile(CODE, device.compute_capability());
        let Ok(ptx) = ptx else { panic!("{log}") };

        debug!(
            rows,
            groups = cfg.groups,
            chunk = cfg.chunk,
            work_queue,
            "paged attention on cuda"
        );

        let mut bits = match ms {
            Some(ms) => ms.iter().map(FlashSlot::bits).collect::<Vec<_>>(),
            None => vec![FlashSlot::empty().bits(); rows],
        };
        device.context().apply(|ctx: &CurrentCtx| {
            let o_dev = ctx.from_host(o);
            let ms_dev = ctx.from_host(&bits);
            let q_dev = ctx.from_host(q);
            let k_dev = ctx.from_host(cache.k);
            let v_dev = ctx.from_host(cache.v);
            let table_dev = ctx.from_host(page_table.as_slice());
            let n_dev = ctx.from_host(
                &num_tokens
                    .iter()
                    .map(|&n| n as c_ulonglong)
                    .collect::<Vec<_>>(),
            );
            let alibi_dev = match alibi {
                Some(alibi) => ctx.from_host(alibi),
                None => ctx.from_host(&vec![0 as Tdata; cfg.h]),
            };
            let queue_dev = ctx.from_host(&vec![0 as c_uint; rows]);

            let module = ctx.load(&ptx);
            let kernel = module.get_kernel(c"paged_attention_f32");
            let params = cuda::params![
                o_dev.as_ptr(),
                ms_dev.as_ptr(),
                q_dev.as_ptr(),
                q_stride as c_ulonglong,
                k_dev.as_ptr(),
                v_dev.as_ptr(),
                table_dev.as_ptr(),
                page_table.max_num_pages_per_seq() as c_ulonglong,
                n_dev.as_ptr(),
                alibi_dev.as_ptr(),
                queue_dev.as_ptr(),
                scale as c_float,
                num_seqs as c_ulonglong,
                cfg.h as c_ulonglong,
                cfg.kvh as c_ulonglong,
                cfg.d as c_ulonglong,
                cfg.page_size as c_ulonglong,
                cache.layout.x as c_ulonglong,
                cfg.chunk as c_ulonglong,
                cfg.groups as c_ulonglong,
                cfg.inplace as c_int,
                cfg.single as c_int,
                (cfg.order == RowOrder::HeadMajor) as c_int,
                work_queue as c_int
            ];
            ctx.stream()
                .launch(
                    &kernel,
                    (
                        ((num_seqs * cfg.groups) as c_uint, cfg.h as c_uint), // grid size
                        cfg.chunk as c_uint,                                 // block size
                        (cfg.chunk + 2 * cfg.d) * size_of::<Tdata>(),
                    ),
                    &*params.to_ptrs(),
                )
                .synchronize();

            // 从 device 拷贝结果
            memcpy_d2h(o, &o_dev);
            memcpy_d2h(&mut bits, &ms_dev);
        });
        if let Some(ms) = ms {
            for (slot, bits) in ms.iter().zip(bits) {
                slot.set_bits(bits)
            }
        }
        Ok(())
    }
}

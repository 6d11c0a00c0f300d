mod attention;
mod cache;
mod error;
mod flash;
mod page;
mod schedule;
mod softmax;

pub use attention::{KernelCfg, PagedAttn, PagedAttnCfg, RowOrder, Tdata};
pub use cache::{
    Dequant, KvCache, KvCacheMut, KvLayout, Plain, ScaleBias, ScaleBiasMut, packing, quantize,
    table_page_elements,
};
pub use error::{Error, Result};
pub use flash::{FlashSlot, RowAcc, Stat, Weights, empty_slots};
pub use page::{HOLE, PageGroup, PagePrefetch, PageTable};
pub use schedule::{
    Schedule, StaticPartition, StaticWorker, StealingWorker, Task, WorkStealing, Worker,
};
pub use softmax::{local_softmax, online_softmax};

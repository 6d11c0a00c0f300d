use thiserror::Error;

/// 启动 kernel 前的参数校验错误
///
/// kernel 本身没有可恢复的错误通道，所有输入问题都必须在这里拦截。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("{0} must be positive")]
    Zero(&'static str),

    #[error("num_heads ({num_heads}) is not a multiple of num_kv_heads ({num_kv_heads})")]
    HeadGroup {
        num_heads: usize,
        num_kv_heads: usize,
    },

    #[error("queries_per_group ({queries}) does not divide the query group size ({group})")]
    QueriesPerGroup { queries: usize, group: usize },

    #[error("head_size ({head_size}) is not a multiple of {what} ({factor})")]
    HeadSize {
        head_size: usize,
        what: &'static str,
        factor: usize,
    },

    #[error("a row split across {0} groups requires in-place flash accumulation")]
    SplitRow(usize),

    #[error("in-place flash accumulation requires a (max, sum) side buffer")]
    MissingSideBuffer,

    #[error("{name} buffer too small: {len} < {need}")]
    BufferTooSmall {
        name: &'static str,
        len: usize,
        need: usize,
    },

    #[error("{what} mismatch: config says {expected}, buffer says {actual}")]
    Mismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("sequence {seq} holds {num_tokens} tokens but its page table covers {capacity}")]
    SeqCapacity {
        seq: usize,
        num_tokens: usize,
        capacity: usize,
    },

    #[error("unsupported by this backend: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

/// 缓冲区长度检查
pub(crate) fn check_len(name: &'static str, len: usize, need: usize) -> Result<()> {
    if len < need {
        Err(Error::BufferTooSmall { name, len, need })
    } else {
        Ok(())
    }
}

/// 非零检查
pub(crate) fn check_nonzero(name: &'static str, val: usize) -> Result<()> {
    if val == 0 { Err(Error::Zero(name)) } else { Ok(()) }
}

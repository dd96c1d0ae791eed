use crate::common::IoStats;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IoPriority {
    #[default]
    Low,
    High,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpType {
    Read,
    Write,
}

/// Token bucket consulted before every chunk handed to the underlying
/// file. The writer loops until the requested byte count has been
/// granted; a grant may be any positive amount up to `bytes`.
pub trait RateLimiter: Send + Sync {
    fn request_token(
        &self,
        bytes: usize,
        alignment: usize,
        priority: IoPriority,
        stats: &dyn IoStats,
        op: OpType,
    ) -> usize;
}

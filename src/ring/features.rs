use io_uring::Parameters;

/// Read only snapshot of the feature flags the kernel reported when the ring was set up. Nothing in
/// this crate requires any of them, a missing feature only ever means a slower path in the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Submission and completion rings share a single mmap.
    pub single_mmap: bool,
    /// The kernel never drops completion events.
    pub nodrop: bool,
    /// Data for async offload has been consumed once the kernel consumed the entry.
    pub submit_stable: bool,
    /// Offset `-1` means "current file position" for reads and writes.
    pub rw_cur_pos: bool,
    /// Requests run with the credentials of the submitting task.
    pub cur_personality: bool,
    /// Readiness is driven by internal polling rather than punting to an async worker.
    pub fast_poll: bool,
    /// Poll requests accept the full 32 bit range of epoll flags.
    pub poll_32bits: bool,
}

impl From<&Parameters> for Features {
    fn from(params: &Parameters) -> Self {
        Features {
            single_mmap: params.is_feature_single_mmap(),
            nodrop: params.is_feature_nodrop(),
            submit_stable: params.is_feature_submit_stable(),
            rw_cur_pos: params.is_feature_rw_cur_pos(),
            cur_personality: params.is_feature_cur_personality(),
            fast_poll: params.is_feature_fast_poll(),
            poll_32bits: params.is_feature_poll_32bits(),
        }
    }
}

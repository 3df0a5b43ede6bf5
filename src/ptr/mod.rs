use nix::libc;

/// The [IoVec] construct mirrors `libc::iovec` and is used to hand vectored buffers to the kernel.
/// Vectored reads and writes take a pointer to an array of these, which must stay at a stable
/// address until the kernel is done with the request, so these always live boxed inside the
/// request that owns the buffer they describe.
#[repr(C)]
pub struct IoVec {
    pub iov_base: *mut libc::c_void,
    pub iov_len: libc::size_t,
}

impl IoVec {
    /// Describe the given mutable byte region.
    pub fn new(buf: &mut [u8]) -> IoVec {
        IoVec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        }
    }

    pub fn as_ptr(&self) -> *const libc::iovec {
        self as *const _ as *const libc::iovec
    }
}

// SAFETY: The pointee is always a heap buffer owned by the same request as this iovec, so the two
// move between threads together and the pointer stays valid for as long as the iovec exists.
unsafe impl Send for IoVec {}

// C-reminiscent types.
pub type size_t = libc::size_t;
pub type pthread_t = libc::pthread_t;
pub type void = libc::c_void;

pub use libc::pthread_self;

/// Print an error on stderr, then exit with a non-zero code. Uses the C
/// stdio handle directly so the message gets out without allocating,
/// whatever state the interposed heap is in.
pub unsafe fn graceful_exit(err_msg: &str) -> ! {
    use libc_stdhandle::stderr;

    libc::fwrite(err_msg.as_ptr().cast(), 1, err_msg.len(), stderr());
    libc::fputs(c"\n".as_ptr(), stderr());
    libc::exit(1);
}

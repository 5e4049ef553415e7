// SPDX-License-Identifier: Apache-2.0
// Copyright Cloud Concentrator Authors

//! Network namespace helpers for privileged integration tests.

use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use std::future::Future;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;

/// Run an async closure on a fresh thread inside the network namespace at
/// `netns_path`, on a thread-local current-thread runtime.
///
/// # Panics
///
/// Panics if the thread, the runtime, or the namespace swap fails, or if the
/// closure itself panics. This is test plumbing; failing loudly is the job.
#[allow(clippy::expect_used)]
pub fn in_netns<Exec, Fut, Out>(netns_path: &Path, exec: Exec) -> Out
where
    Exec: (FnOnce() -> Fut) + Send + 'static,
    Fut: Future<Output = Out> + Send,
    Out: Send + 'static,
{
    let path = netns_path.to_path_buf();
    std::thread::Builder::new()
        .name(format!("netns-{}", path.display()))
        .spawn(move || {
            #[allow(unsafe_code)] // namespace swap is inherently a syscall affair
            unsafe { swap_thread_to_netns(&path) }.expect("failed to enter netns");
            tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()
                .expect("failed to build runtime")
                .block_on(exec())
        })
        .expect("failed to spawn netns thread")
        .join()
        .expect("netns thread panicked")
}

/// Move the current thread into the network namespace at `netns_path`.
///
/// Requires `CAP_SYS_ADMIN`.
///
/// # Errors
///
/// Fails if `unshare`, `open`, or `setns` fail.
///
/// # Safety
///
/// Undefined behavior if the current thread holds open network resources
/// (sockets bound in the old namespace).
#[allow(unsafe_code)]
pub unsafe fn swap_thread_to_netns(netns_path: &Path) -> Result<(), rtnetlink::Error> {
    nix::sched::unshare(CloneFlags::CLONE_NEWNET)
        .map_err(|e| rtnetlink::Error::NamespaceError(format!("unshare: {e}")))?;

    let fd = nix::fcntl::open(netns_path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|e| rtnetlink::Error::NamespaceError(format!("open {}: {e}", netns_path.display())))?;

    nix::sched::setns(
        #[allow(unsafe_code)]
        unsafe {
            BorrowedFd::borrow_raw(fd.as_raw_fd())
        },
        CloneFlags::CLONE_NEWNET,
    )
    .map_err(|e| rtnetlink::Error::NamespaceError(format!("setns: {e}")))
}

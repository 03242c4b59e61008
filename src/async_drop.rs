use std::future::Future;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Enables executing async operations within synchronous Drop implementations.
///
/// # How it works
///
/// 1. We are typically in a Drop implementation which is synchronous - it can't be async.
///    But we need to execute an async operation.
///
/// 2. `block_on` takes an async operation and runs it to completion synchronously.
///
/// 3. However, `block_on` by itself isn't safe to call from within an async context, as the
///    current thread may be needed to process some task that our blocked operation waits on.
///
/// 4. `block_in_place` tells Tokio that we are about to block this thread, moving other tasks to
///    another worker thread first.
///
/// 5. `block_in_place` requires a multithreaded tokio runtime. On any other runtime, or outside
///    of a runtime, the future is not run and `false` is returned, leaving cleanup to the caller.
///    Use `#[tokio::test(flavor = "multi_thread")]` in tokio-enabled tests.
pub(crate) fn run_future(future: impl Future<Output = ()>) -> bool {
    let Ok(handle) = Handle::try_current() else {
        return false;
    };
    if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
        return false;
    }
    tokio::task::block_in_place(|| handle.block_on(future));
    true
}

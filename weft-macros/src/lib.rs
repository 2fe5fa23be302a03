#![allow(clippy::needless_doctest_main)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Entry point attributes for weft.

mod entry;
mod parse;

/// Runs the marked function as the main task of a freshly initialized
/// runtime, and tears the runtime down once it returns.
///
/// The function must be a plain `fn`: weft tasks are stackful, so there is
/// nothing to `.await`. Function arguments are NOT allowed on `main`.
///
/// Note: this macro targets programs that do not need a complex setup. If the
/// knobs below are not enough, use `weft::runtime::Builder` directly.
///
/// # Configuration
///
/// - `worker_threads`: number of workers, the main thread included. Defaults
///   to `WEFT_NUM_THREADS_PER_LOCALE`, or the number of usable cores.
/// - `comm_tasks`: extra threads reserved for communication tasks.
/// - `stack_size`: call stack size of every task, in bytes.
///
/// # Usage
///
/// ```no_run
/// #[weft::main(worker_threads = 2)]
/// fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[weft::main]`
///
/// ```no_run
/// fn main() {
///     let runtime = weft::runtime::Builder::new()
///         .worker_threads(2)
///         .try_init()
///         .unwrap();
///
///     runtime.call_main(|| {
///         println!("Hello world");
///     });
///     runtime.teardown();
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Like [`macro@main`], for tests. Each test gets its own runtime. Unless
/// `worker_threads` says otherwise the test thread is the only worker, so
/// tasks run whenever the test body waits.
///
/// Only one runtime may be active per thread, and the test harness runs every
/// test on a thread of its own.
///
/// ```no_run
/// #[weft::test(worker_threads = 4)]
/// fn spawns() {
///     assert!(weft::runtime::query::thread_count() >= 4);
/// }
/// ```
///
/// Equivalent code not using `#[weft::test]`
///
/// ```no_run
/// #[test]
/// fn spawns() {
///     let runtime = weft::runtime::Builder::new()
///         .worker_threads(4)
///         .try_init()
///         .unwrap();
///
///     runtime.call_main(|| {
///         assert!(weft::runtime::query::thread_count() >= 4);
///     });
///     runtime.teardown();
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}

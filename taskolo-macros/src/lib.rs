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

//! Attribute macros for taskolo entry points.

mod entry;
mod parse;

/// Runs a plain function as the root task of a taskolo runtime. This macro
/// sets up a `Runtime` without requiring the user to touch `Builder`.
///
/// Note: this macro targets applications that do not need a complex setup.
/// If the provided knobs are not sufficient, use `runtime::Builder`
/// directly.
///
/// Tasks are plain functions, not futures; the annotated function must not
/// be `async`.
///
/// # Options
///
/// The per-task stack size can be configured:
///
/// ```no_run
/// #[taskolo::main(stack_size = 131072)]
/// fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// # Usage
///
/// ```no_run
/// #[taskolo::main]
/// fn main() {
///     println!("Hello world");
/// }
/// ```
///
/// Equivalent code not using `#[taskolo::main]`
///
/// ```no_run
/// fn main() {
///     taskolo::runtime::Builder::new()
///         .try_build()
///         .unwrap()
///         .block_on(|| {
///             println!("Hello world");
///         })
/// }
/// ```
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Runs a test function as the root task of a fresh taskolo runtime. Each
/// test gets its own scheduler on its own thread.
///
/// # Usage
///
/// ```no_run
/// #[taskolo::test]
/// fn my_test() {
///     assert!(true);
/// }
/// ```
///
/// Equivalent code not using `#[taskolo::test]`
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     taskolo::runtime::Builder::new()
///         .try_build()
///         .unwrap()
///         .block_on(|| {
///             assert!(true);
///         })
/// }
/// ```
///
/// The `stack_size` option is accepted like in [`macro@main`]:
///
/// ```no_run
/// #[taskolo::test(stack_size = 1048576)]
/// fn deep_recursion() {
///     assert!(true);
/// }
/// ```
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}

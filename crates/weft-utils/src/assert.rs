/// Panics in debug builds; logs an error via `tracing::error!` in release,
/// so invariant breaks never unwind a reactor thread or bus worker in
/// production.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => (if cfg!(debug_assertions) { panic!($($arg)*); } else {tracing::error!($($arg)*)})
}

pub mod hint;
pub mod num;

/// Hook `env_logger` up to the test harness, so `RUST_LOG=xlatmem=trace` shows
/// the slow paths.
#[cfg(test)]
pub(crate) fn test_logger() {
    _ = env_logger::builder().is_test(true).try_init();
}

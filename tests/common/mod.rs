//! Shared test setup: installs a `tracing_subscriber` so `debug!`/`warn!`
//! output from the reactor is visible with `--nocapture`, matching the
//! teacher pack's habit of wiring a subscriber in test harnesses rather
//! than leaving `tracing` events going nowhere.

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

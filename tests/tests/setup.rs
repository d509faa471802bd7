use std::sync::LazyLock;

use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

/// Runtime hosting the fixture servers.
///
/// Sessions own their own runtime and block on it, so tests stay synchronous
/// and only hand server startup to this one.
pub static SERVER_RT: LazyLock<Runtime> = LazyLock::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("fixture-server")
        .enable_all()
        .build()
        .expect("failed to build fixture runtime")
});

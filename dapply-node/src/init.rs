use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub(crate) fn tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
}

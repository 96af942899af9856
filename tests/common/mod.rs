#![allow(dead_code)]

use std::sync::Once;

use nodeclad::assertion::Assertion;
use nodeclad::config::Settings;
use nodeclad::entity::Entity;
use nodeclad::persist::{Handle, Persistor};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes engine logs to the test output; filter with RUST_LOG.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A persistor over in-memory SQLite, rooted in a scratch directory that
/// lives as long as the fixture.
pub struct Fixture {
    pub dir: TempDir,
    pub persistor: Persistor,
}

pub fn fixture() -> Fixture {
    fixture_with(|_| {})
}

pub fn fixture_with(adjust: impl FnOnce(&mut Settings)) -> Fixture {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings::for_test(dir.path());
    adjust(&mut settings);
    let persistor = Persistor::in_memory(settings);
    Fixture { dir, persistor }
}

/// `Shop::Person { name, age: Int[0,150] }`.
pub fn person(persistor: &Persistor) -> Handle<'_> {
    persistor
        .declare(Entity::builder("Shop::Person").attribute("age", Assertion::int().min(0).max(150)))
        .expect("declare Shop::Person")
}

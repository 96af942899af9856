mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nodeclad::NodecladError;
use nodeclad::assertion::Assertion;
use nodeclad::cache::MemoryCache;
use nodeclad::config::{ClassConfig, CredentialOverrides, Settings};
use nodeclad::driver::SqliteConnector;
use nodeclad::entity::Entity;
use nodeclad::persist::{Handle, Persistor};
use nodeclad::search::MemoryIndex;
use nodeclad::value::Value;

fn with_cache(dir: &std::path::Path, cache: Arc<MemoryCache>) -> Persistor {
    common::init_tracing();
    Persistor::builder(Settings::for_test(dir))
        .connector(Arc::new(SqliteConnector::in_memory()))
        .cache(cache)
        .search_index(Arc::new(MemoryIndex::new()))
        .build()
}

fn cached_people(persistor: &Persistor, ttl: Duration) -> Handle<'_> {
    persistor
        .declare(
            Entity::builder("Shop::Person")
                .attribute("age", Assertion::int())
                .config(ClassConfig::default().with_cache_ttl(ttl)),
        )
        .expect("declare")
}

#[test]
fn loads_are_served_from_the_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(MemoryCache::new());
    let persistor = with_cache(dir.path(), cache.clone());
    let people = cached_people(&persistor, Duration::from_secs(60));

    let mut node = people.create().with("age", 34).expect("node");
    people.save(&mut node, None).expect("save");
    assert_eq!(cache.len(), 1);

    // a change behind the engine's back stays invisible while cached
    people.write("UPDATE person SET age = 99", &[]).expect("update");
    assert_eq!(people.load(node.key().clone()).expect("load").get("age"), &Value::Int(34));

    people.remove(&node, None).expect("remove");
    assert!(cache.is_empty());
    assert!(matches!(people.load(node.key().clone()), Err(NodecladError::ObjectNotFound { .. })));
}

#[test]
fn expired_entries_fall_through_to_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(MemoryCache::new());
    let persistor = with_cache(dir.path(), cache.clone());
    let people = cached_people(&persistor, Duration::from_millis(1));

    let mut node = people.create().with("age", 34).expect("node");
    people.save(&mut node, None).expect("save");
    people.write("UPDATE person SET age = 99", &[]).expect("update");
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(people.load(node.key().clone()).expect("load").get("age"), &Value::Int(99));
}

#[test]
fn entities_without_a_ttl_are_not_cached() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = Arc::new(MemoryCache::new());
    let persistor = with_cache(dir.path(), cache.clone());
    let people = common::person(&persistor);
    let mut node = people.create().with("age", 34).expect("node");
    people.save(&mut node, None).expect("save");
    assert!(cache.is_empty());
}

fn articles(persistor: &Persistor) -> Handle<'_> {
    persistor
        .declare(
            Entity::builder("Blog::Article")
                .attribute("title", Assertion::str().indexed())
                .attribute("body", Assertion::str().indexed())
                .attribute("views", Assertion::int().default(0)),
        )
        .expect("declare")
}

fn publish(articles: &Handle<'_>, id: &str, title: &str, body: &str) {
    let mut node = articles
        .create()
        .with("id", id)
        .and_then(|n| n.with("title", title))
        .and_then(|n| n.with("body", body))
        .expect("node");
    articles.save(&mut node, None).expect("save");
}

#[test]
fn indexed_attributes_are_searchable() {
    let fx = common::fixture();
    let articles = articles(&fx.persistor);
    publish(&articles, "a1", "Rust ownership", "Borrowing rules explained by example");
    publish(&articles, "a2", "Garden notes", "The red fox crossed the lawn");
    publish(&articles, "a3", "Fox terriers", "A rust coloured dog, red all over");

    assert_eq!(articles.search("rust").expect("search"), vec!["a1", "a3"]);
    assert_eq!(articles.search("title:rust").expect("search"), vec!["a1"]);
    assert_eq!(articles.search("\"red fox\"").expect("search"), vec!["a2"]);
    assert_eq!(articles.search("fox red").expect("search"), vec!["a2", "a3"]);

    let mut fields = BTreeMap::new();
    fields.insert("body".to_string(), "dog".to_string());
    assert_eq!(articles.search_fields(&fields).expect("search"), vec!["a3"]);

    articles.remove_id("a3", None).expect("remove");
    assert_eq!(articles.search("rust").expect("search"), vec!["a1"]);
}

#[test]
fn resaving_replaces_the_indexed_text() {
    let fx = common::fixture();
    let articles = articles(&fx.persistor);
    publish(&articles, "a1", "Draft", "nothing yet");
    let mut node = articles.load("a1").expect("load");
    node.set("body", "finished text").expect("set");
    articles.save(&mut node, None).expect("save");
    assert!(articles.search("nothing").expect("search").is_empty());
    assert_eq!(articles.search("finished").expect("search"), vec!["a1"]);
}

#[test]
fn searching_needs_an_index_only_when_something_is_indexed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let persistor = Persistor::builder(Settings::for_test(dir.path()))
        .connector(Arc::new(SqliteConnector::in_memory()))
        .build();
    let people = common::person(&persistor);
    assert!(people.search("anything").expect("search").is_empty());
    let articles = articles(&persistor);
    assert!(matches!(articles.search("rust"), Err(NodecladError::MethodNotApplicable { .. })));
}

#[test]
fn settings_load_from_a_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nodeclad.toml");
    std::fs::write(
        &path,
        r#"
flatfile_root = "/srv/nodeclad/data"
flatfile_master_host = "files-1"
reconnect_delay_ms = 10

[db]
host = "db.internal"
port = 5432
user = "app"

[cache]
servers = ["cache-1:11211"]
default_ttl_secs = 300
"#,
    )
    .expect("write settings");

    let settings = Settings::load(path.to_str()).expect("load");
    assert_eq!(settings.flatfile_root, std::path::PathBuf::from("/srv/nodeclad/data"));
    assert_eq!(settings.flatfile_master_host.as_deref(), Some("files-1"));
    assert_eq!(settings.reconnect_delay(), Duration::from_millis(10));
    assert_eq!(settings.cache.default_ttl_secs, Some(300));
    assert_eq!(settings.cache.servers, vec!["cache-1:11211"]);
    assert_eq!(settings.archive.dir_name, "RCS");

    let overrides = CredentialOverrides { user: Some("admin".to_string()), ..CredentialOverrides::default() };
    let credentials = settings.credentials("shop", &overrides);
    assert_eq!(credentials.host.as_deref(), Some("db.internal"));
    assert_eq!(credentials.port, Some(5432));
    assert_eq!(credentials.user.as_deref(), Some("admin"));
    assert_eq!(credentials.database, "shop");

    let missing = dir.path().join("absent.toml");
    assert!(matches!(Settings::load(missing.to_str()), Err(NodecladError::Config(_))));
}

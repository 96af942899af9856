mod common;

use nodeclad::NodecladError;
use nodeclad::assertion::Assertion;
use nodeclad::config::ClassConfig;
use nodeclad::driver::FlatfileFormat;
use nodeclad::entity::Entity;
use nodeclad::error::AssertReason;
use nodeclad::persist::{Handle, Persistor};
use nodeclad::value::Value;

fn memos(persistor: &Persistor, config: ClassConfig) -> Handle<'_> {
    persistor
        .declare(
            Entity::builder("Desk::Memo")
                .attribute("text", Assertion::str())
                .attribute("tags", Assertion::array(Assertion::str()).optional())
                .config(config),
        )
        .expect("declare Desk::Memo")
}

#[test]
fn yaml_documents_round_trip() {
    let fx = common::fixture();
    let memos = memos(&fx.persistor, ClassConfig::flatfile(FlatfileFormat::Yaml));

    let mut memo = memos
        .create()
        .with("name", "groceries")
        .and_then(|n| n.with("text", "milk"))
        .and_then(|n| n.with("tags", vec!["home"]))
        .expect("node");
    memos.save(&mut memo, None).expect("save");
    let id = memo.id().expect("id");

    let path = fx.dir.path().join("data").join("desk").join("memo").join(format!("{id}.yaml"));
    let text = std::fs::read_to_string(&path).expect("document on disk");
    assert!(text.contains("text: milk"));

    assert_eq!(memos.load(id.as_str()).expect("load"), memo);
    assert_eq!(memos.load_by_name("groceries").expect("load by name"), memo);
    assert!(memos.load_yaml(id.as_str()).expect("yaml").contains("name: groceries"));
    assert_eq!(memos.all_ids().expect("ids"), vec![Value::from(id.as_str())]);
    assert_eq!(memos.count().expect("count"), 1);
}

#[test]
fn json_documents_are_plain_json() {
    let fx = common::fixture();
    let memos = memos(&fx.persistor, ClassConfig::flatfile(FlatfileFormat::Json));
    let mut memo = memos.create().with("text", "hello").expect("node");
    memos.save(&mut memo, None).expect("save");

    let path = fx
        .dir
        .path()
        .join("data")
        .join("desk")
        .join("memo")
        .join(format!("{}.json", memo.id().expect("id")));
    let document: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).expect("read")).expect("parse");
    assert_eq!(document["text"], "hello");
    assert!(document["tags"].is_null());
    assert_eq!(memos.load(memo.key().clone()).expect("load").get("tags"), &Value::Null);
}

#[test]
fn sql_only_methods_are_not_applicable() {
    let fx = common::fixture();
    let memos = memos(&fx.persistor, ClassConfig::flatfile(FlatfileFormat::Yaml));
    assert!(matches!(memos.all_names(), Err(NodecladError::MethodNotApplicable { .. })));
    assert!(matches!(memos.stream(), Err(NodecladError::MethodNotApplicable { .. })));
    assert!(matches!(memos.schema_ddl(), Err(NodecladError::MethodNotApplicable { .. })));
    assert!(matches!(memos.select_scalar("SELECT 1", &[]), Err(NodecladError::MethodNotApplicable { .. })));
}

#[test]
fn names_are_unique_across_documents() {
    let fx = common::fixture();
    let memos = memos(&fx.persistor, ClassConfig::flatfile(FlatfileFormat::Yaml));
    let mut first = memos.create().with("name", "todo").and_then(|n| n.with("text", "a")).expect("node");
    let mut second = memos.create().with("name", "todo").and_then(|n| n.with("text", "b")).expect("node");
    memos.save(&mut first, None).expect("save first");
    let err = memos.save(&mut second, None).unwrap_err();
    assert!(matches!(err.assert_failed().map(|f| &f.reason), Some(AssertReason::NotUnique { .. })));
    assert_eq!(memos.count().expect("count"), 1);
}

#[test]
fn only_the_master_host_writes() {
    let fx = common::fixture_with(|settings| settings.flatfile_master_host = Some("master-1".to_string()));
    let memos = memos(&fx.persistor, ClassConfig::flatfile(FlatfileFormat::Yaml));
    let mut memo = memos.create().with("id", "m-1").and_then(|n| n.with("text", "x")).expect("node");

    match memos.save(&mut memo, None) {
        Err(NodecladError::WrongHost { expected, actual }) => {
            assert_eq!(expected, "master-1");
            assert_eq!(actual, "localhost");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!fx.dir.path().join("data").join("desk").join("memo").join("m-1.yaml").exists());
    assert!(matches!(memos.remove_id("m-1", None), Err(NodecladError::WrongHost { .. })));

    let local = fx
        .persistor
        .declare(
            Entity::builder("Desk::Local")
                .attribute("text", Assertion::str())
                .config(ClassConfig::flatfile(FlatfileFormat::Yaml).with_master_host("localhost")),
        )
        .expect("declare");
    let mut node = local.create().with("text", "ok").expect("node");
    local.save(&mut node, None).expect("the entity names this host");
}

#[test]
fn archived_revisions_can_be_restored() {
    let fx = common::fixture();
    let memos = memos(&fx.persistor, ClassConfig::flatfile(FlatfileFormat::Yaml).with_archive());

    let mut memo = memos.create().with("id", "m-7").and_then(|n| n.with("text", "one")).expect("node");
    memos.save(&mut memo, Some("first draft")).expect("save 1");
    memo.set("text", "two").expect("set");
    memos.save(&mut memo, Some("second draft")).expect("save 2");

    assert_eq!(memos.revisions("m-7").expect("revisions"), vec![1, 2]);
    assert_eq!(memos.head("m-7").expect("head"), Some(2));
    let log = memos.log("m-7").expect("log");
    assert_eq!(log[0].comment, "first draft");
    assert_eq!(log[1].host, "localhost");

    let reverted = memos.revert(&memo, Some(1)).expect("revert");
    assert_eq!(reverted.get("text"), &Value::from("one"));
    // reverting does not save
    assert_eq!(memos.load("m-7").expect("load").get("text"), &Value::from("two"));

    memos.remove(&memo, Some("done")).expect("remove");
    assert!(matches!(memos.load("m-7"), Err(NodecladError::ObjectNotFound { .. })));
    assert_eq!(memos.restore("m-7", None).expect("restore").get("text"), &Value::from("two"));
    assert!(matches!(memos.restore("m-7", Some(9)), Err(NodecladError::ObjectNotFound { .. })));
}

#[test]
fn archive_methods_need_an_archived_entity() {
    let fx = common::fixture();
    let memos = memos(&fx.persistor, ClassConfig::flatfile(FlatfileFormat::Yaml));
    assert!(matches!(memos.revisions("m-1"), Err(NodecladError::MethodNotApplicable { .. })));
    let people = common::person(&fx.persistor);
    assert!(matches!(people.head("p-1"), Err(NodecladError::MethodNotApplicable { .. })));
}

#[test]
fn sql_rows_can_keep_a_document_copy() {
    let fx = common::fixture();
    let memos = memos(&fx.persistor, ClassConfig::default().with_flatfile(FlatfileFormat::Json));
    let mut memo = memos.create().with("id", "m-2").and_then(|n| n.with("text", "both")).expect("node");
    memos.save(&mut memo, None).expect("save");

    let path = fx.dir.path().join("data").join("desk").join("memo").join("m-2.json");
    assert!(path.is_file());
    assert_eq!(memos.select_scalar("SELECT text FROM memo", &[]).expect("row"), Value::from("both"));

    memos.remove(&memo, None).expect("remove");
    assert!(!path.exists());
    assert_eq!(memos.count().expect("count"), 0);
}

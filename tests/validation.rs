use nodeclad::NodecladError;
use nodeclad::assertion::Assertion;
use nodeclad::entity::{Entity, Registry};
use nodeclad::error::AssertReason;
use nodeclad::node::Node;
use nodeclad::value::Value;

fn reason(result: nodeclad::Result<()>) -> AssertReason {
    match result {
        Err(NodecladError::ValidationFailed(failure)) => failure.reason,
        other => panic!("expected a validation failure, got {other:?}"),
    }
}

#[test]
fn integer_range_is_inclusive() {
    let count = Assertion::int().min(0).max(4_294_967_296i64).build().expect("assertion");
    assert!(count.validate("count", &Value::Int(0)).is_ok());
    assert!(count.validate("count", &Value::Int(4_294_967_296)).is_ok());
    assert!(matches!(reason(count.validate("count", &Value::Int(-1))), AssertReason::OutOfRange { .. }));
    assert!(matches!(
        reason(count.validate("count", &Value::Int(4_294_967_297))),
        AssertReason::OutOfRange { .. }
    ));
}

#[test]
fn negative_integers_are_not_ints() {
    let plain = Assertion::int().build().expect("assertion");
    assert!(matches!(reason(plain.validate("n", &Value::Int(-5))), AssertReason::InvalidType { .. }));
    assert!(matches!(reason(plain.validate("n", &Value::Float(1.5))), AssertReason::InvalidType { .. }));
}

#[test]
fn optional_accepts_null_and_required_does_not() {
    let optional = Assertion::str().optional().build().expect("assertion");
    let required = Assertion::str().build().expect("assertion");
    assert!(optional.validate("nick", &Value::Null).is_ok());
    assert_eq!(reason(required.validate("nick", &Value::Null)), AssertReason::MissingRequiredValue);
}

#[test]
fn sizes_and_patterns() {
    let code = Assertion::str().size(3).regex("^[A-Z]+$").build().expect("assertion");
    assert!(code.validate("code", &Value::from("SEK")).is_ok());
    assert!(matches!(reason(code.validate("code", &Value::from("SE"))), AssertReason::SizeMismatch { .. }));
    assert!(matches!(reason(code.validate("code", &Value::from("sek"))), AssertReason::PatternMismatch { .. }));

    let tags = Assertion::array(Assertion::str()).max_size(2).build().expect("assertion");
    assert!(tags.validate("tags", &Value::from(vec!["a", "b"])).is_ok());
    assert!(matches!(
        reason(tags.validate("tags", &Value::from(vec!["a", "b", "c"]))),
        AssertReason::SizeMismatch { .. }
    ));
}

#[test]
fn allow_lists_and_predicates() {
    let color = Assertion::str().allowed(vec!["red", "green"]).build().expect("assertion");
    assert!(color.validate("color", &Value::from("red")).is_ok());
    assert!(matches!(reason(color.validate("color", &Value::from("blue"))), AssertReason::NotAllowed { .. }));

    let even = Assertion::int()
        .allowed_by(|v| match v.as_i64() {
            Some(n) if n % 2 == 0 => Ok(()),
            _ => Err("must be even".to_string()),
        })
        .build()
        .expect("assertion");
    assert!(even.validate("n", &Value::Int(4)).is_ok());
    assert!(matches!(reason(even.validate("n", &Value::Int(3))), AssertReason::NotAllowed { .. }));
}

#[test]
fn store_backed_allow_lists_need_a_store() {
    let currency = Assertion::str().allowed_query("SELECT code FROM currency").build().expect("assertion");
    let err = currency.validate("currency", &Value::from("SEK")).unwrap_err();
    assert!(matches!(err, NodecladError::MethodNotApplicable { .. }));
    assert!(err.assert_failed().is_none());
}

#[test]
fn bad_members_are_reported_by_slot() {
    let scores = Assertion::array(Assertion::int().max(10)).build().expect("assertion");
    let value = Value::List(vec![Value::Int(1), Value::Int(11), Value::Int(2), Value::Int(12)]);
    match reason(scores.validate("scores", &value)) {
        AssertReason::Members(failures) => {
            let slots: Vec<&str> = failures.iter().map(|(slot, _)| slot.as_str()).collect();
            assert_eq!(slots, vec!["1", "3"]);
            assert_eq!(failures[0].1.attribute, "scores[1]");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn bool_accepts_zero_and_one_only() {
    let flag = Assertion::bool().build().expect("assertion");
    assert!(flag.validate("flag", &Value::Int(1)).is_ok());
    assert!(flag.validate("flag", &Value::Bool(false)).is_ok());
    assert!(flag.validate("flag", &Value::Int(2)).is_err());
}

#[test]
fn declarations_are_checked() {
    assert!(matches!(Assertion::str().serial().build(), Err(NodecladError::Declaration(_))));
    assert!(matches!(Assertion::array(Assertion::str()).unique().build(), Err(NodecladError::Declaration(_))));
    assert!(matches!(Assertion::int().member(Assertion::str()).build(), Err(NodecladError::Declaration(_))));
    assert!(matches!(Assertion::int().default("many").build(), Err(NodecladError::Declaration(_))));
    assert!(matches!(Assertion::int().rule("between", 3).build(), Err(NodecladError::Declaration(_))));

    let registry = Registry::new();
    let err = registry
        .declare(Entity::builder("Shop::Order").attribute("buyer", Assertion::ext_id("Shop::Customer")))
        .unwrap_err();
    assert!(matches!(err, NodecladError::Declaration(_)));
    let err = registry.declare(Entity::builder("shop-order")).unwrap_err();
    assert!(matches!(err, NodecladError::Declaration(_)));
}

#[test]
fn inherited_attributes_can_be_overridden() {
    let registry = Registry::new();
    let base = registry
        .declare(
            Entity::builder("Shop::Party")
                .attribute("email", Assertion::str().optional())
                .attribute("rating", Assertion::int().max(5).optional()),
        )
        .expect("declare base");
    let vip = registry
        .declare(
            Entity::builder("Shop::Vip")
                .extends(&base)
                .attribute("rating", Assertion::int().min(3).max(5))
                .attribute("since", Assertion::datetime().optional()),
        )
        .expect("declare vip");
    let names: Vec<&str> = vip.attributes().iter().map(|a| a.name()).collect();
    assert_eq!(names, vec!["id", "name", "ctime", "mtime", "email", "rating", "since"]);
    assert!(!vip.attribute("rating").expect("rating").is_optional());

    let node = Node::new(&vip)
        .with("id", "v-1")
        .and_then(|n| n.with("ctime", nodeclad::datatype::now()))
        .and_then(|n| n.with("mtime", nodeclad::datatype::now()))
        .and_then(|n| n.with("rating", 2))
        .expect("node");
    let failure = node.validate().unwrap_err();
    assert_eq!(failure.assert_failed().expect("assert failure").attribute, "rating");
}

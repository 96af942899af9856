mod common;

use nodeclad::persist::Handle;
use nodeclad::stream::Flow;
use nodeclad::value::Value;

fn populate(people: &Handle<'_>, count: i64) {
    people
        .transaction(|h| {
            for i in 0..count {
                let mut node = h
                    .create()
                    .with("name", format!("p{i:03}"))
                    .and_then(|n| n.with("age", i))?;
                h.save(&mut node, None)?;
            }
            Ok(())
        })
        .expect("populate");
}

#[test]
fn windows_are_fetched_lazily() {
    let fx = common::fixture();
    let people = common::person(&fx.persistor);
    populate(&people, 120);

    let mut stream = people.stream().expect("stream").limit(50);
    assert_eq!(stream.total().expect("total"), 120);
    assert_eq!(stream.fetches(), 0);
    let mut sizes = Vec::new();
    while let Some(rows) = stream.next_batch().expect("batch") {
        sizes.push(rows.len());
    }
    assert_eq!(sizes, vec![50, 50, 20]);
    assert_eq!(stream.fetches(), 3);
    assert!(stream.next_batch().expect("after the end").is_none());
}

#[test]
fn rows_come_ordered_by_name() {
    let fx = common::fixture();
    let people = common::person(&fx.persistor);
    populate(&people, 60);

    let names = people
        .stream()
        .expect("stream")
        .limit(7)
        .map(|row| row.map(|row| row[1].to_string()))
        .collect::<nodeclad::Result<Vec<_>>>()
        .expect("rows");
    let expected: Vec<String> = (0..60).map(|i| format!("p{i:03}")).collect();
    assert_eq!(names, expected);
}

#[test]
fn visitors_can_stop_early() {
    let fx = common::fixture();
    let people = common::person(&fx.persistor);
    populate(&people, 20);

    let mut seen = 0;
    let keys = people
        .stream()
        .expect("stream")
        .limit(5)
        .each(|key| {
            seen += 1;
            if seen == 3 { Flow::Stop(vec![key.clone()]) } else { Flow::emit(key.clone()) }
        })
        .expect("each");
    assert_eq!(keys.len(), 3);
    assert_eq!(seen, 3);
}

#[test]
fn custom_queries_keep_their_parameters() {
    let fx = common::fixture();
    let people = common::person(&fx.persistor);
    populate(&people, 120);

    let rows = people
        .stream()
        .expect("stream")
        .query("SELECT name, age FROM person WHERE age >= ? ORDER BY age", vec![Value::Int(100)])
        .limit(8)
        .each_tuple(|row| match row[1].as_i64() {
            Some(age) if age % 2 == 0 => Flow::emit(row[0].to_string()),
            _ => Flow::Skip,
        })
        .expect("each");
    assert_eq!(rows.len(), 10);
    assert_eq!(rows.first().map(String::as_str), Some("p100"));
    assert_eq!(rows.last().map(String::as_str), Some("p118"));
}

#[test]
fn empty_tables_fetch_nothing() {
    let fx = common::fixture();
    let people = common::person(&fx.persistor);
    let mut stream = people.stream().expect("stream");
    assert_eq!(stream.total().expect("total"), 0);
    assert!(stream.next_batch().expect("batch").is_none());
    assert_eq!(stream.fetches(), 0);
}

//! End-to-end persistence through a data source backed by the recording
//! mock connection.

use std::future::Future;

use asupersync::runtime::RuntimeBuilder;
use persisto::metadata::ValueTransformer;
use persisto::prelude::*;
use persisto::{ConfigErrorKind, QueryResult, Row};
use persisto_core::testing::{MockConnection, MockProvider};

fn block_on<F: Future>(future: F) -> F::Output {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
        .block_on(future)
}

fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

fn data_source(entities: MetadataArgs) -> (DataSource<MockProvider>, MockConnection) {
    let conn = MockConnection::new(Driver::postgres());
    let mut source = DataSource::new(
        DataSourceOptions::new(DriverKind::Postgres).entities(entities),
        MockProvider::new(conn.clone()),
    );
    source.initialize().expect("initialize data source");
    (source, conn)
}

fn blog(posts_cascade: Cascade) -> MetadataArgs {
    MetadataArgs::new()
        .entity(
            EntitySchema::new("User")
                .column(ColumnOptions::primary_generated("id"))
                .column(ColumnOptions::new("name", ColumnType::Text))
                .relation(RelationOptions::one_to_many("posts", "Post", "author").cascade(posts_cascade)),
        )
        .entity(
            EntitySchema::new("Post")
                .column(ColumnOptions::primary_generated("id"))
                .column(ColumnOptions::new("title", ColumnType::Text))
                .column(ColumnOptions::version("version"))
                .relation(
                    RelationOptions::many_to_one("author", "User")
                        .inverse_side("posts")
                        .not_null()
                        .cascade(Cascade::SAVE),
                ),
        )
}

fn user_row(id: i64, name: &str) -> Row {
    Row::new(
        vec!["user_id".to_string(), "user_name".to_string()],
        vec![Value::BigInt(id), Value::Text(name.to_string())],
    )
}

fn post_row(id: i64, title: &str, version: i32, author: i64) -> Row {
    Row::new(
        vec![
            "post_id".to_string(),
            "post_title".to_string(),
            "post_version".to_string(),
            "post_author_id".to_string(),
        ],
        vec![
            Value::BigInt(id),
            Value::Text(title.to_string()),
            Value::Int(version),
            Value::BigInt(author),
        ],
    )
}

#[test]
fn test_referenced_row_is_inserted_first() {
    let (source, conn) = data_source(blog(Cascade::NONE));
    let cx = Cx::for_testing();
    let mut graph = EntityGraph::new();
    let user = graph.insert(EntityRecord::new("User").with("name", "ada"));
    let post = graph.insert(EntityRecord::new("Post").with("title", "hello"));
    graph.link(post, "author", user);

    let manager = source.manager().unwrap();
    let summary = block_on(async {
        unwrap_outcome(manager.save(&cx, &mut graph, &[post, user], SaveOptions::default()).await)
    });
    assert_eq!(summary.inserted, 2);

    let inserts = conn.statements_starting_with("INSERT");
    assert_eq!(inserts.len(), 2);
    assert!(inserts[0].0.starts_with("INSERT INTO \"user\""), "{}", inserts[0].0);
    assert!(inserts[1].0.starts_with("INSERT INTO \"post\""), "{}", inserts[1].0);
    assert!(inserts[1].1.contains(&Value::BigInt(1)));

    let sql = conn.executed_sql();
    assert_eq!(sql.first().map(String::as_str), Some("START TRANSACTION"));
    assert_eq!(sql.last().map(String::as_str), Some("COMMIT"));
}

#[test]
fn test_second_save_of_unchanged_graph_writes_nothing() {
    let (source, conn) = data_source(blog(Cascade::NONE));
    let cx = Cx::for_testing();
    let mut graph = EntityGraph::new();
    let user = graph.insert(EntityRecord::new("User").with("name", "ada"));
    let post = graph.insert(EntityRecord::new("Post").with("title", "hello"));
    graph.link(post, "author", user);

    let manager = source.manager().unwrap();
    block_on(async { unwrap_outcome(manager.save(&cx, &mut graph, &[post], SaveOptions::default()).await) });
    assert_eq!(graph[user].get("id"), Some(&Value::BigInt(1)));
    assert_eq!(graph[post].get("id"), Some(&Value::BigInt(2)));
    assert_eq!(graph[post].get("version"), Some(&Value::Int(1)));

    conn.clear_log();
    conn.on("FROM \"user\"", QueryResult::with_rows(vec![user_row(1, "ada")]));
    conn.on("FROM \"post\"", QueryResult::with_rows(vec![post_row(2, "hello", 1, 1)]));
    let summary = block_on(async {
        unwrap_outcome(manager.save(&cx, &mut graph, &[post], SaveOptions::default()).await)
    });

    assert!(summary.is_empty());
    assert!(conn.statements_starting_with("UPDATE").is_empty());
    assert!(conn.statements_starting_with("INSERT").is_empty());
    assert!(conn.statements_starting_with("START TRANSACTION").is_empty());
}

#[test]
fn test_nullable_cycle_is_patched_after_insert() {
    let (source, conn) = data_source(
        MetadataArgs::new()
            .entity(
                EntitySchema::new("Husband")
                    .column(ColumnOptions::primary_generated("id"))
                    .relation(RelationOptions::one_to_one("wife", "Wife")),
            )
            .entity(
                EntitySchema::new("Wife")
                    .column(ColumnOptions::primary_generated("id"))
                    .relation(RelationOptions::many_to_one("husband", "Husband")),
            ),
    );
    let cx = Cx::for_testing();
    let mut graph = EntityGraph::new();
    let husband = graph.insert(EntityRecord::new("Husband"));
    let wife = graph.insert(EntityRecord::new("Wife"));
    graph.link(husband, "wife", wife);
    graph.link(wife, "husband", husband);

    let manager = source.manager().unwrap();
    let summary = block_on(async {
        unwrap_outcome(manager.save(&cx, &mut graph, &[husband, wife], SaveOptions::default()).await)
    });
    assert_eq!(summary.inserted, 2);

    let inserts = conn.statements_starting_with("INSERT");
    let updates = conn.statements_starting_with("UPDATE");
    assert_eq!(inserts.len(), 2);
    assert_eq!(updates.len(), 1);
    let first_table = inserts[0].0.split('"').nth(1).unwrap();
    assert!(updates[0].0.starts_with(&format!("UPDATE \"{first_table}\" SET")), "{}", updates[0].0);
    assert!(inserts[0].1.contains(&Value::Null));

    assert_eq!(graph[husband].get("wife_id"), graph[wife].get("id"));
    assert_eq!(graph[wife].get("husband_id"), graph[husband].get("id"));
}

#[test]
fn test_required_cycle_fails_before_any_statement() {
    let (source, conn) = data_source(
        MetadataArgs::new()
            .entity(
                EntitySchema::new("Husband")
                    .column(ColumnOptions::primary_generated("id"))
                    .relation(RelationOptions::one_to_one("wife", "Wife").not_null()),
            )
            .entity(
                EntitySchema::new("Wife")
                    .column(ColumnOptions::primary_generated("id"))
                    .relation(RelationOptions::many_to_one("husband", "Husband").not_null()),
            ),
    );
    let cx = Cx::for_testing();
    let mut graph = EntityGraph::new();
    let husband = graph.insert(EntityRecord::new("Husband"));
    let wife = graph.insert(EntityRecord::new("Wife"));
    graph.link(husband, "wife", wife);
    graph.link(wife, "husband", husband);

    let manager = source.manager().unwrap();
    let outcome = block_on(async { manager.save(&cx, &mut graph, &[husband, wife], SaveOptions::default()).await });
    match outcome {
        Outcome::Err(e) => assert_eq!(e.config_kind(), Some(ConfigErrorKind::CycleDetected), "{e}"),
        other => std::panic::panic_any(format!("expected a cycle error, got {other:?}")),
    }
    assert!(conn.statements_starting_with("INSERT").is_empty());
}

#[test]
fn test_stale_version_rolls_back() {
    let (source, conn) = data_source(blog(Cascade::NONE));
    conn.on("FROM \"post\"", QueryResult::with_rows(vec![post_row(1, "old", 4, 7)]));
    conn.on("FROM \"user\"", QueryResult::with_rows(vec![user_row(7, "ada")]));
    conn.on("UPDATE \"post\"", QueryResult::with_affected(0));
    let cx = Cx::for_testing();
    let mut graph = EntityGraph::new();
    let user = graph.insert(EntityRecord::new("User").with("id", 7_i64).with("name", "ada"));
    let post = graph.insert(
        EntityRecord::new("Post")
            .with("id", 1_i64)
            .with("title", "new")
            .with("version", Value::Int(3)),
    );
    graph.link(post, "author", user);

    let manager = source.manager().unwrap();
    let outcome = block_on(async { manager.save(&cx, &mut graph, &[post], SaveOptions::default()).await });
    match outcome {
        Outcome::Err(e) => assert!(e.is_version_mismatch(), "{e}"),
        other => std::panic::panic_any(format!("expected optimistic lock error, got {other:?}")),
    }
    assert_eq!(graph[post].get("version"), Some(&Value::Int(3)));
    assert_eq!(conn.executed_sql().last().map(String::as_str), Some("ROLLBACK"));
    assert!(conn.statements_starting_with("COMMIT").is_empty());
}

fn remove_user_with_posts(posts_cascade: Cascade) -> MockConnection {
    let (source, conn) = data_source(blog(posts_cascade));
    conn.on("FROM \"user\"", QueryResult::with_rows(vec![user_row(1, "ada")]));
    conn.on(
        "FROM \"post\"",
        QueryResult::with_rows(vec![post_row(10, "a", 1, 1), post_row(11, "b", 1, 1)]),
    );
    let cx = Cx::for_testing();
    let mut graph = EntityGraph::new();
    let user = graph.insert(EntityRecord::new("User").with("id", 1_i64).with("name", "ada"));
    for id in [10_i64, 11] {
        let post = graph.insert(EntityRecord::new("Post").with("id", id).with("version", Value::Int(1)));
        graph.push_related(user, "posts", post);
        graph.link(post, "author", user);
    }

    let manager = source.manager().unwrap();
    block_on(async { unwrap_outcome(manager.remove(&cx, &mut graph, &[user], RemoveOptions::default()).await) });
    assert_eq!(graph[user].get("id"), None);
    conn
}

#[test]
fn test_cascade_remove_deletes_children_first() {
    let conn = remove_user_with_posts(Cascade::NONE.with_remove());
    let deletes = conn.statements_starting_with("DELETE");
    assert_eq!(deletes.len(), 3);
    assert!(deletes[0].0.starts_with("DELETE FROM \"post\""), "{}", deletes[0].0);
    assert!(deletes[1].0.starts_with("DELETE FROM \"post\""), "{}", deletes[1].0);
    assert!(deletes[2].0.starts_with("DELETE FROM \"user\""), "{}", deletes[2].0);
}

#[test]
fn test_remove_without_cascade_leaves_children() {
    let conn = remove_user_with_posts(Cascade::NONE);
    let deletes = conn.statements_starting_with("DELETE");
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].0.starts_with("DELETE FROM \"user\""), "{}", deletes[0].0);
    assert!(conn.executed_sql().iter().all(|sql| !sql.contains("FROM \"post\"")));
}

/// Stores text reversed.
struct Reversed;

impl ValueTransformer for Reversed {
    fn to_database(&self, value: &Value) -> Value {
        match value {
            Value::Text(text) => Value::Text(text.chars().rev().collect()),
            other => other.clone(),
        }
    }

    fn from_database(&self, value: &Value) -> Value {
        self.to_database(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Account {
    id: Option<i64>,
    email: String,
}

impl Entity for Account {
    const ENTITY: &'static str = "Account";

    fn to_graph(&self, graph: &mut EntityGraph) -> EntityRef {
        let mut record = EntityRecord::new("Account").with("email", self.email.clone());
        if let Some(id) = self.id {
            record.set("id", id);
        }
        graph.insert(record)
    }

    fn from_graph(graph: &EntityGraph, entity: EntityRef) -> Result<Self> {
        let record = &graph[entity];
        let Some(Value::Text(email)) = record.get("email") else {
            return Err(Error::Hydration("Account.email is missing".into()));
        };
        Ok(Self {
            id: record.get("id").and_then(Value::as_i64),
            email: email.clone(),
        })
    }
}

#[test]
fn test_transformer_round_trips_through_the_database() {
    let (mut source, conn) = data_source(
        MetadataArgs::new().entity(
            EntitySchema::new("Account")
                .column(ColumnOptions::primary_generated("id"))
                .column(ColumnOptions::new("email", ColumnType::Text).transformer(Reversed)),
        ),
    );
    let cx = Cx::for_testing();
    let repository = source.repository::<Account>().unwrap().clone();
    let mut account = Account {
        id: None,
        email: "grace".into(),
    };

    block_on(async { unwrap_outcome(repository.save(&cx, &mut account, SaveOptions::default()).await) });
    assert_eq!(account.id, Some(1));
    let inserts = conn.statements_starting_with("INSERT INTO \"account\"");
    assert_eq!(inserts.len(), 1);
    assert!(inserts[0].1.contains(&Value::Text("ecarg".into())));
    assert!(!inserts[0].1.contains(&Value::Text("grace".into())));

    conn.clear_log();
    conn.on(
        "FROM \"account\"",
        QueryResult::with_rows(vec![Row::new(
            vec!["account_id".to_string(), "account_email".to_string()],
            vec![Value::BigInt(1), Value::Text("ecarg".into())],
        )]),
    );
    let found = block_on(async { unwrap_outcome(repository.find(&cx, |query| query).await) });
    assert_eq!(found, vec![account.clone()]);

    block_on(async { unwrap_outcome(repository.save(&cx, &mut account, SaveOptions::default()).await) });
    assert!(conn.statements_starting_with("UPDATE").is_empty());
}

use bson::{bson, doc, Bson};

use mongocore::error::Error;
use mongocore::operation::find_and_modify::{FindAndRemove, FindAndReplace, FindAndUpdate};
use mongocore::operation::Namespace;
use mongocore::options::ClientOptions;
use mongocore::{connstring, Client};

use crate::mock::{MockServer, MockState};

fn namespace() -> Namespace {
    Namespace::new("test", "things")
}

#[test]
fn replace_rejects_update_operators() {
    let op = FindAndReplace::new(namespace(), doc! { "$set": { "a": 1 } })
        .filter(doc! { "a": 1 });

    match op.build() {
        Err(Error::ArgumentError(msg)) => {
            assert!(msg.contains("$set"), "message should name the bad key: {}", msg)
        }
        other => panic!("expected ArgumentError, got {:?}", other),
    }
}

#[test]
fn replace_accepts_plain_documents() {
    let command = FindAndReplace::new(namespace(), doc! { "a": 2, "nested": { "$ok": 1 } })
        .filter(doc! { "a": 1 })
        .build()
        .unwrap();

    // Only top-level keys are validated; the first key names the command.
    assert_eq!(
        Some(&Bson::String("things".to_owned())),
        command.get("findandmodify")
    );
    assert!(command.get("update").is_some());
}

#[test]
fn remove_rejects_upsert() {
    let op = FindAndRemove::new(namespace()).filter(doc! { "a": 1 }).upsert(true);

    match op.build() {
        Err(Error::ArgumentError(msg)) => assert!(msg.contains("upsert"), "{}", msg),
        other => panic!("expected ArgumentError, got {:?}", other),
    }
}

#[test]
fn remove_builds_a_remove_command() {
    let command = FindAndRemove::new(namespace())
        .filter(doc! { "a": 1 })
        .sort(doc! { "a": 1 })
        .build()
        .unwrap();

    assert_eq!(Some(&Bson::Boolean(true)), command.get("remove"));
    assert!(command.get("update").is_none());
    assert!(command.get("upsert").is_none());
}

#[test]
fn update_requires_update_operators() {
    let op = FindAndUpdate::new(namespace(), doc! { "a": 2 });
    assert!(op.build().is_err());

    let command = FindAndUpdate::new(namespace(), doc! { "$inc": { "a": 1 } })
        .filter(doc! { "a": 1 })
        .return_new(true)
        .upsert(true)
        .build()
        .unwrap();

    assert_eq!(Some(&Bson::Boolean(true)), command.get("new"));
    assert_eq!(Some(&Bson::Boolean(true)), command.get("upsert"));
}

#[test]
fn executes_as_a_command_and_unwraps_value() {
    let mut state = MockState::default();
    state.command_responses.insert(
        "findandmodify".to_owned(),
        doc! { "ok": 1.0, "value": { "a": 1 } },
    );
    let server = MockServer::start(state);

    let config = connstring::parse(&server.uri()).unwrap();
    let client = Client::with_config(&config, ClientOptions::default(), None, None).unwrap();

    let session = client.write_session().unwrap();
    let result = FindAndUpdate::new(namespace(), doc! { "$set": { "a": 1 } })
        .filter(doc! { "a": 0 })
        .execute(&session)
        .unwrap();

    assert_eq!(Some(doc! { "a": 1 }), result);

    client.close();
}

#[test]
fn missing_value_maps_to_none() {
    let mut state = MockState::default();
    state.command_responses.insert(
        "findandmodify".to_owned(),
        doc! { "ok": 1.0, "value": (Bson::Null) },
    );
    let server = MockServer::start(state);

    let config = connstring::parse(&server.uri()).unwrap();
    let client = Client::with_config(&config, ClientOptions::default(), None, None).unwrap();

    let session = client.write_session().unwrap();
    let result = FindAndRemove::new(namespace())
        .filter(doc! { "a": 0 })
        .execute(&session)
        .unwrap();

    assert_eq!(None, result);

    client.close();
}

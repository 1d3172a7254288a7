use bson::{bson, doc};

use mongocore::connstring;
use mongocore::error::Error;
use mongocore::operation::{drop_collection, FindOp, Namespace, WriteOp};
use mongocore::options::ClientOptions;
use mongocore::Client;

use crate::mock::{MockServer, MockState};

fn client_for(server: &MockServer) -> Client {
    let config = connstring::parse(&server.uri()).unwrap();
    Client::with_config(&config, ClientOptions::default(), None, None).unwrap()
}

fn namespace() -> Namespace {
    Namespace::new("test", "things")
}

#[test]
fn acknowledged_insert_round_trips_get_last_error() {
    let server = MockServer::start(MockState::default());
    let client = client_for(&server);

    let write = WriteOp::insert(
        namespace(),
        vec![doc! { "a": 1 }, doc! { "a": 2 }],
        false,
        client.write_concern().clone(),
    );
    let outcome = write.execute(&client.write_session().unwrap()).unwrap();

    assert!(outcome.acknowledged);
    assert!(outcome.response.is_some());
    assert_eq!(2, server.state.lock().unwrap().inserted.len());

    client.close();
}

#[test]
fn unacknowledged_insert_sends_no_handshake() {
    let server = MockServer::start(MockState::default());
    let client = client_for(&server);

    let write = WriteOp::insert(
        namespace(),
        vec![doc! { "a": 1 }],
        false,
        mongocore::WriteConcern::unacknowledged(),
    );
    let outcome = write.execute(&client.write_session().unwrap()).unwrap();

    assert!(!outcome.acknowledged);
    assert!(outcome.response.is_none());

    client.close();
}

#[test]
fn duplicate_key_reported_from_get_last_error() {
    let mut state = MockState::default();
    state.gle_response = Some(doc! {
        "ok": 1.0,
        "err": "E11000 duplicate key error",
        "code": 11000,
        "n": 0,
    });
    let server = MockServer::start(state);
    let client = client_for(&server);

    let write = WriteOp::insert(
        namespace(),
        vec![doc! { "_id": 1 }],
        false,
        client.write_concern().clone(),
    );

    match write.execute(&client.write_session().unwrap()) {
        Err(Error::DuplicateKeyError { code: 11000, .. }) => (),
        other => panic!("expected DuplicateKeyError, got {:?}", other),
    }

    client.close();
}

#[test]
fn write_concern_failure_reported_from_get_last_error() {
    let mut state = MockState::default();
    state.gle_response = Some(doc! {
        "ok": 1.0,
        "err": "timeout",
        "wtimeout": true,
        "code": 64,
        "n": 0,
    });
    let server = MockServer::start(state);
    let client = client_for(&server);

    let write = WriteOp::update(
        namespace(),
        doc! { "a": 1 },
        doc! { "$set": { "a": 2 } },
        false,
        false,
        client.write_concern().clone(),
    );

    match write.execute(&client.write_session().unwrap()) {
        Err(Error::WriteConcernError { code: 64, .. }) => (),
        other => panic!("expected WriteConcernError, got {:?}", other),
    }

    client.close();
}

#[test]
fn delete_is_framed_and_acknowledged() {
    let server = MockServer::start(MockState::default());
    let client = client_for(&server);

    let write = WriteOp::delete(
        namespace(),
        doc! { "a": 1 },
        true,
        client.write_concern().clone(),
    );
    let outcome = write.execute(&client.write_session().unwrap()).unwrap();

    assert!(outcome.acknowledged);
    assert_eq!(1, server.state.lock().unwrap().deletes);

    client.close();
}

// Insert three documents, read them back with a small batch, kill the
// cursor, and observe the server no longer knows it.
#[test]
fn killed_cursor_raises_cursor_not_found() {
    let server = MockServer::start(MockState::default());
    let client = client_for(&server);

    let write = WriteOp::insert(
        namespace(),
        vec![doc! {}, doc! {}, doc! {}],
        false,
        client.write_concern().clone(),
    );
    write.execute(&client.write_session().unwrap()).unwrap();

    {
        let mut state = server.state.lock().unwrap();
        let inserted = state.inserted.clone();
        state.find_docs = inserted;
    }

    let mut find = FindOp::new(namespace(), doc! {});
    find.batch_size = 2;
    let session = client.read_session(client.read_preference()).unwrap();
    let mut cursor = find.execute(&session).unwrap();

    assert!(cursor.next().unwrap().is_ok());
    assert!(cursor.next().unwrap().is_ok());

    let id = cursor.cursor_id();
    assert!(id != 0);
    cursor.kill().unwrap();
    assert!(server.state.lock().unwrap().killed.contains(&id));

    match cursor.next() {
        Some(Err(Error::CursorNotFound(found))) => assert_eq!(id, found),
        other => panic!(
            "expected CursorNotFound, got {:?}",
            other.map(|r| r.map(|_| ()))
        ),
    }

    client.close();
}

#[test]
fn exhausted_cursor_iterates_cleanly() {
    let mut state = MockState::default();
    state.find_docs = vec![doc! { "i": 1 }, doc! { "i": 2 }];
    let server = MockServer::start(state);
    let client = client_for(&server);

    let session = client.read_session(client.read_preference()).unwrap();
    let cursor = FindOp::new(namespace(), doc! {}).execute(&session).unwrap();

    let docs: Vec<_> = cursor.collect::<mongocore::Result<Vec<_>>>().unwrap();
    assert_eq!(2, docs.len());

    client.close();
}

#[test]
fn drop_swallows_missing_namespace() {
    let mut state = MockState::default();
    state.command_responses.insert(
        "drop".to_owned(),
        doc! { "ok": 0.0, "errmsg": "ns not found" },
    );
    let server = MockServer::start(state);
    let client = client_for(&server);

    let session = client.write_session().unwrap();
    assert!(drop_collection(&session, &namespace()).is_ok());

    client.close();
}

#[test]
fn other_command_failures_surface() {
    let mut state = MockState::default();
    state.command_responses.insert(
        "drop".to_owned(),
        doc! { "ok": 0.0, "errmsg": "unauthorized", "code": 13 },
    );
    let server = MockServer::start(state);
    let client = client_for(&server);

    let session = client.write_session().unwrap();
    match drop_collection(&session, &namespace()) {
        Err(Error::OperationError { code: Some(13), .. }) => (),
        other => panic!("expected OperationError, got {:?}", other),
    }

    client.close();
}

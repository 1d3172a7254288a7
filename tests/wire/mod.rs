use std::io::Cursor;

use bson::{bson, doc};
use byteorder::{LittleEndian, WriteBytesExt};

use mongocore::wire_protocol::flags::{OpDeleteFlags, OpInsertFlags, OpQueryFlags, OpUpdateFlags};
use mongocore::wire_protocol::header::{Header, OpCode};
use mongocore::wire_protocol::operations::{Message, MessageLimits};

fn limits() -> MessageLimits {
    MessageLimits::default()
}

#[test]
fn header_round_trip() {
    let header = Header::new_request(64, 7, OpCode::Query);
    let mut buffer = Vec::new();
    header.write(&mut buffer).unwrap();
    assert_eq!(16, buffer.len());

    let parsed = Header::read(&mut Cursor::new(buffer)).unwrap();
    assert_eq!(header, parsed);
}

#[test]
fn unknown_opcode_rejected() {
    let mut buffer = Vec::new();
    buffer.write_i32::<LittleEndian>(16).unwrap();
    buffer.write_i32::<LittleEndian>(1).unwrap();
    buffer.write_i32::<LittleEndian>(0).unwrap();
    buffer.write_i32::<LittleEndian>(1999).unwrap();

    assert!(Header::read(&mut Cursor::new(buffer)).is_err());
}

// The header's message_length must equal the number of bytes actually
// serialized, for every message shape.
#[test]
fn declared_lengths_match_serialized_lengths() {
    let query = Message::new_query(
        1,
        OpQueryFlags::SLAVE_OK,
        "db.coll".to_owned(),
        3,
        2,
        doc! { "a": 1 },
        Some(doc! { "b": 1 }),
        &limits(),
    ).unwrap();

    let update = Message::new_update(
        2,
        "db.coll".to_owned(),
        OpUpdateFlags::UPSERT,
        doc! { "a": 1 },
        doc! { "$set": { "b": 2 } },
        &limits(),
    ).unwrap();

    let (insert, _) = Message::new_insert(
        3,
        OpInsertFlags::empty(),
        "db.coll".to_owned(),
        &[doc! { "a": 1 }, doc! { "b": 2 }],
        &limits(),
    ).unwrap();

    let delete = Message::new_delete(
        4,
        "db.coll".to_owned(),
        OpDeleteFlags::SINGLE_REMOVE,
        doc! { "a": 1 },
        &limits(),
    ).unwrap();

    let get_more = Message::new_get_more(5, "db.coll".to_owned(), 10, 99);
    let kill = Message::new_kill_cursors(6, vec![7, 8, 9]);

    for message in &[query, update, insert, delete, get_more, kill] {
        let mut buffer = Vec::new();
        message.write(&mut buffer).unwrap();
        assert_eq!(
            message.header().message_length as usize,
            buffer.len(),
            "{} declared a wrong length",
            message.header().op_code
        );
    }
}

#[test]
fn query_frame_layout() {
    let message = Message::new_query(
        21,
        OpQueryFlags::empty(),
        "db.$cmd".to_owned(),
        0,
        -1,
        doc! { "ismaster": 1 },
        None,
        &limits(),
    ).unwrap();

    let mut buffer = Vec::new();
    message.write(&mut buffer).unwrap();

    // requestId at offset 4, responseTo at 8, opcode at 12.
    assert_eq!(21, i32::from_le_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]));
    assert_eq!(0, i32::from_le_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]));
    assert_eq!(
        2004,
        i32::from_le_bytes([buffer[12], buffer[13], buffer[14], buffer[15]])
    );

    // The namespace is a null-terminated cstring right after the flags.
    assert_eq!(&buffer[20..27], b"db.$cmd");
    assert_eq!(0, buffer[27]);
}

#[test]
fn reply_round_trip() {
    let docs = vec![doc! { "a": 1 }, doc! { "b": "two" }];

    let mut body = Vec::new();
    body.write_i32::<LittleEndian>(8).unwrap(); // AwaitCapable
    body.write_i64::<LittleEndian>(77).unwrap();
    body.write_i32::<LittleEndian>(0).unwrap();
    body.write_i32::<LittleEndian>(docs.len() as i32).unwrap();
    for doc in &docs {
        bson::encode_document(&mut body, doc).unwrap();
    }

    let mut frame = Vec::new();
    frame.write_i32::<LittleEndian>(16 + body.len() as i32).unwrap();
    frame.write_i32::<LittleEndian>(0).unwrap();
    frame.write_i32::<LittleEndian>(21).unwrap();
    frame.write_i32::<LittleEndian>(1).unwrap();
    frame.extend_from_slice(&body);

    match Message::read(&mut Cursor::new(frame)).unwrap() {
        Message::OpReply {
            header,
            cursor_id,
            number_returned,
            documents,
            ..
        } => {
            assert_eq!(21, header.response_to);
            assert_eq!(77, cursor_id);
            assert_eq!(2, number_returned);
            assert_eq!(docs, documents);
        }
        _ => panic!("expected an OpReply"),
    }
}

#[test]
fn reading_a_request_opcode_is_an_error() {
    let message = Message::new_get_more(5, "db.coll".to_owned(), 10, 99);
    let mut buffer = Vec::new();
    message.write(&mut buffer).unwrap();

    assert!(Message::read(&mut Cursor::new(buffer)).is_err());
}

#[test]
fn insert_batches_split_on_document_count() {
    let docs: Vec<_> = (0..5).map(|i| doc! { "i": i }).collect();
    let limits = MessageLimits {
        max_write_batch_size: 2,
        ..MessageLimits::default()
    };

    let (message, consumed) = Message::new_insert(
        1,
        OpInsertFlags::empty(),
        "db.coll".to_owned(),
        &docs,
        &limits,
    ).unwrap();

    assert_eq!(2, consumed);
    match message {
        Message::OpInsert { documents, .. } => assert_eq!(2, documents.len()),
        _ => panic!("expected an OpInsert"),
    }

    // The remainder continues from the reported offset.
    let (_, consumed) = Message::new_insert(
        2,
        OpInsertFlags::empty(),
        "db.coll".to_owned(),
        &docs[2..],
        &limits,
    ).unwrap();
    assert_eq!(2, consumed);
}

#[test]
fn insert_batches_split_on_message_size() {
    let docs: Vec<_> = (0..4)
        .map(|_| doc! { "payload": "x".repeat(64) })
        .collect();

    // Room for the envelope and one document, not two.
    let limits = MessageLimits {
        max_message_size: 160,
        ..MessageLimits::default()
    };

    let (_, consumed) = Message::new_insert(
        1,
        OpInsertFlags::empty(),
        "db.coll".to_owned(),
        &docs,
        &limits,
    ).unwrap();
    assert_eq!(1, consumed);
}

#[test]
fn oversized_document_rejected() {
    let limits = MessageLimits {
        max_document_size: 32,
        ..MessageLimits::default()
    };
    let doc = doc! { "payload": "x".repeat(64) };

    assert!(
        Message::new_insert(
            1,
            OpInsertFlags::empty(),
            "db.coll".to_owned(),
            &[doc.clone()],
            &limits,
        ).is_err()
    );
    assert!(
        Message::new_query(
            1,
            OpQueryFlags::empty(),
            "db.coll".to_owned(),
            0,
            0,
            doc,
            None,
            &limits,
        ).is_err()
    );
}

#[test]
fn kill_cursors_frame_layout() {
    let message = Message::new_kill_cursors(9, vec![7]);
    let mut buffer = Vec::new();
    message.write(&mut buffer).unwrap();

    // header + ZERO + count + one id
    assert_eq!(16 + 4 + 4 + 8, buffer.len());
    assert_eq!(
        2007,
        i32::from_le_bytes([buffer[12], buffer[13], buffer[14], buffer[15]])
    );
    assert_eq!(1, i32::from_le_bytes([buffer[20], buffer[21], buffer[22], buffer[23]]));
    assert_eq!(
        7,
        i64::from_le_bytes([
            buffer[24], buffer[25], buffer[26], buffer[27], buffer[28], buffer[29], buffer[30],
            buffer[31],
        ])
    );
}

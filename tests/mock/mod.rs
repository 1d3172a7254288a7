//! A scripted wire-protocol server for driving the driver without a real
//! deployment.
//!
//! The server answers isMaster probes as a standalone, acknowledges
//! getLastError, serves canned documents for queries (with a live cursor id
//! when a remainder is left), and honors killCursors by failing later
//! getMores with the cursor-not-found flag.
use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bson::{bson, doc, Document};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const OP_REPLY: i32 = 1;
const OP_UPDATE: i32 = 2001;
const OP_INSERT: i32 = 2002;
const OP_QUERY: i32 = 2004;
const OP_GET_MORE: i32 = 2005;
const OP_DELETE: i32 = 2006;
const OP_KILL_CURSORS: i32 = 2007;

const CURSOR_NOT_FOUND_FLAG: i32 = 1;

const MOCK_CURSOR_ID: i64 = 42;

#[derive(Default)]
pub struct MockState {
    /// Documents served to queries, in order.
    pub find_docs: Vec<Document>,
    /// Batches parked behind a live cursor id.
    pub pending: HashMap<i64, Vec<Document>>,
    /// Cursor ids the client has killed.
    pub killed: HashSet<i64>,
    /// Documents received through OP_INSERT.
    pub inserted: Vec<Document>,
    pub updates: usize,
    pub deletes: usize,
    /// Overrides the `{ok: 1}` getLastError acknowledgement.
    pub gle_response: Option<Document>,
    /// Command responses keyed by the command's first key.
    pub command_responses: HashMap<String, Document>,
}

pub struct MockServer {
    pub port: u16,
    pub state: Arc<Mutex<MockState>>,
    running: Arc<AtomicBool>,
    conns: Arc<Mutex<Vec<TcpStream>>>,
    accept_handle: Option<thread::JoinHandle<()>>,
}

impl MockServer {
    pub fn start(state: MockState) -> MockServer {
        MockServer::start_on(0, state)
    }

    /// Binds to a specific port (with address reuse) so a "restarted"
    /// server can come back at the same address.
    pub fn start_on(port: u16, state: MockState) -> MockServer {
        let address: std::net::SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        ).expect("create mock socket");
        socket.set_reuse_address(true).unwrap();
        socket.bind(&address.into()).expect("bind mock server");
        socket.listen(16).unwrap();
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(Mutex::new(state));
        let running = Arc::new(AtomicBool::new(true));
        let conns = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_running = running.clone();
        let accept_conns = conns.clone();
        let handle = thread::spawn(move || {
            while accept_running.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        if let Ok(clone) = stream.try_clone() {
                            accept_conns.lock().unwrap().push(clone);
                        }
                        let conn_state = accept_state.clone();
                        thread::spawn(move || serve_connection(stream, conn_state));
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        MockServer {
            port: port,
            state: state,
            running: running,
            conns: conns,
            accept_handle: Some(handle),
        }
    }

    pub fn uri(&self) -> String {
        format!("mongodb://127.0.0.1:{}", self.port)
    }

    /// Stops accepting and severs every established connection, as a
    /// crashed server would.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for conn in self.conns.lock().unwrap().drain(..) {
            let _ = conn.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_connection(mut stream: TcpStream, state: Arc<Mutex<MockState>>) {
    loop {
        let mut head = [0u8; 16];
        if stream.read_exact(&mut head).is_err() {
            return;
        }

        let mut head = Cursor::new(head.to_vec());
        let length = head.read_i32::<LittleEndian>().unwrap();
        let request_id = head.read_i32::<LittleEndian>().unwrap();
        let _response_to = head.read_i32::<LittleEndian>().unwrap();
        let op_code = head.read_i32::<LittleEndian>().unwrap();

        let mut body = vec![0u8; (length - 16) as usize];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        let mut body = Cursor::new(body);

        let outcome = match op_code {
            OP_QUERY => handle_query(&mut stream, &mut body, request_id, &state),
            OP_GET_MORE => handle_get_more(&mut stream, &mut body, request_id, &state),
            OP_INSERT => handle_insert(&mut body, &state),
            OP_UPDATE => {
                state.lock().unwrap().updates += 1;
                Ok(())
            }
            OP_DELETE => {
                state.lock().unwrap().deletes += 1;
                Ok(())
            }
            OP_KILL_CURSORS => handle_kill_cursors(&mut body, &state),
            _ => return,
        };

        if outcome.is_err() {
            return;
        }
    }
}

fn handle_query(
    stream: &mut TcpStream,
    body: &mut Cursor<Vec<u8>>,
    request_id: i32,
    state: &Arc<Mutex<MockState>>,
) -> io::Result<()> {
    let _flags = body.read_i32::<LittleEndian>()?;
    let namespace = read_cstring(body)?;
    let _skip = body.read_i32::<LittleEndian>()?;
    let number_to_return = body.read_i32::<LittleEndian>()?;
    let query = bson::decode_document(body).map_err(other)?;

    if namespace.ends_with(".$cmd") {
        let response = command_response(&query, state);
        return write_reply(stream, request_id, 0, 0, &[response]);
    }

    // A plain find against the canned document set.
    let mut locked = state.lock().unwrap();
    let docs = locked.find_docs.clone();
    let wanted = if number_to_return > 0 {
        (number_to_return as usize).min(docs.len())
    } else {
        docs.len()
    };

    let first_batch: Vec<Document> = docs[..wanted].to_vec();
    let cursor_id = if wanted < docs.len() {
        locked.pending.insert(MOCK_CURSOR_ID, docs[wanted..].to_vec());
        MOCK_CURSOR_ID
    } else {
        0
    };
    drop(locked);

    write_reply(stream, request_id, 0, cursor_id, &first_batch)
}

fn command_response(query: &Document, state: &Arc<Mutex<MockState>>) -> Document {
    let first_key = query.keys().next().cloned().unwrap_or_default().to_lowercase();

    if let Some(canned) = state
        .lock()
        .unwrap()
        .command_responses
        .get(&first_key)
        .cloned()
    {
        return canned;
    }

    match &first_key[..] {
        "ismaster" => {
            doc! {
                "ismaster": true,
                "maxBsonObjectSize": 16_777_216i32,
                "maxMessageSizeBytes": 48_000_000i32,
                "maxWriteBatchSize": 1000i32,
                "minWireVersion": 0i32,
                "maxWireVersion": 3i32,
                "ok": 1.0,
            }
        }
        "getnonce" => doc! { "nonce": "2375531c32080ae8", "ok": 1.0 },
        "getlasterror" => {
            state
                .lock()
                .unwrap()
                .gle_response
                .clone()
                .unwrap_or_else(|| doc! { "n": 0, "ok": 1.0 })
        }
        _ => doc! { "ok": 1.0 },
    }
}

fn handle_get_more(
    stream: &mut TcpStream,
    body: &mut Cursor<Vec<u8>>,
    request_id: i32,
    state: &Arc<Mutex<MockState>>,
) -> io::Result<()> {
    let _zero = body.read_i32::<LittleEndian>()?;
    let _namespace = read_cstring(body)?;
    let _number_to_return = body.read_i32::<LittleEndian>()?;
    let cursor_id = body.read_i64::<LittleEndian>()?;

    let batch = {
        let mut locked = state.lock().unwrap();
        if locked.killed.contains(&cursor_id) {
            None
        } else {
            locked.pending.remove(&cursor_id)
        }
    };

    match batch {
        Some(docs) => write_reply(stream, request_id, 0, 0, &docs),
        None => write_reply(stream, request_id, CURSOR_NOT_FOUND_FLAG, 0, &[]),
    }
}

fn handle_insert(body: &mut Cursor<Vec<u8>>, state: &Arc<Mutex<MockState>>) -> io::Result<()> {
    let _flags = body.read_i32::<LittleEndian>()?;
    let _namespace = read_cstring(body)?;

    let mut docs = Vec::new();
    while (body.position() as usize) < body.get_ref().len() {
        docs.push(bson::decode_document(body).map_err(other)?);
    }

    state.lock().unwrap().inserted.extend(docs);
    Ok(())
}

fn handle_kill_cursors(body: &mut Cursor<Vec<u8>>, state: &Arc<Mutex<MockState>>) -> io::Result<()> {
    let _zero = body.read_i32::<LittleEndian>()?;
    let count = body.read_i32::<LittleEndian>()?;

    let mut locked = state.lock().unwrap();
    for _ in 0..count {
        let id = body.read_i64::<LittleEndian>()?;
        locked.killed.insert(id);
        locked.pending.remove(&id);
    }
    Ok(())
}

fn write_reply(
    stream: &mut TcpStream,
    response_to: i32,
    flags: i32,
    cursor_id: i64,
    documents: &[Document],
) -> io::Result<()> {
    let mut body = Vec::new();
    body.write_i32::<LittleEndian>(flags)?;
    body.write_i64::<LittleEndian>(cursor_id)?;
    body.write_i32::<LittleEndian>(0)?;
    body.write_i32::<LittleEndian>(documents.len() as i32)?;
    for doc in documents {
        bson::encode_document(&mut body, doc).map_err(other)?;
    }

    let mut frame = Vec::with_capacity(16 + body.len());
    frame.write_i32::<LittleEndian>(16 + body.len() as i32)?;
    frame.write_i32::<LittleEndian>(0)?;
    frame.write_i32::<LittleEndian>(response_to)?;
    frame.write_i32::<LittleEndian>(OP_REPLY)?;
    frame.extend_from_slice(&body);

    stream.write_all(&frame)?;
    stream.flush()
}

fn read_cstring(body: &mut Cursor<Vec<u8>>) -> io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = body.read_u8()?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn other<E: std::error::Error + Send + Sync + 'static>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

//! End-to-end protocol tests against a scripted in-process server.
//!
//! The mock listens on a loopback socket, performs the startup exchange, and
//! answers extended-protocol messages from a per-test script. Every frontend
//! message is recorded so tests can assert on the exact bytes the driver sent.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use redshift_wire::errors::Error;
use redshift_wire::messages::frontend::md5_hash_password;
use redshift_wire::{
    connect, Autosave, ConnectOptions, Credentials, HostSpec, NativeQuery, ParameterList,
    QueryFlags, ResultCollector, SslMode, TransactionState,
};

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct ExecScript {
    param_oids: Vec<u32>,
    fields: Vec<(&'static str, u32)>,
    rows: Vec<Vec<Option<String>>>,
    tag: &'static str,
    error: Option<(&'static str, &'static str)>,
    status_after: u8,
}

impl ExecScript {
    fn select_one(value: &str) -> ExecScript {
        ExecScript {
            fields: vec![("?column?", 23)],
            rows: vec![vec![Some(value.to_string())]],
            tag: "SELECT 1",
            status_after: b'I',
            ..ExecScript::default()
        }
    }
}

#[derive(Clone, Copy)]
enum MockAuth {
    Trust,
    Md5 { salt: [u8; 4] },
}

#[derive(Default)]
struct MockState {
    startup_params: HashMap<String, String>,
    frontend: Vec<(u8, Vec<u8>)>,
    cancels: Vec<(i32, i32)>,
    copy_chunks: Vec<Vec<u8>>,
}

impl MockState {
    fn simple_queries(&self) -> Vec<String> {
        self.frontend
            .iter()
            .filter(|(code, _)| *code == b'Q')
            .map(|(_, payload)| {
                String::from_utf8_lossy(&payload[..payload.len().saturating_sub(1)]).to_string()
            })
            .collect()
    }
}

struct Mock {
    auth: MockAuth,
    execs: VecDeque<ExecScript>,
    state: Arc<Mutex<MockState>>,
}

async fn spawn_mock(
    auth: MockAuth,
    execs: Vec<ExecScript>,
) -> (std::net::SocketAddr, Arc<Mutex<MockState>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(Mutex::new(MockState::default()));
    let shared = state.clone();

    tokio::spawn(async move {
        let mut mock = Mock {
            auth,
            execs: execs.into(),
            state: shared.clone(),
        };
        let mut first = true;
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            if first {
                first = false;
                if mock.session(stream).await.is_err() {
                    break;
                }
            } else {
                // Subsequent connections are cancel side channels.
                let _ = mock.cancel_session(stream).await;
            }
        }
    });

    (addr, state)
}

impl Mock {
    async fn session(&mut self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let len = stream.read_i32().await?;
            let mut payload = vec![0u8; len as usize - 4];
            stream.read_exact(&mut payload).await?;
            let code = i32::from_be_bytes(payload[0..4].try_into().unwrap());
            match code {
                // SSL probe: decline, the client continues in plaintext.
                80877103 => stream.write_all(b"N").await?,
                80877102 => {
                    self.record_cancel(&payload);
                    return Ok(());
                }
                _ => {
                    self.record_startup(&payload[4..]);
                    break;
                }
            }
        }

        self.handshake(&mut stream).await?;
        self.serve(&mut stream).await
    }

    async fn cancel_session(&mut self, mut stream: TcpStream) -> std::io::Result<()> {
        let len = stream.read_i32().await?;
        let mut payload = vec![0u8; len as usize - 4];
        stream.read_exact(&mut payload).await?;
        let code = i32::from_be_bytes(payload[0..4].try_into().unwrap());
        if code == 80877102 {
            self.record_cancel(&payload);
        }
        Ok(())
    }

    fn record_cancel(&self, payload: &[u8]) {
        let pid = i32::from_be_bytes(payload[4..8].try_into().unwrap());
        let key = i32::from_be_bytes(payload[8..12].try_into().unwrap());
        self.state.lock().unwrap().cancels.push((pid, key));
    }

    fn record_startup(&self, mut bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        while let Some(nul) = bytes.iter().position(|&b| b == 0) {
            if nul == 0 {
                break;
            }
            let key = String::from_utf8_lossy(&bytes[..nul]).to_string();
            bytes = &bytes[nul + 1..];
            let value_end = bytes.iter().position(|&b| b == 0).unwrap_or(0);
            let value = String::from_utf8_lossy(&bytes[..value_end]).to_string();
            bytes = &bytes[value_end + 1..];
            state.startup_params.insert(key, value);
        }
    }

    async fn handshake(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        match self.auth {
            MockAuth::Trust => {
                stream.write_all(&auth_request(0, &[])).await?;
            }
            MockAuth::Md5 { salt } => {
                stream.write_all(&auth_request(5, &salt)).await?;
                // Expect the 'p' response carrying the salted hash.
                let (code, payload) = read_frontend(stream).await?;
                assert_eq!(code, b'p');
                self.state.lock().unwrap().frontend.push((code, payload));
                stream.write_all(&auth_request(0, &[])).await?;
            }
        }
        for (key, value) in [
            ("server_version", "8.0.2"),
            ("client_encoding", "UTF8"),
            ("standard_conforming_strings", "on"),
            ("integer_datetimes", "on"),
            ("server_protocol_version", "0"),
            ("TimeZone", "UTC"),
        ] {
            stream.write_all(&parameter_status(key, value)).await?;
        }
        stream.write_all(&backend_key_data(4711, 20260801)).await?;
        stream.write_all(&ready_for_query(b'I')).await?;
        Ok(())
    }

    async fn serve(&mut self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut status = b'I';
        let mut skipping = false;
        loop {
            let (code, payload) = read_frontend(stream).await?;
            self.state
                .lock()
                .unwrap()
                .frontend
                .push((code, payload.clone()));

            match code {
                b'Q' => {
                    let sql = String::from_utf8_lossy(&payload[..payload.len() - 1]).to_string();
                    status = self.answer_simple(stream, &sql, status).await?;
                }
                b'P' if !skipping => {
                    stream.write_all(&[b'1', 0, 0, 0, 4]).await?;
                }
                b'B' if !skipping => {
                    stream.write_all(&[b'2', 0, 0, 0, 4]).await?;
                }
                b'C' if !skipping => {
                    stream.write_all(&[b'3', 0, 0, 0, 4]).await?;
                }
                b'D' if !skipping => {
                    let script = self.execs.front().cloned().unwrap_or_default();
                    if payload[0] == b'S' {
                        stream
                            .write_all(&parameter_description(&script.param_oids))
                            .await?;
                    }
                    if script.fields.is_empty() {
                        stream.write_all(&[b'n', 0, 0, 0, 4]).await?;
                    } else {
                        stream.write_all(&row_description(&script.fields)).await?;
                    }
                }
                b'E' if !skipping => {
                    let script = self.execs.pop_front().unwrap_or_default();
                    if let Some((sqlstate, message)) = script.error {
                        stream.write_all(&error_response(sqlstate, message)).await?;
                        status = b'E';
                        skipping = true;
                    } else {
                        for row in &script.rows {
                            stream.write_all(&data_row(row)).await?;
                        }
                        stream.write_all(&command_complete(script.tag)).await?;
                        status = script.status_after;
                    }
                }
                b'S' => {
                    stream.write_all(&ready_for_query(status)).await?;
                    skipping = false;
                }
                b'H' => {}
                b'd' => {
                    self.state.lock().unwrap().copy_chunks.push(payload);
                }
                b'c' => {
                    let count = self.state.lock().unwrap().copy_chunks.len();
                    stream
                        .write_all(&command_complete(&format!("COPY {count}")))
                        .await?;
                    stream.write_all(&ready_for_query(status)).await?;
                }
                b'f' => {
                    stream
                        .write_all(&error_response("57014", "COPY cancelled on request"))
                        .await?;
                    stream.write_all(&ready_for_query(status)).await?;
                }
                b'X' => return Ok(()),
                _ => {}
            }
        }
    }

    async fn answer_simple(
        &mut self,
        stream: &mut TcpStream,
        sql: &str,
        status: u8,
    ) -> std::io::Result<u8> {
        let upper = sql.to_ascii_uppercase();
        if upper.starts_with("BEGIN") {
            stream.write_all(&command_complete("BEGIN")).await?;
            stream.write_all(&ready_for_query(b'T')).await?;
            return Ok(b'T');
        }
        if upper.starts_with("SAVEPOINT") {
            stream.write_all(&command_complete("SAVEPOINT")).await?;
            stream.write_all(&ready_for_query(b'T')).await?;
            return Ok(b'T');
        }
        if upper.starts_with("ROLLBACK TO SAVEPOINT") {
            stream.write_all(&command_complete("ROLLBACK")).await?;
            stream.write_all(&ready_for_query(b'T')).await?;
            return Ok(b'T');
        }
        if upper.starts_with("RELEASE") {
            stream.write_all(&command_complete("RELEASE")).await?;
            stream.write_all(&ready_for_query(b'T')).await?;
            return Ok(b'T');
        }
        if upper.starts_with("SET") {
            stream.write_all(&command_complete("SET")).await?;
            stream.write_all(&ready_for_query(status)).await?;
            return Ok(status);
        }
        if upper.starts_with("COPY") {
            stream.write_all(&copy_in_response(1)).await?;
            return Ok(status);
        }
        if upper.starts_with("SHOW TRANSACTION_READ_ONLY") {
            stream
                .write_all(&row_description(&[("transaction_read_only", 25)]))
                .await?;
            stream
                .write_all(&data_row(&[Some("off".to_string())]))
                .await?;
            stream.write_all(&command_complete("SHOW")).await?;
            stream.write_all(&ready_for_query(status)).await?;
            return Ok(status);
        }
        // Anything else consumes an exec script over the simple path.
        let script = self.execs.pop_front().unwrap_or_default();
        if !script.fields.is_empty() {
            stream.write_all(&row_description(&script.fields)).await?;
        }
        for row in &script.rows {
            stream.write_all(&data_row(row)).await?;
        }
        stream.write_all(&command_complete(script.tag)).await?;
        stream.write_all(&ready_for_query(script.status_after)).await?;
        Ok(script.status_after)
    }
}

async fn read_frontend(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let code = stream.read_u8().await?;
    let len = stream.read_i32().await?;
    let mut payload = vec![0u8; len as usize - 4];
    stream.read_exact(&mut payload).await?;
    Ok((code, payload))
}

// Backend message builders, byte-for-byte what a server would emit.

fn auth_request(subtype: i32, extra: &[u8]) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'R');
    bytes.put_i32(8 + extra.len() as i32);
    bytes.put_i32(subtype);
    bytes.put_slice(extra);
    bytes.to_vec()
}

fn parameter_status(key: &str, value: &str) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'S');
    bytes.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    bytes.put_slice(key.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(value.as_bytes());
    bytes.put_u8(0);
    bytes.to_vec()
}

fn backend_key_data(pid: i32, key: i32) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_i32(pid);
    bytes.put_i32(key);
    bytes.to_vec()
}

fn ready_for_query(status: u8) -> Vec<u8> {
    vec![b'Z', 0, 0, 0, 5, status]
}

fn row_description(fields: &[(&str, u32)]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(fields.len() as i16);
    for (name, oid) in fields {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_u32(0);
        body.put_i16(0);
        body.put_u32(*oid);
        body.put_i16(4);
        body.put_i32(-1);
        body.put_i16(0);
    }
    frame(b'T', &body)
}

fn parameter_description(oids: &[u32]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(oids.len() as i16);
    for oid in oids {
        body.put_u32(*oid);
    }
    frame(b't', &body)
}

fn data_row(values: &[Option<String>]) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        match value {
            Some(value) => {
                body.put_i32(value.len() as i32);
                body.put_slice(value.as_bytes());
            }
            None => body.put_i32(-1),
        }
    }
    frame(b'D', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_slice(tag.as_bytes());
    body.put_u8(0);
    frame(b'C', &body)
}

fn error_response(sqlstate: &str, message: &str) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_u8(b'S');
    body.put_slice(b"ERROR\0");
    body.put_u8(b'C');
    body.put_slice(sqlstate.as_bytes());
    body.put_u8(0);
    body.put_u8(b'M');
    body.put_slice(message.as_bytes());
    body.put_u8(0);
    body.put_u8(0);
    frame(b'E', &body)
}

fn copy_in_response(columns: i16) -> Vec<u8> {
    let mut body = BytesMut::new();
    body.put_i8(0);
    body.put_i16(columns);
    for _ in 0..columns {
        body.put_i16(0);
    }
    frame(b'G', &body)
}

fn frame(code: u8, body: &BytesMut) -> Vec<u8> {
    let mut bytes = BytesMut::with_capacity(body.len() + 5);
    bytes.put_u8(code);
    bytes.put_i32(4 + body.len() as i32);
    bytes.put_slice(body);
    bytes.to_vec()
}

// ---------------------------------------------------------------------------
// Client-side helpers
// ---------------------------------------------------------------------------

fn options_for(addr: std::net::SocketAddr) -> ConnectOptions {
    let mut options = ConnectOptions::new("dev");
    options.hosts = vec![HostSpec {
        host: addr.ip().to_string(),
        port: addr.port(),
    }];
    options.ssl_mode = SslMode::Disable;
    options.enable_fetch_ring_buffer = false;
    options
}

fn credentials() -> Credentials {
    Credentials {
        user: Some("alice".into()),
        password: Some("hunter2".into()),
        idp_token: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simple_select_synchronous_delivery() {
    let (addr, state) = spawn_mock(MockAuth::Trust, vec![ExecScript::select_one("1")]).await;
    let conn = connect(options_for(addr), credentials()).await.unwrap();

    let mut collector = ResultCollector::new();
    let query = NativeQuery::simple("SELECT 1");
    conn.execute(
        &query,
        &ParameterList::new(0),
        &mut collector,
        0,
        0,
        QueryFlags::SUPPRESS_BEGIN,
    )
    .await
    .unwrap();

    let tuples = collector.only_tuples().expect("synchronous row set");
    assert_eq!(tuples.len(), 1);
    assert_eq!(tuples[0].get(0).unwrap().as_ref(), b"1");

    assert_eq!(collector.statuses.len(), 1);
    assert_eq!(collector.statuses[0].tag, "SELECT 1");
    assert_eq!(collector.statuses[0].update_count, 1);
    assert_eq!(collector.statuses[0].insert_oid, 0);

    // The startup packet carried the protocol identity fields.
    let params = state.lock().unwrap().startup_params.clone();
    assert_eq!(params.get("user").map(String::as_str), Some("alice"));
    assert_eq!(params.get("client_encoding").map(String::as_str), Some("UTF8"));
    assert_eq!(params.get("DateStyle").map(String::as_str), Some("ISO"));
    assert!(params.contains_key("driver_version"));

    conn.close().await;
}

#[tokio::test]
async fn parameterized_select_text_format() {
    let script = ExecScript {
        param_oids: vec![23],
        ..ExecScript::select_one("42")
    };
    let (addr, state) = spawn_mock(MockAuth::Trust, vec![script]).await;
    let conn = connect(options_for(addr), credentials()).await.unwrap();

    let query = NativeQuery::simple("SELECT $1::int");
    let mut params = ParameterList::new(1);
    params.set_text(0, &b"42"[..], 0);

    let mut collector = ResultCollector::new();
    conn.execute(
        &query,
        &params,
        &mut collector,
        0,
        0,
        QueryFlags::SUPPRESS_BEGIN,
    )
    .await
    .unwrap();

    let tuples = collector.only_tuples().unwrap();
    assert_eq!(tuples[0].get(0).unwrap().as_ref(), b"42");
    assert_eq!(collector.statuses[0].tag, "SELECT 1");

    // The Bind message carried the textual value "42".
    let state = state.lock().unwrap();
    let bind = state
        .frontend
        .iter()
        .find(|(code, _)| *code == b'B')
        .expect("a Bind was sent");
    let needle = b"42";
    assert!(bind.1.windows(needle.len()).any(|w| w == needle));

    // And a Parse for the rewritten SQL.
    let parse = state
        .frontend
        .iter()
        .find(|(code, _)| *code == b'P')
        .expect("a Parse was sent");
    let sql = b"SELECT $1::int";
    assert!(parse.1.windows(sql.len()).any(|w| w == sql));
}

#[tokio::test]
async fn md5_authentication_round_trip() {
    let salt = [0x0a, 0x0b, 0x0c, 0x0d];
    let (addr, state) =
        spawn_mock(MockAuth::Md5 { salt }, vec![ExecScript::select_one("1")]).await;
    let conn = connect(options_for(addr), credentials()).await.unwrap();

    let expected = md5_hash_password("alice", "hunter2", &salt);
    let state = state.lock().unwrap();
    let (code, payload) = &state.frontend[0];
    assert_eq!(*code, b'p');
    // Payload is the hash plus the trailing NUL.
    assert_eq!(&payload[..payload.len() - 1], &expected[..]);
    drop(state);

    conn.close().await;
}

#[tokio::test]
async fn autosave_recovery_and_silent_rollback() {
    let scripts = vec![
        // BEGIN executed over the extended path.
        ExecScript {
            tag: "BEGIN",
            status_after: b'T',
            ..ExecScript::default()
        },
        ExecScript {
            tag: "INSERT 0 1",
            status_after: b'T',
            ..ExecScript::default()
        },
        ExecScript {
            error: Some(("23505", "duplicate key value violates unique constraint")),
            ..ExecScript::default()
        },
        // COMMIT answered with a silent ROLLBACK.
        ExecScript {
            tag: "ROLLBACK",
            status_after: b'I',
            ..ExecScript::default()
        },
    ];
    let (addr, state) = spawn_mock(MockAuth::Trust, scripts).await;

    let mut options = options_for(addr);
    options.autosave = Autosave::Always;
    options.raise_exception_on_silent_rollback = true;
    let conn = connect(options, credentials()).await.unwrap();
    let empty = ParameterList::new(0);

    // BEGIN
    let mut collector = ResultCollector::new();
    conn.execute(
        &NativeQuery::simple("BEGIN"),
        &empty,
        &mut collector,
        0,
        0,
        QueryFlags::NONE,
    )
    .await
    .unwrap();
    assert_eq!(conn.transaction_state().await, TransactionState::Open);

    // First INSERT succeeds under an autosave savepoint.
    let mut collector = ResultCollector::new();
    conn.execute(
        &NativeQuery::simple("INSERT INTO t VALUES (1)"),
        &empty,
        &mut collector,
        0,
        0,
        QueryFlags::NONE,
    )
    .await
    .unwrap();
    assert_eq!(collector.statuses[0].update_count, 1);

    // Second INSERT fails; the executor rolls back to the savepoint before
    // surfacing the error.
    let mut collector = ResultCollector::new();
    let err = conn
        .execute(
            &NativeQuery::simple("INSERT INTO t VALUES (1)"),
            &empty,
            &mut collector,
            0,
            0,
            QueryFlags::NONE,
        )
        .await
        .unwrap_err();
    let server = err.server_error().expect("server error");
    assert_eq!(server.code, "23505");

    // COMMIT reports ROLLBACK: the silent rollback surfaces with the INSERT
    // failure as its cause.
    let mut collector = ResultCollector::new();
    let err = conn
        .execute(
            &NativeQuery::simple("COMMIT"),
            &empty,
            &mut collector,
            0,
            0,
            QueryFlags::NONE,
        )
        .await
        .unwrap_err();
    match &err {
        Error::InFailedSqlTransaction(cause) => {
            assert_eq!(cause.code, "23505");
        }
        other => panic!("expected InFailedSqlTransaction, got {other:?}"),
    }
    assert_eq!(conn.transaction_state().await, TransactionState::Idle);

    // The wire saw the savepoint discipline.
    let queries = state.lock().unwrap().simple_queries();
    assert!(queries.iter().any(|q| q == "SAVEPOINT RSJDBC_AUTOSAVE"));
    assert!(queries
        .iter()
        .any(|q| q == "ROLLBACK TO SAVEPOINT RSJDBC_AUTOSAVE"));

    conn.close().await;
}

#[tokio::test]
async fn streaming_ring_buffer_applies_backpressure() {
    let row_count = 2000usize;
    let script = ExecScript {
        fields: vec![("n", 23)],
        rows: (0..row_count)
            .map(|i| vec![Some(format!("{i:08}"))])
            .collect(),
        tag: "SELECT 2000",
        status_after: b'I',
        ..ExecScript::default()
    };
    let (addr, _state) = spawn_mock(MockAuth::Trust, vec![script]).await;

    let mut options = options_for(addr);
    options.enable_fetch_ring_buffer = true;
    options.fetch_ring_buffer_bytes = 256;
    let conn = connect(options, credentials()).await.unwrap();

    let mut collector = ResultCollector::new();
    conn.execute(
        &NativeQuery::simple("SELECT n FROM series"),
        &ParameterList::new(0),
        &mut collector,
        0,
        0,
        QueryFlags::SUPPRESS_BEGIN,
    )
    .await
    .unwrap();

    let queue = collector.only_queue().expect("streaming delivery");
    let mut seen = 0usize;
    loop {
        match queue.take().await.unwrap() {
            Some(tuple) => {
                assert_eq!(
                    tuple.get(0).unwrap().as_ref(),
                    format!("{seen:08}").as_bytes()
                );
                seen += 1;
                if seen % 257 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            None => break,
        }
    }
    assert_eq!(seen, row_count);
    // The producer had to wait for space at least once.
    assert!(queue.put_blocked_count() > 0);
    // Exhausted results stay exhausted.
    assert!(queue.take().await.unwrap().is_none());

    // The next operation joins the reader cleanly.
    conn.close().await;
}

#[tokio::test]
async fn copy_in_reports_handled_rows() {
    let count_script = ExecScript::select_one("3");
    let (addr, state) = spawn_mock(MockAuth::Trust, vec![count_script]).await;
    let conn = connect(options_for(addr), credentials()).await.unwrap();

    let mut copy = conn.start_copy("COPY t FROM STDIN").await.unwrap();
    assert_eq!(copy.format(), 0);
    assert_eq!(copy.column_formats(), &[0]);

    copy.write_to_copy(b"1\n").await.unwrap();
    copy.write_to_copy(b"2\n").await.unwrap();
    copy.write_to_copy(b"3\n").await.unwrap();
    let handled = copy.end_copy().await.unwrap();
    assert_eq!(handled, 3);

    {
        let state = state.lock().unwrap();
        assert_eq!(state.copy_chunks.len(), 3);
        assert_eq!(state.copy_chunks[0], b"1\n");
    }

    // The connection is usable again after COPY.
    let mut collector = ResultCollector::new();
    conn.execute(
        &NativeQuery::simple("SELECT count(*) FROM t"),
        &ParameterList::new(0),
        &mut collector,
        0,
        0,
        QueryFlags::SUPPRESS_BEGIN,
    )
    .await
    .unwrap();
    assert_eq!(
        collector.only_tuples().unwrap()[0].get(0).unwrap().as_ref(),
        b"3"
    );

    conn.close().await;
}

#[tokio::test]
async fn queries_are_refused_while_copy_lock_is_held() {
    let (addr, _state) = spawn_mock(MockAuth::Trust, vec![]).await;
    let conn = connect(options_for(addr), credentials()).await.unwrap();

    let mut copy = conn.start_copy("COPY t FROM STDIN").await.unwrap();
    let mut collector = ResultCollector::new();
    let err = conn
        .execute(
            &NativeQuery::simple("SELECT 1"),
            &ParameterList::new(0),
            &mut collector,
            0,
            0,
            QueryFlags::SUPPRESS_BEGIN,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongState(_)));

    copy.end_copy().await.unwrap();
    conn.close().await;
}

#[tokio::test]
async fn cancel_travels_over_its_own_connection() {
    let (addr, state) = spawn_mock(MockAuth::Trust, vec![]).await;
    let conn = connect(options_for(addr), credentials()).await.unwrap();

    conn.send_query_cancel().await.unwrap();
    // The mock records the cancel packet from the second connection.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancels = state.lock().unwrap().cancels.clone();
    assert_eq!(cancels, vec![(4711, 20260801)]);

    conn.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let (addr, state) = spawn_mock(MockAuth::Trust, vec![]).await;
    let conn = connect(options_for(addr), credentials()).await.unwrap();

    conn.close().await;
    conn.close().await;
    assert!(conn.is_closed());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let terminates = state
        .lock()
        .unwrap()
        .frontend
        .iter()
        .filter(|(code, _)| *code == b'X')
        .count();
    assert_eq!(terminates, 1);
}

#[tokio::test]
async fn oversized_bind_fails_and_suppresses_execute() {
    let (addr, state) = spawn_mock(MockAuth::Trust, vec![]).await;
    let conn = connect(options_for(addr), credentials()).await.unwrap();

    // 70 slots sharing one 16 MiB buffer claim just over the 0x3fffffff
    // ceiling on the wire while allocating only 16 MiB here.
    let chunk = bytes::Bytes::from(vec![b'x'; 16 * 1024 * 1024]);
    let slots = 70;
    let mut params = ParameterList::new(slots);
    for i in 0..slots {
        params.set_text(i, chunk.clone(), 0);
    }

    let query = NativeQuery::simple("SELECT $1");
    let mut collector = ResultCollector::new();
    let err = conn
        .execute(
            &query,
            &params,
            &mut collector,
            0,
            0,
            QueryFlags::SUPPRESS_BEGIN | QueryFlags::NO_METADATA | QueryFlags::ONESHOT,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BindSizeExceeded(_)));

    // Neither Bind nor Execute reached the wire; the Sync still drained.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let state = state.lock().unwrap();
    assert!(!state.frontend.iter().any(|(code, _)| *code == b'B'));
    assert!(!state.frontend.iter().any(|(code, _)| *code == b'E'));
    assert!(state.frontend.iter().any(|(code, _)| *code == b'S'));
    drop(state);

    conn.close().await;
}

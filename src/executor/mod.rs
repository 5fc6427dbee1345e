//! The query executor: the extended-query state machine and the public
//! operations of one open connection.

pub mod portal;
pub(crate) mod process;
pub(crate) mod reader;

use std::collections::VecDeque;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::cancel::CancelChannel;
use crate::config::{Autosave, ConnectOptions};
use crate::errors::{Error, ServerError};
use crate::handler::ResultHandler;
use crate::messages::constants::*;
use crate::messages::{frontend, Notification};
use crate::parameters::ServerParameters;
use crate::query::{NativeQuery, ParameterList, SqlCommandType};
use crate::statements::{PreparedStatement, StatementCache, StatementKey};
use crate::stream::FramedStream;

pub use portal::Portal;
use portal::Graveyard;
use process::{BorrowedStatement, ExecSession, ExecuteExpect, ProcessEnd};

/// Execution behavior switches, a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags(u32);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    /// Don't name the statement; it will not be cached.
    pub const ONESHOT: QueryFlags = QueryFlags(1 << 0);
    /// Suppress Describe; the caller doesn't need row metadata.
    pub const NO_METADATA: QueryFlags = QueryFlags(1 << 1);
    /// Discard rows, deliver only the command status.
    pub const NO_RESULTS: QueryFlags = QueryFlags(1 << 2);
    /// Honor the fetch size through portal suspension.
    pub const FORWARD_CURSOR: QueryFlags = QueryFlags(1 << 3);
    /// Do not auto-begin a transaction.
    pub const SUPPRESS_BEGIN: QueryFlags = QueryFlags(1 << 4);
    /// Parse + DescribeStatement only, no Execute.
    pub const DESCRIBE_ONLY: QueryFlags = QueryFlags(1 << 5);
    /// Deliver both rows and status (RETURNING).
    pub const BOTH_ROWS_AND_STATUS: QueryFlags = QueryFlags(1 << 6);
    pub const FORCE_DESCRIBE_PORTAL: QueryFlags = QueryFlags(1 << 7);
    /// Request text format for every column.
    pub const NO_BINARY_TRANSFER: QueryFlags = QueryFlags(1 << 8);
    /// Use the simple `Q` path.
    pub const EXECUTE_AS_SIMPLE: QueryFlags = QueryFlags(1 << 9);
    /// Attach READ ONLY to the auto-begun transaction.
    pub const READ_ONLY_HINT: QueryFlags = QueryFlags(1 << 10);

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: QueryFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for QueryFlags {
    type Output = QueryFlags;

    fn bitor(self, rhs: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Open,
    Failed,
}

/// Connection-private state. Everything behind the connection mutex.
pub(crate) struct Inner {
    pub(crate) stream: Option<FramedStream>,
    pub(crate) reader: Option<reader::ReaderHandle>,
    pub(crate) options: ConnectOptions,
    pub(crate) parameters: ServerParameters,
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,
    pub(crate) transaction: TransactionState,
    pub(crate) transaction_fail_cause: Option<Box<ServerError>>,
    pub(crate) standard_conforming_strings: bool,
    pub(crate) integer_datetimes: bool,
    pub(crate) datashare_enabled: bool,
    pub(crate) cross_datashare: bool,
    pub(crate) multi_statement: bool,
    pub(crate) server_protocol_version: i32,
    pub(crate) server_time_zone: Option<String>,
    pub(crate) cache: StatementCache,
    pub(crate) statement_counter: u64,
    pub(crate) portal_counter: u64,
    pub(crate) copy_lock: Option<u64>,
    pub(crate) copy_counter: u64,
    pub(crate) notifications: VecDeque<Notification>,
    pub(crate) portal_graveyard: Graveyard,
    pub(crate) last_search_path: Option<String>,
    pub(crate) closed: bool,
    pub(crate) connected_at: chrono::NaiveDateTime,
    /// `user@host:port/database` for log lines.
    pub(crate) identity: String,
}

impl Inner {
    pub(crate) fn new(
        stream: FramedStream,
        options: ConnectOptions,
        parameters: ServerParameters,
        process_id: i32,
        secret_key: i32,
        transaction_status: u8,
        identity: String,
    ) -> Inner {
        let cache = StatementCache::new(
            options.statement_cache_queries,
            options.statement_cache_bytes,
        );
        let multi_statement = options.enable_multi_sql_support;
        let mut inner = Inner {
            stream: Some(stream),
            reader: None,
            options,
            parameters: ServerParameters::new(),
            process_id,
            secret_key,
            transaction: TransactionState::Idle,
            transaction_fail_cause: None,
            standard_conforming_strings: false,
            integer_datetimes: false,
            datashare_enabled: false,
            cross_datashare: false,
            multi_statement,
            server_protocol_version: 0,
            server_time_zone: None,
            cache,
            statement_counter: 0,
            portal_counter: 0,
            copy_lock: None,
            copy_counter: 0,
            notifications: VecDeque::new(),
            portal_graveyard: Arc::new(parking_lot::Mutex::new(Vec::new())),
            last_search_path: None,
            closed: false,
            connected_at: chrono::Utc::now().naive_utc(),
            identity,
        };
        for (key, value) in parameters.as_hashmap() {
            inner.apply_parameter_status(&key, &value);
        }
        inner.apply_transaction_status(transaction_status);
        inner
    }

    pub(crate) fn stream_mut(&mut self) -> Result<&mut FramedStream, Error> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        match self.stream.as_mut() {
            Some(stream) => Ok(stream),
            // The reader still owns the stream; the caller forgot to drain.
            None => Err(Error::WrongState(
                "a streaming reader still owns the connection".into(),
            )),
        }
    }

    /// Join the outstanding ring-buffer reader, reclaim the stream, and fold
    /// its observations into the connection state. Must run before any new
    /// operation touches the socket.
    pub(crate) async fn drain_reader(&mut self) -> Result<(), Error> {
        let handle = match self.reader.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        // The consumer may have stopped taking rows; let the producer drop
        // the rest instead of blocking forever.
        handle.queue.set_skip_rows();
        let done = match handle.join.await {
            Ok(done) => done,
            Err(err) => {
                warn!("{}: row reader panicked: {err}", self.identity);
                self.closed = true;
                return Err(Error::Interrupted);
            }
        };

        debug!(
            "{}: reader finished after {} rows{}{}",
            self.identity,
            done.row_count,
            if done.suspended { ", suspended" } else { "" },
            done.command_tag
                .as_deref()
                .map(|tag| format!(", tag {tag}"))
                .unwrap_or_default()
        );
        self.stream = Some(done.stream);
        for (key, value) in done.parameter_updates {
            self.apply_parameter_status(&key, &value);
        }
        self.notifications.extend(done.notifications);
        for warning in done.warnings {
            debug!("{}: deferred notice: {warning}", self.identity);
        }
        if let Some(status) = done.transaction_status {
            self.apply_transaction_status(status);
        }
        if let Some(cause) = done.server_error {
            self.transaction_fail_cause = Some(cause);
        }
        if let Some(fatal) = done.fatal {
            warn!("{}: connection lost while streaming: {fatal}", self.identity);
            self.closed = true;
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    pub(crate) async fn abort_socket(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.close().await;
        }
        self.closed = true;
    }

    pub(crate) fn apply_parameter_status(&mut self, key: &str, value: &str) {
        self.parameters.set(key, value);
        match key.to_ascii_lowercase().as_str() {
            "standard_conforming_strings" => {
                self.standard_conforming_strings = value == "on";
            }
            "integer_datetimes" => self.integer_datetimes = value == "on",
            "datashare_enabled" => self.datashare_enabled = value == "on",
            "external_database" => self.cross_datashare = value == "on",
            "server_protocol_version" => {
                self.server_protocol_version = value.parse().unwrap_or(0);
            }
            "timezone" => self.server_time_zone = Some(value.to_string()),
            "search_path" => {
                if self.last_search_path.as_deref() != Some(value) {
                    if self.last_search_path.is_some() {
                        self.cache.bump_epoch();
                    }
                    self.last_search_path = Some(value.to_string());
                }
            }
            _ => {}
        }
    }

    pub(crate) fn apply_transaction_status(&mut self, status: u8) {
        self.transaction = match status {
            b'I' => {
                self.transaction_fail_cause = None;
                TransactionState::Idle
            }
            b'T' => TransactionState::Open,
            b'E' => TransactionState::Failed,
            other => {
                warn!(
                    "{}: unknown transaction status '{}'",
                    self.identity, other as char
                );
                self.transaction
            }
        };
    }

    /// Cache-invalidation events reported through command tags.
    pub(crate) fn note_command_tag(&mut self, tag: &str) {
        if tag == "DEALLOCATE ALL" || tag == "DISCARD ALL" {
            info!("{}: server discarded prepared plans ({tag})", self.identity);
            self.cache.bump_epoch();
        }
    }

    /// `SET search_path` invalidates every cached plan when the value moved.
    pub(crate) fn observe_search_path(&mut self, sql: &str) {
        if let Some(value) = extract_search_path(sql) {
            if self.last_search_path.as_deref() != Some(value.as_str()) {
                if self.last_search_path.is_some() {
                    self.cache.bump_epoch();
                }
                self.last_search_path = Some(value);
            }
        }
    }

    pub(crate) fn next_statement_name(&mut self) -> String {
        self.statement_counter += 1;
        portal::statement_name(self.statement_counter)
    }

    pub(crate) fn next_portal_name(&mut self) -> String {
        self.portal_counter += 1;
        portal::portal_name(self.portal_counter)
    }

    /// Run one statement over the simple path and fold its outcome into the
    /// connection state. Server errors surface as `Err`.
    pub(crate) async fn run_simple(&mut self, sql: &str) -> Result<process::SimpleOutcome, Error> {
        let include_detail = self.options.log_server_error_detail;
        let version = self.server_protocol_version;
        let stream = self.stream_mut()?;
        let outcome = match process::simple_exec(stream, sql, include_detail, version).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.abort_socket().await;
                return Err(err);
            }
        };
        for (key, value) in &outcome.parameter_updates {
            self.apply_parameter_status(key, value);
        }
        self.notifications.extend(outcome.notifications.iter().cloned());
        if let Some(status) = outcome.transaction_status {
            self.apply_transaction_status(status);
        }
        if let Some(err) = &outcome.error {
            self.transaction_fail_cause = Some(err.clone());
        }
        outcome.into_result()
    }

    /// Preamble step: send Close for every disposed portal and every evicted
    /// statement before new work is queued.
    fn queue_dead_closes(&mut self, session: &mut ExecSession<'_>) -> Result<(), Error> {
        let dead_portals: Vec<String> = self.portal_graveyard.lock().drain(..).collect();
        let dead_statements = self.cache.take_pending_closes();
        if dead_portals.is_empty() && dead_statements.is_empty() {
            return Ok(());
        }
        let stream = self.stream_mut()?;
        for name in dead_portals {
            stream.send_bytes(&frontend::close_portal(&name));
            session.pending.closes += 1;
        }
        for name in dead_statements {
            stream.send_bytes(&frontend::close_statement(&name));
            session.pending.closes += 1;
        }
        Ok(())
    }
}

impl Drop for Inner {
    /// Try to do a clean shut down. Best effort: the socket may not be
    /// writable, and a TLS record cannot be produced synchronously.
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(stream) = self.stream.as_mut() {
            match stream.try_write_raw(&frontend::terminate()) {
                Ok(5) => (),
                Err(err) => warn!("Dirty connection {} shutdown: {err}", self.identity),
                _ => warn!("Dirty connection {} shutdown", self.identity),
            }
        }
        info!(
            "Connection {} dropped after {}",
            self.identity,
            session_duration(self.connected_at)
        );
    }
}

/// Elapsed wall time since the connection came up, for teardown log lines.
fn session_duration(connected_at: chrono::NaiveDateTime) -> String {
    let elapsed = chrono::Utc::now().naive_utc() - connected_at;
    let seconds = elapsed.num_seconds().max(0);
    format!(
        "{}:{:02}:{:02}.{:03}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60,
        elapsed.num_milliseconds().rem_euclid(1000)
    )
}

/// One open connection. Clone handles share the same session; every operation
/// serializes on the connection mutex, and a second scope blocks until the
/// first one finishes.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<AsyncMutex<Inner>>,
    pub(crate) cancel: CancelChannel,
    closed: Arc<AtomicBool>,
}

impl Connection {
    pub(crate) fn assemble(inner: Inner, cancel: CancelChannel) -> Connection {
        Connection {
            inner: Arc::new(AsyncMutex::new(inner)),
            cancel,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Backend process id, for diagnostics and cancel bookkeeping.
    pub fn backend_process_id(&self) -> i32 {
        self.cancel.process_id
    }

    /// Execute one query to completion against the handler.
    pub async fn execute(
        &self,
        query: &NativeQuery,
        params: &ParameterList,
        handler: &mut dyn ResultHandler,
        max_rows: u32,
        fetch_size: u32,
        flags: QueryFlags,
    ) -> Result<(), Error> {
        self.execute_batch(
            std::slice::from_ref(query),
            std::slice::from_ref(params),
            handler,
            max_rows,
            fetch_size,
            flags,
        )
        .await
    }

    /// Execute a batch. Parse/Bind/Execute may be pipelined, but handler
    /// callbacks fire strictly in submission order.
    pub async fn execute_batch(
        &self,
        queries: &[NativeQuery],
        params: &[ParameterList],
        handler: &mut dyn ResultHandler,
        max_rows: u32,
        fetch_size: u32,
        flags: QueryFlags,
    ) -> Result<(), Error> {
        if queries.is_empty() {
            return Ok(());
        }
        if params.len() != queries.len() {
            return Err(Error::InvalidParameterValue {
                name: "params".into(),
                value: format!("{} lists for {} queries", params.len(), queries.len()),
            });
        }

        let mut inner = self.inner.lock().await;
        inner.drain_reader().await?;
        if inner.closed {
            return Err(Error::ConnectionClosed);
        }
        if inner.copy_lock.is_some() {
            return Err(Error::WrongState("a COPY operation is in progress".into()));
        }

        handler.statement_entering_query();
        let outcome = run_batch(
            &mut inner,
            queries,
            params,
            &mut *handler,
            max_rows,
            fetch_size,
            flags,
        )
        .await;
        handler.statement_leaving_query();

        match outcome {
            Ok(()) => handler.handle_completion(),
            Err(err) => {
                if err.is_fatal() {
                    inner.abort_socket().await;
                }
                handler.handle_error(err);
                handler.handle_completion()
            }
        }
    }

    /// Continuation fetch from a suspended portal.
    pub async fn fetch(
        &self,
        portal: &Portal,
        handler: &mut dyn ResultHandler,
        fetch_size: u32,
        initial_row_count: u64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.drain_reader().await?;
        if inner.closed {
            return Err(Error::ConnectionClosed);
        }
        if inner.copy_lock.is_some() {
            return Err(Error::WrongState("a COPY operation is in progress".into()));
        }

        handler.statement_entering_query();
        let result: Result<(), Error> = async {
            let mut session =
                ExecSession::new(&mut *handler, &[], QueryFlags::NONE, 0, fetch_size);
            session.initial_row_count = initial_row_count;
            session.portal_fields = Some(portal.fields().to_vec());
            session.pending.execute.push_back(ExecuteExpect {
                query: 0,
                portal: Some(portal.name().to_string()),
                cached_fields: None,
                simple: false,
            });

            let stream = inner.stream_mut()?;
            stream.send_bytes(&frontend::execute(portal.name(), fetch_size as i32));
            stream.send_bytes(&frontend::sync());
            stream.flush().await?;

            process::process_results(&mut inner, &mut session).await?;
            Ok(())
        }
        .await;
        handler.statement_leaving_query();

        match result {
            Ok(()) => handler.handle_completion(),
            Err(err) => {
                if err.is_fatal() {
                    inner.abort_socket().await;
                }
                handler.handle_error(err);
                handler.handle_completion()
            }
        }
    }

    /// Drain asynchronous notifications while the connection is idle.
    pub async fn process_notifies(&self, timeout_ms: u64) -> Result<Vec<Notification>, Error> {
        let mut inner = self.inner.lock().await;
        inner.drain_reader().await?;
        if inner.closed {
            return Err(Error::ConnectionClosed);
        }

        let mut collected: Vec<Notification> = inner.notifications.drain(..).collect();
        let include_detail = inner.options.log_server_error_detail;
        let saved_deadline = {
            let stream = inner.stream_mut()?;
            let saved = stream.deadline();
            stream.set_deadline(timeout_ms.max(1));
            saved
        };

        let mut parameter_updates: Vec<(String, String)> = Vec::new();
        let result = loop {
            let message = {
                let stream = inner.stream_mut()?;
                if timeout_ms == 0 && !stream.has_message_pending() {
                    break Ok(());
                }
                stream.read_message().await
            };
            match message {
                Ok((code, mut payload)) => match code {
                    BACKEND_NOTIFICATION_RESPONSE => {
                        if let Ok(notification) = crate::messages::parse_notification(&mut payload)
                        {
                            collected.push(notification);
                        }
                    }
                    BACKEND_NOTICE_RESPONSE => {
                        if let Ok(notice) =
                            crate::messages::parse_error_fields(&mut payload, include_detail)
                        {
                            debug!("Notice while idle: {notice}");
                        }
                    }
                    BACKEND_PARAMETER_STATUS => {
                        use crate::messages::BytesMutReader;
                        let key = payload.read_string()?;
                        let value = payload.read_string()?;
                        parameter_updates.push((key, value));
                    }
                    other => {
                        break Err(Error::ProtocolViolation(format!(
                            "unexpected message '{}' while idle",
                            other as char
                        )));
                    }
                },
                Err(Error::Timeout) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        for (key, value) in parameter_updates {
            inner.apply_parameter_status(&key, &value);
        }
        if let Ok(stream) = inner.stream_mut() {
            match saved_deadline {
                Some(deadline) => stream.set_deadline(deadline.as_millis() as u64),
                None => stream.set_deadline(0),
            }
        }
        result.map(|_| collected)
    }

    /// Open the cancel side channel and fire a CancelRequest at the backend.
    /// Never touches the main connection; safe during an in-flight query.
    pub async fn send_query_cancel(&self) -> Result<(), Error> {
        self.cancel.send().await
    }

    /// Graceful close: drain the reader, say goodbye, shut the socket down.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().await;
        let _ = inner.drain_reader().await;
        if let Some(stream) = inner.stream.as_mut() {
            stream.send_bytes(&frontend::terminate());
            let _ = stream.flush().await;
            stream.close().await;
        }
        inner.closed = true;
        info!(
            "Connection {} closed after {}",
            inner.identity,
            session_duration(inner.connected_at)
        );
    }

    /// Abortive teardown: no goodbye, just kill the socket.
    pub async fn abort(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.reader.take() {
            handle.queue.close();
            handle.join.abort();
        }
        inner.abort_socket().await;
        info!("Connection {} aborted", inner.identity);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn transaction_state(&self) -> TransactionState {
        self.inner.lock().await.transaction
    }

    pub async fn server_parameters(&self) -> ServerParameters {
        self.inner.lock().await.parameters.clone()
    }

    pub async fn server_protocol_version(&self) -> i32 {
        self.inner.lock().await.server_protocol_version
    }

    /// Backend pid and secret key as reported by BackendKeyData.
    pub async fn backend_key(&self) -> (i32, i32) {
        let inner = self.inner.lock().await;
        (inner.process_id, inner.secret_key)
    }

    /// Session profile derived from the parameter-status stream.
    pub async fn session_profile(&self) -> SessionProfile {
        let inner = self.inner.lock().await;
        SessionProfile {
            standard_conforming_strings: inner.standard_conforming_strings,
            integer_datetimes: inner.integer_datetimes,
            datashare_enabled: inner.datashare_enabled,
            cross_datashare: inner.cross_datashare,
            multi_statement: inner.multi_statement,
            server_protocol_version: inner.server_protocol_version,
            server_time_zone: inner.server_time_zone.clone(),
        }
    }
}

/// Server-negotiated session traits the statement layer consults when
/// encoding literals and planning result handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProfile {
    pub standard_conforming_strings: bool,
    pub integer_datetimes: bool,
    pub datashare_enabled: bool,
    pub cross_datashare: bool,
    pub multi_statement: bool,
    pub server_protocol_version: i32,
    pub server_time_zone: Option<String>,
}

// ---------------------------------------------------------------------------
// Batch orchestration
// ---------------------------------------------------------------------------

async fn run_batch(
    inner: &mut Inner,
    queries: &[NativeQuery],
    params: &[ParameterList],
    handler: &mut dyn ResultHandler,
    max_rows: u32,
    fetch_size: u32,
    flags: QueryFlags,
) -> Result<(), Error> {
    let mut session = ExecSession::new(&mut *handler, queries, flags, max_rows, fetch_size);
    inner.queue_dead_closes(&mut session)?;

    // Auto-begin, intercepting the BEGIN status on the simple path.
    let first_is_txn_control = matches!(
        queries[0].command,
        SqlCommandType::Begin | SqlCommandType::Commit | SqlCommandType::Rollback
    );
    if !flags.contains(QueryFlags::SUPPRESS_BEGIN)
        && inner.transaction == TransactionState::Idle
        && !first_is_txn_control
    {
        let begin_sql = if flags.contains(QueryFlags::READ_ONLY_HINT) {
            "BEGIN READ ONLY"
        } else {
            "BEGIN"
        };
        let outcome = inner.run_simple(begin_sql).await?;
        if outcome.last_tag() != Some("BEGIN") {
            warn!(
                "{}: BEGIN answered with {:?}",
                inner.identity,
                outcome.last_tag()
            );
        }
    }

    // Auto-savepoint before risky statements.
    let produces_rows = queries.iter().any(|q| q.command.returns_rows());
    let want_autosave = match inner.options.autosave {
        Autosave::Always => true,
        Autosave::Conservative => produces_rows,
        Autosave::Never => false,
    };
    if want_autosave && inner.transaction == TransactionState::Open {
        inner
            .run_simple(&format!("SAVEPOINT {AUTOSAVE_NAME}"))
            .await?;
        session.autosave_taken = true;
    }

    let result = if flags.contains(QueryFlags::EXECUTE_AS_SIMPLE) {
        run_batch_simple(inner, &mut session, queries, params).await
    } else {
        run_batch_extended(inner, &mut session, queries, params).await
    };

    // Return borrowed statements to the cache (or queue their close).
    let borrowed = std::mem::take(&mut session.borrowed);
    for entry in borrowed {
        if entry.cacheable {
            inner.cache.put(entry.statement);
        } else if !entry.statement.name.is_empty() {
            inner.cache.queue_close(entry.statement.name);
        }
    }

    let saw_error = session.saw_error;
    let error_heals = session.error_heals;
    let autosave_taken = session.autosave_taken;
    drop(session);

    result?;

    // Auto-savepoint recovery: roll back to the savepoint before the error
    // surfaces, so the transaction stays usable.
    if saw_error && autosave_taken {
        let rollback = matches!(inner.options.autosave, Autosave::Always) || error_heals;
        if rollback && inner.transaction == TransactionState::Failed {
            match inner
                .run_simple(&format!("ROLLBACK TO SAVEPOINT {AUTOSAVE_NAME}"))
                .await
            {
                Ok(_) => debug!("{}: rolled back to autosave", inner.identity),
                Err(err) => {
                    // Chained as a suppressed cause behind the original error.
                    handler.handle_error(err);
                }
            }
        }
    } else if !saw_error && autosave_taken && inner.options.cleanup_savepoints {
        if inner.transaction == TransactionState::Open {
            let _ = inner
                .run_simple(&format!("RELEASE SAVEPOINT {AUTOSAVE_NAME}"))
                .await;
        }
    }

    Ok(())
}

async fn run_batch_extended(
    inner: &mut Inner,
    session: &mut ExecSession<'_>,
    queries: &[NativeQuery],
    params: &[ParameterList],
) -> Result<(), Error> {
    // Streaming applies to a lone row-returning query with a cooperative
    // consumer; everything else delivers synchronously.
    if inner.options.enable_fetch_ring_buffer
        && queries.len() == 1
        && queries[0].command.returns_rows()
        && !session.handler.wants_scrollable_result_set()
        && !session.flags.intersects(
            QueryFlags::NO_RESULTS | QueryFlags::DESCRIBE_ONLY | QueryFlags::FORWARD_CURSOR,
        )
    {
        session.streaming_query = Some(0);
    }

    let mut estimated_receive_bytes = 0usize;
    for (index, query) in queries.iter().enumerate() {
        if session.saw_error {
            // The first error short-circuits further submission.
            break;
        }
        match send_one_query(inner, session, index, query, &params[index]).await {
            Ok(estimate) => estimated_receive_bytes += estimate,
            Err(err @ (Error::BindSizeExceeded(_) | Error::NotSupported(_))) => {
                session.saw_error = true;
                session.handler.handle_error(err);
                break;
            }
            Err(err) => return Err(err),
        }

        // Deadlock avoidance: drain before the server's send buffer (and our
        // receive buffer) can fill up while we are still writing.
        if estimated_receive_bytes > MAX_BUFFERED_RECV_BYTES && index + 1 < queries.len() {
            let stream = inner.stream_mut()?;
            stream.send_bytes(&frontend::sync());
            stream.flush().await?;
            process::process_results(inner, session).await?;
            estimated_receive_bytes = 0;
        }
    }

    let stream = inner.stream_mut()?;
    stream.send_bytes(&frontend::flush());
    stream.send_bytes(&frontend::sync());
    stream.flush().await?;

    match process::process_results(inner, session).await? {
        ProcessEnd::ReadyForQuery | ProcessEnd::StreamingHandoff => Ok(()),
    }
}

async fn run_batch_simple(
    inner: &mut Inner,
    session: &mut ExecSession<'_>,
    queries: &[NativeQuery],
    params: &[ParameterList],
) -> Result<(), Error> {
    for (index, query) in queries.iter().enumerate() {
        if session.saw_error {
            break;
        }
        if !params[index].is_empty() {
            session.saw_error = true;
            session.handler.handle_error(Error::NotSupported(
                "bound parameters on the simple query path".into(),
            ));
            break;
        }
        if query.command == SqlCommandType::Set {
            inner.observe_search_path(&query.sql);
        }

        session.pending.execute.push_back(ExecuteExpect {
            query: index,
            portal: None,
            cached_fields: None,
            simple: true,
        });
        let stream = inner.stream_mut()?;
        stream.send_bytes(&frontend::simple_query(&query.sql));
        stream.flush().await?;
        process::process_results(inner, session).await?;
    }
    Ok(())
}

/// Send the per-query extended-protocol message group. Returns the response
/// size estimate charged against the deadlock-avoidance budget.
async fn send_one_query(
    inner: &mut Inner,
    session: &mut ExecSession<'_>,
    index: usize,
    query: &NativeQuery,
    params: &ParameterList,
) -> Result<usize, Error> {
    let flags = session.flags;
    let oneshot = flags.contains(QueryFlags::ONESHOT) || !inner.options.enable_statement_cache;

    if query.command == SqlCommandType::Set {
        inner.observe_search_path(&query.sql);
    }

    // Borrow the server-side statement, or mint a fresh one. The key carries
    // the rewriter's escape mode and the requested RETURNING projection, so
    // same-text queries with different identities never share a plan.
    let key = StatementKey::for_query(query);
    let mut statement = if oneshot {
        PreparedStatement::new(key, String::new(), inner.cache.epoch())
    } else {
        match inner.cache.borrow(&key) {
            Some(statement) => statement,
            None => {
                let name = inner.next_statement_name();
                PreparedStatement::new(key, name, inner.cache.epoch())
            }
        }
    };

    let param_oids = params.oids();
    let need_parse = statement.needs_parse(inner.cache.epoch(), &param_oids);
    let describe_statement =
        flags.contains(QueryFlags::DESCRIBE_ONLY) || params.has_unresolved_types() && need_parse;
    let have_fields = statement.fields.is_some() && statement.portal_described;
    // A statement Describe already yields the row metadata in this round
    // trip; the portal Describe is only needed when neither source covers it.
    let describe_portal = !flags.contains(QueryFlags::DESCRIBE_ONLY)
        && !flags.contains(QueryFlags::NO_METADATA)
        && ((!have_fields && !describe_statement)
            || flags.contains(QueryFlags::FORCE_DESCRIBE_PORTAL));

    let portal_name = if flags.contains(QueryFlags::FORWARD_CURSOR) && !oneshot {
        Some(inner.next_portal_name())
    } else {
        None
    };

    // Effective row budget for Execute.
    let autocommit =
        flags.contains(QueryFlags::SUPPRESS_BEGIN) && inner.transaction == TransactionState::Idle;
    let streaming = session.streaming_query == Some(index);
    let row_limit: i32 = if flags.contains(QueryFlags::NO_RESULTS) {
        1
    } else if portal_name.is_none() || autocommit || streaming {
        session.max_rows as i32
    } else {
        session.fetch_size as i32
    };

    let cached_fields = statement.fields.clone();
    let statement_name = statement.name.clone();
    let mut estimate = NODATA_QUERY_RESPONSE_SIZE_BYTES;
    if let Some(fields) = &cached_fields {
        estimate += fields.iter().map(|f| f.max_value_size()).sum::<usize>();
    }

    if need_parse {
        statement.prepared = false;
        statement.param_oids = param_oids.clone();
        statement.fields = None;
        statement.portal_described = false;
    }

    let stream = inner.stream_mut()?;
    if need_parse {
        stream.send_bytes(&frontend::parse(
            &statement_name,
            query.sql.as_bytes(),
            &param_oids,
        ));
        session.pending.parse.push_back(index);
    }
    if describe_statement {
        stream.send_bytes(&frontend::describe_statement(&statement_name));
        session
            .pending
            .describe_statement
            .push_back(process::DescribeStatementExpect {
                query: index,
                got_params: false,
            });
    }

    if !flags.contains(QueryFlags::DESCRIBE_ONLY) {
        let portal = portal_name.as_deref().unwrap_or("");
        let bind = frontend::bind(
            portal,
            &statement_name,
            &params.formats(),
            &params.values(),
            &[FORMAT_TEXT],
        )?;
        stream.send_bytes(&bind);
        session.pending.bind.push_back(index);

        if describe_portal {
            stream.send_bytes(&frontend::describe_portal(portal));
            session.pending.describe_portal.push_back(index);
        }

        stream.send_bytes(&frontend::execute(portal, row_limit));
        session.pending.execute.push_back(ExecuteExpect {
            query: index,
            portal: portal_name,
            cached_fields: if describe_portal { None } else { cached_fields },
            simple: false,
        });
    }

    session.borrowed.push(BorrowedStatement {
        query: index,
        statement,
        cacheable: !oneshot,
    });
    Ok(estimate)
}

/// Pull the assignment out of a `SET search_path = ...` statement.
fn extract_search_path(sql: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    let position = lower.find("search_path")?;
    let rest = &sql[position + "search_path".len()..];
    let rest = rest.trim_start();
    let rest = rest
        .strip_prefix('=')
        .or_else(|| {
            let lower_rest = rest.to_ascii_lowercase();
            lower_rest
                .starts_with("to ")
                .then(|| &rest[3..])
        })
        .map(str::trim_start)?;
    let value = rest.trim_end().trim_end_matches(';').trim_end();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

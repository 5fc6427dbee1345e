//! Response processing for the extended-query and simple-query paths.
//!
//! One dispatch loop reads framed messages and drives handler callbacks,
//! pending-request accounting, transaction-state transitions, the statement
//! cache epoch, and the handoff to the streaming row reader.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Buf;
use log::{debug, warn};

use crate::errors::{Error, ServerError};
use crate::handler::{CommandStatus, ResultHandler, ResultRows};
use crate::messages::constants::*;
use crate::messages::{
    insert_oid, parse_error_fields, parse_notification, update_count, BytesMutReader,
};
use crate::query::{
    parse_data_row, parse_parameter_description, parse_row_description, FieldDescription,
    NativeQuery, Tuple,
};
use crate::rows::RowRingBuffer;
use crate::statements::PreparedStatement;
use crate::stream::FramedStream;

use super::reader::{self, ReaderConfig};
use super::{Inner, Portal, QueryFlags, TransactionState};

// ---------------------------------------------------------------------------
// Simple-query execution, shared with the connection factory
// ---------------------------------------------------------------------------

/// Result of one simple-path round trip.
#[derive(Debug, Default)]
pub(crate) struct SimpleOutcome {
    pub tags: Vec<String>,
    pub rows: Vec<Tuple>,
    pub fields: Vec<FieldDescription>,
    pub transaction_status: Option<u8>,
    pub parameter_updates: Vec<(String, String)>,
    pub notifications: Vec<crate::messages::Notification>,
    pub warnings: Vec<ServerError>,
    pub error: Option<Box<ServerError>>,
}

impl SimpleOutcome {
    pub fn last_tag(&self) -> Option<&str> {
        self.tags.last().map(|s| s.as_str())
    }

    pub fn first_value(&self) -> Option<&[u8]> {
        self.rows.first().and_then(|row| row.get(0)).map(|b| b.as_ref())
    }

    pub fn into_result(self) -> Result<SimpleOutcome, Error> {
        match self.error {
            Some(err) => Err(Error::from_server(*err)),
            None => Ok(self),
        }
    }
}

/// Run one query over the simple (`Q`) path and drain to ReadyForQuery.
/// Server errors are captured in the outcome, not returned, so the caller
/// still sees the trailing transaction status.
pub(crate) async fn simple_exec(
    stream: &mut FramedStream,
    sql: &str,
    include_detail: bool,
    server_protocol_version: i32,
) -> Result<SimpleOutcome, Error> {
    stream.send_bytes(&crate::messages::frontend::simple_query(sql));
    stream.flush().await?;
    drain_simple(stream, include_detail, server_protocol_version).await
}

/// Drain messages up to ReadyForQuery, collecting rows, tags and state.
pub(crate) async fn drain_simple(
    stream: &mut FramedStream,
    include_detail: bool,
    server_protocol_version: i32,
) -> Result<SimpleOutcome, Error> {
    let mut outcome = SimpleOutcome::default();
    loop {
        let (code, mut payload) = stream.read_message().await?;
        match code {
            BACKEND_ROW_DESCRIPTION => {
                // Multi-statement results interleave sub-results; later
                // descriptions replace earlier ones to avoid type mixups.
                outcome.fields =
                    parse_row_description(&mut payload, server_protocol_version)?;
            }
            BACKEND_DATA_ROW => {
                outcome.rows.push(parse_data_row(&mut payload)?);
            }
            BACKEND_COMMAND_COMPLETE => {
                if let Ok(tag) = payload.read_string() {
                    outcome.tags.push(tag);
                }
            }
            BACKEND_EMPTY_QUERY_RESPONSE => {}
            BACKEND_ERROR_RESPONSE => {
                let err = parse_error_fields(&mut payload, include_detail)?;
                if outcome.error.is_none() {
                    outcome.error = Some(Box::new(err));
                }
            }
            BACKEND_NOTICE_RESPONSE => {
                if let Ok(notice) = parse_error_fields(&mut payload, include_detail) {
                    outcome.warnings.push(notice);
                }
            }
            BACKEND_PARAMETER_STATUS => {
                let key = payload.read_string()?;
                let value = payload.read_string()?;
                outcome.parameter_updates.push((key, value));
            }
            BACKEND_NOTIFICATION_RESPONSE => {
                if let Ok(notification) = parse_notification(&mut payload) {
                    outcome.notifications.push(notification);
                }
            }
            BACKEND_READY_FOR_QUERY => {
                if payload.has_remaining() {
                    outcome.transaction_status = Some(payload.get_u8());
                }
                return Ok(outcome);
            }
            BACKEND_COPY_IN_RESPONSE | BACKEND_COPY_OUT_RESPONSE | BACKEND_COPY_BOTH_RESPONSE => {
                return Err(Error::WrongState(
                    "statement started a COPY outside a COPY operation".into(),
                ));
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected message '{}' on the simple query path",
                    other as char
                )));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pending-request accounting
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct DescribeStatementExpect {
    pub query: usize,
    /// Set once the ParameterDescription half has arrived.
    pub got_params: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ExecuteExpect {
    pub query: usize,
    pub portal: Option<String>,
    /// Field list from the statement cache when no Describe was sent.
    pub cached_fields: Option<Vec<FieldDescription>>,
    /// Simple-path statements complete many times before their ReadyForQuery.
    pub simple: bool,
}

/// FIFO queues of outstanding extended-protocol requests. At every Sync
/// completion all of them must be empty again.
#[derive(Debug, Default)]
pub(crate) struct PendingQueues {
    pub parse: VecDeque<usize>,
    pub bind: VecDeque<usize>,
    pub describe_statement: VecDeque<DescribeStatementExpect>,
    pub describe_portal: VecDeque<usize>,
    pub execute: VecDeque<ExecuteExpect>,
    pub closes: usize,
}

impl PendingQueues {
    pub fn is_empty(&self) -> bool {
        self.parse.is_empty()
            && self.bind.is_empty()
            && self.describe_statement.is_empty()
            && self.describe_portal.is_empty()
            && self.execute.is_empty()
            && self.closes == 0
    }

    pub fn clear(&mut self) {
        self.parse.clear();
        self.bind.clear();
        self.describe_statement.clear();
        self.describe_portal.clear();
        self.execute.clear();
        self.closes = 0;
    }
}

// ---------------------------------------------------------------------------
// Extended-query session state
// ---------------------------------------------------------------------------

/// Rows accumulated for the query currently producing output.
#[derive(Debug, Default)]
pub(crate) struct CurrentResult {
    pub fields: Option<Vec<FieldDescription>>,
    pub tuples: Vec<Tuple>,
    pub row_count: u64,
}

impl CurrentResult {
    fn reset(&mut self) {
        self.fields = None;
        self.tuples = Vec::new();
        self.row_count = 0;
    }
}

/// Statement borrowed from the cache for the duration of one execute call.
pub(crate) struct BorrowedStatement {
    pub query: usize,
    pub statement: PreparedStatement,
    /// Whether to return it to the cache afterwards.
    pub cacheable: bool,
}

/// Per-call state for one execute/batch invocation.
pub(crate) struct ExecSession<'a> {
    pub handler: &'a mut dyn ResultHandler,
    pub queries: &'a [NativeQuery],
    pub flags: QueryFlags,
    pub max_rows: u32,
    pub fetch_size: u32,
    pub pending: PendingQueues,
    pub borrowed: Vec<BorrowedStatement>,
    pub current: CurrentResult,
    /// Index of the single query eligible for streaming delivery.
    pub streaming_query: Option<usize>,
    pub handed_off: bool,
    /// Set after the first error; suppresses further Execute submission.
    pub saw_error: bool,
    /// The recorded error heals via re-parse (routes autosave recovery).
    pub error_heals: bool,
    pub autosave_taken: bool,
    /// Continuation fetches reuse the portal's original field list.
    pub portal_fields: Option<Vec<FieldDescription>>,
    pub initial_row_count: u64,
}

impl<'a> ExecSession<'a> {
    pub fn new(
        handler: &'a mut dyn ResultHandler,
        queries: &'a [NativeQuery],
        flags: QueryFlags,
        max_rows: u32,
        fetch_size: u32,
    ) -> ExecSession<'a> {
        ExecSession {
            handler,
            queries,
            flags,
            max_rows,
            fetch_size,
            pending: PendingQueues::default(),
            borrowed: Vec::new(),
            current: CurrentResult::default(),
            streaming_query: None,
            handed_off: false,
            saw_error: false,
            error_heals: false,
            autosave_taken: false,
            portal_fields: None,
            initial_row_count: 0,
        }
    }

    fn statement_mut(&mut self, query: usize) -> Option<&mut PreparedStatement> {
        self.borrowed
            .iter_mut()
            .find(|b| b.query == query)
            .map(|b| &mut b.statement)
    }
}

/// How a processing round ended.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProcessEnd {
    ReadyForQuery,
    /// The stream now belongs to a background reader; the executor returns
    /// to the caller while rows keep flowing into the ring buffer.
    StreamingHandoff,
}

// ---------------------------------------------------------------------------
// The dispatch loop
// ---------------------------------------------------------------------------

pub(crate) async fn process_results(
    inner: &mut Inner,
    session: &mut ExecSession<'_>,
) -> Result<ProcessEnd, Error> {
    loop {
        let stream = inner.stream.as_mut().ok_or(Error::ConnectionClosed)?;
        let (code, mut payload) = match stream.read_message().await {
            Ok(message) => message,
            Err(err) => {
                inner.abort_socket().await;
                return Err(err);
            }
        };

        match code {
            BACKEND_PARSE_COMPLETE => {
                if let Some(query) = session.pending.parse.pop_front() {
                    if let Some(statement) = session.statement_mut(query) {
                        statement.prepared = true;
                    }
                } else if !session.saw_error {
                    return Err(protocol_desync(inner, "ParseComplete").await);
                }
            }

            BACKEND_BIND_COMPLETE => {
                if session.pending.bind.pop_front().is_none() && !session.saw_error {
                    return Err(protocol_desync(inner, "BindComplete").await);
                }
            }

            BACKEND_CLOSE_COMPLETE => {
                if session.pending.closes > 0 {
                    session.pending.closes -= 1;
                } else if !session.saw_error {
                    return Err(protocol_desync(inner, "CloseComplete").await);
                }
            }

            BACKEND_PARAMETER_DESCRIPTION => {
                let oids = parse_parameter_description(&mut payload)?;
                match session.pending.describe_statement.front_mut() {
                    Some(expect) => {
                        expect.got_params = true;
                        let query = expect.query;
                        if let Some(statement) = session.statement_mut(query) {
                            statement.param_oids = oids;
                        }
                    }
                    None if session.saw_error => {}
                    None => return Err(protocol_desync(inner, "ParameterDescription").await),
                }
            }

            BACKEND_ROW_DESCRIPTION => {
                let version = inner.server_protocol_version;
                let fields = parse_row_description(&mut payload, version)?;
                let (query, from_statement_describe) = session.attribute_row_description()?;
                session.current.fields = Some(fields.clone());
                if let Some(query) = query {
                    if let Some(statement) = session.statement_mut(query) {
                        statement.fields = Some(fields.clone());
                        statement.portal_described = !from_statement_describe;
                    }
                    // Metadata-only calls deliver the field list right here.
                    if session.flags.contains(QueryFlags::DESCRIBE_ONLY) {
                        session.handler.handle_result_rows(ResultRows {
                            query_index: query,
                            fields: fields.clone(),
                            tuples: Some(Vec::new()),
                            queue: None,
                            portal: None,
                            row_count: 0,
                        });
                    }
                    // Streaming handoff waits for the portal description (or
                    // the first row): a statement Describe answers before the
                    // BindComplete, which must stay on this side of the seam.
                    if !from_statement_describe
                        && session.streaming_query == Some(query)
                        && !session.handed_off
                    {
                        return handoff(inner, session, query, fields, None).await;
                    }
                }
            }

            BACKEND_NO_DATA => {
                session.attribute_no_data()?;
            }

            BACKEND_DATA_ROW => {
                let tuple = parse_data_row(&mut payload)?;
                if let Some(limit) = inner.options.max_result_buffer {
                    if tuple.size_bytes() > limit {
                        session.saw_error = true;
                        session
                            .handler
                            .handle_error(Error::OutOfMemory(tuple.size_bytes()));
                        continue;
                    }
                }
                let query = session.pending.execute.front().map(|e| e.query);
                if session.current.fields.is_none() {
                    // No Describe was sent; the cache supplied the metadata.
                    session.current.fields = session
                        .pending
                        .execute
                        .front()
                        .and_then(|e| e.cached_fields.clone());
                }
                if let (Some(query), Some(streaming)) = (query, session.streaming_query) {
                    if query == streaming && !session.handed_off {
                        // Metadata was cached; the first row triggers handoff.
                        let fields = session
                            .current
                            .fields
                            .clone()
                            .unwrap_or_default();
                        return handoff(inner, session, query, fields, Some(tuple)).await;
                    }
                }
                if !session.flags.contains(QueryFlags::NO_RESULTS) {
                    session.current.tuples.push(tuple);
                }
                session.current.row_count += 1;
            }

            BACKEND_COMMAND_COMPLETE => {
                let tag = payload.read_string()?;
                inner.note_command_tag(&tag);
                session.finish_execute(inner, Some(tag), false)?;
            }

            BACKEND_PORTAL_SUSPENDED => {
                session.finish_execute(inner, None, true)?;
            }

            BACKEND_EMPTY_QUERY_RESPONSE => {
                session.finish_execute(inner, None, false)?;
            }

            BACKEND_ERROR_RESPONSE => {
                let err = parse_error_fields(&mut payload, inner.options.log_server_error_detail)?;
                warn!("{}: server error {err}", inner.identity);
                inner.transaction = TransactionState::Failed;
                inner.transaction_fail_cause = Some(Box::new(err.clone()));
                let err = Error::from_server(err);
                if err.heals_via_reparse() {
                    inner.cache.bump_epoch();
                    session.error_heals = true;
                }
                session.saw_error = true;
                session.current.reset();
                session.handler.handle_error(err);
                // The server discards pipelined work up to the Sync; the
                // queues no longer mirror reality.
                session.pending.clear();
            }

            BACKEND_NOTICE_RESPONSE => {
                if let Ok(notice) =
                    parse_error_fields(&mut payload, inner.options.log_server_error_detail)
                {
                    session.handler.handle_warning(notice);
                }
            }

            BACKEND_PARAMETER_STATUS => {
                let key = payload.read_string()?;
                let value = payload.read_string()?;
                inner.apply_parameter_status(&key, &value);
            }

            BACKEND_NOTIFICATION_RESPONSE => {
                if let Ok(notification) = parse_notification(&mut payload) {
                    inner.notifications.push_back(notification);
                }
            }

            BACKEND_READY_FOR_QUERY => {
                if !payload.has_remaining() {
                    return Err(Error::ProtocolViolation(
                        "ready-for-query carries no status".into(),
                    ));
                }
                inner.apply_transaction_status(payload.get_u8());
                // A simple-path statement retires its expectation only here:
                // one Q may have completed many semicolon-separated commands.
                if session.flags.contains(QueryFlags::EXECUTE_AS_SIMPLE) {
                    session.pending.execute.retain(|e| !e.simple);
                }
                if !session.pending.is_empty() {
                    if session.saw_error {
                        session.pending.clear();
                    } else {
                        return Err(protocol_desync(inner, "ReadyForQuery with outstanding requests")
                            .await);
                    }
                }
                return Ok(ProcessEnd::ReadyForQuery);
            }

            BACKEND_COPY_IN_RESPONSE | BACKEND_COPY_OUT_RESPONSE | BACKEND_COPY_BOTH_RESPONSE => {
                inner.abort_socket().await;
                return Err(Error::WrongState(
                    "statement started a COPY outside a COPY operation".into(),
                ));
            }

            BACKEND_COPY_DATA | BACKEND_COPY_DONE => {
                // Stray COPY traffic outside a COPY operation; skip it.
                debug!("Ignoring COPY message '{}' outside COPY mode", code as char);
            }

            other => {
                inner.abort_socket().await;
                return Err(Error::ProtocolViolation(format!(
                    "unexpected message '{}' in query response",
                    other as char
                )));
            }
        }
    }
}

async fn protocol_desync(inner: &mut Inner, what: &str) -> Error {
    inner.abort_socket().await;
    Error::ProtocolViolation(format!("{what} without a matching request"))
}

impl ExecSession<'_> {
    /// RowDescription answers the front Describe expectation: a statement
    /// Describe that already got its ParameterDescription half, else a portal
    /// Describe. The flag tells the caller which kind answered.
    fn attribute_row_description(&mut self) -> Result<(Option<usize>, bool), Error> {
        if let Some(front) = self.pending.describe_statement.front() {
            if front.got_params {
                let expect = self.pending.describe_statement.pop_front().unwrap();
                return Ok((Some(expect.query), true));
            }
        }
        if let Some(query) = self.pending.describe_portal.pop_front() {
            return Ok((Some(query), false));
        }
        if self.saw_error {
            return Ok((None, false));
        }
        // Simple-path sub-results carry their own row descriptions.
        if self.flags.contains(QueryFlags::EXECUTE_AS_SIMPLE) {
            return Ok((self.pending.execute.front().map(|e| e.query), false));
        }
        Err(Error::ProtocolViolation(
            "RowDescription without a matching Describe".into(),
        ))
    }

    fn attribute_no_data(&mut self) -> Result<(), Error> {
        if let Some(front) = self.pending.describe_statement.front() {
            if front.got_params {
                self.pending.describe_statement.pop_front();
                return Ok(());
            }
        }
        if self.pending.describe_portal.pop_front().is_some() || self.saw_error {
            return Ok(());
        }
        Err(Error::ProtocolViolation(
            "NoData without a matching Describe".into(),
        ))
    }

    /// Deliver the result of the front Execute expectation and reset the
    /// per-query accumulation. `suspended` keeps the portal alive.
    fn finish_execute(
        &mut self,
        inner: &mut Inner,
        tag: Option<String>,
        suspended: bool,
    ) -> Result<(), Error> {
        let simple = self.pending.execute.front().map(|e| e.simple).unwrap_or(false);
        let expect = if simple {
            // Stays queued until ReadyForQuery; sub-results keep arriving.
            self.pending.execute.front().cloned().unwrap()
        } else {
            match self.pending.execute.pop_front() {
                Some(expect) => expect,
                None if self.saw_error => return Ok(()),
                None => {
                    return Err(Error::ProtocolViolation(
                        "completion without a matching Execute".into(),
                    ))
                }
            }
        };

        let query = self.queries.get(expect.query);
        let no_results = self.flags.contains(QueryFlags::NO_RESULTS);
        let fields = self
            .current
            .fields
            .take()
            .or_else(|| expect.cached_fields.clone())
            .or_else(|| self.portal_fields.clone())
            .unwrap_or_default();
        let tuples = std::mem::take(&mut self.current.tuples);
        let row_count = self.current.row_count + self.initial_row_count;
        self.current.reset();

        let produced_rows = !fields.is_empty() || !tuples.is_empty();
        if produced_rows && !no_results {
            // Continuation fetches reuse the caller's existing portal handle.
            let portal = if suspended && !self.queries.is_empty() {
                expect.portal.as_ref().map(|name| {
                    Portal::new(name.clone(), fields.clone(), inner.portal_graveyard.clone())
                })
            } else {
                None
            };
            self.handler.handle_result_rows(ResultRows {
                query_index: expect.query,
                fields,
                tuples: Some(tuples),
                queue: None,
                portal,
                row_count,
            });
        }

        if let Some(tag) = tag {
            // A COMMIT answered with a ROLLBACK tag means the server rolled
            // the transaction back silently; surface the original cause.
            if tag == "ROLLBACK" {
                if let Some(query) = query {
                    if query.expects_commit_tag()
                        && inner.options.raise_exception_on_silent_rollback
                    {
                        let cause = inner.transaction_fail_cause.clone().unwrap_or_else(|| {
                            Box::new(ServerError::new(
                                "ERROR",
                                crate::errors::SQLSTATE_IN_FAILED_SQL_TRANSACTION,
                                "transaction was silently rolled back",
                            ))
                        });
                        self.saw_error = true;
                        self.handler
                            .handle_error(Error::InFailedSqlTransaction(cause));
                    }
                }
            }
            let update_count = update_count(&tag).unwrap_or(0);
            let insert_oid = insert_oid(&tag);
            self.handler.handle_command_status(CommandStatus {
                tag,
                update_count,
                insert_oid,
            });
        }
        Ok(())
    }
}

/// Hand the stream to a background reader and deliver the queue to the
/// handler. `first_row`, when present, was already read off the wire and
/// seeds the queue before the reader takes over.
async fn handoff(
    inner: &mut Inner,
    session: &mut ExecSession<'_>,
    query: usize,
    fields: Vec<FieldDescription>,
    first_row: Option<Tuple>,
) -> Result<ProcessEnd, Error> {
    let queue = Arc::new(match inner.options.fetch_ring_buffer_bytes {
        0 => RowRingBuffer::with_row_capacity(session.fetch_size.max(1) as usize),
        bytes => RowRingBuffer::with_byte_capacity(bytes as usize),
    });

    if let Some(tuple) = first_row {
        queue.put(tuple).await.ok();
    }

    session.handler.handle_result_rows(ResultRows {
        query_index: query,
        fields,
        tuples: None,
        queue: Some(queue.clone()),
        portal: None,
        row_count: 0,
    });

    let stream = inner.stream.take().ok_or(Error::ConnectionClosed)?;
    let config = ReaderConfig {
        include_detail: inner.options.log_server_error_detail,
        max_result_buffer: inner.options.max_result_buffer,
    };
    inner.reader = Some(reader::spawn(stream, queue, config));
    session.handed_off = true;
    session.pending.clear();
    debug!("{}: streaming reader spawned for query {query}", inner.identity);
    Ok(ProcessEnd::StreamingHandoff)
}

//! COPY sub-protocol: bulk transfer in, out, or both.
//!
//! `start_copy` runs the COPY statement and hands back an operation object
//! that holds the connection-scoped COPY lock. Every subsequent call asserts
//! that lock; ordinary queries are refused while it is held.

use bytes::{Buf, Bytes};
use log::{debug, warn};

use crate::errors::{Error, ServerError};
use crate::executor::{Connection, Inner};
use crate::messages::constants::*;
use crate::messages::{frontend, parse_error_fields, parse_notification, update_count, BytesMutReader};
use crate::stream::FramedStream;

/// Flush threshold for buffered CopyData frames.
const COPY_FLUSH_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    /// Client to server (`COPY ... FROM STDIN`).
    In,
    /// Server to client (`COPY ... TO STDOUT`).
    Out,
    /// Bidirectional, used by replication.
    Both,
}

/// An active COPY operation holding the connection's COPY lock.
pub struct CopyOperation {
    connection: Connection,
    id: u64,
    kind: CopyKind,
    /// Overall row format: 0 text, 1 binary.
    format: i8,
    column_formats: Vec<i16>,
    handled_rows: u64,
    finished: bool,
}

impl Connection {
    /// Execute a COPY statement and enter COPY mode.
    pub async fn start_copy(&self, sql: &str) -> Result<CopyOperation, Error> {
        let mut inner = self.inner.lock().await;
        inner.drain_reader().await?;
        if inner.closed {
            return Err(Error::ConnectionClosed);
        }
        if inner.copy_lock.is_some() {
            return Err(Error::WrongState(
                "another COPY operation is in progress".into(),
            ));
        }

        let include_detail = inner.options.log_server_error_detail;
        let stream = inner.stream_mut()?;
        stream.send_bytes(&frontend::simple_query(sql));
        stream.flush().await?;

        let (kind, format, column_formats) = loop {
            let (code, mut payload) = stream.read_message().await?;
            match code {
                BACKEND_COPY_IN_RESPONSE | BACKEND_COPY_OUT_RESPONSE
                | BACKEND_COPY_BOTH_RESPONSE => {
                    let kind = match code {
                        BACKEND_COPY_IN_RESPONSE => CopyKind::In,
                        BACKEND_COPY_OUT_RESPONSE => CopyKind::Out,
                        _ => CopyKind::Both,
                    };
                    if payload.remaining() < 3 {
                        return Err(Error::ProtocolViolation(
                            "copy response is truncated".into(),
                        ));
                    }
                    let format = payload.get_i8();
                    let count = payload.get_i16();
                    if count < 0 || payload.remaining() < count as usize * 2 {
                        return Err(Error::ProtocolViolation(
                            "copy response is truncated".into(),
                        ));
                    }
                    let column_formats = (0..count).map(|_| payload.get_i16()).collect();
                    break (kind, format, column_formats);
                }
                BACKEND_ERROR_RESPONSE => {
                    let err = parse_error_fields(&mut payload, include_detail)?;
                    // The error unit still ends with ReadyForQuery.
                    drain_to_ready(stream, include_detail).await?;
                    return Err(Error::from_server(err));
                }
                BACKEND_NOTICE_RESPONSE => {
                    if let Ok(notice) = parse_error_fields(&mut payload, include_detail) {
                        debug!("Notice while starting COPY: {notice}");
                    }
                }
                BACKEND_PARAMETER_STATUS | BACKEND_NOTIFICATION_RESPONSE => {}
                BACKEND_READY_FOR_QUERY => {
                    return Err(Error::WrongState(
                        "statement did not start a COPY operation".into(),
                    ));
                }
                BACKEND_COMMAND_COMPLETE | BACKEND_ROW_DESCRIPTION | BACKEND_DATA_ROW => {
                    // Not a COPY statement after all; fall through to the
                    // ReadyForQuery and refuse.
                }
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected message '{}' while starting COPY",
                        other as char
                    )));
                }
            }
        };

        inner.copy_counter += 1;
        let id = inner.copy_counter;
        inner.copy_lock = Some(id);
        debug!("{}: COPY {kind:?} started (lock {id})", inner.identity);

        Ok(CopyOperation {
            connection: self.clone(),
            id,
            kind,
            format,
            column_formats,
            handled_rows: 0,
            finished: false,
        })
    }
}

impl CopyOperation {
    pub fn kind(&self) -> CopyKind {
        self.kind
    }

    /// Overall row format reported by the server: 0 text, 1 binary.
    pub fn format(&self) -> i8 {
        self.format
    }

    pub fn column_formats(&self) -> &[i16] {
        &self.column_formats
    }

    /// Rows the server reported handled, parsed from the `COPY n` tag.
    pub fn handled_rows(&self) -> u64 {
        self.handled_rows
    }

    /// Send one chunk of COPY payload. Buffers and flushes in bulk.
    pub async fn write_to_copy(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.kind == CopyKind::Out {
            return Err(Error::WrongState("COPY OUT is read-only".into()));
        }
        let mut inner = self.connection.inner.lock().await;
        self.assert_lock(&inner)?;
        let stream = inner.stream_mut()?;
        stream.send_bytes(&frontend::copy_data(data));
        if stream.pending_send_bytes() >= COPY_FLUSH_BYTES {
            stream.flush().await?;
        }
        Ok(())
    }

    /// Push buffered COPY frames to the server.
    pub async fn flush_copy(&mut self) -> Result<(), Error> {
        let mut inner = self.connection.inner.lock().await;
        self.assert_lock(&inner)?;
        inner.stream_mut()?.flush().await
    }

    /// Receive the next chunk of a COPY OUT stream; `None` means done and the
    /// COPY lock has been released.
    pub async fn read_from_copy(&mut self) -> Result<Option<Bytes>, Error> {
        if self.kind == CopyKind::In {
            return Err(Error::WrongState("COPY IN is write-only".into()));
        }
        let mut inner = self.connection.inner.lock().await;
        self.assert_lock(&inner)?;
        let include_detail = inner.options.log_server_error_detail;

        let mut failure: Option<ServerError> = None;
        let result = loop {
            let stream = inner.stream_mut()?;
            let (code, mut payload) = stream.read_message().await?;
            match code {
                BACKEND_COPY_DATA => break Some(payload.freeze()),
                BACKEND_COPY_DONE => {}
                BACKEND_COMMAND_COMPLETE => {
                    if let Ok(tag) = payload.read_string() {
                        self.handled_rows = update_count(&tag).unwrap_or(0);
                    }
                }
                BACKEND_READY_FOR_QUERY => {
                    if payload.has_remaining() {
                        let status = payload.get_u8();
                        inner.apply_transaction_status(status);
                    }
                    break None;
                }
                BACKEND_ERROR_RESPONSE => {
                    if let Ok(err) = parse_error_fields(&mut payload, include_detail) {
                        failure.get_or_insert(err);
                    }
                }
                BACKEND_NOTICE_RESPONSE => {
                    if let Ok(notice) = parse_error_fields(&mut payload, include_detail) {
                        debug!("Notice during COPY OUT: {notice}");
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
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected message '{}' during COPY OUT",
                        other as char
                    )));
                }
            }
        };

        if result.is_none() {
            self.finished = true;
            inner.copy_lock = None;
            if let Some(err) = failure {
                return Err(Error::from_server(err));
            }
        }
        Ok(result)
    }

    /// Finish a COPY IN: send CopyDone, drain to ReadyForQuery, and return
    /// the handled-row count from the `COPY n` status.
    pub async fn end_copy(&mut self) -> Result<u64, Error> {
        match self.kind {
            CopyKind::In | CopyKind::Both => {
                let mut inner = self.connection.inner.lock().await;
                self.assert_lock(&inner)?;
                let include_detail = inner.options.log_server_error_detail;
                let stream = inner.stream_mut()?;
                stream.send_bytes(&frontend::copy_done());
                stream.flush().await?;

                let end = drain_to_ready(stream, include_detail).await?;
                if let Some(status) = end.transaction_status {
                    inner.apply_transaction_status(status);
                }
                self.finished = true;
                inner.copy_lock = None;
                if let Some(err) = end.error {
                    inner.transaction_fail_cause = Some(Box::new(err.clone()));
                    return Err(Error::from_server(err));
                }
                if let Some(tag) = end.tag {
                    self.handled_rows = update_count(&tag).unwrap_or(0);
                }
                Ok(self.handled_rows)
            }
            CopyKind::Out => {
                // Drain whatever the server still has.
                while self.read_from_copy().await?.is_some() {}
                Ok(self.handled_rows)
            }
        }
    }

    /// Abort the COPY. On a COPY IN this sends CopyFail; on a COPY OUT it
    /// routes through the ordinary query-cancel channel.
    pub async fn cancel_copy(&mut self) -> Result<(), Error> {
        match self.kind {
            CopyKind::In | CopyKind::Both => {
                let mut inner = self.connection.inner.lock().await;
                self.assert_lock(&inner)?;
                let include_detail = inner.options.log_server_error_detail;
                let stream = inner.stream_mut()?;
                stream.send_bytes(&frontend::copy_fail("COPY cancel requested"));
                stream.flush().await?;

                let end = drain_to_ready(stream, include_detail).await?;
                if let Some(status) = end.transaction_status {
                    inner.apply_transaction_status(status);
                }
                self.finished = true;
                inner.copy_lock = None;
                // The server acknowledges CopyFail with an error; that is the
                // expected outcome, not a failure of the cancel itself.
                if let Some(err) = end.error {
                    debug!("COPY cancelled: {err}");
                }
                Ok(())
            }
            CopyKind::Out => {
                self.connection.send_query_cancel().await?;
                while self.read_from_copy().await.map(|c| c.is_some()).unwrap_or(false) {}
                Ok(())
            }
        }
    }

    fn assert_lock(&self, inner: &Inner) -> Result<(), Error> {
        if inner.copy_lock != Some(self.id) {
            return Err(Error::WrongState(
                "the COPY lock is no longer held by this operation".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for CopyOperation {
    fn drop(&mut self) {
        if !self.finished {
            warn!("COPY operation dropped without end_copy or cancel_copy");
        }
    }
}

/// End state of a COPY drain.
struct CopyEnd {
    tag: Option<String>,
    error: Option<ServerError>,
    transaction_status: Option<u8>,
}

async fn drain_to_ready(
    stream: &mut FramedStream,
    include_detail: bool,
) -> Result<CopyEnd, Error> {
    let mut end = CopyEnd {
        tag: None,
        error: None,
        transaction_status: None,
    };
    loop {
        let (code, mut payload) = stream.read_message().await?;
        match code {
            BACKEND_COMMAND_COMPLETE => {
                if let Ok(tag) = payload.read_string() {
                    end.tag = Some(tag);
                }
            }
            BACKEND_ERROR_RESPONSE => {
                if let Ok(err) = parse_error_fields(&mut payload, include_detail) {
                    end.error.get_or_insert(err);
                }
            }
            BACKEND_READY_FOR_QUERY => {
                if payload.has_remaining() {
                    end.transaction_status = Some(payload.get_u8());
                }
                return Ok(end);
            }
            // Stray COPY frames, notices and parameter reports drain silently.
            BACKEND_COPY_DATA | BACKEND_COPY_DONE | BACKEND_NOTICE_RESPONSE
            | BACKEND_PARAMETER_STATUS | BACKEND_NOTIFICATION_RESPONSE => {}
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected message '{}' while finishing COPY",
                    other as char
                )));
            }
        }
    }
}

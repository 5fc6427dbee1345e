//! The background row reader.
//!
//! For a streaming result the executor moves the framed stream into a spawned
//! task that drains DataRow messages into the ring buffer while the caller
//! iterates. The task returns the stream (plus any connection-state changes
//! it observed) through its join handle; the executor reclaims both before
//! the next query ever touches the socket.

use std::sync::Arc;

use bytes::Buf;
use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::errors::{Error, ServerError};
use crate::messages::constants::*;
use crate::messages::{parse_error_fields, parse_notification, BytesMutReader, Notification};
use crate::query::parse_data_row;
use crate::rows::RowRingBuffer;
use crate::stream::FramedStream;

pub(crate) struct ReaderHandle {
    pub join: JoinHandle<ReaderDone>,
    pub queue: Arc<RowRingBuffer>,
}

/// Everything the reader observed while it owned the stream.
pub(crate) struct ReaderDone {
    pub stream: FramedStream,
    pub transaction_status: Option<u8>,
    pub command_tag: Option<String>,
    pub suspended: bool,
    pub row_count: u64,
    /// Server error that failed the result (already stored on the queue).
    pub server_error: Option<Box<ServerError>>,
    /// Fatal stream error; the connection is unusable afterwards.
    pub fatal: Option<Error>,
    pub notifications: Vec<Notification>,
    pub parameter_updates: Vec<(String, String)>,
    pub warnings: Vec<ServerError>,
}

#[derive(Default)]
struct Observed {
    transaction_status: Option<u8>,
    command_tag: Option<String>,
    suspended: bool,
    row_count: u64,
    server_error: Option<Box<ServerError>>,
    fatal: Option<Error>,
    notifications: Vec<Notification>,
    parameter_updates: Vec<(String, String)>,
    warnings: Vec<ServerError>,
}

pub(crate) struct ReaderConfig {
    pub include_detail: bool,
    pub max_result_buffer: Option<usize>,
}

pub(crate) fn spawn(
    stream: FramedStream,
    queue: Arc<RowRingBuffer>,
    config: ReaderConfig,
) -> ReaderHandle {
    let task_queue = queue.clone();
    let join = tokio::spawn(async move {
        let (mut stream, observed) = run(stream, &task_queue, config).await;
        // The sentinel always lands, even on the error paths, so a waiting
        // take() returns in bounded time.
        task_queue.add_end_of_rows();
        if observed.fatal.is_some() {
            stream.close().await;
        }
        ReaderDone {
            stream,
            transaction_status: observed.transaction_status,
            command_tag: observed.command_tag,
            suspended: observed.suspended,
            row_count: observed.row_count,
            server_error: observed.server_error,
            fatal: observed.fatal,
            notifications: observed.notifications,
            parameter_updates: observed.parameter_updates,
            warnings: observed.warnings,
        }
    });
    ReaderHandle { join, queue }
}

async fn run(
    mut stream: FramedStream,
    queue: &RowRingBuffer,
    config: ReaderConfig,
) -> (FramedStream, Observed) {
    let mut observed = Observed::default();

    loop {
        let (code, mut payload) = match stream.read_message().await {
            Ok(message) => message,
            Err(err) => {
                warn!("Row reader terminating on stream error: {err}");
                queue.set_handler_error(Error::ConnectionFailure(err.to_string()));
                observed.fatal = Some(err);
                break;
            }
        };

        match code {
            BACKEND_DATA_ROW => {
                let tuple = match parse_data_row(&mut payload) {
                    Ok(tuple) => tuple,
                    Err(err) => {
                        queue.set_handler_error(Error::ProtocolViolation(err.to_string()));
                        observed.fatal = Some(err);
                        break;
                    }
                };
                if let Some(limit) = config.max_result_buffer {
                    if tuple.size_bytes() > limit {
                        queue.set_handler_error(Error::OutOfMemory(tuple.size_bytes()));
                        queue.set_skip_rows();
                        continue;
                    }
                }
                observed.row_count += 1;
                // Backpressure: blocks while the buffer is full.
                if queue.put(tuple).await.is_err() {
                    break;
                }
            }

            BACKEND_COMMAND_COMPLETE => {
                observed.command_tag = payload.read_string().ok();
            }

            BACKEND_PORTAL_SUSPENDED => {
                observed.suspended = true;
            }

            BACKEND_EMPTY_QUERY_RESPONSE => {}

            BACKEND_CLOSE_COMPLETE => {
                // Answers to closes queued before this query; nothing to do.
            }

            BACKEND_PARSE_COMPLETE
            | BACKEND_BIND_COMPLETE
            | BACKEND_PARAMETER_DESCRIPTION
            | BACKEND_ROW_DESCRIPTION
            | BACKEND_NO_DATA => {
                // Late pipeline acknowledgements; the executor consumed their
                // expectations before handing the stream over.
                debug!("Row reader skipping pipeline message '{}'", code as char);
            }

            BACKEND_READY_FOR_QUERY => {
                if payload.has_remaining() {
                    observed.transaction_status = Some(payload.get_u8());
                }
                break;
            }

            BACKEND_ERROR_RESPONSE => {
                match parse_error_fields(&mut payload, config.include_detail) {
                    Ok(err) => {
                        debug!("Row reader received server error: {err}");
                        observed.server_error = Some(Box::new(err.clone()));
                        queue.set_handler_error(Error::from_server(err));
                    }
                    Err(err) => {
                        queue.set_handler_error(Error::ProtocolViolation(err.to_string()));
                        observed.fatal = Some(err);
                        break;
                    }
                }
                // Keep draining to ReadyForQuery; the Sync is already sent.
            }

            BACKEND_NOTICE_RESPONSE => {
                if let Ok(notice) = parse_error_fields(&mut payload, config.include_detail) {
                    observed.warnings.push(notice);
                }
            }

            BACKEND_PARAMETER_STATUS => {
                if let (Ok(key), Ok(value)) = (payload.read_string(), payload.read_string()) {
                    observed.parameter_updates.push((key, value));
                }
            }

            BACKEND_NOTIFICATION_RESPONSE => {
                if let Ok(notification) = parse_notification(&mut payload) {
                    observed.notifications.push(notification);
                }
            }

            other => {
                queue.set_handler_error(Error::ProtocolViolation(format!(
                    "unexpected message '{}' while streaming rows",
                    other as char
                )));
                observed.fatal = Some(Error::ProtocolViolation(format!(
                    "unexpected message '{}' while streaming rows",
                    other as char
                )));
                break;
            }
        }
    }

    (stream, observed)
}

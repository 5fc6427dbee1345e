//! The callback surface the statement layer registers with the executor.
//!
//! The executor pushes protocol events into a `ResultHandler`; the handler
//! owns presentation concerns (row buffering, error chaining, warnings).
//! `ResultCollector` is the reference implementation used by tests and by
//! callers that just want everything gathered.

use std::sync::Arc;

use crate::errors::{Error, ServerError};
use crate::executor::Portal;
use crate::query::{FieldDescription, Tuple};
use crate::rows::RowRingBuffer;

/// One delivered result-rows event. `tuples` is set for synchronous delivery,
/// `queue` for streaming delivery; never both. A suspended portal rides along
/// when the server still holds rows for a continuation fetch.
#[derive(Debug)]
pub struct ResultRows {
    pub query_index: usize,
    pub fields: Vec<FieldDescription>,
    pub tuples: Option<Vec<Tuple>>,
    pub queue: Option<Arc<RowRingBuffer>>,
    pub portal: Option<Portal>,
    pub row_count: u64,
}

/// Parsed command-completion status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    pub tag: String,
    pub update_count: u64,
    pub insert_oid: u32,
}

/// Event sink for one execute call (or one batch). Callbacks fire in
/// submission order; `handle_completion` runs last and surfaces the chained
/// error, if any.
pub trait ResultHandler: Send {
    fn handle_result_rows(&mut self, rows: ResultRows);

    fn handle_command_status(&mut self, status: CommandStatus);

    fn handle_warning(&mut self, _warning: ServerError) {}

    /// Record an error; implementations chain multiple errors in arrival order.
    fn handle_error(&mut self, error: Error);

    /// Raise the first chained error, if any. Called exactly once per execute.
    fn handle_completion(&mut self) -> Result<(), Error>;

    /// Streaming delivery is disabled when the consumer needs to scroll.
    fn wants_scrollable_result_set(&self) -> bool {
        false
    }

    /// Statement-state transitions around the wire exchange.
    fn statement_entering_query(&mut self) {}
    fn statement_leaving_query(&mut self) {}
}

/// Chains errors in arrival order: server errors link through their `next`
/// pointer, anything else keeps the first error and drops the rest on the
/// floor after logging.
#[derive(Debug, Default)]
pub struct ErrorChain {
    first: Option<Error>,
}

impl ErrorChain {
    pub fn push(&mut self, error: Error) {
        match (&mut self.first, error) {
            (slot @ None, error) => *slot = Some(error),
            (Some(Error::Server(chain)), Error::Server(next)) => chain.chain(*next),
            (Some(_), error) => {
                log::debug!("Suppressing follow-up error: {error}");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn take(&mut self) -> Option<Error> {
        self.first.take()
    }
}

/// Gathers every event of an execute call.
#[derive(Debug, Default)]
pub struct ResultCollector {
    pub row_sets: Vec<ResultRows>,
    pub statuses: Vec<CommandStatus>,
    pub warnings: Vec<ServerError>,
    pub errors: ErrorChain,
    pub in_query: bool,
}

impl ResultCollector {
    pub fn new() -> ResultCollector {
        ResultCollector::default()
    }

    /// The single synchronous row set of a one-query execute, if present.
    pub fn only_tuples(&self) -> Option<&[Tuple]> {
        match self.row_sets.as_slice() {
            [only] => only.tuples.as_deref(),
            _ => None,
        }
    }

    /// The streaming queue of a one-query execute, if present.
    pub fn only_queue(&self) -> Option<Arc<RowRingBuffer>> {
        match self.row_sets.as_slice() {
            [only] => only.queue.clone(),
            _ => None,
        }
    }
}

impl ResultHandler for ResultCollector {
    fn handle_result_rows(&mut self, rows: ResultRows) {
        self.row_sets.push(rows);
    }

    fn handle_command_status(&mut self, status: CommandStatus) {
        self.statuses.push(status);
    }

    fn handle_warning(&mut self, warning: ServerError) {
        self.warnings.push(warning);
    }

    fn handle_error(&mut self, error: Error) {
        self.errors.push(error);
    }

    fn handle_completion(&mut self) -> Result<(), Error> {
        match self.errors.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn statement_entering_query(&mut self) {
        self.in_query = true;
    }

    fn statement_leaving_query(&mut self) {
        self.in_query = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_links_server_errors_in_order() {
        let mut chain = ErrorChain::default();
        chain.push(Error::from_server(ServerError::new("ERROR", "42601", "first")));
        chain.push(Error::from_server(ServerError::new("ERROR", "42601", "second")));
        let err = chain.take().unwrap();
        let server = err.server_error().unwrap();
        assert_eq!(server.message, "first");
        assert_eq!(server.next.as_ref().unwrap().message, "second");
    }

    #[test]
    fn error_chain_keeps_first_non_server_error() {
        let mut chain = ErrorChain::default();
        chain.push(Error::BindSizeExceeded(0x4000_0000));
        chain.push(Error::from_server(ServerError::new("ERROR", "42601", "later")));
        assert!(matches!(chain.take(), Some(Error::BindSizeExceeded(_))));
    }

    #[test]
    fn collector_completion_raises_chained_error() {
        let mut collector = ResultCollector::new();
        collector.handle_error(Error::from_server(ServerError::new(
            "ERROR", "23505", "duplicate",
        )));
        assert!(collector.handle_completion().is_err());
        // Drained; a second completion reports success.
        assert!(collector.handle_completion().is_ok());
    }
}

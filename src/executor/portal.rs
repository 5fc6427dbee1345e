//! Server-side portals and the disposal graveyard.
//!
//! A portal handed to the caller stays open on the server until its result is
//! fully fetched. Dropping the handle does not talk to the server directly;
//! it records the name in the connection's graveyard, and the executor sends
//! the Close message in the preamble of its next operation.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::query::FieldDescription;

pub(crate) type Graveyard = Arc<Mutex<Vec<String>>>;

fn nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// `S_<n>-<nanos>`: unique per connection and across reconnects.
pub(crate) fn statement_name(counter: u64) -> String {
    format!("S_{counter}-{}", nanos_now())
}

/// `C_<n>-<nanos>`.
pub(crate) fn portal_name(counter: u64) -> String {
    format!("C_{counter}-{}", nanos_now())
}

/// A suspended server-side cursor the caller may continue fetching from.
#[derive(Debug)]
pub struct Portal {
    name: String,
    fields: Vec<FieldDescription>,
    graveyard: Graveyard,
    finished: bool,
}

impl Portal {
    pub(crate) fn new(
        name: String,
        fields: Vec<FieldDescription>,
        graveyard: Graveyard,
    ) -> Portal {
        Portal {
            name,
            fields,
            graveyard,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Row metadata captured when the portal first suspended.
    pub fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    /// Mark the portal completed. Its server side is destroyed by the
    /// CommandComplete of the final fetch, so drop must not queue a Close.
    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        if !self.finished {
            self.graveyard.lock().push(std::mem::take(&mut self.name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_counter_and_time() {
        let s = statement_name(7);
        assert!(s.starts_with("S_7-"));
        let p = portal_name(3);
        assert!(p.starts_with("C_3-"));
    }

    #[test]
    fn dropping_unfinished_portal_queues_close() {
        let graveyard: Graveyard = Arc::new(Mutex::new(Vec::new()));
        {
            let _portal = Portal::new("C_1-1".into(), Vec::new(), graveyard.clone());
        }
        assert_eq!(graveyard.lock().as_slice(), &["C_1-1".to_string()]);
    }

    #[test]
    fn finished_portal_does_not_queue_close() {
        let graveyard: Graveyard = Arc::new(Mutex::new(Vec::new()));
        {
            let mut portal = Portal::new("C_2-1".into(), Vec::new(), graveyard.clone());
            portal.mark_finished();
        }
        assert!(graveyard.lock().is_empty());
    }
}

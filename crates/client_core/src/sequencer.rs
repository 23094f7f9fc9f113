/// Token attached to an issued request. Only the most recently issued ticket of a
/// [`Sequencer`] may apply its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Last-request-wins bookkeeping for one kind of query.
#[derive(Debug, Default)]
pub struct Sequencer {
    latest: u64,
}

impl Sequencer {
    pub fn issue(&mut self) -> Ticket {
        self.latest += 1;
        Ticket(self.latest)
    }

    /// Marks every outstanding ticket stale without issuing a new request.
    pub fn invalidate(&mut self) {
        self.latest += 1;
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        ticket.0 == self.latest
    }
}

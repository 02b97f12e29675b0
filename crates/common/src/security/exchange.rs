use crate::address::Address;
use crate::stanza::IqType;
use crate::transport::RetryPolicy;

/// Where an outgoing exchange stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeState {
    Sending,
    AwaitingResponse,
    Resynchronizing,
    Retrying,
    Done,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Done | ExchangeState::Failed)
    }

    fn can_become(&self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        matches!(
            (self, next),
            (Sending, AwaitingResponse)
                | (Sending, Resynchronizing)
                | (Sending, Done)
                | (Sending, Failed)
                | (AwaitingResponse, Resynchronizing)
                | (AwaitingResponse, Done)
                | (AwaitingResponse, Failed)
                | (Resynchronizing, Retrying)
                | (Resynchronizing, Failed)
                | (Retrying, Sending)
        )
    }
}

/// State of one logical send, across its at most one resynchronization
#[derive(Debug, Clone)]
pub struct Exchange {
    state: ExchangeState,
    synchronized: bool,
    attempts: u32,
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            state: ExchangeState::Sending,
            synchronized: false,
            attempts: 1,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Whether the one allowed resynchronization has been used
    pub fn synchronized(&self) -> bool {
        self.synchronized
    }

    /// Number of send attempts so far, the first included
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn transition(&mut self, next: ExchangeState) -> bool {
        if !self.state.can_become(next) {
            tracing::debug!("exchange cannot move from {:?} to {:?}", self.state, next);
            return false;
        }
        self.state = next;
        true
    }

    pub fn awaiting_response(&mut self) -> bool {
        self.transition(ExchangeState::AwaitingResponse)
    }

    /// Enter resynchronization; refused once it has happened before
    pub fn resynchronize(&mut self) -> bool {
        if self.synchronized {
            return false;
        }
        if !self.transition(ExchangeState::Resynchronizing) {
            return false;
        }
        self.synchronized = true;
        true
    }

    /// Leave resynchronization and start the next attempt
    pub fn retry(&mut self) -> bool {
        if !self.transition(ExchangeState::Retrying) {
            return false;
        }
        self.attempts += 1;
        self.transition(ExchangeState::Sending)
    }

    pub fn done(&mut self) -> bool {
        self.transition(ExchangeState::Done)
    }

    pub fn fail(&mut self) -> bool {
        self.transition(ExchangeState::Failed)
    }
}

/// An outgoing request and its exchange
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: String,
    pub to: Address,
    pub kind: IqType,
    pub retry: RetryPolicy,
    pub exchange: Exchange,
}

impl PendingRequest {
    pub fn new(id: String, to: Address, kind: IqType, retry: RetryPolicy) -> Self {
        Self {
            id,
            to,
            kind,
            retry,
            exchange: Exchange::new(),
        }
    }

    /// Start the next attempt under a fresh correlation id
    pub fn retry_with(&mut self, id: String) -> bool {
        if !self.exchange.retry() {
            return false;
        }
        self.id = id;
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut exchange = Exchange::new();
        assert!(exchange.awaiting_response());
        assert!(exchange.done());
        assert!(exchange.state().is_terminal());
        assert_eq!(exchange.attempts(), 1);
    }

    #[test]
    fn test_resynchronize_only_once() {
        let mut exchange = Exchange::new();
        assert!(exchange.awaiting_response());
        assert!(exchange.resynchronize());
        assert!(exchange.retry());
        assert_eq!(exchange.state(), ExchangeState::Sending);
        assert_eq!(exchange.attempts(), 2);

        assert!(exchange.awaiting_response());
        assert!(!exchange.resynchronize());
        assert_eq!(exchange.state(), ExchangeState::AwaitingResponse);
        assert!(exchange.fail());
    }

    #[test]
    fn test_no_channel_resync_from_sending() {
        let mut exchange = Exchange::new();
        assert!(exchange.resynchronize());
        assert!(exchange.retry());
        assert!(!exchange.resynchronize());
        assert!(exchange.fail());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut exchange = Exchange::new();
        assert!(!exchange.retry());
        assert!(exchange.done());
        assert!(!exchange.fail());
        assert!(!exchange.awaiting_response());
        assert_eq!(exchange.state(), ExchangeState::Done);
    }

    #[test]
    fn test_pending_request_takes_new_id_on_retry() {
        let mut request = PendingRequest::new(
            "1".into(),
            "meter@example.org/a".parse().unwrap(),
            IqType::Get,
            RetryPolicy::default(),
        );
        assert!(!request.retry_with("2".into()));
        assert_eq!(request.id, "1");

        request.exchange.awaiting_response();
        request.exchange.resynchronize();
        assert!(request.retry_with("2".into()));
        assert_eq!(request.id, "2");
    }
}

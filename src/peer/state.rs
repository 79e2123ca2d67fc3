use std::fmt;

/// Negotiation state of one consultation session.
///
/// Sender:   Idle → AwaitingLocalMedia → OfferCreated → AwaitingAnswer → Connected
/// Receiver: Idle → AwaitingOffer → OfferReceived → AwaitingLocalMedia → AnswerCreated → Connected
///
/// Every state may move to `Terminated`, which is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    AwaitingLocalMedia,
    OfferCreated,
    AwaitingAnswer,
    AwaitingOffer,
    OfferReceived,
    AnswerCreated,
    Connected,
    Terminated,
}

/// Coarse status the call UI renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Connecting,
    Connected,
    Ended,
}

impl NegotiationState {
    pub fn can_transition_to(self, next: NegotiationState) -> bool {
        use NegotiationState::*;

        if self == Terminated {
            return false;
        }
        matches!(
            (self, next),
            (_, Terminated)
                | (Idle, AwaitingLocalMedia)
                | (Idle, AwaitingOffer)
                | (AwaitingLocalMedia, OfferCreated)
                | (OfferCreated, AwaitingAnswer)
                | (AwaitingAnswer, Connected)
                | (AwaitingOffer, OfferReceived)
                | (OfferReceived, AwaitingLocalMedia)
                | (AwaitingLocalMedia, AnswerCreated)
                | (AnswerCreated, Connected)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == NegotiationState::Terminated
    }

    pub fn call_status(self) -> CallStatus {
        match self {
            NegotiationState::Connected => CallStatus::Connected,
            NegotiationState::Terminated => CallStatus::Ended,
            _ => CallStatus::Connecting,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

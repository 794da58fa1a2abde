//! Transition legality for saga events.
//!
//! [`validate`] is the pure branch-level table; [`validate_event`] layers the
//! saga-level rules on top of it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{TxEvent, TxEventType};
use crate::state::{BranchState, SagaState};
use crate::transaction::GlobalTransaction;

/// What to do with an end/abort for a branch that was never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutOfOrderPolicy {
    /// Reject as out of order; the caller buffers and retries within a window.
    #[default]
    Strict,
    /// Accept and create the branch on the spot.
    Lenient,
}

impl std::str::FromStr for OutOfOrderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(format!("unknown out-of-order policy: {other}")),
        }
    }
}

/// Why an event was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum RejectReason {
    /// The branch this event refers to has not been started yet.
    #[error("out of order: branch has not started")]
    OutOfOrder,

    #[error("illegal transition: {event_type} in state {state}")]
    IllegalTransition {
        state: String,
        event_type: TxEventType,
    },

    #[error("saga is closed ({state})")]
    SagaClosed { state: SagaState },
}

impl RejectReason {
    fn illegal(state: impl std::fmt::Display, event_type: TxEventType) -> Self {
        RejectReason::IllegalTransition {
            state: state.to_string(),
            event_type,
        }
    }
}

/// Outcome of validating one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Already applied; acknowledge without changing anything.
    Duplicate,
    Reject(RejectReason),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Branch-level transition table.
///
/// `current` is the state of the branch named by the event, `None` if the
/// saga has never seen it. Saga-level events are always accepted here.
pub fn validate(current: Option<BranchState>, event: &TxEvent, policy: OutOfOrderPolicy) -> Verdict {
    use BranchState::*;

    let event_type = event.event_type;
    let unknown = || match policy {
        OutOfOrderPolicy::Lenient => Verdict::Accept,
        OutOfOrderPolicy::Strict => Verdict::Reject(RejectReason::OutOfOrder),
    };
    let illegal = |state: Option<BranchState>| {
        let state = state.map_or("UNKNOWN", |s| s.as_str());
        Verdict::Reject(RejectReason::illegal(state, event_type))
    };

    match (event_type, current) {
        (TxEventType::TxStarted, None) => Verdict::Accept,
        (TxEventType::TxStarted, Some(_)) => Verdict::Duplicate,

        (TxEventType::TxEnded, None) => unknown(),
        (TxEventType::TxEnded, Some(Started)) => Verdict::Accept,
        (TxEventType::TxEnded, Some(Committed | Compensated)) => Verdict::Duplicate,
        (TxEventType::TxEnded, Some(Failed)) => illegal(current),

        (TxEventType::TxAborted, None) => unknown(),
        (TxEventType::TxAborted, Some(Started)) => Verdict::Accept,
        (TxEventType::TxAborted, Some(Failed)) => Verdict::Duplicate,
        (TxEventType::TxAborted, Some(Committed | Compensated)) => illegal(current),

        (TxEventType::TxCompensated | TxEventType::TxCompensationFailed, Some(Committed)) => {
            Verdict::Accept
        }
        (TxEventType::TxCompensated | TxEventType::TxCompensationFailed, Some(Compensated)) => {
            Verdict::Duplicate
        }
        (TxEventType::TxCompensated | TxEventType::TxCompensationFailed, _) => illegal(current),

        _ => Verdict::Accept,
    }
}

/// Validates an event against the whole saga.
pub fn validate_event(
    tx: &GlobalTransaction,
    event: &TxEvent,
    policy: OutOfOrderPolicy,
) -> Verdict {
    let state = tx.state();
    let event_type = event.event_type;
    let illegal = || Verdict::Reject(RejectReason::illegal(state, event_type));
    let closed = || Verdict::Reject(RejectReason::SagaClosed { state });

    let verdict = match event_type {
        TxEventType::SagaStarted if tx.is_new() => Verdict::Accept,
        TxEventType::SagaStarted => Verdict::Duplicate,

        TxEventType::SagaEnded if tx.saga_ended() => Verdict::Duplicate,
        TxEventType::SagaEnded if state == SagaState::Started => Verdict::Accept,
        TxEventType::SagaEnded => illegal(),

        TxEventType::SagaAborted => match state {
            SagaState::Started => Verdict::Accept,
            SagaState::Committed => closed(),
            _ => Verdict::Duplicate,
        },

        TxEventType::SagaSuspended => match state {
            SagaState::Compensating => Verdict::Accept,
            SagaState::Suspended => Verdict::Duplicate,
            _ => illegal(),
        },

        TxEventType::SagaTerminated if tx.is_terminated() => Verdict::Duplicate,
        TxEventType::SagaTerminated if state == SagaState::Suspended => Verdict::Accept,
        TxEventType::SagaTerminated => illegal(),

        _ => validate_branch_event(tx, event, policy),
    };

    // Closed sagas acknowledge duplicates but make no further progress, and
    // nothing they are missing will ever arrive.
    match verdict {
        Verdict::Accept
            if state.is_closed()
                && !matches!(event_type, TxEventType::SagaTerminated) =>
        {
            closed()
        }
        Verdict::Reject(RejectReason::OutOfOrder) if state.is_closed() => closed(),
        other => other,
    }
}

fn validate_branch_event(
    tx: &GlobalTransaction,
    event: &TxEvent,
    policy: OutOfOrderPolicy,
) -> Verdict {
    let state = tx.state();
    let event_type = event.event_type;
    let branch = event.local_tx_id.as_ref().and_then(|id| tx.branch(id));
    let late = branch.is_some_and(|b| b.late_commit);

    if event_type.is_internal() && state != SagaState::Compensating {
        return match validate(branch.map(|b| b.state), event, policy) {
            Verdict::Duplicate => Verdict::Duplicate,
            _ if state.is_closed() => Verdict::Reject(RejectReason::SagaClosed { state }),
            _ => Verdict::Reject(RejectReason::illegal(state, event_type)),
        };
    }

    if let Some(branch) = branch
        && event_type == TxEventType::TxCompensationFailed
        && event.attempt.is_some_and(|attempt| attempt <= branch.retries)
    {
        return Verdict::Duplicate;
    }

    match event_type {
        // A late commit stays STARTED until compensated.
        TxEventType::TxEnded if late => Verdict::Duplicate,
        TxEventType::TxAborted if late => {
            Verdict::Reject(RejectReason::illegal("LATE_COMMIT", event_type))
        }
        TxEventType::TxCompensated | TxEventType::TxCompensationFailed if late => Verdict::Accept,
        _ => validate(branch.map(|b| b.state), event, policy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;

    const G: &str = "g-1";
    const STRICT: OutOfOrderPolicy = OutOfOrderPolicy::Strict;
    const LENIENT: OutOfOrderPolicy = OutOfOrderPolicy::Lenient;

    fn start(l: &str) -> TxEvent {
        TxEvent::tx_started(G, l, "svc", "undo").unwrap()
    }
    fn end(l: &str) -> TxEvent {
        TxEvent::tx_ended(G, l).unwrap()
    }
    fn abort(l: &str) -> TxEvent {
        TxEvent::tx_aborted(G, l, "boom").unwrap()
    }
    fn comp(l: &str) -> TxEvent {
        TxEvent::tx_compensated(G, l).unwrap()
    }

    fn fold(events: Vec<TxEvent>) -> GlobalTransaction {
        let mut tx = GlobalTransaction::default();
        tx.apply_events(events);
        tx
    }

    #[test]
    fn branch_table() {
        use BranchState::*;

        assert_eq!(validate(None, &start("l"), STRICT), Verdict::Accept);
        assert_eq!(validate(Some(Started), &start("l"), STRICT), Verdict::Duplicate);
        assert_eq!(validate(Some(Committed), &start("l"), STRICT), Verdict::Duplicate);

        assert_eq!(validate(Some(Started), &end("l"), STRICT), Verdict::Accept);
        assert_eq!(validate(Some(Committed), &end("l"), STRICT), Verdict::Duplicate);
        assert_eq!(validate(Some(Compensated), &end("l"), STRICT), Verdict::Duplicate);
        assert!(matches!(
            validate(Some(Failed), &end("l"), STRICT),
            Verdict::Reject(RejectReason::IllegalTransition { .. })
        ));

        assert_eq!(validate(Some(Started), &abort("l"), STRICT), Verdict::Accept);
        assert_eq!(validate(Some(Failed), &abort("l"), STRICT), Verdict::Duplicate);
        assert!(matches!(
            validate(Some(Committed), &abort("l"), STRICT),
            Verdict::Reject(RejectReason::IllegalTransition { .. })
        ));

        assert_eq!(validate(Some(Committed), &comp("l"), STRICT), Verdict::Accept);
        assert_eq!(validate(Some(Compensated), &comp("l"), STRICT), Verdict::Duplicate);
        assert!(!validate(Some(Failed), &comp("l"), STRICT).is_accept());
    }

    #[test]
    fn unknown_branch_depends_on_policy() {
        assert_eq!(
            validate(None, &end("l"), STRICT),
            Verdict::Reject(RejectReason::OutOfOrder)
        );
        assert_eq!(validate(None, &end("l"), LENIENT), Verdict::Accept);
        assert_eq!(
            validate(None, &abort("l"), STRICT),
            Verdict::Reject(RejectReason::OutOfOrder)
        );
        assert_eq!(validate(None, &abort("l"), LENIENT), Verdict::Accept);
    }

    #[test]
    fn saga_lifecycle_events() {
        let fresh = GlobalTransaction::default();
        let started = TxEvent::saga_started(G).unwrap();
        assert_eq!(validate_event(&fresh, &started, STRICT), Verdict::Accept);

        let tx = fold(vec![started.clone(), start("l1")]);
        assert_eq!(validate_event(&tx, &started, STRICT), Verdict::Duplicate);

        let ended = TxEvent::saga_ended(G).unwrap();
        assert_eq!(validate_event(&tx, &ended, STRICT), Verdict::Accept);
        let tx = fold(vec![start("l1"), ended.clone()]);
        assert_eq!(validate_event(&tx, &ended, STRICT), Verdict::Duplicate);
    }

    #[test]
    fn committed_saga_is_closed() {
        let tx = fold(vec![start("l1"), end("l1"), TxEvent::saga_ended(G).unwrap()]);
        assert_eq!(tx.state(), SagaState::Committed);

        assert_eq!(validate_event(&tx, &end("l1"), STRICT), Verdict::Duplicate);
        assert_eq!(
            validate_event(&tx, &start("l9"), STRICT),
            Verdict::Reject(RejectReason::SagaClosed {
                state: SagaState::Committed
            })
        );
        assert!(!validate_event(&tx, &TxEvent::saga_aborted(G, None).unwrap(), STRICT).is_accept());
    }

    #[test]
    fn compensation_events_only_while_compensating() {
        let tx = fold(vec![start("l1"), end("l1")]);
        assert!(matches!(
            validate_event(&tx, &comp("l1"), STRICT),
            Verdict::Reject(RejectReason::IllegalTransition { .. })
        ));
        let suspended = TxEvent::saga_suspended(G, "exhausted").unwrap();
        assert!(!validate_event(&tx, &suspended, STRICT).is_accept());

        let tx = fold(vec![start("l1"), end("l1"), start("l2"), abort("l2")]);
        assert_eq!(tx.state(), SagaState::Compensating);
        assert_eq!(validate_event(&tx, &comp("l1"), STRICT), Verdict::Accept);
        assert_eq!(validate_event(&tx, &suspended, STRICT), Verdict::Accept);
        assert_eq!(
            validate_event(&tx, &TxEvent::saga_aborted(G, None).unwrap(), STRICT),
            Verdict::Duplicate
        );
        assert!(matches!(
            validate_event(&tx, &TxEvent::saga_ended(G).unwrap(), STRICT),
            Verdict::Reject(RejectReason::IllegalTransition { .. })
        ));
    }

    #[test]
    fn stale_compensation_failure_is_duplicate() {
        let mut tx = fold(vec![start("l1"), end("l1"), start("l2"), abort("l2")]);
        let failed = TxEvent::tx_compensation_failed(G, "l1", 1, "503").unwrap();
        assert_eq!(validate_event(&tx, &failed, STRICT), Verdict::Accept);
        tx.apply(failed.clone());
        assert_eq!(validate_event(&tx, &failed, STRICT), Verdict::Duplicate);
    }

    #[test]
    fn late_commit_rules() {
        let tx = fold(vec![start("l1"), start("l2"), abort("l2"), end("l1")]);
        let l1 = common::LocalTxId::parse("l1").unwrap();
        assert!(tx.branch(&l1).unwrap().late_commit);

        assert_eq!(validate_event(&tx, &end("l1"), STRICT), Verdict::Duplicate);
        assert!(!validate_event(&tx, &abort("l1"), STRICT).is_accept());
        assert_eq!(validate_event(&tx, &comp("l1"), STRICT), Verdict::Accept);
    }

    #[test]
    fn terminate_only_from_suspended() {
        let tx = fold(vec![start("l1"), end("l1"), start("l2"), abort("l2")]);
        let terminate = TxEvent::saga_terminated(G).unwrap();
        assert!(!validate_event(&tx, &terminate, STRICT).is_accept());

        let mut tx = tx;
        tx.apply(TxEvent::saga_suspended(G, "exhausted").unwrap());
        assert_eq!(validate_event(&tx, &terminate, STRICT), Verdict::Accept);
        let suspended = Verdict::Reject(RejectReason::SagaClosed {
            state: SagaState::Suspended,
        });
        assert_eq!(validate_event(&tx, &end("l9"), LENIENT), suspended);
        assert_eq!(validate_event(&tx, &end("l9"), STRICT), suspended);
        assert_eq!(validate_event(&tx, &abort("l9"), STRICT), suspended);

        tx.apply(terminate.clone());
        assert_eq!(validate_event(&tx, &terminate, STRICT), Verdict::Duplicate);
    }

    #[test]
    fn every_accepted_event_is_duplicate_on_replay() {
        let script = vec![
            TxEvent::saga_started(G).unwrap(),
            start("l1"),
            end("l1"),
            start("l2"),
            end("l2"),
            start("l3"),
            abort("l3"),
            comp("l2"),
            comp("l1"),
        ];
        let mut tx = GlobalTransaction::default();
        for event in script {
            assert_eq!(validate_event(&tx, &event, STRICT), Verdict::Accept);
            tx.apply(event.clone());
            let before = tx.clone();
            let verdict = validate_event(&tx, &event, STRICT);
            assert_eq!(verdict, Verdict::Duplicate, "{}", event.event_type);
            assert_eq!(tx, before);
        }
        assert_eq!(tx.state(), SagaState::Compensated);
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!("Strict".parse::<OutOfOrderPolicy>().unwrap(), STRICT);
        assert_eq!("lenient".parse::<OutOfOrderPolicy>().unwrap(), LENIENT);
        assert!("eager".parse::<OutOfOrderPolicy>().is_err());
    }
}

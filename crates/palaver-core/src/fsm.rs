//! Table-driven finite-state-machine runtime.
//!
//! Both protocol layers drive their lifecycle through one of these:
//! named states, named events, and transitions registered up front.
//! Emitting an event with no transition from the current state is an
//! error and leaves the state untouched; that is how the layers reject
//! protocol-invalid packets without tearing anything down.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::Error;

/// Callback invoked after a transition commits: `(from, event, to)`.
pub type TransitionHook<S, E> = Box<dyn FnMut(S, E, S) + Send>;

struct Transition<S, E> {
    to: S,
    hook: Option<TransitionHook<S, E>>,
}

/// A state machine over `Copy` state and event enums.
pub struct StateMachine<S, E> {
    current: S,
    transitions: HashMap<(S, E), Transition<S, E>>,
    // transitions valid from every state, e.g. the terminal event
    from_any: HashMap<E, Transition<S, E>>,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + Hash + Debug,
    E: Copy + Eq + Hash + Debug,
{
    pub fn new(initial: S) -> Self {
        Self {
            current: initial,
            transitions: HashMap::new(),
            from_any: HashMap::new(),
        }
    }

    /// Register `(from, event) -> to`.
    pub fn transition(&mut self, from: S, event: E, to: S) -> &mut Self {
        self.transitions
            .insert((from, event), Transition { to, hook: None });
        self
    }

    /// Register `(from, event) -> to` with a hook run after the state
    /// changes.
    pub fn transition_with(
        &mut self,
        from: S,
        event: E,
        to: S,
        hook: TransitionHook<S, E>,
    ) -> &mut Self {
        self.transitions.insert(
            (from, event),
            Transition {
                to,
                hook: Some(hook),
            },
        );
        self
    }

    /// Register `event -> to` from every state. Explicit per-state
    /// transitions take precedence.
    pub fn transition_from_any(&mut self, event: E, to: S) -> &mut Self {
        self.from_any.insert(event, Transition { to, hook: None });
        self
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn in_state(&self, state: S) -> bool {
        self.current == state
    }

    /// True if `emit(event)` would succeed from the current state.
    pub fn can_emit(&self, event: E) -> bool {
        self.transitions.contains_key(&(self.current, event))
            || self.from_any.contains_key(&event)
    }

    /// Fire `event`. Returns the new state, or `InvalidTransition` (state
    /// unchanged) when no transition is registered.
    pub fn emit(&mut self, event: E) -> Result<S, Error> {
        let from = self.current;
        let transition = match self.transitions.get_mut(&(from, event)) {
            Some(t) => t,
            None => match self.from_any.get_mut(&event) {
                Some(t) => t,
                None => {
                    return Err(Error::InvalidTransition {
                        state: format!("{from:?}"),
                        event: format!("{event:?}"),
                    });
                }
            },
        };

        let to = transition.to;
        self.current = to;
        if let Some(hook) = transition.hook.as_mut() {
            hook(from, event, to);
        }
        Ok(to)
    }
}

impl<S: Debug, E> Debug for StateMachine<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum S {
        Idle,
        Busy,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum E {
        Start,
        Finish,
        Kill,
    }

    fn machine() -> StateMachine<S, E> {
        let mut fsm = StateMachine::new(S::Idle);
        fsm.transition(S::Idle, E::Start, S::Busy)
            .transition(S::Busy, E::Finish, S::Done)
            .transition_from_any(E::Kill, S::Done);
        fsm
    }

    #[test]
    fn walks_registered_transitions() {
        let mut fsm = machine();
        assert_eq!(fsm.emit(E::Start).unwrap(), S::Busy);
        assert_eq!(fsm.emit(E::Finish).unwrap(), S::Done);
    }

    #[test]
    fn rejects_undefined_event_without_moving() {
        let mut fsm = machine();
        let err = fsm.emit(E::Finish).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(fsm.in_state(S::Idle));
    }

    #[test]
    fn from_any_fires_from_every_state() {
        for warmup in [vec![], vec![E::Start], vec![E::Start, E::Finish]] {
            let mut fsm = machine();
            for e in warmup {
                fsm.emit(e).unwrap();
            }
            assert_eq!(fsm.emit(E::Kill).unwrap(), S::Done);
        }
    }

    #[test]
    fn hook_sees_from_event_to() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let mut fsm = StateMachine::new(S::Idle);
        fsm.transition_with(
            S::Idle,
            E::Start,
            S::Busy,
            Box::new(move |from, event, to| {
                assert_eq!(from, S::Idle);
                assert_eq!(event, E::Start);
                assert_eq!(to, S::Busy);
                hits2.fetch_add(1, Ordering::Relaxed);
            }),
        );
        fsm.emit(E::Start).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn can_emit_matches_emit() {
        let mut fsm = machine();
        assert!(fsm.can_emit(E::Start));
        assert!(!fsm.can_emit(E::Finish));
        assert!(fsm.can_emit(E::Kill));
        fsm.emit(E::Start).unwrap();
        assert!(fsm.can_emit(E::Finish));
    }
}

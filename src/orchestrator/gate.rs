//! Per-repository execution gate.
//!
//! Callers take a numbered [`Ticket`] synchronously and are admitted
//! strictly in ticket order, one at a time. The scheduler takes tickets in
//! dequeue order, so waiting tasks run in queue order rather than in
//! whatever order the runtime happens to wake them.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug)]
struct GateState {
    next_ticket: u64,
    serving: u64,
    /// Tickets dropped before their turn came.
    abandoned: BTreeSet<u64>,
}

#[derive(Debug)]
pub struct RepoGate {
    state: Mutex<GateState>,
    serving: watch::Sender<u64>,
}

impl RepoGate {
    pub fn new() -> Arc<Self> {
        let (serving, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(GateState {
                next_ticket: 0,
                serving: 0,
                abandoned: BTreeSet::new(),
            }),
            serving,
        })
    }

    pub fn ticket(self: &Arc<Self>) -> Ticket {
        let mut state = self.state.lock().unwrap();
        let number = state.next_ticket;
        state.next_ticket += 1;
        Ticket {
            gate: self.clone(),
            number,
            admitted: false,
        }
    }

    /// True when nobody holds or waits for the gate.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.serving == state.next_ticket
    }

    fn advance(&self, state: &mut GateState) {
        state.serving += 1;
        while state.abandoned.remove(&state.serving) {
            state.serving += 1;
        }
        self.serving.send_replace(state.serving);
    }
}

/// A place in the gate's line. Dropping it gives the place up.
#[derive(Debug)]
pub struct Ticket {
    gate: Arc<RepoGate>,
    number: u64,
    admitted: bool,
}

impl Ticket {
    pub async fn acquire(mut self) -> GateGuard {
        let mut serving = self.gate.serving.subscribe();
        while *serving.borrow_and_update() != self.number {
            // The sender lives in the gate this ticket keeps alive
            if serving.changed().await.is_err() {
                break;
            }
        }
        self.admitted = true;
        GateGuard {
            gate: self.gate.clone(),
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let mut state = self.gate.state.lock().unwrap();
        if state.serving == self.number {
            self.gate.advance(&mut state);
        } else {
            state.abandoned.insert(self.number);
        }
    }
}

/// Exclusive access to a repository. Released on drop.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<RepoGate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock().unwrap();
        self.gate.advance(&mut state);
    }
}

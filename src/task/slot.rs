use std::any::Any;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Identifies one `start` of a slot. Tickets from the same slot increase strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

/// Why an action produced no value.
#[derive(Debug)]
pub enum SlotError<E> {
    Action(E),
    Panicked(String),
}

struct InFlight {
    ticket: Ticket,
    cancel: CancellationToken,
}

/// Holds at most one outstanding operation.
///
/// `start` aborts whatever is in flight before launching the new action on
/// the blocking pool. Aborting is cooperative: the action sees its
/// cancellation token fire but keeps its thread until it returns. What the
/// slot guarantees is that only the latest ticket passes [`TaskSlot::complete`],
/// so the owner can drop everything else.
pub struct TaskSlot {
    last_ticket: u64,
    in_flight: Option<InFlight>,
    limiter: Arc<Semaphore>,
}

impl TaskSlot {
    /// `limiter` is shared across slots to cap concurrent workers.
    pub fn new(limiter: Arc<Semaphore>) -> Self {
        Self {
            last_ticket: 0,
            in_flight: None,
            limiter,
        }
    }

    /// Launch `action` and hand its outcome to `deliver`, unless the slot has
    /// been aborted or restarted by then. Must be called inside a tokio runtime.
    pub fn start<T, E, F, D>(&mut self, action: F, deliver: D) -> Ticket
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, E> + Send + 'static,
        D: FnOnce(Ticket, Result<T, SlotError<E>>) + Send + 'static,
    {
        self.abort();
        self.last_ticket += 1;
        let ticket = Ticket(self.last_ticket);
        let cancel = CancellationToken::new();
        self.in_flight = Some(InFlight {
            ticket,
            cancel: cancel.clone(),
        });

        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            // Wait for a worker permit, giving up if superseded meanwhile.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                permit = limiter.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
            };

            let worker_cancel = cancel.clone();
            let outcome = match tokio::task::spawn_blocking(move || action(worker_cancel)).await {
                Ok(result) => result.map_err(SlotError::Action),
                Err(join_err) => Err(SlotError::Panicked(panic_message(join_err))),
            };
            drop(permit);

            if cancel.is_cancelled() {
                tracing::trace!(ticket = ticket.0, "dropping outcome of aborted task");
                return;
            }
            deliver(ticket, outcome);
        });

        ticket
    }

    /// Cancel the outstanding operation, if any. Idempotent.
    pub fn abort(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel.cancel();
        }
    }

    /// Accept a delivered outcome. True only for the ticket currently in
    /// flight, which is then cleared; stale or aborted tickets return false.
    pub fn complete(&mut self, ticket: Ticket) -> bool {
        match &self.in_flight {
            Some(in_flight) if in_flight.ticket == ticket => {
                self.in_flight = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.abort();
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

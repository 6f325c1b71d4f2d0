//! A cancellation token shared by many independent callers.
//!
//! When several callers wait on the same unit of work, the work should only be abandoned once
//! _every_ caller has lost interest. [Token] tracks the number of outstanding [Interest]s and fires
//! exactly once, when the last of them is canceled (or dropped). Once fired, a [Token] can no longer
//! be joined: callers that arrive late must start over with a fresh [Token].
//!
//! # Example
//!
//! ```rust
//! use commonware_block::cancel::Token;
//!
//! let (token, first) = Token::new();
//! let second = token.join().unwrap();
//!
//! // One caller leaving does not cancel the work
//! first.cancel();
//! assert!(!token.is_canceled());
//!
//! // The last caller leaving does
//! drop(second);
//! assert!(token.is_canceled());
//! assert!(token.join().is_none());
//! ```

use futures::channel::oneshot;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    interested: usize,
    canceled: bool,
    waiters: Vec<oneshot::Sender<()>>,
}

/// A reference-counted cancellation token.
#[derive(Clone)]
pub struct Token {
    state: Arc<Mutex<State>>,
}

impl Token {
    /// Create a new [Token] with a single [Interest].
    pub fn new() -> (Self, Interest) {
        let token = Self {
            state: Arc::new(Mutex::new(State {
                interested: 1,
                ..Default::default()
            })),
        };
        let interest = Interest {
            token: token.clone(),
        };
        (token, interest)
    }

    /// Register another [Interest] in the token.
    ///
    /// Returns `None` if every previous [Interest] was already canceled.
    pub fn join(&self) -> Option<Interest> {
        let mut state = self.state.lock().unwrap();
        if state.canceled {
            return None;
        }
        state.interested += 1;
        Some(Interest {
            token: self.clone(),
        })
    }

    /// Whether every [Interest] has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.state.lock().unwrap().canceled
    }

    /// Resolves once every [Interest] has been canceled.
    pub async fn canceled(&self) {
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if state.canceled {
                return;
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(sender);
            receiver
        };

        // The sender lives in our own state, so it can't be dropped while we wait
        let _ = receiver.await;
    }

    fn release(&self) {
        let waiters = {
            let mut state = self.state.lock().unwrap();
            state.interested -= 1;
            if state.interested > 0 || state.canceled {
                return;
            }
            state.canceled = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

/// A single caller's stake in a [Token].
///
/// Dropping an [Interest] is equivalent to calling [Interest::cancel].
pub struct Interest {
    token: Token,
}

impl Interest {
    /// Withdraw this caller's interest.
    pub fn cancel(self) {}
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.token.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner, Spawner};
    use futures::{channel::oneshot, FutureExt};

    #[test_traced]
    fn test_fires_when_all_cancel() {
        let (token, first) = Token::new();
        let second = token.join().unwrap();
        let third = token.join().unwrap();

        first.cancel();
        third.cancel();
        assert!(!token.is_canceled());
        assert!(token.canceled().now_or_never().is_none());

        drop(second);
        assert!(token.is_canceled());
        assert!(token.canceled().now_or_never().is_some());
    }

    #[test_traced]
    fn test_join_after_cancel() {
        let (token, interest) = Token::new();
        drop(interest);
        assert!(token.join().is_none());
        assert!(token.is_canceled());
    }

    #[test_traced]
    fn test_rejoin_keeps_alive() {
        let (token, first) = Token::new();
        let second = token.join().unwrap();
        drop(first);

        // Remaining interest can still bring new callers in
        let third = token.join().unwrap();
        drop(second);
        assert!(!token.is_canceled());
        drop(third);
        assert!(token.is_canceled());
    }

    #[test_traced]
    fn test_wakes_waiter() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (token, interest) = Token::new();
            let (sender, receiver) = oneshot::channel();
            context.spawn({
                let token = token.clone();
                move |_| async move {
                    token.canceled().await;
                    sender.send(()).unwrap();
                }
            });
            interest.cancel();
            receiver.await.unwrap();
        });
    }
}

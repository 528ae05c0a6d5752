//! Close-callback chain
//!
//! Callbacks are prepended, so the chain runs newest first. It runs
//! exactly once; a callback added after that is handed back to the caller
//! to run on the spot.

use parking_lot::Mutex;

use ringnet_core::{Error, Result};

use crate::connection::Connection;

/// Runs once when a connection is torn down
pub type CloseCallback = Box<dyn FnOnce(&Connection) -> Result<()> + Send>;

struct Node {
    callback: CloseCallback,
    prev: Option<Box<Node>>,
}

enum Chain {
    Pending(Option<Box<Node>>),
    Ran,
}

pub(crate) struct CallbackChain {
    chain: Mutex<Chain>,
}

impl CallbackChain {
    pub(crate) fn new() -> Self {
        CallbackChain {
            chain: Mutex::new(Chain::Pending(None)),
        }
    }

    /// Prepend `callback`; hands it back if the chain already ran
    pub(crate) fn push(&self, callback: CloseCallback) -> Option<CloseCallback> {
        let mut chain = self.chain.lock();
        match &mut *chain {
            Chain::Pending(head) => {
                let prev = head.take();
                *head = Some(Box::new(Node { callback, prev }));
                None
            }
            Chain::Ran => Some(callback),
        }
    }

    pub(crate) fn has_run(&self) -> bool {
        matches!(*self.chain.lock(), Chain::Ran)
    }

    /// Run every callback head to tail, once. Later calls return `Ok`.
    pub(crate) fn run(&self, conn: &Connection) -> Result<()> {
        let mut next = match std::mem::replace(&mut *self.chain.lock(), Chain::Ran) {
            Chain::Pending(head) => head,
            Chain::Ran => return Ok(()),
        };

        let mut errors = Vec::new();
        while let Some(node) = next {
            let Node { callback, prev } = *node;
            if let Err(e) = callback(conn) {
                errors.push(e);
            }
            next = prev;
        }

        match Error::join(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_runs_newest_first_once() {
        let chain = CallbackChain::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            assert!(chain
                .push(Box::new(move |_| {
                    order.lock().push(i);
                    Ok(())
                }))
                .is_none());
        }

        let conn = Connection::detached();
        chain.run(&conn).unwrap();
        chain.run(&conn).unwrap();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(chain.has_run());
    }

    #[test]
    fn test_errors_are_joined_and_all_run() {
        let chain = CallbackChain::new();
        let ran = Arc::new(Mutex::new(0));
        for fail in [true, false, true] {
            let ran = Arc::clone(&ran);
            chain.push(Box::new(move |_| {
                *ran.lock() += 1;
                if fail {
                    Err(Error::Handler("boom".into()))
                } else {
                    Ok(())
                }
            }));
        }

        let err = chain.run(&Connection::detached()).unwrap_err();
        assert_eq!(*ran.lock(), 3);
        assert_eq!(
            err,
            Error::Multiple(vec![Error::Handler("boom".into()), Error::Handler("boom".into())])
        );
    }

    #[test]
    fn test_late_callback_handed_back() {
        let chain = CallbackChain::new();
        chain.run(&Connection::detached()).unwrap();
        assert!(chain.push(Box::new(|_| Ok(()))).is_some());
    }
}

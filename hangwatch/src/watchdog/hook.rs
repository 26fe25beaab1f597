//! Dispatch hook surface for hosts.
//!
//! A host calls [`DispatchHook::before_dispatch`] right before running one
//! unit of work on its dispatch thread and [`DispatchHook::after_dispatch`]
//! right after. [`DispatchGuard`] pairs the two calls so the end is reported
//! even if the work unwinds.

use crate::domain::{DispatchId, HangId};

/// Handed out at dispatch start, handed back at dispatch end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchToken {
    pub id: DispatchId,
    /// Whether an analyzer was queued for this dispatch
    pub analyzed: bool,
}

pub trait DispatchHook: Send + Sync {
    fn before_dispatch(&self, descriptor: &str) -> DispatchToken;

    /// Returns the hang ID if the dispatch was reported as hung.
    fn after_dispatch(&self, token: DispatchToken) -> Option<HangId>;
}

/// Reports the end of a dispatch when dropped.
#[must_use = "the dispatch ends when the guard is dropped"]
pub struct DispatchGuard<'a> {
    hook: &'a dyn DispatchHook,
    token: DispatchToken,
}

impl<'a> DispatchGuard<'a> {
    pub fn new(hook: &'a dyn DispatchHook, descriptor: &str) -> Self {
        let token = hook.before_dispatch(descriptor);
        Self { hook, token }
    }

    pub fn token(&self) -> DispatchToken {
        self.token
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.hook.after_dispatch(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl DispatchHook for Recorder {
        fn before_dispatch(&self, descriptor: &str) -> DispatchToken {
            self.calls.lock().unwrap().push(format!("start {descriptor}"));
            DispatchToken { id: DispatchId(1), analyzed: true }
        }

        fn after_dispatch(&self, token: DispatchToken) -> Option<HangId> {
            self.calls.lock().unwrap().push(format!("end {}", token.id));
            None
        }
    }

    #[test]
    fn test_guard_pairs_calls() {
        let recorder = Recorder::default();
        {
            let guard = DispatchGuard::new(&recorder, "paint");
            assert!(guard.token().analyzed);
        }
        assert_eq!(*recorder.calls.lock().unwrap(), vec!["start paint", "end #1"]);
    }

    #[test]
    fn test_guard_ends_dispatch_on_unwind() {
        let recorder = Recorder::default();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = DispatchGuard::new(&recorder, "boom");
            panic!("handler failed");
        }));
        assert!(result.is_err());
        assert_eq!(recorder.calls.lock().unwrap().last().unwrap(), "end #1");
    }
}

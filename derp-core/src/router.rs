//! Action/notify registry.
//!
//! Dispatch by type string is modeled as a closed enumeration matched
//! directly in [`crate::engine::ExecEngine`] rather than a table of boxed
//! closures: the plugin set (`state-update`, `kill`, `ping`, …) is closed
//! for this crate. `Router` itself only tracks *which* types have a
//! registered action/notify, so `register_*` can reject duplicates and
//! `ExecEngine::forward` can decide whether to also invoke the action
//! locally on root.

use std::collections::HashSet;

use crate::error::DerpError;

#[derive(Default)]
pub struct Router {
    actions: HashSet<String>,
    notifies: HashSet<String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action(&mut self, type_: impl Into<String>) -> Result<(), DerpError> {
        let type_ = type_.into();
        if !self.actions.insert(type_.clone()) {
            return Err(DerpError::Exists(format!("action '{type_}' already registered")));
        }
        Ok(())
    }

    pub fn register_notify(&mut self, type_: impl Into<String>) -> Result<(), DerpError> {
        let type_ = type_.into();
        if !self.notifies.insert(type_.clone()) {
            return Err(DerpError::Exists(format!("notify '{type_}' already registered")));
        }
        Ok(())
    }

    pub fn has_action(&self, type_: &str) -> bool {
        self.actions.contains(type_)
    }

    pub fn has_notify(&self, type_: &str) -> bool {
        self.notifies.contains(type_)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_rejected() {
        let mut r = Router::new();
        r.register_action("kill").unwrap();
        assert!(matches!(
            r.register_action("kill").unwrap_err(),
            DerpError::Exists(_)
        ));
        r.register_notify("start").unwrap();
        assert!(matches!(
            r.register_notify("start").unwrap_err(),
            DerpError::Exists(_)
        ));
    }
}

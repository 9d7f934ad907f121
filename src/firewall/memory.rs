//! In-process firewall
//!
//! Keeps rules in a map with kernel-style monotonically increasing handles.
//! Used for dry runs and tests; failures can be injected per operation.

use super::{rule_expression, Firewall, RuleEntry};
use crate::mapping::Mapping;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Operation applied to the in-memory rule set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOp {
    Ensure,
    Add(String),
    Delete(u64),
}

#[derive(Debug, Default)]
struct State {
    rules: BTreeMap<u64, String>,
    next_handle: u64,
    operations: Vec<RuleOp>,
}

#[derive(Debug, Default)]
pub struct MemoryFirewall {
    state: Mutex<State>,
    fail_adds: AtomicBool,
    fail_removes: AtomicBool,
    hide_handles: AtomicBool,
}

impl MemoryFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent add fail
    pub fn set_fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent remove fail
    pub fn set_fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Install rules but report handle 0, as when the lookup after add fails
    pub fn set_hide_handles(&self, hide: bool) {
        self.hide_handles.store(hide, Ordering::SeqCst);
    }

    pub fn rule_count(&self) -> usize {
        self.lock().rules.len()
    }

    /// Installed rules in handle order
    pub fn rules(&self) -> Vec<RuleEntry> {
        self.lock()
            .rules
            .iter()
            .map(|(handle, expression)| RuleEntry {
                handle: *handle,
                expression: expression.clone(),
            })
            .collect()
    }

    /// Every successful operation so far
    pub fn operations(&self) -> Vec<RuleOp> {
        self.lock().operations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected(command: &str) -> Error {
        Error::Firewall {
            command: command.to_string(),
            message: "injected failure".to_string(),
        }
    }
}

impl Firewall for MemoryFirewall {
    async fn ensure_tables_and_chains(&self) -> Result<()> {
        self.lock().operations.push(RuleOp::Ensure);
        Ok(())
    }

    async fn add_mapping(&self, mut mapping: Mapping) -> Result<Mapping> {
        let expression = rule_expression(&mapping);
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(Self::injected(&format!("add rule {}", expression)));
        }

        let mut state = self.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.rules.insert(handle, expression.clone());
        state.operations.push(RuleOp::Add(expression));
        debug!("memory firewall: added rule handle {}", handle);

        if !self.hide_handles.load(Ordering::SeqCst) {
            mapping.rule_handle = handle;
        }
        Ok(mapping)
    }

    async fn remove_mapping(&self, mapping: &Mapping) -> Result<()> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(Self::injected(&format!(
                "delete rule {}",
                rule_expression(mapping)
            )));
        }

        let expression = rule_expression(mapping);
        let mut state = self.lock();
        let handle = if mapping.rule_handle != 0 {
            Some(mapping.rule_handle).filter(|h| state.rules.contains_key(h))
        } else {
            // Oldest first: a re-created tuple owns the newer rule
            state
                .rules
                .iter()
                .find(|(_, rule)| **rule == expression)
                .map(|(handle, _)| *handle)
        };

        let handle = handle.ok_or(Error::RuleNotFound { rule: expression })?;
        state.rules.remove(&handle);
        state.operations.push(RuleOp::Delete(handle));
        Ok(())
    }

    async fn list_rules(&self) -> Result<Vec<RuleEntry>> {
        Ok(self.rules())
    }

    async fn cleanup_all(&self) -> Result<usize> {
        let mut state = self.lock();
        let handles: Vec<u64> = state.rules.keys().copied().collect();
        state.rules.clear();
        state
            .operations
            .extend(handles.iter().map(|h| RuleOp::Delete(*h)));
        Ok(handles.len())
    }
}

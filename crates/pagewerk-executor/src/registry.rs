// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Executor lookup by operation kind.

use std::collections::HashMap;
use std::sync::Arc;

use pagewerk_bridge::CollaboratorBridge;
use pagewerk_core::error::{PagewerkError, Result};
use pagewerk_core::OperationKind;
use tracing::debug;

use crate::builtin::BuiltinExecutor;
use crate::content::{ExternalExecutor, OverlayExecutor};
use crate::executor::OperationExecutor;

/// Maps each operation kind to the executor that implements it.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<OperationKind, Arc<dyn OperationExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in kind, plus overlay and external work routed through
    /// `bridge`.
    pub fn with_builtins(bridge: Arc<dyn CollaboratorBridge>) -> Self {
        let mut registry = Self::new();
        for kind in BuiltinExecutor::KINDS {
            if let Some(exec) = BuiltinExecutor::new(kind) {
                registry.register(Arc::new(exec));
            }
        }
        registry.register(Arc::new(OverlayExecutor::new(bridge.clone())));
        registry.register(Arc::new(ExternalExecutor::new(bridge)));
        registry
    }

    /// Register `executor` under its own kind, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn OperationExecutor>) {
        let kind = executor.kind();
        if self.executors.insert(kind, executor).is_some() {
            debug!(%kind, "executor replaced");
        }
    }

    pub fn get(&self, kind: OperationKind) -> Result<Arc<dyn OperationExecutor>> {
        self.executors
            .get(&kind)
            .cloned()
            .ok_or_else(|| PagewerkError::PermanentOperation(format!("no executor registered for {kind}")))
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self.executors.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The host-function bridge. The exposed surface is an allow-list:
//! scripts can call exactly what was registered, nothing else. Arguments
//! and return values are JSON-safe values; host functions are passed by
//! reference into the sandbox context and never copied.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0}")]
    Failed(String),
    #[error("path {0:?} is outside the permitted roots")]
    PathDenied(String),
    #[error("host function {0:?} is not registered")]
    Unknown(String),
}

/// A host function: JSON-safe values in, JSON-safe value out. Must be
/// cheap or internally bounded; a blocking host function stalls the
/// isolate worker it runs on, nothing else.
pub type HostFn = Arc<dyn Fn(&[Value]) -> Result<Value, HostError> + Send + Sync>;

/// Registry of host functions installed into sandbox contexts.
#[derive(Clone, Default)]
pub struct HostRegistry {
    fns: HashMap<String, HostFn>,
}

impl HostRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host function. Re-registering a name replaces the
    /// previous entry; the allow-list is whatever the final set is when
    /// the runner starts executing.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, HostError> + Send + Sync + 'static,
    {
        self.fns.insert(name.to_string(), Arc::new(f));
    }

    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, HostError> {
        let Some(f) = self.fns.get(name) else {
            return Err(HostError::Unknown(name.to_string()));
        };
        f(args)
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.fns.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::{ConfigError, LbPolicyBuilder, pick_first, round_robin, weighted_target};
use crate::client::service_config::{LbConfig, ParsedJsonLbConfig};

/// A registry to store and retrieve LB policies.  LB policies are indexed by
/// their names.
///
/// There is no process-wide registry.  The channel owns one and hands it to
/// every policy through `LbPolicyOptions`, so parents can build children by
/// name and tests can register stubs without affecting each other.
#[derive(Default)]
pub struct LbPolicyRegistry {
    m: RwLock<HashMap<String, Arc<dyn LbPolicyBuilder>>>,
}

/// The result of resolving a `loadBalancingConfig`-style policy list.
#[derive(Clone)]
pub struct ParsedLbPolicy {
    pub builder: Arc<dyn LbPolicyBuilder>,
    pub config: Option<LbConfig>,
}

impl LbPolicyRegistry {
    /// Construct an empty LB policy registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a registry holding the policies implemented by this crate.
    pub fn with_default_policies() -> Arc<Self> {
        let registry = Self::new();
        registry.add_builder(pick_first::Builder::default());
        registry.add_builder(round_robin::Builder::default());
        registry.add_builder(weighted_target::Builder::default());
        Arc::new(registry)
    }

    /// Add a LB policy into the registry, replacing any policy of the same
    /// name.
    pub fn add_builder(&self, builder: impl LbPolicyBuilder + 'static) {
        self.m
            .write()
            .insert(builder.name().to_string(), Arc::new(builder));
    }

    /// Retrieve a LB policy from the registry, or None if not found.
    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.m.read().get(name).cloned()
    }

    /// Parses a policy list of the form `[{"name": {config}}, ...]`, selecting
    /// the first entry whose policy is registered, and parses its config.
    pub fn parse_lb_policy_list(
        &self,
        list: &Value,
    ) -> Result<ParsedLbPolicy, Box<dyn Error + Send + Sync>> {
        let Value::Array(entries) = list else {
            return Err(format!("policy list is not an array: {list}").into());
        };
        for entry in entries {
            let Value::Object(entry) = entry else {
                return Err(format!("policy list entry is not an object: {entry}").into());
            };
            if entry.len() != 1 {
                return Err(format!(
                    "policy list entry must contain exactly one policy, found {}",
                    entry.len()
                )
                .into());
            }
            let Some((name, config)) = entry.iter().next() else {
                continue;
            };
            let Some(builder) = self.get_policy(name) else {
                tracing::trace!(policy = %name, "skipping unregistered LB policy");
                continue;
            };
            let config = builder.parse_config(&ParsedJsonLbConfig::from_value(config.clone()), self)?;
            return Ok(ParsedLbPolicy { builder, config });
        }
        Err(ConfigError::NoSupportedPolicy(list.to_string()).into())
    }
}

//! Target resolution.
//!
//! A target reference from the `init` frame names where the session should
//! run. Local targets start a plain shell; targets with a host start a shell
//! that immediately connects over ssh.

use std::collections::HashMap;

use protocol::ConnectionParams;
use thiserror::Error;

use crate::config::{TargetConfig, TargetsConfig};

/// Name of the built-in local shell target.
pub const LOCAL_TARGET: &str = "local";

/// Errors from target resolution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("unknown target: {0}")]
    NotFound(String),
}

/// A target resolved to something a session can run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub target_ref: String,
    /// Shown to the client as `hostname`.
    pub display_name: String,
    /// Set for remote targets.
    pub connection: Option<ConnectionParams>,
}

impl ResolvedTarget {
    /// A target that runs a local shell.
    pub fn local(target_ref: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            target_ref: target_ref.into(),
            display_name: display_name.into(),
            connection: None,
        }
    }
}

/// Maps target references to targets.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, target_ref: &str) -> Result<ResolvedTarget, TargetError>;
}

/// Resolver backed by the `[targets]` config section.
#[derive(Debug, Default)]
pub struct StaticTargetResolver {
    targets: HashMap<String, ResolvedTarget>,
}

impl StaticTargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config. The `local` target is added unless disabled or
    /// redefined.
    pub fn from_config(config: &TargetsConfig) -> Self {
        let mut resolver = Self::new();
        if !config.disable_local {
            resolver.insert(ResolvedTarget::local(LOCAL_TARGET, local_display_name()));
        }
        for entry in &config.entries {
            resolver.insert(target_from_config(entry));
        }
        resolver
    }

    /// Add or replace a target.
    pub fn insert(&mut self, target: ResolvedTarget) {
        self.targets.insert(target.target_ref.clone(), target);
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl TargetResolver for StaticTargetResolver {
    fn resolve(&self, target_ref: &str) -> Result<ResolvedTarget, TargetError> {
        self.targets
            .get(target_ref)
            .cloned()
            .ok_or_else(|| TargetError::NotFound(target_ref.to_string()))
    }
}

fn target_from_config(entry: &TargetConfig) -> ResolvedTarget {
    let display_name = entry
        .display_name
        .clone()
        .or_else(|| entry.host.clone())
        .unwrap_or_else(|| entry.id.clone());

    let connection = entry.host.as_ref().map(|host| ConnectionParams {
        host: host.clone(),
        port: entry.port.unwrap_or(protocol::DEFAULT_SSH_PORT),
        username: entry.username.clone().unwrap_or_default(),
        key_path: entry
            .key_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
    });

    ResolvedTarget {
        target_ref: entry.id.clone(),
        display_name,
        connection,
    }
}

fn local_display_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

//! Boot parameter parsing.
//!
//! Extracts the remote target from `nbdroot=<host>:<port>` on the kernel
//! command line. Absent or malformed values are never fatal: the run becomes
//! a no-op and the boot framework's default root mount proceeds untouched.

use nbdroot_shared::errors::{NbdrootError, NbdrootResult};
use nbdroot_shared::{RemoteTarget, StateFile};
use std::path::Path;

use crate::outcome::Stage;
use crate::report::Diagnostics;

/// Kernel command line split into `name[=value]` parameters.
///
/// Double quotes group whitespace and are stripped, as the kernel does
/// (`nbdroot="10.0.0.5:10809"` and `"nbdroot=10.0.0.5:10809"` are equivalent).
#[derive(Debug, Clone, Default)]
pub struct KernelCmdline {
    params: Vec<(String, Option<String>)>,
}

impl KernelCmdline {
    /// Tokenize a raw command line.
    ///
    /// Fails on an unbalanced quote, in which case callers fall back to
    /// [`scan_raw`].
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut params = Vec::new();
        let mut token = String::new();
        let mut in_quote = false;
        let mut has_token = false;

        for c in raw.chars() {
            match c {
                '"' => {
                    in_quote = !in_quote;
                    has_token = true;
                }
                c if c.is_whitespace() && !in_quote => {
                    if has_token {
                        params.push(split_param(&token));
                        token.clear();
                        has_token = false;
                    }
                }
                c => {
                    token.push(c);
                    has_token = true;
                }
            }
        }

        if in_quote {
            return Err("unbalanced quote in kernel command line".to_string());
        }
        if has_token {
            params.push(split_param(&token));
        }

        Ok(Self { params })
    }

    /// Value of the last `name=value` occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .rev()
            .find(|(n, v)| n == name && v.is_some())
            .and_then(|(_, v)| v.as_deref())
    }

    /// Whether `name` appears at all, with or without a value.
    pub fn contains(&self, name: &str) -> bool {
        self.params.iter().any(|(n, _)| n == name)
    }
}

fn split_param(token: &str) -> (String, Option<String>) {
    match token.split_once('=') {
        Some((name, value)) => (name.to_string(), Some(value.to_string())),
        None => (token.to_string(), None),
    }
}

/// Whitespace-only scan for the last `name=value` token.
///
/// Used when the quote-aware tokenizer cannot make sense of the line.
pub fn scan_raw<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    raw.split_whitespace()
        .rev()
        .find_map(|token| token.strip_prefix(name)?.strip_prefix('='))
}

/// Finds the boot parameter and derives the [`RemoteTarget`].
pub struct BootParameterParser<'a> {
    param: &'a str,
    state: &'a StateFile,
}

impl<'a> BootParameterParser<'a> {
    pub fn new(param: &'a str, state: &'a StateFile) -> Self {
        Self { param, state }
    }

    /// Read the command line from `path`; an unreadable file counts as absent.
    pub fn read_cmdline(path: &Path, diag: &mut Diagnostics) -> Option<String> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Some(raw),
            Err(e) => {
                diag.warn(
                    Stage::Cmdline,
                    format!("Cannot read kernel command line {}: {}", path.display(), e),
                );
                None
            }
        }
    }

    /// Raw parameter value, via the tokenizer first and the raw scan second.
    ///
    /// A bare `nbdroot` flag without a value is malformed, not absent.
    pub fn lookup(&self, cmdline: &str) -> NbdrootResult<String> {
        let value = match KernelCmdline::parse(cmdline) {
            Ok(parsed) => match parsed.get(self.param) {
                Some(value) => Some(value.to_string()),
                None if parsed.contains(self.param) => {
                    return Err(NbdrootError::ParameterMalformed {
                        value: String::new(),
                        reason: "missing value".into(),
                    });
                }
                None => None,
            },
            Err(e) => {
                tracing::debug!("{}; scanning raw tokens instead", e);
                scan_raw(cmdline, self.param).map(str::to_string)
            }
        };
        value.ok_or(NbdrootError::ParameterAbsent)
    }

    /// Parse the target and persist the raw value for later stages.
    ///
    /// Returns `None` when the parameter is absent or malformed.
    pub fn parse(&self, cmdline: &str, diag: &mut Diagnostics) -> Option<RemoteTarget> {
        let raw = match self.lookup(cmdline) {
            Ok(raw) => raw,
            Err(e @ NbdrootError::ParameterAbsent) => {
                diag.info(Stage::Cmdline, format!("{}; leaving root mount untouched", e));
                return None;
            }
            Err(e) => {
                diag.warn(Stage::Cmdline, format!("{}; ignoring it", e));
                return None;
            }
        };

        let target = match RemoteTarget::parse(&raw) {
            Ok(target) => target,
            Err(e) => {
                diag.warn(Stage::Cmdline, format!("{}; ignoring it", e));
                return None;
            }
        };

        diag.info(
            Stage::Cmdline,
            format!(
                "target {} (host={}, port={})",
                target,
                target.host(),
                target.port()
            ),
        );

        if let Err(e) = self.state.write(&raw) {
            diag.warn(Stage::Cmdline, format!("{} (later stages may not see the target)", e));
        }

        Some(target)
    }

    /// Re-derive the target from the state file written by [`Self::parse`].
    pub fn from_state(&self, diag: &mut Diagnostics) -> Option<RemoteTarget> {
        let raw = match self.state.read() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                diag.info(
                    Stage::Cmdline,
                    format!(
                        "no target recorded in {}; leaving root mount untouched",
                        self.state.path().display()
                    ),
                );
                return None;
            }
            Err(e) => {
                diag.warn(Stage::Cmdline, e.to_string());
                return None;
            }
        };

        match RemoteTarget::parse(&raw) {
            Ok(target) => {
                diag.info(
                    Stage::Cmdline,
                    format!("target {} from {}", target, self.state.path().display()),
                );
                Some(target)
            }
            Err(e) => {
                diag.warn(Stage::Cmdline, format!("{}; ignoring it", e));
                None
            }
        }
    }
}

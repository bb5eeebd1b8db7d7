use std::collections::HashMap;

use crate::error::RoutingError;

const MAX_SUFFIX: u32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    Sink,
    Source,
}

/// Core-wide registry of unique device names.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: HashMap<String, (NameKind, u32)>,
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `requested`, returning the name actually taken. Without
    /// `fail_on_collision` an invalid name is sanitized and a taken name gets
    /// a numeric suffix.
    pub fn register(
        &mut self,
        requested: &str,
        kind: NameKind,
        index: u32,
        fail_on_collision: bool,
    ) -> Result<String, RoutingError> {
        if requested.is_empty() {
            return Err(RoutingError::Invalid("empty name"));
        }
        let base = if is_valid_name(requested) {
            requested.to_string()
        } else if fail_on_collision {
            return Err(RoutingError::Invalid("name contains invalid characters"));
        } else {
            sanitize(requested)
        };

        if !self.names.contains_key(&base) {
            self.names.insert(base.clone(), (kind, index));
            return Ok(base);
        }
        if fail_on_collision {
            return Err(RoutingError::Exists(base));
        }
        for suffix in 2..=MAX_SUFFIX {
            let candidate = format!("{base}.{suffix}");
            if !self.names.contains_key(&candidate) {
                self.names.insert(candidate.clone(), (kind, index));
                return Ok(candidate);
            }
        }
        Err(RoutingError::Exists(base))
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.names.remove(name).is_some()
    }

    pub fn lookup(&self, name: &str, kind: NameKind) -> Option<u32> {
        match self.names.get(name) {
            Some((registered, index)) if *registered == kind => Some(*index),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

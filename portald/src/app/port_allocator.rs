// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    port: u16,
    active: bool,
}

#[derive(Debug, Default)]
struct Registry {
    by_key: HashMap<String, Reservation>,
    cursor: usize,
}

/// Local port registry for tunnels.
///
/// A port is reserved while its tunnel is being established and becomes visible through
/// [`PortAllocator::port_for`] only once activated.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    registry: Mutex<Registry>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Reserves a port for `key`, keeping its current reservation unless it is in `skip`.
    pub fn reserve(&self, key: &str, skip: &[u16]) -> AppResult<u16> {
        let mut registry = self.lock();
        if let Some(existing) = registry.by_key.get(key) {
            if !skip.contains(&existing.port) {
                return Ok(existing.port);
            }
        }
        registry.by_key.remove(key);

        let ports: Vec<u16> = self.range.clone().collect();
        if ports.is_empty() {
            return Err(exhausted(&self.range));
        }
        let start = registry.cursor % ports.len();
        let taken: Vec<u16> = registry.by_key.values().map(|r| r.port).collect();
        let chosen = (0..ports.len())
            .map(|offset| (start + offset) % ports.len())
            .find(|idx| {
                let port = ports[*idx];
                !taken.contains(&port) && !skip.contains(&port)
            });
        let Some(idx) = chosen else {
            return Err(exhausted(&self.range));
        };
        registry.cursor = idx + 1;
        let port = ports[idx];
        registry.by_key.insert(
            key.to_string(),
            Reservation {
                port,
                active: false,
            },
        );
        Ok(port)
    }

    /// Returns false when `key` does not hold `port`.
    pub fn activate(&self, key: &str, port: u16) -> bool {
        let mut registry = self.lock();
        match registry.by_key.get_mut(key) {
            Some(reservation) if reservation.port == port => {
                reservation.active = true;
                true
            }
            _ => false,
        }
    }

    pub fn port_for(&self, key: &str) -> Option<u16> {
        self.lock()
            .by_key
            .get(key)
            .filter(|reservation| reservation.active)
            .map(|reservation| reservation.port)
    }

    pub fn release(&self, key: &str) -> Option<u16> {
        self.lock().by_key.remove(key).map(|reservation| reservation.port)
    }

    /// Releases `key` only if it still holds `port`.
    pub fn release_port(&self, key: &str, port: u16) -> bool {
        let mut registry = self.lock();
        match registry.by_key.get(key) {
            Some(reservation) if reservation.port == port => {
                registry.by_key.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().by_key.len()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn exhausted(range: &RangeInclusive<u16>) -> AppError {
    AppError::with_message(
        AppErrorKind::Conflict,
        codes::CONFLICT,
        format!(
            "no free local port in {}-{}",
            range.start(),
            range.end()
        ),
    )
}

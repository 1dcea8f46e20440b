// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod command_queue;
pub mod errors;
pub mod health_cache;
pub mod port_allocator;
pub mod ports;
pub mod scheduler;
pub mod services;
#[cfg(test)]
pub(crate) mod testing;
pub mod tunnels;
pub mod types;
pub mod usecases;

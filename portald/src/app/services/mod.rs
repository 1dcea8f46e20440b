// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod ides;
pub mod job_script;
pub mod random;
pub mod shell;
pub mod slurm;

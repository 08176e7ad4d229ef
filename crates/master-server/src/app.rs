// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application roles.
//!
//! One process runs one role: the master server (registration handling plus
//! both read paths), the updater (periodic liveness re-queries), or the
//! web API alone against a shared registry backend.

pub mod master;
pub mod updater;

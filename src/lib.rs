/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/lib.rs
*
* Library root of the ephemeral-cluster operator. The binary in `main.rs`
* only wires these modules together; everything it runs lives here so the
* reconcilers can be exercised against in-memory clients.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod clients;
pub mod cluster_router;
pub mod conditions;
pub mod config;
pub mod crds;
pub mod error;
pub mod metrics;

pub mod controllers {
    pub mod ephemeralcluster_controller;
    pub mod prowjob_controller;
    pub mod synthesizer;
    pub mod utils;
}

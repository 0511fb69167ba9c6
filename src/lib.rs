// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conductor: an agent orchestration runtime.
//!
//! The workspace splits into four crates, re-exported here as one surface:
//!
//! - [`model`] — the LLM client boundary: wire types, the [`model::LlmClient`]
//!   trait, and a scripted mock for tests.
//! - [`tools`] — tool definitions and providers, JSON-Schema argument
//!   validation with local `$ref` resolution, and the batch executor.
//! - [`store`] — the persisted data model (threads, messages, runs) behind
//!   storage traits, with in-memory defaults.
//! - [`core`] — the run loop, streaming response processor, context manager,
//!   interaction manager, and the delegate-to-specialist mechanism.
//!
//! A minimal end-to-end setup wires an [`core::InteractionManager`] with an
//! LLM client, storage, and a tool provider, then drives runs through
//! `process_input` and consumes the event stream it returns.

pub use conductor_core as core;
pub use conductor_model as model;
pub use conductor_store as store;
pub use conductor_tools as tools;

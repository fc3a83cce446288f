//! API endpoint integration tests
//!
//! Drives the composed router end to end: submission, status, listing,
//! cancellation and the SSE event stream, backed by mock stage executors.

#![allow(dead_code)]

mod common;
mod jobs;

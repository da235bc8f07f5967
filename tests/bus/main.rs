//! Event bus integration tests.

mod support;
mod dead_letter;
mod latency;
mod ordering;
mod redelivery;
mod scenario;

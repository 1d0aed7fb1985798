//! ResearchFlow CLI library: command implementations shared by the
//! `researchflow` binary and its integration tests.

pub mod commands;

//! chartwrap CLI - Helm chart and container image bundling.

pub mod commands;
pub mod output;

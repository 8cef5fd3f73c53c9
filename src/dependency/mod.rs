// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reverse dependencies between entity properties and index documents.
//!
//! [`DependencyGraphBuilder`] turns the read paths of every indexed type into
//! a [`ReindexingGraph`] at bootstrap; [`ReindexingResolver`] walks it at
//! runtime to find the documents a change invalidates.

pub mod builder;
pub mod graph;
pub mod resolver;

pub use builder::DependencyGraphBuilder;
pub use graph::{ReindexingEdge, ReindexingGraph};
pub use resolver::ReindexingResolver;

//! End-to-end tests of the build engine against real temporary trees.

mod dynamic;
mod incremental;
mod scheduler;

//! Test suite for the training core
//!
//! Component tests live next to their modules. The tests here exercise the
//! loss engine against real networks and drive the training loop through
//! whole ticks.

pub mod fixtures;
pub mod loss_tests;

pub use fixtures::{tiny_config, tiny_dataset, tiny_networks, LossFixture};

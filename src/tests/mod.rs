//! Cross-module tests and shared test doubles.

mod integration_test;

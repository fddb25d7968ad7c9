//! Integration tests module that includes all integration test files.

#[path = "integration/engine_tests.rs"]
mod engine_tests;

#[path = "integration/kernel_tests.rs"]
mod kernel_tests;

#[path = "integration/reader_tests.rs"]
mod reader_tests;

#[path = "integration/scaffold_tests.rs"]
mod scaffold_tests;

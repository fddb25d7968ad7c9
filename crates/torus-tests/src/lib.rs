//! Integration, property and scenario tests for torus live under `tests/`.

//! End-to-end test suite for Blockdex.
//!
//! The tests drive the real sync worker, mempool sync and query worker
//! against [`helpers::TestBackend`], an in-memory chain that tests extend,
//! reorganize and fill with pending transactions.

pub mod helpers;

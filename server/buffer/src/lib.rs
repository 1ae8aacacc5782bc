//! Shared byte-buffer pool for keel sessions.
//!
//! Sessions borrow their receive scratch buffer and accumulation buffer from
//! a [`BufferPool`] instead of allocating per read. The pool is safe for
//! concurrent borrow and return from unrelated sessions; a buffer is owned
//! exclusively by one session between `borrow` and `give_back`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pool;

pub use pool::{BufferPool, PooledBuf};

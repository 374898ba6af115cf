//! Process plumbing for the server binary.

mod shutdown;

pub use shutdown::ShutdownSignal;

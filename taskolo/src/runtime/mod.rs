// Public API
mod builder;
pub use builder::{Builder, Runtime, main};

mod spawn;
pub use spawn::{cancel, dump, shutdown, spawn, spawn_detached, spawn_thread};

// Exports
pub(crate) mod scheduler;

pub(crate) mod registry;

pub(crate) use builder::RuntimeConfig;

#[cfg(test)]
mod tests;

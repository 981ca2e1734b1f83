pub mod articles;
pub mod assets;
pub mod config;
pub mod content;
pub mod destination;
pub mod error;
pub mod hierarchy;
pub mod links;
pub mod logging;
pub mod mapping;
pub mod persist;
pub mod retry;
pub mod run;
pub mod runtime;
pub mod session;
pub mod source;

#[cfg(test)]
mod testing;

pub mod address;
pub mod app;
pub mod bastion;
pub mod cli;
pub mod credential;
pub mod error;
pub mod logging;
pub mod policy;
pub mod prompt;
pub mod session;
pub mod signal;

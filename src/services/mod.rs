pub mod accounts;
pub mod archive;
pub mod bootstrap;
pub mod engine;
pub mod error;
pub mod fsops;
pub mod permissions;
pub mod quota;
pub mod registry;
pub mod sandbox;
pub mod tickets;
pub mod transfer;
pub mod trash;

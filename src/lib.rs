//! soulsfetch - randomizer asset acquisition for the Souls games
//!
//! Fetches the mod loaders, randomizers and fixes each game needs from
//! Nexus Mods, plain HTTP links and file lockers, and lays them out so an
//! installer can pick them up.

pub mod archive;
pub mod auth;
pub mod catalog;
pub mod downloaders;
pub mod error;
pub mod orchestrator;
pub mod paths;
pub mod presence;
pub mod settings;

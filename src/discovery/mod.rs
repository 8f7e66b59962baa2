//! Discovery: harvest candidate servers from external producers.
//!
//! A producer is any executable file in the script directory. Its stdout
//! carries a sentinel-delimited block of import lines (see [`parser`]),
//! which the harvest cycle feeds into the server store one line at a
//! time.

pub mod harvest;
pub mod parser;
pub mod producer;

pub use harvest::{run_harvest, HarvestReport, ProducerReport};
pub use producer::{discover_producers, CommandProducerRunner, ProducerOutput, ProducerRunner};

pub mod blockers;
pub mod budget;
pub mod chat;
pub mod commitments;
pub mod config;
pub mod control;
pub mod gates;
pub mod ledger;
pub mod lifecycle;
pub mod llm;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod terminal;
pub mod tools;
pub mod worker;
pub mod workspace;

#[cfg(test)]
pub mod testing;

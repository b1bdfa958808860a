//! Membership & Discovery Module
//!
//! Tells the scheduler which nodes exist. The scheduling core only consumes the
//! resulting `MembershipEvent`s (joined / died / left); how they are produced is
//! up to the transport in use.
//!
//! ## Core Mechanisms
//! - **SWIM-like Protocol**: Nodes ping each other over UDP and piggyback their member lists on acks.
//! - **Failure Detection**: "Suspect" -> "Dead" transition driven by silence timeouts.
//! - **Incarnation Numbers**: A node refutes a false suspicion by bumping its incarnation.
//! - **Locations**: Every member carries a hierarchical cluster descriptor used for
//!   same-cluster detection and deterministic tie-breaking.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;

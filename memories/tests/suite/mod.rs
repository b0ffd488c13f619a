// Aggregates all former standalone integration tests as modules.
mod harness;
mod maintenance;
mod phase2_lease;
mod pipeline;

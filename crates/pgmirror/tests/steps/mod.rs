pub mod mirror_steps;
pub mod queue_steps;

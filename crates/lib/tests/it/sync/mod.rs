mod lifecycle;
mod push_pull;
mod queue;
mod timers;
mod validation;

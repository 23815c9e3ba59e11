mod breakpoints;
mod drop_to_frame;
mod invocation;
mod stepping;
mod suspend;
mod thread_state;
mod wire_session;

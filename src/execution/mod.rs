pub mod breakpoint;
pub mod debug;
pub mod listener;

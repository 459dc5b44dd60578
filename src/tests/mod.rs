mod common;

mod close;
mod cong;
mod timers;

pub mod app;
pub mod client;
pub mod conf;
pub mod construct;
pub mod dispatch;
pub mod notify;
pub mod synth;
pub mod template;

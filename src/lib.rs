pub mod client;
pub mod cmd;
pub mod config;
pub mod dict;
pub mod eventloop;
pub mod handler;
pub mod list;
pub mod net;
pub mod obj;
pub mod server;
pub mod util;

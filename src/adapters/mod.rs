pub mod http;
pub mod kv;
pub mod lifecycle;
pub mod network;
pub mod push;

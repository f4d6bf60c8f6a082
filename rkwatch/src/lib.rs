pub mod api;
pub mod cli;
pub mod cluster;
pub mod protocol;
pub mod servermetric;
pub mod storage;
pub mod watch;

pub mod batch;
pub mod clean;
pub mod decompile;
pub mod doctor;
pub mod init_config;
pub mod patch;
pub mod rebuild;

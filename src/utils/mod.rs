pub mod atomic_write;
pub mod data_dir;
pub mod hash;
pub mod identity;
pub mod sos;
pub mod time;

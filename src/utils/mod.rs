pub mod disk;
pub mod lock;
pub mod logger;
pub mod notify;
pub mod shutdown;

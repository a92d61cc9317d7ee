pub mod packet;
pub mod serial;

pub mod decoder;
pub mod packet;

pub use decoder::FrameDecoder;
pub use packet::{ParsedRequest, TcpFunction};

pub mod listen;
pub mod write;

pub use listen::{WatchStream, WatchStreamListener};
pub use write::{WriteStream, WriteStreamListener};

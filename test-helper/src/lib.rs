mod addr;
mod dir;

pub use addr::{get_unused_addr, get_unused_addrs};
pub use dir::TempDir;

mod keypair;

pub use keypair::{HostKey, HostKeyError};

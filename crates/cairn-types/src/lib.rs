pub mod digest;

pub use digest::{Digest, DIGEST_BASE_LEN, DIGEST_MAX_LEN, EMPTY_OBJECT};

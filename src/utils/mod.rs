//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

mod bitmap;
mod error;
mod safetcp;
mod timer;

pub use bitmap::Bitmap;
pub use error::BayouError;
pub use timer::Timer;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
};

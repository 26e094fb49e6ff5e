//! shoal-protocol: RESP wire protocol implementation.
//!
//! Provides single-pass parsing and direct-to-buffer serialization of
//! the RESP protocol used for client-server communication. Both
//! multibulk requests (`*2\r\n$3\r\nGET\r\n$1\r\nk\r\n`) and inline
//! requests (`GET k\r\n`) are accepted, since replicas and humans with
//! netcat both speak to the same port.
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use shoal_protocol::{Frame, parse_frame};
//!
//! let input = b"+OK\r\n";
//! let (frame, consumed) = parse_frame(input).unwrap().unwrap();
//! assert_eq!(frame, Frame::Simple("OK".into()));
//! assert_eq!(consumed, 5);
//!
//! let mut buf = BytesMut::new();
//! frame.serialize(&mut buf);
//! assert_eq!(&buf[..], b"+OK\r\n");
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::parse_frame;
pub use types::Frame;
